//! The browser seam.
//!
//! Every DOM capability the engine needs is expressed on [`BrowserDriver`]
//! so the whole form engine runs against a scripted mock in tests and the
//! playwright adapter in production. Elements cross the seam as
//! [`RawElement`] snapshots; live references are re-resolved by CSS
//! selector, never held across passes.

use crate::contracts::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOption {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub value: String,
}

/// Snapshot of one DOM element at extraction time. Label candidates are
/// captured eagerly so label resolution is a pure function downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawElement {
    /// Unique CSS path computed at snapshot time.
    pub selector: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aria_label: String,
    #[serde(default)]
    pub aria_labelledby_text: String,
    #[serde(default)]
    pub label_for_text: String,
    #[serde(default)]
    pub legend_text: String,
    #[serde(default)]
    pub preceding_text: String,
    #[serde(default)]
    pub placeholder: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub aria_haspopup: String,
    /// Lowercased own + ancestor class and data-attribute markers.
    #[serde(default)]
    pub container_chrome: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub checked: bool,
    /// Populated for native selects only.
    #[serde(default)]
    pub options: Vec<RawOption>,
    /// Visible text of the element itself (buttons, options).
    #[serde(default)]
    pub own_text: String,
    /// Sibling button count over a hidden checkbox/radio in the same parent.
    #[serde(default)]
    pub sibling_buttons: u32,
}

/// # NDOC
/// component: `browser::driver`
/// purpose: Mockable seam over the automation driver.
/// invariants:
///   - Implementations never mutate the DOM outside the requested action.
///   - All waits are bounded by the given timeout.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> EngineResult<()>;
    async fn current_url(&self) -> EngineResult<String>;
    async fn page_content(&self) -> EngineResult<String>;

    /// Snapshot every candidate interactive element on the page, visible
    /// or not; the detector applies the visibility rule.
    async fn snapshot_form_elements(&self) -> EngineResult<Vec<RawElement>>;

    /// Snapshot elements matching an arbitrary selector (popup options,
    /// buttons, section containers).
    async fn query_elements(&self, selector: &str) -> EngineResult<Vec<RawElement>>;

    async fn click(&self, selector: &str) -> EngineResult<()>;
    /// Mouse click at the element's box center (overlay recovery).
    async fn click_at_center(&self, selector: &str) -> EngineResult<()>;
    /// Synthetic click event dispatch (last-resort overlay recovery).
    async fn dispatch_click(&self, selector: &str) -> EngineResult<()>;
    async fn scroll_into_view(&self, selector: &str) -> EngineResult<()>;

    /// Clear and set a text-like input's value.
    async fn fill(&self, selector: &str, value: &str) -> EngineResult<()>;
    /// Keystroke typing into the focused element (search inputs).
    async fn type_text(&self, selector: &str, text: &str) -> EngineResult<()>;
    async fn press(&self, selector: &str, key: &str) -> EngineResult<()>;

    async fn select_by_label(&self, selector: &str, label: &str) -> EngineResult<()>;
    async fn select_by_value(&self, selector: &str, value: &str) -> EngineResult<()>;
    async fn set_files(&self, selector: &str, path: &Path) -> EngineResult<()>;

    async fn read_value(&self, selector: &str) -> EngineResult<String>;
    /// Displayed label of a native select's current selection.
    async fn selected_label(&self, selector: &str) -> EngineResult<String>;
    async fn is_checked(&self, selector: &str) -> EngineResult<bool>;
    async fn set_checked(&self, selector: &str, checked: bool) -> EngineResult<()>;
    async fn get_attribute(&self, selector: &str, name: &str) -> EngineResult<Option<String>>;

    /// Wait until a selector matches; `Ok(false)` on timeout.
    async fn wait_for_selector(&self, selector: &str, timeout_ms: u64) -> EngineResult<bool>;
    /// Settle wait. Mocks may return immediately.
    async fn wait_ms(&self, ms: u64);

    /// Install a script evaluated on every new document (session guards).
    async fn inject_init_script(&self, source: &str) -> EngineResult<()>;

    async fn close(&self) -> EngineResult<()>;
}
