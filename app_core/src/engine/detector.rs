//! Field detection: element snapshots in, ordered descriptors out.
//!
//! The detector never scrolls and never mutates the DOM, with one spec'd
//! exception: lazy option extraction for custom dropdowns, which opens the
//! popup, reads it, and closes it with Escape. Option extraction is only
//! run for fields that survived to the AI pass.

use crate::browser::driver::{BrowserDriver, RawElement};
use crate::contracts::EngineResult;
use crate::data_models::field::{FieldDescriptor, FieldOption};
use crate::engine::classifier::classify;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Popup containers for custom/vendor dropdowns, in detection order.
pub const POPUP_CONTAINER_SELECTOR: &str =
    "[role='listbox'], .select__menu, .select2-results, .chosen-drop, .dropdown-menu";

/// Option rows inside an open popup.
pub const POPUP_OPTION_SELECTOR: &str =
    "[role='listbox'] [role='option'], .select__menu [role='option'], .select__option, \
     .select2-results li, .chosen-drop li, .dropdown-menu [role='option']";

const CAPTCHA_SELECTOR: &str =
    "iframe[src*='recaptcha'], iframe[src*='hcaptcha'], .g-recaptcha, .h-captcha, \
     [class*='cf-turnstile'], [data-sitekey]";

const POPUP_WAIT_MS: u64 = 2_000;

/// # NDOC
/// component: `engine::detector`
/// purpose: Enumerate visible interactive elements as `FieldDescriptor`s.
/// invariants:
///   - Every descriptor's `stable_id` is non-empty and page-unique.
///   - Scanning performs no DOM mutation.
pub struct FieldDetector {
    driver: Arc<dyn BrowserDriver>,
    settle_wait_ms: u64,
}

impl FieldDetector {
    pub fn new(driver: Arc<dyn BrowserDriver>, settle_wait_ms: u64) -> Self {
        Self {
            driver,
            settle_wait_ms,
        }
    }

    /// One detection pass over the current page.
    pub async fn scan(&self) -> EngineResult<Vec<FieldDescriptor>> {
        let raw_elements = self.driver.snapshot_form_elements().await?;
        Ok(build_descriptors(&raw_elements))
    }

    /// Open each custom dropdown that still needs options, read the popup,
    /// and close it again. Expensive; callers gate this on fields that
    /// survived the fast passes and are not already closed.
    pub async fn extract_options(&self, descriptors: &mut [FieldDescriptor]) -> EngineResult<()> {
        for descriptor in descriptors
            .iter_mut()
            .filter(|d| d.category.needs_option_extraction() && d.options.is_empty())
        {
            self.driver.click(&descriptor.selector).await?;
            let appeared = self
                .driver
                .wait_for_selector(POPUP_CONTAINER_SELECTOR, POPUP_WAIT_MS)
                .await?;
            if appeared {
                self.driver.wait_ms(self.settle_wait_ms).await;
                let options = self.driver.query_elements(POPUP_OPTION_SELECTOR).await?;
                descriptor.options = options
                    .into_iter()
                    .filter(|o| !o.own_text.trim().is_empty())
                    .map(|o| FieldOption {
                        text: normalize_whitespace(&o.own_text),
                        value: o.value,
                    })
                    .collect();
            } else {
                log::warn!(
                    stable_id = descriptor.stable_id.as_str();
                    "dropdown popup did not appear during option extraction"
                );
            }
            self.driver.press("body", "Escape").await?;
        }
        Ok(())
    }

    /// Deterministic fingerprint of this navigation: origin + path + the
    /// set of stable ids currently on the page.
    pub async fn page_fingerprint(&self) -> EngineResult<String> {
        let url = self.driver.current_url().await?;
        let descriptors = self.scan().await?;
        let mut hasher = Sha256::new();
        if let Ok(parsed) = url::Url::parse(&url) {
            hasher.update(parsed.origin().ascii_serialization());
            hasher.update(parsed.path());
        } else {
            hasher.update(&url);
        }
        for descriptor in &descriptors {
            hasher.update(&descriptor.stable_id);
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        Ok(hex_prefix(&digest, 16))
    }

    /// Captcha scan: live query first, static content parse as fallback.
    pub async fn detect_captcha(&self) -> EngineResult<bool> {
        let live = self.driver.query_elements(CAPTCHA_SELECTOR).await?;
        if !live.is_empty() {
            return Ok(true);
        }
        let content = self.driver.page_content().await?;
        Ok(content_has_captcha(&content))
    }
}

fn content_has_captcha(content: &str) -> bool {
    let document = Html::parse_document(content);
    for selector_text in [
        "iframe[src*='recaptcha']",
        "iframe[src*='hcaptcha']",
        ".g-recaptcha",
        ".h-captcha",
    ] {
        if let Ok(selector) = Selector::parse(selector_text) {
            if document.select(&selector).next().is_some() {
                return true;
            }
        }
    }
    false
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

pub(crate) fn normalize_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Label resolution order: label-for, aria-label, aria-labelledby, for
/// radio/checkbox the enclosing legend plus the element's own option text,
/// nearest preceding text block, placeholder, empty.
fn resolve_label(raw: &RawElement) -> String {
    let is_check = matches!(raw.input_type.as_str(), "checkbox" | "radio");
    let candidates: [&str; 3] = [&raw.label_for_text, &raw.aria_label, &raw.aria_labelledby_text];
    for candidate in candidates {
        let trimmed = normalize_whitespace(candidate);
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    if is_check && !raw.legend_text.trim().is_empty() {
        let legend = normalize_whitespace(&raw.legend_text);
        let own = normalize_whitespace(&raw.own_text);
        return if own.is_empty() {
            legend
        } else {
            format!("{legend} {own}")
        };
    }
    for candidate in [&raw.preceding_text, &raw.placeholder] {
        let trimmed = normalize_whitespace(candidate);
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    String::new()
}

/// Stable-id formation priority: id, name, aria-label, label, placeholder,
/// positional fallback.
fn base_stable_id(raw: &RawElement, label: &str, index: usize) -> String {
    if !raw.id.trim().is_empty() {
        return format!("id:{}", raw.id.trim());
    }
    if !raw.name.trim().is_empty() {
        return format!("name:{}", raw.name.trim());
    }
    if !raw.aria_label.trim().is_empty() {
        return format!("aria_label:{}", normalize_whitespace(&raw.aria_label));
    }
    if !label.is_empty() {
        return format!("label:{}:{}:{}", label, raw.tag, raw.input_type);
    }
    if !raw.placeholder.trim().is_empty() {
        return format!(
            "placeholder:{}:{}:{}",
            normalize_whitespace(&raw.placeholder),
            raw.tag,
            raw.input_type
        );
    }
    format!("index:{}:{}:{}", index, raw.tag, raw.input_type)
}

/// Detection applies the visibility rule, with one carve-out: a hidden
/// checkbox/radio rendered through sibling buttons is kept, since the
/// buttons are its visible surface.
fn is_detectable(raw: &RawElement) -> bool {
    if raw.visible {
        return true;
    }
    matches!(raw.input_type.as_str(), "checkbox" | "radio") && raw.sibling_buttons >= 2
}

pub(crate) fn build_descriptors(raw_elements: &[RawElement]) -> Vec<FieldDescriptor> {
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut descriptors = Vec::new();

    for (index, raw) in raw_elements.iter().filter(|r| is_detectable(r)).enumerate() {
        let label = resolve_label(raw);
        let mut stable_id = base_stable_id(raw, &label, index);
        let count = seen.entry(stable_id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            stable_id = format!("{stable_id}#{count}");
        }

        descriptors.push(FieldDescriptor {
            stable_id,
            selector: raw.selector.clone(),
            label,
            category: classify(raw),
            options: raw
                .options
                .iter()
                .filter(|o| !o.text.trim().is_empty())
                .map(|o| FieldOption {
                    text: normalize_whitespace(&o.text),
                    value: o.value.clone(),
                })
                .collect(),
            required: raw.required,
            filled: !raw.value.trim().is_empty() || raw.checked,
            placeholder: normalize_whitespace(&raw.placeholder),
            container_chrome: raw.container_chrome.clone(),
            input_type: raw.input_type.clone(),
            tag: raw.tag.clone(),
        });
    }
    descriptors
}
