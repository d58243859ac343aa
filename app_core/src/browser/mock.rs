//! Scripted in-memory driver used by unit tests across the crate.
//!
//! Tests describe a page as a list of [`RawElement`] snapshots plus
//! click effects (popup reveals, URL changes, attribute flips). The mock
//! records every action so tests can assert on exact interaction order.

use crate::browser::driver::{BrowserDriver, RawElement, RawOption};
use crate::contracts::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

/// Effect applied when a selector is clicked.
#[derive(Debug, Clone)]
pub enum ClickEffect {
    /// Register extra elements under a query key (e.g. a popup's options).
    Reveal(String, Vec<RawElement>),
    /// Append elements to the form snapshot (e.g. an added section).
    AppendElements(Vec<RawElement>),
    SetUrl(String),
    SetAttr(String, String, String),
    SetValue(String, String),
    SetChecked(String, bool),
}

#[derive(Default)]
struct MockState {
    url: String,
    content: String,
    elements: Vec<RawElement>,
    queries: HashMap<String, Vec<RawElement>>,
    attrs: HashMap<(String, String), String>,
    selected_labels: HashMap<String, String>,
    uploaded: HashMap<String, String>,
    click_effects: HashMap<String, VecDeque<Vec<ClickEffect>>>,
    /// Query keys cleared when Escape is pressed.
    escape_clears: Vec<String>,
    fail_counts: HashMap<String, u32>,
    actions: Vec<String>,
}

pub struct MockDriver {
    state: Mutex<MockState>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                url: "https://jobs.example.com/apply/1".to_string(),
                content: "<html><body></body></html>".to_string(),
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn set_elements(&self, elements: Vec<RawElement>) {
        self.lock().elements = elements;
    }

    pub fn add_element(&self, element: RawElement) {
        self.lock().elements.push(element);
    }

    pub fn set_content(&self, content: &str) {
        self.lock().content = content.to_string();
    }

    pub fn set_url(&self, url: &str) {
        self.lock().url = url.to_string();
    }

    pub fn register_query(&self, selector: &str, elements: Vec<RawElement>) {
        self.lock().queries.insert(selector.to_string(), elements);
    }

    /// Queue a batch of effects for a selector. Each click consumes one
    /// batch, so repeated clicks can be scripted progressively. The last
    /// batch is retained for further clicks.
    pub fn on_click(&self, selector: &str, effects: Vec<ClickEffect>) {
        self.lock()
            .click_effects
            .entry(selector.to_string())
            .or_default()
            .push_back(effects);
    }

    pub fn clear_on_escape(&self, query_key: &str) {
        self.lock().escape_clears.push(query_key.to_string());
    }

    pub fn set_attr(&self, selector: &str, name: &str, value: &str) {
        self.lock()
            .attrs
            .insert((selector.to_string(), name.to_string()), value.to_string());
    }

    /// Make the next `n` occurrences of an op fail. Op keys look like
    /// `"click #submit"` or `"fill #email"`.
    pub fn fail_times(&self, op_key: &str, n: u32) {
        self.lock().fail_counts.insert(op_key.to_string(), n);
    }

    pub fn actions(&self) -> Vec<String> {
        self.lock().actions.clone()
    }

    pub fn element_value(&self, selector: &str) -> Option<String> {
        self.lock()
            .elements
            .iter()
            .find(|e| e.selector == selector)
            .map(|e| e.value.clone())
    }

    pub fn element_checked(&self, selector: &str) -> Option<bool> {
        self.lock()
            .elements
            .iter()
            .find(|e| e.selector == selector)
            .map(|e| e.checked)
    }

    pub fn uploaded_file(&self, selector: &str) -> Option<String> {
        self.lock().uploaded.get(selector).cloned()
    }

    fn take_failure(state: &mut MockState, op_key: &str) -> bool {
        if let Some(remaining) = state.fail_counts.get_mut(op_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn record(state: &mut MockState, action: String) {
        state.actions.push(action);
    }

    fn apply_click_effects(state: &mut MockState, selector: &str) {
        let effects = match state.click_effects.get_mut(selector) {
            Some(batches) if batches.len() > 1 => batches.pop_front().unwrap_or_default(),
            Some(batches) => batches.front().cloned().unwrap_or_default(),
            None => Vec::new(),
        };
        for effect in effects {
            match effect {
                ClickEffect::Reveal(key, elements) => {
                    state.queries.insert(key, elements);
                }
                ClickEffect::AppendElements(elements) => {
                    state.elements.extend(elements);
                }
                ClickEffect::SetUrl(url) => state.url = url,
                ClickEffect::SetAttr(sel, name, value) => {
                    state.attrs.insert((sel, name), value);
                }
                ClickEffect::SetValue(sel, value) => {
                    if let Some(el) = state.elements.iter_mut().find(|e| e.selector == sel) {
                        el.value = value;
                    }
                }
                ClickEffect::SetChecked(sel, checked) => {
                    if let Some(el) = state.elements.iter_mut().find(|e| e.selector == sel) {
                        el.checked = checked;
                    }
                }
            }
        }
    }

    fn do_click(&self, selector: &str, op: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("click {selector}")) {
            Self::record(&mut state, format!("{op}!fail {selector}"));
            return Err(EngineError::interaction(format!(
                "scripted click failure on {selector}"
            )));
        }
        Self::record(&mut state, format!("{op} {selector}"));

        // Native checkbox/radio toggling.
        let toggled = state
            .elements
            .iter()
            .position(|e| e.selector == selector && matches!(e.input_type.as_str(), "checkbox" | "radio"));
        if let Some(idx) = toggled {
            if state.elements[idx].input_type == "checkbox" {
                state.elements[idx].checked = !state.elements[idx].checked;
            } else {
                let group = state.elements[idx].name.clone();
                for el in state.elements.iter_mut() {
                    if el.input_type == "radio" && el.name == group {
                        el.checked = el.selector == selector;
                    }
                }
            }
        }

        Self::apply_click_effects(&mut state, selector);
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn navigate(&self, url: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("navigate {url}")) {
            return Err(EngineError::navigation(format!("scripted navigation failure: {url}")));
        }
        state.url = url.to_string();
        Self::record(&mut state, format!("navigate {url}"));
        Ok(())
    }

    async fn current_url(&self) -> EngineResult<String> {
        Ok(self.lock().url.clone())
    }

    async fn page_content(&self) -> EngineResult<String> {
        Ok(self.lock().content.clone())
    }

    async fn snapshot_form_elements(&self) -> EngineResult<Vec<RawElement>> {
        Ok(self.lock().elements.clone())
    }

    async fn query_elements(&self, selector: &str) -> EngineResult<Vec<RawElement>> {
        let state = self.lock();
        if let Some(found) = state.queries.get(selector) {
            return Ok(found.clone());
        }
        Ok(state
            .elements
            .iter()
            .filter(|e| e.selector == selector)
            .cloned()
            .collect())
    }

    async fn click(&self, selector: &str) -> EngineResult<()> {
        self.do_click(selector, "click")
    }

    async fn click_at_center(&self, selector: &str) -> EngineResult<()> {
        self.do_click(selector, "center_click")
    }

    async fn dispatch_click(&self, selector: &str) -> EngineResult<()> {
        self.do_click(selector, "dispatch_click")
    }

    async fn scroll_into_view(&self, selector: &str) -> EngineResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("scroll {selector}"));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("fill {selector}")) {
            Self::record(&mut state, format!("fill!fail {selector}"));
            return Err(EngineError::interaction(format!(
                "scripted fill failure on {selector}"
            )));
        }
        Self::record(&mut state, format!("fill {selector}={value}"));
        if let Some(el) = state.elements.iter_mut().find(|e| e.selector == selector) {
            el.value = value.to_string();
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("type {selector}")) {
            return Err(EngineError::interaction(format!(
                "scripted type failure on {selector}"
            )));
        }
        Self::record(&mut state, format!("type {selector}={text}"));
        if let Some(el) = state.elements.iter_mut().find(|e| e.selector == selector) {
            el.value.push_str(text);
        }
        Ok(())
    }

    async fn press(&self, selector: &str, key: &str) -> EngineResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, format!("press {selector} {key}"));
        if key.eq_ignore_ascii_case("escape") {
            let clears = state.escape_clears.clone();
            for key in clears {
                state.queries.remove(&key);
            }
        }
        Ok(())
    }

    async fn select_by_label(&self, selector: &str, label: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("select {selector}")) {
            return Err(EngineError::interaction(format!(
                "scripted select failure on {selector}"
            )));
        }
        let Some(el) = state.elements.iter_mut().find(|e| e.selector == selector) else {
            return Err(EngineError::interaction(format!("no element for {selector}")));
        };
        let Some(option) = el
            .options
            .iter()
            .find(|o| o.text.eq_ignore_ascii_case(label.trim()))
            .cloned()
        else {
            return Err(EngineError::interaction(format!(
                "no option labeled '{label}' in {selector}"
            )));
        };
        el.value = option.value.clone();
        state
            .selected_labels
            .insert(selector.to_string(), option.text.clone());
        Self::record(&mut state, format!("select {selector}={label}"));
        Ok(())
    }

    async fn select_by_value(&self, selector: &str, value: &str) -> EngineResult<()> {
        let mut state = self.lock();
        let Some(el) = state.elements.iter_mut().find(|e| e.selector == selector) else {
            return Err(EngineError::interaction(format!("no element for {selector}")));
        };
        let Some(option) = el.options.iter().find(|o| o.value == value).cloned() else {
            return Err(EngineError::interaction(format!(
                "no option valued '{value}' in {selector}"
            )));
        };
        el.value = option.value.clone();
        state
            .selected_labels
            .insert(selector.to_string(), option.text.clone());
        Self::record(&mut state, format!("select_value {selector}={value}"));
        Ok(())
    }

    async fn set_files(&self, selector: &str, path: &Path) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("upload {selector}")) {
            return Err(EngineError::interaction(format!(
                "scripted upload failure on {selector}"
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        state.uploaded.insert(selector.to_string(), name.clone());
        if let Some(el) = state.elements.iter_mut().find(|e| e.selector == selector) {
            el.value = name.clone();
        }
        Self::record(&mut state, format!("upload {selector}={name}"));
        Ok(())
    }

    async fn read_value(&self, selector: &str) -> EngineResult<String> {
        let state = self.lock();
        Ok(state
            .elements
            .iter()
            .find(|e| e.selector == selector)
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn selected_label(&self, selector: &str) -> EngineResult<String> {
        let state = self.lock();
        Ok(state.selected_labels.get(selector).cloned().unwrap_or_default())
    }

    async fn is_checked(&self, selector: &str) -> EngineResult<bool> {
        Ok(self.element_checked(selector).unwrap_or(false))
    }

    async fn set_checked(&self, selector: &str, checked: bool) -> EngineResult<()> {
        let mut state = self.lock();
        if Self::take_failure(&mut state, &format!("check {selector}")) {
            return Err(EngineError::interaction(format!(
                "scripted check failure on {selector}"
            )));
        }
        Self::record(&mut state, format!("check {selector}={checked}"));
        if let Some(el) = state.elements.iter_mut().find(|e| e.selector == selector) {
            el.checked = checked;
        }
        Ok(())
    }

    async fn get_attribute(&self, selector: &str, name: &str) -> EngineResult<Option<String>> {
        let state = self.lock();
        Ok(state
            .attrs
            .get(&(selector.to_string(), name.to_string()))
            .cloned())
    }

    async fn wait_for_selector(&self, selector: &str, _timeout_ms: u64) -> EngineResult<bool> {
        let state = self.lock();
        if state
            .queries
            .get(selector)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
        {
            return Ok(true);
        }
        Ok(state.elements.iter().any(|e| e.selector == selector))
    }

    async fn wait_ms(&self, _ms: u64) {}

    async fn inject_init_script(&self, _source: &str) -> EngineResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, "inject_init_script".to_string());
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        let mut state = self.lock();
        Self::record(&mut state, "close".to_string());
        Ok(())
    }
}

// --- element builders shared by engine tests ---

pub fn text_input(id: &str, label: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "input".to_string(),
        input_type: "text".to_string(),
        id: id.to_string(),
        name: id.to_string(),
        label_for_text: label.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn typed_input(id: &str, label: &str, input_type: &str) -> RawElement {
    RawElement {
        input_type: input_type.to_string(),
        ..text_input(id, label)
    }
}

pub fn textarea(id: &str, label: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "textarea".to_string(),
        id: id.to_string(),
        name: id.to_string(),
        label_for_text: label.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn native_select(id: &str, label: &str, options: &[&str]) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "select".to_string(),
        id: id.to_string(),
        name: id.to_string(),
        label_for_text: label.to_string(),
        visible: true,
        options: options
            .iter()
            .map(|o| RawOption {
                text: o.to_string(),
                value: o.to_lowercase().replace(' ', "_"),
            })
            .collect(),
        ..RawElement::default()
    }
}

pub fn checkbox(id: &str, label: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "input".to_string(),
        input_type: "checkbox".to_string(),
        id: id.to_string(),
        name: id.to_string(),
        label_for_text: label.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn radio(id: &str, name: &str, legend: &str, own_text: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "input".to_string(),
        input_type: "radio".to_string(),
        id: id.to_string(),
        name: name.to_string(),
        legend_text: legend.to_string(),
        own_text: own_text.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn file_input(id: &str, label: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "input".to_string(),
        input_type: "file".to_string(),
        id: id.to_string(),
        name: id.to_string(),
        label_for_text: label.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn custom_combobox(id: &str, label: &str, chrome: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "div".to_string(),
        id: id.to_string(),
        aria_label: label.to_string(),
        role: "combobox".to_string(),
        aria_haspopup: "listbox".to_string(),
        container_chrome: chrome.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn option_element(id: &str, text: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "li".to_string(),
        id: id.to_string(),
        role: "option".to_string(),
        own_text: text.to_string(),
        visible: true,
        ..RawElement::default()
    }
}

pub fn button(id: &str, text: &str) -> RawElement {
    RawElement {
        selector: format!("#{id}"),
        tag: "button".to_string(),
        id: id.to_string(),
        own_text: text.to_string(),
        visible: true,
        ..RawElement::default()
    }
}
