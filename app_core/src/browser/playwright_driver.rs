//! Playwright-backed implementation of the browser seam.
//!
//! All playwright API usage in the workspace lives in this file. DOM reads
//! and writes that the binding does not expose as builders are channeled
//! through `evaluate`, so the adapter surface stays small.

use crate::browser::driver::{BrowserDriver, RawElement};
use crate::contracts::{EngineError, EngineResult};
use async_trait::async_trait;
use playwright::api::{Browser, BrowserContext, Page, Playwright as Pw};
use std::path::Path;

/// JS evaluated to snapshot candidate interactive elements. Returns an
/// array of objects matching `RawElement`'s serde shape.
const SNAPSHOT_JS: &str = r#"
() => {
  const cssPath = (el) => {
    if (el.id) return '#' + CSS.escape(el.id);
    const parts = [];
    let node = el;
    while (node && node.nodeType === 1 && parts.length < 8) {
      let part = node.tagName.toLowerCase();
      const parent = node.parentElement;
      if (parent) {
        const same = Array.from(parent.children).filter(c => c.tagName === node.tagName);
        if (same.length > 1) part += `:nth-of-type(${same.indexOf(node) + 1})`;
      }
      parts.unshift(part);
      if (node.id) { parts[0] = '#' + CSS.escape(node.id); break; }
      node = parent;
    }
    return parts.join(' > ');
  };
  const textOf = (el) => el ? (el.textContent || '').replace(/\s+/g, ' ').trim() : '';
  const isVisible = (el) => {
    const rect = el.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) return false;
    const style = window.getComputedStyle(el);
    if (style.display === 'none' || style.visibility === 'hidden') return false;
    return (el.getAttribute('type') || '').toLowerCase() !== 'hidden';
  };
  const chromeOf = (el) => {
    const markers = [];
    let node = el;
    for (let depth = 0; node && depth < 5; depth++) {
      if (node.className && typeof node.className === 'string') {
        markers.push(node.className.toLowerCase());
      }
      for (const attr of node.attributes || []) {
        if (attr.name.startsWith('data-')) markers.push(`${attr.name}=${attr.value}`.toLowerCase());
      }
      node = node.parentElement;
    }
    return markers.join(' ');
  };
  const precedingText = (el) => {
    let node = el.closest('div,fieldset,li,tr,section') || el.parentElement;
    for (let depth = 0; node && depth < 4; depth++) {
      let sibling = node.previousElementSibling;
      while (sibling) {
        const text = textOf(sibling);
        if (text && text.length <= 200 && !sibling.querySelector('input,select,textarea')) {
          return text;
        }
        sibling = sibling.previousElementSibling;
      }
      node = node.parentElement;
    }
    return '';
  };
  const labelFor = (el) => {
    if (el.id) {
      const label = document.querySelector(`label[for="${CSS.escape(el.id)}"]`);
      if (label) return textOf(label);
    }
    const wrapping = el.closest('label');
    return wrapping ? textOf(wrapping) : '';
  };
  const labelledBy = (el) => {
    const ids = (el.getAttribute('aria-labelledby') || '').split(/\s+/).filter(Boolean);
    return ids.map(id => textOf(document.getElementById(id))).filter(Boolean).join(' ');
  };
  const legendOf = (el) => {
    const fieldset = el.closest('fieldset');
    if (!fieldset) return '';
    const legend = fieldset.querySelector('legend');
    return textOf(legend);
  };
  const siblingButtons = (el) => {
    const type = (el.getAttribute('type') || '').toLowerCase();
    if (type !== 'checkbox' && type !== 'radio') return 0;
    if (isVisible(el)) return 0;
    const parent = el.parentElement;
    if (!parent) return 0;
    return parent.querySelectorAll('button, [role="button"]').length;
  };
  const selector = 'input, select, textarea, [role="combobox"], [aria-haspopup="listbox"], [aria-haspopup="true"]';
  const seen = new Set();
  const out = [];
  for (const el of document.querySelectorAll(selector)) {
    const path = cssPath(el);
    if (seen.has(path)) continue;
    seen.add(path);
    const tag = el.tagName.toLowerCase();
    const options = tag === 'select'
      ? Array.from(el.options).map(o => ({ text: textOf(o), value: o.value }))
      : [];
    out.push({
      selector: path,
      tag,
      input_type: (el.getAttribute('type') || '').toLowerCase(),
      id: el.id || '',
      name: el.getAttribute('name') || '',
      aria_label: el.getAttribute('aria-label') || '',
      aria_labelledby_text: labelledBy(el),
      label_for_text: labelFor(el),
      legend_text: legendOf(el),
      preceding_text: precedingText(el),
      placeholder: el.getAttribute('placeholder') || '',
      role: el.getAttribute('role') || '',
      aria_haspopup: el.getAttribute('aria-haspopup') || '',
      container_chrome: chromeOf(el),
      required: el.required === true || el.getAttribute('aria-required') === 'true',
      visible: isVisible(el),
      value: ('value' in el) ? String(el.value || '') : '',
      checked: el.checked === true,
      options,
      own_text: tag === 'select' ? '' : textOf(el).slice(0, 120),
      sibling_buttons: siblingButtons(el),
    });
  }
  return out;
}
"#;

const QUERY_JS: &str = r#"
(sel) => {
  const textOf = (el) => (el.textContent || '').replace(/\s+/g, ' ').trim();
  const isVisible = (el) => {
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    return rect.width > 0 && rect.height > 0
      && style.display !== 'none' && style.visibility !== 'hidden';
  };
  const cssPath = (el) => {
    if (el.id) return '#' + CSS.escape(el.id);
    const parts = [];
    let node = el;
    while (node && node.nodeType === 1 && parts.length < 8) {
      let part = node.tagName.toLowerCase();
      const parent = node.parentElement;
      if (parent) {
        const same = Array.from(parent.children).filter(c => c.tagName === node.tagName);
        if (same.length > 1) part += `:nth-of-type(${same.indexOf(node) + 1})`;
      }
      parts.unshift(part);
      if (node.id) { parts[0] = '#' + CSS.escape(node.id); break; }
      node = parent;
    }
    return parts.join(' > ');
  };
  let matched;
  try { matched = Array.from(document.querySelectorAll(sel)); } catch (e) { return []; }
  return matched.map(el => ({
    selector: cssPath(el),
    tag: el.tagName.toLowerCase(),
    input_type: (el.getAttribute('type') || '').toLowerCase(),
    id: el.id || '',
    name: el.getAttribute('name') || '',
    aria_label: el.getAttribute('aria-label') || '',
    role: el.getAttribute('role') || '',
    visible: isVisible(el),
    value: ('value' in el) ? String(el.value || '') : '',
    checked: el.checked === true,
    own_text: textOf(el).slice(0, 200),
  }));
}
"#;

fn driver_error(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::interaction(format!("{context}: {err}"))
}

/// # NDOC
/// component: `browser::playwright_driver`
/// purpose: Production driver; owns the playwright handles for one page.
pub struct PlaywrightDriver {
    _playwright: Pw,
    browser: Browser,
    _context: BrowserContext,
    page: Page,
}

impl PlaywrightDriver {
    /// Launch a fresh browser through playwright (non-sandboxed path and
    /// local development).
    pub async fn launch(headless: bool) -> EngineResult<Self> {
        let playwright = Pw::initialize()
            .await
            .map_err(|e| EngineError::resource(format!("playwright init failed: {e:?}")))?;
        let chromium = playwright.chromium();
        let browser = chromium
            .launcher()
            .headless(headless)
            .launch()
            .await
            .map_err(|e| EngineError::resource(format!("browser launch failed: {e}")))?;
        let context = browser
            .context_builder()
            .build()
            .await
            .map_err(|e| EngineError::resource(format!("context create failed: {e}")))?;
        let page = context
            .new_page()
            .await
            .map_err(|e| EngineError::resource(format!("page create failed: {e}")))?;
        Ok(Self {
            _playwright: playwright,
            browser,
            _context: context,
            page,
        })
    }

    /// Attach to a browser the sandbox already launched on its debug port.
    pub async fn connect(debug_port: u16) -> EngineResult<Self> {
        let playwright = Pw::initialize()
            .await
            .map_err(|e| EngineError::resource(format!("playwright init failed: {e:?}")))?;
        let chromium = playwright.chromium();
        let endpoint = format!("http://127.0.0.1:{debug_port}");
        let browser = chromium
            .connect_over_cdp_builder(&endpoint)
            .connect_over_cdp()
            .await
            .map_err(|e| EngineError::resource(format!("cdp connect failed: {e}")))?;
        let context = match browser.contexts() {
            Ok(mut contexts) if !contexts.is_empty() => contexts.remove(0),
            _ => browser
                .context_builder()
                .build()
                .await
                .map_err(|e| EngineError::resource(format!("context create failed: {e}")))?,
        };
        let page = match context.pages() {
            Ok(mut pages) if !pages.is_empty() => pages.remove(0),
            _ => context
                .new_page()
                .await
                .map_err(|e| EngineError::resource(format!("page create failed: {e}")))?,
        };
        Ok(Self {
            _playwright: playwright,
            browser,
            _context: context,
            page,
        })
    }

    async fn eval_void(&self, context: &str, expression: String) -> EngineResult<()> {
        self.page
            .eval::<serde_json::Value>(&expression)
            .await
            .map(|_| ())
            .map_err(|e| driver_error(context, e))
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn navigate(&self, url: &str) -> EngineResult<()> {
        self.page
            .goto_builder(url)
            .goto()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::navigation(format!("goto {url} failed: {e}")))
    }

    async fn current_url(&self) -> EngineResult<String> {
        self.page
            .eval::<String>("() => location.href")
            .await
            .map_err(|e| driver_error("read url", e))
    }

    async fn page_content(&self) -> EngineResult<String> {
        self.page
            .content()
            .await
            .map_err(|e| driver_error("read content", e))
    }

    async fn snapshot_form_elements(&self) -> EngineResult<Vec<RawElement>> {
        self.page
            .eval::<Vec<RawElement>>(SNAPSHOT_JS)
            .await
            .map_err(|e| driver_error("snapshot elements", e))
    }

    async fn query_elements(&self, selector: &str) -> EngineResult<Vec<RawElement>> {
        self.page
            .evaluate::<String, Vec<RawElement>>(QUERY_JS, selector.to_string())
            .await
            .map_err(|e| driver_error("query elements", e))
    }

    async fn click(&self, selector: &str) -> EngineResult<()> {
        self.page
            .click_builder(selector)
            .click()
            .await
            .map_err(|e| driver_error("click", e))
    }

    async fn click_at_center(&self, selector: &str) -> EngineResult<()> {
        self.page
            .evaluate::<String, bool>(
                r#"(sel) => {
                    const el = document.querySelector(sel);
                    if (!el) return false;
                    const rect = el.getBoundingClientRect();
                    const x = rect.left + rect.width / 2;
                    const y = rect.top + rect.height / 2;
                    const target = document.elementFromPoint(x, y) || el;
                    for (const kind of ['mousedown', 'mouseup', 'click']) {
                        target.dispatchEvent(new MouseEvent(kind, {
                            bubbles: true, cancelable: true, clientX: x, clientY: y,
                        }));
                    }
                    return true;
                }"#,
                selector.to_string(),
            )
            .await
            .map(|_| ())
            .map_err(|e| driver_error("center click", e))
    }

    async fn dispatch_click(&self, selector: &str) -> EngineResult<()> {
        self.page
            .evaluate::<String, bool>(
                r#"(sel) => {
                    const el = document.querySelector(sel);
                    if (!el) return false;
                    el.dispatchEvent(new MouseEvent('click', { bubbles: true, cancelable: true }));
                    return true;
                }"#,
                selector.to_string(),
            )
            .await
            .map(|_| ())
            .map_err(|e| driver_error("dispatch click", e))
    }

    async fn scroll_into_view(&self, selector: &str) -> EngineResult<()> {
        self.page
            .evaluate::<String, bool>(
                r#"(sel) => {
                    const el = document.querySelector(sel);
                    if (!el) return false;
                    el.scrollIntoView({ block: 'center', inline: 'center' });
                    return true;
                }"#,
                selector.to_string(),
            )
            .await
            .map(|_| ())
            .map_err(|e| driver_error("scroll into view", e))
    }

    async fn fill(&self, selector: &str, value: &str) -> EngineResult<()> {
        self.page
            .fill_builder(selector, value)
            .fill()
            .await
            .map_err(|e| driver_error("fill", e))
    }

    async fn type_text(&self, selector: &str, text: &str) -> EngineResult<()> {
        self.page
            .type_builer(selector, text)
            .r#type()
            .await
            .map_err(|e| driver_error("type", e))
    }

    async fn press(&self, selector: &str, key: &str) -> EngineResult<()> {
        self.page
            .press_builder(selector, key)
            .press()
            .await
            .map_err(|e| driver_error("press", e))
    }

    async fn select_by_label(&self, selector: &str, label: &str) -> EngineResult<()> {
        let changed = self
            .page
            .evaluate::<(String, String), bool>(
                r#"(args) => {
                    const [sel, label] = args;
                    const el = document.querySelector(sel);
                    if (!el || el.tagName !== 'SELECT') return false;
                    const wanted = label.trim().toLowerCase();
                    for (const option of el.options) {
                        const text = (option.textContent || '').replace(/\s+/g, ' ').trim();
                        if (text.toLowerCase() === wanted) {
                            el.value = option.value;
                            el.dispatchEvent(new Event('input', { bubbles: true }));
                            el.dispatchEvent(new Event('change', { bubbles: true }));
                            return true;
                        }
                    }
                    return false;
                }"#,
                (selector.to_string(), label.to_string()),
            )
            .await
            .map_err(|e| driver_error("select by label", e))?;
        if changed {
            Ok(())
        } else {
            Err(EngineError::interaction(format!(
                "no option labeled '{label}' in {selector}"
            )))
        }
    }

    async fn select_by_value(&self, selector: &str, value: &str) -> EngineResult<()> {
        let changed = self
            .page
            .evaluate::<(String, String), bool>(
                r#"(args) => {
                    const [sel, value] = args;
                    const el = document.querySelector(sel);
                    if (!el || el.tagName !== 'SELECT') return false;
                    for (const option of el.options) {
                        if (option.value === value) {
                            el.value = option.value;
                            el.dispatchEvent(new Event('input', { bubbles: true }));
                            el.dispatchEvent(new Event('change', { bubbles: true }));
                            return true;
                        }
                    }
                    return false;
                }"#,
                (selector.to_string(), value.to_string()),
            )
            .await
            .map_err(|e| driver_error("select by value", e))?;
        if changed {
            Ok(())
        } else {
            Err(EngineError::interaction(format!(
                "no option valued '{value}' in {selector}"
            )))
        }
    }

    async fn set_files(&self, selector: &str, path: &Path) -> EngineResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::resource(format!("resume file unreadable: {e}")))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "resume.pdf".to_string());
        let mime = if name.to_lowercase().ends_with(".pdf") {
            "application/pdf"
        } else {
            "application/octet-stream"
        };
        let file = playwright::api::File::new(name, mime.to_string(), &bytes);
        let element = self
            .page
            .query_selector(selector)
            .await
            .map_err(|e| driver_error("resolve file input", e))?
            .ok_or_else(|| EngineError::interaction(format!("no element for {selector}")))?;
        element
            .set_input_files_builder(file)
            .set_input_files()
            .await
            .map_err(|e| driver_error("set input files", e))
    }

    async fn read_value(&self, selector: &str) -> EngineResult<String> {
        self.page
            .evaluate::<String, String>(
                r#"(sel) => {
                    const el = document.querySelector(sel);
                    return el && ('value' in el) ? String(el.value || '') : '';
                }"#,
                selector.to_string(),
            )
            .await
            .map_err(|e| driver_error("read value", e))
    }

    async fn selected_label(&self, selector: &str) -> EngineResult<String> {
        self.page
            .evaluate::<String, String>(
                r#"(sel) => {
                    const el = document.querySelector(sel);
                    if (!el || el.tagName !== 'SELECT') return '';
                    const option = el.options[el.selectedIndex];
                    return option ? (option.textContent || '').replace(/\s+/g, ' ').trim() : '';
                }"#,
                selector.to_string(),
            )
            .await
            .map_err(|e| driver_error("read selected label", e))
    }

    async fn is_checked(&self, selector: &str) -> EngineResult<bool> {
        self.page
            .evaluate::<String, bool>(
                "(sel) => { const el = document.querySelector(sel); return el ? el.checked === true : false; }",
                selector.to_string(),
            )
            .await
            .map_err(|e| driver_error("read checked", e))
    }

    async fn set_checked(&self, selector: &str, checked: bool) -> EngineResult<()> {
        self.page
            .evaluate::<(String, bool), bool>(
                r#"(args) => {
                    const [sel, checked] = args;
                    const el = document.querySelector(sel);
                    if (!el) return false;
                    if (el.checked !== checked) {
                        el.checked = checked;
                        el.dispatchEvent(new Event('input', { bubbles: true }));
                        el.dispatchEvent(new Event('change', { bubbles: true }));
                    }
                    return true;
                }"#,
                (selector.to_string(), checked),
            )
            .await
            .map(|_| ())
            .map_err(|e| driver_error("set checked", e))
    }

    async fn get_attribute(&self, selector: &str, name: &str) -> EngineResult<Option<String>> {
        self.page
            .evaluate::<(String, String), Option<String>>(
                r#"(args) => {
                    const [sel, name] = args;
                    const el = document.querySelector(sel);
                    return el ? el.getAttribute(name) : null;
                }"#,
                (selector.to_string(), name.to_string()),
            )
            .await
            .map_err(|e| driver_error("get attribute", e))
    }

    async fn wait_for_selector(&self, selector: &str, timeout_ms: u64) -> EngineResult<bool> {
        let result = self
            .page
            .wait_for_selector_builder(selector)
            .timeout(timeout_ms as f64)
            .wait_for_selector()
            .await;
        match result {
            Ok(handle) => Ok(handle.is_some()),
            // The binding reports timeout as an error; the engine treats it
            // as "not found" and decides what to do.
            Err(_) => Ok(false),
        }
    }

    async fn wait_ms(&self, ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    async fn inject_init_script(&self, source: &str) -> EngineResult<()> {
        // Applies to future documents; also evaluate once for the current one.
        self.page
            .add_init_script(source)
            .await
            .map_err(|e| driver_error("add init script", e))?;
        self.eval_void("run init script", format!("() => {{ {source} }}"))
            .await
    }

    async fn close(&self) -> EngineResult<()> {
        self.browser
            .close()
            .await
            .map_err(|e| EngineError::resource(format!("browser close failed: {e}")))
    }
}
