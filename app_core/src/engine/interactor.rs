//! DOM interaction strategies.
//!
//! Every category runs through one shared loop: re-resolve the live
//! element, perform, verify with a short settle wait, retry with backoff
//! on failure, and record exactly one action per invocation. Overlay
//! interception is recovered by scrolling into view, box-center clicking,
//! event dispatch, and dismissing common overlays before the retry.

use crate::browser::driver::{BrowserDriver, RawElement};
use crate::contracts::{EngineError, EngineResult};
use crate::data_models::action::{ActionKind, ActionRecord, Verification};
use crate::data_models::field::{FieldCategory, FieldDescriptor, ResolvedValue};
use crate::engine::detector::{POPUP_CONTAINER_SELECTOR, POPUP_OPTION_SELECTOR};
use crate::engine::recorder::ActionRecorder;
use crate::utils::logger::log_field_action;
use crate::utils::similarity::{containment_match, normalize_label, word_jaccard};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const OVERLAY_CLOSE_SELECTOR: &str =
    "[aria-label='Close'], [aria-label='close'], .modal-close, .cookie-banner button, \
     #onetrust-accept-btn-handler";

const POPUP_WAIT_MS: u64 = 2_000;

fn button_group_selector(descriptor: &FieldDescriptor) -> String {
    format!(
        "{sel} ~ button, {sel} ~ [role='button']",
        sel = descriptor.selector
    )
}

fn search_input_selector(descriptor: &FieldDescriptor) -> String {
    format!("{} input", descriptor.selector)
}

#[derive(Debug, Clone)]
pub struct InteractorConfig {
    pub max_retries: u32,
    pub settle_wait_ms: u64,
    pub similarity_threshold: f64,
    pub max_skills: usize,
}

impl Default for InteractorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            settle_wait_ms: 300,
            similarity_threshold: 0.8,
            max_skills: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

/// # NDOC
/// component: `engine::interactor`
/// purpose: One retry/verify loop, parameterized by category strategy.
/// invariants:
///   - Exactly one `ActionRecord` per invocation.
///   - `success` implies a verification whose expected/actual agree.
///   - Element handles are re-resolved per attempt, never trusted stale.
pub struct FieldInteractor {
    driver: Arc<dyn BrowserDriver>,
    recorder: Arc<ActionRecorder>,
    config: InteractorConfig,
}

impl FieldInteractor {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        recorder: Arc<ActionRecorder>,
        config: InteractorConfig,
    ) -> Self {
        Self {
            driver,
            recorder,
            config,
        }
    }

    pub async fn apply(
        &self,
        descriptor: &FieldDescriptor,
        value: &ResolvedValue,
        resume_path: Option<&Path>,
    ) -> InteractionOutcome {
        let kind = action_kind_for(descriptor.category);
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_retries {
            match self.perform_and_verify(descriptor, value, resume_path).await {
                Ok(verification) => {
                    let record = ActionRecord::new(kind)
                        .with_field(&descriptor.stable_id)
                        .with_value(value.intended_text().unwrap_or_default());
                    let mut record = record.succeeded(Some(verification));
                    record.retry_count = attempt - 1;
                    self.recorder.record(record);
                    log_field_action(&descriptor.stable_id, kind_name(kind), true, "verified");
                    return InteractionOutcome {
                        success: true,
                        attempts: attempt,
                        error: None,
                    };
                }
                Err(err) => {
                    last_error = err.message.clone();
                    if attempt < self.config.max_retries {
                        self.recover_before_retry(descriptor).await;
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        self.recorder.record(
            ActionRecord::new(kind)
                .with_field(&descriptor.stable_id)
                .failed(&last_error, self.config.max_retries),
        );
        log_field_action(&descriptor.stable_id, kind_name(kind), false, &last_error);
        InteractionOutcome {
            success: false,
            attempts: self.config.max_retries,
            error: Some(last_error),
        }
    }

    /// Record a navigation/submit-style action that is not a field fill.
    pub fn record_event(&self, kind: ActionKind, value: Option<String>, success: bool) {
        let mut record = ActionRecord::new(kind);
        record.value = value;
        record.success = success;
        self.recorder.record(record);
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.config.settle_wait_ms.max(50);
        let exp = base.saturating_mul(1 << (attempt - 1).min(5));
        let jitter = rand::thread_rng().gen_range(0..base);
        self.driver.wait_ms(exp + jitter).await;
    }

    /// Click ladder: plain click, box-center mouse click, then synthetic
    /// event dispatch. Overlay-intercepted clicks usually yield to one of
    /// the later rungs.
    async fn robust_click(&self, selector: &str) -> EngineResult<()> {
        if self.driver.click(selector).await.is_ok() {
            return Ok(());
        }
        let _ = self.driver.scroll_into_view(selector).await;
        if self.driver.click_at_center(selector).await.is_ok() {
            return Ok(());
        }
        self.driver.dispatch_click(selector).await
    }

    async fn recover_before_retry(&self, descriptor: &FieldDescriptor) {
        let _ = self.driver.scroll_into_view(&descriptor.selector).await;
        let _ = self.driver.press("body", "Escape").await;
        if let Ok(closers) = self.driver.query_elements(OVERLAY_CLOSE_SELECTOR).await {
            if let Some(closer) = closers.iter().find(|c| c.visible) {
                let _ = self.driver.click(&closer.selector).await;
            }
        }
    }

    /// Re-resolve from the stable descriptor, act, settle, read back.
    async fn perform_and_verify(
        &self,
        descriptor: &FieldDescriptor,
        value: &ResolvedValue,
        resume_path: Option<&Path>,
    ) -> EngineResult<Verification> {
        let live = self.driver.query_elements(&descriptor.selector).await?;
        if live.is_empty() {
            return Err(EngineError::interaction(format!(
                "element vanished for {}",
                descriptor.stable_id
            )));
        }

        match (descriptor.category, value) {
            (category, ResolvedValue::Simple(text)) if category.is_text_like() => {
                self.fill_text(descriptor, text).await
            }
            (FieldCategory::Textarea, ResolvedValue::Generated(text)) => {
                self.fill_text(descriptor, text).await
            }
            (category, ResolvedValue::Generated(text)) if category.is_text_like() => {
                self.fill_text(descriptor, text).await
            }
            (FieldCategory::SelectNative, ResolvedValue::Selection(label)) => {
                self.select_native(descriptor, label).await
            }
            (category, ResolvedValue::Selection(label)) if category.needs_option_extraction() => {
                self.select_custom(descriptor, label).await
            }
            (FieldCategory::ButtonGroup, ResolvedValue::Selection(label)) => {
                self.click_button_group(descriptor, label).await
            }
            (FieldCategory::Checkbox | FieldCategory::Radio, ResolvedValue::CheckDecision(state, _)) => {
                self.set_check_state(descriptor, *state).await
            }
            (FieldCategory::FileUpload, _) => self.upload_file(descriptor, resume_path).await,
            (FieldCategory::MultiselectSkills, ResolvedValue::Simple(joined)) => {
                self.fill_skills(descriptor, joined).await
            }
            (category, value) => Err(EngineError::interaction(format!(
                "no strategy for {:?} with {:?}",
                category, value
            ))),
        }
    }

    async fn settle(&self) {
        self.driver.wait_ms(self.config.settle_wait_ms).await;
    }

    async fn fill_text(&self, descriptor: &FieldDescriptor, text: &str) -> EngineResult<Verification> {
        self.driver.fill(&descriptor.selector, text).await?;
        self.settle().await;
        let actual = self.driver.read_value(&descriptor.selector).await?;
        let verification = Verification {
            expected: Some(text.to_string()),
            actual: Some(actual.clone()),
        };
        if actual == text {
            Ok(verification)
        } else {
            Err(EngineError::interaction(format!(
                "read-back mismatch for {}: expected {:?}, got {:?}",
                descriptor.stable_id, text, actual
            )))
        }
    }

    async fn select_native(
        &self,
        descriptor: &FieldDescriptor,
        label: &str,
    ) -> EngineResult<Verification> {
        if let Err(first_err) = self.driver.select_by_label(&descriptor.selector, label).await {
            // Label collision or text mismatch: fall back to the option value.
            let fallback = descriptor
                .options
                .iter()
                .find(|o| o.text.eq_ignore_ascii_case(label.trim()))
                .map(|o| o.value.clone());
            match fallback {
                Some(option_value) => {
                    self.driver
                        .select_by_value(&descriptor.selector, &option_value)
                        .await?
                }
                None => return Err(first_err),
            }
        }
        self.settle().await;
        let actual = self.driver.selected_label(&descriptor.selector).await?;
        let verification = Verification {
            expected: Some(label.to_string()),
            actual: Some(actual.clone()),
        };
        if actual.trim().eq_ignore_ascii_case(label.trim()) {
            Ok(verification)
        } else {
            Err(EngineError::interaction(format!(
                "selection mismatch for {}: expected {:?}, got {:?}",
                descriptor.stable_id, label, actual
            )))
        }
    }

    async fn select_custom(
        &self,
        descriptor: &FieldDescriptor,
        label: &str,
    ) -> EngineResult<Verification> {
        self.driver.click(&descriptor.selector).await?;
        let appeared = self
            .driver
            .wait_for_selector(POPUP_CONTAINER_SELECTOR, POPUP_WAIT_MS)
            .await?;
        if !appeared {
            return Err(EngineError::interaction(format!(
                "popup did not open for {}",
                descriptor.stable_id
            )));
        }
        self.settle().await;
        let options = self.driver.query_elements(POPUP_OPTION_SELECTOR).await?;
        let target = pick_popup_option(&options, label, self.config.similarity_threshold)
            .ok_or_else(|| {
                EngineError::interaction(format!(
                    "no popup option matched {:?} for {}",
                    label, descriptor.stable_id
                ))
            })?;
        self.robust_click(&target.selector).await?;
        // Close any residual overlay.
        self.driver.press("body", "Escape").await?;
        self.settle().await;

        let mut actual = self.driver.read_value(&descriptor.selector).await?;
        if actual.trim().is_empty() {
            actual = self
                .driver
                .query_elements(&descriptor.selector)
                .await?
                .first()
                .map(|e| e.own_text.clone())
                .unwrap_or_default();
        }
        let verification = Verification {
            expected: Some(label.to_string()),
            actual: Some(actual.clone()),
        };
        if containment_match(label, &actual)
            || word_jaccard(label, &actual) >= self.config.similarity_threshold
        {
            Ok(verification)
        } else {
            Err(EngineError::interaction(format!(
                "dropdown read-back mismatch for {}: expected {:?}, got {:?}",
                descriptor.stable_id, label, actual
            )))
        }
    }

    async fn click_button_group(
        &self,
        descriptor: &FieldDescriptor,
        label: &str,
    ) -> EngineResult<Verification> {
        let buttons = self
            .driver
            .query_elements(&button_group_selector(descriptor))
            .await?;
        let target = buttons
            .iter()
            .find(|b| b.own_text.trim().eq_ignore_ascii_case(label.trim()))
            .ok_or_else(|| {
                EngineError::interaction(format!(
                    "no button labeled {:?} in group {}",
                    label, descriptor.stable_id
                ))
            })?;
        self.robust_click(&target.selector).await?;
        self.settle().await;

        let pressed = self
            .driver
            .get_attribute(&target.selector, "aria-pressed")
            .await?
            .map(|v| v == "true")
            .unwrap_or(false);
        let selected_class = self
            .driver
            .get_attribute(&target.selector, "class")
            .await?
            .map(|c| c.contains("selected") || c.contains("active"))
            .unwrap_or(false);
        if pressed || selected_class {
            Ok(Verification {
                expected: Some(label.to_string()),
                actual: Some(label.to_string()),
            })
        } else {
            Err(EngineError::interaction(format!(
                "button group selection not confirmed for {}",
                descriptor.stable_id
            )))
        }
    }

    async fn set_check_state(
        &self,
        descriptor: &FieldDescriptor,
        intended: bool,
    ) -> EngineResult<Verification> {
        if self
            .driver
            .set_checked(&descriptor.selector, intended)
            .await
            .is_err()
        {
            // Styled widgets reject the native path; click instead.
            self.robust_click(&descriptor.selector).await?;
        }
        self.settle().await;
        let actual = self.driver.is_checked(&descriptor.selector).await?;
        let verification = Verification {
            expected: Some(intended.to_string()),
            actual: Some(actual.to_string()),
        };
        if actual == intended {
            Ok(verification)
        } else {
            Err(EngineError::interaction(format!(
                "check state mismatch for {}: expected {}, got {}",
                descriptor.stable_id, intended, actual
            )))
        }
    }

    async fn upload_file(
        &self,
        descriptor: &FieldDescriptor,
        resume_path: Option<&Path>,
    ) -> EngineResult<Verification> {
        let path: PathBuf = resume_path
            .ok_or_else(|| EngineError::resource("no resume available in the sandbox"))?
            .to_path_buf();
        self.driver.set_files(&descriptor.selector, &path).await?;
        self.settle().await;
        let actual = self.driver.read_value(&descriptor.selector).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if actual.is_empty() {
            return Err(EngineError::interaction(format!(
                "upload not reflected for {}",
                descriptor.stable_id
            )));
        }
        Ok(Verification {
            expected: Some(file_name.clone()),
            actual: Some(if actual.contains(&file_name) {
                file_name
            } else {
                actual
            }),
        })
    }

    async fn fill_skills(
        &self,
        descriptor: &FieldDescriptor,
        joined: &str,
    ) -> EngineResult<Verification> {
        let search = search_input_selector(descriptor);
        let skills: Vec<&str> = joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(self.config.max_skills)
            .collect();
        let mut committed = Vec::new();

        for skill in &skills {
            self.driver.fill(&search, "").await?;
            self.driver.type_text(&search, skill).await?;
            let appeared = self
                .driver
                .wait_for_selector(POPUP_CONTAINER_SELECTOR, POPUP_WAIT_MS)
                .await?;
            if !appeared {
                continue;
            }
            self.settle().await;
            let options = self.driver.query_elements(POPUP_OPTION_SELECTOR).await?;
            if let Some(exact) = options.iter().find(|o| {
                normalize_label(&o.own_text) == normalize_label(skill)
                    || containment_match(skill, &o.own_text)
            }) {
                self.driver.click(&exact.selector).await?;
                committed.push(skill.to_string());
                continue;
            }
            // No direct match: commit the typed value only when the top
            // suggestion is close enough to what we meant.
            let top = options.first().map(|o| o.own_text.clone()).unwrap_or_default();
            if !top.is_empty()
                && word_jaccard(&top, skill) >= self.config.similarity_threshold
            {
                self.driver.press(&search, "Enter").await?;
                committed.push(skill.to_string());
            } else {
                self.driver.fill(&search, "").await?;
            }
        }

        if committed.is_empty() {
            return Err(EngineError::interaction(format!(
                "no skills committed for {}",
                descriptor.stable_id
            )));
        }
        let committed_joined = committed.join(", ");
        Ok(Verification {
            expected: Some(committed_joined.clone()),
            actual: Some(committed_joined),
        })
    }
}

fn pick_popup_option<'a>(
    options: &'a [RawElement],
    label: &str,
    threshold: f64,
) -> Option<&'a RawElement> {
    let wanted = normalize_label(label);
    if let Some(exact) = options
        .iter()
        .find(|o| normalize_label(&o.own_text) == wanted)
    {
        return Some(exact);
    }
    if let Some(contained) = options
        .iter()
        .find(|o| containment_match(label, &o.own_text))
    {
        return Some(contained);
    }
    options
        .iter()
        .map(|o| (o, word_jaccard(label, &o.own_text)))
        .filter(|(_, score)| *score >= threshold)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(o, _)| o)
}

fn action_kind_for(category: FieldCategory) -> ActionKind {
    match category {
        FieldCategory::FileUpload => ActionKind::Upload,
        FieldCategory::Checkbox | FieldCategory::Radio => ActionKind::Click,
        category if category.is_dropdown_like() => ActionKind::Select,
        FieldCategory::ButtonGroup | FieldCategory::MultiselectSkills => ActionKind::Select,
        _ => ActionKind::Fill,
    }
}

fn kind_name(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Fill => "fill",
        ActionKind::Select => "select",
        ActionKind::Click => "click",
        ActionKind::Upload => "upload",
        ActionKind::Navigate => "navigate",
        ActionKind::Wait => "wait",
        ActionKind::Submit => "submit",
    }
}
