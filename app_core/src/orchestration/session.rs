//! One job, end to end: acquire a coordinator, navigate, pick the entry
//! action, run the fill loop, then submit or park for human review.

use crate::contracts::EngineResult;
use crate::data_models::action::ActionKind;
use crate::data_models::profile::{ProfileKey, ProfileView};
use crate::engine::ai_mapper::AiMapper;
use crate::engine::completion::CompletionTracker;
use crate::engine::detector::FieldDetector;
use crate::engine::expander::SectionExpander;
use crate::engine::fast_mapper::FastMapper;
use crate::engine::filler::{FillerConfig, FormFillerOrchestrator};
use crate::engine::interactor::{FieldInteractor, InteractorConfig};
use crate::engine::recorder::ActionRecorder;
use crate::engine::sensitive::SensitiveFieldDetector;
use crate::invariants::ensure_http_url;
use crate::orchestration::runtime::Runtime;
use crate::utils::logger::{clear_current_session_id, set_current_session_id};
use crate::vnc::coordinator::SESSION_GUARD_JS;
use scraper::{Html, Selector};
use std::sync::Arc;

const SUBMIT_KEYWORDS: &[&str] = &[
    "submit application",
    "submit",
    "send application",
    "apply",
    "continue",
    "next",
];
const SUBMIT_DISQUALIFIERS: &[&str] = &["cancel", "back", "previous", "save draft", "withdraw"];

const ENTRY_KEYWORDS: &[&str] = &["apply manually", "apply now", "apply", "start application"];
/// Autofill-by-resume affordances degrade accuracy; policy is to skip them.
const ENTRY_DISQUALIFIERS: &[&str] = &["autofill", "with resume", "with linkedin", "with indeed"];

const BUTTON_CANDIDATES: &str = "button, [role='button'], a[role='button'], input[type='submit']";
const FILE_INPUT_SELECTOR: &str = "input[type='file']";

/// Terminal state of one job.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Submitted,
    ReadyForReview { viewer_url: String, reason: String },
    Failed { reason: String },
}

/// # NDOC
/// component: `orchestration::session`
/// purpose: Drive one job to `submitted`, `ready_for_review`, or `failed`.
/// invariants:
///   - `ready_for_review` keeps the VNC session alive; `submitted` and
///     `failed` close it.
///   - A detected captcha or a held sensitive field never reaches submit.
pub struct SessionOrchestrator {
    runtime: Runtime,
}

impl SessionOrchestrator {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    pub async fn run_job(
        &self,
        user_id: &str,
        job_id: &str,
        job_url: &str,
        progress: &mut (dyn FnMut(u8, &str) + Send),
    ) -> SessionOutcome {
        match self.run_job_inner(user_id, job_id, job_url, progress).await {
            Ok(outcome) => outcome,
            Err(err) => SessionOutcome::Failed {
                reason: err.message,
            },
        }
    }

    async fn run_job_inner(
        &self,
        user_id: &str,
        job_id: &str,
        job_url: &str,
        progress: &mut (dyn FnMut(u8, &str) + Send),
    ) -> EngineResult<SessionOutcome> {
        ensure_http_url(job_url, "job_url")?;
        progress(5, "loading profile");
        let profile = self.runtime.profiles.get_profile(user_id).await?;

        let resume = match profile.text(ProfileKey::ResumeBlobRef) {
            Some(blob_ref) => Some(self.runtime.resumes.resolve(blob_ref).await?),
            None => None,
        };

        progress(15, "starting isolated browser session");
        let handle = self
            .runtime
            .fleet
            .create_session(user_id, job_url, resume)
            .await?;
        set_current_session_id(handle.session_id.clone());

        let outcome = self
            .drive_session(&handle, user_id, job_id, job_url, &profile, progress)
            .await;

        match &outcome {
            Ok(SessionOutcome::ReadyForReview { .. }) => {
                // Leave the stack alive for the user's takeover.
            }
            _ => {
                if let Err(err) = self.runtime.fleet.close_session(&handle.session_id).await {
                    log::warn!(
                        session_id = handle.session_id.as_str(),
                        error = err.message.as_str();
                        "session close failed"
                    );
                }
            }
        }
        clear_current_session_id();
        outcome
    }

    async fn drive_session(
        &self,
        handle: &crate::vnc::fleet::FleetHandle,
        user_id: &str,
        job_id: &str,
        job_url: &str,
        profile: &ProfileView,
        progress: &mut (dyn FnMut(u8, &str) + Send),
    ) -> EngineResult<SessionOutcome> {
        let driver = self.runtime.drivers.connect(handle.debug_port).await?;
        driver.inject_init_script(SESSION_GUARD_JS).await?;

        let config = &self.runtime.config;
        let recorder = Arc::new(ActionRecorder::new(
            &config.state_root,
            user_id,
            job_id,
            config.action_record_ttl_hours,
        ));
        let detector = FieldDetector::new(Arc::clone(&driver), config.settle_wait_ms);
        let interactor = FieldInteractor::new(
            Arc::clone(&driver),
            Arc::clone(&recorder),
            InteractorConfig {
                max_retries: config.max_retries,
                settle_wait_ms: config.settle_wait_ms,
                similarity_threshold: config.similarity_threshold,
                max_skills: config.max_skills_per_field,
            },
        );
        let filler = FormFillerOrchestrator::new(
            FieldDetector::new(Arc::clone(&driver), config.settle_wait_ms),
            FastMapper::new(config.similarity_threshold, config.max_skills_per_field),
            AiMapper::new(Arc::clone(&self.runtime.gateway), config.similarity_threshold),
            interactor,
            SensitiveFieldDetector::new(),
            SectionExpander::new(Arc::clone(&driver), config.settle_wait_ms),
            FillerConfig {
                max_passes: config.max_fill_passes,
                llm_calls_per_job: config.llm_calls_per_job,
            },
        );

        progress(25, "navigating to application");
        driver.navigate(job_url).await?;
        driver.wait_ms(config.settle_wait_ms).await;
        recorder.record(
            crate::data_models::action::ActionRecord::new(ActionKind::Navigate)
                .with_value(job_url)
                .succeeded(None),
        );

        self.click_entry_action(&driver).await;

        if detector.detect_captcha().await? {
            recorder.mark_completed();
            return Ok(SessionOutcome::ReadyForReview {
                viewer_url: handle.viewer_url.clone(),
                reason: "captcha detected".to_string(),
            });
        }

        // Resume upload affordances outside the visible field set.
        if let Some(resume_path) = handle.resume_path.as_deref() {
            self.try_upload_resume(&driver, resume_path, &recorder).await;
        }

        progress(40, "filling form fields");
        let mut tracker = CompletionTracker::new(config.max_retries);
        let report = filler
            .run(user_id, profile, handle.resume_path.as_deref(), &mut tracker, None)
            .await?;
        progress(80, "form passes complete");

        if report.needs_review() {
            let reason = if !report.sensitive_held.is_empty() {
                format!("{} sensitive field(s) need manual input", report.sensitive_held.len())
            } else if !report.failed_required.is_empty() {
                format!("{} required field(s) failed", report.failed_required.len())
            } else {
                format!(
                    "{} required field(s) unresolved",
                    report.unresolved_required.len()
                )
            };
            recorder.mark_completed();
            return Ok(SessionOutcome::ReadyForReview {
                viewer_url: handle.viewer_url.clone(),
                reason,
            });
        }

        progress(90, "submitting application");
        let submitted = self.attempt_submit(&driver, &recorder).await?;
        recorder.mark_completed();
        if submitted {
            progress(100, "submitted");
            Ok(SessionOutcome::Submitted)
        } else {
            Ok(SessionOutcome::ReadyForReview {
                viewer_url: handle.viewer_url.clone(),
                reason: "submit could not be confirmed".to_string(),
            })
        }
    }

    /// Prefer explicit Apply entry points; never touch autofill affordances.
    async fn click_entry_action(&self, driver: &Arc<dyn crate::browser::driver::BrowserDriver>) {
        let Ok(buttons) = driver.query_elements(BUTTON_CANDIDATES).await else {
            return;
        };
        let entry = ENTRY_KEYWORDS.iter().find_map(|keyword| {
            buttons.iter().find(|b| {
                let text = b.own_text.to_lowercase();
                b.visible
                    && text.contains(keyword)
                    && !ENTRY_DISQUALIFIERS.iter().any(|d| text.contains(d))
            })
        });
        if let Some(button) = entry {
            if driver.click(&button.selector).await.is_ok() {
                driver.wait_ms(self.runtime.config.settle_wait_ms).await;
                log::info!(button = button.own_text.as_str(); "entry action clicked");
            }
        }
    }

    /// Upload the resume into a bare file input when one exists and is
    /// still empty. Hidden inputs are common; the detector's visibility
    /// rule excludes them from the fill loop, so they are handled here.
    async fn try_upload_resume(
        &self,
        driver: &Arc<dyn crate::browser::driver::BrowserDriver>,
        resume_path: &std::path::Path,
        recorder: &Arc<ActionRecorder>,
    ) {
        let Ok(inputs) = driver.query_elements(FILE_INPUT_SELECTOR).await else {
            return;
        };
        let Some(input) = inputs.iter().find(|i| i.value.trim().is_empty()) else {
            return;
        };
        match driver.set_files(&input.selector, resume_path).await {
            Ok(()) => {
                recorder.record(
                    crate::data_models::action::ActionRecord::new(ActionKind::Upload)
                        .with_value(resume_path.display().to_string())
                        .succeeded(None),
                );
            }
            Err(err) => {
                log::warn!(error = err.message.as_str(); "resume upload affordance failed");
            }
        }
    }

    /// Click the best submit candidate; success is a URL change or the
    /// absence of visible error indicators.
    async fn attempt_submit(
        &self,
        driver: &Arc<dyn crate::browser::driver::BrowserDriver>,
        recorder: &Arc<ActionRecorder>,
    ) -> EngineResult<bool> {
        let before_url = driver.current_url().await?;
        let buttons = driver.query_elements(BUTTON_CANDIDATES).await?;
        let submit = SUBMIT_KEYWORDS.iter().find_map(|keyword| {
            buttons.iter().find(|b| {
                let text = b.own_text.to_lowercase();
                b.visible
                    && text.contains(keyword)
                    && !SUBMIT_DISQUALIFIERS.iter().any(|d| text.contains(d))
            })
        });
        let Some(button) = submit else {
            recorder.record(
                crate::data_models::action::ActionRecord::new(ActionKind::Submit)
                    .failed("no submit control found", 0),
            );
            return Ok(false);
        };

        driver.click(&button.selector).await?;
        driver.wait_ms(self.runtime.config.settle_wait_ms * 3).await;

        let after_url = driver.current_url().await?;
        let url_changed = after_url != before_url;
        let clean_page = !page_has_error_indicators(&driver.page_content().await?);
        let success = url_changed || clean_page;

        let mut record = crate::data_models::action::ActionRecord::new(ActionKind::Submit)
            .with_value(button.own_text.clone());
        record.success = success;
        if !success {
            record.error = Some("error indicators visible after submit".to_string());
        }
        recorder.record(record);
        Ok(success)
    }
}

/// Static scan for visible validation errors after a submit attempt.
pub(crate) fn page_has_error_indicators(content: &str) -> bool {
    let document = Html::parse_document(content);
    for selector_text in [
        "[role='alert']",
        ".error-message",
        ".field-error",
        "input[aria-invalid='true']",
        ".has-error",
    ] {
        let Ok(selector) = Selector::parse(selector_text) else {
            continue;
        };
        for element in document.select(&selector) {
            let text: String = element.text().collect::<String>();
            if !text.trim().is_empty() || selector_text.starts_with("input") {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_indicator_scan_reads_alerts_and_invalid_inputs() {
        assert!(page_has_error_indicators(
            "<html><body><div role='alert'>Email is required</div></body></html>"
        ));
        assert!(page_has_error_indicators(
            "<html><body><input aria-invalid='true'></body></html>"
        ));
        assert!(!page_has_error_indicators(
            "<html><body><div role='alert'></div><p>Thanks!</p></body></html>"
        ));
    }
}
