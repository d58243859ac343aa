//! Batch scheduling: bounded URL lists, sequential processing, observable
//! per-slot status.
//!
//! Jobs inside one batch run sequentially so VNC ports and browser
//! processes stay within budget and LLM quota pressure is serialized per
//! user. Slots in review keep their VNC session alive and expose a viewer
//! URL until the user marks them done or closes the batch.

use crate::config::LIMIT_APPLICATIONS_PER_USER_PER_DAY;
use crate::contracts::{EngineError, EngineResult};
use crate::data_models::session::{AuthIdentity, Batch, BatchStatus, JobSlot, SlotState};
use crate::invariants::{ensure_http_url, ensure_range_usize};
use crate::orchestration::runtime::Runtime;
use crate::orchestration::session::{SessionOrchestrator, SessionOutcome};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BatchRequest {
    #[validate(length(min = 1, message = "job_urls must not be empty"))]
    pub job_urls: Vec<String>,
    #[serde(default)]
    pub tailor_resume: Option<Vec<bool>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSubmission {
    pub batch_id: String,
    pub job_slots: Vec<SubmittedSlot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedSlot {
    pub job_id: String,
    pub status: SlotState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatusView {
    pub job_id: String,
    pub job_url: String,
    pub status: SlotState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_viewer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub status: BatchStatus,
    pub total: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub ready_for_review: usize,
    pub failed: usize,
    pub slots: Vec<SlotStatusView>,
}

/// # NDOC
/// component: `orchestration::batch`
/// purpose: Owner of all live batches and their processing tasks.
/// invariants:
///   - Slot counts always sum to the total at every observation.
///   - Jobs inside a batch run strictly sequentially.
pub struct BatchScheduler {
    runtime: Runtime,
    batches: Arc<Mutex<HashMap<String, Batch>>>,
}

impl BatchScheduler {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            batches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn submit(&self, identity: &AuthIdentity, request: BatchRequest) -> EngineResult<BatchSubmission> {
        request
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;
        ensure_range_usize(
            request.job_urls.len(),
            1,
            self.runtime.config.max_batch_urls,
            "job_urls.len",
        )?;
        for url in &request.job_urls {
            ensure_http_url(url, "job_url")?;
        }

        let decision = self.runtime.limiter.check_identity(
            LIMIT_APPLICATIONS_PER_USER_PER_DAY,
            &identity.user_id,
            identity,
        );
        if !decision.allowed {
            return Err(EngineError::admission("daily application budget exhausted")
                .with_details(json!({
                    "limit": decision.limit,
                    "retry_after_seconds": decision.retry_after_seconds,
                    "reset_at": decision.reset_at.to_rfc3339(),
                })));
        }
        if !self.runtime.limiter.is_bypassed(identity) {
            let _ = self.runtime.limiter.consume(
                LIMIT_APPLICATIONS_PER_USER_PER_DAY,
                &identity.user_id,
                request.job_urls.len() as u64,
            );
        }

        let batch_id = new_id("batch");
        let slots: Vec<JobSlot> = request
            .job_urls
            .iter()
            .map(|url| JobSlot::new(new_id("job"), url.clone()))
            .collect();
        let submission = BatchSubmission {
            batch_id: batch_id.clone(),
            job_slots: slots
                .iter()
                .map(|s| SubmittedSlot {
                    job_id: s.job_id.clone(),
                    status: s.state,
                })
                .collect(),
        };
        let batch = Batch {
            batch_id: batch_id.clone(),
            user_id: identity.user_id.clone(),
            status: BatchStatus::Queued,
            slots,
            created_at: Utc::now(),
        };
        self.batches
            .lock()
            .expect("batch map poisoned")
            .insert(batch_id.clone(), batch);

        let runtime = self.runtime.clone();
        let batches = Arc::clone(&self.batches);
        let user_id = identity.user_id.clone();
        tokio::spawn(async move {
            Self::process_batch(runtime, batches, batch_id, user_id).await;
        });

        Ok(submission)
    }

    async fn process_batch(
        runtime: Runtime,
        batches: Arc<Mutex<HashMap<String, Batch>>>,
        batch_id: String,
        user_id: String,
    ) {
        let slot_ids: Vec<(String, String)> = {
            let mut map = batches.lock().expect("batch map poisoned");
            let Some(batch) = map.get_mut(&batch_id) else {
                return;
            };
            batch.status = BatchStatus::Running;
            batch
                .slots
                .iter()
                .map(|s| (s.job_id.clone(), s.job_url.clone()))
                .collect()
        };

        let orchestrator = SessionOrchestrator::new(runtime);
        for (index, (job_id, job_url)) in slot_ids.iter().enumerate() {
            {
                let mut map = batches.lock().expect("batch map poisoned");
                let Some(batch) = map.get_mut(&batch_id) else {
                    return;
                };
                if batch.status == BatchStatus::Closed {
                    return;
                }
                if let Some(slot) = batch.slot_mut(job_id) {
                    slot.set_state(SlotState::InProgress);
                    slot.push_log(
                        "info",
                        format!("starting job {}/{}", index + 1, slot_ids.len()),
                    );
                }
            }

            let batches_for_progress = Arc::clone(&batches);
            let progress_batch = batch_id.clone();
            let progress_job = job_id.clone();
            let mut progress = move |percent: u8, message: &str| {
                let mut map = batches_for_progress.lock().expect("batch map poisoned");
                if let Some(batch) = map.get_mut(&progress_batch) {
                    if let Some(slot) = batch.slot_mut(&progress_job) {
                        slot.progress_percent = percent;
                        slot.push_log("info", message);
                    }
                }
            };

            let outcome = orchestrator
                .run_job(&user_id, job_id, job_url, &mut progress)
                .await;

            let mut map = batches.lock().expect("batch map poisoned");
            let Some(batch) = map.get_mut(&batch_id) else {
                return;
            };
            let Some(slot) = batch.slot_mut(job_id) else {
                continue;
            };
            match outcome {
                SessionOutcome::Submitted => {
                    slot.set_state(SlotState::Completed);
                    slot.push_log("success", "application submitted");
                }
                SessionOutcome::ReadyForReview { viewer_url, reason } => {
                    slot.viewer_url = Some(viewer_url);
                    slot.set_state(SlotState::ReadyForReview);
                    slot.push_log("warning", format!("handed off for review: {reason}"));
                }
                SessionOutcome::Failed { reason } => {
                    slot.error = Some(reason.clone());
                    slot.set_state(SlotState::Failed);
                    slot.push_log("error", format!("job failed: {reason}"));
                }
            }
        }

        let mut map = batches.lock().expect("batch map poisoned");
        if let Some(batch) = map.get_mut(&batch_id) {
            if batch.status != BatchStatus::Closed {
                batch.status = BatchStatus::Completed;
            }
        }
    }

    pub fn status(&self, identity: &AuthIdentity, batch_id: &str) -> EngineResult<BatchStatusView> {
        let map = self.batches.lock().expect("batch map poisoned");
        let batch = Self::owned_batch(&map, identity, batch_id)?;
        let counts = batch.counts();
        Ok(BatchStatusView {
            status: batch.status,
            total: counts.total,
            queued: counts.queued,
            in_progress: counts.in_progress,
            completed: counts.completed,
            ready_for_review: counts.ready_for_review,
            failed: counts.failed,
            slots: batch
                .slots
                .iter()
                .map(|s| SlotStatusView {
                    job_id: s.job_id.clone(),
                    job_url: s.job_url.clone(),
                    status: s.state,
                    progress: s.progress_percent,
                    vnc_viewer_url: s.viewer_url.clone(),
                    error: s.error.clone(),
                })
                .collect(),
        })
    }

    /// The user finished a reviewed slot manually; its VNC session closes.
    pub async fn mark_slot_submitted(
        &self,
        identity: &AuthIdentity,
        batch_id: &str,
        job_id: &str,
    ) -> EngineResult<()> {
        let viewer_url = {
            let mut map = self.batches.lock().expect("batch map poisoned");
            Self::owned_batch(&map, identity, batch_id)?;
            let batch = map.get_mut(batch_id).expect("batch just checked");
            let slot = batch
                .slot_mut(job_id)
                .ok_or_else(|| EngineError::validation(format!("unknown job '{job_id}'")))?;
            if slot.state != SlotState::ReadyForReview {
                return Err(EngineError::validation(format!(
                    "job '{job_id}' is not awaiting review"
                )));
            }
            slot.set_state(SlotState::Completed);
            slot.push_log("success", "user confirmed manual submission");
            slot.viewer_url.take()
        };
        if let Some(viewer_url) = viewer_url {
            if let Some(session_id) = session_id_from_viewer_url(&viewer_url) {
                let _ = self.runtime.fleet.close_session(&session_id).await;
            }
        }
        Ok(())
    }

    /// Terminate every open VNC session of the batch and mark it closed.
    pub async fn close_batch(&self, identity: &AuthIdentity, batch_id: &str) -> EngineResult<()> {
        let open_viewers: Vec<String> = {
            let mut map = self.batches.lock().expect("batch map poisoned");
            Self::owned_batch(&map, identity, batch_id)?;
            let batch = map.get_mut(batch_id).expect("batch just checked");
            batch.status = BatchStatus::Closed;
            batch
                .slots
                .iter_mut()
                .filter_map(|slot| slot.viewer_url.take())
                .collect()
        };
        for viewer_url in open_viewers {
            if let Some(session_id) = session_id_from_viewer_url(&viewer_url) {
                let _ = self.runtime.fleet.close_session(&session_id).await;
            }
        }
        Ok(())
    }

    fn owned_batch<'a>(
        map: &'a HashMap<String, Batch>,
        identity: &AuthIdentity,
        batch_id: &str,
    ) -> EngineResult<&'a Batch> {
        let batch = map
            .get(batch_id)
            .ok_or_else(|| EngineError::validation(format!("unknown batch '{batch_id}'")))?;
        if batch.user_id != identity.user_id && !identity.admin {
            return Err(EngineError::new(
                crate::contracts::EngineErrorKind::ValidationError,
                "batch belongs to another user",
                false,
                None,
            ));
        }
        Ok(batch)
    }
}

fn new_id(prefix: &str) -> String {
    let noise: u64 = rand::thread_rng().gen();
    format!("{prefix}_{}_{noise:08x}", Utc::now().timestamp_millis())
}

fn session_id_from_viewer_url(viewer_url: &str) -> Option<String> {
    viewer_url
        .rsplit_once("/vnc-stream/")
        .map(|(_, id)| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::BrowserDriver;
    use crate::browser::mock::{self, ClickEffect, MockDriver};
    use crate::config::RuntimeConfig;
    use crate::contracts::EngineErrorKind;
    use crate::data_models::profile::ProfileView;
    use crate::data_models::session::VncSessionRecord;
    use crate::limits::{LlmQuota, RateLimiter};
    use crate::llm::{LlmRequest, LlmResponse, TextGenerator};
    use crate::orchestration::runtime::{DriverFactory, ProfileProvider, ResumeResolver};
    use crate::vnc::fleet::{FleetControl, FleetHandle};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubProfiles(ProfileView);

    #[async_trait]
    impl ProfileProvider for StubProfiles {
        async fn get_profile(&self, _user_id: &str) -> EngineResult<ProfileView> {
            Ok(self.0.clone())
        }
    }

    struct StubResumes;

    #[async_trait]
    impl ResumeResolver for StubResumes {
        async fn resolve(&self, _blob_ref: &str) -> EngineResult<(String, Vec<u8>)> {
            Ok(("resume.pdf".to_string(), b"%PDF-1.4".to_vec()))
        }
    }

    struct StubFleet {
        counter: AtomicU32,
        closed: Mutex<Vec<String>>,
    }

    impl StubFleet {
        fn new() -> Self {
            Self {
                counter: AtomicU32::new(0),
                closed: Mutex::new(Vec::new()),
            }
        }

        fn closed_sessions(&self) -> Vec<String> {
            self.closed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FleetControl for StubFleet {
        async fn create_session(
            &self,
            _user_id: &str,
            _job_url: &str,
            _resume: Option<(String, Vec<u8>)>,
        ) -> EngineResult<FleetHandle> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let session_id = format!("sess-{n}");
            Ok(FleetHandle {
                session_id: session_id.clone(),
                debug_port: 9222 + n as u16,
                viewer_url: format!("ws://localhost/vnc-stream/{session_id}"),
                resume_path: None,
            })
        }

        async fn close_session(&self, session_id: &str) -> EngineResult<()> {
            self.closed.lock().unwrap().push(session_id.to_string());
            Ok(())
        }

        async fn sessions_for_user(&self, _user_id: &str) -> Vec<VncSessionRecord> {
            Vec::new()
        }

        fn viewer_url(&self, session_id: &str) -> String {
            format!("ws://localhost/vnc-stream/{session_id}")
        }
    }

    struct SharedDriverFactory(Arc<MockDriver>);

    #[async_trait]
    impl DriverFactory for SharedDriverFactory {
        async fn connect(&self, _debug_port: u16) -> EngineResult<Arc<dyn BrowserDriver>> {
            Ok(Arc::clone(&self.0) as Arc<dyn BrowserDriver>)
        }
    }

    struct CountingGenerator(AtomicU32);

    #[async_trait]
    impl TextGenerator for CountingGenerator {
        async fn generate(&self, _request: LlmRequest) -> EngineResult<LlmResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::admission("no llm in tests"))
        }
    }

    struct Harness {
        scheduler: BatchScheduler,
        driver: Arc<MockDriver>,
        fleet: Arc<StubFleet>,
        generator: Arc<CountingGenerator>,
        _dir: tempfile::TempDir,
    }

    fn harness(profile: ProfileView) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RuntimeConfig {
            state_root: dir.path().join("state"),
            sandbox_root: dir.path().join("sessions"),
            settle_wait_ms: 0,
            ..RuntimeConfig::default()
        };
        let driver = Arc::new(MockDriver::new());
        let fleet = Arc::new(StubFleet::new());
        let generator = Arc::new(CountingGenerator(AtomicU32::new(0)));
        let limiter = Arc::new(
            RateLimiter::new(&config),
        );
        let runtime = Runtime {
            config: config.clone(),
            limiter,
            quota: Arc::new(LlmQuota::new(2)),
            gateway: Arc::clone(&generator) as Arc<dyn TextGenerator>,
            fleet: Arc::clone(&fleet) as Arc<dyn FleetControl>,
            profiles: Arc::new(StubProfiles(profile)),
            resumes: Arc::new(StubResumes),
            drivers: Arc::new(SharedDriverFactory(Arc::clone(&driver))),
        };
        Harness {
            scheduler: BatchScheduler::new(runtime),
            driver,
            fleet,
            generator,
            _dir: dir,
        }
    }

    fn jane() -> ProfileView {
        ProfileView::from_json(&json!({
            "first_name": "Jane",
            "last_name": "Doe",
            "email": "jane@x.io",
            "phone": "555-1234"
        }))
    }

    fn identity() -> AuthIdentity {
        AuthIdentity::new("u1", "jane@x.io")
    }

    fn contact_form_with_submit(driver: &Arc<MockDriver>) {
        driver.set_elements(vec![
            mock::text_input("first_name", "First Name"),
            mock::text_input("last_name", "Last Name"),
            mock::typed_input("email", "Email", "email"),
            mock::typed_input("phone", "Phone", "tel"),
        ]);
        driver.register_query(
            "button, [role='button'], a[role='button'], input[type='submit']",
            vec![mock::button("submit", "Submit Application")],
        );
        driver.on_click(
            "#submit",
            vec![ClickEffect::SetUrl(
                "https://jobs.example.com/apply/1/thanks".to_string(),
            )],
        );
    }

    async fn wait_terminal(scheduler: &BatchScheduler, batch_id: &str) -> BatchStatusView {
        for _ in 0..200 {
            let view = scheduler.status(&identity(), batch_id).expect("status");
            if matches!(view.status, BatchStatus::Completed | BatchStatus::Closed) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch never reached a terminal state");
    }

    #[tokio::test]
    async fn happy_path_batch_submits_with_zero_llm_calls() {
        let h = harness(jane());
        contact_form_with_submit(&h.driver);

        let submission = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: vec!["https://jobs.example.com/apply/1".to_string()],
                    tailor_resume: None,
                },
            )
            .expect("submit");
        let view = wait_terminal(&h.scheduler, &submission.batch_id).await;

        assert_eq!(view.completed, 1);
        assert_eq!(view.failed, 0);
        assert_eq!(view.slots[0].progress, 100);
        assert_eq!(h.generator.0.load(Ordering::SeqCst), 0);
        // The session was closed after submit.
        assert_eq!(h.fleet.closed_sessions(), vec!["sess-0".to_string()]);
        assert_eq!(
            h.driver.element_value("#first_name").as_deref(),
            Some("Jane")
        );
    }

    #[tokio::test]
    async fn sensitive_field_parks_slot_for_review_with_viewer_url() {
        let h = harness(jane());
        contact_form_with_submit(&h.driver);
        let mut ssn = mock::text_input("ssn", "Social Security Number");
        ssn.required = true;
        h.driver.add_element(ssn);

        let submission = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: vec!["https://jobs.example.com/apply/1".to_string()],
                    tailor_resume: None,
                },
            )
            .expect("submit");
        let view = wait_terminal(&h.scheduler, &submission.batch_id).await;

        assert_eq!(view.ready_for_review, 1);
        let slot = &view.slots[0];
        assert_eq!(
            slot.vnc_viewer_url.as_deref(),
            Some("ws://localhost/vnc-stream/sess-0")
        );
        // The review session stays alive.
        assert!(h.fleet.closed_sessions().is_empty());
        // Everything else was still filled; the held field was not touched.
        assert_eq!(h.driver.element_value("#email").as_deref(), Some("jane@x.io"));
        assert_eq!(h.driver.element_value("#ssn").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn mark_slot_submitted_completes_and_closes_the_session() {
        let h = harness(jane());
        contact_form_with_submit(&h.driver);
        h.driver.add_element(mock::text_input("ssn", "Social Security Number"));

        let submission = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: vec!["https://jobs.example.com/apply/1".to_string()],
                    tailor_resume: None,
                },
            )
            .expect("submit");
        let view = wait_terminal(&h.scheduler, &submission.batch_id).await;
        let job_id = view.slots[0].job_id.clone();
        assert_eq!(view.ready_for_review, 1);

        h.scheduler
            .mark_slot_submitted(&identity(), &submission.batch_id, &job_id)
            .await
            .expect("mark submitted");
        let after = h.scheduler.status(&identity(), &submission.batch_id).expect("status");
        assert_eq!(after.completed, 1);
        assert_eq!(after.ready_for_review, 0);
        assert_eq!(h.fleet.closed_sessions(), vec!["sess-0".to_string()]);
    }

    #[tokio::test]
    async fn counts_always_sum_to_total_while_running() {
        let h = harness(jane());
        contact_form_with_submit(&h.driver);
        let submission = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: vec![
                        "https://jobs.example.com/apply/1".to_string(),
                        "https://jobs.example.com/apply/2".to_string(),
                    ],
                    tailor_resume: None,
                },
            )
            .expect("submit");

        for _ in 0..50 {
            let view = h
                .scheduler
                .status(&identity(), &submission.batch_id)
                .expect("status");
            assert_eq!(
                view.total,
                view.queued + view.in_progress + view.completed + view.ready_for_review + view.failed
            );
            if view.status == BatchStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_validation_error() {
        let h = harness(jane());
        let err = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: Vec::new(),
                    tailor_resume: None,
                },
            )
            .expect_err("must fail");
        assert_eq!(err.kind, EngineErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let h = harness(jane());
        let urls: Vec<String> = (0..11)
            .map(|i| format!("https://jobs.example.com/apply/{i}"))
            .collect();
        let err = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: urls,
                    tailor_resume: None,
                },
            )
            .expect_err("must fail");
        assert_eq!(err.kind, EngineErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn foreign_batch_access_is_rejected() {
        let h = harness(jane());
        contact_form_with_submit(&h.driver);
        let submission = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: vec!["https://jobs.example.com/apply/1".to_string()],
                    tailor_resume: None,
                },
            )
            .expect("submit");

        let stranger = AuthIdentity::new("u2", "other@x.io");
        assert!(h.scheduler.status(&stranger, &submission.batch_id).is_err());

        let mut admin = AuthIdentity::new("ops", "ops@x.io");
        admin.admin = true;
        assert!(h.scheduler.status(&admin, &submission.batch_id).is_ok());
    }

    #[tokio::test]
    async fn close_batch_terminates_open_review_sessions() {
        let h = harness(jane());
        contact_form_with_submit(&h.driver);
        h.driver.add_element(mock::text_input("ssn", "Social Security Number"));

        let submission = h
            .scheduler
            .submit(
                &identity(),
                BatchRequest {
                    job_urls: vec!["https://jobs.example.com/apply/1".to_string()],
                    tailor_resume: None,
                },
            )
            .expect("submit");
        wait_terminal(&h.scheduler, &submission.batch_id).await;

        h.scheduler
            .close_batch(&identity(), &submission.batch_id)
            .await
            .expect("close");
        assert_eq!(h.fleet.closed_sessions(), vec!["sess-0".to_string()]);
        let view = h
            .scheduler
            .status(&identity(), &submission.batch_id)
            .expect("status");
        assert_eq!(view.status, BatchStatus::Closed);
    }
}
