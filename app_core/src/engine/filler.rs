//! The per-navigation fill loop.
//!
//! Ordering is load-bearing: pattern matching is free and precise, keyword
//! fast-mapping is free and broad, option extraction mutates third-party
//! DOM and is deferred until a field survives to the AI pass, and model
//! calls are quota-governed and come last. The completion tracker elides
//! anything already done; the section expander runs between passes; the
//! loop stops when an iteration produces nothing new or the pass budget
//! runs out.

use crate::contracts::EngineResult;
use crate::data_models::field::{FieldDescriptor, Mapping, ResolvedValue};
use crate::data_models::profile::ProfileView;
use crate::engine::ai_mapper::AiMapper;
use crate::engine::completion::{AttemptStatus, CompletionTracker};
use crate::engine::detector::FieldDetector;
use crate::engine::expander::SectionExpander;
use crate::engine::fast_mapper::FastMapper;
use crate::engine::interactor::FieldInteractor;
use crate::engine::sensitive::SensitiveFieldDetector;
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct FillerConfig {
    pub max_passes: u32,
    pub llm_calls_per_job: u32,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            max_passes: 4,
            llm_calls_per_job: 12,
        }
    }
}

/// What one navigation's fill loop accomplished.
#[derive(Debug, Default)]
pub struct FillReport {
    pub passes: u32,
    pub filled: u32,
    pub llm_calls: u32,
    pub ai_deferred: bool,
    /// Stable ids held by the sensitive detector.
    pub sensitive_held: Vec<String>,
    /// Required fields that failed after all retries.
    pub failed_required: Vec<String>,
    /// Required fields still empty when the loop ended.
    pub unresolved_required: Vec<String>,
}

impl FillReport {
    /// The orchestrator parks the session for review when this is true.
    pub fn needs_review(&self) -> bool {
        !self.sensitive_held.is_empty()
            || !self.failed_required.is_empty()
            || !self.unresolved_required.is_empty()
    }
}

/// # NDOC
/// component: `engine::filler`
/// purpose: Run detection → classification → mapping → interaction passes
///          until quiescent.
/// invariants:
///   - A sensitive field never enters any mapping handed to the interactor.
///   - No field marked succeeded is attempted again in this navigation.
///   - Option extraction only runs for fields that survived the fast passes.
pub struct FormFillerOrchestrator {
    detector: FieldDetector,
    fast_mapper: FastMapper,
    ai_mapper: AiMapper,
    interactor: FieldInteractor,
    sensitive: SensitiveFieldDetector,
    expander: SectionExpander,
    config: FillerConfig,
}

impl FormFillerOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detector: FieldDetector,
        fast_mapper: FastMapper,
        ai_mapper: AiMapper,
        interactor: FieldInteractor,
        sensitive: SensitiveFieldDetector,
        expander: SectionExpander,
        config: FillerConfig,
    ) -> Self {
        Self {
            detector,
            fast_mapper,
            ai_mapper,
            interactor,
            sensitive,
            expander,
            config,
        }
    }

    pub async fn run(
        &self,
        user_id: &str,
        profile: &ProfileView,
        resume_path: Option<&Path>,
        tracker: &mut CompletionTracker,
        job_context: Option<&str>,
    ) -> EngineResult<FillReport> {
        // One fingerprint per navigation; section expansion must not reset
        // completion state mid-run.
        let fingerprint = self.detector.page_fingerprint().await?;
        let mut report = FillReport::default();
        let mut held: BTreeSet<String> = BTreeSet::new();

        for pass in 1..=self.config.max_passes {
            report.passes = pass;
            let mut new_fills = 0u32;

            let descriptors = self.detector.scan().await?;
            // Full page view: section ordinals must count closed fields too.
            let page_descriptors = descriptors.clone();
            let mut open: Vec<FieldDescriptor> = Vec::new();
            for descriptor in descriptors {
                if let Some(reason) = self.sensitive.is_sensitive(&descriptor, profile) {
                    if held.insert(descriptor.stable_id.clone()) {
                        log::info!(
                            stable_id = descriptor.stable_id.as_str(),
                            rule = reason.as_str();
                            "field held as sensitive"
                        );
                        tracker.record(
                            &fingerprint,
                            &descriptor.stable_id,
                            AttemptStatus::Skipped,
                            None,
                        );
                    }
                    continue;
                }
                if tracker.is_closed(&fingerprint, &descriptor.stable_id) {
                    continue;
                }
                if descriptor.filled && tracker.status(&fingerprint, &descriptor.stable_id).is_none()
                {
                    // The site pre-filled it; leave it alone.
                    tracker.record(
                        &fingerprint,
                        &descriptor.stable_id,
                        AttemptStatus::Skipped,
                        Some("already_filled".to_string()),
                    );
                    continue;
                }
                open.push(descriptor);
            }

            let all_open = open.clone();
            let pattern_result = self.fast_mapper.pattern_pass(open, profile);
            new_fills += self
                .apply_mapping(&fingerprint, &pattern_result.mapping, &all_open, tracker, resume_path)
                .await;

            let batch_result = self.fast_mapper.batch_pass(pattern_result.remaining, profile);
            new_fills += self
                .apply_mapping(&fingerprint, &batch_result.mapping, &all_open, tracker, resume_path)
                .await;

            let section_result =
                self.fast_mapper
                    .section_pass(batch_result.remaining, &page_descriptors, profile);
            new_fills += self
                .apply_mapping(&fingerprint, &section_result.mapping, &all_open, tracker, resume_path)
                .await;

            // Only now, and only for still-open fields: expensive popup reads.
            let mut remaining = section_result.remaining;
            self.detector.extract_options(&mut remaining).await?;

            let calls_left = self
                .config
                .llm_calls_per_job
                .saturating_sub(report.llm_calls);
            let ai_outcome = self
                .ai_mapper
                .map_fields(user_id, profile, &remaining, job_context, calls_left)
                .await;
            report.llm_calls += ai_outcome.llm_calls;
            report.ai_deferred |= ai_outcome.deferred;
            new_fills += self
                .apply_mapping(&fingerprint, &ai_outcome.mapping, &remaining, tracker, resume_path)
                .await;

            let expansion_clicks = self.expander.expand_if_needed(profile).await?;
            if expansion_clicks == 0 && new_fills == 0 {
                break;
            }
            report.filled += new_fills;
        }

        report.sensitive_held = held.into_iter().collect();
        self.collect_unresolved(&fingerprint, tracker, &mut report).await?;
        Ok(report)
    }

    async fn apply_mapping(
        &self,
        fingerprint: &str,
        mapping: &Mapping,
        descriptors: &[FieldDescriptor],
        tracker: &mut CompletionTracker,
        resume_path: Option<&Path>,
    ) -> u32 {
        let mut filled = 0;
        for (stable_id, value) in mapping {
            let Some(descriptor) = descriptors.iter().find(|d| d.stable_id == *stable_id) else {
                continue;
            };
            if tracker.is_closed(fingerprint, stable_id) {
                continue;
            }
            if let ResolvedValue::Skip(reason) = value {
                tracker.record(
                    fingerprint,
                    stable_id,
                    AttemptStatus::Skipped,
                    Some(reason.clone()),
                );
                continue;
            }
            let outcome = self.interactor.apply(descriptor, value, resume_path).await;
            let status = if outcome.success {
                filled += 1;
                AttemptStatus::Succeeded
            } else {
                AttemptStatus::Failed
            };
            tracker.record(
                fingerprint,
                stable_id,
                status,
                value.intended_text().map(str::to_string),
            );
        }
        filled
    }

    async fn collect_unresolved(
        &self,
        fingerprint: &str,
        tracker: &CompletionTracker,
        report: &mut FillReport,
    ) -> EngineResult<()> {
        let descriptors = self.detector.scan().await?;
        for descriptor in descriptors {
            if !descriptor.required || descriptor.filled {
                continue;
            }
            if report.sensitive_held.contains(&descriptor.stable_id) {
                continue;
            }
            match tracker.status(fingerprint, &descriptor.stable_id) {
                Some(record) if record.last_status == AttemptStatus::Failed => {
                    report.failed_required.push(descriptor.stable_id);
                }
                Some(record) if record.last_status == AttemptStatus::Succeeded => {}
                _ => report.unresolved_required.push(descriptor.stable_id),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::BrowserDriver;
    use crate::browser::mock::{self, MockDriver};
    use crate::contracts::{EngineError, EngineResult as CoreResult};
    use crate::engine::interactor::InteractorConfig;
    use crate::engine::recorder::ActionRecorder;
    use crate::llm::{LlmRequest, LlmResponse, TextGenerator};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingGenerator {
        calls: AtomicU32,
        response: Option<String>,
    }

    impl CountingGenerator {
        fn refusing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                response: None,
            }
        }

        fn admission_denied() -> Self {
            Self::refusing()
        }

        fn count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for CountingGenerator {
        async fn generate(&self, _request: LlmRequest) -> CoreResult<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Some(text) => Ok(LlmResponse { text: text.clone() }),
                None => Err(EngineError::admission("llm budget exhausted")),
            }
        }
    }

    struct Fixture {
        driver: Arc<MockDriver>,
        filler: FormFillerOrchestrator,
        generator: Arc<CountingGenerator>,
        _dir: tempfile::TempDir,
    }

    fn fixture(generator: CountingGenerator) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let driver = Arc::new(MockDriver::new());
        let dyn_driver = Arc::clone(&driver) as Arc<dyn BrowserDriver>;
        let recorder = Arc::new(ActionRecorder::new(dir.path(), "u1", "j1", 24));
        let generator = Arc::new(generator);

        let filler = FormFillerOrchestrator::new(
            FieldDetector::new(Arc::clone(&dyn_driver), 0),
            FastMapper::new(0.8, 10),
            AiMapper::new(
                Arc::clone(&generator) as Arc<dyn TextGenerator>,
                0.8,
            ),
            FieldInteractor::new(
                Arc::clone(&dyn_driver),
                recorder,
                InteractorConfig {
                    settle_wait_ms: 0,
                    ..InteractorConfig::default()
                },
            ),
            SensitiveFieldDetector::new(),
            SectionExpander::new(Arc::clone(&dyn_driver), 0),
            FillerConfig::default(),
        );
        Fixture {
            driver,
            filler,
            generator,
            _dir: dir,
        }
    }

    fn jane_profile() -> ProfileView {
        ProfileView::from_json(&json!({
            "first_name": "Jane",
            "last_name": "Doe",
            "email": "jane@x.io",
            "phone": "555-1234"
        }))
    }

    fn contact_form() -> Vec<crate::browser::driver::RawElement> {
        vec![
            mock::text_input("first_name", "First Name"),
            mock::text_input("last_name", "Last Name"),
            mock::typed_input("email", "Email", "email"),
            mock::typed_input("phone", "Phone", "tel"),
        ]
    }

    #[tokio::test]
    async fn pure_text_happy_path_uses_zero_llm_calls() {
        let fx = fixture(CountingGenerator::refusing());
        fx.driver.set_elements(contact_form());
        let mut tracker = CompletionTracker::new(3);

        let report = fx
            .filler
            .run("u1", &jane_profile(), None, &mut tracker, None)
            .await
            .expect("run");

        assert_eq!(report.filled, 4);
        assert_eq!(report.llm_calls, 0);
        assert_eq!(fx.generator.count(), 0);
        assert!(!report.needs_review());
        assert_eq!(
            fx.driver.element_value("#first_name").as_deref(),
            Some("Jane")
        );
        assert_eq!(fx.driver.element_value("#email").as_deref(), Some("jane@x.io"));
    }

    #[tokio::test]
    async fn second_run_is_a_no_op_through_the_tracker() {
        let fx = fixture(CountingGenerator::refusing());
        fx.driver.set_elements(contact_form());
        let mut tracker = CompletionTracker::new(3);

        let first = fx
            .filler
            .run("u1", &jane_profile(), None, &mut tracker, None)
            .await
            .expect("run");
        assert_eq!(first.filled, 4);
        let fills_after_first = fx
            .driver
            .actions()
            .iter()
            .filter(|a| a.starts_with("fill "))
            .count();

        let second = fx
            .filler
            .run("u1", &jane_profile(), None, &mut tracker, None)
            .await
            .expect("run");
        assert_eq!(second.filled, 0);
        let fills_after_second = fx
            .driver
            .actions()
            .iter()
            .filter(|a| a.starts_with("fill "))
            .count();
        assert_eq!(fills_after_first, fills_after_second);
    }

    #[tokio::test]
    async fn sensitive_field_is_held_and_everything_else_fills() {
        let fx = fixture(CountingGenerator::refusing());
        let mut elements = contact_form();
        let mut ssn = mock::text_input("ssn", "Social Security Number");
        ssn.required = true;
        elements.push(ssn);
        fx.driver.set_elements(elements);
        let mut tracker = CompletionTracker::new(3);

        let report = fx
            .filler
            .run("u1", &jane_profile(), None, &mut tracker, None)
            .await
            .expect("run");

        assert_eq!(report.filled, 4);
        assert_eq!(report.sensitive_held, vec!["id:ssn".to_string()]);
        assert!(report.needs_review());
        // No attempt against the held field was recorded.
        assert!(!fx.driver.actions().iter().any(|a| a.contains("#ssn")));
    }

    #[tokio::test]
    async fn required_field_without_data_parks_for_review() {
        let fx = fixture(CountingGenerator::admission_denied());
        let mut unknown = mock::text_input("favorite_quote", "Favorite quote");
        unknown.required = true;
        fx.driver.set_elements(vec![unknown]);
        let mut tracker = CompletionTracker::new(3);

        let report = fx
            .filler
            .run("u1", &jane_profile(), None, &mut tracker, None)
            .await
            .expect("run");

        assert!(report.ai_deferred);
        assert_eq!(report.unresolved_required, vec!["id:favorite_quote".to_string()]);
        assert!(report.needs_review());
    }

    fn section_box(sel: &str) -> crate::browser::driver::RawElement {
        crate::browser::driver::RawElement {
            selector: sel.to_string(),
            tag: "fieldset".to_string(),
            visible: true,
            ..Default::default()
        }
    }

    fn reveal_sections(key: &str, selectors: &[&str]) -> crate::browser::mock::ClickEffect {
        crate::browser::mock::ClickEffect::Reveal(
            key.to_string(),
            selectors.iter().map(|sel| section_box(sel)).collect(),
        )
    }

    fn append_school(id: &str) -> crate::browser::mock::ClickEffect {
        crate::browser::mock::ClickEffect::AppendElements(vec![mock::text_input(id, "School")])
    }

    #[tokio::test]
    async fn education_expansion_clicks_once_per_pass_and_fills_each_entry() {
        let fx = fixture(CountingGenerator::refusing());
        fx.driver.set_elements(vec![mock::text_input("school_1", "School")]);

        let education_selector = crate::engine::expander::education_container_selector();
        fx.driver
            .register_query(&education_selector, vec![section_box("#edu1")]);
        fx.driver.register_query(
            "button, [role='button'], a[role='button']",
            vec![mock::button("add_edu", "Add Education")],
        );
        // First click reveals a second section, second click a third.
        fx.driver.on_click(
            "#add_edu",
            vec![
                reveal_sections(&education_selector, &["#edu1", "#edu2"]),
                append_school("school_2"),
            ],
        );
        fx.driver.on_click(
            "#add_edu",
            vec![
                reveal_sections(&education_selector, &["#edu1", "#edu2", "#edu3"]),
                append_school("school_3"),
            ],
        );

        let profile = ProfileView::from_json(&json!({
            "education": [
                {"school": "UW"}, {"school": "MIT"}, {"school": "Stanford"}
            ]
        }));
        let mut tracker = CompletionTracker::new(3);
        let report = fx
            .filler
            .run("u1", &profile, None, &mut tracker, None)
            .await
            .expect("run");

        let add_clicks = fx
            .driver
            .actions()
            .iter()
            .filter(|a| *a == "click #add_edu")
            .count();
        assert_eq!(add_clicks, 2);
        assert!(report.passes >= 3);
        assert_eq!(fx.driver.element_value("#school_1").as_deref(), Some("UW"));
        assert_eq!(fx.driver.element_value("#school_2").as_deref(), Some("MIT"));
        assert_eq!(
            fx.driver.element_value("#school_3").as_deref(),
            Some("Stanford")
        );
    }
}
