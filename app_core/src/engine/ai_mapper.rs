//! Model-mediated mapping for fields the deterministic passes left open.
//!
//! Three batches per page pass, one gateway call each: simple text,
//! dropdown selection, and check decisions. Prose generation for essay
//! textareas runs one bounded call per field. Every call is gated by the
//! gateway's admission and quota; an admission denial defers the rest of
//! the AI work for this pass instead of erroring the session.

use crate::contracts::EngineErrorKind;
use crate::data_models::field::{FieldCategory, FieldDescriptor, Mapping, ResolvedValue};
use crate::data_models::profile::ProfileView;
use crate::engine::fast_mapper::FastMapper;
use crate::llm::{LlmRequest, TextGenerator};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const MAX_SIMPLE_VALUE_CHARS: usize = 500;
const MAX_PROSE_CHARS: usize = 2_000;

/// Outcome of the AI pass for one page pass.
#[derive(Debug, Default)]
pub struct AiMapOutcome {
    pub mapping: Mapping,
    pub llm_calls: u32,
    /// True when the quota denied admission and remaining batches were
    /// deferred to a later pass.
    pub deferred: bool,
}

#[derive(Debug, Deserialize)]
struct CheckAnswer {
    decision: bool,
    #[serde(default)]
    reason: String,
}

/// # NDOC
/// component: `engine::ai_mapper`
/// purpose: Batched model mapping over unresolved descriptors.
/// invariants:
///   - Only descriptors that survived C5 reach here; sensitive fields never do.
///   - Dropdown answers are validated against the extracted options.
///   - Generated prose carries no placeholder tokens.
pub struct AiMapper {
    generator: Arc<dyn TextGenerator>,
    option_matcher: FastMapper,
}

impl AiMapper {
    pub fn new(generator: Arc<dyn TextGenerator>, similarity_threshold: f64) -> Self {
        Self {
            generator,
            option_matcher: FastMapper::new(similarity_threshold, usize::MAX),
        }
    }

    pub async fn map_fields(
        &self,
        user_id: &str,
        profile: &ProfileView,
        descriptors: &[FieldDescriptor],
        job_context: Option<&str>,
        calls_available: u32,
    ) -> AiMapOutcome {
        let mut outcome = AiMapOutcome::default();

        let mut simple = Vec::new();
        let mut prose = Vec::new();
        let mut dropdowns = Vec::new();
        let mut checks = Vec::new();
        for descriptor in descriptors {
            if descriptor.category == FieldCategory::Textarea && wants_prose(&descriptor.label) {
                prose.push(descriptor);
            } else if descriptor.category.is_text_like() {
                simple.push(descriptor);
            } else if descriptor.category.is_dropdown_like() && !descriptor.options.is_empty() {
                dropdowns.push(descriptor);
            } else if descriptor.category.is_checkable() {
                checks.push(descriptor);
            }
        }

        if !simple.is_empty() && outcome.llm_calls < calls_available {
            if self
                .run_simple_batch(user_id, profile, &simple, &mut outcome)
                .await
            {
                return outcome;
            }
        }
        if !dropdowns.is_empty() && outcome.llm_calls < calls_available {
            if self
                .run_dropdown_batch(user_id, profile, &dropdowns, &mut outcome)
                .await
            {
                return outcome;
            }
        }
        if !checks.is_empty() && outcome.llm_calls < calls_available {
            if self
                .run_check_batch(user_id, profile, &checks, &mut outcome)
                .await
            {
                return outcome;
            }
        }
        for descriptor in prose {
            if outcome.llm_calls >= calls_available {
                break;
            }
            if self
                .run_prose_generation(user_id, profile, descriptor, job_context, &mut outcome)
                .await
            {
                return outcome;
            }
        }
        outcome
    }

    /// Returns true when the pass should stop (admission deferred).
    async fn run_simple_batch(
        &self,
        user_id: &str,
        profile: &ProfileView,
        fields: &[&FieldDescriptor],
        outcome: &mut AiMapOutcome,
    ) -> bool {
        let field_lines: Vec<_> = fields
            .iter()
            .map(|d| {
                json!({
                    "id": d.stable_id,
                    "label": d.label,
                    "placeholder": d.placeholder,
                })
            })
            .collect();
        let prompt = format!(
            "You map a job applicant's profile onto form fields.\n\
             Profile:\n{}\n\nFields (JSON): {}\n\n\
             Return one JSON object mapping each field id to the value to type, \
             or null when the profile has no answer. Use only information from \
             the profile. Never guess protected or sensitive attributes. \
             Return JSON only.",
            profile.summary_for_prompt(),
            serde_json::Value::Array(field_lines),
        );
        let request = LlmRequest::new("simple_text_batch", prompt, user_id)
            .with_schema(json!({"type": "object"}));

        match self.generator.generate(request).await {
            Ok(response) => {
                outcome.llm_calls += 1;
                if let Some(parsed) =
                    parse_json_response::<HashMap<String, Option<String>>>(&response.text)
                {
                    for (id, value) in parsed {
                        let Some(value) = value else { continue };
                        let value = value.trim().to_string();
                        if value.is_empty() || value.len() > MAX_SIMPLE_VALUE_CHARS {
                            continue;
                        }
                        if fields.iter().any(|d| d.stable_id == id) {
                            outcome.mapping.insert(id, ResolvedValue::Simple(value));
                        }
                    }
                }
                false
            }
            Err(err) => self.note_batch_error("simple_text_batch", err, outcome),
        }
    }

    async fn run_dropdown_batch(
        &self,
        user_id: &str,
        profile: &ProfileView,
        fields: &[&FieldDescriptor],
        outcome: &mut AiMapOutcome,
    ) -> bool {
        let field_lines: Vec<_> = fields
            .iter()
            .map(|d| {
                json!({
                    "id": d.stable_id,
                    "label": d.label,
                    "options": d.option_texts(),
                    "profile_candidates": self.option_matcher.dropdown_candidates(d, profile),
                })
            })
            .collect();
        let prompt = format!(
            "You pick dropdown options for a job application.\n\
             Profile:\n{}\n\nDropdowns (JSON): {}\n\n\
             Return one JSON object mapping each field id to the exact displayed \
             text of the best option, or null when no option fits the profile. \
             Never pick an option that asserts a protected attribute the profile \
             does not state. Return JSON only.",
            profile.summary_for_prompt(),
            serde_json::Value::Array(field_lines),
        );
        let request = LlmRequest::new("dropdown_batch", prompt, user_id)
            .with_schema(json!({"type": "object"}));

        match self.generator.generate(request).await {
            Ok(response) => {
                outcome.llm_calls += 1;
                if let Some(parsed) =
                    parse_json_response::<HashMap<String, Option<String>>>(&response.text)
                {
                    for (id, answer) in parsed {
                        let Some(answer) = answer else { continue };
                        let Some(descriptor) = fields.iter().find(|d| d.stable_id == id) else {
                            continue;
                        };
                        // The model's pick must resolve to a real option.
                        if let Some(option_text) =
                            self.option_matcher.match_option(descriptor, &answer)
                        {
                            outcome
                                .mapping
                                .insert(id, ResolvedValue::Selection(option_text));
                        }
                    }
                }
                false
            }
            Err(err) => self.note_batch_error("dropdown_batch", err, outcome),
        }
    }

    async fn run_check_batch(
        &self,
        user_id: &str,
        profile: &ProfileView,
        fields: &[&FieldDescriptor],
        outcome: &mut AiMapOutcome,
    ) -> bool {
        let field_lines: Vec<_> = fields
            .iter()
            .map(|d| json!({"id": d.stable_id, "label": d.label}))
            .collect();
        let prompt = format!(
            "You decide checkboxes and radio options for a job application.\n\
             Profile:\n{}\n\nFields (JSON): {}\n\n\
             Return one JSON object mapping each field id to \
             {{\"decision\": true|false, \"reason\": \"short reason\"}}. \
             Decide only from the profile; when the profile does not answer the \
             question, return false with reason \"no profile data\". Never infer \
             disability, veteran status, ethnicity, or other protected \
             attributes. Return JSON only.",
            profile.summary_for_prompt(),
            serde_json::Value::Array(field_lines),
        );
        let request =
            LlmRequest::new("check_batch", prompt, user_id).with_schema(json!({"type": "object"}));

        match self.generator.generate(request).await {
            Ok(response) => {
                outcome.llm_calls += 1;
                if let Some(parsed) =
                    parse_json_response::<HashMap<String, CheckAnswer>>(&response.text)
                {
                    for (id, answer) in parsed {
                        if !fields.iter().any(|d| d.stable_id == id) {
                            continue;
                        }
                        if answer.decision {
                            outcome.mapping.insert(
                                id,
                                ResolvedValue::CheckDecision(true, answer.reason),
                            );
                        }
                    }
                }
                false
            }
            Err(err) => self.note_batch_error("check_batch", err, outcome),
        }
    }

    async fn run_prose_generation(
        &self,
        user_id: &str,
        profile: &ProfileView,
        descriptor: &FieldDescriptor,
        job_context: Option<&str>,
        outcome: &mut AiMapOutcome,
    ) -> bool {
        let mut prompt = format!(
            "Write the applicant's answer for the application question below.\n\
             Question: {}\n\nApplicant profile:\n{}\n",
            descriptor.label,
            profile.summary_for_prompt(),
        );
        if let Some(context) = job_context {
            prompt.push_str(&format!("\nJob description:\n{context}\n"));
        }
        prompt.push_str(
            "\nConstraints: first person, ready to submit as-is, at most 180 \
             words, no bracketed placeholders, no assumptions beyond the \
             profile. Return the answer text only.",
        );
        let request = LlmRequest::new("prose_generation", prompt, user_id)
            .with_max_output_tokens(512);

        match self.generator.generate(request).await {
            Ok(response) => {
                outcome.llm_calls += 1;
                let text = response.text.trim().to_string();
                let resolved = if prose_is_submittable(&text) {
                    ResolvedValue::Generated(text)
                } else {
                    ResolvedValue::Skip("generated text failed validation".to_string())
                };
                outcome.mapping.insert(descriptor.stable_id.clone(), resolved);
                false
            }
            Err(err) => self.note_batch_error("prose_generation", err, outcome),
        }
    }

    /// Returns true when remaining AI work must be deferred.
    fn note_batch_error(
        &self,
        batch: &str,
        err: crate::contracts::EngineError,
        outcome: &mut AiMapOutcome,
    ) -> bool {
        if err.kind == EngineErrorKind::AdmissionError {
            log::warn!(batch = batch; "llm admission denied, deferring remaining ai batches");
            outcome.deferred = true;
            return true;
        }
        log::warn!(batch = batch, error = err.message.as_str(); "ai batch failed, continuing");
        false
    }
}

fn wants_prose(label: &str) -> bool {
    let l = label.to_lowercase();
    ["why", "cover letter", "tell us", "describe", "motivat", "anything else"]
        .iter()
        .any(|marker| l.contains(marker))
}

/// No placeholder tokens, no bracketed assumptions, bounded length.
fn prose_is_submittable(text: &str) -> bool {
    if text.is_empty() || text.len() > MAX_PROSE_CHARS {
        return false;
    }
    if text.contains('[') || text.contains(']') || text.contains('{') || text.contains('}') {
        return false;
    }
    let upper_markers = ["TODO", "XXX", "INSERT", "PLACEHOLDER", "YOUR NAME"];
    !upper_markers.iter().any(|m| text.to_uppercase().contains(m))
}

/// Models wrap JSON in fences often enough that stripping them is routine.
fn parse_json_response<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    match serde_json::from_str::<T>(unfenced) {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!(error = err.to_string().as_str(); "unparseable ai response");
            None
        }
    }
}
