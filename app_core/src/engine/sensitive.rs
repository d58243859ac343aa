//! Sensitive-field detection: a declarative rule list, never inference.
//!
//! A sensitive field is held back from every mapping pass. If any remains
//! empty at the end of the fill loop the session transitions to review
//! regardless of other progress. These rules stay deterministic on
//! purpose; they are never delegated to a model.

use crate::data_models::field::FieldDescriptor;
use crate::data_models::profile::{ProfileKey, ProfileView};
use once_cell::sync::Lazy;
use regex::Regex;

struct SensitiveRule {
    name: &'static str,
    pattern: Regex,
    /// An explicit profile value under this key lifts the hold.
    lifted_by: Option<ProfileKey>,
}

fn rule(name: &'static str, pattern: &str, lifted_by: Option<ProfileKey>) -> SensitiveRule {
    SensitiveRule {
        name,
        pattern: Regex::new(pattern).expect("sensitive rule pattern must compile"),
        lifted_by,
    }
}

static RULES: Lazy<Vec<SensitiveRule>> = Lazy::new(|| {
    vec![
        rule(
            "national_id",
            r"(?i)\b(ssn|social\s*security|national\s*id|passport\s*(number|no)|tax\s*(id|payer))\b",
            None,
        ),
        rule(
            "salary_history",
            r"(?i)(salary|compensation|pay)\s*(history|expectation|requirement)|current\s*(salary|compensation)",
            None,
        ),
        rule("security_question", r"(?i)security\s*(question|answer)", None),
        rule(
            "criminal_history",
            r"(?i)\b(convict(ed|ion)?|felony|misdemeanor|criminal\s*(history|record))\b",
            None,
        ),
        rule(
            "disability_status",
            r"(?i)\bdisabilit(y|ies)\b|disability\s*status",
            Some(ProfileKey::Disabilities),
        ),
        rule(
            "veteran_status",
            r"(?i)\bveteran\b|military\s*service|protected\s*veteran",
            Some(ProfileKey::VeteranStatus),
        ),
        rule(
            "gender_identity",
            r"(?i)transgender|gender\s*identity",
            None,
        ),
        rule("sexual_orientation", r"(?i)sexual\s*orientation|lgbtq", None),
        rule("religion", r"(?i)\breligio(n|us)\b", None),
        rule(
            "race_ethnicity",
            r"(?i)\b(race|ethnicity|ethnic\s*(group|background))\b|hispanic\s*or\s*latino",
            None,
        ),
        rule(
            "medical",
            r"(?i)medical\s*(condition|history)|health\s*condition",
            None,
        ),
        rule(
            "eeo_self_identification",
            r"(?i)voluntary\s*self[- ]*identification|eeo\s*questionnaire|equal\s*(employment\s*)?opportunity",
            None,
        ),
    ]
});

static DOB_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)date\s*of\s*birth|\bdob\b|birth\s*date|birthday").expect("dob pattern"));

/// # NDOC
/// component: `engine::sensitive`
/// purpose: Decide whether a field must never be filled autonomously.
/// invariants:
///   - Pure over (descriptor, profile); no I/O, no model calls.
///   - An explicit profile value lifts only the rule that names it.
pub struct SensitiveFieldDetector;

impl SensitiveFieldDetector {
    pub fn new() -> Self {
        Self
    }

    /// Returns the rule name that held the field, or `None` when fillable.
    pub fn is_sensitive(&self, descriptor: &FieldDescriptor, profile: &ProfileView) -> Option<String> {
        let haystack = format!("{} {}", descriptor.label, descriptor.placeholder);

        // Date of birth is held when the form treats it as optional, or
        // when the profile has no explicit value for a required one.
        if DOB_PATTERN.is_match(&haystack) {
            if !descriptor.required || !profile.has(ProfileKey::DateOfBirth) {
                return Some("date_of_birth".to_string());
            }
        }

        for rule in RULES.iter() {
            if !rule.pattern.is_match(&haystack) {
                continue;
            }
            let lifted = match rule.lifted_by {
                Some(ProfileKey::Disabilities) => !profile.disabilities().is_empty(),
                Some(key) => profile.text(key).is_some(),
                None => false,
            };
            if !lifted {
                return Some(rule.name.to_string());
            }
        }
        None
    }
}

impl Default for SensitiveFieldDetector {
    fn default() -> Self {
        Self::new()
    }
}
