//! Read-only profile data consumed by one job.
//!
//! Profile values arrive from storage as loose JSON with heterogeneous
//! value types. The boundary here converts them into a closed key enum and
//! a tagged value variant; unknown keys are dropped at the boundary and
//! never propagate inward. Missing values are represented by absence,
//! never by sentinel strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Closed set of canonical profile keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKey {
    FirstName,
    LastName,
    Email,
    Phone,
    Address,
    City,
    State,
    Zip,
    Country,
    CountryCode,
    Linkedin,
    Github,
    DateOfBirth,
    Gender,
    Nationality,
    VisaStatus,
    VisaSponsorship,
    VeteranStatus,
    Disabilities,
    WillingToRelocate,
    PreferredLocations,
    Summary,
    Education,
    WorkExperience,
    Projects,
    Skills,
    ResumeBlobRef,
    CoverLetterTemplate,
}

impl ProfileKey {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.trim().to_lowercase())).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKey::FirstName => "first_name",
            ProfileKey::LastName => "last_name",
            ProfileKey::Email => "email",
            ProfileKey::Phone => "phone",
            ProfileKey::Address => "address",
            ProfileKey::City => "city",
            ProfileKey::State => "state",
            ProfileKey::Zip => "zip",
            ProfileKey::Country => "country",
            ProfileKey::CountryCode => "country_code",
            ProfileKey::Linkedin => "linkedin",
            ProfileKey::Github => "github",
            ProfileKey::DateOfBirth => "date_of_birth",
            ProfileKey::Gender => "gender",
            ProfileKey::Nationality => "nationality",
            ProfileKey::VisaStatus => "visa_status",
            ProfileKey::VisaSponsorship => "visa_sponsorship",
            ProfileKey::VeteranStatus => "veteran_status",
            ProfileKey::Disabilities => "disabilities",
            ProfileKey::WillingToRelocate => "willing_to_relocate",
            ProfileKey::PreferredLocations => "preferred_locations",
            ProfileKey::Summary => "summary",
            ProfileKey::Education => "education",
            ProfileKey::WorkExperience => "work_experience",
            ProfileKey::Projects => "projects",
            ProfileKey::Skills => "skills",
            ProfileKey::ResumeBlobRef => "resume_blob_ref",
            ProfileKey::CoverLetterTemplate => "cover_letter_template",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    Yes,
    No,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EducationEntry {
    pub school: String,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default)]
    pub field_of_study: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub gpa: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkEntry {
    pub company: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProjectEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Tagged value variant per profile key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileValue {
    Text(String),
    TriState(TriState),
    Tags(Vec<String>),
    TextList(Vec<String>),
    Education(Vec<EducationEntry>),
    Work(Vec<WorkEntry>),
    Projects(Vec<ProjectEntry>),
    Skills(BTreeMap<String, Vec<String>>),
}

/// # NDOC
/// component: `data_models::profile`
/// purpose: Read-only canonical profile consumed by one job.
/// invariants:
///   - Keys outside `ProfileKey` never enter the view.
///   - Absent values stay absent; no empty-string sentinels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileView {
    values: BTreeMap<ProfileKey, ProfileValue>,
}

impl ProfileView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from loose storage JSON, dropping unknown keys and
    /// values of the wrong shape.
    pub fn from_json(raw: &Value) -> Self {
        let mut view = Self::new();
        let Some(map) = raw.as_object() else {
            return view;
        };
        for (raw_key, raw_value) in map {
            let Some(key) = ProfileKey::parse(raw_key) else {
                continue;
            };
            if let Some(value) = coerce_value(key, raw_value) {
                view.values.insert(key, value);
            }
        }
        view
    }

    pub fn set(&mut self, key: ProfileKey, value: ProfileValue) -> &mut Self {
        self.values.insert(key, value);
        self
    }

    pub fn set_text(&mut self, key: ProfileKey, value: impl Into<String>) -> &mut Self {
        let text = value.into();
        if !text.trim().is_empty() {
            self.values.insert(key, ProfileValue::Text(text));
        }
        self
    }

    pub fn get(&self, key: ProfileKey) -> Option<&ProfileValue> {
        self.values.get(&key)
    }

    pub fn has(&self, key: ProfileKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn text(&self, key: ProfileKey) -> Option<&str> {
        match self.values.get(&key) {
            Some(ProfileValue::Text(s)) if !s.trim().is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn tri_state(&self, key: ProfileKey) -> TriState {
        match self.values.get(&key) {
            Some(ProfileValue::TriState(t)) => *t,
            _ => TriState::Unknown,
        }
    }

    pub fn education(&self) -> &[EducationEntry] {
        match self.values.get(&ProfileKey::Education) {
            Some(ProfileValue::Education(entries)) => entries,
            _ => &[],
        }
    }

    pub fn work_experience(&self) -> &[WorkEntry] {
        match self.values.get(&ProfileKey::WorkExperience) {
            Some(ProfileValue::Work(entries)) => entries,
            _ => &[],
        }
    }

    pub fn projects(&self) -> &[ProjectEntry] {
        match self.values.get(&ProfileKey::Projects) {
            Some(ProfileValue::Projects(entries)) => entries,
            _ => &[],
        }
    }

    pub fn preferred_locations(&self) -> &[String] {
        match self.values.get(&ProfileKey::PreferredLocations) {
            Some(ProfileValue::TextList(entries)) => entries,
            _ => &[],
        }
    }

    pub fn disabilities(&self) -> &[String] {
        match self.values.get(&ProfileKey::Disabilities) {
            Some(ProfileValue::Tags(tags)) => tags,
            _ => &[],
        }
    }

    /// Skills flattened across categories, category order preserved,
    /// duplicates removed.
    pub fn all_skills(&self) -> Vec<String> {
        use itertools::Itertools;
        match self.values.get(&ProfileKey::Skills) {
            Some(ProfileValue::Skills(by_category)) => by_category
                .values()
                .flatten()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unique_by(|s| s.to_lowercase())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Short operator-readable summary used in LLM prompts.
    pub fn summary_for_prompt(&self) -> String {
        let mut lines = Vec::new();
        for key in [
            ProfileKey::FirstName,
            ProfileKey::LastName,
            ProfileKey::Email,
            ProfileKey::Phone,
            ProfileKey::City,
            ProfileKey::State,
            ProfileKey::Country,
            ProfileKey::VisaStatus,
            ProfileKey::VisaSponsorship,
            ProfileKey::Summary,
        ] {
            if let Some(text) = self.text(key) {
                lines.push(format!("{}: {}", key.as_str(), text));
            }
        }
        for entry in self.work_experience().iter().take(3) {
            lines.push(format!(
                "work: {} at {}",
                entry.title.as_deref().unwrap_or("role"),
                entry.company
            ));
        }
        for entry in self.education().iter().take(2) {
            lines.push(format!(
                "education: {} {}",
                entry.degree.as_deref().unwrap_or("degree"),
                entry.school
            ));
        }
        let skills = self.all_skills();
        if !skills.is_empty() {
            lines.push(format!("skills: {}", skills.join(", ")));
        }
        lines.join("\n")
    }
}

fn string_list(raw: &Value) -> Option<Vec<String>> {
    let items = raw.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

fn coerce_value(key: ProfileKey, raw: &Value) -> Option<ProfileValue> {
    match key {
        ProfileKey::Disabilities => string_list(raw).map(ProfileValue::Tags),
        ProfileKey::PreferredLocations => string_list(raw).map(ProfileValue::TextList),
        ProfileKey::WillingToRelocate => match raw {
            Value::Bool(true) => Some(ProfileValue::TriState(TriState::Yes)),
            Value::Bool(false) => Some(ProfileValue::TriState(TriState::No)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "yes" | "true" => Some(ProfileValue::TriState(TriState::Yes)),
                "no" | "false" => Some(ProfileValue::TriState(TriState::No)),
                _ => Some(ProfileValue::TriState(TriState::Unknown)),
            },
            _ => None,
        },
        ProfileKey::Education => serde_json::from_value(raw.clone())
            .ok()
            .map(ProfileValue::Education),
        ProfileKey::WorkExperience => serde_json::from_value(raw.clone())
            .ok()
            .map(ProfileValue::Work),
        ProfileKey::Projects => serde_json::from_value(raw.clone())
            .ok()
            .map(ProfileValue::Projects),
        ProfileKey::Skills => serde_json::from_value(raw.clone())
            .ok()
            .map(ProfileValue::Skills),
        _ => raw
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| ProfileValue::Text(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_profile_json() -> Value {
        json!({
            "first_name": "Jane",
            "last_name": "Doe",
            "email": "jane@x.io",
            "phone": "555-1234",
            "country": "United States",
            "willing_to_relocate": "yes",
            "disabilities": [],
            "preferred_locations": ["Seattle, WA", "Remote"],
            "education": [
                {"school": "UW", "degree": "BS", "field_of_study": "CS"}
            ],
            "skills": {"languages": ["Rust", "Python", "rust"]},
            "favorite_color": "mauve",
            "ssn": "000-00-0000"
        })
    }

    #[test]
    fn unknown_keys_are_dropped_at_the_boundary() {
        let view = ProfileView::from_json(&sample_profile_json());
        assert_eq!(view.text(ProfileKey::FirstName), Some("Jane"));
        // Neither unknown key survives anywhere in the view.
        let serialized = serde_json::to_string(&view).expect("serialize");
        assert!(!serialized.contains("favorite_color"));
        assert!(!serialized.contains("000-00-0000"));
    }

    #[test]
    fn missing_values_are_absent_not_empty() {
        let view = ProfileView::from_json(&json!({"first_name": "  ", "email": "a@b.c"}));
        assert!(!view.has(ProfileKey::FirstName));
        assert_eq!(view.text(ProfileKey::Email), Some("a@b.c"));
        assert_eq!(view.tri_state(ProfileKey::WillingToRelocate), TriState::Unknown);
    }

    #[test]
    fn tri_state_parses_strings_and_bools() {
        let view = ProfileView::from_json(&json!({"willing_to_relocate": true}));
        assert_eq!(view.tri_state(ProfileKey::WillingToRelocate), TriState::Yes);

        let view = ProfileView::from_json(&json!({"willing_to_relocate": "No"}));
        assert_eq!(view.tri_state(ProfileKey::WillingToRelocate), TriState::No);
    }

    #[test]
    fn skills_flatten_unique_and_ordered() {
        let view = ProfileView::from_json(&sample_profile_json());
        assert_eq!(view.all_skills(), vec!["Rust".to_string(), "Python".to_string()]);
    }

    #[test]
    fn education_entries_deserialize() {
        let view = ProfileView::from_json(&sample_profile_json());
        assert_eq!(view.education().len(), 1);
        assert_eq!(view.education()[0].school, "UW");
        assert_eq!(view.education()[0].degree.as_deref(), Some("BS"));
    }

    #[test]
    fn prompt_summary_contains_contact_and_skills() {
        let view = ProfileView::from_json(&sample_profile_json());
        let summary = view.summary_for_prompt();
        assert!(summary.contains("first_name: Jane"));
        assert!(summary.contains("skills: Rust, Python"));
    }
}
