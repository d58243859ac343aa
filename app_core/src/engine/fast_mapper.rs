//! Deterministic profile-to-field mapping.
//!
//! Two passes, both free of model calls:
//! - `pattern_pass`: tight label-anchored regexes; precise, near-zero
//!   false positives.
//! - `batch_pass`: broad case-insensitive synonym containment plus the
//!   Yes/No catalog and option-normalization tables.
//!
//! Catalog defaults are explicit and auditable. Protected-class answers
//! (veteran, disability, EEO self-identification) are never defaulted
//! here; those labels are held upstream by the sensitive detector.

use crate::data_models::field::{FieldCategory, FieldDescriptor, Mapping, ResolvedValue};
use crate::data_models::profile::{ProfileKey, ProfileView, TriState};
use crate::utils::similarity::{containment_match, normalize_label, word_jaccard};
use once_cell::sync::Lazy;
use regex::Regex;

/// Broad synonym table; order matters, first match wins.
static SYNONYMS: Lazy<Vec<(ProfileKey, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (ProfileKey::FirstName, vec!["first name", "fname", "given name", "forename"]),
        (
            ProfileKey::LastName,
            vec!["last name", "lname", "surname", "family name", "lastname"],
        ),
        (ProfileKey::Email, vec!["email", "e-mail", "email address"]),
        (
            ProfileKey::Phone,
            vec!["phone", "phone number", "telephone", "mobile", "cell"],
        ),
        (
            ProfileKey::Address,
            vec!["address line 1", "street address", "home address", "address"],
        ),
        (ProfileKey::City, vec!["city", "town", "locality"]),
        (ProfileKey::State, vec!["state", "province", "region"]),
        (ProfileKey::Zip, vec!["zip code", "postal code", "zipcode", "zip"]),
        (ProfileKey::CountryCode, vec!["country code", "dial code"]),
        (ProfileKey::Country, vec!["country of residence", "country"]),
        (ProfileKey::Nationality, vec!["nationality", "citizenship", "country of citizenship"]),
        (ProfileKey::Gender, vec!["gender"]),
        (ProfileKey::Linkedin, vec!["linkedin", "linked-in"]),
        (ProfileKey::Github, vec!["github", "git hub"]),
        (
            ProfileKey::VisaStatus,
            vec!["visa status", "current visa", "immigration status"],
        ),
        (ProfileKey::Summary, vec!["summary", "about you", "professional summary"]),
    ]
});

/// Tight anchored patterns for the precise first pass.
static TIGHT_PATTERNS: Lazy<Vec<(ProfileKey, Regex)>> = Lazy::new(|| {
    let table: Vec<(ProfileKey, &str)> = vec![
        (ProfileKey::FirstName, r"^(first name|given name|forename|fname)$"),
        (ProfileKey::LastName, r"^(last name|surname|family name|lname|lastname)$"),
        (ProfileKey::Email, r"^(e ?mail( address)?)$"),
        (ProfileKey::Phone, r"^(phone( number)?|telephone|mobile( number)?|cell( phone)?)$"),
        (ProfileKey::City, r"^(city|town)$"),
        (ProfileKey::State, r"^(state|province)$"),
        (ProfileKey::Zip, r"^(zip( code)?|postal code|zipcode)$"),
        (ProfileKey::Country, r"^(country( of residence)?)$"),
        (ProfileKey::Address, r"^(address( line 1)?|street address)$"),
        (ProfileKey::Linkedin, r"^(linkedin( profile| url)?)$"),
        (ProfileKey::Github, r"^(github( profile| url)?)$"),
    ];
    table
        .into_iter()
        .map(|(key, pattern)| (key, Regex::new(pattern).expect("tight pattern must compile")))
        .collect()
});

struct YesNoRule {
    name: &'static str,
    patterns: Vec<Regex>,
    answer: fn(&ProfileView) -> Option<&'static str>,
}

fn visa_grants_work_authorization(visa: &str) -> bool {
    let v = visa.to_lowercase();
    [
        "citizen",
        "permanent",
        "green card",
        "h-1b",
        "h1b",
        "l-1",
        "l1",
        "tn",
        "opt",
        "cpt",
        "work visa",
        "f-1",
        "f1",
    ]
    .iter()
    .any(|marker| v.contains(marker))
}

fn sponsorship_required(profile: &ProfileView) -> Option<bool> {
    if let Some(text) = profile.text(ProfileKey::VisaSponsorship) {
        let t = text.to_lowercase();
        if t.contains("not") || t == "no" || t.contains("none") {
            return Some(false);
        }
        if t.contains("required") || t == "yes" {
            return Some(true);
        }
    }
    let visa = profile.text(ProfileKey::VisaStatus)?.to_lowercase();
    if visa.contains("citizen") || visa.contains("permanent") || visa.contains("green card") {
        return Some(false);
    }
    if ["h-1b", "h1b", "f-1", "f1", "opt", "cpt", "student", "work visa"]
        .iter()
        .any(|marker| visa.contains(marker))
    {
        return Some(true);
    }
    None
}

static YES_NO_RULES: Lazy<Vec<YesNoRule>> = Lazy::new(|| {
    fn compile(patterns: &[&str]) -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("yes/no pattern must compile"))
            .collect()
    }
    vec![
        YesNoRule {
            name: "work_authorization",
            patterns: compile(&[
                r"authorized.*work",
                r"work.*authorization",
                r"legal(ly)?.*work",
                r"eligible.*work",
            ]),
            answer: |profile| {
                let visa = profile.text(ProfileKey::VisaStatus)?;
                visa_grants_work_authorization(visa).then_some("Yes")
            },
        },
        YesNoRule {
            name: "visa_sponsorship",
            patterns: compile(&[
                r"sponsorship.*required",
                r"require.*sponsorship",
                r"need.*sponsorship",
                r"visa.*sponsorship",
                r"h1b.*sponsorship",
            ]),
            answer: |profile| match sponsorship_required(profile) {
                Some(true) => Some("Yes"),
                Some(false) => Some("No"),
                None => None,
            },
        },
        YesNoRule {
            name: "background_check",
            // Standard consent.
            patterns: compile(&[r"background.*check", r"consent.*background"]),
            answer: |_| Some("Yes"),
        },
        YesNoRule {
            name: "drug_test",
            // Standard consent.
            patterns: compile(&[r"drug.*test", r"substance.*test"]),
            answer: |_| Some("Yes"),
        },
        YesNoRule {
            name: "terms_consent",
            patterns: compile(&[r"agree.*(terms|privacy)", r"accept.*(terms|privacy)"]),
            answer: |_| Some("Yes"),
        },
        YesNoRule {
            name: "relocation",
            patterns: compile(&[r"willing.*relocat", r"open.*relocat", r"relocat.*willing"]),
            answer: |profile| match profile.tri_state(ProfileKey::WillingToRelocate) {
                TriState::Yes => Some("Yes"),
                TriState::No => Some("No"),
                TriState::Unknown => None,
            },
        },
        YesNoRule {
            name: "onsite_availability",
            patterns: compile(&[r"available.*onsite", r"work.*onsite", r"onsite.*office", r"commute.*office"]),
            answer: |_| Some("Yes"),
        },
    ]
});

/// Option spelling families used to match profile values against dropdown
/// options with different conventions.
static SPELLING_FAMILIES: Lazy<Vec<Vec<&'static str>>> = Lazy::new(|| {
    vec![
        vec!["united states", "us", "usa", "america", "united states of america"],
        vec!["united kingdom", "uk", "gb", "britain", "england", "great britain"],
        vec!["canada", "ca", "can"],
        vec!["bachelor", "bachelors", "bs", "ba", "be", "btech", "b tech", "b s", "b a"],
        vec!["master", "masters", "ms", "ma", "me", "mtech", "m tech", "m s", "m a"],
        vec!["phd", "ph d", "doctorate", "doctoral"],
        vec!["high school", "secondary", "diploma"],
        vec!["male", "m", "man"],
        vec!["female", "f", "woman"],
        vec!["non binary", "nonbinary", "other"],
        vec!["prefer not to answer", "decline to answer", "not specified", "prefer not to say"],
        vec!["f 1", "f1", "student visa", "f 1 student"],
        vec!["h 1b", "h1b", "work visa"],
        vec!["green card", "permanent resident", "lpr"],
        vec!["us citizen", "citizen", "american citizen"],
    ]
});

fn spelling_variants(value: &str) -> Vec<String> {
    let normalized = normalize_label(value);
    let mut variants = vec![value.to_string()];
    for family in SPELLING_FAMILIES.iter() {
        if family.iter().any(|v| *v == normalized) {
            variants.extend(family.iter().map(|v| v.to_string()));
        }
    }
    variants
}

/// Result of one mapping pass: what resolved, what is left.
pub struct PassResult {
    pub mapping: Mapping,
    pub remaining: Vec<FieldDescriptor>,
}

/// Cardinal-section field groups: which entry field a label names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionField {
    School,
    Degree,
    FieldOfStudy,
    Company,
    JobTitle,
    ProjectName,
}

static SECTION_FIELD_PATTERNS: Lazy<Vec<(SectionField, Regex)>> = Lazy::new(|| {
    let table: Vec<(SectionField, &str)> = vec![
        (SectionField::School, r"\b(school|university|college|institution)\b"),
        (SectionField::Degree, r"\bdegree\b"),
        (SectionField::FieldOfStudy, r"field of study|\bmajor\b|\bdiscipline\b"),
        (SectionField::Company, r"company( name)?|\bemployer\b"),
        (SectionField::JobTitle, r"job title"),
        (SectionField::ProjectName, r"project (name|title)"),
    ];
    table
        .into_iter()
        .map(|(field, pattern)| {
            (field, Regex::new(pattern).expect("section pattern must compile"))
        })
        .collect()
});

fn section_field_for(label: &str) -> Option<SectionField> {
    let normalized = normalize_label(label);
    SECTION_FIELD_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(&normalized))
        .map(|(field, _)| *field)
}

fn section_entry_value(
    profile: &ProfileView,
    field: SectionField,
    ordinal: usize,
) -> Option<String> {
    match field {
        SectionField::School => profile.education().get(ordinal).map(|e| e.school.clone()),
        SectionField::Degree => profile
            .education()
            .get(ordinal)
            .and_then(|e| e.degree.clone()),
        SectionField::FieldOfStudy => profile
            .education()
            .get(ordinal)
            .and_then(|e| e.field_of_study.clone()),
        SectionField::Company => profile
            .work_experience()
            .get(ordinal)
            .map(|e| e.company.clone()),
        SectionField::JobTitle => profile
            .work_experience()
            .get(ordinal)
            .and_then(|e| e.title.clone()),
        SectionField::ProjectName => profile.projects().get(ordinal).map(|e| e.name.clone()),
    }
    .filter(|v| !v.trim().is_empty())
}

/// # NDOC
/// component: `engine::fast_mapper`
/// purpose: Deterministic mapping passes ahead of any model call.
/// invariants:
///   - Emitted values come from the profile or the documented catalog only.
///   - A value that does not fit the field's category is returned to the
///     AI pass, never filled as junk.
pub struct FastMapper {
    threshold: f64,
    max_skills: usize,
}

impl FastMapper {
    pub fn new(threshold: f64, max_skills: usize) -> Self {
        Self {
            threshold,
            max_skills,
        }
    }

    /// Tight label-anchored pass.
    pub fn pattern_pass(
        &self,
        descriptors: Vec<FieldDescriptor>,
        profile: &ProfileView,
    ) -> PassResult {
        let mut mapping = Mapping::new();
        let mut remaining = Vec::new();

        for descriptor in descriptors {
            let label = normalize_label(&descriptor.label);
            let hit = TIGHT_PATTERNS
                .iter()
                .find(|(_, pattern)| pattern.is_match(&label))
                .and_then(|(key, _)| profile.text(*key))
                .map(str::to_string);

            match hit {
                Some(value) => match self.resolve_for_category(&descriptor, &value) {
                    Some(resolved) => {
                        mapping.insert(descriptor.stable_id.clone(), resolved);
                    }
                    None => remaining.push(descriptor),
                },
                None => remaining.push(descriptor),
            }
        }
        PassResult { mapping, remaining }
    }

    /// Broad synonym + catalog pass.
    pub fn batch_pass(
        &self,
        descriptors: Vec<FieldDescriptor>,
        profile: &ProfileView,
    ) -> PassResult {
        let mut mapping = Mapping::new();
        let mut remaining = Vec::new();

        for descriptor in descriptors {
            if let Some(resolved) = self.map_one(&descriptor, profile) {
                mapping.insert(descriptor.stable_id.clone(), resolved);
            } else {
                remaining.push(descriptor);
            }
        }
        PassResult { mapping, remaining }
    }

    /// Map repeated-section fields (education, work, projects) by their
    /// page ordinal among same-group fields. `all_page` is the full scan,
    /// so ordinals stay correct when earlier entries are already closed.
    pub fn section_pass(
        &self,
        descriptors: Vec<FieldDescriptor>,
        all_page: &[FieldDescriptor],
        profile: &ProfileView,
    ) -> PassResult {
        let mut mapping = Mapping::new();
        let mut remaining = Vec::new();

        for descriptor in descriptors {
            let resolved = section_field_for(&descriptor.label).and_then(|field| {
                let ordinal = all_page
                    .iter()
                    .filter(|d| section_field_for(&d.label) == Some(field))
                    .position(|d| d.stable_id == descriptor.stable_id)?;
                let value = section_entry_value(profile, field, ordinal)?;
                self.resolve_for_category(&descriptor, &value)
            });
            match resolved {
                Some(value) => {
                    mapping.insert(descriptor.stable_id.clone(), value);
                }
                None => remaining.push(descriptor),
            }
        }
        PassResult { mapping, remaining }
    }

    fn map_one(&self, descriptor: &FieldDescriptor, profile: &ProfileView) -> Option<ResolvedValue> {
        if descriptor.category == FieldCategory::MultiselectSkills {
            let skills = profile.all_skills();
            if skills.is_empty() {
                return None;
            }
            let bounded: Vec<_> = skills.into_iter().take(self.max_skills).collect();
            return Some(ResolvedValue::Simple(bounded.join(", ")));
        }

        if descriptor.category.is_checkable() || self.is_yes_no_dropdown(descriptor) {
            if let Some(resolved) = self.resolve_yes_no(descriptor, profile) {
                return Some(resolved);
            }
            if descriptor.category.is_checkable() {
                return None;
            }
        }

        let label = normalize_label(&descriptor.label);
        let key = SYNONYMS
            .iter()
            .find(|(_, synonyms)| synonyms.iter().any(|s| label.contains(&normalize_label(s))))
            .map(|(key, _)| *key)?;
        let value = profile.text(key)?.to_string();
        self.resolve_for_category(descriptor, &value)
    }

    fn is_yes_no_dropdown(&self, descriptor: &FieldDescriptor) -> bool {
        descriptor.category.is_dropdown_like()
            && !descriptor.options.is_empty()
            && descriptor.options.iter().all(|o| {
                let t = normalize_label(&o.text);
                t.is_empty() || ["yes", "no", "select", "choose"].iter().any(|m| t.contains(m))
            })
    }

    fn resolve_yes_no(
        &self,
        descriptor: &FieldDescriptor,
        profile: &ProfileView,
    ) -> Option<ResolvedValue> {
        let label = normalize_label(&descriptor.label);
        let rule = YES_NO_RULES
            .iter()
            .find(|rule| rule.patterns.iter().any(|p| p.is_match(&label)))?;
        let answer = (rule.answer)(profile)?;
        let reason = format!("catalog:{}", rule.name);

        match descriptor.category {
            FieldCategory::Checkbox => {
                (answer == "Yes").then(|| ResolvedValue::CheckDecision(true, reason))
            }
            FieldCategory::Radio => {
                // Each radio is its own descriptor labeled "question option".
                // Only the radio whose option text matches the answer is acted on.
                let ends_with_answer = label.ends_with(&normalize_label(answer));
                ends_with_answer.then(|| ResolvedValue::CheckDecision(true, reason))
            }
            FieldCategory::ButtonGroup => Some(ResolvedValue::Selection(answer.to_string())),
            _ => self
                .match_option(descriptor, answer)
                .map(ResolvedValue::Selection),
        }
    }

    fn resolve_for_category(
        &self,
        descriptor: &FieldDescriptor,
        value: &str,
    ) -> Option<ResolvedValue> {
        if !value_fits(descriptor, value) {
            return None;
        }
        if descriptor.category.is_dropdown_like() {
            if descriptor.options.is_empty() {
                // Options unknown yet; leave for extraction + AI.
                return None;
            }
            return self.match_option(descriptor, value).map(ResolvedValue::Selection);
        }
        if descriptor.category.is_checkable() {
            return None;
        }
        Some(ResolvedValue::Simple(value.to_string()))
    }

    /// Match a profile value against enumerated options: exact normalized
    /// equality, spelling-family equality, containment, then word-Jaccard.
    pub fn match_option(&self, descriptor: &FieldDescriptor, value: &str) -> Option<String> {
        let variants: Vec<String> = spelling_variants(value)
            .iter()
            .map(|v| normalize_label(v))
            .collect();

        for option in &descriptor.options {
            let text = normalize_label(&option.text);
            if variants.iter().any(|v| *v == text) {
                return Some(option.text.clone());
            }
        }
        for option in &descriptor.options {
            if containment_match(value, &option.text) {
                return Some(option.text.clone());
            }
        }
        descriptor
            .options
            .iter()
            .map(|o| (o, word_jaccard(value, &o.text)))
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(option, _)| option.text.clone())
    }

    /// Candidate values for a dropdown, used to seed the AI prompt.
    pub fn dropdown_candidates(
        &self,
        descriptor: &FieldDescriptor,
        profile: &ProfileView,
    ) -> Vec<String> {
        let label = normalize_label(&descriptor.label);
        let Some((key, _)) = SYNONYMS
            .iter()
            .find(|(_, synonyms)| synonyms.iter().any(|s| label.contains(&normalize_label(s))))
        else {
            return Vec::new();
        };
        profile
            .text(*key)
            .map(|value| spelling_variants(value))
            .unwrap_or_default()
    }
}

/// Junk guard: a value that makes no sense for the category is rejected so
/// the field goes to the AI pass instead of being filled with noise.
fn value_fits(descriptor: &FieldDescriptor, value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    match descriptor.category {
        FieldCategory::Text => value.len() <= 200,
        FieldCategory::Email => value.contains('@'),
        FieldCategory::Phone | FieldCategory::Number => value.chars().any(|c| c.is_ascii_digit()),
        FieldCategory::Date => value.chars().any(|c| c.is_ascii_digit()),
        FieldCategory::Url => value.contains('.'),
        FieldCategory::Password => false,
        _ => true,
    }
}
