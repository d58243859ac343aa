//! Field-level data shared by the detector, mappers, and interactor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Category tag driving the interaction strategy. Vendor variants are
/// detection hints for structurally distinctive widget families, never a
/// coupling to a specific site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Text,
    Email,
    Phone,
    Url,
    Number,
    Date,
    Password,
    Textarea,
    SelectNative,
    SelectCustom,
    SelectVendorA,
    SelectVendorB,
    MultiselectSkills,
    Radio,
    Checkbox,
    ButtonGroup,
    FileUpload,
}

impl FieldCategory {
    /// Categories filled by typing and verified by value read-back.
    pub fn is_text_like(&self) -> bool {
        matches!(
            self,
            FieldCategory::Text
                | FieldCategory::Email
                | FieldCategory::Phone
                | FieldCategory::Url
                | FieldCategory::Number
                | FieldCategory::Date
                | FieldCategory::Password
                | FieldCategory::Textarea
        )
    }

    /// Categories whose value is one of an enumerated option set.
    pub fn is_dropdown_like(&self) -> bool {
        matches!(
            self,
            FieldCategory::SelectNative
                | FieldCategory::SelectCustom
                | FieldCategory::SelectVendorA
                | FieldCategory::SelectVendorB
        )
    }

    /// Custom widgets whose options require opening a popup to read.
    pub fn needs_option_extraction(&self) -> bool {
        matches!(
            self,
            FieldCategory::SelectCustom
                | FieldCategory::SelectVendorA
                | FieldCategory::SelectVendorB
        )
    }

    pub fn is_checkable(&self) -> bool {
        matches!(
            self,
            FieldCategory::Radio | FieldCategory::Checkbox | FieldCategory::ButtonGroup
        )
    }
}

/// One selectable option of a dropdown-like field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub text: String,
    pub value: String,
}

/// # NDOC
/// component: `data_models::field`
/// purpose: Metadata for one interactive element discovered in a page pass.
/// invariants:
///   - `stable_id` is unique within its page pass.
///   - `selector` re-resolves the live element after DOM mutation; it is
///     never trusted across passes without re-resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub stable_id: String,
    /// CSS path computed at snapshot time; the live-element handle.
    pub selector: String,
    pub label: String,
    pub category: FieldCategory,
    /// Lazily populated for custom dropdowns; empty until extraction.
    #[serde(default)]
    pub options: Vec<FieldOption>,
    pub required: bool,
    /// Snapshot of whether the field already held a value when scanned.
    pub filled: bool,
    #[serde(default)]
    pub placeholder: String,
    /// Lowercased ancestor class/attribute markers used by classification.
    #[serde(default)]
    pub container_chrome: String,
    #[serde(default)]
    pub input_type: String,
    #[serde(default)]
    pub tag: String,
}

impl FieldDescriptor {
    pub fn option_texts(&self) -> Vec<&str> {
        self.options.iter().map(|o| o.text.as_str()).collect()
    }
}

/// Value resolved for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedValue {
    Simple(String),
    Selection(String),
    CheckDecision(bool, String),
    Generated(String),
    Skip(String),
}

impl ResolvedValue {
    /// The string the interactor will type/select, if any.
    pub fn intended_text(&self) -> Option<&str> {
        match self {
            ResolvedValue::Simple(s)
            | ResolvedValue::Selection(s)
            | ResolvedValue::Generated(s) => Some(s.as_str()),
            ResolvedValue::CheckDecision(_, _) | ResolvedValue::Skip(_) => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, ResolvedValue::Skip(_))
    }
}

/// Resolved values keyed by `stable_id`. BTreeMap keeps application order
/// deterministic.
pub type Mapping = BTreeMap<String, ResolvedValue>;
