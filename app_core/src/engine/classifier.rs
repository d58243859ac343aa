//! Field classification: a pure function of an element snapshot.
//!
//! Precedence is fixed; the first matching rule wins. Vendor families are
//! recognized by structural chrome markers (a styled control wrapping a
//! hidden input with a popup list, a wrapper replacing a native select),
//! never by site identity.

use crate::browser::driver::RawElement;
use crate::data_models::field::FieldCategory;

/// Chrome markers for skill multiselects: a token/chip list fed by a
/// search input.
const MULTISELECT_MARKERS: &[&str] = &["multiselect", "token", "chip", "pill-list"];

/// Family A: styled control + hidden text input + floating option menu.
const VENDOR_A_MARKERS: &[&str] = &["react-select", "select__control", "select__value-container"];

/// Family B: wrapper replacing a native select with its own popup.
const VENDOR_B_MARKERS: &[&str] = &["select2", "chosen-container", "dropdown-toggle"];

fn chrome_has(raw: &RawElement, markers: &[&str]) -> bool {
    markers.iter().any(|m| raw.container_chrome.contains(m))
}

/// Classify one element snapshot. First match wins.
pub fn classify(raw: &RawElement) -> FieldCategory {
    let tag = raw.tag.as_str();
    let input_type = raw.input_type.as_str();

    if tag == "input" && input_type == "file" {
        return FieldCategory::FileUpload;
    }
    // Visible checkbox/radio are native; a hidden one rendered through
    // sibling buttons classifies as a button group further down.
    if tag == "input" && raw.visible {
        if input_type == "checkbox" {
            return FieldCategory::Checkbox;
        }
        if input_type == "radio" {
            return FieldCategory::Radio;
        }
    }
    if tag == "select" {
        return FieldCategory::SelectNative;
    }
    if tag == "textarea" {
        return FieldCategory::Textarea;
    }
    if chrome_has(raw, MULTISELECT_MARKERS) {
        return FieldCategory::MultiselectSkills;
    }
    if chrome_has(raw, VENDOR_A_MARKERS) {
        return FieldCategory::SelectVendorA;
    }
    if chrome_has(raw, VENDOR_B_MARKERS) {
        return FieldCategory::SelectVendorB;
    }
    if raw.role == "combobox"
        || raw.aria_haspopup == "listbox"
        || raw.aria_haspopup == "true"
    {
        return FieldCategory::SelectCustom;
    }
    if tag == "input"
        && !raw.visible
        && matches!(input_type, "checkbox" | "radio")
        && raw.sibling_buttons >= 2
    {
        return FieldCategory::ButtonGroup;
    }
    if tag == "input" {
        return match input_type {
            "date" | "datetime-local" | "month" => FieldCategory::Date,
            "number" => FieldCategory::Number,
            "email" => FieldCategory::Email,
            "url" => FieldCategory::Url,
            "tel" => FieldCategory::Phone,
            "password" => FieldCategory::Password,
            _ => FieldCategory::Text,
        };
    }
    FieldCategory::Text
}
