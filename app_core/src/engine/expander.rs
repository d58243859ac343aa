//! Section cardinality reconciliation.
//!
//! For each cardinal profile section, count the matching form containers;
//! when the profile holds more entries than the form shows, click that
//! section's "Add" affordance exactly once and let the next pass re-scan.
//! Never double-click, never exceed profile cardinality, prefer
//! section-labeled Add buttons over generic ones.

use crate::browser::driver::BrowserDriver;
use crate::contracts::EngineResult;
use crate::data_models::profile::ProfileView;
use std::sync::Arc;

const ADD_BUTTON_CANDIDATES: &str = "button, [role='button'], a[role='button']";

struct SectionKind {
    name: &'static str,
    keywords: &'static [&'static str],
}

const SECTIONS: &[SectionKind] = &[
    SectionKind {
        name: "education",
        keywords: &["education", "school", "degree"],
    },
    SectionKind {
        name: "work_experience",
        keywords: &["experience", "employment", "work-history", "position"],
    },
    SectionKind {
        name: "projects",
        keywords: &["project"],
    },
];

fn container_selector(section: &SectionKind) -> String {
    section
        .keywords
        .iter()
        .map(|k| {
            format!(
                "fieldset[class*='{k}'], div[class*='{k}-entry'], div[data-section*='{k}'], \
                 section[class*='{k}']"
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn profile_cardinality(profile: &ProfileView, section: &SectionKind) -> usize {
    match section.name {
        "education" => profile.education().len(),
        "work_experience" => profile.work_experience().len(),
        "projects" => profile.projects().len(),
        _ => 0,
    }
}

#[cfg(test)]
pub(crate) fn education_container_selector() -> String {
    container_selector(&SECTIONS[0])
}

/// # NDOC
/// component: `engine::expander`
/// purpose: Reconcile form section count with profile cardinality.
/// invariants:
///   - At most one Add click per section per pass.
///   - A profile with zero entries never triggers a click.
pub struct SectionExpander {
    driver: Arc<dyn BrowserDriver>,
    settle_wait_ms: u64,
}

impl SectionExpander {
    pub fn new(driver: Arc<dyn BrowserDriver>, settle_wait_ms: u64) -> Self {
        Self {
            driver,
            settle_wait_ms,
        }
    }

    /// Returns the number of Add clicks performed (0 or 1 per section).
    pub async fn expand_if_needed(&self, profile: &ProfileView) -> EngineResult<u32> {
        let mut clicks = 0;
        for section in SECTIONS {
            let wanted = profile_cardinality(profile, section);
            if wanted == 0 {
                continue;
            }
            let shown = self.count_sections(section).await?;
            if shown >= wanted {
                continue;
            }
            if self.click_add_once(section).await? {
                clicks += 1;
                self.driver.wait_ms(self.settle_wait_ms).await;
            }
        }
        Ok(clicks)
    }

    async fn count_sections(&self, section: &SectionKind) -> EngineResult<usize> {
        let containers = self
            .driver
            .query_elements(&container_selector(section))
            .await?;
        Ok(containers.iter().filter(|c| c.visible).count())
    }

    async fn click_add_once(&self, section: &SectionKind) -> EngineResult<bool> {
        let buttons = self.driver.query_elements(ADD_BUTTON_CANDIDATES).await?;
        let add_buttons: Vec<_> = buttons
            .iter()
            .filter(|b| b.visible && b.own_text.to_lowercase().contains("add"))
            .collect();
        if add_buttons.is_empty() {
            return Ok(false);
        }

        let labeled = add_buttons.iter().find(|b| {
            let text = b.own_text.to_lowercase();
            section.keywords.iter().any(|k| text.contains(k))
        });
        // A generic Add is only safe when it names no other section.
        let generic = add_buttons.iter().find(|b| {
            let text = b.own_text.to_lowercase();
            SECTIONS
                .iter()
                .all(|other| other.keywords.iter().all(|k| !text.contains(k)))
        });

        let Some(target) = labeled.or(generic) else {
            return Ok(false);
        };
        log::info!(
            section = section.name,
            button = target.own_text.as_str();
            "expanding form section"
        );
        self.driver.click(&target.selector).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{self, MockDriver};
    use serde_json::json;

    fn profile_with_three_educations() -> ProfileView {
        ProfileView::from_json(&json!({
            "education": [
                {"school": "UW"},
                {"school": "MIT"},
                {"school": "Stanford"}
            ]
        }))
    }

    fn education_section(selector: &str) -> crate::browser::driver::RawElement {
        crate::browser::driver::RawElement {
            selector: selector.to_string(),
            tag: "fieldset".to_string(),
            visible: true,
            ..crate::browser::driver::RawElement::default()
        }
    }

    fn education_selector() -> String {
        container_selector(&SECTIONS[0])
    }

    #[tokio::test]
    async fn clicks_add_once_when_profile_has_more_entries() {
        let driver = Arc::new(MockDriver::new());
        driver.register_query(&education_selector(), vec![education_section("#edu1")]);
        driver.register_query(
            ADD_BUTTON_CANDIDATES,
            vec![mock::button("add_edu", "Add Education")],
        );
        let expander = SectionExpander::new(Arc::clone(&driver) as Arc<dyn BrowserDriver>, 0);

        let clicks = expander
            .expand_if_needed(&profile_with_three_educations())
            .await
            .expect("expand");
        assert_eq!(clicks, 1);
        let click_count = driver
            .actions()
            .iter()
            .filter(|a| *a == "click #add_edu")
            .count();
        assert_eq!(click_count, 1);
    }

    #[tokio::test]
    async fn zero_profile_entries_never_click() {
        let driver = Arc::new(MockDriver::new());
        driver.register_query(
            ADD_BUTTON_CANDIDATES,
            vec![mock::button("add_edu", "Add Education")],
        );
        let expander = SectionExpander::new(Arc::clone(&driver) as Arc<dyn BrowserDriver>, 0);

        let clicks = expander
            .expand_if_needed(&ProfileView::new())
            .await
            .expect("expand");
        assert_eq!(clicks, 0);
        assert!(driver.actions().is_empty());
    }

    #[tokio::test]
    async fn matching_section_count_needs_no_expansion() {
        let driver = Arc::new(MockDriver::new());
        driver.register_query(
            &education_selector(),
            vec![
                education_section("#edu1"),
                education_section("#edu2"),
                education_section("#edu3"),
            ],
        );
        driver.register_query(
            ADD_BUTTON_CANDIDATES,
            vec![mock::button("add_edu", "Add Education")],
        );
        let expander = SectionExpander::new(Arc::clone(&driver) as Arc<dyn BrowserDriver>, 0);

        let clicks = expander
            .expand_if_needed(&profile_with_three_educations())
            .await
            .expect("expand");
        assert_eq!(clicks, 0);
    }

    #[tokio::test]
    async fn section_labeled_add_is_preferred_over_generic() {
        let driver = Arc::new(MockDriver::new());
        driver.register_query(&education_selector(), vec![education_section("#edu1")]);
        driver.register_query(
            ADD_BUTTON_CANDIDATES,
            vec![
                mock::button("add_generic", "Add"),
                mock::button("add_edu", "Add another education"),
            ],
        );
        let expander = SectionExpander::new(Arc::clone(&driver) as Arc<dyn BrowserDriver>, 0);

        expander
            .expand_if_needed(&profile_with_three_educations())
            .await
            .expect("expand");
        assert!(driver.actions().contains(&"click #add_edu".to_string()));
        assert!(!driver.actions().contains(&"click #add_generic".to_string()));
    }

    #[tokio::test]
    async fn foreign_section_add_button_is_not_borrowed() {
        let driver = Arc::new(MockDriver::new());
        driver.register_query(&education_selector(), vec![education_section("#edu1")]);
        driver.register_query(
            ADD_BUTTON_CANDIDATES,
            vec![mock::button("add_work", "Add work experience")],
        );
        let expander = SectionExpander::new(Arc::clone(&driver) as Arc<dyn BrowserDriver>, 0);

        let clicks = expander
            .expand_if_needed(&profile_with_three_educations())
            .await
            .expect("expand");
        assert_eq!(clicks, 0);
    }
}
