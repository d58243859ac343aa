//! Per-navigation record of which fields are done.
//!
//! A field marked succeeded is elided from every later pass of the same
//! navigation; a failed field is retried up to the configured budget and
//! then elided too. The tracker dies with the navigation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub attempts: u32,
    pub last_status: AttemptStatus,
    #[serde(default)]
    pub last_value: Option<String>,
}

/// # NDOC
/// component: `engine::completion`
/// purpose: Prevent rework across passes of one page navigation.
/// invariants:
///   - A `succeeded` field is never attempted again in this navigation.
///   - A `failed` field closes after `max_retries` attempts.
#[derive(Debug)]
pub struct CompletionTracker {
    records: HashMap<(String, String), CompletionRecord>,
    max_retries: u32,
}

impl CompletionTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            records: HashMap::new(),
            max_retries: max_retries.max(1),
        }
    }

    pub fn record(
        &mut self,
        page_fingerprint: &str,
        stable_id: &str,
        status: AttemptStatus,
        value: Option<String>,
    ) {
        let key = (page_fingerprint.to_string(), stable_id.to_string());
        let entry = self.records.entry(key).or_insert(CompletionRecord {
            attempts: 0,
            last_status: status,
            last_value: None,
        });
        entry.attempts += 1;
        entry.last_status = status;
        entry.last_value = value;
    }

    pub fn status(&self, page_fingerprint: &str, stable_id: &str) -> Option<&CompletionRecord> {
        self.records
            .get(&(page_fingerprint.to_string(), stable_id.to_string()))
    }

    /// True when no further attempt should be made against this field.
    pub fn is_closed(&self, page_fingerprint: &str, stable_id: &str) -> bool {
        match self.status(page_fingerprint, stable_id) {
            None => false,
            Some(record) => match record.last_status {
                AttemptStatus::Succeeded | AttemptStatus::Skipped => true,
                AttemptStatus::Failed => record.attempts >= self.max_retries,
            },
        }
    }

    pub fn succeeded_ids(&self, page_fingerprint: &str) -> HashSet<String> {
        self.records
            .iter()
            .filter(|((fp, _), record)| {
                fp == page_fingerprint && record.last_status == AttemptStatus::Succeeded
            })
            .map(|((_, id), _)| id.clone())
            .collect()
    }

    pub fn failed_ids(&self, page_fingerprint: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|((fp, _), record)| {
                fp == page_fingerprint && record.last_status == AttemptStatus::Failed
            })
            .map(|((_, id), _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "a1b2c3d4";

    #[test]
    fn succeeded_fields_are_closed_immediately() {
        let mut tracker = CompletionTracker::new(3);
        tracker.record(FP, "id:email", AttemptStatus::Succeeded, Some("a@b.c".to_string()));
        assert!(tracker.is_closed(FP, "id:email"));
        assert!(tracker.succeeded_ids(FP).contains("id:email"));
    }

    #[test]
    fn failed_fields_stay_open_until_retry_budget() {
        let mut tracker = CompletionTracker::new(3);
        tracker.record(FP, "id:phone", AttemptStatus::Failed, None);
        assert!(!tracker.is_closed(FP, "id:phone"));
        tracker.record(FP, "id:phone", AttemptStatus::Failed, None);
        assert!(!tracker.is_closed(FP, "id:phone"));
        tracker.record(FP, "id:phone", AttemptStatus::Failed, None);
        assert!(tracker.is_closed(FP, "id:phone"));
        assert_eq!(tracker.status(FP, "id:phone").unwrap().attempts, 3);
    }

    #[test]
    fn late_success_closes_a_previously_failed_field() {
        let mut tracker = CompletionTracker::new(3);
        tracker.record(FP, "id:city", AttemptStatus::Failed, None);
        tracker.record(FP, "id:city", AttemptStatus::Succeeded, Some("Seattle".to_string()));
        assert!(tracker.is_closed(FP, "id:city"));
        assert!(tracker.failed_ids(FP).is_empty());
    }

    #[test]
    fn fingerprints_do_not_bleed_into_each_other() {
        let mut tracker = CompletionTracker::new(3);
        tracker.record(FP, "id:email", AttemptStatus::Succeeded, None);
        assert!(!tracker.is_closed("other_page", "id:email"));
        assert!(tracker.succeeded_ids("other_page").is_empty());
    }

    #[test]
    fn skipped_fields_are_closed() {
        let mut tracker = CompletionTracker::new(3);
        tracker.record(FP, "id:ssn", AttemptStatus::Skipped, None);
        assert!(tracker.is_closed(FP, "id:ssn"));
    }
}
