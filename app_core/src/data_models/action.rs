//! Append-only interaction records persisted for replay and debugging.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Fill,
    Select,
    Click,
    Upload,
    Navigate,
    Wait,
    Submit,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
}

impl Verification {
    pub fn matched(&self) -> bool {
        match (&self.expected, &self.actual) {
            (Some(e), Some(a)) => e == a,
            _ => false,
        }
    }
}

/// # NDOC
/// component: `data_models::action`
/// purpose: One interaction with its outcome; append-only.
/// invariants:
///   - `success == true` requires a recorded verification whose
///     expected/actual agree (or a kind with no read-back, e.g. `wait`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    #[serde(default)]
    pub stable_id: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    pub success: bool,
    pub retry_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub verification: Option<Verification>,
}

impl ActionRecord {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            stable_id: None,
            value: None,
            success: false,
            retry_count: 0,
            error: None,
            verification: None,
        }
    }

    pub fn with_field(mut self, stable_id: impl Into<String>) -> Self {
        self.stable_id = Some(stable_id.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn succeeded(mut self, verification: Option<Verification>) -> Self {
        self.success = true;
        self.verification = verification;
        self
    }

    pub fn failed(mut self, error: impl Into<String>, retry_count: u32) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.retry_count = retry_count;
        self
    }
}

/// Per-(user, job) action log with a 24-hour time-to-live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLog {
    pub user_id: String,
    pub job_id: String,
    pub records: Vec<ActionRecord>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed: bool,
}

impl ActionLog {
    pub fn new(user_id: impl Into<String>, job_id: impl Into<String>, ttl_hours: i64) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            job_id: job_id.into(),
            records: Vec::new(),
            created_at: now,
            expires_at: now + Duration::hours(ttl_hours),
            completed: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_matches_only_on_agreement() {
        let verified = Verification {
            expected: Some("Jane".to_string()),
            actual: Some("Jane".to_string()),
        };
        assert!(verified.matched());

        let mismatch = Verification {
            expected: Some("Jane".to_string()),
            actual: Some("Jan".to_string()),
        };
        assert!(!mismatch.matched());
        assert!(!Verification::default().matched());
    }

    #[test]
    fn record_builders_set_outcome() {
        let ok = ActionRecord::new(ActionKind::Fill)
            .with_field("id:email")
            .with_value("jane@x.io")
            .succeeded(Some(Verification {
                expected: Some("jane@x.io".to_string()),
                actual: Some("jane@x.io".to_string()),
            }));
        assert!(ok.success);
        assert!(ok.verification.unwrap().matched());

        let bad = ActionRecord::new(ActionKind::Click).failed("overlay intercepted", 3);
        assert!(!bad.success);
        assert_eq!(bad.retry_count, 3);
    }

    #[test]
    fn log_expiry_uses_ttl() {
        let log = ActionLog::new("u1", "j1", 24);
        assert!(!log.is_expired(Utc::now()));
        assert!(log.is_expired(Utc::now() + Duration::hours(25)));
    }
}
