//! Session, fleet, and batch rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated identity attached to every request. Token minting is an
/// external concern; the core only consumes the resolved identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthIdentity {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub admin: bool,
}

impl AuthIdentity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            admin: false,
        }
    }
}

/// Lifecycle of one job session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Queued,
    Starting,
    Filling,
    Submitted,
    ReadyForReview,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Submitted | SessionState::ReadyForReview | SessionState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VncSessionStatus {
    Active,
    Closed,
    FailedRecovery,
}

/// # NDOC
/// component: `data_models::session`
/// purpose: Durable row for one live VNC session; used to recover live
///          sessions after a process restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VncSessionRecord {
    pub id: String,
    pub user_id: String,
    pub job_url: String,
    pub display_num: u16,
    pub vnc_port: u16,
    pub ws_port: u16,
    pub status: VncSessionStatus,
    pub created_at: DateTime<Utc>,
    pub allocated_host: String,
}

/// Per-slot state inside a batch. `Completed` covers both an automated
/// submit and a user marking a reviewed slot done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Queued,
    InProgress,
    Completed,
    ReadyForReview,
    Failed,
}

impl SlotState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SlotState::Completed | SlotState::ReadyForReview | SlotState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotLogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

const SLOT_LOG_CAP: usize = 200;

/// One URL's tracking state within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSlot {
    pub job_id: String,
    pub job_url: String,
    pub state: SlotState,
    pub progress_percent: u8,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub vnc_session_id: Option<String>,
    #[serde(default)]
    pub viewer_url: Option<String>,
    #[serde(default)]
    pub logs: Vec<SlotLogLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSlot {
    pub fn new(job_id: impl Into<String>, job_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            job_url: job_url.into(),
            state: SlotState::Queued,
            progress_percent: 0,
            error: None,
            vnc_session_id: None,
            viewer_url: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append one operator-readable progress line; the ring is bounded.
    pub fn push_log(&mut self, level: &str, message: impl Into<String>) {
        if self.logs.len() >= SLOT_LOG_CAP {
            self.logs.remove(0);
        }
        self.logs.push(SlotLogLine {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        });
        self.updated_at = Utc::now();
    }

    pub fn set_state(&mut self, state: SlotState) {
        self.state = state;
        if matches!(state, SlotState::Completed) {
            self.progress_percent = 100;
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Running,
    Completed,
    Closed,
}

/// A user's submission of bounded job URLs with per-URL slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub user_id: String,
    pub status: BatchStatus,
    pub slots: Vec<JobSlot>,
    pub created_at: DateTime<Utc>,
}

/// Observation-consistent slot counts: the five buckets always sum to the
/// total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub ready_for_review: usize,
    pub failed: usize,
}

impl Batch {
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts {
            total: self.slots.len(),
            queued: 0,
            in_progress: 0,
            completed: 0,
            ready_for_review: 0,
            failed: 0,
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Queued => counts.queued += 1,
                SlotState::InProgress => counts.in_progress += 1,
                SlotState::Completed => counts.completed += 1,
                SlotState::ReadyForReview => counts.ready_for_review += 1,
                SlotState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn slot_mut(&mut self, job_id: &str) -> Option<&mut JobSlot> {
        self.slots.iter_mut().find(|s| s.job_id == job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_always_sum_to_total() {
        let mut batch = Batch {
            batch_id: "b1".to_string(),
            user_id: "u1".to_string(),
            status: BatchStatus::Running,
            slots: (0..5)
                .map(|i| JobSlot::new(format!("j{i}"), format!("https://x.io/{i}")))
                .collect(),
            created_at: Utc::now(),
        };
        batch.slots[0].set_state(SlotState::Completed);
        batch.slots[1].set_state(SlotState::ReadyForReview);
        batch.slots[2].set_state(SlotState::Failed);
        batch.slots[3].set_state(SlotState::InProgress);

        let counts = batch.counts();
        assert_eq!(
            counts.total,
            counts.queued
                + counts.in_progress
                + counts.completed
                + counts.ready_for_review
                + counts.failed
        );
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.completed, 1);
    }

    #[test]
    fn slot_log_ring_is_bounded() {
        let mut slot = JobSlot::new("j1", "https://x.io/1");
        for i in 0..250 {
            slot.push_log("info", format!("line {i}"));
        }
        assert_eq!(slot.logs.len(), 200);
        assert_eq!(slot.logs.last().unwrap().message, "line 249");
        assert_eq!(slot.logs.first().unwrap().message, "line 50");
    }

    #[test]
    fn completed_slot_reports_full_progress() {
        let mut slot = JobSlot::new("j1", "https://x.io/1");
        slot.set_state(SlotState::Completed);
        assert_eq!(slot.progress_percent, 100);
        assert!(slot.state.is_terminal());
    }
}
