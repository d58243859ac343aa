//! Priority-ordered reservation queue for the shared LLM budget.
//!
//! Policy:
//! 1. Callers reserve before any model call; lower numeric priority runs
//!    sooner, FIFO within a priority.
//! 2. A reservation is released exactly once on every execution path,
//!    including cancellation: the permit releases on drop.
//! 3. At most `max_concurrent` admitted reservations run at a time.

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct QueuedReservation {
    token: u64,
    user_id: String,
    priority: u8,
    seq: u64,
}

#[derive(Debug, Default)]
struct QuotaState {
    active: u64,
    next_token: u64,
    next_seq: u64,
    queue: Vec<QueuedReservation>,
}

/// # NDOC
/// component: `limits::quota_queue`
/// purpose: Shared LLM reservation queue with RAII release.
/// invariants:
///   - Every reserved token is released exactly once (drop-based).
///   - Admission order is (priority asc, arrival asc).
#[derive(Debug, Clone)]
pub struct LlmQuota {
    state: Arc<Mutex<QuotaState>>,
    notify: Arc<Notify>,
    max_concurrent: u64,
}

/// Admission permit. Dropping it frees the slot (or the queue entry when
/// the permit never reached the front).
pub struct QuotaPermit {
    quota: LlmQuota,
    token: u64,
    admitted: bool,
}

impl QuotaPermit {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.quota.release(self.token, self.admitted);
    }
}

impl LlmQuota {
    pub fn new(max_concurrent: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(QuotaState::default())),
            notify: Arc::new(Notify::new()),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Enqueue a reservation without waiting. The returned permit is not
    /// yet admitted; pass it to [`LlmQuota::wait_turn`].
    pub fn reserve(&self, user_id: &str, priority: u8) -> QuotaPermit {
        let token = {
            let mut state = self.state.lock().expect("quota state poisoned");
            let token = state.next_token;
            state.next_token += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueuedReservation {
                token,
                user_id: user_id.to_string(),
                priority,
                seq,
            });
            state.queue.sort_by_key(|r| (r.priority, r.seq));
            let position = state
                .queue
                .iter()
                .position(|r| r.token == token)
                .unwrap_or(0);
            log::debug!(
                user_id = user_id,
                priority = priority,
                position = position;
                "llm reservation queued"
            );
            token
        };
        QuotaPermit {
            quota: self.clone(),
            token,
            admitted: false,
        }
    }

    /// Wait until the permit reaches the queue front and a slot frees.
    pub async fn wait_turn(&self, permit: &mut QuotaPermit) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            // Register interest before checking state so a release between
            // the check and the await cannot be lost.
            notified.as_mut().enable();
            let admitted = {
                let mut state = self.state.lock().expect("quota state poisoned");
                let at_front = state
                    .queue
                    .first()
                    .map(|r| r.token == permit.token)
                    .unwrap_or(false);
                if at_front && state.active < self.max_concurrent {
                    state.queue.remove(0);
                    state.active += 1;
                    true
                } else {
                    false
                }
            };
            if admitted {
                permit.admitted = true;
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }

    /// Reserve and wait in one step.
    pub async fn acquire(&self, user_id: &str, priority: u8) -> QuotaPermit {
        let mut permit = self.reserve(user_id, priority);
        self.wait_turn(&mut permit).await;
        permit
    }

    /// Zero-based position in the waiting queue; `None` once admitted or
    /// released.
    pub fn queue_position(&self, token: u64) -> Option<usize> {
        let state = self.state.lock().ok()?;
        state.queue.iter().position(|r| r.token == token)
    }

    pub fn active_count(&self) -> u64 {
        self.state.lock().map(|s| s.active).unwrap_or(0)
    }

    fn release(&self, token: u64, admitted: bool) {
        if let Ok(mut state) = self.state.lock() {
            if admitted {
                state.active = state.active.saturating_sub(1);
            } else {
                if let Some(entry) = state.queue.iter().find(|r| r.token == token) {
                    log::debug!(
                        user_id = entry.user_id.as_str();
                        "llm reservation abandoned before admission"
                    );
                }
                state.queue.retain(|r| r.token != token);
            }
        }
        self.notify.notify_waiters();
    }
}
