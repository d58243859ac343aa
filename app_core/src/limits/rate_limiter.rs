//! Sliding-window rate limiting over a file-locked shared store.
//!
//! Policy:
//! 1. Limits come from configuration; nothing here is hard-coded.
//! 2. Admin identities from the allow-list bypass every check.
//! 3. Store failures fail **open** for request admission.
//! 4. Store failures never fail open for accounting of issued LLM calls:
//!    the write is retried with short bounded backoff and, if it still
//!    fails, the call is logged `unbilled=true` for operator attention.
//! 5. Concurrency-style limits (window of zero) are tracked in memory and
//!    released through an RAII permit.

use crate::config::{LimitRule, RuntimeConfig};
use crate::contracts::EngineError;
use crate::data_models::session::AuthIdentity;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WINDOWS_FILENAME: &str = "rate_limit_windows_v1.json";
const ACCOUNTING_RETRIES: u32 = 2;
const ACCOUNTING_BACKOFF_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct WindowState {
    /// Event timestamps (epoch millis) per "limit_type|identifier" key.
    events: HashMap<String, Vec<i64>>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_seconds: u64,
}

impl LimitDecision {
    fn open(limit: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: Utc::now(),
            retry_after_seconds: 0,
        }
    }
}

/// RAII permit for a concurrency-style limit; the slot frees on drop.
pub struct ConcurrencyPermit {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    key: String,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Ok(mut counters) = self.counters.lock() {
            if let Some(active) = counters.get_mut(&self.key) {
                *active = active.saturating_sub(1);
            }
        }
    }
}

/// # NDOC
/// component: `limits::rate_limiter`
/// purpose: Sliding-window counters per (limit key, identifier).
/// invariants:
///   - Admission fails open when the store is unreachable.
///   - Accounting of issued LLM calls never silently drops; it retries and
///     then logs `unbilled`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rules: HashMap<String, LimitRule>,
    admin_emails: Vec<String>,
    windows_path: PathBuf,
    concurrency: Arc<Mutex<HashMap<String, u64>>>,
}

impl RateLimiter {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            rules: config.limit_rules.clone(),
            admin_emails: config.admin_emails.clone(),
            windows_path: config.state_root.join(WINDOWS_FILENAME),
            concurrency: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[cfg(test)]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.windows_path = path.into();
        self
    }

    pub fn is_bypassed(&self, identity: &AuthIdentity) -> bool {
        identity.admin
            || self
                .admin_emails
                .iter()
                .any(|e| e.eq_ignore_ascii_case(identity.email.trim()))
    }

    /// Check whether one more event is admissible for `(limit_type, identifier)`.
    pub fn check(&self, limit_type: &str, identifier: &str) -> LimitDecision {
        let Some(rule) = self.rules.get(limit_type).copied() else {
            // Unconfigured limit keys admit; operators see the gap in logs.
            log::warn!(limit_type = limit_type; "admission check for unconfigured limit key");
            return LimitDecision::open(u64::MAX);
        };
        if rule.window_secs == 0 {
            return self.check_concurrent(limit_type, identifier, rule);
        }

        let key = store_key(limit_type, identifier);
        let now = Utc::now();
        let result = with_locked_state(&self.windows_path, |state| {
            let events = state.events.entry(key.clone()).or_default();
            prune_window(events, now, rule.window_secs);
            let used = events.len() as u64;
            let reset_at = events
                .first()
                .map(|t| epoch_to_utc(*t) + ChronoDuration::seconds(rule.window_secs as i64))
                .unwrap_or(now);
            Ok(LimitDecision {
                allowed: used < rule.max_count,
                limit: rule.max_count,
                remaining: rule.max_count.saturating_sub(used),
                reset_at,
                retry_after_seconds: if used < rule.max_count {
                    0
                } else {
                    (reset_at - now).num_seconds().max(1) as u64
                },
            })
        });

        match result {
            Ok(decision) => decision,
            Err(err) => {
                // Admission fails open on a degraded store.
                log::warn!(
                    limit_type = limit_type,
                    identifier = identifier,
                    error = err.message.as_str();
                    "rate-limit store unavailable, admitting request"
                );
                LimitDecision::open(rule.max_count)
            }
        }
    }

    /// Same as `check`, honoring the admin bypass.
    pub fn check_identity(
        &self,
        limit_type: &str,
        identifier: &str,
        identity: &AuthIdentity,
    ) -> LimitDecision {
        if self.is_bypassed(identity) {
            return LimitDecision::open(u64::MAX);
        }
        self.check(limit_type, identifier)
    }

    /// Record `n` consumed events. Store failures surface to the caller.
    pub fn consume(&self, limit_type: &str, identifier: &str, n: u64) -> Result<(), EngineError> {
        let Some(rule) = self.rules.get(limit_type).copied() else {
            return Ok(());
        };
        if rule.window_secs == 0 {
            return Ok(());
        }
        let key = store_key(limit_type, identifier);
        let now = Utc::now();
        with_locked_state(&self.windows_path, |state| {
            let events = state.events.entry(key.clone()).or_default();
            prune_window(events, now, rule.window_secs);
            for _ in 0..n {
                events.push(now.timestamp_millis());
            }
            Ok(())
        })
    }

    /// Accounting for an LLM call that was already issued. Never blocks the
    /// call result: retries briefly, then logs the usage as unbilled.
    pub fn account_issued_call(&self, limit_type: &str, identifier: &str) {
        let mut attempt = 0;
        loop {
            match self.consume(limit_type, identifier, 1) {
                Ok(()) => return,
                Err(err) if attempt < ACCOUNTING_RETRIES => {
                    attempt += 1;
                    log::warn!(
                        limit_type = limit_type,
                        attempt = attempt,
                        error = err.message.as_str();
                        "retrying rate-limit accounting write"
                    );
                    std::thread::sleep(Duration::from_millis(ACCOUNTING_BACKOFF_MS * attempt as u64));
                }
                Err(err) => {
                    log::error!(
                        limit_type = limit_type,
                        identifier = identifier,
                        unbilled = true,
                        error = err.message.as_str();
                        "rate-limit accounting failed; call issued unbilled"
                    );
                    return;
                }
            }
        }
    }

    /// Acquire a slot of a concurrency-style limit; `None` when saturated.
    pub fn try_acquire_concurrent(
        &self,
        limit_type: &str,
        identifier: &str,
    ) -> Option<ConcurrencyPermit> {
        let rule = self.rules.get(limit_type).copied()?;
        let key = store_key(limit_type, identifier);
        let mut counters = self.concurrency.lock().ok()?;
        let active = counters.entry(key.clone()).or_insert(0);
        if *active >= rule.max_count {
            return None;
        }
        *active += 1;
        Some(ConcurrencyPermit {
            counters: Arc::clone(&self.concurrency),
            key,
        })
    }

    fn check_concurrent(
        &self,
        _limit_type: &str,
        identifier: &str,
        rule: LimitRule,
    ) -> LimitDecision {
        let key = store_key(_limit_type, identifier);
        let active = self
            .concurrency
            .lock()
            .ok()
            .and_then(|c| c.get(&key).copied())
            .unwrap_or(0);
        LimitDecision {
            allowed: active < rule.max_count,
            limit: rule.max_count,
            remaining: rule.max_count.saturating_sub(active),
            reset_at: Utc::now(),
            retry_after_seconds: if active < rule.max_count { 0 } else { 5 },
        }
    }
}

fn store_key(limit_type: &str, identifier: &str) -> String {
    format!("{limit_type}|{identifier}")
}

fn epoch_to_utc(epoch_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms).unwrap_or_else(Utc::now)
}

fn prune_window(events: &mut Vec<i64>, now: DateTime<Utc>, window_secs: u64) {
    let cutoff = (now - ChronoDuration::seconds(window_secs as i64)).timestamp_millis();
    events.retain(|t| *t > cutoff);
}

fn ensure_parent(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(parent).map_err(|err| {
        EngineError::internal(format!("failed to create limit store directory: {err}"))
    })
}

fn with_locked_state<T>(
    path: &Path,
    f: impl FnOnce(&mut WindowState) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|err| EngineError::internal(format!("failed to open limit store: {err}")))?;
    file.lock_exclusive()
        .map_err(|err| EngineError::internal(format!("failed to lock limit store: {err}")))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|err| EngineError::internal(format!("failed to read limit store: {err}")))?;
    let mut state = if contents.trim().is_empty() {
        WindowState::default()
    } else {
        serde_json::from_str::<WindowState>(&contents)
            .map_err(|err| EngineError::internal(format!("failed to parse limit store: {err}")))?
    };

    let result = f(&mut state)?;

    let serialized = serde_json::to_string(&state)
        .map_err(|err| EngineError::internal(format!("failed to serialize limit store: {err}")))?;
    file.set_len(0)
        .and_then(|_| file.seek(SeekFrom::Start(0)))
        .and_then(|_| file.write_all(serialized.as_bytes()))
        .map_err(|err| EngineError::internal(format!("failed to write limit store: {err}")))?;

    Ok(result)
}
