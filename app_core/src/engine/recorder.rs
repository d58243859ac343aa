//! Append-only action recording with a durable per-(user, job) store.
//!
//! Every interactor invocation yields one record. Records survive the
//! session for 24 hours (configurable) to support replay and debugging; a
//! sweep deletes expired rows. Marking a session complete sets the
//! terminal flag on its row.

use crate::contracts::{EngineError, EngineResult};
use crate::data_models::action::{ActionLog, ActionRecord};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const STORE_DIR: &str = "action_logs";

/// Durable row shape: the record list rides as an encoded blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedActionRow {
    user_id: String,
    job_id: String,
    action_log_blob: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    completed: bool,
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn row_path(state_root: &Path, user_id: &str, job_id: &str) -> PathBuf {
    state_root
        .join(STORE_DIR)
        .join(sanitize_id(user_id))
        .join(format!("{}.json", sanitize_id(job_id)))
}

fn encode_records(records: &[ActionRecord]) -> EngineResult<String> {
    let raw = serde_json::to_vec(records)?;
    Ok(BASE64.encode(raw))
}

fn decode_records(blob: &str) -> EngineResult<Vec<ActionRecord>> {
    let raw = BASE64
        .decode(blob)
        .map_err(|e| EngineError::internal(format!("corrupt action blob: {e}")))?;
    serde_json::from_slice(&raw).map_err(EngineError::from)
}

fn write_row(path: &Path, row: &PersistedActionRow) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| EngineError::internal(format!("action store mkdir failed: {e}")))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| EngineError::internal(format!("action store open failed: {e}")))?;
    file.lock_exclusive()
        .map_err(|e| EngineError::internal(format!("action store lock failed: {e}")))?;
    let serialized = serde_json::to_string_pretty(row)?;
    file.set_len(0)
        .and_then(|_| file.seek(SeekFrom::Start(0)))
        .and_then(|_| file.write_all(serialized.as_bytes()))
        .map_err(|e| EngineError::internal(format!("action store write failed: {e}")))?;
    Ok(())
}

fn read_row(path: &Path) -> EngineResult<Option<PersistedActionRow>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| EngineError::internal(format!("action store open failed: {e}")))?;
    file.lock_shared()
        .map_err(|e| EngineError::internal(format!("action store lock failed: {e}")))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| EngineError::internal(format!("action store read failed: {e}")))?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&contents)?))
}

/// # NDOC
/// component: `engine::recorder`
/// purpose: Append-only interaction log for one (user, job).
/// invariants:
///   - Records are never mutated after append.
///   - Persistence is best-effort; a failed write never fails the session.
pub struct ActionRecorder {
    path: PathBuf,
    log: Mutex<ActionLog>,
}

impl ActionRecorder {
    pub fn new(state_root: &Path, user_id: &str, job_id: &str, ttl_hours: i64) -> Self {
        Self {
            path: row_path(state_root, user_id, job_id),
            log: Mutex::new(ActionLog::new(user_id, job_id, ttl_hours)),
        }
    }

    pub fn record(&self, record: ActionRecord) {
        let mut log = self.log.lock().expect("action log poisoned");
        log.records.push(record);
        self.persist(&log);
    }

    pub fn mark_completed(&self) {
        let mut log = self.log.lock().expect("action log poisoned");
        log.completed = true;
        self.persist(&log);
    }

    pub fn records(&self) -> Vec<ActionRecord> {
        self.log.lock().expect("action log poisoned").records.clone()
    }

    /// Last `n` records with secret-bearing values masked, for user-visible
    /// failure payloads.
    pub fn recent_redacted(&self, n: usize) -> Vec<ActionRecord> {
        let log = self.log.lock().expect("action log poisoned");
        log.records
            .iter()
            .rev()
            .take(n)
            .cloned()
            .map(redact_record)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    fn persist(&self, log: &ActionLog) {
        let blob = match encode_records(&log.records) {
            Ok(blob) => blob,
            Err(err) => {
                log_store_warning(&err);
                return;
            }
        };
        let row = PersistedActionRow {
            user_id: log.user_id.clone(),
            job_id: log.job_id.clone(),
            action_log_blob: blob,
            created_at: log.created_at,
            expires_at: log.expires_at,
            completed: log.completed,
        };
        if let Err(err) = write_row(&self.path, &row) {
            log_store_warning(&err);
        }
    }
}

fn log_store_warning(err: &EngineError) {
    log::warn!(error = err.message.as_str(); "action log persistence failed");
}

fn redact_record(mut record: ActionRecord) -> ActionRecord {
    let hints = ["password", "ssn", "secret", "token"];
    let sensitive_id = record
        .stable_id
        .as_deref()
        .map(|id| {
            let id = id.to_lowercase();
            hints.iter().any(|h| id.contains(h))
        })
        .unwrap_or(false);
    if sensitive_id {
        record.value = record.value.as_ref().map(|_| "***".to_string());
        if let Some(verification) = record.verification.as_mut() {
            verification.expected = verification.expected.as_ref().map(|_| "***".to_string());
            verification.actual = verification.actual.as_ref().map(|_| "***".to_string());
        }
    }
    record
}

/// Load a persisted log for replay/debugging.
pub fn load_action_log(state_root: &Path, user_id: &str, job_id: &str) -> EngineResult<Option<ActionLog>> {
    let Some(row) = read_row(&row_path(state_root, user_id, job_id))? else {
        return Ok(None);
    };
    Ok(Some(ActionLog {
        user_id: row.user_id,
        job_id: row.job_id,
        records: decode_records(&row.action_log_blob)?,
        created_at: row.created_at,
        expires_at: row.expires_at,
        completed: row.completed,
    }))
}

/// Re-apply a recorded log against a live page: fills, selects, clicks,
/// and uploads replay in order; navigation and waits are skipped. Only
/// records that succeeded originally are replayed.
pub async fn replay_log(
    driver: &std::sync::Arc<dyn crate::browser::driver::BrowserDriver>,
    log: &ActionLog,
) -> EngineResult<usize> {
    use crate::data_models::action::ActionKind;
    let mut replayed = 0;
    for record in log.records.iter().filter(|r| r.success) {
        let Some(stable_id) = record.stable_id.as_deref() else {
            continue;
        };
        // Recorded stable ids of the id:/name: families resolve directly.
        let selector = match stable_id.split_once(':') {
            Some(("id", id)) => format!("#{id}"),
            Some(("name", name)) => format!("[name='{name}']"),
            _ => continue,
        };
        let value = record.value.as_deref().unwrap_or_default();
        let outcome = match record.kind {
            ActionKind::Fill => driver.fill(&selector, value).await,
            ActionKind::Select => driver.select_by_label(&selector, value).await,
            ActionKind::Click => driver.click(&selector).await,
            ActionKind::Upload => {
                driver
                    .set_files(&selector, std::path::Path::new(value))
                    .await
            }
            ActionKind::Navigate | ActionKind::Wait | ActionKind::Submit => continue,
        };
        match outcome {
            Ok(()) => replayed += 1,
            Err(err) => {
                log::warn!(
                    stable_id = stable_id,
                    error = err.message.as_str();
                    "replay step failed, continuing"
                );
            }
        }
    }
    Ok(replayed)
}

/// Delete expired rows; returns how many were removed.
pub fn sweep_expired_action_logs(state_root: &Path, now: DateTime<Utc>) -> usize {
    let dir = state_root.join(STORE_DIR);
    let mut removed = 0;
    let Ok(users) = fs::read_dir(&dir) else {
        return 0;
    };
    for user_entry in users.flatten() {
        let Ok(jobs) = fs::read_dir(user_entry.path()) else {
            continue;
        };
        for job_entry in jobs.flatten() {
            let path = job_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = match read_row(&path) {
                Ok(Some(row)) => now >= row.expires_at,
                Ok(None) => true,
                Err(_) => false,
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}
