//! The exposed session API, transport-free.
//!
//! An HTTP layer in front of this maps one call to one endpoint; the
//! payload shapes and status classes are decided here. Admission failures
//! carry `{limit, retry_after_seconds, reset_at}`; validation failures a
//! single human-readable reason; everything else an opaque error id that
//! is also written to the action log stream.

use crate::contracts::{EngineError, EngineErrorKind, EngineResult};
use crate::data_models::session::AuthIdentity;
use crate::orchestration::batch::{BatchRequest, BatchScheduler};
use crate::orchestration::runtime::Runtime;
use rand::Rng;
use serde_json::{json, Value};

/// HTTP-class mapping for the error taxonomy.
pub fn status_class(kind: &EngineErrorKind) -> u16 {
    match kind {
        EngineErrorKind::ValidationError => 400,
        EngineErrorKind::AdmissionError | EngineErrorKind::RateLimitError => 429,
        _ => 500,
    }
}

/// Error payload surfaced to callers.
pub fn error_payload(err: &EngineError) -> (u16, Value) {
    let status = status_class(&err.kind);
    let body = match status {
        400 => json!({ "error": err.message }),
        429 => {
            let details = err.details.clone().unwrap_or_else(|| json!({}));
            json!({
                "error": err.message,
                "limit": details.get("limit").cloned().unwrap_or(Value::Null),
                "retry_after_seconds": details
                    .get("retry_after_seconds")
                    .cloned()
                    .unwrap_or(Value::Null),
                "reset_at": details.get("reset_at").cloned().unwrap_or(Value::Null),
            })
        }
        _ => {
            let error_id = format!("err_{:016x}", rand::thread_rng().gen::<u64>());
            log::error!(
                error_id = error_id.as_str(),
                kind = format!("{:?}", err.kind).as_str(),
                message = err.message.as_str();
                "internal error surfaced to caller"
            );
            json!({ "error_id": error_id })
        }
    };
    (status, body)
}

/// # NDOC
/// component: `orchestration::service`
/// purpose: One façade over batch scheduling and session control.
pub struct SessionService {
    runtime: Runtime,
    scheduler: BatchScheduler,
}

impl SessionService {
    pub fn new(runtime: Runtime) -> Self {
        let scheduler = BatchScheduler::new(runtime.clone());
        Self { runtime, scheduler }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Start job(s): `{job_urls, tailor_resume?}` → `{batch_id, job_slots}`.
    pub fn start_jobs(
        &self,
        identity: &AuthIdentity,
        request: BatchRequest,
    ) -> EngineResult<Value> {
        let submission = self.scheduler.submit(identity, request)?;
        Ok(serde_json::to_value(submission)?)
    }

    /// Batch status, shaped for a ~2s poll loop.
    pub fn batch_status(&self, identity: &AuthIdentity, batch_id: &str) -> EngineResult<Value> {
        let view = self.scheduler.status(identity, batch_id)?;
        Ok(serde_json::to_value(view)?)
    }

    pub async fn mark_slot_submitted(
        &self,
        identity: &AuthIdentity,
        batch_id: &str,
        job_id: &str,
    ) -> EngineResult<Value> {
        self.scheduler
            .mark_slot_submitted(identity, batch_id, job_id)
            .await?;
        Ok(json!({ "status": "completed" }))
    }

    pub async fn close_batch(&self, identity: &AuthIdentity, batch_id: &str) -> EngineResult<Value> {
        self.scheduler.close_batch(identity, batch_id).await?;
        Ok(json!({ "status": "closed" }))
    }

    /// Live VNC sessions of one user (operator/debug surface).
    pub async fn list_sessions(&self, identity: &AuthIdentity) -> EngineResult<Value> {
        let sessions = self
            .runtime
            .fleet
            .sessions_for_user(&identity.user_id)
            .await;
        Ok(serde_json::to_value(sessions)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_400_with_plain_reason() {
        let err = EngineError::validation("job_urls must not be empty");
        let (status, body) = error_payload(&err);
        assert_eq!(status, 400);
        assert_eq!(body["error"], "job_urls must not be empty");
    }

    #[test]
    fn admission_errors_map_to_429_with_limit_details() {
        let err = EngineError::admission("daily application budget exhausted").with_details(json!({
            "limit": 50,
            "retry_after_seconds": 3600,
            "reset_at": "2026-08-01T00:00:00Z",
        }));
        let (status, body) = error_payload(&err);
        assert_eq!(status, 429);
        assert_eq!(body["limit"], 50);
        assert_eq!(body["retry_after_seconds"], 3600);
    }

    #[test]
    fn internal_errors_map_to_500_with_opaque_id() {
        let err = EngineError::internal("database on fire");
        let (status, body) = error_payload(&err);
        assert_eq!(status, 500);
        let error_id = body["error_id"].as_str().expect("error id");
        assert!(error_id.starts_with("err_"));
        // The raw message never leaks.
        assert!(body.get("error").is_none());
    }
}
