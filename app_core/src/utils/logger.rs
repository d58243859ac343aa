use log::kv::{self, Key, Value, Visitor};
use log::{Log, Metadata, Record, SetLoggerError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;

// --- Thread-local session ID storage ---

thread_local! {
    static CURRENT_SESSION_ID: RefCell<Option<String>> = RefCell::new(None);
}

/// Sets the current job-session ID for the calling thread.
pub fn set_current_session_id(session_id: String) {
    CURRENT_SESSION_ID.with(|id_cell| {
        *id_cell.borrow_mut() = Some(session_id);
    });
}

/// Clears the current job-session ID for the calling thread.
pub fn clear_current_session_id() {
    CURRENT_SESSION_ID.with(|id_cell| {
        *id_cell.borrow_mut() = None;
    });
}

// --- Log Record Structure for JSON output ---

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonLogRecord {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub session_id: Option<String>,
    pub name: String,
    pub module_path: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

// --- Custom Logger Implementation ---

struct JsonLogger;

/// Helper to collect key-value pairs from `log::kv::Source`
struct KeyValueCollector<'a>(&'a mut HashMap<String, serde_json::Value>);

impl<'a> Visitor<'a> for KeyValueCollector<'a> {
    fn visit_pair(&mut self, key: Key<'a>, value: Value<'a>) -> Result<(), kv::Error> {
        self.0
            .insert(key.as_str().to_string(), json!(value.to_string()));
        Ok(())
    }
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let session_id = CURRENT_SESSION_ID.with(|id_cell| id_cell.borrow().clone());

        let mut extra_fields = HashMap::new();
        let mut collector = KeyValueCollector(&mut extra_fields);
        if let Err(e) = record.key_values().visit(&mut collector) {
            eprintln!("Error visiting key-value pairs: {:?}", e);
        }

        let log_record = JsonLogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: record.level().to_string(),
            message: format!("{}", record.args()),
            session_id,
            name: record.target().to_string(),
            module_path: record.module_path().map(|s| s.to_string()),
            file: record.file().map(|s| s.to_string()),
            line: record.line(),
            extra: extra_fields,
        };

        match serde_json::to_string(&log_record) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to serialize log record: {}", e),
        }
    }

    fn flush(&self) {}
}

static LOGGER: JsonLogger = JsonLogger;

static INIT_LOGGER_ONCE: OnceCell<()> = OnceCell::new();

/// Initializes the custom JSON logger. Safe to call more than once.
pub fn init_logger() -> Result<(), SetLoggerError> {
    INIT_LOGGER_ONCE
        .get_or_try_init(|| {
            log::set_logger(&LOGGER)?;
            log::set_max_level(log::LevelFilter::Info);
            Ok(())
        })
        .map(|_| ())
}

// --- Specific logging functions ---

/// Logs one field interaction with its outcome.
pub fn log_field_action(stable_id: &str, kind: &str, success: bool, detail: &str) {
    log::info!(
        target: "field_action",
        stable_id = stable_id,
        kind = kind,
        success = success,
        detail = detail;
        "Field Action"
    );
}

/// Logs an LLM gateway call.
pub fn log_llm_call(purpose: &str, model: &str, prompt_chars: usize, ok: bool) {
    log::info!(
        target: "llm_gateway",
        purpose = purpose,
        model = model,
        prompt_chars = prompt_chars,
        ok = ok;
        "LLM Call"
    );
}

/// Logs a fleet lifecycle event (allocation, teardown, recovery).
pub fn log_fleet_event(session_id: &str, event: &str, detail: &str) {
    log::info!(
        target: "vnc_fleet",
        session_id = session_id,
        event = event,
        detail = detail;
        "Fleet Event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::info;

    #[test]
    fn logger_attaches_and_clears_session_id() {
        let _ = init_logger();

        set_current_session_id("sess_test_123".to_string());
        info!(target: "root", "message inside a session");
        log_field_action("id:first_name", "fill", true, "typed 4 chars");
        log_llm_call("dropdown_batch", "gemini-2.0-flash", 1830, true);
        clear_current_session_id();

        info!(target: "root", "message outside any session");
        log_fleet_event("sess_test_123", "teardown", "all children reaped");
    }
}
