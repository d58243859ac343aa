//! Runtime configuration loaded from the environment.
//!
//! Every tunable the engine consults lives here so that components never
//! hard-code limits. Unset or invalid values fall back to defaults. `.env`
//! files are honored via `dotenv` when present.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

const ENV_PREFIX: &str = "APPLYFLOW_";

/// One sliding-window rule: at most `max_count` events per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub window_secs: u64,
    pub max_count: u64,
}

/// Recognized limit keys. Values are defaults; deployments override via
/// `APPLYFLOW_LIMITS_JSON` (a JSON object of key -> {window_secs, max_count}).
pub const LIMIT_LLM_CALLS_PER_MINUTE: &str = "llm_calls_per_minute_global";
pub const LIMIT_LLM_CALLS_PER_DAY: &str = "llm_calls_per_day_global";
pub const LIMIT_TAILORING_PER_USER_PER_DAY: &str = "resume_tailoring_per_user_per_day";
pub const LIMIT_APPLICATIONS_PER_USER_PER_DAY: &str = "job_applications_per_user_per_day";
pub const LIMIT_API_CALLS_PER_USER_PER_MINUTE: &str = "api_calls_per_user_per_minute";
pub const LIMIT_CONCURRENT_TAILORING: &str = "concurrent_tailoring_sessions";
pub const LIMIT_CONCURRENT_APPLICATIONS: &str = "concurrent_application_sessions";

fn default_limit_rules() -> HashMap<String, LimitRule> {
    let mut rules = HashMap::new();
    rules.insert(
        LIMIT_LLM_CALLS_PER_MINUTE.to_string(),
        LimitRule { window_secs: 60, max_count: 30 },
    );
    rules.insert(
        LIMIT_LLM_CALLS_PER_DAY.to_string(),
        LimitRule { window_secs: 86_400, max_count: 2_000 },
    );
    rules.insert(
        LIMIT_TAILORING_PER_USER_PER_DAY.to_string(),
        LimitRule { window_secs: 86_400, max_count: 20 },
    );
    rules.insert(
        LIMIT_APPLICATIONS_PER_USER_PER_DAY.to_string(),
        LimitRule { window_secs: 86_400, max_count: 50 },
    );
    rules.insert(
        LIMIT_API_CALLS_PER_USER_PER_MINUTE.to_string(),
        LimitRule { window_secs: 60, max_count: 60 },
    );
    rules.insert(
        LIMIT_CONCURRENT_TAILORING.to_string(),
        LimitRule { window_secs: 0, max_count: 3 },
    );
    rules.insert(
        LIMIT_CONCURRENT_APPLICATIONS.to_string(),
        LimitRule { window_secs: 0, max_count: 5 },
    );
    rules
}

/// # NDOC
/// component: `config`
/// purpose: Single configuration value threaded through the `Runtime`.
/// invariants:
///   - Loading never fails; invalid env values fall back to defaults.
///   - Components read tunables from here, never from `std::env` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Credential for the LLM backend. Absent means the AI pass is disabled.
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_api_base: String,
    pub llm_timeout_secs: u64,
    pub llm_max_attempts: u32,
    /// Upper bound on LLM calls charged to one user across all passes of one job.
    pub llm_calls_per_job: u32,
    /// Admitted reservations allowed to hold the backend at once.
    pub llm_max_in_flight: u64,

    /// Admin identities that bypass every rate-limit check.
    pub admin_emails: Vec<String>,
    /// Key for at-rest secrets; absence disables persisted credentials.
    pub encryption_key: Option<String>,

    pub base_display_num: u16,
    pub base_vnc_port: u16,
    pub base_ws_port: u16,
    pub base_debug_port: u16,
    pub max_sessions: usize,
    pub display_width: u32,
    pub display_height: u32,
    /// Low-privilege OS identity the sandboxed browser runs under, when set.
    pub sandbox_user: Option<String>,
    pub browser_binary: String,
    pub xvfb_binary: String,
    pub x11vnc_binary: String,
    pub websockify_binary: String,
    pub sandbox_root: PathBuf,
    pub state_root: PathBuf,
    pub public_host: String,

    pub max_retries: u32,
    pub settle_wait_ms: u64,
    pub max_fill_passes: u32,
    pub similarity_threshold: f64,
    pub max_batch_urls: usize,
    pub max_skills_per_field: usize,

    pub recovery_window_hours: i64,
    pub action_record_ttl_hours: i64,
    pub session_idle_horizon_minutes: i64,

    pub limit_rules: HashMap<String, LimitRule>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_model: "gemini-2.0-flash".to_string(),
            llm_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            llm_timeout_secs: 60,
            llm_max_attempts: 3,
            llm_calls_per_job: 12,
            llm_max_in_flight: 2,
            admin_emails: Vec::new(),
            encryption_key: None,
            base_display_num: 99,
            base_vnc_port: 5900,
            base_ws_port: 6080,
            base_debug_port: 9222,
            max_sessions: 10,
            display_width: 1920,
            display_height: 1080,
            sandbox_user: None,
            browser_binary: "chromium".to_string(),
            xvfb_binary: "Xvfb".to_string(),
            x11vnc_binary: "x11vnc".to_string(),
            websockify_binary: "websockify".to_string(),
            sandbox_root: default_runtime_root().join("sessions"),
            state_root: default_runtime_root().join("state"),
            public_host: "localhost".to_string(),
            max_retries: 3,
            settle_wait_ms: 300,
            max_fill_passes: 4,
            similarity_threshold: 0.8,
            max_batch_urls: 10,
            max_skills_per_field: 10,
            recovery_window_hours: 24,
            action_record_ttl_hours: 24,
            session_idle_horizon_minutes: 120,
            limit_rules: default_limit_rules(),
        }
    }
}

fn default_runtime_root() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(".applyflow_runtime");
        }
    }
    PathBuf::from(".applyflow_runtime")
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl RuntimeConfig {
    /// Load configuration from the environment, applying defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        let defaults = Self::default();

        let admin_emails = env_string("ADMIN_EMAILS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut limit_rules = default_limit_rules();
        if let Some(raw) = env_string("LIMITS_JSON") {
            match serde_json::from_str::<HashMap<String, LimitRule>>(&raw) {
                Ok(overrides) => limit_rules.extend(overrides),
                Err(e) => log::warn!("ignoring malformed {ENV_PREFIX}LIMITS_JSON: {e}"),
            }
        }

        Self {
            llm_api_key: env_string("LLM_API_KEY")
                .or_else(|| std::env::var("GEMINI_API_KEY").ok().filter(|v| !v.trim().is_empty())),
            llm_model: env_string("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_api_base: env_string("LLM_API_BASE").unwrap_or(defaults.llm_api_base),
            llm_timeout_secs: env_parse("LLM_TIMEOUT_SECS", defaults.llm_timeout_secs),
            llm_max_attempts: env_parse("LLM_MAX_ATTEMPTS", defaults.llm_max_attempts),
            llm_calls_per_job: env_parse("LLM_CALLS_PER_JOB", defaults.llm_calls_per_job),
            llm_max_in_flight: env_parse("LLM_MAX_IN_FLIGHT", defaults.llm_max_in_flight),
            admin_emails,
            encryption_key: env_string("ENCRYPTION_KEY"),
            base_display_num: env_parse("BASE_DISPLAY_NUM", defaults.base_display_num),
            base_vnc_port: env_parse("BASE_VNC_PORT", defaults.base_vnc_port),
            base_ws_port: env_parse("BASE_WS_PORT", defaults.base_ws_port),
            base_debug_port: env_parse("BASE_DEBUG_PORT", defaults.base_debug_port),
            max_sessions: env_parse("MAX_SESSIONS", defaults.max_sessions),
            display_width: env_parse("DISPLAY_WIDTH", defaults.display_width),
            display_height: env_parse("DISPLAY_HEIGHT", defaults.display_height),
            sandbox_user: env_string("SANDBOX_USER"),
            browser_binary: env_string("BROWSER_BINARY").unwrap_or(defaults.browser_binary),
            xvfb_binary: env_string("XVFB_BINARY").unwrap_or(defaults.xvfb_binary),
            x11vnc_binary: env_string("X11VNC_BINARY").unwrap_or(defaults.x11vnc_binary),
            websockify_binary: env_string("WEBSOCKIFY_BINARY").unwrap_or(defaults.websockify_binary),
            sandbox_root: env_string("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_root),
            state_root: env_string("STATE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_root),
            public_host: env_string("PUBLIC_HOST").unwrap_or(defaults.public_host),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            settle_wait_ms: env_parse("SETTLE_WAIT_MS", defaults.settle_wait_ms),
            max_fill_passes: env_parse("MAX_FILL_PASSES", defaults.max_fill_passes),
            similarity_threshold: env_parse("SIMILARITY_THRESHOLD", defaults.similarity_threshold),
            max_batch_urls: env_parse("MAX_BATCH_URLS", defaults.max_batch_urls),
            max_skills_per_field: env_parse("MAX_SKILLS_PER_FIELD", defaults.max_skills_per_field),
            recovery_window_hours: env_parse("RECOVERY_WINDOW_HOURS", defaults.recovery_window_hours),
            action_record_ttl_hours: env_parse("ACTION_RECORD_TTL_HOURS", defaults.action_record_ttl_hours),
            session_idle_horizon_minutes: env_parse(
                "SESSION_IDLE_HORIZON_MINUTES",
                defaults.session_idle_horizon_minutes,
            ),
            limit_rules,
        }
    }

    pub fn is_admin(&self, email: &str) -> bool {
        let needle = email.trim().to_lowercase();
        self.admin_emails.iter().any(|e| *e == needle)
    }

    pub fn limit_rule(&self, key: &str) -> Option<LimitRule> {
        self.limit_rules.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_all_recognized_limit_keys() {
        let config = RuntimeConfig::default();
        for key in [
            LIMIT_LLM_CALLS_PER_MINUTE,
            LIMIT_LLM_CALLS_PER_DAY,
            LIMIT_TAILORING_PER_USER_PER_DAY,
            LIMIT_APPLICATIONS_PER_USER_PER_DAY,
            LIMIT_API_CALLS_PER_USER_PER_MINUTE,
            LIMIT_CONCURRENT_TAILORING,
            LIMIT_CONCURRENT_APPLICATIONS,
        ] {
            assert!(config.limit_rule(key).is_some(), "missing rule for {key}");
        }
    }

    #[test]
    fn admin_check_is_case_insensitive() {
        let config = RuntimeConfig {
            admin_emails: vec!["ops@example.com".to_string()],
            ..RuntimeConfig::default()
        };
        assert!(config.is_admin("Ops@Example.com"));
        assert!(!config.is_admin("user@example.com"));
    }

    #[test]
    fn limits_json_overrides_merge_over_defaults() {
        let mut config = RuntimeConfig::default();
        let overrides: HashMap<String, LimitRule> = serde_json::from_str(
            r#"{"llm_calls_per_minute_global":{"window_secs":60,"max_count":5}}"#,
        )
        .expect("parse overrides");
        config.limit_rules.extend(overrides);

        let rule = config.limit_rule(LIMIT_LLM_CALLS_PER_MINUTE).expect("rule");
        assert_eq!(rule.max_count, 5);
        assert!(config.limit_rule(LIMIT_LLM_CALLS_PER_DAY).is_some());
    }
}
