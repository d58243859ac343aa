//! Browser sandbox: an isolated home directory and a locked-down browser
//! process bound to one virtual display.
//!
//! The home is owner-only; the resume lands inside it before the browser
//! starts. The browser runs in single-URL app mode with no tabs and no
//! address bar, optionally under a low-privilege OS identity, and exposes
//! a local debug port for the automation driver to attach to.

use crate::contracts::{EngineError, EngineResult};
use crate::vnc::ProcessError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};

const STARTUP_GRACE_MS: u64 = 500;

/// Per-session private home with owner-only permissions.
#[derive(Debug, Clone)]
pub struct SandboxHome {
    path: PathBuf,
}

impl SandboxHome {
    pub fn create(root: &Path, user_id: &str, session_id: &str) -> EngineResult<Self> {
        let path = root.join(sanitize(user_id)).join(sanitize(session_id));
        std::fs::create_dir_all(&path)
            .map_err(|e| EngineError::resource(format!("sandbox home create failed: {e}")))?;
        restrict_permissions(&path, 0o700)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy resume bytes into the home; only the sandbox owner can read it.
    pub fn inject_resume(&self, file_name: &str, bytes: &[u8]) -> EngineResult<PathBuf> {
        let target = self.path.join(sanitize(file_name));
        std::fs::write(&target, bytes)
            .map_err(|e| EngineError::resource(format!("resume injection failed: {e}")))?;
        restrict_permissions(&target, 0o600)?;
        Ok(target)
    }

    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::warn!(
                path = self.path.display().to_string().as_str(),
                error = e.to_string().as_str();
                "sandbox home removal failed"
            );
        }
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| EngineError::resource(format!("permission set failed: {e}")))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> EngineResult<()> {
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SandboxLaunchSpec {
    pub browser_binary: String,
    /// Only the target's origin is reachable; the launch pins the start URL.
    pub app_url: String,
    pub home: PathBuf,
    pub display_env: String,
    pub debug_port: u16,
    pub window_width: u32,
    pub window_height: u32,
    /// Low-privilege identity; when unset the browser runs as the service.
    pub run_as_user: Option<String>,
}

pub(crate) fn browser_args(spec: &SandboxLaunchSpec) -> Vec<String> {
    vec![
        format!("--app={}", spec.app_url),
        format!("--user-data-dir={}", spec.home.join("browser-profile").display()),
        format!("--remote-debugging-port={}", spec.debug_port),
        format!("--window-size={},{}", spec.window_width, spec.window_height),
        "--window-position=0,0".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-extensions".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--disable-session-crashed-bubble".to_string(),
        "--no-sandbox".to_string(),
    ]
}

/// # NDOC
/// component: `vnc::sandbox`
/// purpose: Own the sandboxed browser child for one session.
/// invariants:
///   - The port is only considered free once this child is known dead.
pub struct BrowserSandbox {
    spec: SandboxLaunchSpec,
    child: Option<Child>,
}

impl BrowserSandbox {
    pub fn new(spec: SandboxLaunchSpec) -> Self {
        Self { spec, child: None }
    }

    pub fn debug_port(&self) -> u16 {
        self.spec.debug_port
    }

    pub async fn launch(&mut self) -> EngineResult<()> {
        if self.is_alive() {
            return Ok(());
        }
        let args = browser_args(&self.spec);
        let mut command = match &self.spec.run_as_user {
            Some(user) => {
                let mut c = Command::new("sudo");
                c.arg("-u")
                    .arg(user)
                    .arg("--preserve-env=DISPLAY")
                    .arg(&self.spec.browser_binary)
                    .args(&args);
                c
            }
            None => {
                let mut c = Command::new(&self.spec.browser_binary);
                c.args(&args);
                c
            }
        };
        command
            .env("DISPLAY", &self.spec.display_env)
            .env("HOME", &self.spec.home)
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { tool: "browser", source })?;
        tokio::time::sleep(Duration::from_millis(STARTUP_GRACE_MS)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProcessError::EarlyExit { tool: "browser", status }.into());
        }
        log::info!(
            display = self.spec.display_env.as_str(),
            debug_port = self.spec.debug_port;
            "sandboxed browser launched"
        );
        self.child = Some(child);
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill and wait; returns once the process is known dead.
    pub async fn kill_and_reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            log::info!(debug_port = self.spec.debug_port; "sandboxed browser reaped");
        }
    }
}
