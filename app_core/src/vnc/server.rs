//! Remote-framebuffer server attached to one virtual display.

use crate::contracts::EngineResult;
use crate::vnc::ProcessError;
use std::time::Duration;
use tokio::process::{Child, Command};

const STARTUP_GRACE_MS: u64 = 300;

pub(crate) fn x11vnc_args(display: &str, port: u16, password: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-display".to_string(),
        display.to_string(),
        "-rfbport".to_string(),
        port.to_string(),
        "-forever".to_string(),
        "-shared".to_string(),
        "-localhost".to_string(),
        "-quiet".to_string(),
    ];
    match password {
        Some(password) => {
            args.push("-passwd".to_string());
            args.push(password.to_string());
        }
        None => args.push("-nopw".to_string()),
    }
    args
}

/// # NDOC
/// component: `vnc::server`
/// purpose: Own one x11vnc child exposing a display as an RFB stream.
pub struct VncServer {
    binary: String,
    display: String,
    port: u16,
    password: Option<String>,
    child: Option<Child>,
}

impl VncServer {
    pub fn new(binary: &str, display: &str, port: u16, password: Option<String>) -> Self {
        Self {
            binary: binary.to_string(),
            display: display.to_string(),
            port,
            password,
            child: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn start(&mut self) -> EngineResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let mut child = Command::new(&self.binary)
            .args(x11vnc_args(&self.display, self.port, self.password.as_deref()))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn { tool: "x11vnc", source })?;
        tokio::time::sleep(Duration::from_millis(STARTUP_GRACE_MS)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProcessError::EarlyExit { tool: "x11vnc", status }.into());
        }
        log::info!(display = self.display.as_str(), port = self.port; "vnc server started");
        self.child = Some(child);
        Ok(())
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            log::info!(port = self.port; "vnc server stopped");
        }
    }
}
