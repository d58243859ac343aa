//! Per-session virtual display: one Xvfb child per coordinator.

use crate::contracts::EngineResult;
use crate::vnc::ProcessError;
use std::time::Duration;
use tokio::process::{Child, Command};

const STARTUP_GRACE_MS: u64 = 300;

pub(crate) fn xvfb_args(display_num: u16, width: u32, height: u32) -> Vec<String> {
    vec![
        format!(":{display_num}"),
        "-screen".to_string(),
        "0".to_string(),
        format!("{width}x{height}x24"),
        "-nolisten".to_string(),
        "tcp".to_string(),
        "-ac".to_string(),
    ]
}

/// # NDOC
/// component: `vnc::display`
/// purpose: Own one headless framebuffer process.
/// invariants:
///   - `stop` is idempotent and never errors.
pub struct VirtualDisplay {
    binary: String,
    display_num: u16,
    width: u32,
    height: u32,
    child: Option<Child>,
}

impl VirtualDisplay {
    pub fn new(binary: &str, display_num: u16, width: u32, height: u32) -> Self {
        Self {
            binary: binary.to_string(),
            display_num,
            width,
            height,
            child: None,
        }
    }

    pub fn display_env(&self) -> String {
        format!(":{}", self.display_num)
    }

    pub async fn start(&mut self) -> EngineResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let mut child = Command::new(&self.binary)
            .args(xvfb_args(self.display_num, self.width, self.height))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn { tool: "Xvfb", source })?;
        tokio::time::sleep(Duration::from_millis(STARTUP_GRACE_MS)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProcessError::EarlyExit { tool: "Xvfb", status }.into());
        }
        log::info!(display = self.display_env().as_str(); "virtual display started");
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
            log::info!(display = self.display_env().as_str(); "virtual display stopped");
        }
    }
}
