//! WebSocket tunnel from the user's viewer to the VNC server.

use crate::contracts::EngineResult;
use crate::vnc::ProcessError;
use std::time::Duration;
use tokio::process::{Child, Command};

const STARTUP_GRACE_MS: u64 = 300;

pub(crate) fn websockify_args(ws_port: u16, vnc_port: u16) -> Vec<String> {
    vec![
        ws_port.to_string(),
        format!("localhost:{vnc_port}"),
    ]
}

/// # NDOC
/// component: `vnc::bridge`
/// purpose: Own one websockify child tunneling WS to the RFB port.
pub struct WebsocketBridge {
    binary: String,
    ws_port: u16,
    vnc_port: u16,
    child: Option<Child>,
}

impl WebsocketBridge {
    pub fn new(binary: &str, ws_port: u16, vnc_port: u16) -> Self {
        Self {
            binary: binary.to_string(),
            ws_port,
            vnc_port,
            child: None,
        }
    }

    pub fn ws_port(&self) -> u16 {
        self.ws_port
    }

    pub async fn start(&mut self) -> EngineResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let mut child = Command::new(&self.binary)
            .args(websockify_args(self.ws_port, self.vnc_port))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn { tool: "websockify", source })?;
        tokio::time::sleep(Duration::from_millis(STARTUP_GRACE_MS)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(ProcessError::EarlyExit { tool: "websockify", status }.into());
        }
        log::info!(ws_port = self.ws_port, vnc_port = self.vnc_port; "websocket bridge started");
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
            log::info!(ws_port = self.ws_port; "websocket bridge stopped");
        }
    }
}
