//! Per-session owner of the virtual display, VNC server, WebSocket
//! bridge, sandbox home, and browser process.
//!
//! Startup is ordered: display, VNC server, bridge, home, resume, browser.
//! Teardown reverses the order; every step is best-effort and logged, and
//! the slot is only considered free once the browser is known dead.

use crate::config::RuntimeConfig;
use crate::contracts::EngineResult;
use crate::utils::logger::log_fleet_event;
use crate::vnc::bridge::WebsocketBridge;
use crate::vnc::display::VirtualDisplay;
use crate::vnc::sandbox::{BrowserSandbox, SandboxHome, SandboxLaunchSpec};
use crate::vnc::server::VncServer;
use std::path::PathBuf;

/// Client-side guards installed into every document of the session:
/// new-tab/new-window shortcuts are blocked and a session banner renders.
pub const SESSION_GUARD_JS: &str = r#"
(() => {
  window.open = () => null;
  document.addEventListener('keydown', (event) => {
    const key = (event.key || '').toLowerCase();
    const combo = event.ctrlKey || event.metaKey;
    if (combo && (key === 't' || key === 'n' || (event.shiftKey && key === 't'))) {
      event.preventDefault();
      event.stopPropagation();
    }
  }, true);
  const mountBanner = () => {
    if (!document.body || document.getElementById('secure-session-banner')) return;
    const banner = document.createElement('div');
    banner.id = 'secure-session-banner';
    banner.textContent = 'Secure application session';
    banner.style.cssText = 'position:fixed;top:0;left:0;right:0;z-index:2147483647;' +
      'background:#1a7f37;color:#fff;font:12px sans-serif;text-align:center;padding:2px;';
    document.body.appendChild(banner);
  };
  if (document.readyState === 'loading') {
    document.addEventListener('DOMContentLoaded', mountBanner);
  } else {
    mountBanner();
  }
})();
"#;

/// One slot of the fleet's port/display plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocation {
    pub index: usize,
    pub display_num: u16,
    pub vnc_port: u16,
    pub ws_port: u16,
    pub debug_port: u16,
}

/// # NDOC
/// component: `vnc::coordinator`
/// purpose: Lifecycle of (display, vnc, bridge, home, browser) for one job.
/// invariants:
///   - Resources are released together on every exit path.
///   - Teardown is best-effort; each failed step is logged, never thrown.
pub struct VncCoordinator {
    pub session_id: String,
    pub user_id: String,
    pub job_url: String,
    pub allocation: SlotAllocation,
    display: VirtualDisplay,
    server: VncServer,
    bridge: WebsocketBridge,
    home: SandboxHome,
    browser: BrowserSandbox,
    pub resume_path: Option<PathBuf>,
}

impl VncCoordinator {
    pub fn prepare(
        config: &RuntimeConfig,
        session_id: &str,
        user_id: &str,
        job_url: &str,
        allocation: SlotAllocation,
    ) -> EngineResult<Self> {
        let display = VirtualDisplay::new(
            &config.xvfb_binary,
            allocation.display_num,
            config.display_width,
            config.display_height,
        );
        let server = VncServer::new(
            &config.x11vnc_binary,
            &display.display_env(),
            allocation.vnc_port,
            None,
        );
        let bridge = WebsocketBridge::new(
            &config.websockify_binary,
            allocation.ws_port,
            allocation.vnc_port,
        );
        let home = SandboxHome::create(&config.sandbox_root, user_id, session_id)?;
        let browser = BrowserSandbox::new(SandboxLaunchSpec {
            browser_binary: config.browser_binary.clone(),
            app_url: job_url.to_string(),
            home: home.path().to_path_buf(),
            display_env: display.display_env(),
            debug_port: allocation.debug_port,
            window_width: config.display_width,
            window_height: config.display_height,
            run_as_user: config.sandbox_user.clone(),
        });
        Ok(Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            job_url: job_url.to_string(),
            allocation,
            display,
            server,
            bridge,
            home,
            browser,
            resume_path: None,
        })
    }

    /// Ordered startup. On any failure, everything already started is torn
    /// down before the error propagates.
    pub async fn start(&mut self, resume: Option<(String, Vec<u8>)>) -> EngineResult<()> {
        let result = self.start_inner(resume).await;
        if result.is_err() {
            self.stop().await;
        }
        result
    }

    async fn start_inner(&mut self, resume: Option<(String, Vec<u8>)>) -> EngineResult<()> {
        self.display.start().await?;
        log_fleet_event(&self.session_id, "display_started", &self.display.display_env());
        self.server.start().await?;
        log_fleet_event(&self.session_id, "vnc_started", &self.server.port().to_string());
        self.bridge.start().await?;
        log_fleet_event(&self.session_id, "bridge_started", &self.bridge.ws_port().to_string());

        if let Some((file_name, bytes)) = resume {
            let path = self.home.inject_resume(&file_name, &bytes)?;
            log_fleet_event(&self.session_id, "resume_injected", &file_name);
            self.resume_path = Some(path);
        }

        self.browser.launch().await?;
        log_fleet_event(
            &self.session_id,
            "browser_launched",
            &self.allocation.debug_port.to_string(),
        );
        Ok(())
    }

    pub fn debug_port(&self) -> u16 {
        self.browser.debug_port()
    }

    pub fn browser_alive(&mut self) -> bool {
        self.browser.is_alive()
    }

    pub fn viewer_url(&self, public_host: &str) -> String {
        format!("ws://{public_host}/vnc-stream/{}", self.session_id)
    }

    /// Reverse-order teardown; the browser is reaped first and the call
    /// returns only when it is known dead.
    pub async fn stop(&mut self) {
        self.browser.kill_and_reap().await;
        log_fleet_event(&self.session_id, "browser_stopped", "");
        self.bridge.stop().await;
        self.server.stop().await;
        self.display.stop().await;
        log_fleet_event(&self.session_id, "stack_stopped", "");
    }

    /// Teardown plus sandbox-home removal (cleanup sweep, batch close).
    pub async fn stop_and_remove_home(&mut self) {
        self.stop().await;
        self.home.remove();
        log_fleet_event(&self.session_id, "home_removed", "");
    }
}
