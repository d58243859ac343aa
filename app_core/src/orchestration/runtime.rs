//! The single `Runtime` value passed explicitly into every component.
//!
//! Nothing in the engine reads globals; the rate-limit store and the fleet
//! allocator are the only internally-mutable members, each behind its own
//! narrow interface. Consumed external services (profiles, resume blobs,
//! the browser driver) enter as trait objects so tests swap them freely.

use crate::browser::driver::BrowserDriver;
use crate::config::RuntimeConfig;
use crate::contracts::EngineResult;
use crate::data_models::profile::ProfileView;
use crate::limits::{LlmQuota, RateLimiter};
use crate::llm::{LlmGateway, TextGenerator};
use crate::vnc::fleet::{FleetControl, VncFleet};
use async_trait::async_trait;
use std::sync::Arc;

/// Profile storage interface (consumed; shape is opaque here).
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> EngineResult<ProfileView>;
}

/// Resolves an opaque resume blob ref into (file name, bytes) that the
/// coordinator copies into the per-session sandbox home.
#[async_trait]
pub trait ResumeResolver: Send + Sync {
    async fn resolve(&self, blob_ref: &str) -> EngineResult<(String, Vec<u8>)>;
}

/// Creates a driver attached to a session's browser debug port.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self, debug_port: u16) -> EngineResult<Arc<dyn BrowserDriver>>;
}

/// Production driver factory over the playwright adapter.
pub struct PlaywrightDriverFactory;

#[async_trait]
impl DriverFactory for PlaywrightDriverFactory {
    async fn connect(&self, debug_port: u16) -> EngineResult<Arc<dyn BrowserDriver>> {
        let driver = crate::browser::playwright_driver::PlaywrightDriver::connect(debug_port).await?;
        Ok(Arc::new(driver))
    }
}

/// # NDOC
/// component: `orchestration::runtime`
/// purpose: Explicit wiring for the whole engine; no process-wide state.
#[derive(Clone)]
pub struct Runtime {
    pub config: RuntimeConfig,
    pub limiter: Arc<RateLimiter>,
    pub quota: Arc<LlmQuota>,
    pub gateway: Arc<dyn TextGenerator>,
    pub fleet: Arc<dyn FleetControl>,
    pub profiles: Arc<dyn ProfileProvider>,
    pub resumes: Arc<dyn ResumeResolver>,
    pub drivers: Arc<dyn DriverFactory>,
}

impl Runtime {
    /// Production wiring from configuration plus the consumed services.
    pub fn production(
        config: RuntimeConfig,
        profiles: Arc<dyn ProfileProvider>,
        resumes: Arc<dyn ResumeResolver>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(&config));
        let quota = Arc::new(LlmQuota::new(config.llm_max_in_flight));
        let gateway: Arc<dyn TextGenerator> = Arc::new(LlmGateway::new(
            config.clone(),
            Arc::clone(&limiter),
            Arc::clone(&quota),
        ));
        let fleet: Arc<dyn FleetControl> = Arc::new(VncFleet::new(config.clone()));
        Self {
            config,
            limiter,
            quota,
            gateway,
            fleet,
            profiles,
            resumes,
            drivers: Arc::new(PlaywrightDriverFactory),
        }
    }
}
