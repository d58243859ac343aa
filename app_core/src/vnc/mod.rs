pub mod bridge;
pub mod coordinator;
pub mod display;
pub mod fleet;
pub mod sandbox;
pub mod server;

use crate::contracts::EngineError;

/// Process-layer failure for the display/VNC/bridge/browser children.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("{tool} could not be spawned: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited during startup ({status})")]
    EarlyExit {
        tool: &'static str,
        status: std::process::ExitStatus,
    },
}

impl From<ProcessError> for EngineError {
    fn from(value: ProcessError) -> Self {
        EngineError::resource(value.to_string())
    }
}
