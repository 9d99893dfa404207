use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::duplex::DuplexClient;
use crate::eval::EvalError;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to evaluate plan: {0}")]
    Eval(#[from] EvalError),

    #[error("No pipeline for plan of type {0}")]
    UnsupportedPlan(String),

    #[error("Execution host initialization error: {0}")]
    HostInitialization(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Per-session inputs handed to a provider when it builds a pipeline.
#[derive(Clone, Default)]
pub struct PipelineContext {
    /// Present when the session has duplex callbacks enabled.
    pub duplex: Option<DuplexClient>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(duplex: Option<DuplexClient>, cancel: CancellationToken) -> Self {
        Self { duplex, cancel }
    }
}
