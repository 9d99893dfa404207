use async_trait::async_trait;
use tracing::debug;

use super::types::ProviderResult;

/// Where server-side plans run.
///
/// A host is initialized once, before the first pipeline is built.
#[mockall::automock]
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    fn name(&self) -> String;

    async fn initialize(&self) -> ProviderResult<()>;
}

/// Runs plans inside the server process.
#[derive(Debug, Default, Clone)]
pub struct InProcessHost;

#[async_trait]
impl ExecutionHost for InProcessHost {
    fn name(&self) -> String {
        "in-process".to_string()
    }

    async fn initialize(&self) -> ProviderResult<()> {
        debug!("In-process execution host ready");
        Ok(())
    }
}
