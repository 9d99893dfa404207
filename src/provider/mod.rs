pub mod host;
pub mod operators;
pub mod pipeline;
#[allow(clippy::module_inception)]
pub mod provider;
pub mod types;

pub use host::{ExecutionHost, InProcessHost};
pub use operators::{Operator, OperatorRegistry};
pub use pipeline::{PipelineDispatch, PipelineFactory};
pub use provider::{InterpreterProvider, QueryProvider};
pub use types::{PipelineContext, ProviderError, ProviderResult};
