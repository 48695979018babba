//! CNAP Runner
//!
//! Per-task execution contexts and the registry that indexes them.
//!
//! - [`Runner`]: status state machine around an optional [`ExecutionBackend`]
//!   and a [`ModelInvoker`]
//! - [`RunnerRegistry`]: task-keyed index with at-most-one live runner per task
//! - [`RunnerObserver`] / [`StatusCallback`]: how status and results leave a
//!   runner
//! - [`ProcessBackend`] and [`OpenCodeInvoker`]: the concrete seams

pub mod backend;
pub mod error;
pub mod invoker;
pub mod observer;
pub mod process;
pub mod registry;
pub mod runner;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{ExecutionBackend, RunnerConfig};
pub use error::{BackendError, InvokeError, ObserverError, RunnerError};
pub use invoker::{
    summarize_body, ModelInvoker, OpenCodeInvoker, API_KEY_ENV, DEFAULT_ENDPOINT, EMPTY_RESULT,
};
pub use observer::{RunResult, RunnerObserver, StatusCallback, SubscriptionId};
pub use process::ProcessBackend;
pub use registry::RunnerRegistry;
pub use runner::{effective_prompt, AgentInfo, InvokeRequest, Runner};
