//! CNAP Controller
//!
//! Persists agents, tasks, and conversations, and drives task execution
//! through a [`RunnerRegistry`](cnap_runner::RunnerRegistry).

pub mod config;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod memory;
pub mod repository;

pub use config::Config;
pub use content::{ContentStore, FileContentStore, InMemoryContentStore};
pub use coordinator::{Coordinator, Dispatch, TaskInfo};
pub use error::{ContentError, ControllerError, RepositoryError};
pub use logging::init_tracing;
pub use memory::InMemoryRepository;
pub use repository::Repository;
