//! liveness-daemon library: configuration, signal handling, the role runner
//! and the worker pool, exposed for integration tests.

pub mod config;
pub mod node;
pub mod pool;
pub mod shutdown;

pub use config::{DaemonConfig, Overrides};
pub use pool::WorkerPool;
