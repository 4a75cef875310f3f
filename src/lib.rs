//! stepvm - a tree-walking interpreter for declarative service workflows

pub mod cli;
pub mod core;
pub mod execution;
pub mod query;
pub mod steps;

// Re-export commonly used types
pub use core::{ExecutionError, Record, ServiceConfig, Value, VmConfig};
pub use execution::{ExecutionContext, Service, ServiceContext, ServiceRegistry, VmService};
pub use query::Query;
pub use steps::Step;
