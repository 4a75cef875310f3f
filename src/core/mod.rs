//! Core data model of the VM
//!
//! Values and records, the type registry with its extensions, the pipeline
//! content every step reads and writes, errors and the per-run context.

pub mod config;
pub mod content;
pub mod context;
pub mod error;
pub mod resource;
pub mod state;
pub mod types;
pub mod value;

pub use config::{FieldConfig, ServiceConfig, TypeConfig, VmConfig};
pub use content::{PathSegment, PipelineContent};
pub use context::VmContext;
pub use error::{codes, Diagnostic, ErrorClass, ExceptionDescription, ExecutionError, Impersonation, Severity};
pub use resource::{Closeable, CloseableScope, ResourceList};
pub use state::{BreakOutcome, Flow};
pub use types::{FieldDef, FieldKind, TypeHandle, TypeRegistry};
pub use value::{Record, Value};
