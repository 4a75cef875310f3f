//! Execution errors, error classes and validation diagnostics

use crate::core::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Position of an error in the error class hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Root of every error
    Exception,
    /// Errors raised by the engine itself
    Execution,
    /// Errors raised explicitly by a workflow
    Business,
    /// Structural problems in the workflow
    Design,
    ServiceNotFound,
    TypeMismatch,
    Query,
    /// Input or output data did not validate
    InvalidData,
    /// Failure in a remote execution environment
    Remote,
    /// The run was aborted from the outside
    Aborted,
    /// Failure raised by host code outside the engine
    Host,
    /// Unrecoverable failure, never caught by a Catch step
    Fatal,
}

impl ErrorClass {
    /// Direct parent in the hierarchy
    pub fn parent(self) -> Option<ErrorClass> {
        match self {
            ErrorClass::Exception => None,
            ErrorClass::Execution | ErrorClass::Host | ErrorClass::Fatal => {
                Some(ErrorClass::Exception)
            }
            ErrorClass::Business
            | ErrorClass::Design
            | ErrorClass::InvalidData
            | ErrorClass::Remote
            | ErrorClass::Aborted => Some(ErrorClass::Execution),
            ErrorClass::ServiceNotFound | ErrorClass::TypeMismatch | ErrorClass::Query => {
                Some(ErrorClass::Design)
            }
        }
    }

    /// Whether this class equals `other` or descends from it
    pub fn is_a(self, other: ErrorClass) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class == other {
                return true;
            }
            current = class.parent();
        }
        false
    }

    fn ancestry(self) -> Vec<ErrorClass> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Closest class shared by all given classes, `Exception` when empty
    pub fn common_ancestor(classes: &[ErrorClass]) -> ErrorClass {
        let Some((first, rest)) = classes.split_first() else {
            return ErrorClass::Exception;
        };
        first
            .ancestry()
            .into_iter()
            .find(|candidate| rest.iter().all(|class| class.is_a(*candidate)))
            .unwrap_or(ErrorClass::Exception)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Exception => "exception",
            ErrorClass::Execution => "execution",
            ErrorClass::Business => "business",
            ErrorClass::Design => "design",
            ErrorClass::ServiceNotFound => "service-not-found",
            ErrorClass::TypeMismatch => "type-mismatch",
            ErrorClass::Query => "query",
            ErrorClass::InvalidData => "invalid-data",
            ErrorClass::Remote => "remote",
            ErrorClass::Aborted => "aborted",
            ErrorClass::Host => "host",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Identity an error is attributed to when it differs from the running one
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Impersonation {
    pub alias: Option<String>,
    pub realm: Option<String>,
    pub authentication_id: Option<String>,
}

impl Impersonation {
    pub fn is_empty(&self) -> bool {
        self.alias.is_none() && self.realm.is_none() && self.authentication_id.is_none()
    }
}

/// Severity of a validation diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,

    /// Path of step ids (or field names) leading to the finding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    /// Prefix the context path with an outer element
    pub fn within(mut self, element: impl Into<String>) -> Self {
        self.context.insert(0, element.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{:?}] {}", self.severity, self.message)
        } else {
            write!(
                f,
                "[{:?}] {}: {}",
                self.severity,
                self.context.join("/"),
                self.message
            )
        }
    }
}

/// Standard error codes raised by the engine
pub mod codes {
    pub const INVALID_SET: &str = "VM-1";
    pub const INVALID_CLOSEABLE: &str = "VM-2";
    pub const SERVICE_NOT_FOUND: &str = "VM-3";
    pub const INVALID_INPUT: &str = "VM-4";
    pub const INVALID_OUTPUT: &str = "VM-5";
    pub const STEP_FAILED: &str = "VM-6";
    pub const MASK_TYPE: &str = "VM-7";
    pub const MASK_CONTENT: &str = "VM-8";
    pub const INVALID_TARGET: &str = "VM-9";
    pub const MISSING_LINK_TARGET: &str = "VM-10";
    pub const INVALID_BATCH_SIZE: &str = "VM-11";
    pub const SET_FAILED: &str = "VM-12";
    pub const GET_FAILED: &str = "VM-13";
    pub const ABORTED: &str = "VM-14";
    pub const REMOTE_FAILED: &str = "VM-15";
    pub const CAST_FAILED: &str = "VM-16";
    pub const LOCK_FAILED: &str = "VM-17";
    pub const NOT_ITERABLE: &str = "VM-18";
    pub const MAX_DEPTH: &str = "VM-19";
    pub const SWITCH_CONVERSION: &str = "VM-20";
    pub const TRANSACTION_FAILED: &str = "VM-21";
}

/// Code, class and description of every standard engine error
pub const STANDARD_ERRORS: &[(&str, ErrorClass, &str)] = &[
    (codes::INVALID_SET, ErrorClass::Design, "Invalid set operation, the target is not a variable"),
    (codes::INVALID_CLOSEABLE, ErrorClass::Design, "Only closeable resources can be managed"),
    (codes::SERVICE_NOT_FOUND, ErrorClass::ServiceNotFound, "The service can not be found"),
    (codes::INVALID_INPUT, ErrorClass::InvalidData, "The input data is invalid"),
    (codes::INVALID_OUTPUT, ErrorClass::InvalidData, "The output data is invalid"),
    (codes::STEP_FAILED, ErrorClass::Execution, "A step failed to execute"),
    (codes::MASK_TYPE, ErrorClass::Design, "Can only mask complex types"),
    (codes::MASK_CONTENT, ErrorClass::Design, "Can only mask complex content"),
    (codes::INVALID_TARGET, ErrorClass::Design, "Invalid target environment"),
    (codes::MISSING_LINK_TARGET, ErrorClass::Design, "The link has no target"),
    (codes::INVALID_BATCH_SIZE, ErrorClass::Design, "The batch size is not a number"),
    (codes::SET_FAILED, ErrorClass::Execution, "Could not set or delete a variable"),
    (codes::GET_FAILED, ErrorClass::Execution, "Could not get a variable"),
    (codes::ABORTED, ErrorClass::Aborted, "The execution was aborted"),
    (codes::REMOTE_FAILED, ErrorClass::Remote, "Remote execution failed"),
    (codes::CAST_FAILED, ErrorClass::TypeMismatch, "The pipeline can not be cast to the requested type"),
    (codes::LOCK_FAILED, ErrorClass::Execution, "Could not acquire the cluster lock"),
    (codes::NOT_ITERABLE, ErrorClass::Design, "The loop source is not a collection"),
    (codes::MAX_DEPTH, ErrorClass::Fatal, "Maximum execution depth exceeded"),
    (codes::SWITCH_CONVERSION, ErrorClass::Design, "The switch label can not be converted"),
    (codes::TRANSACTION_FAILED, ErrorClass::Execution, "Transaction handling failed"),
];

/// An error raised while executing a workflow
#[derive(Debug, Clone, Error)]
#[error("{}", headline(.code, .message))]
pub struct ExecutionError {
    pub class: ErrorClass,
    pub code: Option<String>,
    pub message: String,
    pub description: Option<String>,
    pub data: Option<Value>,

    /// Id of the step that raised the error
    pub source_id: Option<String>,

    /// Raised by a Throw step rather than by the engine
    pub explicit: bool,

    /// Safe to expose to callers outside the service boundary
    pub whitelisted: bool,

    pub impersonation: Option<Impersonation>,

    /// Diagnostics for invalid input or output data
    pub validations: Vec<Diagnostic>,

    #[source]
    pub cause: Option<Arc<ExecutionError>>,
}

fn headline(code: &Option<String>, message: &String) -> String {
    match code {
        Some(code) => format!("[{}] {}", code, message),
        None => message.clone(),
    }
}

impl ExecutionError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            code: None,
            message: message.into(),
            description: None,
            data: None,
            source_id: None,
            explicit: false,
            whitelisted: false,
            impersonation: None,
            validations: Vec::new(),
            cause: None,
        }
    }

    /// A standard engine error, its class is taken from [`STANDARD_ERRORS`]
    pub fn vm(code: &str, message: impl Into<String>) -> Self {
        let class = STANDARD_ERRORS
            .iter()
            .find(|(candidate, _, _)| *candidate == code)
            .map(|(_, class, _)| *class)
            .unwrap_or(ErrorClass::Execution);
        Self::new(class, message).with_code(code)
    }

    /// An error attributed to host code outside the engine
    pub fn host(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Host, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_source(mut self, step_id: impl Into<String>) -> Self {
        self.source_id = Some(step_id.into());
        self
    }

    pub fn with_validations(mut self, validations: Vec<Diagnostic>) -> Self {
        self.validations = validations;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<Arc<ExecutionError>>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// This error followed by its causes, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &ExecutionError> {
        std::iter::successors(Some(self), |error| error.cause.as_deref())
    }

    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }

    /// Multi-line rendering of the whole chain, used by regex catch clauses
    pub fn trace(&self) -> String {
        let mut lines = Vec::new();
        for (depth, error) in self.chain().enumerate() {
            let prefix = if depth == 0 { "" } else { "Caused by: " };
            let mut line = format!("{}{}: {}", prefix, error.class, headline(&error.code, &error.message));
            if let Some(source) = &error.source_id {
                line.push_str(&format!(" (at {})", source));
            }
            lines.push(line);
        }
        lines.join("\n")
    }

    /// Convert a foreign error chain into host errors
    pub fn from_std(error: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(own) = error.downcast_ref::<ExecutionError>() {
            return own.clone();
        }
        let mut converted = ExecutionError::host(error.to_string());
        if let Some(source) = error.source() {
            converted.cause = Some(Arc::new(ExecutionError::from_std(source)));
        }
        converted
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ExecutionError>() {
            Ok(own) => own,
            Err(other) => {
                let mut causes = other.chain().skip(1).map(|cause| cause.to_string()).collect::<Vec<_>>();
                let mut converted = None;
                while let Some(message) = causes.pop() {
                    let mut next = ExecutionError::host(message);
                    next.cause = converted.map(Arc::new);
                    converted = Some(next);
                }
                let mut root = ExecutionError::host(other.to_string());
                root.cause = converted.map(Arc::new);
                root
            }
        }
    }
}

/// Description of an error a service may raise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDescription {
    pub id: String,
    pub code: String,
    pub message: String,
    pub description: Option<String>,
}

/// Descriptions of every standard engine error
pub fn standard_exceptions() -> Vec<ExceptionDescription> {
    STANDARD_ERRORS
        .iter()
        .map(|(code, _, message)| ExceptionDescription {
            id: code.to_string(),
            code: code.to_string(),
            message: message.to_string(),
            description: None,
        })
        .collect()
}
