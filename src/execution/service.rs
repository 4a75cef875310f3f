//! Services and service resolution

use crate::core::error::ExecutionError;
use crate::core::types::TypeHandle;
use crate::core::value::Record;
use crate::execution::context::ExecutionContext;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Input and output types of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInterface {
    pub input: TypeHandle,
    pub output: TypeHandle,
}

/// Something that can be invoked with an input record
pub trait Service: Send + Sync {
    fn id(&self) -> &str;

    fn interface(&self) -> ServiceInterface;

    fn execute(&self, context: &ExecutionContext, input: Record) -> Result<Record, ExecutionError>;
}

/// Finds services by id
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, id: &str) -> Option<Arc<dyn Service>>;
}

/// In-memory service registry
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its own id, replacing any previous one
    pub fn register(&self, service: Arc<dyn Service>) {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.id().to_string(), service);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl ServiceResolver for ServiceRegistry {
    fn resolve(&self, id: &str) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry").field("services", &self.ids()).finish()
    }
}

type Handler = dyn Fn(&ExecutionContext, Record) -> Result<Record, ExecutionError> + Send + Sync;

/// Service backed by a closure
pub struct FnService {
    id: String,
    interface: ServiceInterface,
    handler: Box<Handler>,
}

impl FnService {
    pub fn new<F>(id: impl Into<String>, interface: ServiceInterface, handler: F) -> Self
    where
        F: Fn(&ExecutionContext, Record) -> Result<Record, ExecutionError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            interface,
            handler: Box::new(handler),
        }
    }
}

impl Service for FnService {
    fn id(&self) -> &str {
        &self.id
    }

    fn interface(&self) -> ServiceInterface {
        self.interface
    }

    fn execute(&self, context: &ExecutionContext, input: Record) -> Result<Record, ExecutionError> {
        (self.handler)(context, input)
    }
}

impl fmt::Debug for FnService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnService").field("id", &self.id).finish()
    }
}
