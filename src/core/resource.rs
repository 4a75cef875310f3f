//! Closeable resources and their cleanup scopes

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// A resource that must be released when its scope ends
pub trait Closeable: Debug + Send + Sync {
    fn close(&self) -> anyhow::Result<()>;
}

/// Lifetime granularity of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseableScope {
    /// Closed when the enclosing Map step completes
    #[default]
    Map,
    /// Closed when the whole service execution completes
    Service,
}

/// A resource registered for guaranteed cleanup
#[derive(Debug, Clone)]
pub struct ManagedCloseable {
    /// Id of the step that registered the resource
    pub owner: String,
    pub resource: Arc<dyn Closeable>,
}

/// Resources registered at one scope, closed together
#[derive(Debug, Default)]
pub struct ResourceList {
    entries: Vec<ManagedCloseable>,
}

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, owner: impl Into<String>, resource: Arc<dyn Closeable>) {
        self.entries.push(ManagedCloseable {
            owner: owner.into(),
            resource,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every registered resource without closing it
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Close and forget every resource, failures are logged and swallowed
    pub fn close_all(&mut self) -> usize {
        let mut failures = 0;
        for entry in self.entries.drain(..) {
            debug!("Closing resource registered by {}", entry.owner);
            if let Err(e) = entry.resource.close() {
                failures += 1;
                warn!("Could not close resource registered by {}: {:#}", entry.owner, e);
            }
        }
        failures
    }
}
