//! Test utility functions for stepvm

#![allow(dead_code)]

use stepvm::core::config::ServiceConfig;
use stepvm::core::error::{Diagnostic, ExecutionError};
use stepvm::core::resource::Closeable;
use stepvm::core::types::{FieldDef, FieldKind};
use stepvm::core::value::{Record, Value};
use stepvm::execution::{
    ExecutionContext, FnService, InMemoryTransactions, RecordingTracker, Service, ServiceContext,
    ServiceInterface, ServiceRegistry, TransactionEvent, VmService,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Services loaded from one YAML document, plus the host doubles a run uses
pub struct Harness {
    pub context: ServiceContext,
    pub registry: Arc<ServiceRegistry>,
    pub services: Vec<Arc<VmService>>,
    pub transactions: Arc<InMemoryTransactions>,
    pub tracker: Arc<RecordingTracker>,
}

impl Harness {
    /// Load every service of a document and register it
    pub fn load(yaml: &str) -> Self {
        let (context, registry) = ServiceContext::standalone();
        let config = ServiceConfig::from_yaml(yaml).expect("service YAML should parse");
        let services = config.into_services(&context).expect("services should build");
        for service in &services {
            registry.register(service.clone());
        }
        Self {
            context,
            registry,
            services,
            transactions: Arc::new(InMemoryTransactions::new()),
            tracker: Arc::new(RecordingTracker::new()),
        }
    }

    /// The first service of the document
    pub fn main(&self) -> &Arc<VmService> {
        &self.services[0]
    }

    /// Register a native service with loosely typed fields
    pub fn native<F>(&self, id: &str, input: &[&str], output: &[&str], handler: F)
    where
        F: Fn(&ExecutionContext, Record) -> Result<Record, ExecutionError> + Send + Sync + 'static,
    {
        let types = &self.context.types;
        let fields = |names: &[&str]| names.iter().map(|n| FieldDef::new(*n, FieldKind::Any)).collect();
        let interface = ServiceInterface {
            input: types.define(format!("{}:input", id), fields(input)),
            output: types.define(format!("{}:output", id), fields(output)),
        };
        self.registry.register(Arc::new(FnService::new(id, interface, handler)));
    }

    /// Execution context wired to the harness transactions and tracker
    pub fn execution(&self) -> ExecutionContext {
        ExecutionContext::new(self.context.clone())
            .with_transactions(self.transactions.clone())
            .with_tracker(self.tracker.clone())
    }

    pub fn run(&self, input: serde_json::Value) -> Result<Record, ExecutionError> {
        self.run_with(&self.execution(), input)
    }

    pub fn run_with(&self, execution: &ExecutionContext, input: serde_json::Value) -> Result<Record, ExecutionError> {
        self.main().execute(execution, record(input))
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.services
            .iter()
            .flat_map(|service| service.validate(&self.context))
            .collect()
    }

    pub fn committed(&self) -> usize {
        self.count_transactions(|e| matches!(e, TransactionEvent::Committed(_)))
    }

    pub fn rolled_back(&self) -> usize {
        self.count_transactions(|e| matches!(e, TransactionEvent::RolledBack(_)))
    }

    fn count_transactions(&self, filter: impl Fn(&TransactionEvent) -> bool) -> usize {
        self.transactions.events().iter().filter(|e| filter(e)).count()
    }
}

/// Build a record from a JSON object literal
pub fn record(json: serde_json::Value) -> Record {
    match Value::from(json) {
        Value::Record(record) => record,
        Value::Null => Record::new(),
        other => panic!("expected an object, got {}", other.kind_name()),
    }
}

/// Names passed to a native service, in call order
#[derive(Debug, Default, Clone)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Closeable that counts how often it was closed
#[derive(Debug, Default)]
pub struct Probe {
    closed: AtomicUsize,
    fail: bool,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A probe whose close always fails
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Closeable for Probe {
    fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("probe refused to close");
        }
        Ok(())
    }
}

pub fn assert_output(result: &Result<Record, ExecutionError>, expected: serde_json::Value) {
    match result {
        Ok(output) => assert_eq!(Value::Record(output.clone()).to_json(), expected),
        Err(e) => panic!("expected output {}, got error:\n{}", expected, e.trace()),
    }
}

pub fn assert_error_code(result: &Result<Record, ExecutionError>, code: &str) {
    match result {
        Ok(output) => panic!("expected error {}, got output {:?}", code, output),
        Err(e) => assert_eq!(e.code.as_deref(), Some(code), "unexpected error:\n{}", e.trace()),
    }
}
