//! Transaction control

use crate::core::error::{codes, ExecutionError};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Transaction control offered by the host environment
pub trait TransactionContext: Send + Sync {
    /// Start a new transaction and return its id
    fn start(&self) -> Result<String, ExecutionError>;

    fn commit(&self, id: &str) -> Result<(), ExecutionError>;

    fn rollback(&self, id: &str) -> Result<(), ExecutionError>;

    /// Transaction used by actions that do not name one
    fn default_transaction(&self) -> Option<String>;

    fn set_default_transaction(&self, id: Option<String>);

    /// Independent copy for work that runs on another thread
    fn fork(&self) -> Option<Arc<dyn TransactionContext>> {
        None
    }
}

/// What happened to a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    Started(String),
    Committed(String),
    RolledBack(String),
}

#[derive(Debug, Default)]
struct Ledger {
    open: Vec<String>,
    events: Vec<TransactionEvent>,
    default: Option<String>,
}

/// Transaction context keeping its ledger in memory
#[derive(Debug, Default)]
pub struct InMemoryTransactions {
    ledger: Mutex<Ledger>,
}

impl InMemoryTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        self.ledger().events.clone()
    }

    /// Ids of transactions started but neither committed nor rolled back
    pub fn open(&self) -> Vec<String> {
        self.ledger().open.clone()
    }

    fn close(&self, id: &str, event: TransactionEvent) -> Result<(), ExecutionError> {
        let mut ledger = self.ledger();
        let Some(position) = ledger.open.iter().position(|open| open == id) else {
            return Err(ExecutionError::vm(
                codes::TRANSACTION_FAILED,
                format!("Transaction '{}' is not open", id),
            ));
        };
        ledger.open.remove(position);
        ledger.events.push(event);
        Ok(())
    }
}

impl TransactionContext for InMemoryTransactions {
    fn start(&self) -> Result<String, ExecutionError> {
        let id = Uuid::new_v4().simple().to_string();
        let mut ledger = self.ledger();
        ledger.open.push(id.clone());
        ledger.events.push(TransactionEvent::Started(id.clone()));
        debug!("Started transaction {}", id);
        Ok(id)
    }

    fn commit(&self, id: &str) -> Result<(), ExecutionError> {
        debug!("Committing transaction {}", id);
        self.close(id, TransactionEvent::Committed(id.to_string()))
    }

    fn rollback(&self, id: &str) -> Result<(), ExecutionError> {
        debug!("Rolling back transaction {}", id);
        self.close(id, TransactionEvent::RolledBack(id.to_string()))
    }

    fn default_transaction(&self) -> Option<String> {
        self.ledger().default.clone()
    }

    fn set_default_transaction(&self, id: Option<String>) {
        self.ledger().default = id;
    }

    fn fork(&self) -> Option<Arc<dyn TransactionContext>> {
        Some(Arc::new(InMemoryTransactions::new()))
    }
}
