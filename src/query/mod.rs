//! Path and boolean expression language
//!
//! Queries are parsed once into a [`Query`] and evaluated many times against
//! a record. Steps keep their parsed queries in a [`QueryCache`].

pub mod eval;
pub mod lexer;
pub mod parser;

use crate::core::content::PathSegment;
use crate::core::error::{Diagnostic, ErrorClass, ExecutionError};
use crate::core::types::{TypeHandle, TypeRegistry};
use crate::core::value::{Record, Value};
use parser::{Expr, Path};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised while parsing or evaluating a query
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("Unexpected character at position {position} in '{query}'")]
    Lex { query: String, position: usize },

    #[error("Invalid query '{query}' at position {position}: {message}")]
    Parse {
        query: String,
        position: usize,
        message: String,
    },

    #[error("Could not evaluate '{query}': {message}")]
    Eval { query: String, message: String },

    #[error("'{query}' is not an assignable variable")]
    NotAssignable { query: String },
}

impl From<QueryError> for ExecutionError {
    fn from(error: QueryError) -> Self {
        ExecutionError::new(ErrorClass::Query, error.to_string())
    }
}

/// A parsed query
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    source: String,
    expr: Expr,
}

impl Query {
    pub fn parse(source: &str) -> Result<Self, QueryError> {
        Ok(Self {
            source: source.to_string(),
            expr: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    fn eval_error(&self, message: String) -> QueryError {
        QueryError::Eval {
            query: self.source.clone(),
            message,
        }
    }

    /// Evaluate against a record, undefined paths yield null
    pub fn evaluate(&self, root: &Record) -> Result<Value, QueryError> {
        eval::evaluate(&self.expr, root).map_err(|e| self.eval_error(e))
    }

    /// A pure path, usable as an assignment target
    pub fn is_variable(&self) -> bool {
        matches!(self.expr, Expr::Path(_))
    }

    /// Whether the path is set at all, as opposed to set to null
    ///
    /// Expressions other than paths are always defined.
    pub fn is_defined(&self, root: &Record) -> Result<bool, QueryError> {
        match &self.expr {
            Expr::Path(path) => eval::lookup(path, root)
                .map(|found| found.is_some())
                .map_err(|e| self.eval_error(e)),
            _ => Ok(true),
        }
    }

    /// Assignable segments of a path query
    pub fn resolve(&self, root: &Record) -> Result<Vec<PathSegment>, QueryError> {
        match &self.expr {
            Expr::Path(path) => eval::resolve(path, root).map_err(|e| self.eval_error(e)),
            _ => Err(QueryError::NotAssignable {
                query: self.source.clone(),
            }),
        }
    }

    /// Root variable names referenced anywhere in the query, in order of appearance
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_variables(&self.expr, &mut names);
        names
    }

    /// Check that every referenced root variable exists in the type
    pub fn validate(&self, registry: &TypeRegistry, ty: TypeHandle) -> Vec<Diagnostic> {
        self.variables()
            .into_iter()
            .filter(|name| registry.field(ty, name).is_none())
            .map(|name| {
                Diagnostic::error(format!(
                    "Unknown variable '{}' in query '{}'",
                    name, self.source
                ))
            })
            .collect()
    }
}

fn collect_variables(expr: &Expr, names: &mut Vec<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(Path { parts }) => {
            if let Some(first) = parts.first() {
                if !names.contains(&first.name) {
                    names.push(first.name.clone());
                }
            }
            for index in parts.iter().flat_map(|p| p.indexes.iter()) {
                collect_variables(index, names);
            }
        }
        Expr::List(items) => items.iter().for_each(|item| collect_variables(item, names)),
        Expr::Not(inner) | Expr::Negate(inner) => collect_variables(inner, names),
        Expr::Binary(_, lhs, rhs) => {
            collect_variables(lhs, names);
            collect_variables(rhs, names);
        }
    }
}

/// Parsed queries keyed by their source text
///
/// Safe to share between concurrent executions of the same step.
#[derive(Debug, Default)]
pub struct QueryCache {
    queries: RwLock<HashMap<String, Arc<Query>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &str) -> Result<Arc<Query>, QueryError> {
        {
            let queries = self.queries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(query) = queries.get(source) {
                return Ok(query.clone());
            }
        }
        let parsed = Arc::new(Query::parse(source)?);
        let mut queries = self.queries.write().unwrap_or_else(|e| e.into_inner());
        Ok(queries.entry(source.to_string()).or_insert(parsed).clone())
    }

    pub fn len(&self) -> usize {
        self.queries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queries.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
