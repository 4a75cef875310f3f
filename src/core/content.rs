//! Live pipeline content
//!
//! A [`PipelineContent`] is a mutable record that conforms to one pipeline
//! type at a time. Casting changes the type it is viewed as, in place: fields
//! that only exist in extensions being left behind are unset, everything else
//! stays untouched.

use crate::core::error::{codes, ExecutionError};
use crate::core::types::{FieldDef, TypeHandle, TypeRegistry};
use crate::core::value::{Record, Value};
use std::fmt;
use std::sync::Arc;

/// One step of an assignable path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

/// Render a path the way it is written in queries
pub fn format_path(path: &[PathSegment]) -> String {
    let mut rendered = String::new();
    for segment in path {
        if matches!(segment, PathSegment::Field(_)) && !rendered.is_empty() {
            rendered.push('/');
        }
        rendered.push_str(&segment.to_string());
    }
    rendered
}

/// A typed, mutable record
#[derive(Debug, Clone)]
pub struct PipelineContent {
    registry: Arc<TypeRegistry>,
    ty: TypeHandle,
    values: Record,
}

impl PipelineContent {
    pub fn new(registry: Arc<TypeRegistry>, ty: TypeHandle) -> Self {
        Self::from_record(registry, ty, Record::new())
    }

    pub fn from_record(registry: Arc<TypeRegistry>, ty: TypeHandle, values: Record) -> Self {
        Self { registry, ty, values }
    }

    pub fn type_handle(&self) -> TypeHandle {
        self.ty
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn record(&self) -> &Record {
        &self.values
    }

    pub fn into_record(self) -> Record {
        self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Declared field for a path, if the path stays within the declared shape
    pub fn declared(&self, path: &[PathSegment]) -> Option<FieldDef> {
        self.registry.path_field(self.ty, path)
    }

    /// View the content as another type sharing an ancestor with the current one
    pub fn cast(&mut self, target: TypeHandle) -> Result<(), ExecutionError> {
        if target == self.ty {
            return Ok(());
        }
        let Some(ancestor) = self.registry.common_ancestor(self.ty, target) else {
            return Err(ExecutionError::vm(
                codes::CAST_FAILED,
                format!(
                    "Can not cast pipeline of type '{}' to unrelated type '{}'",
                    self.registry.name(self.ty),
                    self.registry.name(target)
                ),
            ));
        };
        for handle in self.registry.chain(self.ty) {
            if handle == ancestor {
                break;
            }
            for field in self.registry.own_fields(handle) {
                self.values.shift_remove(&field.name);
            }
        }
        self.ty = target;
        Ok(())
    }

    /// Assign a value, converting it to the declared kind where one is known
    pub fn set(&mut self, path: &[PathSegment], value: Value) -> Result<(), ExecutionError> {
        let Some(PathSegment::Field(root)) = path.first() else {
            return Err(set_failed(path, "the path must start with a variable name"));
        };
        if self.registry.field(self.ty, root).is_none() {
            return Err(set_failed(
                path,
                format!("'{}' is not declared in pipeline '{}'", root, self.registry.name(self.ty)),
            ));
        }
        let value = match self.declared(path) {
            Some(field) => field.coerce(value).map_err(|e| set_failed(path, e))?,
            None => value,
        };
        write_path(&mut self.values, path, value).map_err(|e| set_failed(path, e))
    }

    /// Convenience for a top-level assignment
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), ExecutionError> {
        self.set(&[PathSegment::Field(name.to_string())], value)
    }

    /// Unset a variable, leaving it undefined rather than null
    pub fn remove(&mut self, path: &[PathSegment]) -> Result<(), ExecutionError> {
        remove_path(&mut self.values, path).map_err(|e| set_failed(path, e))
    }

    /// Remove a top-level value and return it
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(name)
    }
}

fn set_failed(path: &[PathSegment], reason: impl fmt::Display) -> ExecutionError {
    ExecutionError::vm(
        codes::SET_FAILED,
        format!("Could not set '{}': {}", format_path(path), reason),
    )
}

fn write_path(record: &mut Record, path: &[PathSegment], value: Value) -> Result<(), String> {
    match path {
        [PathSegment::Field(name)] => {
            record.insert(name.clone(), value);
            Ok(())
        }
        [PathSegment::Field(name), rest @ ..] => {
            let slot = record.entry(name.clone()).or_insert(Value::Null);
            write_slot(slot, rest, value)
        }
        _ => Err("the path must start with a field".to_string()),
    }
}

/// How many nulls a write may append to reach its index
pub const MAX_LIST_PADDING: usize = 1024;

fn write_slot(slot: &mut Value, path: &[PathSegment], value: Value) -> Result<(), String> {
    let Some((segment, rest)) = path.split_first() else {
        *slot = value;
        return Ok(());
    };
    match segment {
        PathSegment::Field(name) => {
            if slot.is_null() {
                *slot = Value::Record(Record::new());
            }
            match slot {
                Value::Record(record) => {
                    let next = record.entry(name.clone()).or_insert(Value::Null);
                    write_slot(next, rest, value)
                }
                other => Err(format!("can not set field '{}' on a {}", name, other.kind_name())),
            }
        }
        PathSegment::Index(index) => {
            if slot.is_null() {
                *slot = Value::List(Vec::new());
            }
            match slot {
                Value::List(items) => {
                    if *index > items.len().saturating_add(MAX_LIST_PADDING) {
                        return Err(format!(
                            "index {} is out of range for a list of {} elements",
                            index,
                            items.len()
                        ));
                    }
                    if items.len() <= *index {
                        items.resize(*index + 1, Value::Null);
                    }
                    write_slot(&mut items[*index], rest, value)
                }
                other => Err(format!("can not index a {}", other.kind_name())),
            }
        }
    }
}

fn remove_path(record: &mut Record, path: &[PathSegment]) -> Result<(), String> {
    match path {
        [PathSegment::Field(name)] => {
            record.shift_remove(name);
            Ok(())
        }
        [PathSegment::Field(name), rest @ ..] => match record.get_mut(name) {
            Some(slot) => remove_slot(slot, rest),
            None => Ok(()),
        },
        _ => Err("the path must start with a field".to_string()),
    }
}

fn remove_slot(slot: &mut Value, path: &[PathSegment]) -> Result<(), String> {
    match (slot, path) {
        (Value::Record(record), [PathSegment::Field(name)]) => {
            record.shift_remove(name);
            Ok(())
        }
        (Value::Record(record), [PathSegment::Field(name), rest @ ..]) => match record.get_mut(name) {
            Some(next) => remove_slot(next, rest),
            None => Ok(()),
        },
        (Value::List(items), [PathSegment::Index(index)]) => {
            if *index < items.len() {
                items.remove(*index);
            }
            Ok(())
        }
        (Value::List(items), [PathSegment::Index(index), rest @ ..]) => match items.get_mut(*index) {
            Some(next) => remove_slot(next, rest),
            None => Ok(()),
        },
        (Value::Null, _) => Ok(()),
        (other, _) => Err(format!("can not remove from a {}", other.kind_name())),
    }
}
