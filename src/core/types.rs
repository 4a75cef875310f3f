//! Structural pipeline types
//!
//! Types live in an arena owned by [`TypeRegistry`] and are referenced by
//! [`TypeHandle`]. A type is either a root structure or an extension that
//! adds fields to a base type. Extensions inherit the name of their base and
//! are compatible with it: anything valid for the base is valid for the
//! extension.

use crate::core::content::PathSegment;
use crate::core::error::{codes, Diagnostic, ErrorClass, ExecutionError};
use crate::core::value::{Record, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Index of a type in its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeHandle(usize);

/// Declared kind of a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Any,
    String,
    Integer,
    Decimal,
    Boolean,
    Record(TypeHandle),
    Error(ErrorClass),
    Resource,
}

/// A named field of a structural type
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,

    /// The field holds a list of `kind`
    pub list: bool,

    /// Minimum number of occurrences, 0 means optional
    pub min_occurs: u32,

    /// Not shown when the pipeline is presented to users
    pub hidden: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            list: false,
            min_occurs: 0,
            hidden: false,
        }
    }

    pub fn list(mut self) -> Self {
        self.list = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.min_occurs = 1;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Convert a value to this field's declared kind
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::List(items) if self.list => items
                .into_iter()
                .map(|item| coerce_scalar(&self.kind, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::List(_) if self.kind != FieldKind::Any => Err("does not accept a list".to_string()),
            other if self.list => Err(format!("expects a list, got {}", other.kind_name())),
            other => coerce_scalar(&self.kind, other),
        }
        .map_err(|e| format!("Field '{}' {}", self.name, e))
    }
}

fn coerce_scalar(kind: &FieldKind, value: Value) -> Result<Value, String> {
    let converted = match (kind, &value) {
        (_, Value::Null) | (FieldKind::Any, _) => Some(value.clone()),
        (FieldKind::String, _) => value.to_text().map(Value::String),
        (FieldKind::Integer, _) => value.as_i64().map(Value::Integer),
        (FieldKind::Decimal, _) => value.as_f64().map(Value::Decimal),
        (FieldKind::Boolean, _) => value.to_boolean().map(Value::Bool),
        (FieldKind::Record(_), Value::Record(_)) => Some(value.clone()),
        (FieldKind::Error(class), Value::Error(error)) if error.class.is_a(*class) => {
            Some(value.clone())
        }
        (FieldKind::Resource, Value::Resource(_)) => Some(value.clone()),
        _ => None,
    };
    converted.ok_or_else(|| format!("can not convert {} to {:?}", value.kind_name(), kind))
}

/// Descriptor of a structural type
#[derive(Debug)]
pub struct TypeDef {
    pub name: String,
    pub base: Option<TypeHandle>,
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Default)]
struct Arena {
    defs: Vec<Arc<TypeDef>>,
    names: HashMap<String, TypeHandle>,
}

/// Arena of structural types shared by all services of an environment
#[derive(Debug, Default)]
pub struct TypeRegistry {
    arena: RwLock<Arena>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Arena> {
        self.arena.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena> {
        self.arena.write().unwrap_or_else(|e| e.into_inner())
    }

    fn def(&self, handle: TypeHandle) -> Option<Arc<TypeDef>> {
        self.read().defs.get(handle.0).cloned()
    }

    /// Register a named root structure, replacing the name binding if it exists
    pub fn define(&self, name: impl Into<String>, fields: Vec<FieldDef>) -> TypeHandle {
        let name = name.into();
        let mut arena = self.write();
        let handle = TypeHandle(arena.defs.len());
        arena.defs.push(Arc::new(TypeDef {
            name: name.clone(),
            base: None,
            fields,
        }));
        arena.names.insert(name, handle);
        handle
    }

    /// Register an extension of `base` adding `fields`
    pub fn extend(&self, base: TypeHandle, fields: Vec<FieldDef>) -> TypeHandle {
        let name = self.name(base);
        let mut arena = self.write();
        let handle = TypeHandle(arena.defs.len());
        arena.defs.push(Arc::new(TypeDef {
            name,
            base: Some(base),
            fields,
        }));
        handle
    }

    pub fn lookup(&self, name: &str) -> Option<TypeHandle> {
        self.read().names.get(name).copied()
    }

    pub fn name(&self, handle: TypeHandle) -> String {
        self.def(handle).map(|def| def.name.clone()).unwrap_or_default()
    }

    pub fn base(&self, handle: TypeHandle) -> Option<TypeHandle> {
        self.def(handle).and_then(|def| def.base)
    }

    /// Fields declared by this type itself, not by its bases
    pub fn own_fields(&self, handle: TypeHandle) -> Vec<FieldDef> {
        self.def(handle).map(|def| def.fields.clone()).unwrap_or_default()
    }

    /// The type followed by its bases, most derived first
    pub fn chain(&self, handle: TypeHandle) -> Vec<TypeHandle> {
        let arena = self.read();
        let mut chain = Vec::new();
        let mut current = Some(handle);
        while let Some(h) = current {
            let Some(def) = arena.defs.get(h.0) else { break };
            chain.push(h);
            current = def.base;
        }
        chain
    }

    /// Look a field up in the type, then in its bases
    pub fn field(&self, handle: TypeHandle, name: &str) -> Option<FieldDef> {
        let arena = self.read();
        let mut current = Some(handle);
        while let Some(h) = current {
            let def = arena.defs.get(h.0)?;
            if let Some(field) = def.fields.iter().find(|f| f.name == name) {
                return Some(field.clone());
            }
            current = def.base;
        }
        None
    }

    /// Every field visible in the type, base fields first
    pub fn fields(&self, handle: TypeHandle) -> Vec<FieldDef> {
        let mut fields: Vec<FieldDef> = Vec::new();
        for h in self.chain(handle).into_iter().rev() {
            for field in self.own_fields(h) {
                if let Some(existing) = fields.iter_mut().find(|f| f.name == field.name) {
                    *existing = field;
                } else {
                    fields.push(field);
                }
            }
        }
        fields
    }

    /// True when `base` is a strict ancestor of `handle`
    pub fn is_extension_of(&self, handle: TypeHandle, base: TypeHandle) -> bool {
        handle != base && self.chain(handle).contains(&base)
    }

    /// Closest type present in both chains
    pub fn common_ancestor(&self, a: TypeHandle, b: TypeHandle) -> Option<TypeHandle> {
        let other = self.chain(b);
        self.chain(a).into_iter().find(|h| other.contains(h))
    }

    /// Names declared by an extension that already exist further up its chain
    pub fn collisions(&self, handle: TypeHandle) -> Vec<String> {
        let chain = self.chain(handle);
        let mut collisions = Vec::new();
        for (position, h) in chain.iter().enumerate() {
            for field in self.own_fields(*h) {
                let shadowed = chain[position + 1..]
                    .iter()
                    .any(|ancestor| self.own_fields(*ancestor).iter().any(|f| f.name == field.name));
                if shadowed && !collisions.contains(&field.name) {
                    collisions.push(field.name.clone());
                }
            }
        }
        collisions
    }

    /// Declared field at the end of a path, `None` if the path leaves the declared shape
    pub fn path_field(&self, handle: TypeHandle, path: &[PathSegment]) -> Option<FieldDef> {
        let mut current = handle;
        let mut found: Option<FieldDef> = None;
        let mut indexed = false;
        for segment in path {
            match segment {
                PathSegment::Index(_) => {
                    let field = found.as_mut()?;
                    if !field.list || indexed {
                        return None;
                    }
                    indexed = true;
                    field.list = false;
                }
                PathSegment::Field(name) => {
                    if let Some(previous) = &found {
                        match previous.kind {
                            FieldKind::Record(h) if !previous.list => current = h,
                            _ => return None,
                        }
                    }
                    found = Some(self.field(current, name)?);
                    indexed = false;
                }
            }
        }
        found
    }

    /// Check a record against the type
    pub fn validate(&self, handle: TypeHandle, record: &Record) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for field in self.fields(handle) {
            let value = record.get(&field.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if field.min_occurs > 0 {
                    diagnostics.push(
                        Diagnostic::error(format!("Missing required field '{}'", field.name))
                            .within(self.name(handle)),
                    );
                }
                continue;
            }
            if let Value::List(items) = value {
                if field.list && (items.len() as u64) < u64::from(field.min_occurs) {
                    diagnostics.push(
                        Diagnostic::error(format!(
                            "Field '{}' needs at least {} items",
                            field.name, field.min_occurs
                        ))
                        .within(self.name(handle)),
                    );
                }
            }
            if let Err(e) = field.coerce(value.clone()) {
                diagnostics.push(Diagnostic::error(e).within(self.name(handle)));
                continue;
            }
            if let FieldKind::Record(nested) = field.kind {
                let records: Vec<&Record> = match value {
                    Value::Record(r) => vec![r],
                    Value::List(items) => items.iter().filter_map(Value::as_record).collect(),
                    _ => Vec::new(),
                };
                for r in records {
                    diagnostics.extend(
                        self.validate(nested, r)
                            .into_iter()
                            .map(|d| d.within(field.name.clone())),
                    );
                }
            }
        }
        diagnostics
    }

    /// Project a value onto the fields of a type, element-wise for lists
    pub fn mask(&self, handle: TypeHandle, value: Value) -> Result<Value, ExecutionError> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::List(items) => items
                .into_iter()
                .map(|item| self.mask(handle, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Record(mut record) => {
                let mut masked = Record::new();
                for field in self.fields(handle) {
                    let Some(value) = record.shift_remove(&field.name) else {
                        continue;
                    };
                    let value = match field.kind {
                        FieldKind::Record(nested) if !value.is_null() => self.mask(nested, value)?,
                        _ => value,
                    };
                    masked.insert(field.name, value);
                }
                Ok(Value::Record(masked))
            }
            other => Err(ExecutionError::vm(
                codes::MASK_CONTENT,
                format!("Can not mask {} as '{}'", other.kind_name(), self.name(handle)),
            )),
        }
    }
}
