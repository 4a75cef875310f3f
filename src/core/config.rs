//! Service configuration from YAML

use crate::core::error::ErrorClass;
use crate::core::types::{FieldDef, FieldKind, TypeRegistry};
use crate::execution::context::ServiceContext;
use crate::execution::engine::VmService;
use crate::steps::{Sequence, Step};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Environment variable overriding [`VmConfig::log_errors`]
pub const LOG_ERRORS_ENV: &str = "STEPVM_LOG_ERRORS";

/// Interpreter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Log exceptions caught by Catch steps
    #[serde(default = "default_log_errors")]
    pub log_errors: bool,

    /// Maximum nesting of running steps
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_log_errors() -> bool {
    true
}

fn default_max_depth() -> usize {
    256
}

impl VmConfig {
    pub fn new() -> Self {
        Self {
            log_errors: default_log_errors(),
            max_depth: default_max_depth(),
        }
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(LOG_ERRORS_ENV) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.log_errors = true,
                "0" | "false" | "no" | "off" => self.log_errors = false,
                other => tracing::warn!("Ignoring {}={}", LOG_ERRORS_ENV, other),
            }
        }
        self
    }

    pub fn with_log_errors(mut self, log_errors: bool) -> Self {
        self.log_errors = log_errors;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A field as declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,

    /// `any`, `string`, `integer`, `decimal`, `boolean`, `resource`,
    /// `error`, `error:<class>` or the name of a declared type
    #[serde(rename = "type", default = "default_field_type")]
    pub type_name: String,

    #[serde(default)]
    pub list: bool,

    /// Shorthand for `min_occurs: 1`
    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub min_occurs: Option<u32>,

    #[serde(default)]
    pub hidden: bool,
}

fn default_field_type() -> String {
    "any".to_string()
}

impl FieldConfig {
    /// Resolve the declared type against the registry
    pub fn to_field(&self, types: &TypeRegistry) -> Result<FieldDef> {
        let kind = match self.type_name.as_str() {
            "any" => FieldKind::Any,
            "string" => FieldKind::String,
            "integer" => FieldKind::Integer,
            "decimal" => FieldKind::Decimal,
            "boolean" => FieldKind::Boolean,
            "resource" => FieldKind::Resource,
            "error" => FieldKind::Error(ErrorClass::Exception),
            other => match other.strip_prefix("error:") {
                Some(class) => FieldKind::Error(parse_error_class(class)?),
                None => FieldKind::Record(types.lookup(other).with_context(|| {
                    format!("Field '{}' has unknown type '{}'", self.name, other)
                })?),
            },
        };
        let mut field = FieldDef::new(self.name.clone(), kind);
        field.list = self.list;
        field.hidden = self.hidden;
        field.min_occurs = self.min_occurs.unwrap_or(u32::from(self.required));
        Ok(field)
    }
}

fn parse_error_class(name: &str) -> Result<ErrorClass> {
    serde_yaml::from_str(name).with_context(|| format!("Unknown error class '{}'", name))
}

/// A named structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeConfig {
    pub name: String,

    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

/// A workflow service loaded from YAML
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service id used by invokes
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub vm: VmConfig,

    /// Structures referenced by fields, declared before use
    #[serde(default)]
    pub types: Vec<TypeConfig>,

    #[serde(default)]
    pub input: Vec<FieldConfig>,

    #[serde(default)]
    pub output: Vec<FieldConfig>,

    /// Variables declared at pipeline level
    #[serde(default)]
    pub variables: Vec<FieldConfig>,

    /// Transaction id variable of the root sequence
    #[serde(default)]
    pub transaction_variable: Option<String>,

    /// Children of the root sequence
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Further services defined alongside this one
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl ServiceConfig {
    /// Load service configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse service configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need a type registry
    pub fn validate(&self) -> Result<()> {
        let mut service_names = HashSet::new();
        let mut type_names = HashSet::new();
        self.check(&mut service_names, &mut type_names)
    }

    fn check<'a>(&'a self, service_names: &mut HashSet<&'a str>, type_names: &mut HashSet<&'a str>) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Service name must not be empty");
        }
        if !service_names.insert(&self.name) {
            anyhow::bail!("Duplicate service name: {}", self.name);
        }
        if self.vm.max_depth == 0 {
            anyhow::bail!("Service '{}' must allow a depth of at least 1", self.name);
        }

        for ty in &self.types {
            if !type_names.insert(&ty.name) {
                anyhow::bail!("Duplicate type name: {}", ty.name);
            }
            check_unique_fields(&ty.name, &ty.fields)?;
        }
        check_unique_fields("input", &self.input)?;
        check_unique_fields("output", &self.output)?;

        let mut seen = HashSet::new();
        for field in &self.variables {
            if matches!(field.name.as_str(), "input" | "output") {
                anyhow::bail!("Variable '{}' clashes with the service interface", field.name);
            }
            if !seen.insert(field.name.as_str()) {
                anyhow::bail!("Duplicate variable: {}", field.name);
            }
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            let mut duplicate = None;
            step.walk(&mut |s| {
                if !step_ids.insert(s.id()) && duplicate.is_none() {
                    duplicate = Some(s.id().to_string());
                }
            });
            if let Some(id) = duplicate {
                anyhow::bail!("Duplicate step ID in service '{}': {}", self.name, id);
            }
        }

        for service in &self.services {
            service.check(service_names, type_names)?;
        }
        Ok(())
    }

    /// Build this service and every service defined alongside it
    ///
    /// The first service returned is the one this configuration describes.
    pub fn into_services(self, context: &ServiceContext) -> Result<Vec<Arc<VmService>>> {
        let ServiceConfig {
            name,
            vm,
            types,
            input,
            output,
            variables,
            transaction_variable,
            steps,
            services,
            ..
        } = self;

        for ty in &types {
            let fields = resolve_fields(&context.types, &ty.fields)?;
            context.types.define(ty.name.clone(), fields);
        }
        let input = resolve_fields(&context.types, &input)?;
        let output = resolve_fields(&context.types, &output)?;
        let variables = resolve_fields(&context.types, &variables)?;

        let mut root = Sequence::new(steps);
        root.transaction_variable = transaction_variable;

        let service = VmService::new(name, context, input, output, variables, root).with_config(vm.with_env_overrides());
        let mut built = vec![Arc::new(service)];
        for nested in services {
            built.extend(nested.into_services(context)?);
        }
        Ok(built)
    }
}

fn check_unique_fields(owner: &str, fields: &[FieldConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            anyhow::bail!("Duplicate field '{}' in {}", field.name, owner);
        }
    }
    Ok(())
}

fn resolve_fields(types: &TypeRegistry, fields: &[FieldConfig]) -> Result<Vec<FieldDef>> {
    fields.iter().map(|f| f.to_field(types)).collect()
}
