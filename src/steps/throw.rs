//! Throw: raise a business error

use super::StepMeta;
use crate::core::context::VmContext;
use crate::core::error::{Diagnostic, ErrorClass, ExecutionError, Impersonation};
use crate::core::state::Flow;
use crate::core::types::TypeHandle;
use crate::core::value::{Record, Value};
use crate::execution::context::ServiceContext;
use serde::{Deserialize, Serialize};

/// Raises an error
///
/// Every field is a literal, or an expression when prefixed with `=`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Throw {
    #[serde(flatten)]
    pub meta: StepMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Human readable description of the error, distinct from the step description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,

    /// The error may be shown to callers outside the service
    #[serde(default)]
    pub whitelist: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_id: Option<String>,
}

impl Throw {
    fn value(&self, raw: &Option<String>, record: &Record) -> Result<Option<Value>, ExecutionError> {
        match raw {
            Some(raw) => self.meta.literal_or_expression(raw, record).map(Some),
            None => Ok(None),
        }
    }

    fn text(&self, raw: &Option<String>, record: &Record) -> Result<Option<String>, ExecutionError> {
        Ok(self
            .value(raw, record)?
            .filter(|value| !value.is_null())
            .map(|value| value.to_text().unwrap_or_else(|| value.to_string())))
    }

    pub fn execute(&self, vm: &mut VmContext<'_>, _scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let record = vm.pipeline.record();
        let message = self.value(&self.message, record)?;
        let code = self.text(&self.code, record)?;
        let description = self.text(&self.error_description, record)?;
        let data = self.value(&self.data, record)?.filter(|value| !value.is_null());
        let impersonation = Impersonation {
            alias: self.text(&self.alias, record)?,
            realm: self.text(&self.realm, record)?,
            authentication_id: self.text(&self.authentication_id, record)?,
        };

        if let Some(Value::Error(original)) = &message {
            if code.is_none() && description.is_none() && impersonation.is_empty() {
                let mut rethrown = (**original).clone();
                rethrown.explicit = true;
                if rethrown.source_id.is_none() {
                    rethrown.source_id = Some(self.meta.id.clone());
                }
                if rethrown.data.is_none() {
                    rethrown.data = data;
                }
                if !rethrown.whitelisted {
                    rethrown.whitelisted = self.whitelist;
                }
                return Err(rethrown);
            }
        }

        let (text, cause) = match message {
            Some(Value::Error(error)) => (error.message.clone(), Some(error)),
            Some(Value::Null) | None => ("No message".to_string(), vm.caught().cloned()),
            Some(other) => (
                other.to_text().unwrap_or_else(|| other.to_string()),
                vm.caught().cloned(),
            ),
        };
        let mut error = ExecutionError::new(ErrorClass::Business, text).with_source(self.meta.id.clone());
        error.code = code;
        error.description = description;
        error.data = data;
        error.explicit = true;
        error.whitelisted = self.whitelist;
        if !impersonation.is_empty() {
            error.impersonation = Some(impersonation);
        }
        error.cause = cause;
        Err(error)
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        [
            &self.message,
            &self.code,
            &self.data,
            &self.error_description,
            &self.alias,
            &self.realm,
            &self.authentication_id,
        ]
        .into_iter()
        .flatten()
        .flat_map(|raw| self.meta.validate_literal_or_expression(raw, context, scope))
        .collect()
    }
}
