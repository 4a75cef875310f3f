//! Workflow services - run a step tree against an input record

use crate::core::config::VmConfig;
use crate::core::content::PipelineContent;
use crate::core::context::VmContext;
use crate::core::error::{codes, standard_exceptions, Diagnostic, ExceptionDescription, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::{FieldDef, FieldKind, TypeHandle, TypeRegistry};
use crate::core::value::{Record, Value};
use crate::execution::cluster::{Cluster, LocalCluster};
use crate::execution::context::{ExecutionContext, ServiceContext};
use crate::execution::service::{Service, ServiceInterface};
use crate::query::Query;
use crate::steps::{run_tracked, Sequence, Step};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A service implemented by a step tree
pub struct VmService {
    id: String,
    root: Step,
    interface: ServiceInterface,
    pipeline: TypeHandle,
    config: VmConfig,

    /// Registry the interface and pipeline handles point into
    types: Arc<TypeRegistry>,

    /// Used for synchronized sequences when the host offers no cluster
    cluster: Arc<dyn Cluster>,
}

impl VmService {
    /// Define the interface and pipeline types of a new service
    ///
    /// The pipeline holds `input`, `output` and the declared variables.
    pub fn new(
        id: impl Into<String>,
        context: &ServiceContext,
        input: Vec<FieldDef>,
        output: Vec<FieldDef>,
        variables: Vec<FieldDef>,
        root: Sequence,
    ) -> Self {
        let id = id.into();
        let types = &context.types;
        let input = types.define(format!("{}:input", id), input);
        let output = types.define(format!("{}:output", id), output);
        let mut fields = vec![
            FieldDef::new("input", FieldKind::Record(input)),
            FieldDef::new("output", FieldKind::Record(output)),
        ];
        fields.extend(variables);
        let pipeline = types.define(format!("{}:pipeline", id), fields);

        Self {
            id,
            root: Step::Sequence(root),
            interface: ServiceInterface { input, output },
            pipeline,
            config: VmConfig::default(),
            types: context.types.clone(),
            cluster: Arc::new(LocalCluster::new()),
        }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn root(&self) -> &Step {
        &self.root
    }

    /// Mutable access to the tree, cached types and queries are dropped
    pub fn root_mut(&mut self) -> &mut Step {
        self.root.refresh();
        &mut self.root
    }

    pub fn pipeline_type(&self) -> TypeHandle {
        self.pipeline
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Static checks of the whole tree
    pub fn validate(&self, context: &ServiceContext) -> Vec<Diagnostic> {
        self.root
            .validate(context, self.pipeline)
            .into_iter()
            .map(|d| d.within(self.id.clone()))
            .collect()
    }

    /// Errors this service may raise: the engine errors and every literal Throw code
    pub fn exceptions(&self) -> Vec<ExceptionDescription> {
        let mut exceptions = standard_exceptions();
        self.root.walk(&mut |step| {
            let Step::Throw(throw) = step else {
                return;
            };
            let Some(code) = throw.code.as_ref().filter(|code| !is_expression(code)) else {
                return;
            };
            exceptions.push(ExceptionDescription {
                id: throw.meta.id.clone(),
                code: code.clone(),
                message: throw
                    .message
                    .clone()
                    .filter(|message| !is_expression(message))
                    .unwrap_or_default(),
                description: throw.error_description.clone().filter(|d| !is_expression(d)),
            });
        });
        exceptions
    }

    /// Feature names referenced by feature gates anywhere in the tree
    pub fn features(&self) -> BTreeSet<String> {
        let mut features = BTreeSet::new();
        self.root.walk(&mut |step| {
            if let Some(query) = step.meta().features.as_deref().and_then(|f| Query::parse(f).ok()) {
                features.extend(query.variables());
            }
        });
        features
    }

    fn invalid_data(&self, code: &str, what: &str, validations: Vec<Diagnostic>) -> Option<ExecutionError> {
        if validations.iter().any(Diagnostic::is_error) {
            Some(
                ExecutionError::vm(code, format!("Invalid {} for service {}", what, self.id))
                    .with_validations(validations),
            )
        } else {
            None
        }
    }
}

fn is_expression(raw: &str) -> bool {
    raw.len() > 1 && raw.starts_with('=')
}

impl Service for VmService {
    fn id(&self) -> &str {
        &self.id
    }

    fn interface(&self) -> ServiceInterface {
        self.interface
    }

    fn execute(&self, context: &ExecutionContext, input: Record) -> Result<Record, ExecutionError> {
        info!("Starting service {}", self.id);
        let own_types;
        let context = if Arc::ptr_eq(context.types(), &self.types) {
            context
        } else {
            debug!("Service {} runs with its own type registry", self.id);
            own_types = context.clone().with_types(self.types.clone());
            &own_types
        };
        let types = context.types();
        if let Some(error) = self.invalid_data(codes::INVALID_INPUT, "input", types.validate(self.interface.input, &input)) {
            return Err(error);
        }

        let mut pipeline = PipelineContent::new(types.clone(), self.pipeline);
        pipeline.set_field("input", Value::Record(input))?;
        pipeline.set_field("output", Value::Record(Record::new()))?;
        let cluster = context.cluster().cloned().unwrap_or_else(|| self.cluster.clone());
        let mut vm = VmContext::new(context, &self.config, cluster, pipeline);

        let result = run_tracked(&self.root, &mut vm, self.pipeline);
        vm.service_resources().close_all();

        match result {
            Err(e) => {
                if self.config.log_errors {
                    error!("Service {} failed: {}", self.id, e.trace());
                }
                return Err(e);
            }
            Ok(Flow::Aborted) => {
                return Err(ExecutionError::vm(codes::ABORTED, format!("Execution of {} was aborted", self.id)));
            }
            Ok(_) if vm.is_aborted() => {
                return Err(ExecutionError::vm(codes::ABORTED, format!("Execution of {} was aborted", self.id)));
            }
            Ok(_) => {}
        }

        let output = match vm.pipeline.get("output") {
            Some(Value::Record(output)) => output.clone(),
            _ => Record::new(),
        };
        if let Some(error) = self.invalid_data(codes::INVALID_OUTPUT, "output", types.validate(self.interface.output, &output)) {
            return Err(error);
        }
        info!("Service {} completed", self.id);
        Ok(output)
    }
}

impl fmt::Debug for VmService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmService")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("config", &self.config)
            .finish()
    }
}
