use anyhow::{bail, Context, Result};
use std::sync::Arc;
use stepvm::cli::commands::{RunCommand, ValidateCommand};
use stepvm::cli::output::*;
use stepvm::cli::{Cli, Command};
use stepvm::core::{Diagnostic, Record, ServiceConfig, Value};
use stepvm::execution::{ExecutionContext, RecordingTracker, Service, ServiceContext, TokioExecutor, VmService};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging, RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_service(cmd).await?,
        Command::Validate(cmd) => validate_service(cmd)?,
    }

    Ok(())
}

/// Load a service file and register every service it defines
fn load(file: &str) -> Result<(ServiceContext, Vec<Arc<VmService>>)> {
    let config = ServiceConfig::from_file(file).context("Failed to load service config")?;
    config.validate()?;
    let (context, registry) = ServiceContext::standalone();
    let services = config.into_services(&context)?;
    for service in &services {
        registry.register(service.clone());
    }
    Ok((context, services))
}

fn diagnostics(context: &ServiceContext, services: &[Arc<VmService>]) -> Vec<Diagnostic> {
    services.iter().flat_map(|service| service.validate(context)).collect()
}

fn read_input(path: Option<&str>) -> Result<Record> {
    let Some(path) = path else {
        return Ok(Record::new());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read input file {}", path))?;
    let json: serde_json::Value =
        serde_yaml::from_str(&text).with_context(|| format!("Failed to parse input file {}", path))?;
    match Value::from(json) {
        Value::Record(record) => Ok(record),
        Value::Null => Ok(Record::new()),
        other => bail!("Input must be a mapping, got {}", other.kind_name()),
    }
}

async fn run_service(cmd: &RunCommand) -> Result<()> {
    let (context, services) = load(&cmd.file)?;
    let Some(service) = services.first().cloned() else {
        bail!("No service defined in {}", cmd.file);
    };
    println!("{} Loaded service: {}", INFO, style(service.id()).bold());

    let findings = diagnostics(&context, &services);
    if findings.iter().any(Diagnostic::is_error) {
        for finding in &findings {
            println!("{}", format_diagnostic(finding));
        }
        println!("{} {} is not valid", CROSS, style(service.id()).bold());
        std::process::exit(1);
    }

    let input = read_input(cmd.input.as_deref())?;
    let tracker = Arc::new(RecordingTracker::new());
    let mut execution = ExecutionContext::new(context);
    if let Some(tasks) = TokioExecutor::current() {
        execution = execution.with_task_executor(Arc::new(tasks));
    }
    if !cmd.feature.is_empty() {
        execution = execution.with_features(cmd.feature.iter().cloned());
    }
    if cmd.trace {
        execution = execution.with_tracker(tracker.clone());
    }

    println!("{} Running {}", ROCKET, style(service.id()).bold());
    let result = tokio::task::spawn_blocking(move || service.execute(&execution, input))
        .await
        .context("Service run panicked")?;

    if cmd.trace {
        for event in tracker.events() {
            println!("  {}", format_tracker_event(&event));
        }
    }

    match result {
        Ok(output) => {
            println!("{} Completed {}", CHECK, style("successfully").green());
            println!("{}", serde_json::to_string_pretty(&Value::Record(output).to_json())?);
            Ok(())
        }
        Err(e) => {
            println!("{}", format_error(&e));
            std::process::exit(1);
        }
    }
}

fn validate_service(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating service...", INFO);

    let (context, services) = match load(&cmd.file) {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    };
    let findings = diagnostics(&context, &services);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&findings)?);
    } else {
        for service in &services {
            println!(
                "  {} ({} features)",
                style(service.id()).bold(),
                style(service.features().len()).cyan()
            );
        }
        for finding in &findings {
            println!("{}", format_diagnostic(finding));
        }
    }

    if findings.iter().any(Diagnostic::is_error) {
        println!("{} Validation failed", CROSS);
        std::process::exit(1);
    }
    println!("{} Service definition is valid!", CHECK);
    Ok(())
}
