//! CLI command definitions

use clap::Args;

/// Run a service
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the service YAML file
    #[arg(short, long)]
    pub file: String,

    /// YAML or JSON file holding the input record
    #[arg(short, long)]
    pub input: Option<String>,

    /// Enabled feature, repeat for several
    #[arg(long)]
    pub feature: Vec<String>,

    /// Print every step entered and left
    #[arg(long)]
    pub trace: bool,
}

/// Validate a service definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the service YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
