use std::path::PathBuf;

use anyhow::{Result, ensure};
use clap::{Parser, Subcommand, ValueHint};

/// Options shared by every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionArgs {
    pub source: PathBuf,
    pub username: String,
    pub model_name: String,
    pub description: Option<String>,
}

/// The top-level command requested by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    Provision(ProvisionArgs),
    Deprovision { model_id: i64 },
    ListModels { json: bool },
    ShowVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub global: GlobalOptions,
    pub command: Command,
}

/// Parse CLI arguments into a high-level command.
pub fn parse() -> Result<Invocation> {
    from_cli(Cli::parse())
}

fn from_cli(cli: Cli) -> Result<Invocation> {
    let global = GlobalOptions {
        config: cli.config,
        log_filter: cli.log_level,
    };

    let command = match cli.command.unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => Command::Serve,
        CliCommand::Provision {
            source,
            user,
            name,
            description,
        } => {
            ensure!(!user.trim().is_empty(), "--user must not be empty");
            ensure!(!name.trim().is_empty(), "--name must not be empty");
            Command::Provision(ProvisionArgs {
                source,
                username: user,
                model_name: name,
                description: description.filter(|d| !d.trim().is_empty()),
            })
        }
        CliCommand::Deprovision { model_id } => {
            ensure!(model_id > 0, "model id must be positive");
            Command::Deprovision { model_id }
        }
        CliCommand::Models { json } => Command::ListModels { json },
        CliCommand::Version => Command::ShowVersion,
    };

    Ok(Invocation { global, command })
}

#[derive(Parser, Debug)]
#[command(
    name = "modeldock",
    about = "Run model containers on demand behind an inference API",
    disable_version_flag = true
)]
struct Cli {
    /// Path to modeldock.toml (defaults to searching the current directory and its parents).
    #[arg(long, short = 'c', global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `modeldock=debug,tower_http=info`.
    #[arg(long = "log-level", global = true, env = "MODELDOCK_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start the inference API with the idle reaper and event consumer.
    Serve,

    /// Build a model directory into an image and container and announce it.
    Provision {
        #[arg(value_hint = ValueHint::DirPath)]
        source: PathBuf,

        #[arg(long)]
        user: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        description: Option<String>,
    },

    /// Stop and remove a model's container and image and drop it from the registry.
    Deprovision { model_id: i64 },

    /// List registered models.
    Models {
        #[arg(long)]
        json: bool,
    },

    /// Show build information.
    Version,
}
