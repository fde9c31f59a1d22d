//! Caravel CLI - Run ML container packages on any substrate.
//!
//! A thin front over the execution engine: parse arguments, build the
//! effective configuration, resolve the platform, and dispatch to the
//! selected runner. Errors are rendered as a single-line summary plus a
//! structured context block on stderr; the exit code encodes the error
//! family (1 configuration/io, 2 execution, 3 internal).

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use caravel_core::{CaravelError, CaravelResult};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

mod commands;
mod engine;
mod logging;

use engine::Engine;

/// Caravel - portable ML container packages.
#[derive(Parser)]
#[command(name = "caravel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log verbosity: critical, error, warning, info, or debug.
    #[arg(long, global = true, default_value = "warning")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every package-facing command.
#[derive(Args, Clone)]
struct CommonOpts {
    /// Package root directory or description file.
    #[arg(long, default_value = ".")]
    package: PathBuf,

    /// Platform name from the system settings.
    #[arg(long, default_value = "container")]
    platform: String,

    /// Workspace override (default: `<package>/workspace`).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Task names, comma-separated.
    #[arg(long)]
    task: Option<String>,

    /// `-Pkey.path=value` configuration overrides and `--name=value`
    /// task parameter overrides.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the substrate for the package (build or pull the image,
    /// provision the remote side).
    Configure(CommonOpts),

    /// Execute one or more tasks on the selected platform.
    Run(CommonOpts),

    /// Print the package identity, hardware expectations, and tasks.
    Describe(CommonOpts),

    /// Render the effective configuration as YAML.
    #[command(alias = "show_config")]
    ShowConfig {
        #[command(flatten)]
        common: CommonOpts,

        /// Evaluate all variable interpolations first.
        #[arg(long)]
        resolve: bool,
    },

    /// Inspect and edit the system settings file.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Scaffold a minimal runnable package.
    Create {
        /// Package name.
        #[arg(long, default_value = "hello")]
        name: String,

        /// Directory the package is created in.
        #[arg(long, default_value = ".")]
        directory: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List platforms and the runner kinds behind them.
    List,

    /// Register a new platform from a runner kind's defaults.
    CreatePlatform {
        /// Runner kind the platform is an instance of.
        runner: String,
        /// New platform name.
        name: String,
    },

    /// Remove a platform.
    RemovePlatform {
        /// Platform to remove.
        name: String,
    },

    /// Rename a platform.
    RenamePlatform {
        /// Current name.
        old: String,
        /// New name.
        new: String,
    },

    /// Copy a platform under a new name.
    CopyPlatform {
        /// Source platform.
        src: String,
        /// Destination platform.
        dst: String,
    },

    /// Rename a runner kind.
    RenameRunner {
        /// Current kind name.
        old: String,
        /// New kind name.
        new: String,
        /// Also update platforms that use the kind.
        #[arg(long)]
        update_platforms: bool,
    },

    /// Remove a runner kind.
    RemoveRunner {
        /// Kind to remove.
        name: String,
        /// Also remove platforms that use the kind.
        #[arg(long)]
        remove_platforms: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    if let Err(err) = dispatch(cli).await {
        render_error(&err);
        std::process::exit(exit_code(&err));
    }
}

async fn dispatch(cli: Cli) -> CaravelResult<()> {
    match cli.command {
        Commands::Configure(common) => {
            let engine = Engine::bootstrap()?;
            commands::configure::execute(&engine, &common).await
        },
        Commands::Run(common) => {
            let engine = Engine::bootstrap()?;
            commands::run::execute(&engine, &common).await
        },
        Commands::Describe(common) => commands::describe::execute(&common),
        Commands::ShowConfig { common, resolve } => {
            let engine = Engine::bootstrap()?;
            commands::show_config::execute(&engine, &common, resolve)
        },
        Commands::Config { command } => {
            let mut engine = Engine::bootstrap()?;
            commands::config::execute(&mut engine, &command)
        },
        Commands::Create { name, directory } => commands::create::execute(&name, &directory),
    }
}

/// Exit-code family per error kind.
fn exit_code(err: &CaravelError) -> i32 {
    match err {
        CaravelError::Configuration { .. } | CaravelError::Io { .. } => 1,
        CaravelError::Execution(_) => 2,
        CaravelError::Internal { .. } => 3,
    }
}

/// Single-line summary plus a structured context block on stderr.
fn render_error(err: &CaravelError) {
    eprintln!("{} {err}", "error:".red().bold());

    if let CaravelError::Execution(ctx) = err {
        eprintln!("{}", "context:".bold());
        eprintln!("  command: {}", ctx.command);
        if let Some(code) = ctx.exit_code {
            eprintln!("  exit_code: {code}");
        }
        if let Some(phase) = &ctx.phase {
            eprintln!("  phase: {phase}");
        }
        if let Some(output) = &ctx.captured_output {
            eprintln!("  captured_output: |");
            for line in output.lines() {
                eprintln!("    {line}");
            }
        }
    }
}
