//! Kindling CLI - run and talk to a local llama-server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Kindling - a supervisor for a local llama.cpp server
#[derive(Parser)]
#[command(name = "kindling")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a model and keep the server running until Ctrl-C
    Serve {
        /// Model name or path to a .gguf file
        model: String,
        /// Port to listen on (default: saved setting)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Load a model, send one prompt and stream the reply
    Chat {
        /// Model name or path to a .gguf file
        model: String,
        /// Prompt text
        prompt: String,
        /// Optional system message
        #[arg(long)]
        system: Option<String>,
        /// Port to listen on (default: saved setting)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage installed models
    Models {
        #[command(subcommand)]
        action: Option<ModelAction>,
    },

    /// Show host facts, paths and the launch parameters for a model
    Info {
        /// Model name or path to resolve launch parameters for
        model: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// List installed models
    List,
    /// Copy a .gguf file into the models directory
    Install {
        /// Path to the model file
        path: PathBuf,
    },
    /// Remove an installed model
    Remove {
        /// Model name
        name: String,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    match cli.command {
        Commands::Serve { model, port } => runtime()?.block_on(commands::serve::run(&model, port)),
        Commands::Chat {
            model,
            prompt,
            system,
            port,
        } => runtime()?.block_on(commands::chat::run(&model, &prompt, system.as_deref(), port)),
        Commands::Models { action } => match action.unwrap_or(ModelAction::List) {
            ModelAction::List => commands::models::list(),
            ModelAction::Install { path } => commands::models::install(&path),
            ModelAction::Remove { name } => commands::models::remove(&name),
        },
        Commands::Info { model, json } => commands::info::run(model.as_deref(), json),
    }
}

fn runtime() -> miette::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))
}
