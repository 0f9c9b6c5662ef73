//! CLI commands.

pub mod chat;
pub mod info;
pub mod models;
pub mod serve;

use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use kindling_local_ai::{
    ModelManager, LocalServer, ServerConfig, ServerSettings, ServerState, SupervisorOptions,
};

/// Resolve a model name or path, pointing at `kindling models` on failure.
pub(crate) fn resolve_model(reference: &str) -> miette::Result<PathBuf> {
    ModelManager::new().find(reference).map_err(|_| {
        miette::miette!(
            help = "run `kindling models` to see installed models",
            "Model not found: {}",
            reference
        )
    })
}

/// Build a supervisor from the environment, with an optional port override.
pub(crate) fn open_server(port: Option<u16>) -> LocalServer {
    let options = SupervisorOptions::from_env();
    let mut settings = options
        .settings_path
        .as_deref()
        .map(ServerSettings::load)
        .unwrap_or_default();
    if let Some(port) = port {
        settings.port = port;
    }
    LocalServer::with_settings(options, settings)
}

/// Load a model while rendering the loading progress.
pub(crate) async fn load_with_progress(
    server: &LocalServer,
    model: &std::path::Path,
) -> miette::Result<ServerConfig> {
    server
        .initialize()
        .await
        .map_err(|e| miette::miette!("Failed to initialize: {}", e))?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .map_err(|e| miette::miette!("Invalid progress bar template: {}", e))?
            .progress_chars("#>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut states = server.subscribe();
    let render = {
        let bar = bar.clone();
        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                if let Some(progress) = state.progress() {
                    bar.set_position((progress * 100.0) as u64);
                    bar.set_message("loading model");
                } else {
                    bar.set_message(state.to_string());
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    };

    let result = server.load_model(model).await;
    render.abort();

    match result {
        Ok(config) => {
            bar.set_position(100);
            bar.finish_with_message(format!("ready on {}", config.base_url()));
            Ok(config)
        }
        Err(e) => {
            let state = server.state();
            bar.abandon_with_message(state.to_string());
            if let ServerState::Error { .. } = state {
                Err(miette::miette!("Failed to load model: {}", e))
            } else {
                Err(miette::miette!("Model load did not complete: {}", e))
            }
        }
    }
}
