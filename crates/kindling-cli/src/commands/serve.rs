//! Serve command - keep a model loaded until interrupted.

use kindling_local_ai::ServerState;
use tokio::sync::broadcast::error::RecvError;

use super::{load_with_progress, open_server, resolve_model};

pub(crate) async fn run(model: &str, port: Option<u16>) -> miette::Result<()> {
    let model_path = resolve_model(model)?;
    let server = open_server(port);

    let config = load_with_progress(&server, &model_path).await?;
    println!("Serving {} at {}", model_path.display(), config.base_url());
    println!(
        "  threads={} ctx={} gpu_layers={}",
        config.thread_count, config.context_size, config.gpu_layers
    );
    if let Some(pid) = server.pid().await {
        println!("  pid={}", pid);
    }
    println!("Press Ctrl-C to stop.");

    let mut events = server.events();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| miette::miette!("Failed to wait for Ctrl-C: {}", e))?;
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(ServerState::LoadingModel { .. }) => {}
                Ok(ServerState::Error { reason }) => {
                    server.stop().await;
                    return Err(miette::miette!("Server gave up: {}", reason));
                }
                Ok(state) => println!("[{}]", state),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }

    println!("Stopping server...");
    server.stop().await;
    Ok(())
}
