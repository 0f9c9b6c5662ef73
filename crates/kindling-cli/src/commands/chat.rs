//! Chat command - one prompt, streamed reply.

use std::io::Write;

use kindling_local_ai::{ChatBackend, ChatMessage};

use super::{load_with_progress, open_server, resolve_model};

pub(crate) async fn run(
    model: &str,
    prompt: &str,
    system: Option<&str>,
    port: Option<u16>,
) -> miette::Result<()> {
    let model_path = resolve_model(model)?;
    let server = open_server(port);
    load_with_progress(&server, &model_path).await?;

    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let backend: &dyn ChatBackend = &server;
    let mut stdout = std::io::stdout();
    let result = backend
        .stream_chat(&messages, &mut |text: &str| {
            print!("{}", text);
            stdout.flush().ok();
        })
        .await;
    println!();

    server.stop().await;
    result
        .map(|_| ())
        .map_err(|e| miette::miette!("Chat failed: {}", e))
}
