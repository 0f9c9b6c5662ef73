//! Local llama.cpp server supervision for Kindling.
//!
//! This crate owns the lifecycle of a locally spawned `llama-server`
//! process: it picks launch parameters from the host, checks preconditions,
//! launches the server, waits until the model is actually loaded, watches the
//! process for crashes and relaunches it within a bounded retry budget. Chat
//! requests go through the OpenAI-compatible HTTP API with reasoning blocks
//! stripped from the output.
//!
//! ```no_run
//! use kindling_local_ai::{ChatMessage, LocalServer, SupervisorOptions};
//!
//! # async fn demo() -> Result<(), kindling_local_ai::LocalAIError> {
//! let server = LocalServer::new(SupervisorOptions::from_env());
//! server.initialize().await?;
//! server.load_model("/models/qwen-7b-q4.gguf").await?;
//! let reply = server
//!     .stream_chat(&[ChatMessage::user("Hello")], |text| print!("{}", text))
//!     .await?;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod client;
mod config;
mod error;
mod model;
mod model_config;
pub mod paths;
mod precheck;
mod process;
mod readiness;
mod recovery;
mod server;
mod settings;
mod shutdown;
mod state;
mod system_info;
mod think_filter;
mod watchdog;

#[cfg(test)]
mod test_support;

pub use backend::ChatBackend;
pub use client::{ChatMessage, LlamaCppClient, SseLineDecoder};
pub use config::{SupervisorOptions, SupervisorOptionsBuilder, DEFAULT_SHUTDOWN_GRACE};
pub use error::LocalAIError;
pub use model::{InstalledModel, ModelManager};
pub use model_config::{resolve, thread_count_for, ServerConfig};
pub use precheck::{estimate_required_memory, port_is_free, run_prechecks};
pub use process::{locate_server_binary, progress_from_line};
pub use readiness::{CanaryPolicy, ReadinessProber, DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT};
pub use recovery::{CrashRecovery, RecoveryDecision, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF};
pub use server::LocalServer;
pub use settings::ServerSettings;
pub use shutdown::{ShutdownOutcome, StopSignal};
pub use state::ServerState;
pub use system_info::HostFacts;
pub use think_filter::{strip_think_blocks, ThinkTagFilter};
pub use watchdog::DEFAULT_WATCHDOG_INTERVAL;

/// Default port for the local llama-server instance.
pub const DEFAULT_PORT: u16 = 11435;

/// Default bind address; the server is never exposed beyond loopback.
pub const DEFAULT_HOST: &str = "127.0.0.1";
