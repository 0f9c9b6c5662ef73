//! Spawning llama-server and capturing its output.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LocalAIError;
use crate::model_config::ServerConfig;
use crate::paths::server_binary_candidates;
use crate::shutdown::{self, ShutdownOutcome, StopSignal, Terminable};

/// Variables that inject code or debugging hooks into child processes.
const SANITIZED_ENV: &[&str] = &[
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
    "__XPC_DYLD_INSERT_LIBRARIES",
    "__XPC_DYLD_LIBRARY_PATH",
    "LD_PRELOAD",
    "LD_AUDIT",
    "MallocStackLogging",
    "MallocStackLoggingNoCompact",
    "NSZombieEnabled",
];

/// How long to wait for the OS to reap a killed child.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Find the llama-server binary, trying `explicit` first.
pub fn locate_server_binary(explicit: Option<&Path>) -> Result<PathBuf, LocalAIError> {
    let candidates = server_binary_candidates(explicit);
    if let Some(found) = candidates.iter().find(|c| c.is_file()) {
        debug!("Using llama-server at {}", found.display());
        return Ok(found.clone());
    }

    let searched = candidates
        .iter()
        .map(|c| c.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(LocalAIError::ServerBinaryNotFound(searched))
}

/// A running llama-server child process.
pub struct ServerProcess {
    child: Child,
    pid: u32,
    started_at: Instant,
    readers: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Time since the process was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit status if the process has exited, without blocking.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to query llama-server (PID: {}): {}", self.pid, e);
                None
            }
        }
    }

    /// Stop the process with the escalating signal sequence and reap it.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        info!("Stopping llama-server (PID: {})", self.pid);
        // Output readers go first so nothing reads from a closing pipe.
        self.detach_readers();

        let outcome = shutdown::terminate(&mut self, grace).await;
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("llama-server exited with status: {}", status),
            Ok(Err(e)) => warn!("Error reaping llama-server: {}", e),
            Err(_) => warn!("llama-server (PID: {}) was not reaped in time", self.pid),
        }
        outcome
    }

    /// Kill immediately, used when the owning application is gone.
    pub async fn kill_now(mut self) {
        self.detach_readers();
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill llama-server (PID: {}): {}", self.pid, e);
        }
    }

    fn detach_readers(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Terminable for ServerProcess {
    fn is_alive(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    fn send_signal(&mut self, signal: StopSignal) -> io::Result<()> {
        match signal {
            StopSignal::Kill => self.child.start_kill(),
            #[cfg(unix)]
            StopSignal::Interrupt => send_unix_signal(self.pid, libc::SIGINT),
            #[cfg(unix)]
            StopSignal::Terminate => send_unix_signal(self.pid, libc::SIGTERM),
            #[cfg(not(unix))]
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "graceful signals are not available on this platform",
            )),
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.detach_readers();
    }
}

#[cfg(unix)]
fn send_unix_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether a process with `pid` exists.
#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    true
}

/// Strip injection hooks from the environment `command` passes on.
fn sanitize_env(command: &mut Command) {
    for var in SANITIZED_ENV {
        command.env_remove(var);
    }
    command.env("OS_ACTIVITY_MODE", "disable");
}

/// Spawn llama-server for `config`.
///
/// Output lines are logged and, when they carry a loading milestone, the
/// matching progress estimate is sent on `progress`.
pub fn launch(
    binary: &Path,
    config: &ServerConfig,
    progress: mpsc::UnboundedSender<f32>,
) -> Result<ServerProcess, LocalAIError> {
    info!(
        "Starting llama-server on port {} with model {}",
        config.port,
        config.model_path.display()
    );

    let mut command = Command::new(binary);
    command
        .args(config.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    sanitize_env(&mut command);

    #[cfg(target_os = "linux")]
    unsafe {
        // Take the child down with us if we die without running shutdown.
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|e| LocalAIError::SpawnFailed(format!("{}: {}", binary.display(), e)))?;

    let pid = child
        .id()
        .ok_or_else(|| LocalAIError::SpawnFailed("process exited during spawn".to_string()))?;
    debug!("llama-server process started with PID: {}", pid);

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, "stdout", progress.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, "stderr", progress));
    }

    Ok(ServerProcess {
        child,
        pid,
        started_at: Instant::now(),
        readers,
    })
}

fn spawn_reader<R>(
    stream: R,
    name: &'static str,
    progress: mpsc::UnboundedSender<f32>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if looks_like_failure(&line) {
                        warn!(target: "llama_server", "[{}] {}", name, line);
                    } else {
                        debug!(target: "llama_server", "[{}] {}", name, line);
                    }
                    if let Some(p) = progress_from_line(&line) {
                        let _ = progress.send(p);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("llama-server {} closed: {}", name, e);
                    break;
                }
            }
        }
    })
}

/// Map a server log line to a loading-progress estimate.
pub fn progress_from_line(line: &str) -> Option<f32> {
    let line = line.to_ascii_lowercase();
    if line.contains("server is listening") {
        Some(1.0)
    } else if line.contains("model loaded") {
        Some(0.9)
    } else if line.contains("warming up") {
        Some(0.8)
    } else if line.contains("llama_context") || line.contains("kv_self") || line.contains("kv cache") {
        Some(0.7)
    } else if line.contains("offload") && line.contains("layers to gpu") {
        Some(0.5)
    } else if line.contains("load_tensors") || line.contains("loading model tensors") {
        Some(0.3)
    } else if line.contains("llama_model_loader") {
        Some(0.1)
    } else {
        None
    }
}

fn looks_like_failure(line: &str) -> bool {
    let line = line.to_ascii_lowercase();
    line.contains("error") || line.contains("failed")
}
