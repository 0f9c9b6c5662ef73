//! Supervisor for one local llama-server.
//!
//! [`LocalServer`] owns the lifecycle: it resolves the launch config, runs the
//! prechecks, spawns the process, waits for readiness, watches for crashes,
//! relaunches within the retry budget and stops the process on request.
//!
//! Every launch gets a generation number. The process slot, the watchdog and
//! the prober all carry it, and a component may only act on the process whose
//! generation it was started for. A stale watchdog or prober from an earlier
//! launch therefore cannot touch a newer process.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ChatMessage, LlamaCppClient};
use crate::config::SupervisorOptions;
use crate::error::LocalAIError;
use crate::model_config::{resolve, ServerConfig};
use crate::precheck::run_prechecks;
use crate::process::{launch, locate_server_binary, ServerProcess};
use crate::readiness::{ProcessLiveness, ReadinessProber};
use crate::recovery::{CrashRecovery, RecoveryDecision};
use crate::settings::ServerSettings;
use crate::state::{ServerState, StateCell};
use crate::system_info::HostFacts;
use crate::watchdog::{spawn_watchdog, ProcessCheck, Supervised};

/// Handle to a supervised llama-server.
///
/// Cheap to clone; all clones control the same server. When the last handle
/// is dropped a still-running child is killed.
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<Inner>,
}

struct Inner {
    options: SupervisorOptions,
    state: StateCell,
    settings: StdMutex<ServerSettings>,
    recovery: StdMutex<CrashRecovery>,
    /// The live process, if any, tagged with its launch generation.
    slot: Mutex<Option<Slot>>,
    lifecycle: StdMutex<Lifecycle>,
    /// Held for the whole load pipeline. Callers try it, relaunches wait on it.
    load_lock: Mutex<()>,
    next_generation: AtomicU64,
    active: StdMutex<Option<Active>>,
    relaunches: mpsc::UnboundedSender<Relaunch>,
}

struct Slot {
    generation: u64,
    process: ServerProcess,
}

/// Bookkeeping for the launch currently in progress or running.
#[derive(Default)]
struct Lifecycle {
    /// Bumped by `stop` and by every caller-initiated load. A relaunch or
    /// load that captured an older epoch has been superseded.
    epoch: u64,
    current: Option<Attempt>,
}

struct Attempt {
    generation: u64,
    cancel: watch::Sender<bool>,
    watchdog: Option<JoinHandle<()>>,
}

struct Active {
    config: ServerConfig,
    client: LlamaCppClient,
}

#[derive(Debug)]
struct Relaunch {
    model_path: PathBuf,
    delay: Duration,
    epoch: u64,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalServer {
    /// Create a supervisor, loading persisted settings if configured.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: SupervisorOptions) -> Self {
        let settings = options
            .settings_path
            .as_deref()
            .map(ServerSettings::load)
            .unwrap_or_default();
        Self::with_settings(options, settings)
    }

    /// Create a supervisor with explicit settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_settings(options: SupervisorOptions, settings: ServerSettings) -> Self {
        let (relaunches, relaunch_rx) = mpsc::unbounded_channel();
        let recovery = CrashRecovery::new(options.max_retries, options.retry_backoff);
        let inner = Arc::new(Inner {
            options,
            state: StateCell::new(),
            settings: StdMutex::new(settings),
            recovery: StdMutex::new(recovery),
            slot: Mutex::new(None),
            lifecycle: StdMutex::new(Lifecycle::default()),
            load_lock: Mutex::new(()),
            next_generation: AtomicU64::new(1),
            active: StdMutex::new(None),
            relaunches,
        });
        tokio::spawn(recovery_worker(Arc::downgrade(&inner), relaunch_rx));
        Self { inner }
    }

    /// Check that a server binary can be found and the data directory exists.
    pub async fn initialize(&self) -> Result<(), LocalAIError> {
        let binary = locate_server_binary(self.inner.options.server_binary.as_deref())?;
        if let Some(parent) = self
            .inner
            .options
            .settings_path
            .as_deref()
            .and_then(Path::parent)
        {
            std::fs::create_dir_all(parent)?;
        }
        info!("Local server backend initialized ({})", binary.display());
        Ok(())
    }

    /// Load `model_path`, replacing any running server.
    ///
    /// Resolves when the server is ready or the attempt has failed. A second
    /// call while one is in flight fails with [`LocalAIError::StartInProgress`].
    pub async fn load_model(&self, model_path: impl AsRef<Path>) -> Result<ServerConfig, LocalAIError> {
        let model_path = model_path.as_ref();
        let _guard = self
            .inner
            .load_lock
            .try_lock()
            .map_err(|_| LocalAIError::StartInProgress)?;

        let epoch = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            lifecycle.epoch += 1;
            lifecycle.epoch
        };
        lock(&self.inner.recovery).begin_explicit_load(model_path);

        self.inner.run_load(model_path, epoch).await
    }

    /// Stop the server. Calling this when nothing runs is a no-op.
    ///
    /// Cancels an in-flight load and any pending relaunch, stops the watchdog,
    /// then shuts the process down with the escalating signal sequence.
    pub async fn stop(&self) {
        self.inner.teardown(true).await;
        self.inner.state.transition(ServerState::Stopped);
    }

    /// Models reported by the running server.
    pub async fn list_models(&self) -> Result<Vec<String>, LocalAIError> {
        self.ready_client()?.list_models().await
    }

    /// Stream a chat completion through the running server.
    ///
    /// See [`LlamaCppClient::stream_chat`]. Fails with
    /// [`LocalAIError::NotReady`] unless the state is `Ready`.
    pub async fn stream_chat<F>(
        &self,
        messages: &[ChatMessage],
        on_partial: F,
    ) -> Result<String, LocalAIError>
    where
        F: FnMut(&str) + Send,
    {
        self.ready_client()?.stream_chat(messages, on_partial).await
    }

    /// Non-streaming completion through the running server.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LocalAIError> {
        self.ready_client()?.complete(messages).await
    }

    pub fn state(&self) -> ServerState {
        self.inner.state.get()
    }

    /// Receiver that always holds the latest state.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Receiver for every state transition from now on.
    pub fn events(&self) -> broadcast::Receiver<ServerState> {
        self.inner.state.events()
    }

    /// Loading progress while a model loads.
    pub fn loading_progress(&self) -> Option<f32> {
        self.inner.state.get().progress()
    }

    /// Reason of the most recent error state.
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.last_error()
    }

    /// Config of the current or most recent launch.
    pub fn active_config(&self) -> Option<ServerConfig> {
        lock(&self.inner.active).as_ref().map(|a| a.config.clone())
    }

    /// Base URL of the current or most recent launch.
    pub fn base_url(&self) -> Option<String> {
        lock(&self.inner.active)
            .as_ref()
            .map(|a| a.client.base_url().to_string())
    }

    /// PID of the live process.
    pub async fn pid(&self) -> Option<u32> {
        self.inner.slot.lock().await.as_ref().map(|s| s.process.pid())
    }

    pub fn settings(&self) -> ServerSettings {
        lock(&self.inner.settings).clone()
    }

    /// Model of the last successful load, as persisted.
    pub fn last_model_path(&self) -> Option<PathBuf> {
        lock(&self.inner.settings).last_model_path.clone()
    }

    /// Crashes since the last `Ready` or caller-initiated load.
    pub fn crash_count(&self) -> u32 {
        lock(&self.inner.recovery).crash_count()
    }

    fn ready_client(&self) -> Result<LlamaCppClient, LocalAIError> {
        let state = self.inner.state.get();
        if !state.is_ready() {
            return Err(LocalAIError::NotReady(state.to_string()));
        }
        lock(&self.inner.active)
            .as_ref()
            .map(|a| a.client.clone())
            .ok_or_else(|| LocalAIError::NotReady(state.to_string()))
    }
}

impl Inner {
    /// The full pipeline: resolve, precheck, launch, watch, probe.
    async fn run_load(
        self: &Arc<Self>,
        model_path: &Path,
        epoch: u64,
    ) -> Result<ServerConfig, LocalAIError> {
        if self.teardown(false).await {
            self.state.transition(ServerState::Stopped);
        }
        let (generation, mut cancel) = self.begin_attempt(epoch)?;

        let host = self
            .options
            .host_facts
            .clone()
            .unwrap_or_else(HostFacts::detect);
        let mut config = resolve(model_path, &host);
        lock(&self.settings).apply(&mut config);
        debug!("Resolved launch config: {:?}", config);

        if let Err(e) = run_prechecks(&config, &host) {
            return Err(self.fail(generation, e));
        }
        let binary = match locate_server_binary(self.options.server_binary.as_deref()) {
            Ok(binary) => binary,
            Err(e) => return Err(self.fail(generation, e)),
        };
        if !self.enter_starting(generation) {
            return Err(LocalAIError::Cancelled);
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let process = match launch(&binary, &config, progress_tx) {
            Ok(process) => process,
            Err(e) => return Err(self.fail(generation, e)),
        };

        let client = LlamaCppClient::with_url(config.base_url());
        {
            let mut slot = self.slot.lock().await;
            if !self.is_current(generation) {
                drop(slot);
                process.shutdown(self.options.shutdown_grace).await;
                return Err(LocalAIError::Cancelled);
            }
            *slot = Some(Slot {
                generation,
                process,
            });
            *lock(&self.active) = Some(Active {
                config: config.clone(),
                client: client.clone(),
            });
            self.state
                .transition(ServerState::LoadingModel { progress: 0.0 });
        }

        self.forward_progress(generation, progress_rx);
        self.attach_watchdog(generation, cancel.clone());

        let prober = ReadinessProber::new(client)
            .with_poll_interval(self.options.poll_interval)
            .with_timeout(self.options.startup_timeout)
            .with_canary_policy(self.options.canary_policy);
        let liveness = SlotLiveness {
            inner: self,
            generation,
        };

        match prober.await_ready(&liveness, &mut cancel).await {
            Ok(()) => self.mark_ready(generation, config).await,
            Err(LocalAIError::ProcessTerminatedUnexpectedly(status)) => {
                self.handle_exit(generation, status.clone()).await;
                Err(LocalAIError::ProcessTerminatedUnexpectedly(status))
            }
            Err(LocalAIError::Cancelled) => Err(LocalAIError::Cancelled),
            Err(e) => match self.claim(generation).await {
                Some(process) => {
                    process.shutdown(self.options.shutdown_grace).await;
                    Err(self.fail(generation, e))
                }
                // The watchdog got there first and is handling a crash.
                None => Err(e),
            },
        }
    }

    /// Register a new launch, unless superseded.
    fn begin_attempt(&self, epoch: u64) -> Result<(u64, watch::Receiver<bool>), LocalAIError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.epoch != epoch {
            debug!("Load superseded before it started");
            return Err(LocalAIError::Cancelled);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (cancel, cancel_rx) = watch::channel(false);
        lifecycle.current = Some(Attempt {
            generation,
            cancel,
            watchdog: None,
        });
        Ok((generation, cancel_rx))
    }

    /// Prechecks passed; publish `Starting` if the attempt is still current.
    fn enter_starting(&self, generation: u64) -> bool {
        let lifecycle = lock(&self.lifecycle);
        let current = lifecycle
            .current
            .as_ref()
            .map_or(false, |a| a.generation == generation);
        if current {
            self.state.transition(ServerState::Starting);
        }
        current
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.lifecycle)
            .current
            .as_ref()
            .map_or(false, |a| a.generation == generation)
    }

    /// Enter `Error` for a failed attempt that is still current.
    fn fail(&self, generation: u64, error: LocalAIError) -> LocalAIError {
        let lifecycle = lock(&self.lifecycle);
        let current = lifecycle
            .current
            .as_ref()
            .map_or(false, |a| a.generation == generation);
        if current {
            self.state.transition(ServerState::Error {
                reason: error.to_string(),
            });
        }
        error
    }

    async fn mark_ready(
        &self,
        generation: u64,
        config: ServerConfig,
    ) -> Result<ServerConfig, LocalAIError> {
        {
            let mut slot = self.slot.lock().await;
            let exit = match slot.as_mut() {
                Some(s) if s.generation == generation => s.process.try_exit_status(),
                _ => {
                    return Err(LocalAIError::ProcessTerminatedUnexpectedly(
                        "process was released before it became ready".to_string(),
                    ))
                }
            };
            if let Some(status) = exit {
                drop(slot);
                self.handle_exit(generation, status.to_string()).await;
                return Err(LocalAIError::ProcessTerminatedUnexpectedly(status.to_string()));
            }
            if !self.is_current(generation) {
                return Err(LocalAIError::Cancelled);
            }
            self.state.transition(ServerState::Ready);
        }

        lock(&self.recovery).on_ready();
        let settings = {
            let mut settings = lock(&self.settings);
            settings.last_model_path = Some(config.model_path.clone());
            settings.clone()
        };
        if let Some(path) = &self.options.settings_path {
            if let Err(e) = settings.save(path) {
                warn!("Failed to persist server settings: {}", e);
            }
        }

        info!(
            "llama-server ready at {} with {}",
            config.base_url(),
            config.model_path.display()
        );
        Ok(config)
    }

    /// Cancel the current launch and stop its process.
    ///
    /// With `supersede`, pending relaunches and in-flight loads are abandoned
    /// too. Returns whether a process was stopped.
    async fn teardown(&self, supersede: bool) -> bool {
        let attempt = {
            let mut lifecycle = lock(&self.lifecycle);
            if supersede {
                lifecycle.epoch += 1;
            }
            let attempt = lifecycle.current.take();
            if let Some(attempt) = &attempt {
                attempt.cancel.send_replace(true);
            }
            attempt
        };

        if let Some(watchdog) = attempt.and_then(|a| a.watchdog) {
            if let Err(e) = watchdog.await {
                warn!("Watchdog task failed: {}", e);
            }
        }

        let process = self.slot.lock().await.take();
        match process {
            Some(slot) => {
                slot.process.shutdown(self.options.shutdown_grace).await;
                true
            }
            None => false,
        }
    }

    /// Take the process of `generation` out of the slot.
    async fn claim(&self, generation: u64) -> Option<ServerProcess> {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some(s) if s.generation == generation => slot.take().map(|s| s.process),
            _ => None,
        }
    }

    /// The process of `generation` died on its own.
    ///
    /// Whoever sees the exit first (watchdog or prober) gets here; only the
    /// first caller finds the process in the slot. Returns whether this call
    /// handled the crash.
    async fn handle_exit(&self, generation: u64, status: String) -> bool {
        let (process, decision, epoch) = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(s) if s.generation == generation => {}
                _ => return false,
            }
            let epoch = {
                let lifecycle = lock(&self.lifecycle);
                let current = lifecycle
                    .current
                    .as_ref()
                    .map_or(false, |a| a.generation == generation);
                if !current {
                    // A stop is tearing this launch down.
                    return false;
                }
                lifecycle.epoch
            };
            let process = slot.take().map(|s| s.process);
            self.state.transition(ServerState::Crashed);
            let decision = lock(&self.recovery).on_crash();
            (process, decision, epoch)
        };

        if let Some(process) = process {
            warn!(
                "llama-server (PID: {}) died after {:.1}s: {}",
                process.pid(),
                process.uptime().as_secs_f32(),
                status
            );
        }

        match decision {
            RecoveryDecision::Relaunch { model_path, delay } => {
                let request = Relaunch {
                    model_path,
                    delay,
                    epoch,
                };
                if self.relaunches.send(request).is_err() {
                    warn!("Recovery worker is gone; not relaunching");
                }
            }
            RecoveryDecision::GiveUp { reason } => {
                let lifecycle = lock(&self.lifecycle);
                if lifecycle.epoch == epoch {
                    self.state.transition(ServerState::Error { reason });
                }
            }
        }
        true
    }

    /// Run a queued relaunch unless a stop or a newer load superseded it.
    async fn relaunch(self: &Arc<Self>, request: Relaunch) {
        let _guard = self.load_lock.lock().await;
        if lock(&self.lifecycle).epoch != request.epoch {
            debug!("Relaunch of {} superseded", request.model_path.display());
            return;
        }
        match self.run_load(&request.model_path, request.epoch).await {
            Ok(_) => info!("Recovered {}", request.model_path.display()),
            Err(e) => warn!("Relaunch of {} failed: {}", request.model_path.display(), e),
        }
    }

    fn forward_progress(self: &Arc<Self>, generation: u64, mut progress: mpsc::UnboundedReceiver<f32>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(value) = progress.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.is_current(generation) {
                    inner.state.advance_progress(value);
                }
            }
        });
    }

    fn attach_watchdog(self: &Arc<Self>, generation: u64, cancel: watch::Receiver<bool>) {
        let handle = spawn_watchdog(
            Arc::downgrade(self),
            generation,
            self.options.watchdog_interval,
            self.options.owner_pid,
            cancel,
        );
        let mut lifecycle = lock(&self.lifecycle);
        match lifecycle.current.as_mut() {
            Some(attempt) if attempt.generation == generation => attempt.watchdog = Some(handle),
            // Already cancelled; the watchdog sees that and exits.
            _ => {}
        }
    }
}

#[async_trait]
impl Supervised for Inner {
    async fn check_process(&self, generation: u64) -> ProcessCheck {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(s) if s.generation == generation => match s.process.try_exit_status() {
                Some(status) => ProcessCheck::Exited(status.to_string()),
                None => ProcessCheck::Running,
            },
            _ => ProcessCheck::Released,
        }
    }

    async fn process_exited(&self, generation: u64, status: String) {
        self.handle_exit(generation, status).await;
    }

    async fn owner_gone(&self, generation: u64) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.epoch += 1;
            if lifecycle
                .current
                .as_ref()
                .map_or(false, |a| a.generation == generation)
            {
                lifecycle.current = None;
            }
        }
        if let Some(process) = self.claim(generation).await {
            process.kill_now().await;
            self.state.transition(ServerState::Stopped);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get_mut().take() {
            warn!(
                "Supervisor dropped while llama-server (PID: {}) was running, killing it",
                slot.process.pid()
            );
        }
    }
}

/// Liveness of one launch as seen through the slot.
struct SlotLiveness<'a> {
    inner: &'a Inner,
    generation: u64,
}

#[async_trait]
impl ProcessLiveness for SlotLiveness<'_> {
    async fn exit_status(&self) -> Option<String> {
        let mut slot = self.inner.slot.lock().await;
        match slot.as_mut() {
            Some(s) if s.generation == self.generation => {
                s.process.try_exit_status().map(|status| status.to_string())
            }
            _ => Some("process is no longer supervised".to_string()),
        }
    }
}

/// Runs queued relaunches one at a time, after their backoff.
async fn recovery_worker(inner: Weak<Inner>, mut requests: mpsc::UnboundedReceiver<Relaunch>) {
    while let Some(request) = requests.recv().await {
        tokio::time::sleep(request.delay).await;
        let Some(inner) = inner.upgrade() else { break };
        inner.relaunch(request).await;
    }
}
