//! Observable lifecycle state of the supervised server.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

/// Lifecycle of one supervised llama-server.
///
/// ```text
/// stopped → starting → loading_model(p) → ready → stopped
///              │             │              │
///              └─────────────┴──────────────┴──→ crashed ──→ starting (retry)
///                                                   └──────→ error (retries exhausted)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    /// Best-effort progress estimate in `0.0..=1.0`, parsed from server output.
    LoadingModel { progress: f32 },
    /// The readiness probe succeeded against a live process.
    Ready,
    Crashed,
    Error { reason: String },
}

impl ServerState {
    /// Whether a process is expected to exist in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::LoadingModel { .. } | ServerState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ServerState::Ready)
    }

    /// Loading progress, if the model is currently loading.
    pub fn progress(&self) -> Option<f32> {
        match self {
            ServerState::LoadingModel { progress } => Some(*progress),
            _ => None,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Starting => write!(f, "starting"),
            ServerState::LoadingModel { progress } => {
                write!(f, "loading model ({:.0}%)", progress * 100.0)
            }
            ServerState::Ready => write!(f, "ready"),
            ServerState::Crashed => write!(f, "crashed"),
            ServerState::Error { reason } => write!(f, "error: {}", reason),
        }
    }
}

/// Capacity of the transition log channel.
const EVENT_CAPACITY: usize = 64;

/// Single owner of the [`ServerState`] value.
///
/// Every write goes through [`StateCell::transition`] or
/// [`StateCell::advance_progress`]. Readers either poll the current value via
/// a `watch` receiver or follow every transition on a `broadcast` receiver.
pub struct StateCell {
    current: watch::Sender<ServerState>,
    events: broadcast::Sender<ServerState>,
    last_error: Mutex<Option<String>>,
}

impl StateCell {
    pub fn new() -> Self {
        let (current, _) = watch::channel(ServerState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current,
            events,
            last_error: Mutex::new(None),
        }
    }

    /// The current state.
    pub fn get(&self) -> ServerState {
        self.current.borrow().clone()
    }

    /// Receiver that always holds the latest state.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.current.subscribe()
    }

    /// Receiver for every transition from now on, in order.
    pub fn events(&self) -> broadcast::Receiver<ServerState> {
        self.events.subscribe()
    }

    /// The reason of the most recent `Error` state, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    /// Move to `next` and publish it.
    ///
    /// The value and the transition log are updated under the same lock, so
    /// the log order always matches the order of the values.
    pub fn transition(&self, next: ServerState) {
        self.current.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            let previous = std::mem::replace(state, next.clone());
            match &next {
                ServerState::Error { reason } => {
                    error!("Server state: {} -> {}", previous, next);
                    if let Ok(mut last) = self.last_error.lock() {
                        *last = Some(reason.clone());
                    }
                }
                ServerState::Crashed => error!("Server state: {} -> {}", previous, next),
                _ => info!("Server state: {} -> {}", previous, next),
            }
            // No receivers is fine; the watch channel still holds the value.
            let _ = self.events.send(next.clone());
            true
        });
    }

    /// Raise the loading progress, ignoring stale or smaller values.
    pub fn advance_progress(&self, progress: f32) {
        let progress = progress.clamp(0.0, 1.0);
        self.current.send_if_modified(|state| match state {
            ServerState::LoadingModel { progress: current } if progress > *current => {
                *current = progress;
                debug!("Loading progress: {:.0}%", progress * 100.0);
                let _ = self.events.send(ServerState::LoadingModel { progress });
                true
            }
            _ => false,
        });
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_stopped() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ServerState::Stopped);
        assert!(cell.last_error().is_none());
    }

    #[test]
    fn test_transitions_are_logged_in_order() {
        let cell = StateCell::new();
        let mut events = cell.events();

        cell.transition(ServerState::Starting);
        cell.transition(ServerState::LoadingModel { progress: 0.0 });
        cell.transition(ServerState::Ready);

        assert_eq!(events.try_recv().unwrap(), ServerState::Starting);
        assert_eq!(
            events.try_recv().unwrap(),
            ServerState::LoadingModel { progress: 0.0 }
        );
        assert_eq!(events.try_recv().unwrap(), ServerState::Ready);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let cell = StateCell::new();
        cell.transition(ServerState::LoadingModel { progress: 0.0 });
        let mut events = cell.events();

        cell.advance_progress(0.5);
        cell.advance_progress(0.3);
        cell.advance_progress(0.5);
        cell.advance_progress(0.9);

        assert_eq!(cell.get().progress(), Some(0.9));
        assert_eq!(
            events.try_recv().unwrap(),
            ServerState::LoadingModel { progress: 0.5 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ServerState::LoadingModel { progress: 0.9 }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_progress_ignored_outside_loading() {
        let cell = StateCell::new();
        cell.transition(ServerState::Ready);
        cell.advance_progress(0.7);
        assert_eq!(cell.get(), ServerState::Ready);
    }

    #[test]
    fn test_error_records_last_error() {
        let cell = StateCell::new();
        cell.transition(ServerState::Error {
            reason: "port 8080 in use".into(),
        });
        assert_eq!(cell.last_error().as_deref(), Some("port 8080 in use"));
        cell.transition(ServerState::Stopped);
        assert_eq!(cell.last_error().as_deref(), Some("port 8080 in use"));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ServerState::LoadingModel { progress: 0.5 }.to_string(),
            "loading model (50%)"
        );
        assert!(ServerState::Ready.is_active());
        assert!(!ServerState::Crashed.is_active());
    }
}
