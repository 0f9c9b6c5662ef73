//! Escalating shutdown: interrupt, then terminate, then kill.

use std::io;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// How often liveness is re-checked while waiting for an exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Signals in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
    Kill,
}

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Nothing to do, the process had already exited.
    AlreadyExited,
    /// The process exited after the given signal.
    Exited(StopSignal),
    /// The kill signal was sent but the process was still reported alive.
    Unresponsive,
}

/// Something that can be asked to stop.
pub trait Terminable {
    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Deliver `signal` to the process.
    fn send_signal(&mut self, signal: StopSignal) -> io::Result<()>;
}

/// Stop `target`, escalating only when the gentler signal was ignored.
///
/// Each of the interrupt and terminate steps gets a full `grace` window
/// before the next signal. Calling this on an exited target is a no-op.
pub async fn terminate<T: Terminable + ?Sized>(target: &mut T, grace: Duration) -> ShutdownOutcome {
    if !target.is_alive() {
        return ShutdownOutcome::AlreadyExited;
    }

    for signal in [StopSignal::Interrupt, StopSignal::Terminate] {
        if let Err(e) = target.send_signal(signal) {
            warn!("Failed to send {:?}: {}", signal, e);
        }
        if wait_for_exit(target, grace).await {
            debug!("Process exited after {:?}", signal);
            return ShutdownOutcome::Exited(signal);
        }
        debug!("Process ignored {:?}, escalating", signal);
    }

    warn!("Process ignored interrupt and terminate, killing");
    if let Err(e) = target.send_signal(StopSignal::Kill) {
        warn!("Failed to kill process: {}", e);
    }
    if wait_for_exit(target, grace).await {
        ShutdownOutcome::Exited(StopSignal::Kill)
    } else {
        ShutdownOutcome::Unresponsive
    }
}

/// Poll until the target exits or `window` elapses. Returns true on exit.
async fn wait_for_exit<T: Terminable + ?Sized>(target: &mut T, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if !target.is_alive() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(EXIT_POLL_INTERVAL.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    /// Fake process that records signals and obeys only the ones listed.
    struct FakeProcess {
        alive: bool,
        obeys: Vec<StopSignal>,
        received: Vec<(StopSignal, StdInstant)>,
    }

    impl FakeProcess {
        fn obeying(obeys: &[StopSignal]) -> Self {
            Self {
                alive: true,
                obeys: obeys.to_vec(),
                received: Vec::new(),
            }
        }
    }

    impl Terminable for FakeProcess {
        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn send_signal(&mut self, signal: StopSignal) -> io::Result<()> {
            self.received.push((signal, StdInstant::now()));
            if self.obeys.contains(&signal) {
                self.alive = false;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interrupt_is_enough_for_polite_process() {
        let mut process = FakeProcess::obeying(&[StopSignal::Interrupt]);
        let outcome = terminate(&mut process, Duration::from_millis(50)).await;
        assert_eq!(outcome, ShutdownOutcome::Exited(StopSignal::Interrupt));
        assert_eq!(process.received.len(), 1);
    }

    #[tokio::test]
    async fn test_escalates_in_order_with_full_windows() {
        let grace = Duration::from_millis(80);
        let mut process = FakeProcess::obeying(&[StopSignal::Kill]);
        let outcome = terminate(&mut process, grace).await;
        assert_eq!(outcome, ShutdownOutcome::Exited(StopSignal::Kill));

        let signals: Vec<StopSignal> = process.received.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            signals,
            vec![StopSignal::Interrupt, StopSignal::Terminate, StopSignal::Kill]
        );
        // Kill never arrives before both gentler signals had their window.
        let interrupt_at = process.received[0].1;
        let terminate_at = process.received[1].1;
        let kill_at = process.received[2].1;
        assert!(terminate_at.duration_since(interrupt_at) >= grace);
        assert!(kill_at.duration_since(terminate_at) >= grace);
    }

    #[tokio::test]
    async fn test_terminate_stops_escalation() {
        let mut process = FakeProcess::obeying(&[StopSignal::Terminate]);
        let outcome = terminate(&mut process, Duration::from_millis(30)).await;
        assert_eq!(outcome, ShutdownOutcome::Exited(StopSignal::Terminate));
        assert!(process
            .received
            .iter()
            .all(|(s, _)| *s != StopSignal::Kill));
    }

    #[tokio::test]
    async fn test_already_exited_is_noop() {
        let mut process = FakeProcess::obeying(&[]);
        process.alive = false;
        let outcome = terminate(&mut process, Duration::from_millis(30)).await;
        assert_eq!(outcome, ShutdownOutcome::AlreadyExited);
        assert!(process.received.is_empty());
    }

    #[tokio::test]
    async fn test_unresponsive_process_is_reported() {
        let mut process = FakeProcess::obeying(&[]);
        let outcome = terminate(&mut process, Duration::from_millis(20)).await;
        assert_eq!(outcome, ShutdownOutcome::Unresponsive);
        assert_eq!(process.received.len(), 3);
    }
}
