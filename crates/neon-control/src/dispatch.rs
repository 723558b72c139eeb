//! # Action Dispatch
//!
//! Decouples decision making from southbound work. Handlers push actions
//! into a bounded channel with `try_send` and return; a dispatcher thread
//! drains the channel and hands each action to an [`ActionExecutor`].
//!
//! ```text
//!  receive threads ──try_send──▶ [ bounded channel ] ──recv──▶ dispatcher ──▶ executor
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{info, warn};

use crate::action::{ActionSink, CollaboratorError, ControlAction};

/// [`ActionSink`] backed by a bounded crossbeam channel. Never blocks.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<ControlAction>,
}

impl ChannelSink {
    /// Create a sink and the receiving end for a [`Dispatcher`].
    pub fn bounded(capacity: usize) -> (Self, Receiver<ControlAction>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    /// Actions waiting to be executed.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

impl ActionSink for ChannelSink {
    fn submit(&self, action: ControlAction) -> Result<(), CollaboratorError> {
        self.tx.try_send(action).map_err(|e| match e {
            TrySendError::Full(_) => CollaboratorError::Backpressure,
            TrySendError::Disconnected(_) => CollaboratorError::Disconnected,
        })
    }
}

/// Performs the southbound side of an action.
pub trait ActionExecutor: Send + 'static {
    fn execute(&mut self, action: &ControlAction) -> Result<(), CollaboratorError>;
}

/// Executor used until a southbound driver is attached. Logs each action as JSON.
#[derive(Debug, Default)]
pub struct LoggingExecutor {
    executed: u64,
}

impl LoggingExecutor {
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl ActionExecutor for LoggingExecutor {
    fn execute(&mut self, action: &ControlAction) -> Result<(), CollaboratorError> {
        let body = serde_json::to_string(action)
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))?;
        self.executed += 1;
        info!(action = action.name(), body = %body, "control action");
        Ok(())
    }
}

/// Counters kept by the dispatcher thread.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

/// Background thread draining a [`ChannelSink`].
pub struct Dispatcher {
    running: Arc<AtomicBool>,
    stats: Arc<DispatchStats>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn<E: ActionExecutor>(rx: Receiver<ControlAction>, mut executor: E) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(DispatchStats::default());
        let running_clone = running.clone();
        let stats_clone = stats.clone();

        let handle = thread::Builder::new()
            .name("neon-dispatch".into())
            .spawn(move || {
                while running_clone.load(Ordering::Relaxed) {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(action) => run_one(&mut executor, &action, &stats_clone),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Drain whatever was queued before shutdown.
                while let Ok(action) = rx.try_recv() {
                    run_one(&mut executor, &action, &stats_clone);
                }
            })
            .map_err(std::io::Error::other)?;

        Ok(Self {
            running,
            stats,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_one<E: ActionExecutor>(executor: &mut E, action: &ControlAction, stats: &DispatchStats) {
    match executor.execute(action) {
        Ok(()) => {
            stats.executed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(action = action.name(), error = %e, "control action failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neon_common::ids::{DeviceId, LinkKey};
    use std::sync::Mutex;

    struct Collect(Arc<Mutex<Vec<ControlAction>>>);

    impl ActionExecutor for Collect {
        fn execute(&mut self, action: &ControlAction) -> Result<(), CollaboratorError> {
            if matches!(action, ControlAction::HealthCheck { .. }) {
                return Err(CollaboratorError::Rejected("no bfd".into()));
            }
            self.0.lock().unwrap().push(action.clone());
            Ok(())
        }
    }

    fn link(port: u16) -> LinkKey {
        LinkKey::new(DeviceId::new("device:s1"), port)
    }

    #[test]
    fn full_channel_reports_backpressure() {
        let (sink, _rx) = ChannelSink::bounded(1);
        sink.submit(ControlAction::RemoveDetour { link: link(1) }).unwrap();
        assert_eq!(
            sink.submit(ControlAction::RemoveDetour { link: link(2) }),
            Err(CollaboratorError::Backpressure)
        );
        assert_eq!(sink.pending(), 1);
    }

    #[test]
    fn dropped_receiver_reports_disconnected() {
        let (sink, rx) = ChannelSink::bounded(4);
        drop(rx);
        assert_eq!(
            sink.submit(ControlAction::RemoveDetour { link: link(1) }),
            Err(CollaboratorError::Disconnected)
        );
    }

    #[test]
    fn dispatcher_executes_in_order_and_drains_on_shutdown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (sink, rx) = ChannelSink::bounded(16);
        let mut dispatcher = Dispatcher::spawn(rx, Collect(seen.clone())).unwrap();

        sink.submit(ControlAction::NotifyTopology { link: link(1), up: false }).unwrap();
        sink.submit(ControlAction::HealthCheck { link: link(1) }).unwrap();
        sink.submit(ControlAction::NotifyTopology { link: link(1), up: true }).unwrap();
        dispatcher.shutdown();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            ControlAction::NotifyTopology { link: link(1), up: false }
        );
        assert_eq!(dispatcher.stats().executed.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.stats().failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn logging_executor_counts() {
        let mut exec = LoggingExecutor::default();
        exec.execute(&ControlAction::HealthCheck { link: link(3) }).unwrap();
        assert_eq!(exec.executed(), 1);
    }
}
