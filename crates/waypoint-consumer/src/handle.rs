use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use waypoint_core::{Position, Result, WaypointError};

use crate::state::ConsumerState;

/// Counters for one consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages handed to the handler (duplicates excluded)
    pub delivered: u64,
    /// Handler invocations that eventually succeeded
    pub handled: u64,
    /// Handler failures that survived the failure policy
    pub failed: u64,
    pub dead_lettered: u64,
    /// Deliveries skipped because their position was already committed
    pub duplicates_skipped: u64,
    pub commits: u64,
    pub last_committed: Position,
    /// Set once a handler failure pins the checkpoint for the rest of the run
    pub held_at: Option<Position>,
    pub caught_up: bool,
}

/// Signals the consumer loop to stop after the in-flight message
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub(crate) fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a loop that is not parked yet still wakes
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        while !self.is_shutdown() {
            self.notify.notified().await;
        }
    }
}

/// Handle to a started consumer.
///
/// Dropping the handle signals shutdown but does not wait for it; call
/// [`ConsumerHandle::stop`] to stop and observe the outcome.
pub struct ConsumerHandle {
    name: String,
    shutdown: ShutdownHandle,
    state: watch::Receiver<ConsumerState>,
    committed: watch::Receiver<Position>,
    stats: Arc<Mutex<ConsumerStats>>,
    task: Option<JoinHandle<Result<ConsumerStats>>>,
}

impl ConsumerHandle {
    pub(crate) fn new(
        name: String,
        shutdown: ShutdownHandle,
        state: watch::Receiver<ConsumerState>,
        committed: watch::Receiver<Position>,
        stats: Arc<Mutex<ConsumerStats>>,
        task: JoinHandle<Result<ConsumerStats>>,
    ) -> Self {
        Self {
            name,
            shutdown,
            state,
            committed,
            stats,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Last position committed during this run
    pub fn committed(&self) -> Position {
        *self.committed.borrow()
    }

    /// Snapshot of the run counters
    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Wait until the consumer reaches `target` or a terminal state, returning
    /// the state it ended up in
    pub async fn wait_for_state(&self, target: ConsumerState) -> ConsumerState {
        let mut rx = self.state.clone();
        let reached = rx
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|state| *state);
        match reached {
            Ok(state) => state,
            // Sender gone: the loop has exited, report whatever it left behind
            Err(_) => *rx.borrow(),
        }
    }

    /// Wait until `position` (or a later one) is committed.
    ///
    /// Fails if the consumer reaches a terminal state first.
    pub async fn wait_for_commit(&self, position: Position) -> Result<()> {
        let mut committed = self.committed.clone();
        let mut state = self.state.clone();
        loop {
            if *committed.borrow_and_update() >= position {
                return Ok(());
            }
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return Err(WaypointError::InvalidState(format!(
                    "consumer '{}' is {} before committing {}",
                    self.name, current, position
                )));
            }
            tokio::select! {
                changed = committed.changed() => {
                    if changed.is_err() {
                        return Err(WaypointError::InvalidState(format!(
                            "consumer '{}' exited before committing {}",
                            self.name, position
                        )));
                    }
                }
                _ = state.changed() => {}
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// The in-flight message, if any, is handled and committed first.
    pub async fn stop(mut self) -> Result<ConsumerStats> {
        self.shutdown.shutdown();
        self.join_inner().await
    }

    /// Wait for the loop to exit on its own (source closed or fault)
    pub async fn join(mut self) -> Result<ConsumerStats> {
        self.join_inner().await
    }

    async fn join_inner(&mut self) -> Result<ConsumerStats> {
        let task = self.task.take().ok_or_else(|| {
            WaypointError::InvalidState(format!("consumer '{}' already joined", self.name))
        })?;
        match task.await {
            Ok(result) => result,
            Err(e) => Err(WaypointError::InvalidState(format!(
                "consumer '{}' task failed: {}",
                self.name, e
            ))),
        }
    }
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("committed", &self.committed())
            .finish_non_exhaustive()
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("Consumer '{}' handle dropped, signalling shutdown", self.name);
            self.shutdown.shutdown();
        }
    }
}
