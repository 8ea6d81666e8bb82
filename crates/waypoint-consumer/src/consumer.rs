use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;
use waypoint_core::{
    observe, CommitRetryConfig, ConsumerConfig, DeadLetterSink, Delivery, FailurePolicy,
    HandlerError, LeaseStore, LeaseToken, Ledger, Message, MessageHandler, Position, Result,
    StreamSource, Subscription, WaypointError,
};

use crate::handle::{ConsumerHandle, ConsumerStats, ShutdownHandle};
use crate::state::ConsumerState;

/// A long-running reader of an ordered log that checkpoints its progress.
///
/// The handler is bound at start, so a started consumer always has one.
/// Starting requires a lease token for the consumer's checkpoint name; the
/// consumer keeps the lease alive while running and releases it on exit.
#[async_trait]
pub trait Consumer: Send + Sized {
    /// Checkpoint name this consumer commits under
    fn name(&self) -> &str;

    /// Initialize the checkpoint, subscribe, and spawn the processing loop.
    ///
    /// Returns once the subscription is open. Initialization and subscribe
    /// failures are returned here rather than surfacing later.
    async fn start(
        self,
        handler: Arc<dyn MessageHandler>,
        lease: LeaseToken,
    ) -> Result<ConsumerHandle>;
}

/// Consumer over any [`StreamSource`], checkpointing into a [`Ledger`]
///
/// Messages are handled strictly one at a time in position order. A position
/// is committed only after its handler succeeded (or, under
/// [`FailurePolicy::DeadLetter`], after the message was parked), so a crash
/// at any point redelivers from the last commit.
pub struct CheckpointConsumer<L, S> {
    ledger: Arc<L>,
    source: Arc<S>,
    config: ConsumerConfig,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl<L, S> Clone for CheckpointConsumer<L, S> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            source: self.source.clone(),
            config: self.config.clone(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

impl<L, S> CheckpointConsumer<L, S>
where
    L: Ledger + LeaseStore + 'static,
    S: StreamSource + 'static,
{
    pub fn new(ledger: Arc<L>, source: Arc<S>, config: ConsumerConfig) -> Self {
        Self {
            ledger,
            source,
            config,
            dead_letters: None,
        }
    }

    /// Sink for messages whose handler failed under
    /// [`FailurePolicy::DeadLetter`]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Acquire the commit lease for this consumer's checkpoint name
    pub async fn acquire_lease(&self, holder: Uuid) -> Result<LeaseToken> {
        self.ledger
            .acquire(&self.config.name, holder, self.config.lease_ttl())
            .await
    }

    /// Acquire a lease under a fresh holder id and start
    pub async fn start_exclusive(
        self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle> {
        let lease = self.acquire_lease(Uuid::new_v4()).await?;
        self.start(handler, lease).await
    }

    /// Messages between the stored checkpoint and the head of the log
    pub async fn lag(&self) -> Result<u64> {
        let head = match self.source.head_position().await? {
            Some(head) => head,
            None => return Ok(0),
        };
        let committed = self
            .ledger
            .read(&self.config.name)
            .await?
            .unwrap_or(Position::START);
        Ok(head.as_u64().saturating_sub(committed.as_u64()))
    }

    fn check_startable(&self, lease: &LeaseToken) -> Result<()> {
        self.config.validate()?;
        if self.config.failure_policy == FailurePolicy::DeadLetter && self.dead_letters.is_none() {
            return Err(WaypointError::Config(format!(
                "consumer '{}' uses the dead-letter policy but has no dead-letter sink",
                self.config.name
            )));
        }
        if lease.name != self.config.name {
            return Err(WaypointError::Lease(format!(
                "lease for '{}' cannot start consumer '{}'",
                lease.name, self.config.name
            )));
        }
        Ok(())
    }

    /// Give up a start attempt: fault and hand the lease back
    async fn abandon(&self, state: &watch::Sender<ConsumerState>, lease: &LeaseToken) {
        transition(state, &self.config.name, ConsumerState::Faulted);
        if let Err(e) = self.ledger.release(lease).await {
            tracing::warn!(
                "Consumer '{}' failed to release lease: {}",
                self.config.name,
                e
            );
        }
    }
}

#[async_trait]
impl<L, S> Consumer for CheckpointConsumer<L, S>
where
    L: Ledger + LeaseStore + 'static,
    S: StreamSource + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(
        self,
        handler: Arc<dyn MessageHandler>,
        lease: LeaseToken,
    ) -> Result<ConsumerHandle> {
        self.check_startable(&lease)?;
        let name = self.config.name.clone();

        if !self.ledger.verify(&lease).await? {
            return Err(WaypointError::Lease(format!(
                "lease for '{}' is not held by {}",
                name, lease.holder
            )));
        }

        let (state_tx, state_rx) = watch::channel(ConsumerState::Uninitialized);

        transition(&state_tx, &name, ConsumerState::Initializing);
        let start = match self.ledger.init(&name).await {
            Ok(position) => position,
            Err(e) => {
                tracing::error!("Consumer '{}' failed to initialize checkpoint: {}", name, e);
                self.abandon(&state_tx, &lease).await;
                return Err(e);
            }
        };

        transition(&state_tx, &name, ConsumerState::Subscribing);
        let subscription = match self.source.subscribe(start).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Consumer '{}' failed to subscribe after {}: {}", name, start, e);
                self.abandon(&state_tx, &lease).await;
                return Err(e);
            }
        };

        tracing::info!("Consumer '{}' subscribed after position {}", name, start);
        transition(&state_tx, &name, ConsumerState::CatchingUp);

        let (committed_tx, committed_rx) = watch::channel(start);
        let (lost_tx, lost_rx) = watch::channel(None);
        let stats = Arc::new(Mutex::new(ConsumerStats {
            last_committed: start,
            ..ConsumerStats::default()
        }));
        let shutdown = ShutdownHandle::new();

        let keeper = spawn_lease_keeper(
            self.ledger.clone(),
            lease.clone(),
            self.config.lease_ttl(),
            lost_tx,
        );

        let run = RunLoop {
            name: name.clone(),
            ledger: self.ledger,
            handler,
            policy: self.config.failure_policy,
            commit_retry: self.config.commit_retry,
            dead_letters: self.dead_letters,
            lease,
            lease_lost: lost_rx,
            committed: start,
            last_seen: start,
            held_at: None,
            caught_up: false,
            stats: stats.clone(),
            state: state_tx,
            committed_tx,
        };
        let task = tokio::spawn(run.run(subscription, shutdown.clone(), keeper));

        Ok(ConsumerHandle::new(
            name,
            shutdown,
            state_rx,
            committed_rx,
            stats,
            task,
        ))
    }
}

fn transition(tx: &watch::Sender<ConsumerState>, name: &str, state: ConsumerState) {
    let previous = tx.send_replace(state);
    if previous != state {
        tracing::debug!("Consumer '{}': {} -> {}", name, previous, state);
    }
}

/// Renew the lease every third of its TTL until aborted.
///
/// A failed renewal is published on `lost` and ends the task.
fn spawn_lease_keeper<L: LeaseStore + 'static>(
    ledger: Arc<L>,
    lease: LeaseToken,
    ttl: Duration,
    lost: watch::Sender<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let every = ttl / 3;
        let mut token = lease;
        loop {
            tokio::time::sleep(every).await;
            match ledger.renew(&token, ttl).await {
                Ok(renewed) => {
                    tracing::trace!(
                        "Renewed lease for '{}' until {}",
                        renewed.name,
                        renewed.expires_at
                    );
                    token = renewed;
                }
                Err(e) => {
                    tracing::error!("Failed to renew lease for '{}': {}", token.name, e);
                    lost.send_replace(Some(e.to_string()));
                    return;
                }
            }
        }
    })
}

enum Event {
    Shutdown,
    /// Carries whether the lease keeper is gone
    LeaseLost(bool),
    Delivery(Result<Option<Delivery>>),
}

/// State owned by the spawned processing loop
struct RunLoop<L> {
    name: String,
    ledger: Arc<L>,
    handler: Arc<dyn MessageHandler>,
    policy: FailurePolicy,
    commit_retry: CommitRetryConfig,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    lease: LeaseToken,
    lease_lost: watch::Receiver<Option<String>>,
    /// Last position durably committed
    committed: Position,
    /// Highest position handed to the handler; anything at or below is a duplicate
    last_seen: Position,
    /// Checkpoint pinned by a handler failure; no commits past it this run
    held_at: Option<Position>,
    caught_up: bool,
    stats: Arc<Mutex<ConsumerStats>>,
    state: watch::Sender<ConsumerState>,
    committed_tx: watch::Sender<Position>,
}

impl<L> RunLoop<L>
where
    L: Ledger + LeaseStore + 'static,
{
    async fn run(
        mut self,
        mut subscription: Box<dyn Subscription>,
        shutdown: ShutdownHandle,
        keeper: JoinHandle<()>,
    ) -> Result<ConsumerStats> {
        let result = self.drive(subscription.as_mut(), &shutdown).await;

        drop(subscription);
        keeper.abort();
        if let Err(e) = self.ledger.release(&self.lease).await {
            tracing::warn!("Consumer '{}' failed to release lease: {}", self.name, e);
        }

        match result {
            Ok(()) => {
                transition(&self.state, &self.name, ConsumerState::Stopped);
                tracing::info!(
                    "Consumer '{}' stopped with checkpoint at {}",
                    self.name,
                    self.committed
                );
                Ok(self.stats.lock().clone())
            }
            Err(e) => {
                transition(&self.state, &self.name, ConsumerState::Faulted);
                tracing::error!(
                    "Consumer '{}' faulted with checkpoint at {}: {}",
                    self.name,
                    self.committed,
                    e
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        subscription: &mut dyn Subscription,
        shutdown: &ShutdownHandle,
    ) -> Result<()> {
        loop {
            if shutdown.is_shutdown() {
                break;
            }

            // Handling happens outside the select, so shutdown never
            // interrupts a message between handle and commit
            let event = tokio::select! {
                biased;
                _ = shutdown.wait() => Event::Shutdown,
                changed = self.lease_lost.changed() => Event::LeaseLost(changed.is_err()),
                delivery = subscription.next() => Event::Delivery(delivery),
            };

            match event {
                Event::Shutdown => break,
                Event::LeaseLost(keeper_gone) => {
                    self.ensure_lease()?;
                    if keeper_gone {
                        return Err(WaypointError::Lease(format!(
                            "lease keeper for '{}' exited",
                            self.name
                        )));
                    }
                }
                Event::Delivery(delivery) => match delivery? {
                    Some(Delivery::Message(message)) => self.deliver(message).await?,
                    Some(Delivery::CaughtUp) => self.on_caught_up(subscription.last_position()),
                    None => {
                        tracing::info!("Consumer '{}': stream source closed", self.name);
                        break;
                    }
                },
            }
        }

        transition(&self.state, &self.name, ConsumerState::Stopping);
        Ok(())
    }

    fn ensure_lease(&self) -> Result<()> {
        match self.lease_lost.borrow().as_ref() {
            Some(reason) => Err(WaypointError::Lease(format!(
                "lease for '{}' lost: {}",
                self.name, reason
            ))),
            None => Ok(()),
        }
    }

    fn on_caught_up(&mut self, position: Position) {
        if self.caught_up {
            tracing::debug!("Consumer '{}' ignoring repeated caught-up signal", self.name);
            return;
        }
        self.caught_up = true;
        self.stats.lock().caught_up = true;
        observe::record_caught_up(&self.name);
        tracing::info!("Consumer '{}' caught up at {}, now live", self.name, position);
        transition(&self.state, &self.name, ConsumerState::Live);
    }

    async fn deliver(&mut self, message: Message) -> Result<()> {
        let position = message.position;
        if position <= self.last_seen {
            self.stats.lock().duplicates_skipped += 1;
            tracing::debug!(
                "Consumer '{}' skipping duplicate delivery at {} (already past {})",
                self.name,
                position,
                self.last_seen
            );
            return Ok(());
        }
        self.last_seen = position;
        self.stats.lock().delivered += 1;

        match self.invoke(&message).await {
            Ok(()) => {
                self.stats.lock().handled += 1;
                self.advance(position).await
            }
            Err(error) => self.on_failure(&message, error).await,
        }
    }

    /// Run the handler, retrying per the failure policy
    async fn invoke(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = self.handler.handle(message).await;
            observe::record_handler(&self.name, started.elapsed(), result.is_ok());

            let error = match result {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            match self.policy.retry_delay(attempt) {
                Some(delay) => {
                    tracing::debug!(
                        "Consumer '{}' retrying message at {} in {:?} (attempt {}): {}",
                        self.name,
                        message.position,
                        delay,
                        attempt + 1,
                        error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }

    async fn on_failure(&mut self, message: &Message, error: HandlerError) -> Result<()> {
        let position = message.position;
        match self.policy.clone() {
            FailurePolicy::Stop => {
                tracing::error!(
                    "Consumer '{}' stopping on handler failure at {}: {}",
                    self.name,
                    position,
                    error
                );
                Err(WaypointError::Handler {
                    position,
                    source: error,
                })
            }
            FailurePolicy::DeadLetter => {
                let sink = self.dead_letters.clone().ok_or_else(|| {
                    WaypointError::Config(format!(
                        "consumer '{}' has no dead-letter sink",
                        self.name
                    ))
                })?;
                let id = sink
                    .record(&self.name, message, &error)
                    .await
                    .map_err(|e| {
                        WaypointError::DeadLetter(format!(
                            "failed to park message at {}: {}",
                            position, e
                        ))
                    })?;
                tracing::warn!(
                    "Consumer '{}' dead-lettered message at {} as #{}: {}",
                    self.name,
                    position,
                    id,
                    error
                );
                self.stats.lock().dead_lettered += 1;
                observe::record_dead_letter(&self.name);
                self.advance(position).await
            }
            FailurePolicy::LogAndContinue | FailurePolicy::Retry { .. } => {
                let mut stats = self.stats.lock();
                stats.failed += 1;
                match self.held_at {
                    Some(held) => tracing::warn!(
                        "Consumer '{}' failed to handle message at {} (checkpoint held at {}): {}",
                        self.name,
                        position,
                        held,
                        error
                    ),
                    None => {
                        self.held_at = Some(self.committed);
                        stats.held_at = Some(self.committed);
                        tracing::warn!(
                            "Consumer '{}' failed to handle message at {}: {}; checkpoint held at {} until restart",
                            self.name,
                            position,
                            error,
                            self.committed
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Commit `position` unless a failure has pinned the checkpoint
    async fn advance(&mut self, position: Position) -> Result<()> {
        if let Some(held) = self.held_at {
            tracing::trace!(
                "Consumer '{}' handled {} with checkpoint held at {}",
                self.name,
                position,
                held
            );
            return Ok(());
        }
        self.commit(position).await
    }

    /// Check the lease against the store, not just the keeper's last renewal.
    ///
    /// Another holder may have taken the name since then.
    async fn fence(&self) -> Result<()> {
        self.ensure_lease()?;
        if !self.ledger.verify(&self.lease).await? {
            return Err(WaypointError::Lease(format!(
                "lease for '{}' is no longer held by {}",
                self.name, self.lease.holder
            )));
        }
        Ok(())
    }

    /// Commit with bounded retry; exhausting the retries is fatal
    async fn commit(&mut self, position: Position) -> Result<()> {
        self.fence().await?;

        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match self.ledger.commit(&self.name, position).await {
                Ok(()) => {
                    observe::record_commit(&self.name, started.elapsed(), true);
                    observe::set_checkpoint(&self.name, position.as_u64());
                    self.committed = position;
                    self.committed_tx.send_replace(position);
                    {
                        let mut stats = self.stats.lock();
                        stats.commits += 1;
                        stats.last_committed = position;
                    }
                    tracing::trace!("Consumer '{}' committed {}", self.name, position);
                    return Ok(());
                }
                Err(e) => {
                    observe::record_commit(&self.name, started.elapsed(), false);
                    attempt += 1;
                    if attempt >= self.commit_retry.max_attempts {
                        tracing::error!(
                            "Consumer '{}' giving up on commit of {} after {} attempts: {}",
                            self.name,
                            position,
                            attempt,
                            e
                        );
                        return Err(WaypointError::Commit {
                            name: self.name.clone(),
                            position,
                            reason: e.to_string(),
                        });
                    }
                    let delay = self.commit_retry.delay(attempt - 1);
                    tracing::warn!(
                        "Consumer '{}' commit of {} failed (attempt {}), retrying in {:?}: {}",
                        self.name,
                        position,
                        attempt,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use waypoint_core::handler_fn;
    use waypoint_memory::{MemoryDeadLetters, MemoryLedger, MemoryStreamStore};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_commit_retry(max_attempts: u32) -> CommitRetryConfig {
        CommitRetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    /// Handler that records positions and fails on the given ones
    fn recording(
        seen: Arc<Mutex<Vec<u64>>>,
        fail_on: &'static [u64],
    ) -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(move |message: Message| {
            let seen = seen.clone();
            async move {
                let position = message.position.as_u64();
                seen.lock().push(position);
                if fail_on.contains(&position) {
                    return Err(HandlerError::rejected(format!("bad message {}", position)));
                }
                Ok(())
            }
        }))
    }

    fn setup(
        config: ConsumerConfig,
    ) -> (
        MemoryLedger,
        MemoryStreamStore,
        CheckpointConsumer<MemoryLedger, MemoryStreamStore>,
    ) {
        let ledger = MemoryLedger::new();
        let store = MemoryStreamStore::default();
        let consumer =
            CheckpointConsumer::new(Arc::new(ledger.clone()), Arc::new(store.clone()), config);
        (ledger, store, consumer)
    }

    fn append(store: &MemoryStreamStore, count: usize) {
        for i in 0..count {
            store
                .append("orders-1", "OrderPlaced", format!("{{\"n\":{}}}", i))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_catches_up_then_tails_live() {
        let (ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        append(&store, 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();

        let state = tokio::time::timeout(WAIT, handle.wait_for_state(ConsumerState::Live))
            .await
            .unwrap();
        assert_eq!(state, ConsumerState::Live);
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(3)))
            .await
            .unwrap()
            .unwrap();

        append(&store, 1);
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(4)))
            .await
            .unwrap()
            .unwrap();

        let stats = handle.stop().await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
        assert_eq!(stats.commits, 4);
        assert!(stats.caught_up);
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::new(4)));
    }

    #[tokio::test]
    async fn test_resumes_strictly_after_checkpoint() {
        let (ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        append(&store, 5);
        ledger.reset("orders", Position::new(2)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(5)))
            .await
            .unwrap()
            .unwrap();
        handle.stop().await.unwrap();

        assert_eq!(*seen.lock(), vec![3, 4, 5]);
        assert_eq!(
            ledger.commit_history("orders"),
            vec![Position::new(3), Position::new(4), Position::new(5)]
        );
    }

    #[tokio::test]
    async fn test_log_and_continue_holds_checkpoint() {
        let (ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        append(&store, 4);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .clone()
            .start_exclusive(recording(seen.clone(), &[2]))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_state(ConsumerState::Live))
            .await
            .unwrap();
        let stats = handle.stop().await.unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.held_at, Some(Position::new(1)));
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::new(1)));

        // Restart redelivers the failed message and everything after it
        seen.lock().clear();
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(4)))
            .await
            .unwrap()
            .unwrap();
        handle.stop().await.unwrap();
        assert_eq!(*seen.lock(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stop_policy_faults_without_commit() {
        let (ledger, store, consumer) =
            setup(ConsumerConfig::new("orders").with_failure_policy(FailurePolicy::Stop));
        append(&store, 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[2]))
            .await
            .unwrap();
        let err = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, WaypointError::Handler { position, .. } if position == Position::new(2)));
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::new(1)));
    }

    #[tokio::test]
    async fn test_dead_letter_policy_commits_past_failure() {
        let (ledger, store, consumer) =
            setup(ConsumerConfig::new("orders").with_failure_policy(FailurePolicy::DeadLetter));
        let dead_letters = MemoryDeadLetters::new();
        let consumer = consumer.with_dead_letters(Arc::new(dead_letters.clone()));
        append(&store, 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[2]))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(3)))
            .await
            .unwrap()
            .unwrap();
        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.held_at, None);
        let parked = dead_letters.snapshot();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].position, Position::new(2));
        assert_eq!(parked[0].checkpoint, "orders");
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::new(3)));
    }

    #[tokio::test]
    async fn test_dead_letter_policy_requires_sink() {
        let (_ledger, _store, consumer) =
            setup(ConsumerConfig::new("orders").with_failure_policy(FailurePolicy::DeadLetter));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let err = consumer
            .start_exclusive(recording(seen, &[]))
            .await
            .err()
            .expect("start without a dead-letter sink");
        assert!(matches!(err, WaypointError::Config(_)));
    }

    #[tokio::test]
    async fn test_retry_policy_recovers_from_flaky_handler() {
        let policy = FailurePolicy::Retry {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        };
        let (ledger, store, consumer) =
            setup(ConsumerConfig::new("orders").with_failure_policy(policy));
        append(&store, 2);

        let attempts = Arc::new(Mutex::new(0u32));
        let handler = {
            let attempts = attempts.clone();
            Arc::new(handler_fn(move |message: Message| {
                let attempts = attempts.clone();
                async move {
                    if message.position == Position::new(1) {
                        let mut attempts = attempts.lock();
                        *attempts += 1;
                        if *attempts < 3 {
                            return Err(HandlerError::rejected("not yet"));
                        }
                    }
                    Ok(())
                }
            }))
        };

        let handle = consumer.start_exclusive(handler).await.unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(2)))
            .await
            .unwrap()
            .unwrap();
        let stats = handle.stop().await.unwrap();

        assert_eq!(*attempts.lock(), 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::new(2)));
    }

    #[tokio::test]
    async fn test_commit_retry_absorbs_transient_failure() {
        let (ledger, store, consumer) =
            setup(ConsumerConfig::new("orders").with_commit_retry(fast_commit_retry(3)));
        append(&store, 2);
        ledger.fail_commits(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(2)))
            .await
            .unwrap()
            .unwrap();
        handle.stop().await.unwrap();

        // Each message handled once; the retry repeats only the commit
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_commit_failure_faults_consumer() {
        let (ledger, store, consumer) =
            setup(ConsumerConfig::new("orders").with_commit_retry(fast_commit_retry(2)));
        append(&store, 2);
        ledger.fail_commits(10);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();
        let mut states = handle.watch_state();
        let err = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, WaypointError::Commit { position, .. } if position == Position::new(1)));
        assert_eq!(*states.borrow_and_update(), ConsumerState::Faulted);
        // The next message is never handled once a commit is lost
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::START));
    }

    #[tokio::test]
    async fn test_init_failure_fails_start() {
        let (ledger, _store, consumer) = setup(ConsumerConfig::new("orders"));
        ledger.fail_init(true);
        let lease = consumer.acquire_lease(Uuid::new_v4()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let err = consumer
            .clone()
            .start(recording(seen, &[]), lease.clone())
            .await
            .err()
            .expect("start with failing init");
        assert!(matches!(err, WaypointError::Ledger(_)));
        // The lease is handed back so a retry can start
        assert!(!ledger.verify(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_rejects_foreign_or_stale_lease() {
        let (ledger, _store, consumer) = setup(ConsumerConfig::new("orders"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let other = ledger
            .acquire("billing", Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();
        let err = consumer
            .clone()
            .start(recording(seen.clone(), &[]), other)
            .await
            .err()
            .expect("start with another name's lease");
        assert!(matches!(err, WaypointError::Lease(_)));

        let lease = consumer.acquire_lease(Uuid::new_v4()).await.unwrap();
        ledger.release(&lease).await.unwrap();
        let err = consumer
            .start(recording(seen, &[]), lease)
            .await
            .err()
            .expect("start with a released lease");
        assert!(matches!(err, WaypointError::Lease(_)));
    }

    #[tokio::test]
    async fn test_second_consumer_cannot_take_lease() {
        let (ledger, _store, consumer) = setup(ConsumerConfig::new("orders"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .clone()
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();

        let err = consumer
            .clone()
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .err()
            .expect("second start while the lease is held");
        assert!(matches!(err, WaypointError::LeaseHeld { .. }));

        // Stopping releases the lease
        handle.stop().await.unwrap();
        let lease = consumer.acquire_lease(Uuid::new_v4()).await.unwrap();
        assert!(ledger.verify(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_renewed_while_running() {
        let (ledger, _store, consumer) = setup(
            ConsumerConfig::new("orders").with_lease_ttl(Duration::from_millis(90)),
        );
        let lease = consumer.acquire_lease(Uuid::new_v4()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start(recording(seen, &[]), lease.clone())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(ledger.verify(&lease).await.unwrap());
        assert_eq!(handle.state(), ConsumerState::Live);
        handle.stop().await.unwrap();
        assert!(!ledger.verify(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_lease_faults_consumer() {
        let (ledger, _store, consumer) = setup(
            ConsumerConfig::new("orders").with_lease_ttl(Duration::from_millis(60)),
        );
        let lease = consumer.acquire_lease(Uuid::new_v4()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start(recording(seen, &[]), lease.clone())
            .await
            .unwrap();

        // Someone else takes over the name
        ledger.release(&lease).await.unwrap();
        ledger
            .acquire("orders", Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();

        let err = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WaypointError::Lease(_)));
    }

    #[tokio::test]
    async fn test_commit_refused_after_takeover_before_renewal() {
        // Default TTL: the keeper will not notice the takeover for seconds
        let (ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        let lease = consumer.acquire_lease(Uuid::new_v4()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start(recording(seen.clone(), &[]), lease.clone())
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_state(ConsumerState::Live))
            .await
            .unwrap();

        ledger.release(&lease).await.unwrap();
        let successor = ledger
            .acquire("orders", Uuid::new_v4(), Duration::from_secs(30))
            .await
            .unwrap();
        append(&store, 3);

        let err = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WaypointError::Lease(_)));
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::START));
        assert!(ledger.commit_history("orders").is_empty());
        // The stale holder's exit leaves the successor's lease alone
        assert!(ledger.verify(&successor).await.unwrap());
    }

    #[tokio::test]
    async fn test_source_close_stops_consumer() {
        let (_ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        append(&store, 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(2)))
            .await
            .unwrap()
            .unwrap();

        store.close();
        let stats = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.commits, 2);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_message_commit() {
        let (ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        append(&store, 3);

        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let release = Arc::new(tokio::sync::Notify::new());
        let handler = {
            let release = release.clone();
            Arc::new(handler_fn(move |message: Message| {
                let entered_tx = entered_tx.clone();
                let release = release.clone();
                async move {
                    let _ = entered_tx.send(message.position);
                    if message.position == Position::new(1) {
                        release.notified().await;
                    }
                    Ok(())
                }
            }))
        };

        let handle = consumer.start_exclusive(handler).await.unwrap();
        assert_eq!(entered_rx.recv().await, Some(Position::new(1)));

        let shutdown = handle.shutdown_handle();
        shutdown.shutdown();
        release.notify_one();

        let stats = tokio::time::timeout(WAIT, handle.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.commits, 1);
        assert_eq!(ledger.read("orders").await.unwrap(), Some(Position::new(1)));
    }

    /// Subscription replaying a fixed script, then closing
    struct Scripted {
        deliveries: VecDeque<Delivery>,
        last: Position,
    }

    #[async_trait]
    impl Subscription for Scripted {
        async fn next(&mut self) -> Result<Option<Delivery>> {
            let delivery = self.deliveries.pop_front();
            if let Some(Delivery::Message(m)) = &delivery {
                self.last = m.position;
            }
            Ok(delivery)
        }

        fn last_position(&self) -> Position {
            self.last
        }
    }

    struct ScriptedSource {
        script: Mutex<Option<Vec<Delivery>>>,
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        async fn subscribe(&self, from_exclusive: Position) -> Result<Box<dyn Subscription>> {
            let deliveries = self.script.lock().take().unwrap_or_default();
            Ok(Box::new(Scripted {
                deliveries: deliveries.into(),
                last: from_exclusive,
            }))
        }

        async fn head_position(&self) -> Result<Option<Position>> {
            Ok(None)
        }
    }

    fn message_at(position: u64) -> Delivery {
        Delivery::Message(Message::new(
            Uuid::new_v4(),
            "orders-1",
            position,
            Position::new(position),
            chrono::Utc::now(),
            "OrderPlaced",
            b"{}".to_vec(),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_and_repeated_caught_up_are_ignored() {
        let script = vec![
            message_at(1),
            message_at(2),
            message_at(2),
            Delivery::CaughtUp,
            message_at(1),
            Delivery::CaughtUp,
            message_at(3),
        ];
        let ledger = MemoryLedger::new();
        let source = ScriptedSource {
            script: Mutex::new(Some(script)),
        };
        let consumer = CheckpointConsumer::new(
            Arc::new(ledger.clone()),
            Arc::new(source),
            ConsumerConfig::new("orders"),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = consumer
            .start_exclusive(recording(seen.clone(), &[]))
            .await
            .unwrap();
        let stats = tokio::time::timeout(WAIT, handle.join())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(stats.duplicates_skipped, 2);
        assert!(stats.caught_up);
        assert_eq!(
            ledger.commit_history("orders"),
            vec![Position::new(1), Position::new(2), Position::new(3)]
        );
    }

    #[tokio::test]
    async fn test_lag_counts_uncommitted_messages() {
        let (ledger, store, consumer) = setup(ConsumerConfig::new("orders"));
        assert_eq!(consumer.lag().await.unwrap(), 0);
        append(&store, 5);
        ledger.reset("orders", Position::new(3)).await.unwrap();
        assert_eq!(consumer.lag().await.unwrap(), 2);
    }
}
