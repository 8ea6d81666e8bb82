use async_trait::async_trait;
use std::sync::Arc;
use waypoint_core::{
    observe, Delivery, Position, ReconnectConfig, Result, StreamSource, Subscription,
};

/// Stream source wrapper that survives transient transport failures.
///
/// When the underlying subscription fails with a transient error it is
/// dropped and reopened from the last delivered position, with exponential
/// backoff between attempts. The consumer sees one uninterrupted
/// subscription: no gaps, no repeats, and a single `CaughtUp`.
pub struct ResubscribingSource<S> {
    inner: Arc<S>,
    config: ReconnectConfig,
}

impl<S: StreamSource + 'static> ResubscribingSource<S> {
    pub fn new(inner: Arc<S>, config: ReconnectConfig) -> Self {
        Self { inner, config }
    }
}

/// Open a subscription, retrying transient refusals
async fn connect<S: StreamSource + ?Sized>(
    source: &S,
    from_exclusive: Position,
    config: &ReconnectConfig,
) -> Result<Box<dyn Subscription>> {
    let mut attempt = 0;
    loop {
        match source.subscribe(from_exclusive).await {
            Ok(subscription) => return Ok(subscription),
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let delay = config.delay(attempt);
                tracing::warn!(
                    "Subscribe after {} failed (attempt {}), retrying in {:?}: {}",
                    from_exclusive,
                    attempt + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl<S: StreamSource + 'static> StreamSource for ResubscribingSource<S> {
    async fn subscribe(&self, from_exclusive: Position) -> Result<Box<dyn Subscription>> {
        let current = connect(self.inner.as_ref(), from_exclusive, &self.config).await?;
        Ok(Box::new(ResubscribingSubscription {
            source: self.inner.clone(),
            config: self.config.clone(),
            current: Some(current),
            last: from_exclusive,
            failures: 0,
            caught_up: false,
        }))
    }

    async fn head_position(&self) -> Result<Option<Position>> {
        self.inner.head_position().await
    }
}

struct ResubscribingSubscription<S> {
    source: Arc<S>,
    config: ReconnectConfig,
    /// `None` between a failure and the next successful reconnect
    current: Option<Box<dyn Subscription>>,
    last: Position,
    /// Consecutive transient failures since the last delivery or caught-up
    failures: u32,
    caught_up: bool,
}

#[async_trait]
impl<S: StreamSource + 'static> Subscription for ResubscribingSubscription<S> {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let subscription = match self.current.as_mut() {
                Some(subscription) => subscription,
                None => {
                    let reopened =
                        connect(self.source.as_ref(), self.last, &self.config).await?;
                    observe::record_reconnect();
                    tracing::info!("Resubscribed after {}", self.last);
                    self.current = Some(reopened);
                    continue;
                }
            };

            match subscription.next().await {
                Ok(Some(Delivery::Message(message))) => {
                    if message.position <= self.last {
                        tracing::debug!(
                            "Dropping replayed message at {} (already delivered {})",
                            message.position,
                            self.last
                        );
                        continue;
                    }
                    self.last = message.position;
                    self.failures = 0;
                    return Ok(Some(Delivery::Message(message)));
                }
                Ok(Some(Delivery::CaughtUp)) => {
                    // A reopened subscription that reached the head is healthy
                    self.failures = 0;
                    if self.caught_up {
                        continue;
                    }
                    self.caught_up = true;
                    return Ok(Some(Delivery::CaughtUp));
                }
                Ok(None) => return Ok(None),
                Err(e) if e.is_transient() => {
                    self.failures += 1;
                    if self.failures >= self.config.max_attempts {
                        tracing::error!(
                            "Giving up on subscription after {} consecutive failures: {}",
                            self.failures,
                            e
                        );
                        return Err(e);
                    }
                    let delay = self.config.delay(self.failures - 1);
                    tracing::warn!(
                        "Subscription failed after {}, resubscribing in {:?}: {}",
                        self.last,
                        delay,
                        e
                    );
                    self.current = None;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn last_position(&self) -> Position {
        self.last
    }
}
