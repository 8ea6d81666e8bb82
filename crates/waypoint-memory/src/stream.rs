use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;
use waypoint_core::{
    error::{Result, WaypointError},
    traits::{Delivery, StreamSource, Subscription},
    types::{Message, Position},
};

/// Configuration for the in-memory log
#[derive(Debug, Clone)]
pub struct MemoryStreamConfig {
    /// Maximum size of a single message payload (bytes)
    pub max_payload_size: usize,
}

impl Default for MemoryStreamConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 4 * 1024 * 1024, // 4MB single-message limit
        }
    }
}

/// Statistics about the in-memory log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStreamStats {
    pub message_count: usize,
    pub stream_count: usize,
    pub head_position: Option<Position>,
}

#[derive(Default)]
struct LogState {
    /// Sorted by position
    messages: Vec<Message>,
    stream_versions: HashMap<String, u64>,
    closed: bool,
    pending_disconnects: u32,
    pending_refusals: u32,
}

impl LogState {
    fn head(&self) -> Option<Position> {
        self.messages.last().map(|m| m.position)
    }
}

struct Inner {
    config: MemoryStreamConfig,
    state: Mutex<LogState>,
    /// Fired after every append and on close
    appended: Notify,
}

/// Globally ordered, append-only log held in memory
///
/// Positions start at 1 so that [`Position::START`] means "before the first
/// message". Clones share the same log.
#[derive(Clone)]
pub struct MemoryStreamStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new(MemoryStreamConfig::default())
    }
}

impl MemoryStreamStore {
    pub fn new(config: MemoryStreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
            }),
        }
    }

    /// Append at the next position (head + 1)
    pub fn append(
        &self,
        stream_id: &str,
        message_type: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Message> {
        self.append_inner(None, stream_id, message_type, payload.into())
    }

    /// Append at an explicit position, which must be beyond the head
    pub fn append_at(
        &self,
        position: Position,
        stream_id: &str,
        message_type: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Message> {
        self.append_inner(Some(position), stream_id, message_type, payload.into())
    }

    /// Append a JSON-encoded payload at the next position
    pub fn append_json<T: Serialize>(
        &self,
        stream_id: &str,
        message_type: &str,
        payload: &T,
    ) -> Result<Message> {
        let bytes = serde_json::to_vec(payload)?;
        self.append(stream_id, message_type, bytes)
    }

    fn append_inner(
        &self,
        position: Option<Position>,
        stream_id: &str,
        message_type: &str,
        payload: Vec<u8>,
    ) -> Result<Message> {
        if payload.len() > self.inner.config.max_payload_size {
            return Err(WaypointError::InvalidState(format!(
                "Payload size {} exceeds max_payload_size {}",
                payload.len(),
                self.inner.config.max_payload_size
            )));
        }

        let message = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(WaypointError::InvalidState("log is closed".into()));
            }

            let head = state.head().unwrap_or(Position::START);
            let position = match position {
                Some(p) if p <= head => {
                    return Err(WaypointError::InvalidState(format!(
                        "Position {} is not beyond head {}",
                        p, head
                    )));
                }
                Some(p) => p,
                None => head.checked_next().ok_or_else(|| {
                    WaypointError::InvalidState(format!("no position left after {}", head))
                })?,
            };

            let version = state
                .stream_versions
                .entry(stream_id.to_string())
                .or_insert(0);
            let stream_version = *version;
            *version += 1;

            let message = Message::new(
                Uuid::new_v4(),
                stream_id,
                stream_version,
                position,
                Utc::now(),
                message_type,
                payload,
            );
            state.messages.push(message.clone());
            message
        };

        self.inner.appended.notify_waiters();
        tracing::trace!(
            "Appended {} to {} at {}",
            message.message_type,
            message.stream_id,
            message.position
        );
        Ok(message)
    }

    /// Make the next `count` subscription reads fail with a transient error
    pub fn disconnect_next(&self, count: u32) {
        self.inner.state.lock().pending_disconnects += count;
        self.inner.appended.notify_waiters();
    }

    /// Make the next `count` subscribe calls fail with a transient error
    pub fn refuse_next_subscriptions(&self, count: u32) {
        self.inner.state.lock().pending_refusals += count;
    }

    /// End every open subscription and reject further appends
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.appended.notify_waiters();
    }

    /// Snapshot of every message, in position order
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().messages.clone()
    }

    pub fn stats(&self) -> MemoryStreamStats {
        let state = self.inner.state.lock();
        MemoryStreamStats {
            message_count: state.messages.len(),
            stream_count: state.stream_versions.len(),
            head_position: state.head(),
        }
    }
}

#[async_trait]
impl StreamSource for MemoryStreamStore {
    async fn subscribe(&self, from_exclusive: Position) -> Result<Box<dyn Subscription>> {
        let catch_up_target = {
            let mut state = self.inner.state.lock();
            if state.pending_refusals > 0 {
                state.pending_refusals -= 1;
                return Err(WaypointError::Transport("subscription refused".into()));
            }
            state.head()
        };

        tracing::debug!(
            "Subscribed from {} (catch-up target {:?})",
            from_exclusive,
            catch_up_target
        );

        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            cursor: from_exclusive,
            catch_up_target: catch_up_target.unwrap_or(Position::START),
            caught_up: false,
        }))
    }

    async fn head_position(&self) -> Result<Option<Position>> {
        Ok(self.inner.state.lock().head())
    }
}

/// Subscription over a [`MemoryStreamStore`]
pub struct MemorySubscription {
    inner: Arc<Inner>,
    cursor: Position,
    /// Head at subscribe time; everything up to it is catch-up
    catch_up_target: Position,
    caught_up: bool,
}

enum Poll {
    Ready(Delivery),
    Closed,
    Pending,
}

impl MemorySubscription {
    /// Only mutates `self` when returning a delivery, so an abandoned wait
    /// loses nothing.
    fn poll_ready(&mut self) -> Result<Poll> {
        let mut state = self.inner.state.lock();

        if state.pending_disconnects > 0 {
            state.pending_disconnects -= 1;
            return Err(WaypointError::Transport("connection to log lost".into()));
        }
        if state.closed {
            return Ok(Poll::Closed);
        }

        let cursor = self.cursor;
        let idx = state.messages.partition_point(|m| m.position <= cursor);
        let next = state.messages.get(idx);

        if !self.caught_up && next.map_or(true, |m| m.position > self.catch_up_target) {
            self.caught_up = true;
            return Ok(Poll::Ready(Delivery::CaughtUp));
        }

        match next {
            Some(message) => {
                self.cursor = message.position;
                Ok(Poll::Ready(Delivery::Message(message.clone())))
            }
            None => Ok(Poll::Pending),
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            // Register interest before checking so an append between the
            // check and the await is not missed.
            let inner = self.inner.clone();
            let notified = inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll_ready()? {
                Poll::Ready(delivery) => return Ok(Some(delivery)),
                Poll::Closed => return Ok(None),
                Poll::Pending => notified.await,
            }
        }
    }

    fn last_position(&self) -> Position {
        self.cursor
    }
}
