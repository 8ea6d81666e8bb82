use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use waypoint_core::{
    error::{HandlerError, Result},
    traits::DeadLetterSink,
    types::{DeadLetter, Message},
};

#[derive(Default)]
struct Letters {
    next_id: i64,
    letters: Vec<DeadLetter>,
}

/// In-memory dead-letter sink
#[derive(Clone, Default)]
pub struct MemoryDeadLetters {
    inner: Arc<Mutex<Letters>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot in insertion order
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.inner.lock().letters.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(
        &self,
        checkpoint: &str,
        message: &Message,
        error: &HandlerError,
    ) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.letters.push(DeadLetter {
            id,
            checkpoint: checkpoint.to_string(),
            position: message.position,
            message_id: message.message_id,
            stream_id: message.stream_id.clone(),
            message_type: message.message_type.clone(),
            payload: message.payload().to_vec(),
            error_message: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self
            .inner
            .lock()
            .letters
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.lock().letters.len())
    }

    async fn remove(&self, id: i64) -> Result<()> {
        self.inner.lock().letters.retain(|d| d.id != id);
        Ok(())
    }
}
