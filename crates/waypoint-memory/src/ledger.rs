use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use waypoint_core::{
    error::{Result, WaypointError},
    traits::{LeaseStore, Ledger},
    types::{LeaseToken, LedgerEntry, Position},
};

#[derive(Default)]
struct LedgerState {
    entries: BTreeMap<String, (Position, DateTime<Utc>)>,
    leases: HashMap<String, LeaseToken>,
    history: Vec<(String, Position)>,
    failing_commits: u32,
    failing_init: bool,
}

/// In-memory checkpoint ledger and lease store
///
/// Clones share state, which lets a test play "restart" by building a fresh
/// consumer over the same ledger.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail
    pub fn fail_commits(&self, count: u32) {
        self.state.lock().failing_commits = count;
    }

    /// Make every `init` fail until cleared
    pub fn fail_init(&self, failing: bool) {
        self.state.lock().failing_init = failing;
    }

    /// Every successful commit for `name`, in order
    pub fn commit_history(&self, name: &str) -> Vec<Position> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, p)| *p)
            .collect()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn init(&self, name: &str) -> Result<Position> {
        let mut state = self.state.lock();
        if state.failing_init {
            return Err(WaypointError::Ledger("ledger unavailable".into()));
        }
        let (position, _) = state
            .entries
            .entry(name.to_string())
            .or_insert_with(|| (Position::START, Utc::now()));
        Ok(*position)
    }

    async fn commit(&self, name: &str, position: Position) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(WaypointError::Ledger("ledger write failed".into()));
        }
        match state.entries.get_mut(name) {
            Some(entry) => *entry = (position, Utc::now()),
            None => {
                return Err(WaypointError::NotFound(format!(
                    "ledger entry '{}' was never initialized",
                    name
                )))
            }
        }
        state.history.push((name.to_string(), position));
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Option<Position>> {
        Ok(self.state.lock().entries.get(name).map(|(p, _)| *p))
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .state
            .lock()
            .entries
            .iter()
            .map(|(name, (position, at))| LedgerEntry {
                name: name.clone(),
                position: *position,
                updated_at: Some(*at),
            })
            .collect())
    }

    async fn reset(&self, name: &str, position: Position) -> Result<()> {
        self.state
            .lock()
            .entries
            .insert(name.to_string(), (position, Utc::now()));
        Ok(())
    }
}

fn ttl_delta(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| WaypointError::Config(e.to_string()))
}

#[async_trait]
impl LeaseStore for MemoryLedger {
    async fn acquire(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<LeaseToken> {
        let delta = ttl_delta(ttl)?;
        let mut state = self.state.lock();
        let now = Utc::now();
        if let Some(current) = state.leases.get(name) {
            if current.holder != holder && !current.is_expired_at(now) {
                return Err(WaypointError::LeaseHeld {
                    name: name.to_string(),
                    holder: current.holder.to_string(),
                });
            }
        }
        let token = LeaseToken {
            name: name.to_string(),
            holder,
            acquired_at: now,
            expires_at: now + delta,
        };
        state.leases.insert(name.to_string(), token.clone());
        Ok(token)
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> Result<LeaseToken> {
        let delta = ttl_delta(ttl)?;
        let mut state = self.state.lock();
        match state.leases.get_mut(&token.name) {
            Some(current) if current.holder == token.holder => {
                current.expires_at = Utc::now() + delta;
                Ok(current.clone())
            }
            _ => Err(WaypointError::Lease(format!(
                "lease for '{}' is no longer held by {}",
                token.name, token.holder
            ))),
        }
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .leases
            .get(&token.name)
            .is_some_and(|current| current.holder == token.holder)
        {
            state.leases.remove(&token.name);
        }
        Ok(())
    }

    async fn verify(&self, token: &LeaseToken) -> Result<bool> {
        let state = self.state.lock();
        Ok(state
            .leases
            .get(&token.name)
            .is_some_and(|current| {
                current.holder == token.holder && !current.is_expired_at(Utc::now())
            }))
    }
}
