//! Store - Interface to persisted resource state
//!
//! The executor reads and writes persisted records only through a
//! `StateStore`. Implementations must serialize writes and make each
//! recorded change durable before returning.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::resource::{ResourceId, State};

/// Error raised by a state store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State store error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("State store error: {0}")]
    Message(String),
}

/// A change to persisted state
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    /// Insert or replace a record
    Put(State),
    /// Remove a record after its object was deleted
    Remove(ResourceId),
    /// Forget the deposed object of a record after it was deleted
    ClearDeposed { id: ResourceId, identifier: String },
}

impl StateChange {
    pub fn id(&self) -> &ResourceId {
        match self {
            StateChange::Put(state) => &state.id,
            StateChange::Remove(id) | StateChange::ClearDeposed { id, .. } => id,
        }
    }

    /// Apply this change to an in-memory map of records
    pub fn apply_to(self, records: &mut HashMap<ResourceId, State>) {
        match self {
            StateChange::Put(state) => {
                records.insert(state.id.clone(), state);
            }
            StateChange::Remove(id) => {
                records.remove(&id);
            }
            StateChange::ClearDeposed { id, identifier } => {
                // A newer replacement may have deposed a different object
                if let Some(state) = records.get_mut(&id)
                    && state.deposed.as_deref() == Some(identifier.as_str())
                {
                    state.deposed = None;
                }
            }
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// All persisted records
    async fn snapshot(&self) -> Result<HashMap<ResourceId, State>, StoreError>;

    /// Persist one change
    async fn record(&self, change: StateChange) -> Result<(), StoreError>;

    /// A single persisted record
    async fn get(&self, id: &ResourceId) -> Result<Option<State>, StoreError> {
        Ok(self.snapshot().await?.remove(id))
    }
}

/// Store kept only in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ResourceId, State>>,
    history: Mutex<Vec<StateChange>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = State>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|s| (s.id.clone(), s)).collect()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every change recorded so far, in order
    pub async fn history(&self) -> Vec<StateChange> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn snapshot(&self) -> Result<HashMap<ResourceId, State>, StoreError> {
        Ok(self.records.lock().await.clone())
    }

    async fn record(&self, change: StateChange) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        self.history.lock().await.push(change.clone());
        change.apply_to(&mut records);
        Ok(())
    }
}
