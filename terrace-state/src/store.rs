//! BackendStore - the `StateStore` backed by a `StateBackend`
//!
//! Opening a store for a mutating run takes the backend lock and keeps it
//! until `close`; a background task renews it at a third of its lifetime so
//! a long run never loses it. Every recorded change is written through to
//! the backend before `record` returns; writes are serialized behind one
//! mutex.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use terrace_core::resource::{ResourceId, State};
use terrace_core::store::{StateChange, StateStore, StoreError};

use crate::backend::{BackendResult, StateBackend};
use crate::lock::LockInfo;
use crate::state::{ResourceState, StateFile};

pub struct BackendStore {
    backend: Arc<dyn StateBackend>,
    state: Mutex<StateFile>,
    lock: Arc<Mutex<Option<LockInfo>>>,
    heartbeat: Option<JoinHandle<()>>,
    read_only: bool,
}

impl BackendStore {
    /// Initialize the backend, take its lock and load the state
    pub async fn open(backend: Box<dyn StateBackend>, operation: &str) -> BackendResult<Self> {
        let backend: Arc<dyn StateBackend> = Arc::from(backend);
        backend.init().await?;
        let lock = backend.acquire_lock(operation).await?;
        log::debug!("Acquired state lock {} on {}", lock.id, backend.location());

        let state = match backend.read_state().await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                if let Err(release) = backend.release_lock(&lock).await {
                    log::warn!("Failed to release state lock {}: {}", lock.id, release);
                }
                return Err(e);
            }
        };

        let ttl = lock.ttl();
        let lock = Arc::new(Mutex::new(Some(lock)));
        let heartbeat = renew_periodically(backend.clone(), lock.clone(), ttl);

        Ok(Self {
            backend,
            state: Mutex::new(state),
            lock,
            heartbeat,
            read_only: false,
        })
    }

    /// Load the state without locking; recording changes is refused
    pub async fn open_read_only(backend: Box<dyn StateBackend>) -> BackendResult<Self> {
        let state = backend.read_state().await?.unwrap_or_default();
        Ok(Self {
            backend: Arc::from(backend),
            state: Mutex::new(state),
            lock: Arc::new(Mutex::new(None)),
            heartbeat: None,
            read_only: true,
        })
    }

    /// Release the lock, if this store holds one
    pub async fn close(&self) -> BackendResult<()> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
        if let Some(lock) = self.lock.lock().await.take() {
            self.backend.release_lock(&lock).await?;
            log::debug!("Released state lock {}", lock.id);
        }
        Ok(())
    }

    pub async fn lock_info(&self) -> Option<LockInfo> {
        self.lock.lock().await.clone()
    }

    /// Copy of the current state document
    pub async fn state_file(&self) -> StateFile {
        self.state.lock().await.clone()
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }
}

impl Drop for BackendStore {
    fn drop(&mut self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

/// Keep extending the held lock until it is released
fn renew_periodically(
    backend: Arc<dyn StateBackend>,
    lock: Arc<Mutex<Option<LockInfo>>>,
    ttl: chrono::Duration,
) -> Option<JoinHandle<()>> {
    let interval = (ttl / 3).to_std().ok().filter(|i| !i.is_zero())?;
    Some(tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let mut held = lock.lock().await;
            let Some(current) = held.as_ref() else {
                break;
            };
            let renewed = current.extended(ttl);
            match backend.renew_lock(&renewed).await {
                Ok(()) => {
                    log::debug!("Renewed state lock {} until {}", renewed.id, renewed.expires);
                    *held = Some(renewed);
                }
                Err(e) => log::warn!("Failed to renew state lock {}: {}", renewed.id, e),
            }
        }
    }))
}

fn apply_change(state: &mut StateFile, change: StateChange) {
    match change {
        StateChange::Put(record) => state.upsert_resource(ResourceState::from_state(&record)),
        StateChange::Remove(id) => {
            state.remove_resource(&id.resource_type, &id.name);
        }
        StateChange::ClearDeposed { id, identifier } => {
            if let Some(record) = state.find_resource_mut(&id.resource_type, &id.name)
                && record.deposed.as_deref() == Some(identifier.as_str())
            {
                record.deposed = None;
            }
        }
    }
}

#[async_trait]
impl StateStore for BackendStore {
    async fn snapshot(&self) -> Result<HashMap<ResourceId, State>, StoreError> {
        Ok(self.state.lock().await.states())
    }

    async fn record(&self, change: StateChange) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::Message(format!(
                "state at {} was opened read-only",
                self.backend.location()
            )));
        }

        let mut state = self.state.lock().await;
        let mut next = state.clone();
        log::debug!("Recording state change for {}", change.id());
        apply_change(&mut next, change);
        next.increment_serial();
        self.backend
            .write_state(&next)
            .await
            .map_err(|e| StoreError::Backend(Box::new(e)))?;
        *state = next;
        Ok(())
    }
}
