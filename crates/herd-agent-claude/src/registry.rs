//! Instance registry -- single source of truth for instance state.
//!
//! The registry maps instance ids to [`AgentInstance`] records. Mutations
//! on one instance are serialised through a per-instance async mutex; the
//! map itself is only write-locked for the brief moments of insertion and
//! removal, so operations on different instances never block each other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::instance::{AgentInstance, InstanceState};

type Entry = Arc<Mutex<AgentInstance>>;

/// Authoritative mapping from instance id to instance record.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    inner: RwLock<HashMap<Uuid, Entry>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert a new instance.
    ///
    /// Fails with [`RegistryError::DuplicateInstance`] if the id is
    /// already registered.
    pub fn register(&self, instance: AgentInstance) -> Result<(), RegistryError> {
        let id = instance.id;
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&id) {
            return Err(RegistryError::DuplicateInstance(id));
        }
        map.insert(id, Arc::new(Mutex::new(instance)));
        tracing::debug!(instance_id = %id, "registered instance");
        Ok(())
    }

    /// Look up the entry for an instance.
    ///
    /// The returned handle carries the per-instance lock; callers that
    /// mutate the instance (or need a multi-step operation to be atomic
    /// with respect to other callers) must hold that lock for the
    /// duration of the operation.
    pub fn entry(&self, id: Uuid) -> Result<Entry, RegistryError> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&id).cloned().ok_or(RegistryError::NotFound(id))
    }

    /// Acquire the per-instance lock for a multi-step operation.
    pub async fn lock(&self, id: Uuid) -> Result<OwnedMutexGuard<AgentInstance>, RegistryError> {
        Ok(self.entry(id)?.lock_owned().await)
    }

    /// Return a snapshot of one instance.
    pub async fn get(&self, id: Uuid) -> Result<AgentInstance, RegistryError> {
        let entry = self.entry(id)?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    /// Execute a state transition under the per-instance lock.
    pub async fn update_state(
        &self,
        id: Uuid,
        to: InstanceState,
    ) -> Result<InstanceState, RegistryError> {
        let entry = self.entry(id)?;
        let mut guard: MutexGuard<'_, AgentInstance> = entry.lock().await;
        guard.transition(to)?;
        Ok(guard.state)
    }

    /// Remove an instance.
    ///
    /// Only permitted once the instance is in a terminal state; removal
    /// before teardown completes is rejected with
    /// [`RegistryError::NotTerminal`].
    pub async fn remove(&self, id: Uuid) -> Result<AgentInstance, RegistryError> {
        let entry = self.entry(id)?;
        // Terminal states are never left (except stopped, which is also
        // terminal), so the check stays valid after the guard drops.
        {
            let guard = entry.lock().await;
            if !guard.state.is_terminal() {
                return Err(RegistryError::NotTerminal {
                    id,
                    state: guard.state,
                });
            }
        }

        let removed = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            map.remove(&id)
        };

        match removed {
            Some(entry) => {
                let instance = entry.lock().await.clone();
                tracing::debug!(instance_id = %id, "removed instance");
                Ok(instance)
            }
            // Lost a race with a concurrent remove.
            None => Err(RegistryError::NotFound(id)),
        }
    }

    /// Snapshot all instances without blocking per-instance mutations.
    ///
    /// The set of entries is captured under a brief read lock; each
    /// record is then cloned under its own lock in turn, so a slow
    /// operation on one instance delays only that instance's entry.
    pub async fn list(&self) -> Vec<AgentInstance> {
        let entries: Vec<Entry> = {
            let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            instances.push(entry.lock().await.clone());
        }
        instances
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }
}
