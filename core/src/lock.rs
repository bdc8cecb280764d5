//! Thin wrapper around the Store's CAS primitives. The Lock Manager never
//! blocks: a failed acquire just means "someone else has it, move on,"
//! which is how the Supervisor treats every resource it can't grab this
//! tick as not-yet-due rather than an error.

use orchestrator_store::Store;
use orchestrator_types::{Millis, ResourceId, ResourceKind, common::now_ms};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct LockManager {
    store: std::sync::Arc<dyn Store>,
    /// Identifies this process as a lock holder; distinct per process so a
    /// crashed worker's locks are never silently stolen by guessing an id.
    holder: String,
}

/// An acquired work lock, released automatically on drop via a best-effort
/// spawn if the caller forgets to call `release` explicitly.
pub struct Guard {
    store: std::sync::Arc<dyn Store>,
    kind: ResourceKind,
    id: ResourceId,
    holder: String,
    released: bool,
}

impl Guard {
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        Ok(self
            .store
            .release_lock(self.kind, &self.id, &self.holder, false)
            .await?)
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let kind = self.kind;
        let id = self.id.clone();
        let holder = self.holder.clone();
        tokio::spawn(async move {
            if let Err(e) = store.release_lock(kind, &id, &holder, false).await {
                tracing::warn!(%e, %id, %kind, "failed to release work lock on drop");
            }
        });
    }
}

impl LockManager {
    pub fn new(store: std::sync::Arc<dyn Store>) -> Self {
        LockManager {
            store,
            holder: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_holder(store: std::sync::Arc<dyn Store>, holder: impl Into<String>) -> Self {
        LockManager {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Attempts to acquire the work lock, returning `None` if another
    /// holder already has it rather than an error — racing for a resource
    /// is the expected steady state, not a fault.
    pub async fn try_lock(&self, kind: ResourceKind, id: &ResourceId) -> Result<Option<Guard>> {
        let now: Millis = now_ms();
        let acquired = self.store.acquire_lock(kind, id, &self.holder, now).await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Guard {
            store: self.store.clone(),
            kind,
            id: id.clone(),
            holder: self.holder.clone(),
            released: false,
        }))
    }

    /// Admission-side lock: fails loudly (`Error::Locked`) instead of
    /// returning `None`, since an admitted request has no fallback tick to
    /// retry on.
    pub async fn lock_or_fail(&self, kind: ResourceKind, id: &ResourceId) -> Result<Guard> {
        self.try_lock(kind, id).await?.ok_or(Error::Locked)
    }

    /// Acquire with no guard: the lock stays held after this call returns
    /// and must be cleared with [`force_unlock`](Self::force_unlock). Used
    /// when an operation intentionally spans multiple admission calls,
    /// e.g. holding installations still between the two halves of a
    /// cluster-installation migration.
    pub async fn lock_unguarded(&self, kind: ResourceKind, id: &ResourceId) -> Result<bool> {
        Ok(self
            .store
            .acquire_lock(kind, id, &self.holder, now_ms())
            .await?)
    }

    pub async fn force_unlock(&self, kind: ResourceKind, id: &ResourceId) -> Result<()> {
        self.store.release_lock(kind, id, &self.holder, true).await?;
        Ok(())
    }

    pub async fn set_api_lock(&self, kind: ResourceKind, id: &ResourceId, locked: bool) -> Result<()> {
        self.store.set_api_lock(kind, id, locked).await?;
        Ok(())
    }

    pub async fn set_deletion_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        locked: bool,
    ) -> Result<()> {
        self.store.set_deletion_lock(kind, id, locked).await?;
        Ok(())
    }
}
