//! In-process caches shared by request handlers.
//!
//! The access cache memoizes worker -> project permissions per access kind and is
//! the only path through which access rows are mutated: every write runs against
//! the store and then drops the worker's cached entries before returning, so a
//! revoked grant can never be served from a stale entry.

use crate::types::{AccessKind, ProjectId, WorkerAccess, WorkerId};
use anyhow::Result;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// Authoritative access storage the cache reads through and writes through.
pub trait AccessStore: Send + Sync {
    /// Evaluate an access flag (including project visibility) from storage.
    fn allows(&self, kind: AccessKind, worker_id: WorkerId, project_id: ProjectId) -> Result<bool>;

    /// Insert a pending request. False if a row already exists.
    fn request(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        can_assign: bool,
        can_submit: bool,
    ) -> Result<bool>;

    /// Clear the pending flag. False if nothing was pending.
    fn accept(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool>;

    /// Delete the row (reject or revoke). False if there was none.
    fn remove(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool>;
}

type PermissionMap = HashMap<WorkerId, HashMap<ProjectId, bool>>;

/// Unbounded worker -> project -> bool memo, one map per access kind.
pub struct AccessCache {
    store: Arc<dyn AccessStore>,
    assign: RwLock<PermissionMap>,
    submit: RwLock<PermissionMap>,
    /// Bumped by every invalidation before entries are dropped. A miss only
    /// stores its result if no invalidation happened while it was loading.
    epoch: AtomicU64,
}

impl AccessCache {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self {
            store,
            assign: RwLock::new(HashMap::new()),
            submit: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    fn map(&self, kind: AccessKind) -> &RwLock<PermissionMap> {
        match kind {
            AccessKind::Assign => &self.assign,
            AccessKind::Submit => &self.submit,
        }
    }

    pub fn can_assign(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.check(AccessKind::Assign, worker_id, project_id)
    }

    pub fn can_submit(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.check(AccessKind::Submit, worker_id, project_id)
    }

    /// Cached lookup; a miss loads from the store and populates the entry.
    pub fn check(&self, kind: AccessKind, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        let map = self.map(kind);
        {
            let cached = map.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(&allowed) = cached.get(&worker_id).and_then(|p| p.get(&project_id)) {
                return Ok(allowed);
            }
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let allowed = self.store.allows(kind, worker_id, project_id)?;
        trace!(?kind, worker_id, project_id, allowed, "access cache miss");

        let mut cached = map.write().unwrap_or_else(PoisonError::into_inner);
        // The store may have changed after our read; the answer stands for this
        // call but must not outlive the invalidation.
        if self.epoch.load(Ordering::SeqCst) == epoch {
            cached.entry(worker_id).or_default().insert(project_id, allowed);
        }
        Ok(allowed)
    }

    /// Drop every cached entry of a worker, for both access kinds.
    pub fn invalidate(&self, worker_id: WorkerId) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for map in [&self.assign, &self.submit] {
            map.write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&worker_id);
        }
    }

    /// Drop every cached entry that concerns a project (visibility changes).
    pub fn invalidate_project(&self, project_id: ProjectId) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for map in [&self.assign, &self.submit] {
            let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
            for projects in map.values_mut() {
                projects.remove(&project_id);
            }
        }
    }

    /// Run a store mutation for `worker_id`, then invalidate that worker.
    ///
    /// Invalidation happens on both success and failure; a failed write may
    /// still have reached the store.
    fn mutate<T>(&self, worker_id: WorkerId, write: impl FnOnce(&dyn AccessStore) -> Result<T>) -> Result<T> {
        let result = write(self.store.as_ref());
        self.invalidate(worker_id);
        result
    }

    pub fn request(&self, request: &WorkerAccess) -> Result<bool> {
        self.mutate(request.worker_id, |store| {
            store.request(
                request.worker_id,
                request.project_id,
                request.can_assign,
                request.can_submit,
            )
        })
    }

    pub fn accept(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.mutate(worker_id, |store| store.accept(worker_id, project_id))
    }

    pub fn reject(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.mutate(worker_id, |store| store.remove(worker_id, project_id))
    }
}

/// Read-mostly map of entities loaded on first use and overwritten on update.
pub struct EntityCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for EntityCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Copy, V: Clone> EntityCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached value or load it. Misses that load nothing are not cached.
    pub fn get_or_load(&self, key: K, load: impl FnOnce(K) -> Result<Option<V>>) -> Result<Option<V>> {
        if let Some(value) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Some(value.clone()));
        }

        let loaded = load(key)?;
        if let Some(ref value) = loaded {
            self.put(key, value.clone());
        }
        Ok(loaded)
    }

    /// Overwrite the cached value.
    pub fn put(&self, key: K, value: V) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    pub fn remove(&self, key: K) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
