//! RAM-resident repository of individually locked entities with disk spill.
//!
//! The repository owns every resident entity outright; callers only ever
//! hold scoped read or write guards. Each entity can be swapped out to the
//! durable [`BlobTable`](crate::BlobTable) and transparently reloaded on
//! the next access.
//!
//! For every id exactly one of three states holds at any time: resident
//! (in the RAM map, not mid-swap), swapping (removed from the map, bytes
//! in flight to the durable table), or absent. The resident-to-swapping flip
//! happens atomically under the map's write lock; waiters on a mid-swap id
//! park on a notifier that is broadcast when the swap completes.
//!
//! Lock order is always map lock then entity lock; the map lock is never held
//! across an await point.

use crate::table::BlobTable;
use bytes::Bytes;
use holdfast_core::Entity;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Notify, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

/// Identifier of a repository-managed entity; doubles as the durable key.
pub type EntityId = i64;

/// Policy applied when the durable write fails during a swap-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpillFailurePolicy {
    /// Drop the RAM copy anyway; a previous durable row (if any) stays and
    /// later reads may observe stale data or nothing.
    #[default]
    Discard,
    /// Put the entity back into the resident map and report the swap-out
    /// as failed.
    Reinstate,
}

type Cell<E> = Arc<RwLock<E>>;

struct Residents<E> {
    resident: HashMap<EntityId, Cell<E>>,
    swapping: HashSet<EntityId>,
}

/// Scoped shared access to one entity.
///
/// The underlying lock (and the entity behind it) stays alive for as long
/// as the guard does, even if the entity is evicted from the repository in
/// the meantime.
pub struct ReadGuard<E>(OwnedRwLockReadGuard<E>);

impl<E> Deref for ReadGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

/// Scoped exclusive access to one entity.
pub struct WriteGuard<E>(OwnedRwLockWriteGuard<E>);

impl<E> Deref for WriteGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.0
    }
}

impl<E> DerefMut for WriteGuard<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.0
    }
}

/// Thread-safe map of individually locked entities backed by a durable
/// blob table.
///
/// Recoverable failures (transient store errors, decode failures, insert
/// race losses) are logged and surfaced as `None`/`false` return values,
/// never as errors.
pub struct Repository<E: Entity> {
    map: parking_lot::RwLock<Residents<E>>,
    swap_done: Notify,
    table: BlobTable,
    spill_policy: SpillFailurePolicy,
}

impl<E: Entity> Repository<E> {
    /// Open a repository over `table` inside the database at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, table: &str) -> Self {
        Self {
            map: parking_lot::RwLock::new(Residents {
                resident: HashMap::new(),
                swapping: HashSet::new(),
            }),
            swap_done: Notify::new(),
            table: BlobTable::new(path, table),
            spill_policy: SpillFailurePolicy::default(),
        }
    }

    /// Replace the swap-out failure policy.
    #[must_use]
    pub fn with_spill_policy(mut self, policy: SpillFailurePolicy) -> Self {
        self.spill_policy = policy;
        self
    }

    /// The durable table backing this repository.
    #[must_use]
    pub fn table(&self) -> &BlobTable {
        &self.table
    }

    /// Number of entities currently resident or mid-swap.
    #[must_use]
    pub fn count(&self) -> usize {
        let map = self.map.read();
        map.resident.len() + map.swapping.len()
    }

    /// Shared access to the entity with `id`.
    ///
    /// Resident entities are guarded directly; a mid-swap id is waited
    /// out, then the durable table is consulted. Returns `None` when the
    /// entity exists nowhere (or its stored blob fails to decode).
    pub async fn get(&self, id: EntityId) -> Option<ReadGuard<E>> {
        if let Some(cell) = self.resident_cell(id) {
            return Some(ReadGuard(cell.read_owned().await));
        }

        self.wait_while_swapping(id).await;
        if let Some(cell) = self.resident_cell(id) {
            return Some(ReadGuard(cell.read_owned().await));
        }

        let raw = self.load_raw(id).await?;
        let fresh = Self::decode_fresh(id, &raw)?;
        let (cell, _) = self.insert_or_existing(id, Arc::new(RwLock::new(fresh)));
        Some(ReadGuard(cell.read_owned().await))
    }

    /// Exclusive access to the entity with `id`, creating it when absent.
    ///
    /// A missing or unreadable durable row yields a freshly
    /// default-constructed entity, inserted unconditionally.
    pub async fn get_mut(&self, id: EntityId) -> WriteGuard<E> {
        self.create(id, E::default).await
    }

    /// Like [`get_mut`](Repository::get_mut), but absent entities are
    /// constructed with `make` instead of [`Default`].
    pub async fn create<F>(&self, id: EntityId, make: F) -> WriteGuard<E>
    where
        F: FnOnce() -> E,
    {
        if let Some(cell) = self.resident_cell(id) {
            return WriteGuard(cell.write_owned().await);
        }

        self.wait_while_swapping(id).await;
        if let Some(cell) = self.resident_cell(id) {
            return WriteGuard(cell.write_owned().await);
        }

        let mut fresh = make();
        if let Some(raw) = self.load_raw(id).await {
            if let Err(e) = fresh.decode(&raw) {
                warn!(id, error = %e, "stored entity failed to decode; using fresh state");
            }
        }

        let (cell, _) = self.insert_or_existing(id, Arc::new(RwLock::new(fresh)));
        WriteGuard(cell.write_owned().await)
    }

    /// Persist the entity with `id` to the durable table and evict it from
    /// RAM.
    ///
    /// Waits behind every outstanding guard on the entity before
    /// serializing. Returns `false` when `id` was not resident, or when
    /// the durable write failed under
    /// [`SpillFailurePolicy::Reinstate`] (the entity then stays resident).
    pub async fn swap_out(&self, id: EntityId) -> bool {
        let cell = {
            let mut map = self.map.write();
            let Some(cell) = map.resident.remove(&id) else {
                return false;
            };
            map.swapping.insert(id);
            cell
        };

        // Blocks until every outstanding guard on this entity is dropped;
        // new guards cannot appear because the id is no longer resident.
        let guard = Arc::clone(&cell).write_owned().await;
        let raw = guard.encode();
        let stored = self.store_raw(id, raw).await;
        drop(guard);

        if !stored && self.spill_policy == SpillFailurePolicy::Reinstate {
            let mut map = self.map.write();
            map.swapping.remove(&id);
            map.resident.insert(id, cell);
            drop(map);
            self.swap_done.notify_waiters();
            return false;
        }

        // Unreferenced by the map; freed here unless a racing load already
        // gave up on this id.
        drop(cell);
        self.map.write().swapping.remove(&id);
        self.swap_done.notify_waiters();
        debug!(id, stored, "swapped out entity");
        true
    }

    /// Bring the entity with `id` into RAM if a durable row exists.
    ///
    /// Returns `true` when the entity is resident after the call,
    /// including when it already was.
    pub async fn swap_in(&self, id: EntityId) -> bool {
        if self.map.read().resident.contains_key(&id) {
            return true;
        }

        self.wait_while_swapping(id).await;
        if self.map.read().resident.contains_key(&id) {
            return true;
        }

        let Some(raw) = self.load_raw(id).await else {
            return false;
        };
        let Some(fresh) = Self::decode_fresh(id, &raw) else {
            return false;
        };
        self.insert_or_existing(id, Arc::new(RwLock::new(fresh)));
        true
    }

    /// Bulk prefetch: bring every id in `ids` into RAM where a durable row
    /// exists. Returns how many entities were newly loaded.
    pub async fn swap_in_many(&self, ids: &[EntityId]) -> usize {
        let mut to_load: Vec<EntityId> = {
            let map = self.map.read();
            ids.iter().copied().filter(|id| !map.resident.contains_key(id)).collect()
        };
        if to_load.is_empty() {
            return 0;
        }

        for id in to_load.clone() {
            self.wait_while_swapping(id).await;
        }

        // Another task may have loaded some while we waited.
        {
            let map = self.map.read();
            to_load.retain(|id| !map.resident.contains_key(id));
        }
        if to_load.is_empty() {
            return 0;
        }

        let table = self.table.clone();
        let loaded = match tokio::task::spawn_blocking(move || table.load_many(&to_load)).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                warn!(error = %e, "bulk durable load failed");
                return 0;
            },
            Err(e) => {
                warn!(error = %e, "bulk durable load task failed");
                return 0;
            },
        };

        let mut brought = 0;
        for (id, raw) in loaded {
            let Some(fresh) = Self::decode_fresh(id, &raw) else {
                continue;
            };
            let (_, inserted) = self.insert_or_existing(id, Arc::new(RwLock::new(fresh)));
            if inserted {
                brought += 1;
            }
        }
        brought
    }

    /// Remove the entity with `id` from RAM and the durable table.
    ///
    /// Returns `true` when a resident entity or a durable row was actually
    /// removed.
    pub async fn remove(&self, id: EntityId) -> bool {
        let cell = self.map.write().resident.remove(&id);
        if let Some(cell) = cell {
            // Hold the entity exclusively for the destruction window.
            let guard = Arc::clone(&cell).write_owned().await;
            drop(guard);
            drop(cell);
            self.delete_raw(id).await;
            return true;
        }

        self.wait_while_swapping(id).await;
        self.delete_raw(id).await
    }

    /// Evict every resident entity and purge the durable table.
    ///
    /// Entity destruction happens asynchronously, each under its own write
    /// hold; the durable purge waits only for in-flight swap-outs.
    pub async fn clear(&self) {
        for cell in self.snapshot_and_empty() {
            tokio::spawn(async move {
                let guard = Arc::clone(&cell).write_owned().await;
                drop(guard);
                drop(cell);
            });
        }

        self.wait_swapping_drained().await;
        self.delete_all_raw().await;
    }

    /// Like [`clear`](Repository::clear), but additionally waits until
    /// every evicted entity has been destroyed before purging the durable
    /// table.
    pub async fn clear_and_wait(&self) {
        let mut destructions = Vec::new();
        for cell in self.snapshot_and_empty() {
            destructions.push(tokio::spawn(async move {
                let guard = Arc::clone(&cell).write_owned().await;
                drop(guard);
                drop(cell);
            }));
        }
        for task in destructions {
            let _ = task.await;
        }

        self.wait_swapping_drained().await;
        self.delete_all_raw().await;
    }

    fn snapshot_and_empty(&self) -> Vec<Cell<E>> {
        let mut map = self.map.write();
        map.resident.drain().map(|(_, cell)| cell).collect()
    }

    fn resident_cell(&self, id: EntityId) -> Option<Cell<E>> {
        self.map.read().resident.get(&id).cloned()
    }

    /// Park until `id` is no longer mid-swap.
    async fn wait_while_swapping(&self, id: EntityId) {
        loop {
            let notified = self.swap_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.map.read().swapping.contains(&id) {
                return;
            }
            notified.await;
        }
    }

    async fn wait_swapping_drained(&self) {
        loop {
            let notified = self.swap_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.map.read().swapping.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Insert `cell` for `id` unless another task won the race; returns
    /// the resident cell and whether `cell` was the one inserted. The
    /// losing copy is simply dropped.
    fn insert_or_existing(&self, id: EntityId, cell: Cell<E>) -> (Cell<E>, bool) {
        let mut map = self.map.write();
        match map.resident.entry(id) {
            Entry::Occupied(slot) => {
                debug!(id, "lost insert race; using resident entity");
                (Arc::clone(slot.get()), false)
            },
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&cell));
                (cell, true)
            },
        }
    }

    async fn load_raw(&self, id: EntityId) -> Option<Vec<u8>> {
        let table = self.table.clone();
        match tokio::task::spawn_blocking(move || table.load(id)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(id, error = %e, "durable load failed");
                None
            },
            Err(e) => {
                warn!(id, error = %e, "durable load task failed");
                None
            },
        }
    }

    async fn store_raw(&self, id: EntityId, raw: Bytes) -> bool {
        let table = self.table.clone();
        match tokio::task::spawn_blocking(move || table.upsert(id, &raw)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(id, error = %e, "durable write failed; row may be stale");
                false
            },
            Err(e) => {
                warn!(id, error = %e, "durable write task failed");
                false
            },
        }
    }

    async fn delete_raw(&self, id: EntityId) -> bool {
        let table = self.table.clone();
        match tokio::task::spawn_blocking(move || table.remove(id)).await {
            Ok(Ok(removed)) => removed,
            Ok(Err(e)) => {
                warn!(id, error = %e, "durable delete failed");
                false
            },
            Err(e) => {
                warn!(id, error = %e, "durable delete task failed");
                false
            },
        }
    }

    async fn delete_all_raw(&self) {
        let table = self.table.clone();
        match tokio::task::spawn_blocking(move || table.remove_all()).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!(error = %e, "durable purge failed"),
            Err(e) => warn!(error = %e, "durable purge task failed"),
        }
    }

    fn decode_fresh(id: EntityId, raw: &[u8]) -> Option<E> {
        let mut fresh = E::default();
        match fresh.decode(raw) {
            Ok(()) => Some(fresh),
            Err(e) => {
                warn!(id, error = %e, "stored entity failed to decode");
                None
            },
        }
    }
}

impl<E: Entity> std::fmt::Debug for Repository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.map.read();
        f.debug_struct("Repository")
            .field("table", &self.table.table_name())
            .field("resident", &map.resident.len())
            .field("swapping", &map.swapping.len())
            .finish()
    }
}
