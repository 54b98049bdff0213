//! Keyed entity storage with per-ID mutual exclusion.
//!
//! The store owns the authoritative copy of every entity. Readers get clones;
//! writers take the per-ID lock, mutate a clone and write it back with
//! [`EntityStore::store`] before the lock is released. Locks on different IDs
//! never contend with each other.
//!
//! Per-ID locks are not re-entrant: locking an ID again from inside its own
//! critical section deadlocks.

use std::fmt;
use std::sync::Arc;

use bosun_model::{Entity, EntityId, Node};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{BosunError, Result};

#[derive(Default)]
pub struct EntityStore {
    nodes: DashMap<EntityId, Node>,
    locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("node_count", &self.nodes.len())
            .field("lock_count", &self.locks.len())
            .finish()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entity` under its own ID, replacing any previous value.
    pub fn store<E: Entity>(&self, entity: E) -> Result<()> {
        check_kind::<E>(entity.id())?;
        self.nodes.insert(entity.id().clone(), entity.into_node());
        Ok(())
    }

    pub fn load<E: Entity>(&self, id: &EntityId) -> Result<E> {
        check_kind::<E>(id)?;
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| BosunError::NotFound(id.clone()))?;

        E::from_node_ref(node.value())
            .cloned()
            .ok_or(BosunError::TypeMismatch {
                expected: E::KIND,
                found: node.kind(),
            })
    }

    /// Removes the entity. Deleting an absent ID is a no-op.
    ///
    /// The ID's lock entry goes too unless someone holds or waits on it.
    pub fn delete<E: Entity>(&self, id: &EntityId) -> Result<()> {
        check_kind::<E>(id)?;
        self.nodes.remove(id);
        // The shard write lock keeps `id_lock` from cloning the Arc meanwhile.
        self.locks.remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1);
        Ok(())
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Loads the entity under its lock and hands a copy to `f`.
    ///
    /// The lock is held until `f` returns (or unwinds). Changes are only
    /// visible if `f` calls [`EntityStore::store`].
    pub fn lock<E, R>(&self, id: &EntityId, f: impl FnOnce(E) -> R) -> Result<R>
    where
        E: Entity,
    {
        self.lock_fallible(id, |entity| Ok::<_, BosunError>(f(entity)))
    }

    /// Like [`EntityStore::lock`], but `f` may fail; its error is returned
    /// after the lock is released.
    pub fn lock_fallible<E, R, X>(
        &self,
        id: &EntityId,
        f: impl FnOnce(E) -> std::result::Result<R, X>,
    ) -> std::result::Result<R, X>
    where
        E: Entity,
        X: From<BosunError>,
    {
        check_kind::<E>(id)?;
        let mutex = self.id_lock(id);
        let _guard = mutex.lock();
        let entity = self.load::<E>(id)?;
        f(entity)
    }

    /// Like [`EntityStore::lock`], but an absent entity is replaced by its
    /// zero value.
    pub fn lock_or_create<E, R>(&self, id: &EntityId, f: impl FnOnce(E) -> R) -> Result<R>
    where
        E: Entity,
    {
        self.lock_or_create_fallible(id, |entity| Ok::<_, BosunError>(f(entity)))
    }

    pub fn lock_or_create_fallible<E, R, X>(
        &self,
        id: &EntityId,
        f: impl FnOnce(E) -> std::result::Result<R, X>,
    ) -> std::result::Result<R, X>
    where
        E: Entity,
        X: From<BosunError>,
    {
        check_kind::<E>(id)?;
        let mutex = self.id_lock(id);
        let _guard = mutex.lock();
        let entity = match self.load::<E>(id) {
            Ok(entity) => entity,
            Err(BosunError::NotFound(_)) => E::zero(id.clone()),
            Err(err) => return Err(err.into()),
        };
        f(entity)
    }

    fn id_lock(&self, id: &EntityId) -> Arc<Mutex<()>> {
        // Clone the Arc out so the map shard is released before blocking.
        self.locks.entry(id.clone()).or_default().clone()
    }
}

fn check_kind<E: Entity>(id: &EntityId) -> Result<()> {
    let found = id.kind()?;
    if found != E::KIND {
        return Err(BosunError::TypeMismatch {
            expected: E::KIND,
            found,
        });
    }
    Ok(())
}
