//! Process-wide buffer pool directory.
//!
//! The registry is the **sole strong owner** of every live pool. Everyone
//! else — production lines, consumers, the display — holds a [`Weak`]
//! observer obtained from [`BufferPoolRegistry::get_pool`] and upgrades it
//! for the duration of each use. A pool is therefore reachable from the
//! registry iff it is alive: a consumer either sees the pool (its upgrade
//! succeeds) or sees it gone (upgrade fails cleanly), never a torn pool.
//!
//! Destruction runs exclusively through the allocator layer: an allocator
//! drains its pools' buffers, then calls the passkey-gated
//! [`BufferPoolRegistry::unregister_pool`], which drops the registry's strong
//! reference — the only one in existence by invariant — and destroys the pool
//! synchronously. No public path can do this.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use super::pool::{AllocatorKey, BufferPool};
use crate::error::{AllocError, AllocResult};

static REGISTRY: Lazy<BufferPoolRegistry> = Lazy::new(BufferPoolRegistry::new);

/// The process-global registry instance. Initialised lazily on first use and
/// never torn down during normal operation; pools are individually
/// unregistered.
pub fn global() -> &'static BufferPoolRegistry {
    &REGISTRY
}

struct PoolEntry {
    pool: Arc<BufferPool>,
    name: String,
    category: String,
    created_at: Instant,
    /// Id of the allocator that created the pool; cleanup discovery key.
    allocator_id: u64,
}

#[derive(Default)]
struct RegistryInner {
    pools: HashMap<u64, PoolEntry>,
    /// Secondary index; duplicate names warn and the newest wins.
    by_name: HashMap<String, u64>,
    next_id: u64,
}

/// Aggregate statistics over every registered pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub total_pools: usize,
    pub total_buffers: usize,
    pub total_free: usize,
    pub total_filled: usize,
    pub total_memory: usize,
}

/// Directory mapping pool id → pool, indexed also by creator allocator id.
pub struct BufferPoolRegistry {
    inner: Mutex<RegistryInner>,
}

impl BufferPoolRegistry {
    fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                pools: HashMap::new(),
                by_name: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a pool, transferring ownership to the registry.
    ///
    /// Records the creator allocator's id for later cleanup discovery and
    /// assigns the pool its registry id. A name collision logs a warning but
    /// is not an error. Zero allocator ids are rejected.
    pub fn register_pool(
        &self,
        pool: Arc<BufferPool>,
        allocator_id: u64,
    ) -> AllocResult<u64> {
        if allocator_id == 0 {
            return Err(AllocError::Registry("allocator id must be non-zero"));
        }
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let name = pool.name().to_string();
        if let Some(existing) = inner.by_name.insert(name.clone(), id) {
            warn!(
                name = %name,
                existing_id = existing,
                new_id = id,
                "pool name collision; the new pool shadows the old in the name index"
            );
        }
        pool.set_registry_id(id);
        debug!(id, name = %name, allocator_id, "pool registered");
        inner.pools.insert(
            id,
            PoolEntry {
                name,
                category: pool.category().to_string(),
                created_at: Instant::now(),
                allocator_id,
                pool,
            },
        );
        Ok(id)
    }

    /// The sole public lookup: a weak observer the caller must upgrade
    /// (time-bounded) before use. Empty when the id is unknown or the pool
    /// has been unregistered.
    pub fn get_pool(&self, id: u64) -> Weak<BufferPool> {
        self.lock()
            .pools
            .get(&id)
            .map(|entry| Arc::downgrade(&entry.pool))
            .unwrap_or_default()
    }

    /// Resolve a pool id by its registered name.
    pub fn find_by_name(&self, name: &str) -> Option<u64> {
        self.lock().by_name.get(name).copied()
    }

    pub fn pool_count(&self) -> usize {
        self.lock().pools.len()
    }

    /// Aggregate counters over the current set.
    pub fn global_stats(&self) -> GlobalStats {
        let inner = self.lock();
        let mut stats = GlobalStats {
            total_pools: inner.pools.len(),
            ..GlobalStats::default()
        };
        for entry in inner.pools.values() {
            stats.total_buffers += entry.pool.total_count();
            stats.total_free += entry.pool.free_count();
            stats.total_filled += entry.pool.filled_count();
            stats.total_memory += entry.pool.memory_usage();
        }
        stats
    }

    pub fn total_memory_usage(&self) -> usize {
        self.global_stats().total_memory
    }

    /// Log one line per registered pool plus the aggregate.
    pub fn print_all_stats(&self) {
        let inner = self.lock();
        info!(total_pools = inner.pools.len(), "registered buffer pools");
        for (id, entry) in &inner.pools {
            info!(
                id,
                name = %entry.name,
                category = %entry.category,
                allocator_id = entry.allocator_id,
                buffers = entry.pool.total_count(),
                free = entry.pool.free_count(),
                filled = entry.pool.filled_count(),
                bytes = entry.pool.memory_usage(),
                age_secs = entry.created_at.elapsed().as_secs(),
                "pool"
            );
        }
    }

    // ---- allocator-only operations (passkey-gated) ---------------------

    /// Strong reference for the duration of an allocator's teardown; pins the
    /// pool without removing the entry.
    pub(crate) fn pool_for_cleanup(&self, _key: &AllocatorKey, id: u64) -> Option<Arc<BufferPool>> {
        self.lock().pools.get(&id).map(|entry| Arc::clone(&entry.pool))
    }

    /// Every pool id attributed to the given allocator. Used by an
    /// allocator's drop to discover what it must clean up.
    pub(crate) fn pools_by_allocator(&self, _key: &AllocatorKey, allocator_id: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .lock()
            .pools
            .iter()
            .filter(|(_, entry)| entry.allocator_id == allocator_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Remove a pool from both indexes, dropping the registry's strong
    /// reference — the moment of pool destruction. Unknown ids are a warning
    /// no-op.
    pub(crate) fn unregister_pool(&self, _key: &AllocatorKey, id: u64) {
        let mut inner = self.lock();
        match inner.pools.remove(&id) {
            Some(entry) => {
                // Only drop the name index entry if it still points at us;
                // a collision may have redirected it to a newer pool.
                if inner.by_name.get(&entry.name) == Some(&id) {
                    inner.by_name.remove(&entry.name);
                }
                debug!(id, name = %entry.name, "pool unregistered");
            }
            None => warn!(id, "unregister of unknown pool id ignored"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn key() -> AllocatorKey {
        AllocatorKey::new()
    }

    fn empty_pool(name: &str) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(&key(), name, "Test"))
    }

    #[test]
    #[serial]
    fn registration_assigns_unique_monotonic_ids() {
        let registry = global();
        let a = registry.register_pool(empty_pool("reg-a"), 1001).unwrap();
        let b = registry.register_pool(empty_pool("reg-b"), 1001).unwrap();
        assert_ne!(a, b);
        assert!(b > a);

        assert!(registry.get_pool(a).upgrade().is_some());
        registry.unregister_pool(&key(), a);
        registry.unregister_pool(&key(), b);
    }

    #[test]
    #[serial]
    fn observer_dies_with_unregistration() {
        let registry = global();
        let id = registry.register_pool(empty_pool("reg-observer"), 1002).unwrap();
        let weak = registry.get_pool(id);
        assert!(weak.upgrade().is_some());

        registry.unregister_pool(&key(), id);
        assert!(weak.upgrade().is_none(), "registry strong ref was the last");
        assert!(registry.get_pool(id).upgrade().is_none());
        // Unregistering again is a warning no-op.
        registry.unregister_pool(&key(), id);
    }

    #[test]
    #[serial]
    fn zero_allocator_id_is_rejected() {
        let registry = global();
        assert!(registry.register_pool(empty_pool("reg-zero"), 0).is_err());
    }

    #[test]
    #[serial]
    fn name_collision_warns_and_newest_wins() {
        let registry = global();
        let a = registry.register_pool(empty_pool("reg-dup"), 1003).unwrap();
        let b = registry.register_pool(empty_pool("reg-dup"), 1003).unwrap();
        assert_eq!(registry.find_by_name("reg-dup"), Some(b));

        // Unregistering the shadowed pool must not break the name index.
        registry.unregister_pool(&key(), a);
        assert_eq!(registry.find_by_name("reg-dup"), Some(b));
        registry.unregister_pool(&key(), b);
        assert_eq!(registry.find_by_name("reg-dup"), None);
    }

    #[test]
    #[serial]
    fn allocator_index_finds_only_its_pools() {
        let registry = global();
        let a = registry.register_pool(empty_pool("reg-own-a"), 1004).unwrap();
        let b = registry.register_pool(empty_pool("reg-own-b"), 1004).unwrap();
        let c = registry.register_pool(empty_pool("reg-own-c"), 1005).unwrap();

        assert_eq!(registry.pools_by_allocator(&key(), 1004), vec![a, b]);
        assert_eq!(registry.pools_by_allocator(&key(), 1005), vec![c]);
        assert!(registry.pools_by_allocator(&key(), 9999).is_empty());

        for id in [a, b, c] {
            registry.unregister_pool(&key(), id);
        }
    }

    #[test]
    #[serial]
    fn cleanup_reference_pins_the_pool() {
        let registry = global();
        let id = registry.register_pool(empty_pool("reg-pin"), 1006).unwrap();
        let pinned = registry.pool_for_cleanup(&key(), id).unwrap();
        registry.unregister_pool(&key(), id);
        // The pinned strong ref keeps the pool alive through teardown.
        assert_eq!(pinned.registry_id(), id);
        assert!(registry.get_pool(id).upgrade().is_none());
    }

    #[test]
    #[serial]
    fn global_stats_aggregate() {
        let registry = global();
        let before = registry.global_stats();
        let id = registry.register_pool(empty_pool("reg-stats"), 1007).unwrap();
        let after = registry.global_stats();
        assert_eq!(after.total_pools, before.total_pools + 1);
        registry.unregister_pool(&key(), id);
    }
}
