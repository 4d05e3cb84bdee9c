//! # Resource Registry
//!
//! Storage for shared resources plus the store-wide table lock that
//! serializes allocation.
//!
//! Reads never take the table lock. Every state change made through
//! [`ResourceStore::update`] requires it and becomes visible to the
//! replication stream on [`ResourceStore::commit_and_unlock`].
//! [`ResourceStore::rollback_and_unlock`] restores every resource updated
//! since the lock was taken.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::errors::{StoreError, StoreResult};
use super::Resource;
use crate::replication::ReplicationLog;

/// Resource storage with a store-wide exclusive lock
pub trait ResourceStore: Send + Sync {
    /// Block until the table lock is granted.
    fn lock_table(&self) -> StoreResult<()>;

    /// Commit changes made under the table lock and release it.
    fn commit_and_unlock(&self) -> StoreResult<()>;

    /// Discard changes made under the table lock and release it.
    fn rollback_and_unlock(&self) -> StoreResult<()>;

    /// All resources ordered by name.
    fn list(&self) -> StoreResult<Vec<Resource>>;

    fn get(&self, name: &str) -> StoreResult<Resource>;

    /// Register a new resource.
    fn insert(&self, resource: Resource) -> StoreResult<Resource>;

    /// Replace the stored state of an existing resource. Requires the table
    /// lock.
    fn update(&self, resource: Resource) -> StoreResult<()>;
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::unavailable("resource store lock poisoned")
}

#[derive(Debug, Default)]
struct TableLock {
    held: bool,
    /// State before the first update of each resource since the lock was taken
    undo: BTreeMap<String, Resource>,
}

/// In-memory resource store
#[derive(Debug)]
pub struct MemoryResourceStore {
    resources: RwLock<BTreeMap<String, Resource>>,
    table: Mutex<TableLock>,
    unlocked: Condvar,
    lock_timeout: Option<Duration>,
    log: Arc<ReplicationLog>,
}

impl MemoryResourceStore {
    /// Create a store writing to `log`. Lock waits are unbounded.
    pub fn new(log: Arc<ReplicationLog>) -> Self {
        Self {
            resources: RwLock::new(BTreeMap::new()),
            table: Mutex::new(TableLock::default()),
            unlocked: Condvar::new(),
            lock_timeout: None,
            log,
        }
    }

    /// Bound how long [`lock_table`](ResourceStore::lock_table) may wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Count resources
    pub fn count(&self) -> StoreResult<usize> {
        Ok(self.resources.read().map_err(poisoned)?.len())
    }

    fn validate(resource: &Resource) -> StoreResult<()> {
        let invalid = |reason: &str| StoreError::Invalid {
            name: resource.name.clone(),
            reason: reason.to_string(),
        };

        if resource.name.trim().is_empty() {
            return Err(invalid("Name must not be empty"));
        }
        if resource.resource_type.trim().is_empty() {
            return Err(invalid("Type must not be empty"));
        }
        if resource.is_idle() != resource.lease.is_none() {
            return Err(invalid("Locked resources must carry a lease"));
        }
        Ok(())
    }
}

impl ResourceStore for MemoryResourceStore {
    fn lock_table(&self) -> StoreResult<()> {
        let started = Instant::now();
        let mut table = self.table.lock().map_err(poisoned)?;

        while table.held {
            table = match self.lock_timeout {
                None => self.unlocked.wait(table).map_err(poisoned)?,
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(StoreError::LockTimeout {
                            waited_ms: elapsed.as_millis() as u64,
                        });
                    }
                    self.unlocked
                        .wait_timeout(table, timeout - elapsed)
                        .map_err(poisoned)?
                        .0
                }
            };
        }

        table.held = true;
        table.undo.clear();
        debug!(waited_ms = started.elapsed().as_millis() as u64, "resource table locked");
        Ok(())
    }

    fn commit_and_unlock(&self) -> StoreResult<()> {
        let mut table = self.table.lock().map_err(poisoned)?;
        if !table.held {
            return Err(StoreError::LockNotHeld);
        }
        if !table.undo.is_empty() {
            let position = self.log.record_write();
            debug!(%position, "resource table committed");
        }
        table.held = false;
        table.undo.clear();
        drop(table);

        self.unlocked.notify_one();
        Ok(())
    }

    fn rollback_and_unlock(&self) -> StoreResult<()> {
        let mut table = self.table.lock().map_err(poisoned)?;
        if !table.held {
            return Err(StoreError::LockNotHeld);
        }

        let undo = std::mem::take(&mut table.undo);
        let restored = undo.len();
        let result = match self.resources.write() {
            Ok(mut resources) => {
                resources.extend(undo);
                Ok(())
            }
            Err(e) => Err(poisoned(e)),
        };
        // The lock is released even if restoring failed.
        table.held = false;
        drop(table);
        self.unlocked.notify_one();

        if restored > 0 {
            warn!(restored, "resource table rolled back");
        }
        result
    }

    fn list(&self) -> StoreResult<Vec<Resource>> {
        let resources = self.resources.read().map_err(poisoned)?;
        Ok(resources.values().cloned().collect())
    }

    fn get(&self, name: &str) -> StoreResult<Resource> {
        let resources = self.resources.read().map_err(poisoned)?;
        resources
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    fn insert(&self, resource: Resource) -> StoreResult<Resource> {
        Self::validate(&resource)?;

        let mut resources = self.resources.write().map_err(poisoned)?;
        if resources.contains_key(&resource.name) {
            return Err(StoreError::AlreadyExists {
                name: resource.name,
            });
        }
        resources.insert(resource.name.clone(), resource.clone());
        drop(resources);
        self.log.record_write();

        info!(
            resource = %resource.name,
            resource_type = %resource.resource_type,
            acl = ?resource.acl,
            "Resource registered"
        );
        Ok(resource)
    }

    fn update(&self, resource: Resource) -> StoreResult<()> {
        Self::validate(&resource)?;

        let mut table = self.table.lock().map_err(poisoned)?;
        if !table.held {
            return Err(StoreError::LockNotHeld);
        }

        let mut resources = self.resources.write().map_err(poisoned)?;
        let stored = resources
            .get_mut(&resource.name)
            .ok_or_else(|| StoreError::NotFound {
                name: resource.name.clone(),
            })?;
        table
            .undo
            .entry(resource.name.clone())
            .or_insert_with(|| stored.clone());
        *stored = resource;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::PositionSource;
    use crate::resources::{JobId, LeaseInfo};
    use chrono::Utc;

    fn store() -> (Arc<ReplicationLog>, MemoryResourceStore) {
        let log = Arc::new(ReplicationLog::synchronous());
        let store = MemoryResourceStore::new(log.clone());
        (log, store)
    }

    fn locked(mut resource: Resource) -> Resource {
        resource.lock(LeaseInfo {
            job: JobId(1),
            leased_by: None,
            leased_at: Utc::now(),
            expires_at: None,
        });
        resource
    }

    #[test]
    fn test_insert_and_read() {
        let (_, store) = store();
        store.insert(Resource::new("b", "nfs")).unwrap();
        store.insert(Resource::new("a", "nfs")).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(matches!(
            store.insert(Resource::new("a", "vlan")),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(matches!(store.get("c"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_update_requires_table_lock() {
        let (_, store) = store();
        store.insert(Resource::new("a", "nfs")).unwrap();

        let result = store.update(locked(Resource::new("a", "nfs")));
        assert!(matches!(result, Err(StoreError::LockNotHeld)));
        assert!(store.get("a").unwrap().is_idle());
    }

    #[test]
    fn test_commit_records_write_only_when_dirty() {
        let (log, store) = store();
        store.insert(Resource::new("a", "nfs")).unwrap();
        assert_eq!(log.write_position().unwrap().0, 1);

        store.lock_table().unwrap();
        store.commit_and_unlock().unwrap();
        assert_eq!(log.write_position().unwrap().0, 1);

        store.lock_table().unwrap();
        store.update(locked(Resource::new("a", "nfs"))).unwrap();
        store.commit_and_unlock().unwrap();
        assert_eq!(log.write_position().unwrap().0, 2);
        assert_eq!(store.get("a").unwrap().job(), Some(JobId(1)));
    }

    #[test]
    fn test_rollback_restores_updated_resources() {
        let (log, store) = store();
        store.insert(Resource::new("a", "nfs")).unwrap();
        store.insert(Resource::new("b", "nfs")).unwrap();
        let before = log.write_position().unwrap();

        store.lock_table().unwrap();
        store.update(locked(Resource::new("a", "nfs"))).unwrap();
        let mut twice = locked(Resource::new("a", "nfs"));
        twice.lease.as_mut().unwrap().job = JobId(2);
        store.update(twice).unwrap();
        assert_eq!(store.get("a").unwrap().job(), Some(JobId(2)));

        store.rollback_and_unlock().unwrap();
        assert!(store.get("a").unwrap().is_idle());
        assert!(store.get("b").unwrap().is_idle());
        assert_eq!(log.write_position().unwrap(), before);

        // Nothing left to undo once the next hold commits.
        store.lock_table().unwrap();
        store.update(locked(Resource::new("b", "nfs"))).unwrap();
        store.commit_and_unlock().unwrap();
        assert!(matches!(
            store.rollback_and_unlock(),
            Err(StoreError::LockNotHeld)
        ));
        assert_eq!(store.get("b").unwrap().job(), Some(JobId(1)));
    }

    #[test]
    fn test_locked_without_lease_rejected() {
        let (_, store) = store();
        let mut resource = Resource::new("a", "nfs");
        resource.status = crate::resources::ResourceStatus::Locked;
        assert!(matches!(
            store.insert(resource),
            Err(StoreError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unlock_without_lock() {
        let (_, store) = store();
        assert!(matches!(
            store.commit_and_unlock(),
            Err(StoreError::LockNotHeld)
        ));
    }

    #[test]
    fn test_lock_timeout() {
        let log = Arc::new(ReplicationLog::synchronous());
        let store = MemoryResourceStore::new(log).with_lock_timeout(Duration::from_millis(20));

        store.lock_table().unwrap();
        match store.lock_table() {
            Err(StoreError::LockTimeout { waited_ms }) => assert!(waited_ms >= 20),
            other => panic!("expected lock timeout, got {:?}", other),
        }
        store.commit_and_unlock().unwrap();
        store.lock_table().unwrap();
    }
}
