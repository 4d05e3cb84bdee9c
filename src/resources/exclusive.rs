//! # Exclusive Section
//!
//! Reentrant hold on the resource table lock for one logical request.
//!
//! A request that evaluates quotas and then locks resources enters the
//! section once for the whole operation and again inside the allocator. Only
//! the outermost entry takes the store lock and only the outermost exit
//! commits and releases it.
//!
//! Changes are committed only through [`SectionGuard::finish`]. A guard
//! dropped unfinished, on an error return or while unwinding, marks the
//! section aborted and the outermost exit rolls the store back instead.
//!
//! ```ignore
//! let section = ExclusiveSection::new(store.as_ref());
//! let outer = section.enter()?;
//! {
//!     let inner = section.enter()?; // depth 2, no second lock
//!     inner.finish()?;              // depth 1, still held
//! }
//! outer.finish()?;                  // depth 0, committed and unlocked
//! ```
//!
//! A section is tied to the thread that created it.

use std::cell::Cell;
use std::fmt;

use tracing::warn;

use super::errors::{StoreError, StoreResult};
use super::store::ResourceStore;

/// Per-request reentrant hold on the store-wide lock
pub struct ExclusiveSection<'s> {
    store: &'s dyn ResourceStore,
    depth: Cell<usize>,
    /// Bumped by `release_all` so guards from an earlier hold become inert
    generation: Cell<u64>,
    /// Set when a level is left without `finish`
    aborted: Cell<bool>,
}

impl<'s> ExclusiveSection<'s> {
    pub fn new(store: &'s dyn ResourceStore) -> Self {
        Self {
            store,
            depth: Cell::new(0),
            generation: Cell::new(0),
            aborted: Cell::new(false),
        }
    }

    /// Current nesting depth; zero when the lock is not held.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn is_held(&self) -> bool {
        self.depth.get() > 0
    }

    /// Enter the section, taking the store lock if this is the outermost
    /// entry.
    pub fn enter(&self) -> StoreResult<SectionGuard<'_, 's>> {
        if self.depth.get() == 0 {
            self.store.lock_table()?;
            self.aborted.set(false);
        }
        self.depth.set(self.depth.get() + 1);
        Ok(SectionGuard {
            section: self,
            generation: self.generation.get(),
            active: true,
        })
    }

    /// Drop every level of nesting and release the store lock. Commits, or
    /// rolls back and fails with [`StoreError::RolledBack`] if a level was
    /// aborted.
    pub fn release_all(&self) -> StoreResult<()> {
        self.unwind(true)
    }

    fn unwind(&self, commit: bool) -> StoreResult<()> {
        self.generation.set(self.generation.get() + 1);
        if self.depth.replace(0) == 0 {
            return Ok(());
        }
        if !self.aborted.get() && commit {
            return self.store.commit_and_unlock();
        }
        self.store.rollback_and_unlock()?;
        if commit {
            Err(StoreError::RolledBack)
        } else {
            Ok(())
        }
    }

    fn leave(&self, generation: u64, finished: bool) -> StoreResult<()> {
        if generation != self.generation.get() {
            return Ok(());
        }
        if !finished {
            self.aborted.set(true);
        }
        match self.depth.get() {
            0 => Ok(()),
            1 => {
                self.depth.set(0);
                if !self.aborted.get() {
                    return self.store.commit_and_unlock();
                }
                self.store.rollback_and_unlock()?;
                if finished {
                    Err(StoreError::RolledBack)
                } else {
                    Ok(())
                }
            }
            depth => {
                self.depth.set(depth - 1);
                Ok(())
            }
        }
    }
}

impl Drop for ExclusiveSection<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unwind(false) {
            warn!(error = %e, "failed to release resource table lock");
        }
    }
}

impl fmt::Debug for ExclusiveSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveSection")
            .field("depth", &self.depth.get())
            .finish_non_exhaustive()
    }
}

/// One level of an [`ExclusiveSection`]. Dropping it unfinished aborts the
/// section.
#[must_use = "the section is aborted as soon as the guard is dropped"]
pub struct SectionGuard<'a, 's> {
    section: &'a ExclusiveSection<'s>,
    generation: u64,
    active: bool,
}

impl SectionGuard<'_, '_> {
    /// Leave this level. At the outermost level this commits, or fails with
    /// [`StoreError::RolledBack`] if a nested level was aborted.
    pub fn finish(mut self) -> StoreResult<()> {
        self.active = false;
        self.section.leave(self.generation, true)
    }
}

impl Drop for SectionGuard<'_, '_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.section.leave(self.generation, false) {
                warn!(error = %e, "failed to roll back resource table");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationLog;
    use crate::resources::store::MemoryResourceStore;
    use crate::resources::{JobId, LeaseInfo, Resource};
    use chrono::Utc;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts lock, commit and rollback calls on top of a memory store.
    struct CountingStore {
        inner: MemoryResourceStore,
        locks: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryResourceStore::new(Arc::new(ReplicationLog::synchronous())),
                locks: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }
        }

        fn with_resource(name: &str) -> Self {
            let store = Self::new();
            store.inner.insert(Resource::new(name, "nfs")).unwrap();
            store
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.locks.load(Ordering::SeqCst),
                self.commits.load(Ordering::SeqCst),
                self.rollbacks.load(Ordering::SeqCst),
            )
        }
    }

    impl ResourceStore for CountingStore {
        fn lock_table(&self) -> StoreResult<()> {
            self.locks.fetch_add(1, Ordering::SeqCst);
            self.inner.lock_table()
        }

        fn commit_and_unlock(&self) -> StoreResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            self.inner.commit_and_unlock()
        }

        fn rollback_and_unlock(&self) -> StoreResult<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.inner.rollback_and_unlock()
        }

        fn list(&self) -> StoreResult<Vec<Resource>> {
            self.inner.list()
        }

        fn get(&self, name: &str) -> StoreResult<Resource> {
            self.inner.get(name)
        }

        fn insert(&self, resource: Resource) -> StoreResult<Resource> {
            self.inner.insert(resource)
        }

        fn update(&self, resource: Resource) -> StoreResult<()> {
            self.inner.update(resource)
        }
    }

    fn leased(name: &str) -> Resource {
        let mut resource = Resource::new(name, "nfs");
        resource.lock(LeaseInfo {
            job: JobId(7),
            leased_by: None,
            leased_at: Utc::now(),
            expires_at: None,
        });
        resource
    }

    #[test]
    fn test_nested_entry_locks_once() {
        let store = CountingStore::new();
        let section = ExclusiveSection::new(&store);

        let outer = section.enter().unwrap();
        let inner = section.enter().unwrap();
        assert_eq!(section.depth(), 2);
        assert_eq!(store.counts(), (1, 0, 0));

        inner.finish().unwrap();
        assert_eq!(section.depth(), 1);
        assert_eq!(store.counts(), (1, 0, 0));

        outer.finish().unwrap();
        assert!(!section.is_held());
        assert_eq!(store.counts(), (1, 1, 0));
    }

    #[test]
    fn test_guard_drop_rolls_back() {
        let store = CountingStore::with_resource("a");
        let section = ExclusiveSection::new(&store);
        {
            let _outer = section.enter().unwrap();
            {
                let _inner = section.enter().unwrap();
                store.update(leased("a")).unwrap();
            }
            assert_eq!(section.depth(), 1);
        }
        assert_eq!(section.depth(), 0);
        assert_eq!(store.counts(), (1, 0, 1));
        assert!(store.get("a").unwrap().is_idle());
    }

    #[test]
    fn test_finish_after_aborted_inner_fails() {
        let store = CountingStore::with_resource("a");
        let section = ExclusiveSection::new(&store);

        let outer = section.enter().unwrap();
        let inner = section.enter().unwrap();
        store.update(leased("a")).unwrap();
        drop(inner);

        assert!(matches!(outer.finish(), Err(StoreError::RolledBack)));
        assert!(!section.is_held());
        assert_eq!(store.counts(), (1, 0, 1));
        assert!(store.get("a").unwrap().is_idle());

        // The next hold starts clean.
        let again = section.enter().unwrap();
        store.update(leased("a")).unwrap();
        again.finish().unwrap();
        assert_eq!(store.counts(), (2, 1, 1));
        assert_eq!(store.get("a").unwrap().job(), Some(JobId(7)));
    }

    #[test]
    fn test_panic_rolls_back() {
        let store = CountingStore::with_resource("a");
        let section = ExclusiveSection::new(&store);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = section.enter().unwrap();
            store.update(leased("a")).unwrap();
            panic!("allocation step failed");
        }));

        assert!(result.is_err());
        assert!(!section.is_held());
        assert!(store.get("a").unwrap().is_idle());
        assert_eq!(store.counts(), (1, 0, 1));
    }

    #[test]
    fn test_release_all_makes_old_guards_inert() {
        let store = CountingStore::new();
        let section = ExclusiveSection::new(&store);

        let stale = section.enter().unwrap();
        let _nested = section.enter().unwrap();
        section.release_all().unwrap();
        assert_eq!(store.counts(), (1, 1, 0));

        let fresh = section.enter().unwrap();
        drop(stale);
        assert_eq!(section.depth(), 1);
        fresh.finish().unwrap();
        assert_eq!(store.counts(), (2, 2, 0));
    }

    #[test]
    fn test_dropping_section_rolls_back() {
        let store = CountingStore::with_resource("a");
        {
            let section = ExclusiveSection::new(&store);
            let guard = section.enter().unwrap();
            store.update(leased("a")).unwrap();
            std::mem::forget(guard);
        }
        assert_eq!(store.counts(), (1, 0, 1));
        assert!(store.get("a").unwrap().is_idle());
        assert!(store.inner.lock_table().is_ok());
    }

    #[test]
    fn test_failed_lock_leaves_depth_zero() {
        let log = Arc::new(ReplicationLog::synchronous());
        let store = MemoryResourceStore::new(log)
            .with_lock_timeout(std::time::Duration::from_millis(5));
        store.lock_table().unwrap();

        let section = ExclusiveSection::new(&store);
        assert!(matches!(
            section.enter(),
            Err(StoreError::LockTimeout { .. })
        ));
        assert_eq!(section.depth(), 0);
    }
}
