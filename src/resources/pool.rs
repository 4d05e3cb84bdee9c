//! ACL pools derived from resource tags.

use std::collections::HashSet;
use std::sync::Arc;

use crate::acl::{Acl, AclError, AclResult, PoolInventory, PoolMember, QuotaStore};

use super::store::ResourceStore;

/// Pool of an ACL: every resource tagged with that ACL or one of its
/// descendants.
#[derive(Clone)]
pub struct RegistryPool {
    resources: Arc<dyn ResourceStore>,
    acls: Arc<dyn QuotaStore>,
}

impl RegistryPool {
    pub fn new(resources: Arc<dyn ResourceStore>, acls: Arc<dyn QuotaStore>) -> Self {
        Self { resources, acls }
    }
}

impl PoolInventory for RegistryPool {
    fn resources_visible_under(&self, acl: &Acl) -> AclResult<Vec<PoolMember>> {
        let subtree: HashSet<_> = self.acls.subtree(acl.id)?.into_iter().collect();
        let resources = self
            .resources
            .list()
            .map_err(|e| AclError::store_unavailable(e.to_string()))?;

        Ok(resources
            .into_iter()
            .filter(|resource| resource.acl.map_or(false, |id| subtree.contains(&id)))
            .map(|resource| PoolMember {
                leased_by: resource.lease.and_then(|lease| lease.leased_by),
                name: resource.name,
            })
            .collect())
    }
}

impl std::fmt::Debug for RegistryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryPool").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclRef, AclRegistry, NewAcl};
    use crate::replication::ReplicationLog;
    use crate::resources::{JobId, LockRequest, MemoryResourceStore, Resource, ResourceAllocator};

    fn new_acl(name: &str, parent: Option<&str>) -> NewAcl {
        NewAcl {
            name: name.to_string(),
            owner: "admin".to_string(),
            parent: parent.map(|p| AclRef::Name(p.to_string())),
            entries: Vec::new(),
        }
    }

    #[test]
    fn test_pool_includes_descendants() {
        let log = Arc::new(ReplicationLog::synchronous());
        let acls = Arc::new(AclRegistry::new(log.clone()));
        let store = Arc::new(MemoryResourceStore::new(log));

        let lab = acls.insert(new_acl("lab", None)).unwrap();
        let perf = acls.insert(new_acl("perf", Some("lab"))).unwrap();
        let other = acls.insert(new_acl("other", None)).unwrap();

        let allocator = ResourceAllocator::new(store.clone());
        allocator.register(Resource::new("a", "nfs").with_acl(lab.id)).unwrap();
        allocator.register(Resource::new("b", "nfs").with_acl(perf.id)).unwrap();
        allocator.register(Resource::new("c", "nfs").with_acl(other.id)).unwrap();
        allocator.register(Resource::new("d", "nfs")).unwrap();

        let section = allocator.section();
        let request = LockRequest::new("nfs", JobId(1)).leased_by("alice");
        allocator.lock_many(&section, &request).unwrap();

        let pool = RegistryPool::new(store, acls);
        let members = pool.resources_visible_under(&lab).unwrap();
        assert_eq!(
            members,
            vec![
                PoolMember {
                    name: "a".into(),
                    leased_by: Some("alice".into())
                },
                PoolMember {
                    name: "b".into(),
                    leased_by: None
                },
            ]
        );

        let members = pool.resources_visible_under(&perf).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "b");
    }
}
