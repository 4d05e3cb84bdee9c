//! Service assembly from configuration.

use std::sync::Arc;

use tracing::info;

use crate::acl::{AclEvaluator, AclRef, AclRegistry, NewAcl, QuotaStore, StaticDirectory};
use crate::admission::{AdmissionResult, AdmissionService};
use crate::config::ServiceConfig;
use crate::observability::SlowRequestTracker;
use crate::replication::{ReplicationGate, ReplicationLog};
use crate::resources::{MemoryResourceStore, RegistryPool, Resource, ResourceAllocator};

/// Wire the in-memory stores, directory and gate together and load the
/// configured ACLs and resources.
pub fn build_service(config: &ServiceConfig) -> AdmissionResult<AdmissionService> {
    let log = Arc::new(ReplicationLog::synchronous());
    let acls = Arc::new(AclRegistry::new(log.clone()));

    let mut store = MemoryResourceStore::new(log.clone());
    if let Some(timeout) = config.store.lock_timeout() {
        store = store.with_lock_timeout(timeout);
    }
    let store = Arc::new(store);

    let directory = Arc::new(StaticDirectory::new(config.directory.groups.clone()));
    let pool = Arc::new(RegistryPool::new(store.clone(), acls.clone()));
    let evaluator = AclEvaluator::new(acls.clone(), directory, pool);
    let gate = ReplicationGate::new(log, config.replication.clone());

    let service = AdmissionService::new(acls.clone(), evaluator, ResourceAllocator::new(store), gate)
        .with_slow_requests(SlowRequestTracker::new(config.slow_requests.clone()));

    seed(&service, acls.as_ref(), config)?;
    Ok(service)
}

fn seed(service: &AdmissionService, acls: &dyn QuotaStore, config: &ServiceConfig) -> AdmissionResult<()> {
    for seed in &config.acls {
        service.create_acl(NewAcl {
            name: seed.name.clone(),
            owner: seed.owner.clone(),
            parent: seed.parent.clone().map(AclRef::Name),
            entries: seed.entries.clone(),
        })?;
    }

    for seed in &config.resources {
        let mut resource =
            Resource::new(&seed.name, &seed.resource_type).with_data(seed.data.clone());
        resource.sites = seed.sites.clone();
        if let Some(acl) = &seed.acl {
            resource = resource.with_acl(acls.get_by_name(acl)?.id);
        }
        service.register_resource(resource)?;
    }

    info!(
        acls = config.acls.len(),
        resources = config.resources.len(),
        "Loaded configured ACLs and resources"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclEntrySpec, Constraint};
    use crate::admission::{AllocateRequest, Allocation};
    use crate::config::{AclSeed, ResourceSeed};
    use crate::resources::JobId;
    use std::collections::BTreeMap;

    fn config() -> ServiceConfig {
        let mut groups = BTreeMap::new();
        groups.insert("qa".to_string(), vec!["alice".to_string(), "bob".to_string()]);

        let mut config = ServiceConfig::default();
        config.directory.groups = groups;
        config.acls = vec![AclSeed {
            name: "lab".into(),
            owner: "admin".into(),
            parent: None,
            entries: vec![AclEntrySpec {
                kind: "group".into(),
                principal: Some("qa".into()),
                group_limit: Some(1),
                ..Default::default()
            }],
        }];
        config.resources = ["nfs01", "nfs02"]
            .iter()
            .map(|name| ResourceSeed {
                name: name.to_string(),
                resource_type: "nfs".into(),
                sites: None,
                acl: Some("lab".into()),
                data: serde_json::Value::Null,
            })
            .collect();
        config
    }

    #[test]
    fn test_build_and_seed() {
        let service = build_service(&config()).unwrap();
        assert_eq!(service.list_acls(None).unwrap().len(), 1);
        assert_eq!(service.list_resources(None, None).unwrap().len(), 2);

        let lab = AclRef::Name("lab".into());
        let first = AllocateRequest::new(lab.clone(), "alice", "nfs", JobId(1));
        assert!(matches!(
            service.allocate(&first).unwrap().value,
            Allocation::Leased(_)
        ));

        // bob shares the qa group limit with alice
        let second = AllocateRequest::new(lab, "bob", "nfs", JobId(2));
        match service.allocate(&second).unwrap().value {
            Allocation::Denied(denial) => {
                assert_eq!(denial.violation.constraint, Constraint::GroupLimit)
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_seed_with_unknown_acl_fails() {
        let mut config = config();
        config.resources[0].acl = Some("ghost".into());
        let err = build_service(&config).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
