//! # ACL Registry
//!
//! Storage and retrieval of policy nodes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::info;

use super::errors::{AclError, AclResult};
use super::model::{resolve_entries, Acl, AclId, AclRef, NewAcl, UpdateAcl};
use crate::replication::ReplicationLog;

/// Policy storage
pub trait QuotaStore: Send + Sync {
    fn get(&self, id: AclId) -> AclResult<Acl>;

    fn get_by_name(&self, name: &str) -> AclResult<Acl>;

    /// All ACLs ordered by id.
    fn list(&self) -> AclResult<Vec<Acl>>;

    fn insert(&self, acl: NewAcl) -> AclResult<Acl>;

    fn update(&self, id: AclId, update: UpdateAcl) -> AclResult<Acl>;

    fn remove(&self, id: AclId) -> AclResult<()>;

    fn resolve(&self, acl: &AclRef) -> AclResult<Acl> {
        match acl {
            AclRef::Id(id) => self.get(*id),
            AclRef::Name(name) => self.get_by_name(name),
        }
    }

    /// Direct children of `id`.
    fn children(&self, id: AclId) -> AclResult<Vec<AclId>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|acl| acl.parent == Some(id))
            .map(|acl| acl.id)
            .collect())
    }

    /// `id` and every ACL below it.
    fn subtree(&self, id: AclId) -> AclResult<Vec<AclId>> {
        let acls = self.list()?;
        let mut subtree = vec![id];
        let mut index = 0;
        while index < subtree.len() {
            let current = subtree[index];
            let children: Vec<AclId> = acls
                .iter()
                .filter(|acl| acl.parent == Some(current) && !subtree.contains(&acl.id))
                .map(|acl| acl.id)
                .collect();
            subtree.extend(children);
            index += 1;
        }
        Ok(subtree)
    }
}

fn poisoned<T>(_: PoisonError<T>) -> AclError {
    AclError::store_unavailable("ACL registry lock poisoned")
}

#[derive(Debug, Default)]
struct Tables {
    acls: BTreeMap<AclId, Acl>,
    names: HashMap<String, AclId>,
}

impl Tables {
    fn lookup(&self, acl: &AclRef) -> AclResult<AclId> {
        match acl {
            AclRef::Id(id) if self.acls.contains_key(id) => Ok(*id),
            AclRef::Name(name) => self
                .names
                .get(name)
                .copied()
                .ok_or_else(|| AclError::not_found(name)),
            other => Err(AclError::not_found(other)),
        }
    }

    /// Reject a parent link from `child` to `parent` that would close a loop.
    fn check_parent(&self, child: AclId, parent: AclId) -> AclResult<()> {
        let mut next = Some(parent);
        while let Some(id) = next {
            if id == child {
                return Err(AclError::configuration(
                    Some(child),
                    format!("parent {} would create a cycle", parent),
                ));
            }
            next = self.acls.get(&id).and_then(|acl| acl.parent);
        }
        Ok(())
    }
}

/// In-memory ACL registry
#[derive(Debug, Clone)]
pub struct AclRegistry {
    tables: Arc<RwLock<Tables>>,
    next_id: Arc<AtomicU64>,
    log: Arc<ReplicationLog>,
}

impl AclRegistry {
    /// Create a new registry writing to `log`
    pub fn new(log: Arc<ReplicationLog>) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            log,
        }
    }

    /// Validate ACL name
    fn validate_name(name: &str) -> AclResult<()> {
        let invalid = |reason: &str| AclError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() || name.len() > 64 {
            return Err(invalid("Name must be 1-64 characters"));
        }
        if name.trim() != name {
            return Err(invalid("Name must not start or end with whitespace"));
        }
        // Numeric names would be ambiguous with ids in AclRef
        if name.parse::<u64>().is_ok() {
            return Err(invalid("Name must not be purely numeric"));
        }
        Ok(())
    }

    /// Count ACLs
    pub fn count(&self) -> AclResult<usize> {
        Ok(self.tables.read().map_err(poisoned)?.acls.len())
    }
}

impl QuotaStore for AclRegistry {
    fn get(&self, id: AclId) -> AclResult<Acl> {
        let tables = self.tables.read().map_err(poisoned)?;
        tables
            .acls
            .get(&id)
            .cloned()
            .ok_or_else(|| AclError::not_found(id))
    }

    fn get_by_name(&self, name: &str) -> AclResult<Acl> {
        let tables = self.tables.read().map_err(poisoned)?;
        let id = tables.lookup(&AclRef::Name(name.to_string()))?;
        tables
            .acls
            .get(&id)
            .cloned()
            .ok_or_else(|| AclError::not_found(name))
    }

    fn list(&self) -> AclResult<Vec<Acl>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.acls.values().cloned().collect())
    }

    fn insert(&self, request: NewAcl) -> AclResult<Acl> {
        Self::validate_name(&request.name)?;
        let entries = resolve_entries(request.entries)?;

        let mut tables = self.tables.write().map_err(poisoned)?;
        if tables.names.contains_key(&request.name) {
            return Err(AclError::NameExists { name: request.name });
        }
        let parent = request
            .parent
            .as_ref()
            .map(|parent| tables.lookup(parent))
            .transpose()?;

        let id = AclId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = Utc::now();
        let acl = Acl {
            id,
            parent,
            owner: request.owner,
            name: request.name,
            entries,
            created_at: now,
            updated_at: now,
        };

        tables.names.insert(acl.name.clone(), id);
        tables.acls.insert(id, acl.clone());
        self.log.record_write();

        info!(acl_id = %id, name = %acl.name, parent = ?parent, "ACL created");
        Ok(acl)
    }

    fn update(&self, id: AclId, update: UpdateAcl) -> AclResult<Acl> {
        if let Some(name) = &update.name {
            Self::validate_name(name)?;
        }
        let entries = update
            .entries
            .map(resolve_entries)
            .transpose()
            .map_err(|e| e.in_acl(id))?;

        let mut tables = self.tables.write().map_err(poisoned)?;
        let current = tables
            .acls
            .get(&id)
            .cloned()
            .ok_or_else(|| AclError::not_found(id))?;

        let parent = match &update.parent {
            Some(parent) => {
                let parent = tables.lookup(parent)?;
                tables.check_parent(id, parent)?;
                Some(parent)
            }
            None => current.parent,
        };

        if let Some(name) = &update.name {
            if name != &current.name {
                if tables.names.contains_key(name) {
                    return Err(AclError::NameExists { name: name.clone() });
                }
                tables.names.remove(&current.name);
                tables.names.insert(name.clone(), id);
            }
        }

        let acl = Acl {
            parent,
            name: update.name.unwrap_or(current.name),
            entries: entries.unwrap_or(current.entries),
            updated_at: Utc::now(),
            ..current
        };
        tables.acls.insert(id, acl.clone());
        self.log.record_write();

        info!(acl_id = %id, "ACL updated");
        Ok(acl)
    }

    fn remove(&self, id: AclId) -> AclResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if !tables.acls.contains_key(&id) {
            return Err(AclError::not_found(id));
        }
        let children = tables
            .acls
            .values()
            .filter(|acl| acl.parent == Some(id))
            .count();
        if children > 0 {
            return Err(AclError::InUse {
                acl_id: id,
                reason: format!("ACL is the parent of {} other ACLs", children),
            });
        }

        if let Some(acl) = tables.acls.remove(&id) {
            tables.names.remove(&acl.name);
        }
        self.log.record_write();

        info!(acl_id = %id, "ACL removed");
        Ok(())
    }
}
