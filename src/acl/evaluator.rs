//! # ACL Evaluator
//!
//! Decides whether a user may take `delta` more resources under an ACL.
//!
//! The ACL and every ancestor up to its root are checked. Within each node,
//! every entry that applies to the user must hold; a single failing entry
//! anywhere in the chain denies the request. Percent limits are taken against
//! the pool of the node that carries the entry, rounded down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::directory::Directory;
use super::errors::{AclError, AclResult};
use super::model::{Acl, AclId, Constraint, EntryUsage, Selector, Violation};
use super::registry::QuotaStore;

/// A resource counted in an ACL's pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMember {
    pub name: String,
    /// User currently holding the resource, if leased
    pub leased_by: Option<String>,
}

/// Supplies the pool of resources visible under an ACL
pub trait PoolInventory: Send + Sync {
    fn resources_visible_under(&self, acl: &Acl) -> AclResult<Vec<PoolMember>>;
}

/// Quota question put to the evaluator
#[derive(Debug, Clone, Copy)]
pub struct QuotaRequest<'a> {
    pub user: &'a str,
    /// Additional resources requested
    pub delta: u64,
    /// Requested lease length, if any
    pub lease_hours: Option<u64>,
}

/// Why a request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub acl_id: AclId,
    pub acl_name: String,
    /// Entry that failed, as `user:<id>`, `group:<name>` or `default`
    pub entry: String,
    #[serde(flatten)]
    pub violation: Violation,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.violation;
        match v.constraint {
            Constraint::MaxLeaseHours => write!(
                f,
                "ACL '{}' ({}) entry {}: lease of {}h exceeds {} of {}h",
                self.acl_name, self.acl_id, self.entry, v.requested, v.constraint, v.limit
            ),
            _ => write!(
                f,
                "ACL '{}' ({}) entry {}: {} in use + {} requested exceeds {} of {}",
                self.acl_name, self.acl_id, self.entry, v.used, v.requested, v.constraint, v.limit
            ),
        }
    }
}

/// Outcome of an ACL check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Admitted,
    Denied(Denial),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// Per-user counts over one pool
struct PoolUsage {
    size: u64,
    by_user: HashMap<String, u64>,
}

impl PoolUsage {
    fn new(pool: &[PoolMember]) -> Self {
        let mut by_user = HashMap::new();
        for member in pool {
            if let Some(user) = &member.leased_by {
                *by_user.entry(user.clone()).or_insert(0) += 1;
            }
        }
        Self {
            size: pool.len() as u64,
            by_user,
        }
    }

    fn of_user(&self, user: &str) -> u64 {
        self.by_user.get(user).copied().unwrap_or(0)
    }

    fn leased(&self) -> u64 {
        self.by_user.values().sum()
    }
}

/// Hierarchical quota evaluator
#[derive(Clone)]
pub struct AclEvaluator {
    store: Arc<dyn QuotaStore>,
    directory: Arc<dyn Directory>,
    pool: Arc<dyn PoolInventory>,
}

impl AclEvaluator {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        directory: Arc<dyn Directory>,
        pool: Arc<dyn PoolInventory>,
    ) -> Self {
        Self {
            store,
            directory,
            pool,
        }
    }

    /// `acl` followed by each ancestor up to the root.
    pub fn chain(&self, id: AclId) -> AclResult<Vec<Acl>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(id);

        while let Some(current) = next {
            if !seen.insert(current) {
                return Err(AclError::configuration(
                    Some(id),
                    format!("parent chain loops back to ACL {}", current),
                ));
            }
            let acl = match self.store.get(current) {
                Ok(acl) => acl,
                Err(AclError::NotFound { .. }) if current != id => {
                    return Err(AclError::configuration(
                        Some(id),
                        format!("ancestor ACL {} does not exist", current),
                    ))
                }
                Err(e) => return Err(e),
            };
            next = acl.parent;
            chain.push(acl);
        }
        Ok(chain)
    }

    /// Check a request against the ACL chain.
    pub fn check(&self, id: AclId, request: &QuotaRequest<'_>) -> AclResult<Decision> {
        let chain = self.chain(id)?;
        let groups = self.directory.groups_for_user(request.user);

        for acl in &chain {
            if let Some(denial) = self.check_node(acl, &groups, request)? {
                debug!(acl_id = %acl.id, user = request.user, %denial, "quota denied");
                return Ok(Decision::Denied(denial));
            }
        }
        Ok(Decision::Admitted)
    }

    /// Boolean form of [`check`](Self::check).
    pub fn admit(
        &self,
        id: AclId,
        user: &str,
        delta: u64,
        lease_hours: Option<u64>,
    ) -> AclResult<bool> {
        let request = QuotaRequest {
            user,
            delta,
            lease_hours,
        };
        Ok(self.check(id, &request)?.is_admitted())
    }

    /// Number of `names` not already held by `user`, so re-requesting a held
    /// resource is not counted twice.
    pub fn delta_for_resources(&self, id: AclId, user: &str, names: &[String]) -> AclResult<u64> {
        let acl = self.store.get(id)?;
        let pool = self.pool.resources_visible_under(&acl)?;
        let held: HashSet<&str> = pool
            .iter()
            .filter(|m| m.leased_by.as_deref() == Some(user))
            .map(|m| m.name.as_str())
            .collect();

        let requested: HashSet<&str> = names.iter().map(String::as_str).collect();
        Ok(requested.iter().filter(|name| !held.contains(*name)).count() as u64)
    }

    /// Resources counted in the pool of `acl`.
    pub fn pool_of(&self, acl: &Acl) -> AclResult<Vec<PoolMember>> {
        self.pool.resources_visible_under(acl)
    }

    fn check_node(
        &self,
        acl: &Acl,
        groups: &HashSet<String>,
        request: &QuotaRequest<'_>,
    ) -> AclResult<Option<Denial>> {
        let applicable: Vec<_> = acl
            .entries
            .iter()
            .filter(|entry| entry.applies_to(request.user, groups))
            .collect();
        if applicable.is_empty() {
            return Ok(None);
        }

        let pool = PoolUsage::new(&self.pool.resources_visible_under(acl)?);
        let user_usage = pool.of_user(request.user);

        for entry in applicable {
            let group_usage: u64 = match &entry.selector {
                Selector::Group(group) => self
                    .directory
                    .users_in_group(group)
                    .iter()
                    .map(|member| pool.of_user(member))
                    .sum(),
                Selector::Default => pool.leased(),
                Selector::User(_) => 0,
            };
            let usage = EntryUsage {
                pool_size: pool.size,
                user: user_usage,
                group: group_usage,
            };

            if let Some(violation) = entry.check(&usage, request.delta, request.lease_hours) {
                return Ok(Some(Denial {
                    acl_id: acl.id,
                    acl_name: acl.name.clone(),
                    entry: entry.selector.to_string(),
                    violation,
                }));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for AclEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AclEvaluator").finish_non_exhaustive()
    }
}
