//! # Shared Resources
//!
//! Registry of lab resources and the allocator that leases them out.
//!
//! ## Components
//!
//! - `store`: resource storage with a store-wide table lock
//! - `exclusive`: per-request reentrant hold on that lock
//! - `allocator`: atomic lock/release of resources for jobs
//! - `pool`: ACL pool membership derived from the registry
//! - `errors`: store errors
//!
//! ## Lifecycle
//!
//! Resources are registered by provisioning, move `idle → locked` when leased
//! to a job and `locked → idle` when released. They are never deleted here.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::acl::AclId;

pub mod allocator;
pub mod errors;
pub mod exclusive;
pub mod pool;
pub mod store;

pub use allocator::{LockOutcome, LockRequest, ReleaseTarget, ResourceAllocator};
pub use errors::{StoreError, StoreResult};
pub use exclusive::{ExclusiveSection, SectionGuard};
pub use pool::RegistryPool;
pub use store::{MemoryResourceStore, ResourceStore};

/// Job identifier assigned by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Idle,
    Locked,
}

/// Who holds a locked resource and until when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub job: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leased_by: Option<String>,
    pub leased_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LeaseInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires <= now)
    }
}

/// A shared lab resource
///
/// `lease` is present exactly when `status` is `Locked`; use
/// [`Resource::lock`] and [`Resource::release`] to change either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique name
    pub name: String,
    /// Resource type, e.g. `nfs`, `vlan`, `machine`
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Sites the resource may be used from; `None` means anywhere
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sites: Option<Vec<String>>,
    /// ACL whose pool the resource counts towards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl: Option<AclId>,
    /// Opaque metadata handed to the lease holder
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseInfo>,
}

impl Resource {
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            sites: None,
            acl: None,
            data: serde_json::Value::Null,
            status: ResourceStatus::Idle,
            lease: None,
        }
    }

    pub fn with_sites<I, S>(mut self, sites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sites = Some(sites.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_acl(mut self, acl: AclId) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn is_idle(&self) -> bool {
        self.status == ResourceStatus::Idle
    }

    /// Owning job, present iff locked
    pub fn job(&self) -> Option<JobId> {
        self.lease.as_ref().map(|lease| lease.job)
    }

    /// Whether this resource can serve a request from `site`.
    ///
    /// Unrestricted resources serve any request. Site-restricted resources
    /// only serve requests that name one of their sites.
    pub fn serves_site(&self, site: Option<&str>) -> bool {
        match (&self.sites, site) {
            (None, _) => true,
            (Some(sites), Some(site)) => sites.iter().any(|s| s == site),
            (Some(_), None) => false,
        }
    }

    pub fn lock(&mut self, lease: LeaseInfo) {
        self.status = ResourceStatus::Locked;
        self.lease = Some(lease);
    }

    pub fn release(&mut self) {
        self.status = ResourceStatus::Idle;
        self.lease = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(job: u64) -> LeaseInfo {
        LeaseInfo {
            job: JobId(job),
            leased_by: Some("alice".into()),
            leased_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn test_lock_release_keeps_invariant() {
        let mut resource = Resource::new("nfs01", "nfs");
        assert!(resource.is_idle());
        assert_eq!(resource.job(), None);

        resource.lock(lease(7));
        assert_eq!(resource.status, ResourceStatus::Locked);
        assert_eq!(resource.job(), Some(JobId(7)));

        resource.release();
        assert_eq!(resource, Resource::new("nfs01", "nfs"));
    }

    #[test]
    fn test_site_matching() {
        let anywhere = Resource::new("vlan1", "vlan");
        assert!(anywhere.serves_site(None));
        assert!(anywhere.serves_site(Some("cam")));

        let restricted = Resource::new("vlan2", "vlan").with_sites(["cam", "sv"]);
        assert!(restricted.serves_site(Some("sv")));
        assert!(!restricted.serves_site(Some("bng")));
        assert!(!restricted.serves_site(None));
    }

    #[test]
    fn test_resource_json_shape() {
        let resource = Resource::new("nfs01", "nfs").with_data(serde_json::json!({"path": "/x"}));
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["type"], "nfs");
        assert_eq!(json["status"], "idle");
        assert!(json.get("lease").is_none());
    }
}
