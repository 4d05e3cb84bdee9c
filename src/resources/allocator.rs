//! # Resource Allocator
//!
//! Atomic check-then-lock of idle resources for jobs.
//!
//! Every operation runs inside an [`ExclusiveSection`]. Callers that need a
//! wider atomic scope (quota check followed by lock) pass their own section;
//! the allocator enters it again, which nests instead of re-locking.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::errors::{StoreError, StoreResult};
use super::exclusive::ExclusiveSection;
use super::store::ResourceStore;
use super::{JobId, LeaseInfo, Resource};

/// Longest lease the allocator will record (ten years).
pub const MAX_LEASE_HOURS: u64 = 24 * 365 * 10;

/// What to lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub resource_type: String,
    pub site: Option<String>,
    pub job: JobId,
    /// Number of resources wanted (default: 1)
    pub count: u32,
    /// User the lease is recorded against
    pub leased_by: Option<String>,
    pub lease_hours: Option<u64>,
    /// Restrict candidates to these names
    pub within: Option<BTreeSet<String>>,
}

impl LockRequest {
    pub fn new(resource_type: impl Into<String>, job: JobId) -> Self {
        Self {
            resource_type: resource_type.into(),
            site: None,
            job,
            count: 1,
            leased_by: None,
            lease_hours: None,
            within: None,
        }
    }

    pub fn at_site(mut self, site: Option<String>) -> Self {
        self.site = site;
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn leased_by(mut self, user: impl Into<String>) -> Self {
        self.leased_by = Some(user.into());
        self
    }

    pub fn lease_hours(mut self, hours: Option<u64>) -> Self {
        self.lease_hours = hours;
        self
    }

    pub fn within<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.within = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn matches(&self, resource: &Resource) -> bool {
        resource.is_idle()
            && resource.resource_type == self.resource_type
            && resource.serves_site(self.site.as_deref())
            && self
                .within
                .as_ref()
                .map_or(true, |names| names.contains(&resource.name))
    }
}

/// Result of a lock attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LockOutcome {
    /// Every requested resource was locked, lowest name first
    Locked { resources: Vec<Resource> },
    /// Fewer than `requested` idle resources matched; nothing was locked
    NoneAvailable {
        resource_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        site: Option<String>,
        requested: u32,
        available: u32,
    },
}

/// Which leases to end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTarget {
    /// Every resource held by the job
    Job(JobId),
    /// One resource by name
    Name(String),
}

/// Atomic allocator over a resource store
#[derive(Clone)]
pub struct ResourceAllocator {
    store: Arc<dyn ResourceStore>,
}

impl ResourceAllocator {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Fresh exclusive section over this allocator's store.
    pub fn section(&self) -> ExclusiveSection<'_> {
        ExclusiveSection::new(self.store.as_ref())
    }

    /// Lock one idle resource of `resource_type` usable from `site`.
    pub fn lock(
        &self,
        section: &ExclusiveSection<'_>,
        resource_type: &str,
        site: Option<&str>,
        job: JobId,
    ) -> StoreResult<Option<Resource>> {
        let request = LockRequest::new(resource_type, job).at_site(site.map(str::to_string));
        match self.lock_many(section, &request)? {
            LockOutcome::Locked { mut resources } => Ok(resources.pop()),
            LockOutcome::NoneAvailable { .. } => Ok(None),
        }
    }

    /// Lock `request.count` resources, all or nothing.
    pub fn lock_many(
        &self,
        section: &ExclusiveSection<'_>,
        request: &LockRequest,
    ) -> StoreResult<LockOutcome> {
        let guard = section.enter()?;

        let candidates: Vec<Resource> = self
            .store
            .list()?
            .into_iter()
            .filter(|resource| request.matches(resource))
            .collect();
        let wanted = request.count as usize;

        if wanted == 0 || candidates.len() < wanted {
            debug!(
                resource_type = %request.resource_type,
                site = ?request.site,
                requested = request.count,
                available = candidates.len(),
                "no matching idle resources"
            );
            guard.finish()?;
            return Ok(LockOutcome::NoneAvailable {
                resource_type: request.resource_type.clone(),
                site: request.site.clone(),
                requested: request.count,
                available: candidates.len() as u32,
            });
        }

        let now = Utc::now();
        let lease = LeaseInfo {
            job: request.job,
            leased_by: request.leased_by.clone(),
            leased_at: now,
            expires_at: request
                .lease_hours
                .map(|hours| now + Duration::hours(hours.min(MAX_LEASE_HOURS) as i64)),
        };

        let mut locked = Vec::with_capacity(wanted);
        for mut resource in candidates.into_iter().take(wanted) {
            resource.lock(lease.clone());
            self.store.update(resource.clone())?;
            locked.push(resource);
        }
        guard.finish()?;

        info!(
            job = %request.job,
            resources = ?locked.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            "Resources locked"
        );
        Ok(LockOutcome::Locked { resources: locked })
    }

    /// Return leased resources to idle. Releasing an idle resource, or a job
    /// holding nothing, changes nothing.
    pub fn release(
        &self,
        section: &ExclusiveSection<'_>,
        target: &ReleaseTarget,
    ) -> StoreResult<Vec<Resource>> {
        let guard = section.enter()?;

        let held: Vec<Resource> = match target {
            ReleaseTarget::Job(job) => self
                .store
                .list()?
                .into_iter()
                .filter(|resource| resource.job() == Some(*job))
                .collect(),
            ReleaseTarget::Name(name) => {
                let resource = self.store.get(name)?;
                if resource.is_idle() {
                    Vec::new()
                } else {
                    vec![resource]
                }
            }
        };

        let released = self.release_each(held)?;
        guard.finish()?;

        if !released.is_empty() {
            info!(release = ?target, count = released.len(), "Resources released");
        }
        Ok(released)
    }

    /// Release every lease that expired at or before `now`.
    pub fn release_expired(
        &self,
        section: &ExclusiveSection<'_>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Resource>> {
        let guard = section.enter()?;

        let expired: Vec<Resource> = self
            .store
            .list()?
            .into_iter()
            .filter(|resource| {
                resource
                    .lease
                    .as_ref()
                    .map_or(false, |lease| lease.is_expired(now))
            })
            .collect();

        let released = self.release_each(expired)?;
        guard.finish()?;

        if !released.is_empty() {
            info!(count = released.len(), "Expired leases released");
        }
        Ok(released)
    }

    pub fn list(&self) -> StoreResult<Vec<Resource>> {
        self.store.list()
    }

    pub fn get(&self, name: &str) -> StoreResult<Resource> {
        self.store.get(name)
    }

    /// Register a resource with the underlying store.
    pub fn register(&self, resource: Resource) -> StoreResult<Resource> {
        if !resource.is_idle() {
            return Err(StoreError::Invalid {
                name: resource.name,
                reason: "New resources must be idle".to_string(),
            });
        }
        self.store.insert(resource)
    }

    fn release_each(&self, resources: Vec<Resource>) -> StoreResult<Vec<Resource>> {
        let mut released = Vec::with_capacity(resources.len());
        for mut resource in resources {
            resource.release();
            self.store.update(resource.clone())?;
            released.push(resource);
        }
        Ok(released)
    }
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator").finish_non_exhaustive()
    }
}
