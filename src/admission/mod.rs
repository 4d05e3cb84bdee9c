//! # Admission Control
//!
//! Entry point for every lease request. An allocation runs the ACL check and
//! the resource lock inside one exclusive section, commits, then waits for the
//! read replica so the caller can read back what it was given.
//!
//! ## Outcomes
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `Leased` | Resources locked for the job and committed |
//! | `Denied` | A quota entry somewhere on the ACL chain refused the request |
//! | `NoneAvailable` | Quota allowed it but too few idle resources matched |
//!
//! A replica that falls behind never turns a committed lease into an error;
//! the result carries a `replica_warning` instead.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub mod errors;

pub use errors::{AdmissionError, AdmissionResult, ErrorResponse};

use crate::acl::{
    Acl, AclError, AclEvaluator, AclId, AclRef, Decision, Denial, NewAcl, QuotaRequest,
    QuotaStore, UpdateAcl,
};
use crate::observability::{admission_span, policy_span, SlowRequestTracker};
use crate::replication::{GateError, ReplicaLag, ReplicationGate, ReplicationStatus};
use crate::resources::allocator::MAX_LEASE_HOURS;
use crate::resources::{
    JobId, LockOutcome, LockRequest, ReleaseTarget, Resource, ResourceAllocator, ResourceStatus,
};

fn default_count() -> u32 {
    1
}

/// Request to lease resources for a job
#[derive(Debug, Clone, Deserialize)]
pub struct AllocateRequest {
    /// ACL to charge, by id or name
    pub acl: AclRef,
    pub user: String,
    #[serde(alias = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub lease_hours: Option<u64>,
    pub job: JobId,
}

impl AllocateRequest {
    pub fn new(acl: AclRef, user: impl Into<String>, resource_type: impl Into<String>, job: JobId) -> Self {
        Self {
            acl,
            user: user.into(),
            resource_type: resource_type.into(),
            site: None,
            count: 1,
            lease_hours: None,
            job,
        }
    }

    fn validate(&self) -> AdmissionResult<()> {
        if self.user.trim().is_empty() {
            return Err(AdmissionError::invalid("user must not be empty"));
        }
        if self.resource_type.trim().is_empty() {
            return Err(AdmissionError::invalid("resource_type must not be empty"));
        }
        if self.count == 0 {
            return Err(AdmissionError::invalid("count must be at least 1"));
        }
        if let Some(hours) = self.lease_hours {
            if hours == 0 || hours > MAX_LEASE_HOURS {
                return Err(AdmissionError::invalid(format!(
                    "lease_hours must be between 1 and {}",
                    MAX_LEASE_HOURS
                )));
            }
        }
        Ok(())
    }
}

/// A granted lease
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub job: JobId,
    pub acl_id: AclId,
    pub user: String,
    pub resources: Vec<Resource>,
    pub leased_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of an allocation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Allocation {
    Leased(Lease),
    Denied(Denial),
    NoneAvailable {
        resource_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        site: Option<String>,
        requested: u32,
        available: u32,
    },
}

/// Resources returned to idle by a release
#[derive(Debug, Clone, Serialize)]
pub struct Released {
    pub released: Vec<Resource>,
}

/// A value whose write has committed, with any replica staleness
#[derive(Debug, Clone, Serialize)]
pub struct Committed<T> {
    #[serde(flatten)]
    pub value: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_warning: Option<ReplicaLag>,
    #[serde(skip)]
    pub replication_wait_ms: u64,
}

impl<T> Committed<T> {
    /// Result of an operation that wrote nothing.
    fn unwritten(value: T) -> Self {
        Self {
            value,
            replica_warning: None,
            replication_wait_ms: 0,
        }
    }
}

/// Outcome of a quota dry run
#[derive(Debug, Clone, Serialize)]
pub struct QuotaCheck {
    pub acl_id: AclId,
    pub user: String,
    /// Resources the request would add to the user's usage
    pub delta: u64,
    #[serde(flatten)]
    pub decision: Decision,
}

/// Admission control service
pub struct AdmissionService {
    acls: Arc<dyn QuotaStore>,
    evaluator: AclEvaluator,
    allocator: ResourceAllocator,
    gate: ReplicationGate,
    slow_requests: SlowRequestTracker,
}

impl AdmissionService {
    pub fn new(
        acls: Arc<dyn QuotaStore>,
        evaluator: AclEvaluator,
        allocator: ResourceAllocator,
        gate: ReplicationGate,
    ) -> Self {
        Self {
            acls,
            evaluator,
            allocator,
            gate,
            slow_requests: SlowRequestTracker::disabled(),
        }
    }

    pub fn with_slow_requests(mut self, tracker: SlowRequestTracker) -> Self {
        self.slow_requests = tracker;
        self
    }

    pub fn gate(&self) -> &ReplicationGate {
        &self.gate
    }

    /// Check quota, lock resources and wait for the replica.
    pub fn allocate(&self, request: &AllocateRequest) -> AdmissionResult<Committed<Allocation>> {
        request.validate()?;
        let _span = admission_span(
            "allocate",
            &request.acl.to_string(),
            &request.user,
            request.job.0,
        )
        .entered();
        let started = Instant::now();
        let acl = self.acls.resolve(&request.acl)?;

        let outcome = {
            let section = self.allocator.section();
            let guard = section.enter()?;

            let quota = QuotaRequest {
                user: &request.user,
                delta: u64::from(request.count),
                lease_hours: request.lease_hours,
            };
            if let Decision::Denied(denial) = self.evaluator.check(acl.id, &quota)? {
                guard.finish()?;
                info!(%denial, "Allocation denied");
                return Ok(Committed::unwritten(Allocation::Denied(denial)));
            }

            let pool = self.evaluator.pool_of(&acl)?;
            let lock = LockRequest::new(&request.resource_type, request.job)
                .at_site(request.site.clone())
                .count(request.count)
                .leased_by(&request.user)
                .lease_hours(request.lease_hours)
                .within(pool.into_iter().map(|member| member.name));
            let outcome = self.allocator.lock_many(&section, &lock)?;
            guard.finish()?;
            outcome
        };

        let result = match outcome {
            LockOutcome::NoneAvailable {
                resource_type,
                site,
                requested,
                available,
            } => {
                info!(requested, available, "No resources available");
                Committed::unwritten(Allocation::NoneAvailable {
                    resource_type,
                    site,
                    requested,
                    available,
                })
            }
            LockOutcome::Locked { resources } => {
                let (leased_at, expires_at) = resources
                    .first()
                    .and_then(|resource| resource.lease.as_ref())
                    .map(|lease| (lease.leased_at, lease.expires_at))
                    .unwrap_or_else(|| (Utc::now(), None));
                let lease = Lease {
                    lease_id: Uuid::new_v4(),
                    job: request.job,
                    acl_id: acl.id,
                    user: request.user.clone(),
                    resources,
                    leased_at,
                    expires_at,
                };
                info!(lease_id = %lease.lease_id, count = lease.resources.len(), "Lease granted");
                self.commit(Allocation::Leased(lease))?
            }
        };

        self.observe("allocate", Some(&acl.name), Some(&request.user), started, &result);
        Ok(result)
    }

    /// Return a job's resources, or one named resource, to idle.
    pub fn release(&self, target: &ReleaseTarget) -> AdmissionResult<Committed<Released>> {
        let started = Instant::now();
        let released = {
            let section = self.allocator.section();
            self.allocator.release(&section, target)?
        };

        let result = if released.is_empty() {
            Committed::unwritten(Released { released })
        } else {
            self.commit(Released { released })?
        };
        self.observe("release", None, None, started, &result);
        Ok(result)
    }

    /// Release every lease past its expiry.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> AdmissionResult<Committed<Released>> {
        let released = {
            let section = self.allocator.section();
            self.allocator.release_expired(&section, now)?
        };

        if released.is_empty() {
            return Ok(Committed::unwritten(Released { released }));
        }
        for resource in &released {
            info!(resource = %resource.name, "Lease expired");
        }
        self.commit(Released { released })
    }

    /// Evaluate quota without locking anything.
    ///
    /// When `names` is non-empty the delta is the number of those resources
    /// the user does not already hold; otherwise it is `count`.
    pub fn check_quota(
        &self,
        acl: &AclRef,
        user: &str,
        count: u32,
        lease_hours: Option<u64>,
        names: &[String],
    ) -> AdmissionResult<QuotaCheck> {
        let acl = self.acls.resolve(acl)?;
        let delta = if names.is_empty() {
            u64::from(count)
        } else {
            self.evaluator.delta_for_resources(acl.id, user, names)?
        };
        let request = QuotaRequest {
            user,
            delta,
            lease_hours,
        };
        let decision = self.evaluator.check(acl.id, &request)?;
        Ok(QuotaCheck {
            acl_id: acl.id,
            user: user.to_string(),
            delta,
            decision,
        })
    }

    pub fn create_acl(&self, request: NewAcl) -> AdmissionResult<Committed<Acl>> {
        let _span = policy_span("create_acl", &request.name).entered();
        let acl = self.acls.insert(request)?;
        self.commit(acl)
    }

    pub fn get_acl(&self, acl: &AclRef) -> AdmissionResult<Acl> {
        Ok(self.acls.resolve(acl)?)
    }

    /// ACLs ordered by id, optionally only those owned by `owner`.
    pub fn list_acls(&self, owner: Option<&str>) -> AdmissionResult<Vec<Acl>> {
        let mut acls = self.acls.list()?;
        if let Some(owner) = owner {
            acls.retain(|acl| acl.owner == owner);
        }
        Ok(acls)
    }

    pub fn update_acl(&self, acl: &AclRef, update: UpdateAcl) -> AdmissionResult<Committed<Acl>> {
        let _span = policy_span("update_acl", &acl.to_string()).entered();
        let id = self.acls.resolve(acl)?.id;
        let acl = self.acls.update(id, update)?;
        self.commit(acl)
    }

    /// Remove an ACL that has no children and no tagged resources.
    pub fn remove_acl(&self, acl: &AclRef) -> AdmissionResult<Committed<Acl>> {
        let _span = policy_span("remove_acl", &acl.to_string()).entered();

        let removed = {
            let section = self.allocator.section();
            let guard = section.enter()?;
            let acl = self.acls.resolve(acl)?;
            let tagged = self
                .allocator
                .list()?
                .iter()
                .filter(|resource| resource.acl == Some(acl.id))
                .count();
            if tagged > 0 {
                return Err(AclError::InUse {
                    acl_id: acl.id,
                    reason: format!("{} resources are tagged with this ACL", tagged),
                }
                .into());
            }
            self.acls.remove(acl.id)?;
            guard.finish()?;
            acl
        };
        self.commit(removed)
    }

    /// Register a new resource, checking its ACL tag exists.
    pub fn register_resource(&self, resource: Resource) -> AdmissionResult<Committed<Resource>> {
        let registered = {
            let section = self.allocator.section();
            let guard = section.enter()?;
            if let Some(id) = resource.acl {
                self.acls.get(id)?;
            }
            let registered = self.allocator.register(resource)?;
            guard.finish()?;
            registered
        };
        self.commit(registered)
    }

    /// Resources ordered by name, optionally filtered.
    pub fn list_resources(
        &self,
        resource_type: Option<&str>,
        status: Option<ResourceStatus>,
    ) -> AdmissionResult<Vec<Resource>> {
        let mut resources = self.allocator.list()?;
        if let Some(resource_type) = resource_type {
            resources.retain(|r| r.resource_type == resource_type);
        }
        if let Some(status) = status {
            resources.retain(|r| r.status == status);
        }
        Ok(resources)
    }

    pub fn get_resource(&self, name: &str) -> AdmissionResult<Resource> {
        Ok(self.allocator.get(name)?)
    }

    pub fn replication_status(&self) -> AdmissionResult<ReplicationStatus> {
        Ok(self.gate.status()?)
    }

    /// Wait for the replica to replay the latest write.
    fn commit<T>(&self, value: T) -> AdmissionResult<Committed<T>> {
        let started = Instant::now();
        let target = self.gate.write_position()?;
        let replica_warning = match self.gate.wait_for_replica(target) {
            Ok(_) => None,
            Err(GateError::ReplicaLagTimeout(lag)) => {
                warn!(%lag, "write committed but replica is behind");
                Some(lag)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Committed {
            value,
            replica_warning,
            replication_wait_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn observe<T>(
        &self,
        operation: &str,
        acl: Option<&str>,
        user: Option<&str>,
        started: Instant,
        result: &Committed<T>,
    ) {
        self.slow_requests.observe(
            operation,
            acl,
            user,
            started.elapsed().as_millis() as u64,
            result.replication_wait_ms,
        );
    }
}

impl std::fmt::Debug for AdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
