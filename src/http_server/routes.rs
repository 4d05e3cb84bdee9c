//! # Admission Routes
//!
//! REST API endpoints for leasing, ACL management and diagnostics.
//!
//! The admission core is synchronous and may block on the resource table
//! lock or the replica, so every handler runs it on the blocking pool.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::acl::{AclRef, NewAcl, UpdateAcl};
use crate::admission::{
    AdmissionError, AdmissionResult, AdmissionService, AllocateRequest, Allocation, Committed,
    ErrorResponse,
};
use crate::resources::{JobId, ReleaseTarget, ResourceStatus};

/// Shared handler state
#[derive(Clone)]
pub struct AdmissionState {
    service: Arc<AdmissionService>,
}

impl AdmissionState {
    pub fn new(service: Arc<AdmissionService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<AdmissionService> {
        &self.service
    }

    /// Run a core call on the blocking pool.
    async fn run<T, F>(&self, call: F) -> Result<T, Response>
    where
        F: FnOnce(&AdmissionService) -> AdmissionResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service.clone();
        match tokio::task::spawn_blocking(move || call(service.as_ref())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(error_response(e)),
            Err(e) => {
                tracing::error!(error = %e, "admission task failed");
                Err(json_error(ErrorResponse::new(
                    "Admission task failed",
                    "INTERNAL_ERROR",
                    500,
                )))
            }
        }
    }
}

/// Build admission routes
pub fn admission_routes(state: Arc<AdmissionState>) -> Router {
    Router::new()
        // Leasing
        .route("/v1/allocate", get(allocate_query).post(allocate_json))
        .route("/v1/release", delete(release_query).post(release_json))
        // ACL management
        .route("/v1/acls", get(list_acls).post(create_acl))
        .route("/v1/acls/:id", get(get_acl).patch(update_acl).delete(remove_acl))
        .route("/v1/acls/:id/check", get(check_quota))
        // Resources
        .route("/v1/resources", get(list_resources))
        .route("/v1/resources/:name", get(get_resource))
        // Diagnostics
        .route("/v1/replication/status", get(replication_status))
        .with_state(state)
}

async fn allocate_query(
    State(state): State<Arc<AdmissionState>>,
    Query(request): Query<AllocateRequest>,
) -> Response {
    allocate(state, request).await
}

async fn allocate_json(
    State(state): State<Arc<AdmissionState>>,
    Json(request): Json<AllocateRequest>,
) -> Response {
    allocate(state, request).await
}

async fn allocate(state: Arc<AdmissionState>, request: AllocateRequest) -> Response {
    let committed = match state.run(move |service| service.allocate(&request)).await {
        Ok(committed) => committed,
        Err(response) => return response,
    };

    match &committed.value {
        Allocation::Leased(_) => committed_response(StatusCode::CREATED, committed),
        Allocation::Denied(denial) => json_error(
            ErrorResponse::new(denial.to_string(), "QUOTA_DENIED", 429).with_details(&committed.value),
        ),
        Allocation::NoneAvailable { resource_type, .. } => json_error(
            ErrorResponse::new(
                format!("No idle '{}' resources available", resource_type),
                "NONE_AVAILABLE",
                409,
            )
            .with_details(&committed.value),
        ),
    }
}

/// Release by job or by resource name
#[derive(Debug, Deserialize)]
pub struct ReleaseParams {
    job: Option<JobId>,
    name: Option<String>,
}

impl ReleaseParams {
    fn target(self) -> Result<ReleaseTarget, AdmissionError> {
        match (self.job, self.name) {
            (Some(job), None) => Ok(ReleaseTarget::Job(job)),
            (None, Some(name)) => Ok(ReleaseTarget::Name(name)),
            _ => Err(AdmissionError::invalid("exactly one of 'job' or 'name' is required")),
        }
    }
}

async fn release_query(
    State(state): State<Arc<AdmissionState>>,
    Query(params): Query<ReleaseParams>,
) -> Response {
    release(state, params).await
}

async fn release_json(
    State(state): State<Arc<AdmissionState>>,
    Json(params): Json<ReleaseParams>,
) -> Response {
    release(state, params).await
}

async fn release(state: Arc<AdmissionState>, params: ReleaseParams) -> Response {
    let target = match params.target() {
        Ok(target) => target,
        Err(e) => return error_response(e),
    };
    match state.run(move |service| service.release(&target)).await {
        Ok(committed) => committed_response(StatusCode::OK, committed),
        Err(response) => response,
    }
}

/// ACL listing filters
#[derive(Debug, Deserialize)]
pub struct ListAclsQuery {
    /// Filter by owner
    owner: Option<String>,
    /// Limit results
    limit: Option<usize>,
    /// Offset for pagination
    offset: Option<usize>,
}

async fn list_acls(
    State(state): State<Arc<AdmissionState>>,
    Query(params): Query<ListAclsQuery>,
) -> Response {
    let owner = params.owner;
    match state.run(move |service| service.list_acls(owner.as_deref())).await {
        Ok(acls) => {
            let offset = params.offset.unwrap_or(0);
            let limit = params.limit.unwrap_or(100).min(1000);
            let page: Vec<_> = acls.into_iter().skip(offset).take(limit).collect();
            (StatusCode::OK, Json(page)).into_response()
        }
        Err(response) => response,
    }
}

async fn create_acl(
    State(state): State<Arc<AdmissionState>>,
    Json(request): Json<NewAcl>,
) -> Response {
    match state.run(move |service| service.create_acl(request)).await {
        Ok(committed) => committed_response(StatusCode::CREATED, committed),
        Err(response) => response,
    }
}

async fn get_acl(State(state): State<Arc<AdmissionState>>, Path(id): Path<String>) -> Response {
    let acl = AclRef::parse(&id);
    match state.run(move |service| service.get_acl(&acl)).await {
        Ok(acl) => (StatusCode::OK, Json(acl)).into_response(),
        Err(response) => response,
    }
}

async fn update_acl(
    State(state): State<Arc<AdmissionState>>,
    Path(id): Path<String>,
    Json(update): Json<UpdateAcl>,
) -> Response {
    let acl = AclRef::parse(&id);
    match state.run(move |service| service.update_acl(&acl, update)).await {
        Ok(committed) => committed_response(StatusCode::OK, committed),
        Err(response) => response,
    }
}

async fn remove_acl(State(state): State<Arc<AdmissionState>>, Path(id): Path<String>) -> Response {
    let acl = AclRef::parse(&id);
    match state.run(move |service| service.remove_acl(&acl)).await {
        Ok(committed) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            if let Some(lag) = &committed.replica_warning {
                add_warning(&mut response, &lag.to_string());
            }
            response
        }
        Err(response) => response,
    }
}

/// Quota dry-run parameters
#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    user: String,
    #[serde(default = "default_count")]
    count: u32,
    lease_hours: Option<u64>,
    /// Comma-separated resource names; overrides `count`
    resources: Option<String>,
}

fn default_count() -> u32 {
    1
}

async fn check_quota(
    State(state): State<Arc<AdmissionState>>,
    Path(id): Path<String>,
    Query(params): Query<CheckQuery>,
) -> Response {
    let acl = AclRef::parse(&id);
    let names: Vec<String> = params
        .resources
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    match state
        .run(move |service| {
            service.check_quota(&acl, &params.user, params.count, params.lease_hours, &names)
        })
        .await
    {
        Ok(check) => (StatusCode::OK, Json(check)).into_response(),
        Err(response) => response,
    }
}

/// Resource listing filters
#[derive(Debug, Deserialize)]
pub struct ListResourcesQuery {
    #[serde(rename = "type")]
    resource_type: Option<String>,
    status: Option<ResourceStatus>,
}

async fn list_resources(
    State(state): State<Arc<AdmissionState>>,
    Query(params): Query<ListResourcesQuery>,
) -> Response {
    match state
        .run(move |service| service.list_resources(params.resource_type.as_deref(), params.status))
        .await
    {
        Ok(resources) => (StatusCode::OK, Json(resources)).into_response(),
        Err(response) => response,
    }
}

async fn get_resource(
    State(state): State<Arc<AdmissionState>>,
    Path(name): Path<String>,
) -> Response {
    match state.run(move |service| service.get_resource(&name)).await {
        Ok(resource) => (StatusCode::OK, Json(resource)).into_response(),
        Err(response) => response,
    }
}

async fn replication_status(State(state): State<Arc<AdmissionState>>) -> Response {
    match state.run(|service| service.replication_status()).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(response) => response,
    }
}

/// Serialize a committed result, flagging replica lag in a `Warning` header.
fn committed_response<T: Serialize>(status: StatusCode, committed: Committed<T>) -> Response {
    let warning = committed.replica_warning.as_ref().map(ToString::to_string);
    let mut response = (status, Json(committed)).into_response();
    if let Some(warning) = warning {
        add_warning(&mut response, &warning);
    }
    response
}

fn add_warning(response: &mut Response, text: &str) {
    let value = format!("199 labgate \"{}\"", text.replace('"', "'"));
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(header::WARNING, value);
    }
}

fn json_error(error: ErrorResponse) -> Response {
    let status = StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error)).into_response()
}

/// Convert error to HTTP response
fn error_response(err: AdmissionError) -> Response {
    json_error(ErrorResponse::from(err))
}
