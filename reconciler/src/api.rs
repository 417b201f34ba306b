use crate::aggregator::{
    Aggregator, MemberScope, PermissionReport, RemoteUserStatus, ServicePermission,
};
use crate::bitbucket::models::{Project, RemoteUser, Repository, WorkspaceGroup};
use crate::bitbucket::{AclResource, BitbucketError};
use crate::errors::{ReconcilerError, ValidationError};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Workspace and account the service talks to Bitbucket as.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub workspace: String,
    pub username: Option<String>,
}

#[derive(Clone)]
pub struct ApiState {
    pub aggregator: Arc<Aggregator>,
    pub connection: ConnectionInfo,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/groups", get(list_groups))
        .route("/projects", get(list_projects))
        .route("/repositories", get(list_repositories))
        .route("/workspace/users", get(workspace_users))
        .route("/groups/{slug}/members", get(group_members))
        .route("/projects/{key}/permissions", get(project_permissions))
        .route("/repositories/{slug}/permissions", get(repository_permissions))
        .route("/users/{user_id}/permissions", get(user_permissions))
        .route("/bitbucket/users/{account_id}", get(remote_user))
        .route("/invitations/pending", get(pending_invitations))
        .route("/connection", get(connection))
        .with_state(state)
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

#[derive(Deserialize, Debug, Default)]
struct ScopeParams {
    company_id: Option<String>,
    group_id: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct UserParams {
    company_id: Option<String>,
    account_id: Option<String>,
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ValidationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ValidationError::MissingParameter(name))
}

impl TryFrom<ScopeParams> for MemberScope {
    type Error = ValidationError;

    fn try_from(params: ScopeParams) -> Result<Self, Self::Error> {
        Ok(MemberScope {
            company_id: required(params.company_id, "company_id")?,
            group_id: required(params.group_id, "group_id")?,
        })
    }
}

async fn reconcile(
    state: &ApiState,
    resource: AclResource,
    params: ScopeParams,
) -> Result<Json<PermissionReport>, ReconcilerError> {
    let scope = MemberScope::try_from(params)?;
    let report = state.aggregator.aggregate(&resource, &scope).await?;
    Ok(Json(report))
}

async fn group_members(
    State(state): State<ApiState>,
    Path(slug): Path<String>,
    Query(params): Query<ScopeParams>,
) -> Result<Json<PermissionReport>, ReconcilerError> {
    reconcile(&state, AclResource::WorkspaceGroup(slug), params).await
}

async fn project_permissions(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(params): Query<ScopeParams>,
) -> Result<Json<PermissionReport>, ReconcilerError> {
    reconcile(&state, AclResource::Project(key), params).await
}

async fn repository_permissions(
    State(state): State<ApiState>,
    Path(slug): Path<String>,
    Query(params): Query<ScopeParams>,
) -> Result<Json<PermissionReport>, ReconcilerError> {
    reconcile(&state, AclResource::Repository(slug), params).await
}

async fn user_permissions(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(params): Query<UserParams>,
) -> Result<Json<Vec<ServicePermission>>, ReconcilerError> {
    let company_id = required(params.company_id, "company_id")?;
    let account_id = required(params.account_id, "account_id")?;

    let permissions = state
        .aggregator
        .user_permissions(&company_id, &user_id, &account_id)
        .await?;
    Ok(Json(permissions))
}

async fn remote_user(
    State(state): State<ApiState>,
    Path(account_id): Path<String>,
) -> Result<Json<RemoteUserStatus>, ReconcilerError> {
    Ok(Json(state.aggregator.remote_user(&account_id).await?))
}

async fn pending_invitations(
    State(state): State<ApiState>,
) -> Result<Json<Vec<String>>, ReconcilerError> {
    Ok(Json(state.aggregator.pending_invitations().await?))
}

async fn list_groups(
    State(state): State<ApiState>,
) -> Result<Json<Vec<WorkspaceGroup>>, ReconcilerError> {
    Ok(Json(state.aggregator.list_groups().await?))
}

async fn list_projects(
    State(state): State<ApiState>,
) -> Result<Json<Vec<Project>>, ReconcilerError> {
    Ok(Json(state.aggregator.list_projects().await?))
}

async fn list_repositories(
    State(state): State<ApiState>,
) -> Result<Json<Vec<Repository>>, ReconcilerError> {
    Ok(Json(state.aggregator.list_repositories().await?))
}

async fn workspace_users(
    State(state): State<ApiState>,
) -> Result<Json<Vec<RemoteUser>>, ReconcilerError> {
    Ok(Json(state.aggregator.workspace_users().await?))
}

async fn connection(State(state): State<ApiState>) -> Json<ConnectionInfo> {
    Json(state.connection)
}

impl IntoResponse for ReconcilerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReconcilerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcilerError::Bitbucket(BitbucketError::Api { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ReconcilerError::Bitbucket(_) => StatusCode::BAD_GATEWAY,
            ReconcilerError::Directory(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}
