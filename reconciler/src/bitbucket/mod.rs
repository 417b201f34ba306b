//! Bitbucket Cloud access: ACL listings, account profiles and workspace metadata.

mod client;
pub mod models;

pub use client::BitbucketClient;

use crate::types::{PendingInvitation, RemotePermissionEntry};
use async_trait::async_trait;
use models::{Membership, Project, RemoteUser, Repository, Workspace, WorkspaceGroup};
use std::fmt;

/// A Bitbucket object whose ACL can be reconciled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AclResource {
    /// Members of a workspace group, by group slug.
    WorkspaceGroup(String),
    /// User and group permissions of a project, by project key.
    Project(String),
    /// User and group permissions of a repository, by repository slug.
    Repository(String),
}

impl AclResource {
    pub fn kind(&self) -> &'static str {
        match self {
            AclResource::WorkspaceGroup(_) => "group",
            AclResource::Project(_) => "project",
            AclResource::Repository(_) => "repository",
        }
    }
}

impl fmt::Display for AclResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclResource::WorkspaceGroup(slug) => write!(f, "group#{slug}"),
            AclResource::Project(key) => write!(f, "project#{key}"),
            AclResource::Repository(slug) => write!(f, "repository#{slug}"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BitbucketError {
    #[error("bitbucket responded with {status}: {message}")]
    Api { status: u16, message: String },
    #[error("bitbucket request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("listing did not terminate after {0} pages")]
    TooManyPages(usize),
}

impl BitbucketError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BitbucketError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The configured credentials were rejected.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Remote operations the reconciliation needs. All calls are scoped to the
/// configured workspace.
#[async_trait]
pub trait BitbucketApi: Send + Sync {
    fn workspace(&self) -> &str;

    /// Every ACL entry of `resource`, all pages concatenated in arrival order.
    async fn fetch_all_permissions(
        &self,
        resource: &AclResource,
    ) -> Result<Vec<RemotePermissionEntry>, BitbucketError>;

    async fn get_user(&self, account_id: &str) -> Result<RemoteUser, BitbucketError>;

    async fn get_membership(&self, account_id: &str) -> Result<Membership, BitbucketError>;

    async fn list_groups(&self) -> Result<Vec<WorkspaceGroup>, BitbucketError>;

    async fn list_projects(&self) -> Result<Vec<Project>, BitbucketError>;

    async fn list_repositories(&self) -> Result<Vec<Repository>, BitbucketError>;

    /// Accounts that are members of the workspace, as the member listing
    /// returns them. `account_status` is not part of that listing.
    async fn list_workspace_members(&self) -> Result<Vec<RemoteUser>, BitbucketError>;

    async fn pending_invitations(&self) -> Result<Vec<PendingInvitation>, BitbucketError>;

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, BitbucketError>;

    async fn get_project(&self, key: &str) -> Result<Project, BitbucketError>;

    async fn get_repository(&self, slug: &str) -> Result<Repository, BitbucketError>;
}
