//! Wire formats of the Bitbucket endpoints in use.

use crate::types::{Permission, RemotePermissionEntry, SubjectType};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub(crate) struct Page<T> {
    #[serde(default = "Vec::new")]
    pub values: Vec<T>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct AccountRef {
    pub account_id: String,
    pub display_name: String,
}

#[derive(Deserialize)]
pub(crate) struct UserPermissionRow {
    pub permission: Permission,
    #[serde(default)]
    pub user: AccountRef,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct GroupRef {
    pub slug: String,
    pub name: String,
}

#[derive(Deserialize)]
pub(crate) struct GroupPermissionRow {
    pub permission: Permission,
    #[serde(default)]
    pub group: GroupRef,
}

impl From<UserPermissionRow> for RemotePermissionEntry {
    fn from(row: UserPermissionRow) -> Self {
        RemotePermissionEntry {
            subject_type: SubjectType::User,
            subject_external_id: row.user.account_id,
            subject_display_name: row.user.display_name,
            permission: row.permission,
        }
    }
}

impl From<GroupPermissionRow> for RemotePermissionEntry {
    fn from(row: GroupPermissionRow) -> Self {
        RemotePermissionEntry {
            subject_type: SubjectType::Group,
            subject_external_id: row.group.slug,
            subject_display_name: row.group.name,
            permission: row.permission,
        }
    }
}

/// Row of the legacy group member listing.
#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct GroupMemberRow {
    pub account_id: String,
    pub display_name: String,
}

/// Row of the workspace member listing.
#[derive(Deserialize)]
pub(crate) struct WorkspaceMemberRow {
    pub user: RemoteUser,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub account_id: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub account_status: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MembershipUser {
    pub account_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MembershipWorkspace {
    pub slug: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Membership {
    pub user: MembershipUser,
    pub workspace: MembershipWorkspace,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceGroup {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub permission: Option<Permission>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

/// Body Bitbucket returns with non-2xx responses.
#[derive(Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Deserialize)]
pub(crate) struct ErrorDetail {
    pub message: String,
}
