use crate::bitbucket::models::{
    Membership, MembershipUser, MembershipWorkspace, Project, RemoteUser, Repository, Workspace,
    WorkspaceGroup,
};
use crate::bitbucket::{AclResource, BitbucketApi, BitbucketError};
use crate::types::{
    LocalGroup, LocalIdentity, LocalUser, PROVIDER_BITBUCKET, PROVIDER_BITBUCKET_GROUPS,
    PendingInvitation, Permission, RemotePermissionEntry, SubjectType,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// In-process stand-in for the Bitbucket API.
#[derive(Default)]
pub struct FakeBitbucket {
    workspace: String,
    users: HashMap<String, RemoteUser>,
    memberships: HashMap<String, Membership>,
    acls: HashMap<AclResource, Result<Vec<RemotePermissionEntry>, u16>>,
    groups: Vec<WorkspaceGroup>,
    invitations: Vec<PendingInvitation>,
    projects: Vec<Project>,
    repositories: Vec<Repository>,
}

fn not_found(what: &str) -> BitbucketError {
    BitbucketError::Api {
        status: 404,
        message: format!("{what} not found"),
    }
}

impl FakeBitbucket {
    pub fn new(workspace: &str) -> Self {
        FakeBitbucket {
            workspace: workspace.to_string(),
            ..Default::default()
        }
    }

    /// A profile with no workspace membership.
    pub fn with_user(mut self, account_id: &str, display_name: &str) -> Self {
        self.users.insert(
            account_id.to_string(),
            RemoteUser {
                account_id: account_id.to_string(),
                uuid: format!("{{{account_id}}}"),
                display_name: display_name.to_string(),
                nickname: display_name.to_lowercase(),
                account_status: Some("active".to_string()),
            },
        );
        self
    }

    /// A profile that is a member of `workspace`.
    pub fn with_member(self, account_id: &str, display_name: &str, workspace: &str) -> Self {
        let mut fake = self.with_user(account_id, display_name);
        fake.memberships.insert(
            account_id.to_string(),
            Membership {
                user: MembershipUser {
                    account_id: account_id.to_string(),
                },
                workspace: MembershipWorkspace {
                    slug: workspace.to_string(),
                },
            },
        );
        fake
    }

    /// Overrides the `account_status` of a profile added earlier.
    pub fn with_account_status(mut self, account_id: &str, status: &str) -> Self {
        if let Some(user) = self.users.get_mut(account_id) {
            user.account_status = Some(status.to_string());
        }
        self
    }

    pub fn with_acl(mut self, resource: AclResource, entries: Vec<RemotePermissionEntry>) -> Self {
        self.acls.insert(resource, Ok(entries));
        self
    }

    pub fn with_acl_error(mut self, resource: AclResource, status: u16) -> Self {
        self.acls.insert(resource, Err(status));
        self
    }

    pub fn with_groups(mut self, groups: Vec<WorkspaceGroup>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_invitations(mut self, emails: &[&str]) -> Self {
        self.invitations = emails
            .iter()
            .map(|email| PendingInvitation {
                email: email.to_string(),
            })
            .collect();
        self
    }

    pub fn with_project(mut self, key: &str, name: &str) -> Self {
        self.projects.push(Project {
            key: key.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_repository(mut self, slug: &str, name: &str) -> Self {
        self.repositories.push(Repository {
            slug: slug.to_string(),
            name: name.to_string(),
        });
        self
    }
}

#[async_trait]
impl BitbucketApi for FakeBitbucket {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    async fn fetch_all_permissions(
        &self,
        resource: &AclResource,
    ) -> Result<Vec<RemotePermissionEntry>, BitbucketError> {
        match self.acls.get(resource) {
            Some(Ok(entries)) => Ok(entries.clone()),
            Some(Err(status)) => Err(BitbucketError::Api {
                status: *status,
                message: format!("{resource} unavailable"),
            }),
            None => Err(not_found(&resource.to_string())),
        }
    }

    async fn get_user(&self, account_id: &str) -> Result<RemoteUser, BitbucketError> {
        self.users
            .get(account_id)
            .cloned()
            .ok_or_else(|| not_found(account_id))
    }

    async fn get_membership(&self, account_id: &str) -> Result<Membership, BitbucketError> {
        self.memberships
            .get(account_id)
            .cloned()
            .ok_or_else(|| not_found(account_id))
    }

    async fn list_groups(&self) -> Result<Vec<WorkspaceGroup>, BitbucketError> {
        Ok(self.groups.clone())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, BitbucketError> {
        Ok(self.projects.clone())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, BitbucketError> {
        Ok(self.repositories.clone())
    }

    /// Members sorted by account id, without `account_status`.
    async fn list_workspace_members(&self) -> Result<Vec<RemoteUser>, BitbucketError> {
        let mut members: Vec<RemoteUser> = self
            .memberships
            .values()
            .filter(|membership| membership.workspace.slug == self.workspace)
            .filter_map(|membership| self.users.get(&membership.user.account_id))
            .map(|user| RemoteUser {
                account_status: None,
                ..user.clone()
            })
            .collect();
        members.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(members)
    }

    async fn pending_invitations(&self) -> Result<Vec<PendingInvitation>, BitbucketError> {
        Ok(self.invitations.clone())
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, BitbucketError> {
        Ok(vec![Workspace {
            slug: self.workspace.clone(),
            name: self.workspace.clone(),
        }])
    }

    async fn get_project(&self, key: &str) -> Result<Project, BitbucketError> {
        self.projects
            .iter()
            .find(|project| project.key == key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    async fn get_repository(&self, slug: &str) -> Result<Repository, BitbucketError> {
        self.repositories
            .iter()
            .find(|repository| repository.slug == slug)
            .cloned()
            .ok_or_else(|| not_found(slug))
    }
}

pub fn user(id: &str, email: &str, account_id: Option<&str>) -> LocalIdentity {
    let external_accounts = account_id
        .map(|account| HashMap::from([(PROVIDER_BITBUCKET.to_string(), vec![account.to_string()])]))
        .unwrap_or_default();
    LocalIdentity::User(LocalUser {
        id: id.to_string(),
        email: email.to_string(),
        display_name: format!("Local {id}"),
        external_accounts,
    })
}

pub fn group(id: &str, connected_slug: Option<&str>) -> LocalIdentity {
    let sub_integrations = connected_slug
        .map(|slug| HashMap::from([(PROVIDER_BITBUCKET_GROUPS.to_string(), slug.to_string())]))
        .unwrap_or_default();
    LocalIdentity::Group(LocalGroup {
        id: id.to_string(),
        name: format!("Local {id}"),
        sub_integrations,
    })
}

pub fn user_entry(account_id: &str, permission: Permission) -> RemotePermissionEntry {
    RemotePermissionEntry {
        subject_type: SubjectType::User,
        subject_external_id: account_id.to_string(),
        subject_display_name: account_id.to_uppercase(),
        permission,
    }
}

pub fn group_entry(slug: &str, permission: Permission) -> RemotePermissionEntry {
    RemotePermissionEntry {
        subject_type: SubjectType::Group,
        subject_external_id: slug.to_string(),
        subject_display_name: slug.to_uppercase(),
        permission,
    }
}
