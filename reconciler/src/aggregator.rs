//! Per-request reconciliation of one Bitbucket object against a directory
//! group, plus the single-user views built on the same pieces.

use crate::bitbucket::models::{Project, RemoteUser, Repository, WorkspaceGroup};
use crate::bitbucket::{AclResource, BitbucketApi, BitbucketError};
use crate::cache::{AdvisoryCache, cache_key};
use crate::directory::{
    ConnectedItemKind, Directory, DirectoryError, MemberKind, hydrate_group, hydrate_user,
};
use crate::errors::ReconcilerError;
use crate::joiner::{AclIndex, JoinFailure, JoinOutcome, Joiner};
use crate::metrics_defs::{DANGLING_PERMISSIONS, RECONCILE_DURATION};
use crate::resolver::{
    IdentityResolver, REMOTE_USER_CACHE, Resolve, cache_remote_user, live_status,
};
use crate::types::{
    ConnectionStatus, LocalIdentity, LocalUser, PendingInvitations, Permission,
    ReconciledPermission, RemotePermissionEntry, SubjectType,
};
use indexmap::IndexSet;
use serde::Serialize;
use shared::histogram;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const ACTIVE_ACCOUNT: &str = "active";

/// The directory group whose members are reconciled.
#[derive(Clone, Debug)]
pub struct MemberScope {
    pub company_id: String,
    pub group_id: String,
}

#[derive(Debug, Serialize)]
pub struct PermissionReport {
    pub resource: String,
    pub permissions: Vec<ReconciledPermission>,
    /// Records with `exists == false`.
    pub non_existing: usize,
    /// Granted remote entries that no local identity maps to.
    pub dangling: Vec<RemotePermissionEntry>,
    pub failures: Vec<JoinFailure>,
}

/// One Bitbucket object a user can reach through their directory groups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServicePermission {
    pub service_name: String,
    pub service_id: String,
    pub integration_slug: &'static str,
    pub role: Option<Permission>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemoteUserStatus {
    #[serde(flatten)]
    pub user: RemoteUser,
    pub connection_status: ConnectionStatus,
}

#[derive(Clone, Debug)]
pub struct AggregatorSettings {
    pub cache_ttl: Duration,
    pub worker_multiplier: usize,
    pub resource_workers: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        AggregatorSettings {
            cache_ttl: Duration::from_secs(600),
            worker_multiplier: 4,
            resource_workers: 5,
        }
    }
}

pub struct Aggregator {
    bitbucket: Arc<dyn BitbucketApi>,
    directory: Arc<dyn Directory>,
    cache: Arc<dyn AdvisoryCache>,
    joiner: Joiner,
    cache_ttl: Duration,
    resource_workers: usize,
}

impl Aggregator {
    pub fn new(
        bitbucket: Arc<dyn BitbucketApi>,
        directory: Arc<dyn Directory>,
        cache: Arc<dyn AdvisoryCache>,
        settings: AggregatorSettings,
    ) -> Self {
        Aggregator {
            bitbucket,
            directory,
            cache,
            joiner: Joiner::new(settings.worker_multiplier),
            cache_ttl: settings.cache_ttl,
            resource_workers: settings.resource_workers.max(1),
        }
    }

    pub fn workspace(&self) -> &str {
        self.bitbucket.workspace()
    }

    /// Reconciles the members of `scope` against the ACL of `resource`.
    ///
    /// Fails when the ACL, the pending invitations or the member listing cannot
    /// be fetched. Identities that cannot be hydrated or resolved are reported
    /// in `failures` and the rest of the batch proceeds.
    pub async fn aggregate(
        &self,
        resource: &AclResource,
        scope: &MemberScope,
    ) -> Result<PermissionReport, ReconcilerError> {
        let started = Instant::now();

        let entries = self.bitbucket.fetch_all_permissions(resource).await?;
        let pending: PendingInvitations = self
            .bitbucket
            .pending_invitations()
            .await?
            .into_iter()
            .collect();

        let mut outcome = JoinOutcome::default();
        let users = self.load_members(scope, MemberKind::User, &mut outcome).await?;
        // Workspace group ACLs only list users.
        let groups = match resource {
            AclResource::WorkspaceGroup(_) => Vec::new(),
            _ => {
                self.load_members(scope, MemberKind::Group, &mut outcome)
                    .await?
            }
        };

        let mut resolver = IdentityResolver::new(
            self.bitbucket.clone(),
            self.cache.clone(),
            self.cache_ttl,
            pending,
        );
        if !groups.is_empty() {
            resolver = resolver.with_workspace_groups(self.bitbucket.list_groups().await?);
        }
        let resolver: Arc<dyn Resolve> = Arc::new(resolver);

        let (user_entries, group_entries): (Vec<_>, Vec<_>) = entries
            .iter()
            .cloned()
            .partition(|entry| entry.subject_type == SubjectType::User);

        outcome.extend(
            self.joiner
                .join(resolver.clone(), users, Arc::new(AclIndex::new(user_entries)))
                .await,
        );
        outcome.extend(
            self.joiner
                .join(resolver, groups, Arc::new(AclIndex::new(group_entries)))
                .await,
        );

        let dangling = dangling_entries(&entries, &outcome.permissions);
        let non_existing = outcome
            .permissions
            .iter()
            .filter(|record| !record.exists)
            .count();

        histogram!(RECONCILE_DURATION, "resource" => resource.kind())
            .record(started.elapsed().as_secs_f64());
        histogram!(DANGLING_PERMISSIONS, "resource" => resource.kind())
            .record(dangling.len() as f64);
        tracing::info!(
            %resource,
            company_id = %scope.company_id,
            group_id = %scope.group_id,
            reconciled = outcome.permissions.len(),
            failed = outcome.failures.len(),
            non_existing,
            dangling = dangling.len(),
            "Reconciled resource"
        );

        Ok(PermissionReport {
            resource: resource.to_string(),
            permissions: outcome.permissions,
            non_existing,
            dangling,
            failures: outcome.failures,
        })
    }

    /// Loads and hydrates the members of kind `kind`. Members whose records
    /// cannot be loaded are appended to `outcome.failures`.
    async fn load_members(
        &self,
        scope: &MemberScope,
        kind: MemberKind,
        outcome: &mut JoinOutcome,
    ) -> Result<Vec<LocalIdentity>, ReconcilerError> {
        let members = self
            .directory
            .group_members(&scope.company_id, &scope.group_id, kind)
            .await?;

        let mut identities = Vec::with_capacity(members.len());
        for member in members {
            let hydrated = match kind {
                MemberKind::User => self
                    .load_user(&scope.company_id, &member.member_id)
                    .await
                    .map(LocalIdentity::User),
                MemberKind::Group => self
                    .directory
                    .company_group(&scope.company_id, &member.member_id)
                    .await
                    .map(|group| LocalIdentity::Group(hydrate_group(group))),
            };

            match hydrated {
                Ok(identity) => identities.push(identity),
                Err(e) => {
                    tracing::warn!(
                        member_id = %member.member_id,
                        kind = kind.as_str(),
                        error = %e,
                        "could not load directory member"
                    );
                    outcome.failures.push(JoinFailure {
                        identity_id: member.member_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(identities)
    }

    async fn load_user(
        &self,
        company_id: &str,
        user_id: &str,
    ) -> Result<LocalUser, DirectoryError> {
        let user = self.directory.user_by_id(user_id).await?;
        let member = self.directory.company_member(company_id, user_id).await?;
        Ok(hydrate_user(user, member))
    }

    /// Everything `account_id` can reach in Bitbucket through the directory
    /// groups `user_id` belongs to: workspace groups, then repositories, then
    /// projects.
    pub async fn user_permissions(
        &self,
        company_id: &str,
        user_id: &str,
        account_id: &str,
    ) -> Result<Vec<ServicePermission>, ReconcilerError> {
        let workspace_groups = AclIndex::new(self.bitbucket.list_groups().await?);
        let group_ids = self.directory.user_groups(company_id, user_id).await?;

        let mut connected_groups = IndexSet::new();
        let mut repositories = IndexSet::new();
        let mut projects = IndexSet::new();

        for group_id in &group_ids {
            for kind in [
                ConnectedItemKind::Groups,
                ConnectedItemKind::Repositories,
                ConnectedItemKind::Projects,
            ] {
                let items = match self.directory.connected_items(group_id, kind).await {
                    Ok(items) => items,
                    Err(e) => {
                        tracing::warn!(
                            group_id = %group_id,
                            kind = kind.slug(),
                            error = %e,
                            "skipping connected items"
                        );
                        continue;
                    }
                };
                let target = match kind {
                    ConnectedItemKind::Groups => &mut connected_groups,
                    ConnectedItemKind::Repositories => &mut repositories,
                    ConnectedItemKind::Projects => &mut projects,
                };
                target.extend(items);
            }
        }

        let mut permissions: Vec<ServicePermission> = connected_groups
            .iter()
            .filter_map(|slug| workspace_groups.find(slug))
            .map(|group| ServicePermission {
                service_name: group.name.clone(),
                service_id: group.slug.clone(),
                integration_slug: ConnectedItemKind::Groups.slug(),
                role: group.permission,
            })
            .collect();

        permissions.extend(
            self.resource_permissions(
                repositories.into_iter().map(AclResource::Repository).collect(),
                account_id,
            )
            .await,
        );
        permissions.extend(
            self.resource_permissions(
                projects.into_iter().map(AclResource::Project).collect(),
                account_id,
            )
            .await,
        );

        Ok(permissions)
    }

    /// Looks `account_id` up in the user ACL of every resource, with at most
    /// `resource_workers` fetches in flight. Output keeps the input order.
    async fn resource_permissions(
        &self,
        resources: Vec<AclResource>,
        account_id: &str,
    ) -> Vec<ServicePermission> {
        let semaphore = Arc::new(Semaphore::new(self.resource_workers));
        let mut join_set = JoinSet::new();

        for (position, resource) in resources.into_iter().enumerate() {
            let bitbucket = self.bitbucket.clone();
            let semaphore = semaphore.clone();
            let account_id = account_id.to_string();

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        user_grant(bitbucket.as_ref(), &resource, &account_id).await
                    }
                    Err(e) => {
                        tracing::error!("Semaphore closed: {}", e);
                        Ok(None)
                    }
                };
                (position, resource, result)
            });
        }

        let mut found = Vec::new();
        while let Some(join_result) = join_set.join_next().await {
            match join_result {
                Ok((position, _, Ok(Some(permission)))) => found.push((position, permission)),
                Ok((_, _, Ok(None))) => {}
                Ok((_, resource, Err(e))) => {
                    tracing::warn!(%resource, error = %e, "skipping resource");
                }
                Err(e) => tracing::error!("Task panicked: {}", e),
            }
        }

        found.sort_by_key(|(position, _)| *position);
        found.into_iter().map(|(_, permission)| permission).collect()
    }

    /// The remote profile of `account_id` with its workspace liveness. The
    /// profile is served from the advisory cache when present.
    pub async fn remote_user(&self, account_id: &str) -> Result<RemoteUserStatus, ReconcilerError> {
        let key = cache_key(REMOTE_USER_CACHE, account_id);
        let cached = self
            .cache
            .get(&key)
            .and_then(|value| serde_json::from_value::<RemoteUser>(value).ok());

        let user = match cached {
            Some(user) => user,
            None => {
                let user = self.bitbucket.get_user(account_id).await?;
                cache_remote_user(self.cache.as_ref(), self.cache_ttl, &user);
                user
            }
        };
        let connection_status = live_status(self.bitbucket.as_ref(), account_id).await;

        Ok(RemoteUserStatus {
            user,
            connection_status,
        })
    }

    pub async fn list_groups(&self) -> Result<Vec<WorkspaceGroup>, ReconcilerError> {
        Ok(self.bitbucket.list_groups().await?)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ReconcilerError> {
        Ok(self.bitbucket.list_projects().await?)
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>, ReconcilerError> {
        Ok(self.bitbucket.list_repositories().await?)
    }

    /// Workspace members whose account is active, in listing order. Profiles
    /// are fetched with at most `resource_workers` requests in flight, and a
    /// member whose profile cannot be fetched is left out.
    pub async fn workspace_users(&self) -> Result<Vec<RemoteUser>, ReconcilerError> {
        let members = self.bitbucket.list_workspace_members().await?;
        let semaphore = Arc::new(Semaphore::new(self.resource_workers));
        let mut join_set = JoinSet::new();

        for (position, member) in members.into_iter().enumerate() {
            let bitbucket = self.bitbucket.clone();
            let semaphore = semaphore.clone();

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => bitbucket.get_user(&member.account_id).await,
                    Err(e) => {
                        tracing::error!("Semaphore closed: {}", e);
                        return (position, member.account_id, None);
                    }
                };
                (position, member.account_id, Some(result))
            });
        }

        let mut active = Vec::new();
        while let Some(join_result) = join_set.join_next().await {
            match join_result {
                Ok((position, _, Some(Ok(user)))) => {
                    cache_remote_user(self.cache.as_ref(), self.cache_ttl, &user);
                    if user.account_status.as_deref() == Some(ACTIVE_ACCOUNT) {
                        active.push((position, user));
                    }
                }
                Ok((_, account_id, Some(Err(e)))) => {
                    tracing::warn!(account_id, error = %e, "skipping workspace member");
                }
                Ok((_, _, None)) => {}
                Err(e) => tracing::error!("Task panicked: {}", e),
            }
        }

        active.sort_by_key(|(position, _)| *position);
        Ok(active.into_iter().map(|(_, user)| user).collect())
    }

    pub async fn pending_invitations(&self) -> Result<Vec<String>, ReconcilerError> {
        Ok(self
            .bitbucket
            .pending_invitations()
            .await?
            .into_iter()
            .map(|invitation| invitation.email)
            .collect())
    }
}

/// The permission `account_id` holds on `resource`, if any.
async fn user_grant(
    bitbucket: &dyn BitbucketApi,
    resource: &AclResource,
    account_id: &str,
) -> Result<Option<ServicePermission>, BitbucketError> {
    let entries: Vec<RemotePermissionEntry> = bitbucket
        .fetch_all_permissions(resource)
        .await?
        .into_iter()
        .filter(|entry| entry.subject_type == SubjectType::User)
        .collect();
    let index = AclIndex::new(entries);

    let Some(entry) = index.find(account_id) else {
        return Ok(None);
    };
    if !entry.permission.is_granted() {
        return Ok(None);
    }

    let (service_id, service_name, integration_slug) = match resource {
        AclResource::Repository(slug) => {
            let name = bitbucket.get_repository(slug).await.map(|repo| repo.name);
            (slug, name, ConnectedItemKind::Repositories.slug())
        }
        AclResource::Project(key) => {
            let name = bitbucket.get_project(key).await.map(|project| project.name);
            (key, name, ConnectedItemKind::Projects.slug())
        }
        AclResource::WorkspaceGroup(slug) => {
            (slug, Ok(slug.clone()), ConnectedItemKind::Groups.slug())
        }
    };

    Ok(Some(ServicePermission {
        // The ACL already answered; a missing name is not worth failing for.
        service_name: service_name.unwrap_or_else(|_| service_id.clone()),
        service_id: service_id.clone(),
        integration_slug,
        role: Some(entry.permission),
    }))
}

fn dangling_entries(
    entries: &[RemotePermissionEntry],
    reconciled: &[ReconciledPermission],
) -> Vec<RemotePermissionEntry> {
    let matched: HashSet<(SubjectType, &str)> = reconciled
        .iter()
        .filter(|record| record.exists)
        .map(|record| (record.subject_type, record.external_id.as_str()))
        .collect();

    entries
        .iter()
        .filter(|entry| entry.permission.is_granted())
        .filter(|entry| {
            !matched.contains(&(entry.subject_type, entry.subject_external_id.as_str()))
        })
        .cloned()
        .collect()
}
