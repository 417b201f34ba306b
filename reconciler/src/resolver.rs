//! Resolves local identities to their Bitbucket counterparts and liveness.

use crate::bitbucket::models::{RemoteUser, WorkspaceGroup};
use crate::bitbucket::{BitbucketApi, BitbucketError};
use crate::cache::{AdvisoryCache, CacheError, cache_key};
use crate::metrics_defs::CACHE_WRITE_FAILURES;
use crate::types::{
    ConnectionStatus, LocalGroup, LocalIdentity, LocalUser, PROVIDER_BITBUCKET,
    PROVIDER_BITBUCKET_GROUPS, PendingInvitations,
};
use async_trait::async_trait;
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Cache namespace for remote account profiles.
pub const REMOTE_USER_CACHE: &str = "bitbucket_user";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalAccount {
    /// Account id for users, slug for groups.
    pub id: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when the identity has no linked remote account.
    pub external: Option<ExternalAccount>,
    pub status: ConnectionStatus,
}

impl Resolution {
    fn unlinked(status: ConnectionStatus) -> Self {
        Resolution {
            external: None,
            status,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ResolutionError {
    #[error("could not fetch bitbucket account {account_id}: {source}")]
    Profile {
        account_id: String,
        #[source]
        source: BitbucketError,
    },
}

#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, identity: &LocalIdentity) -> Result<Resolution, ResolutionError>;
}

/// Stores a remote profile in the advisory cache. Failures are logged and dropped.
pub fn cache_remote_user(cache: &dyn AdvisoryCache, ttl: Duration, user: &RemoteUser) {
    let key = cache_key(REMOTE_USER_CACHE, &user.account_id);
    let result = serde_json::to_value(user)
        .map_err(CacheError::from)
        .and_then(|value| cache.set(&key, value, ttl));

    if let Err(e) = result {
        tracing::warn!(key = %key, error = %e, "dropping cache write");
        counter!(CACHE_WRITE_FAILURES).increment(1);
    }
}

/// Resolver for one aggregation call. Holds the pending invitations and the
/// workspace groups fetched for that call.
pub struct IdentityResolver {
    bitbucket: Arc<dyn BitbucketApi>,
    cache: Arc<dyn AdvisoryCache>,
    cache_ttl: Duration,
    pending: PendingInvitations,
    workspace_groups: HashMap<String, WorkspaceGroup>,
}

impl IdentityResolver {
    pub fn new(
        bitbucket: Arc<dyn BitbucketApi>,
        cache: Arc<dyn AdvisoryCache>,
        cache_ttl: Duration,
        pending: PendingInvitations,
    ) -> Self {
        IdentityResolver {
            bitbucket,
            cache,
            cache_ttl,
            pending,
            workspace_groups: HashMap::new(),
        }
    }

    pub fn with_workspace_groups(mut self, groups: Vec<WorkspaceGroup>) -> Self {
        self.workspace_groups = groups
            .into_iter()
            .map(|group| (group.slug.clone(), group))
            .collect();
        self
    }

    async fn resolve_user(&self, user: &LocalUser) -> Result<Resolution, ResolutionError> {
        let Some(account_id) = user.external_account(PROVIDER_BITBUCKET) else {
            let status = if self.pending.contains(&user.email) {
                ConnectionStatus::Pending
            } else {
                ConnectionStatus::NotSynced
            };
            return Ok(Resolution::unlinked(status));
        };

        let remote = self
            .bitbucket
            .get_user(account_id)
            .await
            .map_err(|source| ResolutionError::Profile {
                account_id: account_id.to_string(),
                source,
            })?;
        cache_remote_user(self.cache.as_ref(), self.cache_ttl, &remote);

        let status = live_status(self.bitbucket.as_ref(), account_id).await;

        Ok(Resolution {
            external: Some(ExternalAccount {
                id: account_id.to_string(),
                display_name: remote.display_name,
            }),
            status,
        })
    }

    fn resolve_group(&self, group: &LocalGroup) -> Resolution {
        let Some(slug) = group.connected_group(PROVIDER_BITBUCKET_GROUPS) else {
            return Resolution::unlinked(ConnectionStatus::NotSynced);
        };

        match self.workspace_groups.get(slug) {
            Some(remote) => Resolution {
                external: Some(ExternalAccount {
                    id: remote.slug.clone(),
                    display_name: remote.name.clone(),
                }),
                status: ConnectionStatus::Active,
            },
            None => Resolution {
                external: Some(ExternalAccount {
                    id: slug.to_string(),
                    display_name: String::new(),
                }),
                status: ConnectionStatus::Inactive,
            },
        }
    }
}

/// `Active` when the account is a member of the configured workspace,
/// `Inactive` otherwise or when membership cannot be read.
pub async fn live_status(bitbucket: &dyn BitbucketApi, account_id: &str) -> ConnectionStatus {
    match bitbucket.get_membership(account_id).await {
        Ok(membership) => {
            if !membership.user.account_id.is_empty()
                && membership.workspace.slug != bitbucket.workspace()
            {
                ConnectionStatus::Inactive
            } else {
                ConnectionStatus::Active
            }
        }
        Err(e) => {
            tracing::debug!(account_id, error = %e, "no workspace membership");
            ConnectionStatus::Inactive
        }
    }
}

#[async_trait]
impl Resolve for IdentityResolver {
    async fn resolve(&self, identity: &LocalIdentity) -> Result<Resolution, ResolutionError> {
        match identity {
            LocalIdentity::User(user) => self.resolve_user(user).await,
            LocalIdentity::Group(group) => Ok(self.resolve_group(group)),
        }
    }
}
