//! Matches resolved local identities against a resource's remote ACL.

use crate::bitbucket::models::WorkspaceGroup;
use crate::metrics_defs::RESOLUTION_FAILURES;
use crate::resolver::{Resolution, Resolve};
use crate::types::{
    ConnectionStatus, LocalIdentity, Permission, ReconciledPermission, RemotePermissionEntry,
};
use serde::Serialize;
use shared::counter;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Anything that can appear in an ACL keyed by a remote subject id.
pub trait AclSubject: Send + Sync {
    fn subject_id(&self) -> &str;

    fn subject_name(&self) -> &str;

    fn permission(&self) -> Permission;
}

impl AclSubject for RemotePermissionEntry {
    fn subject_id(&self) -> &str {
        &self.subject_external_id
    }

    fn subject_name(&self) -> &str {
        &self.subject_display_name
    }

    fn permission(&self) -> Permission {
        self.permission
    }
}

impl AclSubject for WorkspaceGroup {
    fn subject_id(&self) -> &str {
        &self.slug
    }

    fn subject_name(&self) -> &str {
        &self.name
    }

    fn permission(&self) -> Permission {
        self.permission.unwrap_or(Permission::None)
    }
}

/// ACL entries sorted by subject id. Lookups are binary searches.
#[derive(Debug)]
pub struct AclIndex<T> {
    entries: Vec<T>,
}

impl<T: AclSubject> AclIndex<T> {
    pub fn new(mut entries: Vec<T>) -> Self {
        entries.sort_by(|a, b| a.subject_id().cmp(b.subject_id()));
        AclIndex { entries }
    }

    pub fn find(&self, subject_id: &str) -> Option<&T> {
        self.entries
            .binary_search_by(|entry| entry.subject_id().cmp(subject_id))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An identity left out of the join.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JoinFailure {
    pub identity_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct JoinOutcome {
    pub permissions: Vec<ReconciledPermission>,
    pub failures: Vec<JoinFailure>,
}

impl JoinOutcome {
    pub fn extend(&mut self, other: JoinOutcome) {
        self.permissions.extend(other.permissions);
        self.failures.extend(other.failures);
    }
}

/// Classifies one identity given its resolution.
pub fn reconcile<T: AclSubject>(
    identity: &LocalIdentity,
    resolution: Resolution,
    index: &AclIndex<T>,
) -> ReconciledPermission {
    let mut record = ReconciledPermission {
        subject_type: identity.subject_type(),
        display_name: String::new(),
        external_id: String::new(),
        permission: None,
        local_identity_id: identity.id().to_string(),
        local_display_name: identity.display_name().to_string(),
        email: identity.email().map(str::to_string),
        exists: false,
        connection_status: resolution.status,
    };

    let Some(external) = resolution.external else {
        return record;
    };

    let entry = index.find(&external.id);
    record.display_name = match entry {
        Some(entry) if external.display_name.is_empty() => entry.subject_name().to_string(),
        _ => external.display_name,
    };
    record.external_id = external.id;
    record.permission = entry.map(AclSubject::permission);

    match entry {
        Some(entry) if entry.permission().is_granted() => {
            record.exists = true;
        }
        _ => {
            record.connection_status = match resolution.status {
                ConnectionStatus::Active => ConnectionStatus::NotSynced,
                _ => ConnectionStatus::Deactivated,
            };
        }
    }

    record
}

pub struct Joiner {
    workers: usize,
}

impl Joiner {
    /// `worker_multiplier` times the available parallelism.
    pub fn new(worker_multiplier: usize) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self::with_workers(worker_multiplier * parallelism)
    }

    pub fn with_workers(workers: usize) -> Self {
        Joiner {
            workers: workers.max(1),
        }
    }

    /// Workers used for a batch. Never more than there are identities.
    pub fn worker_count(&self, identities: usize) -> usize {
        self.workers.min(identities).max(1)
    }

    /// Resolves and classifies every identity concurrently. Each identity ends
    /// up either in `permissions` or in `failures`, never both. Output order
    /// is unspecified.
    pub async fn join<T>(
        &self,
        resolver: Arc<dyn Resolve>,
        identities: Vec<LocalIdentity>,
        index: Arc<AclIndex<T>>,
    ) -> JoinOutcome
    where
        T: AclSubject + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.worker_count(identities.len())));
        let mut join_set = JoinSet::new();
        let mut pending = HashMap::new();

        for identity in identities {
            let identity_id = identity.id().to_string();
            let resolver = resolver.clone();
            let index = index.clone();
            let semaphore = semaphore.clone();

            let handle = join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| JoinFailure {
                    identity_id: identity.id().to_string(),
                    reason: e.to_string(),
                })?;

                match resolver.resolve(&identity).await {
                    Ok(resolution) => Ok(reconcile(&identity, resolution, &index)),
                    Err(e) => Err(JoinFailure {
                        identity_id: identity.id().to_string(),
                        reason: e.to_string(),
                    }),
                }
            });
            pending.insert(handle.id(), identity_id);
        }

        let mut outcome = JoinOutcome::default();

        while let Some(join_result) = join_set.join_next_with_id().await {
            match join_result {
                Ok((task_id, Ok(permission))) => {
                    pending.remove(&task_id);
                    outcome.permissions.push(permission);
                }
                Ok((task_id, Err(failure))) => {
                    pending.remove(&task_id);
                    tracing::warn!(
                        identity_id = %failure.identity_id,
                        reason = %failure.reason,
                        "skipping identity"
                    );
                    counter!(RESOLUTION_FAILURES).increment(1);
                    outcome.failures.push(failure);
                }
                Err(e) => {
                    tracing::error!("Task panicked: {}", e);
                    if let Some(identity_id) = pending.remove(&e.id()) {
                        counter!(RESOLUTION_FAILURES).increment(1);
                        outcome.failures.push(JoinFailure {
                            identity_id,
                            reason: "resolution task panicked".to_string(),
                        });
                    }
                }
            }
        }

        outcome
    }
}
