use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Integration slug under which a user's Bitbucket account ids are stored.
pub const PROVIDER_BITBUCKET: &str = "bitbucket";
/// Sub-integration slug linking a local group to a Bitbucket workspace group.
pub const PROVIDER_BITBUCKET_GROUPS: &str = "bitbucket-groups";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
    #[serde(other)]
    None,
}

impl Permission {
    pub fn is_granted(&self) -> bool {
        *self != Permission::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Active,
    NotSynced,
    Pending,
    Deactivated,
    Inactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    User,
    Group,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalUser {
    pub id: String,
    pub email: String,
    pub display_name: String,
    /// Provider slug to the external account ids linked to this user.
    pub external_accounts: HashMap<String, Vec<String>>,
}

impl LocalUser {
    /// The first linked account for `provider`. An empty id counts as unlinked.
    pub fn external_account(&self, provider: &str) -> Option<&str> {
        self.external_accounts
            .get(provider)
            .and_then(|accounts| accounts.first())
            .map(String::as_str)
            .filter(|account| !account.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalGroup {
    pub id: String,
    pub name: String,
    /// Provider slug to the connected external group slug.
    pub sub_integrations: HashMap<String, String>,
}

impl LocalGroup {
    pub fn connected_group(&self, provider: &str) -> Option<&str> {
        self.sub_integrations
            .get(provider)
            .map(String::as_str)
            .filter(|slug| !slug.is_empty())
    }
}

/// A member of a local directory group: either a user or a nested group.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalIdentity {
    User(LocalUser),
    Group(LocalGroup),
}

impl LocalIdentity {
    pub fn id(&self) -> &str {
        match self {
            LocalIdentity::User(user) => &user.id,
            LocalIdentity::Group(group) => &group.id,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            LocalIdentity::User(user) => &user.display_name,
            LocalIdentity::Group(group) => &group.name,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            LocalIdentity::User(user) => Some(&user.email),
            LocalIdentity::Group(_) => None,
        }
    }

    pub fn subject_type(&self) -> SubjectType {
        match self {
            LocalIdentity::User(_) => SubjectType::User,
            LocalIdentity::Group(_) => SubjectType::Group,
        }
    }
}

/// One ACL row as reported by Bitbucket for a group, project or repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RemotePermissionEntry {
    pub subject_type: SubjectType,
    /// Account id for users, slug for groups.
    pub subject_external_id: String,
    pub subject_display_name: String,
    pub permission: Permission,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInvitation {
    pub email: String,
}

/// Emails with an outstanding workspace invitation. Matching ignores case.
#[derive(Clone, Debug, Default)]
pub struct PendingInvitations {
    emails: HashSet<String>,
}

impl PendingInvitations {
    pub fn contains(&self, email: &str) -> bool {
        !email.is_empty() && self.emails.contains(&email.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

impl FromIterator<PendingInvitation> for PendingInvitations {
    fn from_iter<T: IntoIterator<Item = PendingInvitation>>(iter: T) -> Self {
        PendingInvitations {
            emails: iter
                .into_iter()
                .map(|invitation| invitation.email.to_lowercase())
                .collect(),
        }
    }
}

/// Outcome of matching one local identity against a resource's ACL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ReconciledPermission {
    #[serde(rename = "type")]
    pub subject_type: SubjectType,
    /// Name on the Bitbucket side, empty when no account is linked.
    pub display_name: String,
    /// Account id or group slug on the Bitbucket side, empty when no account is linked.
    pub external_id: String,
    pub permission: Option<Permission>,
    pub local_identity_id: String,
    pub local_display_name: String,
    pub email: Option<String>,
    pub exists: bool,
    pub connection_status: ConnectionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_wire_format() {
        let parsed: Vec<Permission> =
            serde_json::from_str(r#"["read", "write", "admin", "none", "create-repo"]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                Permission::Read,
                Permission::Write,
                Permission::Admin,
                Permission::None,
                Permission::None
            ]
        );
        assert!(!Permission::None.is_granted());
        assert!(Permission::Read.is_granted());
    }

    #[test]
    fn test_connection_status_wire_format() {
        let json = serde_json::to_string(&[
            ConnectionStatus::Active,
            ConnectionStatus::NotSynced,
            ConnectionStatus::Pending,
            ConnectionStatus::Deactivated,
            ConnectionStatus::Inactive,
        ])
        .unwrap();
        assert_eq!(
            json,
            r#"["ACTIVE","NOT_SYNCED","PENDING","DEACTIVATED","INACTIVE"]"#
        );
    }

    #[test]
    fn test_external_account_ignores_empty_ids() {
        let mut user = LocalUser {
            id: "u1".into(),
            email: "u1@example.com".into(),
            display_name: "User One".into(),
            external_accounts: HashMap::from([(PROVIDER_BITBUCKET.into(), vec!["".into()])]),
        };
        assert_eq!(user.external_account(PROVIDER_BITBUCKET), None);

        user.external_accounts
            .insert(PROVIDER_BITBUCKET.into(), vec!["abc".into(), "def".into()]);
        assert_eq!(user.external_account(PROVIDER_BITBUCKET), Some("abc"));
        assert_eq!(user.external_account("github"), None);
    }

    #[test]
    fn test_pending_invitations_match_case_insensitively() {
        let pending: PendingInvitations = vec![PendingInvitation {
            email: "Invited@Example.com".into(),
        }]
        .into_iter()
        .collect();

        assert_eq!(pending.len(), 1);
        assert!(pending.contains("invited@example.com"));
        assert!(!pending.contains("other@example.com"));
        assert!(!pending.contains(""));
    }
}
