//! The company directory: users, groups, nested group membership and the
//! Bitbucket objects connected to each group.

use crate::types::{LocalGroup, LocalUser};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberKind {
    User,
    Group,
}

impl MemberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberKind::User => "user",
            MemberKind::Group => "group",
        }
    }
}

/// Bitbucket object types a directory group can be connected to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectedItemKind {
    Groups,
    Projects,
    Repositories,
}

impl ConnectedItemKind {
    pub fn slug(&self) -> &'static str {
        match self {
            ConnectedItemKind::Groups => "bitbucket-groups",
            ConnectedItemKind::Projects => "bitbucket-projects",
            ConnectedItemKind::Repositories => "bitbucket-repositories",
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GroupMember {
    pub member_id: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DirectoryUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// A user's profile within one company.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompanyMember {
    pub first_name: String,
    pub last_name: String,
    pub associated_accounts: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CompanyGroup {
    pub id: String,
    pub name: String,
    /// Sub-integration slug to the connected external group.
    #[serde(default)]
    pub integrations: HashMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("directory responded with {status} for {path}")]
    Status { status: u16, path: String },
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("could not read directory file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse directory file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn group_members(
        &self,
        company_id: &str,
        group_id: &str,
        kind: MemberKind,
    ) -> Result<Vec<GroupMember>, DirectoryError>;

    async fn user_by_id(&self, user_id: &str) -> Result<DirectoryUser, DirectoryError>;

    async fn company_member(
        &self,
        company_id: &str,
        user_id: &str,
    ) -> Result<CompanyMember, DirectoryError>;

    async fn company_group(
        &self,
        company_id: &str,
        group_id: &str,
    ) -> Result<CompanyGroup, DirectoryError>;

    /// External ids of the `kind` objects connected to a group.
    async fn connected_items(
        &self,
        group_id: &str,
        kind: ConnectedItemKind,
    ) -> Result<Vec<String>, DirectoryError>;

    /// Ids of the company groups `user_id` belongs to.
    async fn user_groups(&self, company_id: &str, user_id: &str)
    -> Result<Vec<String>, DirectoryError>;
}

fn full_name(first: &str, last: &str) -> String {
    format!("{first} {last}").trim().to_string()
}

/// Merges the global user record with the company profile. Company names win
/// when set; the email always comes from the user record.
pub fn hydrate_user(user: DirectoryUser, member: CompanyMember) -> LocalUser {
    let first_name = if member.first_name.is_empty() {
        &user.first_name
    } else {
        &member.first_name
    };
    let last_name = if member.last_name.is_empty() {
        &user.last_name
    } else {
        &member.last_name
    };

    LocalUser {
        display_name: full_name(first_name, last_name),
        id: user.id,
        email: user.email,
        external_accounts: member.associated_accounts,
    }
}

pub fn hydrate_group(group: CompanyGroup) -> LocalGroup {
    LocalGroup {
        id: group.id,
        name: group.name,
        sub_integrations: group.integrations,
    }
}

/// JSON client for the ops service.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpDirectory {
    pub fn new(base_url: Url) -> Self {
        HttpDirectory {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<T, DirectoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);

        let response = self.client.get(url.clone()).query(query).send().await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<T>().await?),
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(url.path().to_string())),
            status => Err(DirectoryError::Status {
                status: status.as_u16(),
                path: url.path().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn group_members(
        &self,
        company_id: &str,
        group_id: &str,
        kind: MemberKind,
    ) -> Result<Vec<GroupMember>, DirectoryError> {
        self.get_json(
            &["companies", company_id, "groups", group_id, "members"],
            &[("type", kind.as_str())],
        )
        .await
    }

    async fn user_by_id(&self, user_id: &str) -> Result<DirectoryUser, DirectoryError> {
        self.get_json(&["users", user_id], &[]).await
    }

    async fn company_member(
        &self,
        company_id: &str,
        user_id: &str,
    ) -> Result<CompanyMember, DirectoryError> {
        self.get_json(&["companies", company_id, "members", user_id], &[])
            .await
    }

    async fn company_group(
        &self,
        company_id: &str,
        group_id: &str,
    ) -> Result<CompanyGroup, DirectoryError> {
        self.get_json(&["companies", company_id, "groups", group_id], &[])
            .await
    }

    async fn connected_items(
        &self,
        group_id: &str,
        kind: ConnectedItemKind,
    ) -> Result<Vec<String>, DirectoryError> {
        self.get_json(&["groups", group_id, "connected-items", kind.slug()], &[])
            .await
    }

    async fn user_groups(
        &self,
        company_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        self.get_json(&["companies", company_id, "users", user_id, "groups"], &[])
            .await
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GroupFixture {
    pub name: String,
    pub integrations: HashMap<String, String>,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub connected_items: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompanyFixture {
    pub members: HashMap<String, CompanyMember>,
    pub groups: BTreeMap<String, GroupFixture>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DirectoryFixture {
    pub users: Vec<DirectoryUser>,
    pub companies: HashMap<String, CompanyFixture>,
}

/// Directory held in memory, loaded from a YAML fixture.
pub struct InMemoryDirectory {
    fixture: DirectoryFixture,
}

impl InMemoryDirectory {
    pub fn new(fixture: DirectoryFixture) -> Self {
        InMemoryDirectory { fixture }
    }

    pub fn from_file(path: &Path) -> Result<Self, DirectoryError> {
        let file = File::open(path)?;
        let fixture = serde_yaml::from_reader(file)?;
        Ok(Self::new(fixture))
    }

    fn company(&self, company_id: &str) -> Result<&CompanyFixture, DirectoryError> {
        self.fixture
            .companies
            .get(company_id)
            .ok_or_else(|| DirectoryError::NotFound(format!("company {company_id}")))
    }

    fn group(&self, company_id: &str, group_id: &str) -> Result<&GroupFixture, DirectoryError> {
        self.company(company_id)?
            .groups
            .get(group_id)
            .ok_or_else(|| DirectoryError::NotFound(format!("group {group_id}")))
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn group_members(
        &self,
        company_id: &str,
        group_id: &str,
        kind: MemberKind,
    ) -> Result<Vec<GroupMember>, DirectoryError> {
        let group = self.group(company_id, group_id)?;
        let ids = match kind {
            MemberKind::User => &group.users,
            MemberKind::Group => &group.groups,
        };
        Ok(ids
            .iter()
            .map(|id| GroupMember {
                member_id: id.clone(),
            })
            .collect())
    }

    async fn user_by_id(&self, user_id: &str) -> Result<DirectoryUser, DirectoryError> {
        self.fixture
            .users
            .iter()
            .find(|user| user.id == user_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("user {user_id}")))
    }

    async fn company_member(
        &self,
        company_id: &str,
        user_id: &str,
    ) -> Result<CompanyMember, DirectoryError> {
        self.company(company_id)?
            .members
            .get(user_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("member {user_id}")))
    }

    async fn company_group(
        &self,
        company_id: &str,
        group_id: &str,
    ) -> Result<CompanyGroup, DirectoryError> {
        let group = self.group(company_id, group_id)?;
        Ok(CompanyGroup {
            id: group_id.to_string(),
            name: group.name.clone(),
            integrations: group.integrations.clone(),
        })
    }

    async fn connected_items(
        &self,
        group_id: &str,
        kind: ConnectedItemKind,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .fixture
            .companies
            .values()
            .find_map(|company| company.groups.get(group_id))
            .and_then(|group| group.connected_items.get(kind.slug()))
            .cloned()
            .unwrap_or_default())
    }

    async fn user_groups(
        &self,
        company_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .company(company_id)?
            .groups
            .iter()
            .filter(|(_, group)| group.users.iter().any(|id| id == user_id))
            .map(|(id, _)| id.clone())
            .collect())
    }
}
