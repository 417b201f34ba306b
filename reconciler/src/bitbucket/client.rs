use super::models::{
    ErrorEnvelope, GroupMemberRow, GroupPermissionRow, Membership, Page, Project, RemoteUser,
    Repository, UserPermissionRow, Workspace, WorkspaceGroup, WorkspaceMemberRow,
};
use super::{AclResource, BitbucketApi, BitbucketError};
use crate::config::{BitbucketConfig, Credentials, RetryConfig};
use crate::metrics_defs::{ACL_ENTRIES, BITBUCKET_REQUESTS, BITBUCKET_RETRIES};
use crate::types::{Permission, PendingInvitation, RemotePermissionEntry, SubjectType};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use shared::{counter, histogram};
use tokio::time::sleep;

const PAGE_LEN: u32 = 100;

/// Upper bound on pages fetched for one listing.
const MAX_PAGES: usize = 1000;

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

pub struct BitbucketClient {
    client: reqwest::Client,
    base_url: String,
    workspace: String,
    credentials: Credentials,
    retry: RetryConfig,
}

impl BitbucketClient {
    pub fn new(config: &BitbucketConfig) -> Self {
        BitbucketClient {
            client: reqwest::Client::new(),
            base_url: config.api_url.as_str().trim_end_matches('/').to_string(),
            workspace: config.workspace.clone(),
            credentials: config.credentials.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Builds `{base_url}/{segments...}`, percent-encoding every segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BitbucketError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| BitbucketError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| BitbucketError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::Token { token } => request.bearer_auth(token),
            Credentials::AppPassword { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, BitbucketError> {
        let url = self.endpoint(segments)?;
        let mut retries = 0;

        loop {
            let response = self
                .authorize(self.client.get(url.clone()).query(query))
                .send()
                .await?;
            let status = response.status();
            counter!(BITBUCKET_REQUESTS, "status" => status.as_u16().to_string()).increment(1);

            if status.is_success() {
                return Ok(response.json::<T>().await?);
            }

            if RETRIABLE_STATUS_CODES.contains(&status) && retries < self.retry.max_retries {
                // Backoff between retries
                let delay = self.retry.delay(retries);
                tracing::warn!(
                    path = url.path(),
                    %status,
                    retries,
                    "Bitbucket request failed, retrying in {}ms",
                    delay.as_millis()
                );
                counter!(BITBUCKET_RETRIES).increment(1);
                sleep(delay).await;
                retries += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(BitbucketError::Api {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }
    }

    /// Walks `?page=1,2,...` until a page comes back without values.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<Vec<T>, BitbucketError> {
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let query = [("page", page.to_string()), ("pagelen", PAGE_LEN.to_string())];
            let result: Page<T> = self.get_json(segments, &query).await?;

            if result.values.is_empty() {
                tracing::debug!(path = %segments.join("/"), pages = page - 1, "Listing complete");
                return Ok(items);
            }
            items.extend(result.values);
        }

        Err(BitbucketError::TooManyPages(MAX_PAGES))
    }

    async fn permissions_config(
        &self,
        prefix: &[&str],
    ) -> Result<Vec<RemotePermissionEntry>, BitbucketError> {
        let users = [prefix, &["permissions-config", "users"][..]].concat();
        let groups = [prefix, &["permissions-config", "groups"][..]].concat();

        let mut entries: Vec<RemotePermissionEntry> = self
            .get_all_pages::<UserPermissionRow>(&users)
            .await?
            .into_iter()
            .map(RemotePermissionEntry::from)
            .collect();

        entries.extend(
            self.get_all_pages::<GroupPermissionRow>(&groups)
                .await?
                .into_iter()
                .map(RemotePermissionEntry::from),
        );

        Ok(entries)
    }

    async fn group_members(
        &self,
        slug: &str,
    ) -> Result<Vec<RemotePermissionEntry>, BitbucketError> {
        let group = self
            .list_groups()
            .await?
            .into_iter()
            .find(|group| group.slug == slug)
            .ok_or_else(|| BitbucketError::Api {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("group {slug} not found in workspace {}", self.workspace),
            })?;

        // Membership carries the group's own privilege; groups without one still grant read.
        let permission = group.permission.unwrap_or(Permission::Read);

        let members: Vec<GroupMemberRow> = self
            .get_json(&["1.0", "groups", self.workspace.as_str(), slug, "members"], &[])
            .await?;

        Ok(members
            .into_iter()
            .map(|member| RemotePermissionEntry {
                subject_type: SubjectType::User,
                subject_external_id: member.account_id,
                subject_display_name: member.display_name,
                permission,
            })
            .collect())
    }
}

/// Prefers Bitbucket's `{"error": {"message": ...}}` envelope, then the raw body,
/// then the status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return envelope.error.message;
    }
    if !body.trim().is_empty() {
        return body.trim().to_string();
    }
    status.canonical_reason().unwrap_or("unknown error").to_string()
}

#[async_trait]
impl BitbucketApi for BitbucketClient {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    async fn fetch_all_permissions(
        &self,
        resource: &AclResource,
    ) -> Result<Vec<RemotePermissionEntry>, BitbucketError> {
        let workspace = self.workspace.as_str();
        let entries = match resource {
            AclResource::WorkspaceGroup(slug) => self.group_members(slug).await?,
            AclResource::Project(key) => {
                self.permissions_config(&["2.0", "workspaces", workspace, "projects", key.as_str()])
                    .await?
            }
            AclResource::Repository(slug) => {
                self.permissions_config(&["2.0", "repositories", workspace, slug.as_str()])
                    .await?
            }
        };

        histogram!(ACL_ENTRIES).record(entries.len() as f64);
        tracing::debug!(%resource, entries = entries.len(), "Fetched ACL");
        Ok(entries)
    }

    async fn get_user(&self, account_id: &str) -> Result<RemoteUser, BitbucketError> {
        self.get_json(&["2.0", "users", account_id], &[]).await
    }

    async fn get_membership(&self, account_id: &str) -> Result<Membership, BitbucketError> {
        self.get_json(
            &["2.0", "workspaces", self.workspace.as_str(), "members", account_id],
            &[],
        )
        .await
    }

    async fn list_groups(&self) -> Result<Vec<WorkspaceGroup>, BitbucketError> {
        self.get_json(&["1.0", "groups", self.workspace.as_str()], &[]).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, BitbucketError> {
        self.get_all_pages(&["2.0", "workspaces", self.workspace.as_str(), "projects"])
            .await
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, BitbucketError> {
        self.get_all_pages(&["2.0", "repositories", self.workspace.as_str()])
            .await
    }

    async fn list_workspace_members(&self) -> Result<Vec<RemoteUser>, BitbucketError> {
        let rows: Vec<WorkspaceMemberRow> = self
            .get_all_pages(&["2.0", "workspaces", self.workspace.as_str(), "members"])
            .await?;
        Ok(rows.into_iter().map(|row| row.user).collect())
    }

    async fn pending_invitations(&self) -> Result<Vec<PendingInvitation>, BitbucketError> {
        self.get_json(&["1.0", "users", self.workspace.as_str(), "invitations"], &[])
            .await
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>, BitbucketError> {
        self.get_all_pages(&["2.0", "workspaces"]).await
    }

    async fn get_project(&self, key: &str) -> Result<Project, BitbucketError> {
        self.get_json(&["2.0", "workspaces", self.workspace.as_str(), "projects", key], &[])
            .await
    }

    async fn get_repository(&self, slug: &str) -> Result<Repository, BitbucketError> {
        self.get_json(&["2.0", "repositories", self.workspace.as_str(), slug], &[])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BitbucketClient {
        BitbucketClient::new(&BitbucketConfig {
            api_url: Url::parse(&server.uri()).unwrap(),
            workspace: "acme".into(),
            credentials: Credentials::Token {
                token: "test-token".into(),
            },
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 10,
            },
        })
    }

    async fn mount_page(server: &MockServer, route: &str, page: u32, values: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .and(query_param("page", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "values": values })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_project_permissions_page_until_empty() {
        let server = MockServer::start().await;
        let users = "/2.0/workspaces/acme/projects/PRJ/permissions-config/users";
        let groups = "/2.0/workspaces/acme/projects/PRJ/permissions-config/groups";

        mount_page(
            &server,
            users,
            1,
            json!([{"permission": "write", "user": {"account_id": "b", "display_name": "Bea"}}]),
        )
        .await;
        mount_page(
            &server,
            users,
            2,
            json!([{"permission": "admin", "user": {"account_id": "a", "display_name": "Al"}}]),
        )
        .await;
        mount_page(&server, users, 3, json!([])).await;
        mount_page(
            &server,
            groups,
            1,
            json!([{"permission": "read", "group": {"slug": "devs", "name": "Developers"}}]),
        )
        .await;
        mount_page(&server, groups, 2, json!([])).await;

        let client = client_for(&server);
        let entries = client
            .fetch_all_permissions(&AclResource::Project("PRJ".into()))
            .await
            .unwrap();

        // Pages are concatenated in arrival order, users before groups.
        let ids: Vec<_> = entries.iter().map(|e| e.subject_external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "devs"]);
        assert_eq!(entries[1].permission, Permission::Admin);
        assert_eq!(entries[2].subject_type, SubjectType::Group);
        assert_eq!(entries[2].subject_display_name, "Developers");
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.0/users/557058:abc"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "account_id": "557058:abc",
                "display_name": "Abc",
                "uuid": "{1234}"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let user = client_for(&server).get_user("557058:abc").await.unwrap();
        assert_eq!(user.display_name, "Abc");
        assert_eq!(user.nickname, "");
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/groups/acme"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/groups/acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"slug": "devs", "name": "Developers", "permission": "write"},
                {"slug": "ops", "name": "Ops", "permission": null}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let groups = client_for(&server).list_groups().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].permission, Some(Permission::Write));
        assert_eq!(groups[1].permission, None);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/users/acme/invitations"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = client_for(&server).pending_invitations().await.unwrap_err();
        assert_eq!(err.status(), Some(429));
    }

    #[tokio::test]
    async fn test_catalogue_listings() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "/2.0/workspaces/acme/projects",
            1,
            json!([{"key": "PRJ", "name": "Platform", "uuid": "{p1}"}]),
        )
        .await;
        mount_page(&server, "/2.0/workspaces/acme/projects", 2, json!([])).await;
        mount_page(
            &server,
            "/2.0/repositories/acme",
            1,
            json!([{"slug": "api", "name": "API"}, {"slug": "web", "name": "Web"}]),
        )
        .await;
        mount_page(&server, "/2.0/repositories/acme", 2, json!([])).await;
        mount_page(
            &server,
            "/2.0/workspaces/acme/members",
            1,
            json!([{
                "type": "workspace_membership",
                "user": {"account_id": "abc", "display_name": "Abc", "uuid": "{abc}"},
                "workspace": {"slug": "acme"}
            }]),
        )
        .await;
        mount_page(&server, "/2.0/workspaces/acme/members", 2, json!([])).await;

        let client = client_for(&server);
        let projects = client.list_projects().await.unwrap();
        assert_eq!(
            projects,
            vec![Project {
                key: "PRJ".into(),
                name: "Platform".into()
            }]
        );

        let repositories = client.list_repositories().await.unwrap();
        let slugs: Vec<_> = repositories.iter().map(|repo| repo.slug.as_str()).collect();
        assert_eq!(slugs, vec!["api", "web"]);

        let members = client.list_workspace_members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].account_id, "abc");
        assert_eq!(members[0].account_status, None);
    }

    #[tokio::test]
    async fn test_many_retries_do_not_overflow_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.0/users/abc"))
            .respond_with(ResponseTemplate::new(503))
            .expect(71)
            .mount(&server)
            .await;

        let mut client = client_for(&server);
        client.retry = RetryConfig {
            max_retries: 70,
            base_delay_ms: 0,
            max_delay_ms: 0,
        };
        let err = client.get_user("abc").await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2.0/repositories/acme/missing/permissions-config/users"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "type": "error",
                "error": {"message": "Repository acme/missing not found"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2.0/workspaces/acme/members/nobody"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client
            .fetch_all_permissions(&AclResource::Repository("missing".into()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Repository acme/missing not found"));

        let err = client.get_membership("nobody").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn test_workspace_group_members_carry_group_permission() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.0/groups/acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"slug": "devs", "name": "Developers", "permission": "write"},
                {"slug": "readers", "name": "Readers", "permission": null}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/groups/acme/devs/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"account_id": "x", "display_name": "Xavier"},
                {"account_id": "y", "display_name": "Yan"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1.0/groups/acme/readers/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"account_id": "z", "display_name": "Zoe"}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let devs = client
            .fetch_all_permissions(&AclResource::WorkspaceGroup("devs".into()))
            .await
            .unwrap();
        assert_eq!(devs.len(), 2);
        assert!(devs.iter().all(|e| e.permission == Permission::Write));
        assert!(devs.iter().all(|e| e.subject_type == SubjectType::User));

        let readers = client
            .fetch_all_permissions(&AclResource::WorkspaceGroup("readers".into()))
            .await
            .unwrap();
        assert_eq!(readers[0].permission, Permission::Read);

        let err = client
            .fetch_all_permissions(&AclResource::WorkspaceGroup("ghosts".into()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_workspaces_paginates() {
        let server = MockServer::start().await;
        mount_page(&server, "/2.0/workspaces", 1, json!([{"slug": "acme", "name": "Acme"}])).await;
        mount_page(&server, "/2.0/workspaces", 2, json!([])).await;

        let workspaces = client_for(&server).list_workspaces().await.unwrap();
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].slug, "acme");
    }
}
