//! GitLab API client.
//!
//! HTTP client for GitLab API v4 with authentication, pagination, bounded
//! concurrency and transparent retries. Transient failures (connect errors,
//! timeouts, 429, 5xx) are retried with exponential backoff and jitter within
//! a wall-clock budget; `Retry-After` headers are honored. Authorization
//! failures and precondition failures are never retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;

use crate::config::BotConfig;
use crate::error::{BotError, MergeRefusal};
use crate::models::{
    GitLabBranch, GitLabCommit, GitLabMergeRequest, GitLabPipeline, GitLabProject, GitLabUser,
    MergeRequestApprovals,
};
use crate::services::api::{AcceptParams, GitlabApi, MrNote};

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g. `https://gitlab.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,

    /// Wall-clock budget for one logical call including retries.
    pub retry_budget: Duration,

    /// Maximum in-flight requests across all callers.
    pub max_inflight: usize,
}

impl GitLabClientConfig {
    pub fn from_bot_config(config: &BotConfig) -> Self {
        Self {
            base_url: config.gitlab_url.clone(),
            token: config.auth_token.clone(),
            timeout_secs: 30,
            retry_budget: config.http_retry_budget,
            max_inflight: config.max_inflight_requests,
        }
    }
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
    inflight: Arc<Semaphore>,
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, BotError> {
        let mut headers = header::HeaderMap::new();

        let token_value = header::HeaderValue::from_str(&config.token)
            .map_err(|_| BotError::config("Invalid token format"))?;
        headers.insert("PRIVATE-TOKEN", token_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BotError::config(format!("Failed to build HTTP client: {}", e)))?;

        let inflight = Arc::new(Semaphore::new(config.max_inflight.max(1)));
        Ok(Self {
            client,
            config,
            inflight,
        })
    }

    /// Get the full URL for an API path.
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    /// Send a request, retrying transient failures within the budget.
    ///
    /// The request is rebuilt from `make` on each attempt so bodies survive
    /// retries.
    async fn send_with_retry<F>(&self, endpoint: &str, make: F) -> Result<Response, BotError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let permit = self
                .inflight
                .acquire()
                .await
                .map_err(|_| BotError::network("HTTP client shut down"))?;
            let result = make().send().await;
            drop(permit);

            let retry_after = match result {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        log::debug!(
                            "transient {} from {}, attempt {}",
                            status.as_u16(),
                            endpoint,
                            attempt
                        );
                        parse_retry_after(&response)
                    } else {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if err.is_timeout() || err.is_connect() {
                        log::debug!("transient error from {}: {}", endpoint, err);
                        None
                    } else {
                        return Err(err.into());
                    }
                }
            };

            let delay = backoff_delay(attempt, retry_after);
            if start.elapsed() + delay > self.config.retry_budget {
                return Err(BotError::network(format!(
                    "retry budget exhausted for {}",
                    endpoint
                )));
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Handle API response errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, BotError> {
        let status = response.status();

        if status.is_success() {
            response
                .json::<T>()
                .await
                .map_err(|e| BotError::api(format!("Failed to parse response: {}", e)))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(BotError::unauthorized(format!(
                "{} on {}",
                status.as_u16(),
                endpoint
            )))
        } else {
            let status_code = status.as_u16();
            let message = extract_error_message(response)
                .await
                .unwrap_or_else(|| format!("Request failed ({})", status_code));
            Err(BotError::api_full(message, status_code, endpoint))
        }
    }

    /// Send a request expecting only a success status.
    async fn expect_success(&self, response: Response, endpoint: &str) -> Result<(), BotError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BotError::unauthorized(format!(
                "{} on {}",
                status.as_u16(),
                endpoint
            )));
        }
        let status_code = status.as_u16();
        let message = extract_error_message(response)
            .await
            .unwrap_or_else(|| format!("Request failed ({})", status_code));
        Err(BotError::api_full(message, status_code, endpoint))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, BotError> {
        let url = self.api_url(endpoint);
        let response = self
            .send_with_retry(endpoint, || self.client.get(&url).query(query))
            .await?;
        self.handle_response(response, endpoint).await
    }

    /// Fetch all pages of a paginated endpoint via `x-next-page` headers.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, BotError> {
        let url = self.api_url(endpoint);
        let mut all_data = Vec::new();
        let mut page: u32 = 1;

        loop {
            let response = self
                .send_with_retry(endpoint, || {
                    self.client
                        .get(&url)
                        .query(query)
                        .query(&[("page", page.to_string()), ("per_page", "100".to_string())])
                })
                .await?;

            let next_page = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u32>().ok());

            let data: Vec<T> = self.handle_response(response, endpoint).await?;
            let empty_page = data.is_empty();
            all_data.extend(data);

            match next_page {
                Some(next) if !empty_page => page = next,
                _ => break,
            }
        }

        Ok(all_data)
    }

    async fn put_json(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<Response, BotError> {
        let url = self.api_url(endpoint);
        self.send_with_retry(endpoint, || self.client.put(&url).json(&body))
            .await
    }

    async fn post_json(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<Response, BotError> {
        let url = self.api_url(endpoint);
        self.send_with_retry(endpoint, || self.client.post(&url).json(&body))
            .await
    }

    /// Look up a user by username.
    pub async fn user_by_username(&self, username: &str) -> Result<GitLabUser, BotError> {
        let users: Vec<GitLabUser> = self
            .get_json("/users", &[("username", username.to_string())])
            .await?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| BotError::api_full(format!("no user named {}", username), 404, "/users"))
    }

    /// Fetch a single commit.
    pub async fn get_commit(
        &self,
        project_id: i64,
        sha: &str,
    ) -> Result<GitLabCommit, BotError> {
        self.get_json(
            &format!("/projects/{}/repository/commits/{}", project_id, sha),
            &[],
        )
        .await
    }

    /// List repository branches, optionally filtered by a search term.
    pub async fn list_branches(
        &self,
        project_id: i64,
        search: Option<&str>,
    ) -> Result<Vec<GitLabBranch>, BotError> {
        let mut query = Vec::new();
        if let Some(term) = search {
            query.push(("search", term.to_string()));
        }
        self.get_all_pages(
            &format!("/projects/{}/repository/branches", project_id),
            &query,
        )
        .await
    }
}

#[async_trait]
impl GitlabApi for GitLabClient {
    async fn current_user(&self) -> Result<GitLabUser, BotError> {
        self.get_json("/user", &[]).await
    }

    async fn user_by_id(&self, user_id: i64) -> Result<GitLabUser, BotError> {
        self.get_json(&format!("/users/{}", user_id), &[]).await
    }

    async fn list_projects(&self) -> Result<Vec<GitLabProject>, BotError> {
        self.get_all_pages(
            "/projects",
            &[
                ("membership", "true".to_string()),
                ("with_merge_requests_enabled", "true".to_string()),
                ("archived", "false".to_string()),
                // Developer access; anything below cannot push branches anyway.
                ("min_access_level", "30".to_string()),
            ],
        )
        .await
    }

    async fn get_project(&self, project_id: i64) -> Result<GitLabProject, BotError> {
        self.get_json(&format!("/projects/{}", project_id), &[])
            .await
    }

    async fn list_open_mrs(&self, project_id: i64) -> Result<Vec<GitLabMergeRequest>, BotError> {
        self.get_all_pages(
            &format!("/projects/{}/merge_requests", project_id),
            &[
                ("state", "opened".to_string()),
                ("order_by", "created_at".to_string()),
                ("sort", "asc".to_string()),
            ],
        )
        .await
    }

    async fn get_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<GitLabMergeRequest, BotError> {
        self.get_json(
            &format!("/projects/{}/merge_requests/{}", project_id, mr_iid),
            &[("include_rebase_in_progress", "true".to_string())],
        )
        .await
    }

    async fn list_mr_commits(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<Vec<GitLabCommit>, BotError> {
        self.get_all_pages(
            &format!("/projects/{}/merge_requests/{}/commits", project_id, mr_iid),
            &[],
        )
        .await
    }

    async fn list_mr_notes(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<Vec<MrNote>, BotError> {
        self.get_all_pages(
            &format!("/projects/{}/merge_requests/{}/notes", project_id, mr_iid),
            &[],
        )
        .await
    }

    async fn list_pipelines(
        &self,
        project_id: i64,
        sha: &str,
    ) -> Result<Vec<GitLabPipeline>, BotError> {
        // Newest first; one page of 100 is far beyond any realistic pipeline
        // count for a single sha.
        self.get_json(
            &format!("/projects/{}/pipelines", project_id),
            &[
                ("sha", sha.to_string()),
                ("per_page", "100".to_string()),
            ],
        )
        .await
    }

    async fn get_approvals(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<MergeRequestApprovals, BotError> {
        self.get_json(
            &format!(
                "/projects/{}/merge_requests/{}/approvals",
                project_id, mr_iid
            ),
            &[],
        )
        .await
    }

    async fn get_branch(
        &self,
        project_id: i64,
        branch: &str,
    ) -> Result<GitLabBranch, BotError> {
        self.get_json(
            &format!(
                "/projects/{}/repository/branches/{}",
                project_id,
                urlencoding::encode(branch)
            ),
            &[],
        )
        .await
    }

    async fn delete_branch(&self, project_id: i64, branch: &str) -> Result<(), BotError> {
        let endpoint = format!(
            "/projects/{}/repository/branches/{}",
            project_id,
            urlencoding::encode(branch)
        );
        let url = self.api_url(&endpoint);
        let response = self
            .send_with_retry(&endpoint, || self.client.delete(&url))
            .await?;
        self.expect_success(response, &endpoint).await
    }

    async fn comment(&self, project_id: i64, mr_iid: i64, body: &str) -> Result<(), BotError> {
        let endpoint = format!("/projects/{}/merge_requests/{}/notes", project_id, mr_iid);
        let response = self
            .post_json(&endpoint, serde_json::json!({ "body": body }))
            .await?;
        self.expect_success(response, &endpoint).await
    }

    async fn set_assignees(
        &self,
        project_id: i64,
        mr_iid: i64,
        assignee_ids: &[i64],
    ) -> Result<(), BotError> {
        let endpoint = format!("/projects/{}/merge_requests/{}", project_id, mr_iid);
        // The API interprets [0] as "clear all assignees".
        let ids: Vec<i64> = if assignee_ids.is_empty() {
            vec![0]
        } else {
            assignee_ids.to_vec()
        };
        let response = self
            .put_json(&endpoint, serde_json::json!({ "assignee_ids": ids }))
            .await?;
        self.expect_success(response, &endpoint).await
    }

    async fn accept_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
        params: &AcceptParams,
    ) -> Result<GitLabMergeRequest, BotError> {
        let endpoint = format!("/projects/{}/merge_requests/{}/merge", project_id, mr_iid);
        let body = serde_json::to_value(params)?;
        let response = self.put_json(&endpoint, body).await?;
        let status = response.status();

        if status.is_success() {
            return self.handle_response(response, &endpoint).await;
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BotError::unauthorized(format!(
                "{} on {}",
                status.as_u16(),
                endpoint
            )));
        }

        let message = extract_error_message(response).await.unwrap_or_default();
        let refusal = match status.as_u16() {
            405 => MergeRefusal::NotMergeable,
            406 => MergeRefusal::BranchCannotBeMerged,
            409 => MergeRefusal::ShaMismatch,
            422 if message.to_lowercase().contains("pipeline") => {
                MergeRefusal::PipelineNotSucceeded
            }
            422 => MergeRefusal::Other(message),
            code => {
                return Err(BotError::api_full(
                    if message.is_empty() {
                        format!("Merge failed ({})", code)
                    } else {
                        message
                    },
                    code,
                    endpoint,
                ))
            }
        };
        Err(BotError::MergeRefused { refusal })
    }

    async fn rebase_mr(&self, project_id: i64, mr_iid: i64) -> Result<(), BotError> {
        let endpoint = format!("/projects/{}/merge_requests/{}/rebase", project_id, mr_iid);
        let response = self.put_json(&endpoint, serde_json::json!({})).await?;
        self.expect_success(response, &endpoint).await
    }

    async fn approve_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
        sudo_user_id: Option<i64>,
    ) -> Result<(), BotError> {
        let endpoint = format!("/projects/{}/merge_requests/{}/approve", project_id, mr_iid);
        let url = self.api_url(&endpoint);
        let response = self
            .send_with_retry(&endpoint, || {
                let mut request = self.client.post(&url);
                if let Some(uid) = sudo_user_id {
                    request = request.header("SUDO", uid.to_string());
                }
                request
            })
            .await?;
        self.expect_success(response, &endpoint).await
    }
}

/// Extract the human-readable message GitLab puts in error bodies
/// (`{"message": ...}` or `{"error": ...}`).
async fn extract_error_message(response: Response) -> Option<String> {
    let body = response.text().await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .map(|m| match m.as_str() {
            Some(s) => s.to_string(),
            // Sometimes "message" is an object like {"base": ["msg"]}.
            None => m.to_string(),
        })
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff with jitter; `Retry-After` acts as a floor.
fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = Duration::from_millis(500)
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(Duration::from_secs(10));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
    let delay = base + jitter;
    match retry_after {
        Some(floor) => delay.max(floor),
        None => delay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GitLabClient {
        GitLabClient::new(GitLabClientConfig {
            base_url: "https://gitlab.example.com/".to_string(),
            token: "test-token".to_string(),
            timeout_secs: 30,
            retry_budget: Duration::from_secs(60),
            max_inflight: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_api_url_construction() {
        let client = client();
        assert_eq!(
            client.api_url("/user"),
            "https://gitlab.example.com/api/v4/user"
        );
        assert_eq!(
            client.api_url("/projects/1/merge_requests/2/merge"),
            "https://gitlab.example.com/api/v4/projects/1/merge_requests/2/merge"
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff_delay(0, None);
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(750));

        let capped = backoff_delay(20, None);
        assert!(capped <= Duration::from_millis(10_250));
        assert!(capped >= Duration::from_secs(10));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let delay = backoff_delay(0, Some(Duration::from_secs(30)));
        assert!(delay >= Duration::from_secs(30));
    }

    #[test]
    fn test_accept_params_serialization() {
        let params = AcceptParams {
            sha: "abc123".to_string(),
            should_remove_source_branch: true,
            merge_when_pipeline_succeeds: true,
            squash: false,
            squash_commit_message: None,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"sha\":\"abc123\""));
        assert!(json.contains("\"should_remove_source_branch\":true"));
        // None fields are omitted entirely.
        assert!(!json.contains("squash_commit_message"));
    }

    #[test]
    fn test_invalid_token_rejected() {
        let result = GitLabClient::new(GitLabClientConfig {
            base_url: "https://g".to_string(),
            token: "bad\ntoken".to_string(),
            timeout_secs: 30,
            retry_budget: Duration::from_secs(60),
            max_inflight: 4,
        });
        assert!(result.is_err());
    }
}
