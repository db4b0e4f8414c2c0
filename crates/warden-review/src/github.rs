use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use warden_core::{Ack, Credential, FilePatch, GitHubConfig, RepoRef, WardenError};

const PER_PAGE: usize = 100;
/// GitHub lists at most 3000 files per pull request.
const MAX_PAGES: usize = 30;

/// Typed facade over the source-hosting API.
///
/// Every method translates the host's failure modes into the pipeline
/// taxonomy: `Unauthorized`, `NotFound`, `RateLimited`, `Transient`, `Rejected`.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Changed files of a change request that carry a non-empty patch, in
    /// host order. Binary files (no patch) are skipped.
    async fn fetch_diff(
        &self,
        repo: &RepoRef,
        number: u64,
        credential: &Credential,
    ) -> Result<Vec<FilePatch>, WardenError>;

    /// Create a comment on the change request at `change_request_url`.
    ///
    /// Not idempotent: callers guarantee at most one call per job.
    async fn post_comment(
        &self,
        change_request_url: &str,
        credential: &Credential,
        text: &str,
    ) -> Result<Ack, WardenError>;

    /// Subscribe `callback_url` to pull request events of `repo`.
    async fn register_webhook(
        &self,
        repo: &RepoRef,
        credential: &Credential,
        callback_url: &str,
    ) -> Result<Ack, WardenError>;
}

/// GitHub REST client.
///
/// # Examples
///
/// ```
/// use warden_core::GitHubConfig;
/// use warden_review::GitHubClient;
///
/// let client = GitHubClient::new(&GitHubConfig::default()).unwrap();
/// ```
pub struct GitHubClient {
    http: reqwest::Client,
    api_base_url: String,
    webhook_secret: Option<String>,
}

#[derive(Deserialize)]
struct PullFile {
    filename: String,
    #[serde(default)]
    patch: Option<String>,
}

#[derive(Deserialize)]
struct CreatedResource {
    #[serde(default)]
    html_url: Option<String>,
}

impl GitHubClient {
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &GitHubConfig) -> Result<Self, WardenError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            "application/vnd.github+json"
                .parse()
                .map_err(|e| WardenError::Config(format!("invalid header: {e}")))?,
        );
        headers.insert(
            "X-GitHub-Api-Version",
            "2022-11-28"
                .parse()
                .map_err(|e| WardenError::Config(format!("invalid header: {e}")))?,
        );
        headers.insert(
            USER_AGENT,
            config
                .user_agent
                .parse()
                .map_err(|e| WardenError::Config(format!("invalid user agent: {e}")))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .map_err(|e| WardenError::Config(format!("failed to create GitHub client: {e}")))?;

        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            webhook_secret: None,
        })
    }

    /// Secret GitHub signs webhook deliveries with.
    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret;
        self
    }

    /// Issue-comments endpoint for a pull request API or HTML URL.
    ///
    /// The host part of `url` is ignored; the configured API base is used.
    ///
    /// # Examples
    ///
    /// ```
    /// use warden_core::GitHubConfig;
    /// use warden_review::GitHubClient;
    ///
    /// let client = GitHubClient::new(&GitHubConfig::default()).unwrap();
    /// let endpoint = client
    ///     .comments_endpoint("https://github.com/acme/widgets/pull/42")
    ///     .unwrap();
    /// assert_eq!(endpoint, "https://api.github.com/repos/acme/widgets/issues/42/comments");
    /// ```
    pub fn comments_endpoint(&self, url: &str) -> Result<String, WardenError> {
        let (repo, number) = parse_change_request_url(url)?;
        Ok(format!(
            "{}/repos/{}/{}/issues/{number}/comments",
            self.api_base_url, repo.owner, repo.name
        ))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        credential: &Credential,
        what: &str,
    ) -> Result<Response, WardenError> {
        let response = request
            .header(AUTHORIZATION, format!("Bearer {}", credential.token))
            .send()
            .await
            .map_err(|e| WardenError::Transient(format!("{what}: request failed: {e}")))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_for_response(response, what).await)
        }
    }
}

#[async_trait]
impl SourceHost for GitHubClient {
    async fn fetch_diff(
        &self,
        repo: &RepoRef,
        number: u64,
        credential: &Credential,
    ) -> Result<Vec<FilePatch>, WardenError> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{number}/files",
            self.api_base_url, repo.owner, repo.name
        );
        let what = format!("list files of {repo}#{number}");

        let mut patches = Vec::new();
        for page in 1..=MAX_PAGES {
            let request = self
                .http
                .get(&url)
                .query(&[("per_page", PER_PAGE), ("page", page)]);
            let files: Vec<PullFile> = self
                .send(request, credential, &what)
                .await?
                .json()
                .await
                .map_err(|e| WardenError::Transient(format!("{what}: invalid response: {e}")))?;

            let count = files.len();
            patches.extend(files.into_iter().filter_map(|file| match file.patch {
                Some(patch) if !patch.is_empty() => Some(FilePatch::new(file.filename, patch)),
                _ => None,
            }));
            if count < PER_PAGE {
                break;
            }
        }

        debug!(repo = %repo, number, files = patches.len(), "fetched pull request files");
        Ok(patches)
    }

    async fn post_comment(
        &self,
        change_request_url: &str,
        credential: &Credential,
        text: &str,
    ) -> Result<Ack, WardenError> {
        let endpoint = self.comments_endpoint(change_request_url)?;
        let request = self
            .http
            .post(&endpoint)
            .json(&serde_json::json!({ "body": text }));
        let created: CreatedResource = self
            .send(request, credential, "create comment")
            .await?
            .json()
            .await
            .unwrap_or(CreatedResource { html_url: None });
        Ok(Ack {
            url: created.html_url,
        })
    }

    async fn register_webhook(
        &self,
        repo: &RepoRef,
        credential: &Credential,
        callback_url: &str,
    ) -> Result<Ack, WardenError> {
        let endpoint = format!("{}/repos/{}/{}/hooks", self.api_base_url, repo.owner, repo.name);
        let mut hook_config = serde_json::json!({
            "url": callback_url,
            "content_type": "json",
            "insecure_ssl": "0",
        });
        if let Some(secret) = &self.webhook_secret {
            hook_config["secret"] = serde_json::Value::String(secret.clone());
        }
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["pull_request"],
            "config": hook_config,
        });

        let request = self.http.post(&endpoint).json(&body);
        match self.send(request, credential, "create webhook").await {
            Ok(response) => {
                let created: CreatedResource = response
                    .json()
                    .await
                    .unwrap_or(CreatedResource { html_url: None });
                Ok(Ack {
                    url: created.html_url,
                })
            }
            Err(WardenError::Rejected(message)) if message.contains("already exists") => {
                debug!(repo = %repo, "webhook already registered");
                Ok(Ack::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Extract repository and number from `.../repos/o/r/pulls/n` or
/// `https://github.com/o/r/pull/n`.
fn parse_change_request_url(url: &str) -> Result<(RepoRef, u64), WardenError> {
    let invalid = || WardenError::Rejected(format!("not a pull request URL: '{url}'"));

    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .split_once('/')
        .map(|(_, path)| path)
        .ok_or_else(invalid)?;
    let segments: Vec<&str> = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let (owner, name, number) = match segments.as_slice() {
        [.., "repos", owner, name, "pulls", number] => (owner, name, number),
        [.., owner, name, "pull", number] => (owner, name, number),
        _ => return Err(invalid()),
    };
    let number = number.parse().map_err(|_| invalid())?;
    Ok((RepoRef::new(*owner, *name), number))
}

async fn error_for_response(response: Response, what: &str) -> WardenError {
    let status = response.status();
    let rate_limit_hint = rate_limit_hint(response.headers());
    let throttled = rate_limit_hint.is_some() || is_rate_limit_exhausted(response.headers());
    let body = response.text().await.unwrap_or_default();
    let message = format!("{what}: {status}: {}", body.trim());

    match status {
        StatusCode::UNAUTHORIZED => WardenError::Unauthorized(message),
        StatusCode::TOO_MANY_REQUESTS => WardenError::RateLimited {
            retry_after: rate_limit_hint,
            message,
        },
        StatusCode::FORBIDDEN if throttled || body.contains("rate limit") => {
            WardenError::RateLimited {
                retry_after: rate_limit_hint,
                message,
            }
        }
        StatusCode::FORBIDDEN => WardenError::Unauthorized(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => WardenError::NotFound(message),
        s if s.is_server_error() => WardenError::Transient(message),
        _ => WardenError::Rejected(message),
    }
}

fn is_rate_limit_exhausted(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0")
}

/// `Retry-After` seconds, else the distance to `X-RateLimit-Reset` when the
/// quota is exhausted.
fn rate_limit_hint(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_secs(secs));
    }
    if !is_rate_limit_exhausted(headers) {
        return None;
    }
    let reset = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    let wait = reset.saturating_sub(chrono::Utc::now().timestamp()).max(0);
    Some(Duration::from_secs(wait as u64))
}
