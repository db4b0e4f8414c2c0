use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, WardenError};

/// A repository on the source host, identified as `owner/name`.
///
/// # Examples
///
/// ```
/// use warden_core::RepoRef;
///
/// let repo: RepoRef = "acme/widgets".parse().unwrap();
/// assert_eq!(repo.owner, "acme");
/// assert_eq!(repo.name, "widgets");
/// assert_eq!(repo.to_string(), "acme/widgets");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// Owning user or organisation.
    pub owner: String,
    /// Repository name.
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// `owner/name`, the key used for per-repository bookkeeping.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoRef {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((owner, name)) = s.trim().split_once('/') else {
            return Err(WardenError::Config(format!(
                "invalid repository '{s}', expected owner/name"
            )));
        };
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(WardenError::Config(format!(
                "invalid repository '{s}', expected owner/name"
            )));
        }
        Ok(Self::new(owner, name))
    }
}

/// An inbound change-request notification, as handed over by the intake.
///
/// # Examples
///
/// ```
/// use warden_core::{ChangeNotification, RepoRef};
///
/// let event = ChangeNotification::pull_request(
///     "opened",
///     RepoRef::new("acme", "widgets"),
///     42,
///     "https://api.github.com/repos/acme/widgets/pulls/42",
/// );
/// assert!(event.is_review_trigger());
/// assert!(event.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Event type as reported by the host (e.g. `pull_request`).
    pub event: String,
    /// Event action (e.g. `opened`, `synchronize`).
    pub action: String,
    /// Repository the change request belongs to.
    pub repository: RepoRef,
    /// Change-request number.
    pub number: u64,
    /// Canonical API URL of the change request.
    pub url: String,
    /// Head commit of the change request at notification time.
    #[serde(default)]
    pub head_sha: Option<String>,
    /// Explicit identity to act as. When absent, the identity is resolved
    /// from the repository.
    #[serde(default)]
    pub identity: Option<String>,
}

const REVIEW_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

impl ChangeNotification {
    /// Build a `pull_request` notification with no head SHA or identity.
    pub fn pull_request(
        action: impl Into<String>,
        repository: RepoRef,
        number: u64,
        url: impl Into<String>,
    ) -> Self {
        Self {
            event: "pull_request".into(),
            action: action.into(),
            repository,
            number,
            url: url.into(),
            head_sha: None,
            identity: None,
        }
    }

    pub fn with_head_sha(mut self, sha: impl Into<String>) -> Self {
        self.head_sha = Some(sha.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Whether this event denotes a change-request creation or update.
    pub fn is_review_trigger(&self) -> bool {
        self.event == "pull_request" && REVIEW_ACTIONS.contains(&self.action.as_str())
    }

    /// Check that the event identifies a repository and a change request.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidEvent`] naming the first missing piece.
    pub fn validate(&self) -> Result<(), WardenError> {
        if !self.is_review_trigger() {
            return Err(WardenError::InvalidEvent(format!(
                "event '{}' with action '{}' does not create or update a change request",
                self.event, self.action
            )));
        }
        if self.repository.owner.trim().is_empty() || self.repository.name.trim().is_empty() {
            return Err(WardenError::InvalidEvent("missing repository".into()));
        }
        if self.number == 0 {
            return Err(WardenError::InvalidEvent(
                "missing change-request number".into(),
            ));
        }
        if self.url.trim().is_empty() {
            return Err(WardenError::InvalidEvent("missing change-request URL".into()));
        }
        Ok(())
    }

    /// The deterministic idempotency key of the job this event produces.
    pub fn job_key(&self) -> JobKey {
        JobKey::compute(
            &self.repository,
            self.number,
            self.head_sha.as_deref().unwrap_or_default(),
        )
    }
}

/// Deterministic job identifier: SHA-256 over repository, change-request
/// number and content digest.
///
/// # Examples
///
/// ```
/// use warden_core::{JobKey, RepoRef};
///
/// let repo = RepoRef::new("acme", "widgets");
/// let a = JobKey::compute(&repo, 42, "deadbeef");
/// let b = JobKey::compute(&repo, 42, "deadbeef");
/// assert_eq!(a, b);
/// assert_ne!(a, JobKey::compute(&repo, 43, "deadbeef"));
/// assert_eq!(a.as_str().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn compute(repository: &RepoRef, number: u64, content_digest: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(repository.owner.as_bytes());
        hasher.update(b"/");
        hasher.update(repository.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(number.to_le_bytes());
        hasher.update([0u8]);
        hasher.update(content_digest.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap a key read back from storage or a URL.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a review job.
///
/// ```text
/// Received -> CredentialResolved -> DiffFetched -> ReviewGenerated -> Posted
/// any stage, after exhausting its retry budget -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    CredentialResolved,
    DiffFetched,
    ReviewGenerated,
    Posted,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Posted | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::CredentialResolved => "credential_resolved",
            JobState::DiffFetched => "diff_fetched",
            JobState::ReviewGenerated => "review_generated",
            JobState::Posted => "posted",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s {
            "received" => JobState::Received,
            "credential_resolved" => JobState::CredentialResolved,
            "diff_fetched" => JobState::DiffFetched,
            "review_generated" => JobState::ReviewGenerated,
            "posted" => JobState::Posted,
            "failed" => JobState::Failed,
            _ => return None,
        };
        Some(state)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the review pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CredentialResolution,
    DiffFetch,
    ReviewGeneration,
    CommentPosting,
}

impl Stage {
    /// The job state reached when this stage succeeds.
    pub fn completes_into(&self) -> JobState {
        match self {
            Stage::CredentialResolution => JobState::CredentialResolved,
            Stage::DiffFetch => JobState::DiffFetched,
            Stage::ReviewGeneration => JobState::ReviewGenerated,
            Stage::CommentPosting => JobState::Posted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CredentialResolution => "credential_resolution",
            Stage::DiffFetch => "diff_fetch",
            Stage::ReviewGeneration => "review_generation",
            Stage::CommentPosting => "comment_posting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let stage = match s {
            "credential_resolution" => Stage::CredentialResolution,
            "diff_fetch" => Stage::DiffFetch,
            "review_generation" => Stage::ReviewGeneration,
            "comment_posting" => Stage::CommentPosting,
            _ => return None,
        };
        Some(stage)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage attempt counters of a job.
///
/// # Examples
///
/// ```
/// use warden_core::{Stage, StageAttempts};
///
/// let mut attempts = StageAttempts::default();
/// attempts.record(Stage::DiffFetch);
/// attempts.record(Stage::DiffFetch);
/// assert_eq!(attempts.get(Stage::DiffFetch), 2);
/// assert_eq!(attempts.total(), 2);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAttempts {
    pub credential_resolution: u32,
    pub diff_fetch: u32,
    pub review_generation: u32,
    pub comment_posting: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::CredentialResolution => self.credential_resolution,
            Stage::DiffFetch => self.diff_fetch,
            Stage::ReviewGeneration => self.review_generation,
            Stage::CommentPosting => self.comment_posting,
        }
    }

    pub fn record(&mut self, stage: Stage) {
        let slot = match stage {
            Stage::CredentialResolution => &mut self.credential_resolution,
            Stage::DiffFetch => &mut self.diff_fetch,
            Stage::ReviewGeneration => &mut self.review_generation,
            Stage::CommentPosting => &mut self.comment_posting,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u32 {
        self.credential_resolution + self.diff_fetch + self.review_generation + self.comment_posting
    }
}

/// An authorized external account.
///
/// The token is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Immutable external account id.
    pub id: String,
    /// Account login, for display.
    pub login: String,
    /// Current access token.
    #[serde(skip_serializing)]
    pub token: String,
    /// Repository chosen as review target, if any.
    pub selected_repo: Option<RepoRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("login", &self.login)
            .field("token", &"<redacted>")
            .field("selected_repo", &self.selected_repo)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Bearer token plus the repository it was selected for.
///
/// Borrowed by a job for the duration of its stages; never persisted by the
/// orchestrator.
///
/// # Examples
///
/// ```
/// use warden_core::{Credential, RepoRef};
///
/// let cred = Credential::new("alice", "ghp_secret", RepoRef::new("acme", "widgets"));
/// assert!(!format!("{cred:?}").contains("ghp_secret"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Identity the token belongs to.
    pub identity: String,
    /// Opaque bearer token.
    pub token: String,
    /// Repository selected by the identity.
    pub repository: RepoRef,
}

impl Credential {
    pub fn new(identity: impl Into<String>, token: impl Into<String>, repository: RepoRef) -> Self {
        Self {
            identity: identity.into(),
            token: token.into(),
            repository,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .field("repository", &self.repository)
            .finish()
    }
}

/// One changed file of a change request that carries a textual patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub filename: String,
    pub patch: String,
}

impl FilePatch {
    pub fn new(filename: impl Into<String>, patch: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            patch: patch.into(),
        }
    }
}

/// Acknowledgement of a side-effecting source-host call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Link to the created resource, when the host returns one.
    pub url: Option<String>,
}

/// Why and where a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    /// Stage that exhausted its budget; `None` for failures outside any stage.
    pub stage: Option<Stage>,
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn at(stage: Stage, err: &WardenError) -> Self {
        Self {
            stage: Some(stage),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of waiting on a job handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The review was posted by this process; carries the posted text.
    Success { review: String },
    /// The job was posted earlier (e.g. before a restart) and its review text
    /// is no longer held.
    AlreadyPosted { comment_url: Option<String> },
    /// The job reached `Failed`.
    Failure(JobFailure),
    /// The caller's timeout elapsed first; the job keeps running.
    Timeout,
}

/// Out-of-band view of a job, as recorded in the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub key: JobKey,
    pub repository: RepoRef,
    pub number: u64,
    pub url: String,
    pub state: JobState,
    pub attempts: StageAttempts,
    pub failure: Option<JobFailure>,
    pub comment_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}
