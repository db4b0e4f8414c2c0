//! Narrow interfaces to the two pieces of shared mutable state: the
//! credential store and the idempotency ledger.
//!
//! Implementations must not hold a lock across an await point; every call is
//! a short, self-contained read or write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::WardenError;
use crate::types::{
    ChangeNotification, Credential, JobFailure, JobKey, JobState, JobStatus, RepoRef,
    StageAttempts,
};

/// Durable mapping from an external identity to its credential and selected
/// repository.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credential of `identity`.
    ///
    /// # Errors
    ///
    /// [`WardenError::NoCredential`] if the identity never authorized,
    /// [`WardenError::NoRepositorySelected`] if it selected no repository.
    async fn get(&self, identity: &str) -> Result<Credential, WardenError>;

    /// Obtain a fresh credential after the source host rejected the current one.
    async fn refresh(&self, identity: &str) -> Result<Credential, WardenError>;

    /// Record `repo` as the identity's review target.
    async fn select_repository(&self, identity: &str, repo: &RepoRef) -> Result<(), WardenError>;

    /// Resolve the credential to act with on `repo`.
    ///
    /// With an explicit `selector`, that identity is used. Otherwise the
    /// identity that selected `repo` is used.
    async fn resolve(
        &self,
        repo: &RepoRef,
        selector: Option<&str>,
    ) -> Result<Credential, WardenError>;
}

/// A job about to be recorded by [`IdempotencyLedger::claim`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub key: JobKey,
    pub notification: ChangeNotification,
}

/// Result of an atomic ledger claim.
#[derive(Debug, Clone)]
pub enum Claim {
    /// A fresh entry was created, or a failed one was revived as `Received`.
    Created(LedgerEntry),
    /// An entry in a non-terminal or `Posted` state already exists.
    Existing(LedgerEntry),
}

/// Full ledger record of a job.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub status: JobStatus,
    /// The notification that created the job, kept for restart recovery.
    pub notification: ChangeNotification,
    /// Set once a worker reserved the right to post the comment.
    pub post_claimed_at: Option<DateTime<Utc>>,
}

/// Durable check-and-set record of review jobs.
///
/// Every mutating method is a single atomic operation on the backing store.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Create the entry for `job` unless a live or posted entry exists.
    async fn claim(&self, job: NewJob) -> Result<Claim, WardenError>;

    /// Record a stage transition. Posted entries are never modified.
    async fn advance(
        &self,
        key: &JobKey,
        state: JobState,
        attempts: &StageAttempts,
    ) -> Result<(), WardenError>;

    /// Reserve the single right to post the review for `key`.
    ///
    /// Returns `true` for exactly one caller per job lifetime.
    async fn claim_post(&self, key: &JobKey) -> Result<bool, WardenError>;

    /// Give the post reservation back after the host definitively refused the
    /// comment, so a later resubmission of the same change may post.
    async fn release_post(&self, key: &JobKey) -> Result<(), WardenError>;

    /// Transition into `Posted`.
    async fn complete(
        &self,
        key: &JobKey,
        comment_url: Option<&str>,
        attempts: &StageAttempts,
    ) -> Result<(), WardenError>;

    /// Transition into `Failed`.
    async fn fail(
        &self,
        key: &JobKey,
        failure: &JobFailure,
        attempts: &StageAttempts,
    ) -> Result<(), WardenError>;

    async fn get(&self, key: &JobKey) -> Result<Option<LedgerEntry>, WardenError>;

    /// Entries in a non-terminal state, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<LedgerEntry>, WardenError>;

    /// Most recently touched entries first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<JobStatus>, WardenError>;

    /// Delete terminal entries last touched before `cutoff`. Returns the count.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, WardenError>;
}
