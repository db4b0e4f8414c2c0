//! Core types, configuration, and error handling for Warden.
//!
//! This crate provides the shared foundation used by all other Warden crates:
//! - [`WardenError`] and [`ErrorKind`]: the failure taxonomy of the review pipeline
//! - [`WardenConfig`]: configuration loaded from `.warden.toml`
//! - Pipeline types: [`ChangeNotification`], [`JobKey`], [`JobState`], [`Stage`],
//!   [`Outcome`], [`JobStatus`]
//! - Storage ports: [`CredentialStore`] and [`IdempotencyLedger`]

mod config;
mod error;
mod ports;
mod types;

pub use config::{
    GitHubConfig, LlmConfig, PipelineConfig, ReviewConfig, ServerConfig, StoreConfig,
    WardenConfig,
};
pub use error::{ErrorKind, WardenError};
pub use ports::{Claim, CredentialStore, IdempotencyLedger, LedgerEntry, NewJob};
pub use types::{
    Ack, ChangeNotification, Credential, FilePatch, Identity, JobFailure, JobKey, JobState,
    JobStatus, Outcome, RepoRef, Stage, StageAttempts,
};

/// A convenience `Result` type for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
