//! The review pipeline: source-host and generator clients, retry policy, and
//! the orchestrator that drives a change notification to a posted comment.

pub mod generator;
pub mod github;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod retry;

pub use generator::{LlmReviewer, ReviewGenerator};
pub use github::{GitHubClient, SourceHost};
pub use orchestrator::{JobHandle, Orchestrator};
pub use retry::RetryPolicy;
