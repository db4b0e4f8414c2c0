//! SQLite persistence for Warden.
//!
//! One database file holds both pieces of durable state:
//! - [`SqliteCredentialStore`]: identities, their tokens and selected repositories
//! - [`SqliteLedger`]: the idempotency ledger of review jobs

pub mod credentials;
pub mod db;
pub mod ledger;

pub use credentials::SqliteCredentialStore;
pub use db::Database;
pub use ledger::SqliteLedger;
