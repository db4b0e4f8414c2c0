use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use warden_core::{Credential, CredentialStore, Identity, RepoRef, WardenError};

use crate::db::{db_err, parse_timestamp, timestamp, Database};

/// SQLite-backed credential store.
///
/// `get` serves from a small in-memory cache; `refresh` bypasses it and
/// re-reads the durable record, which picks up tokens rotated by another
/// process (e.g. `warden identity rotate`).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use warden_core::RepoRef;
/// use warden_store::{Database, SqliteCredentialStore};
///
/// let store = SqliteCredentialStore::new(Arc::new(Database::in_memory().unwrap()));
/// store.upsert_identity("1001", "alice", "ghp_xxx").unwrap();
/// store.set_selected_repo("1001", &RepoRef::new("acme", "widgets")).unwrap();
/// assert_eq!(store.list_identities().unwrap().len(), 1);
/// ```
pub struct SqliteCredentialStore {
    db: Arc<Database>,
    cache: RwLock<HashMap<String, Credential>>,
    default_identity: Option<String>,
}

impl SqliteCredentialStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
            default_identity: None,
        }
    }

    /// Prefer `identity` when several identities selected the same repository.
    pub fn with_default_identity(mut self, identity: Option<String>) -> Self {
        self.default_identity = identity;
        self
    }

    /// Create an identity on first authorization, or rotate its token.
    ///
    /// Identities are never deleted automatically.
    pub fn upsert_identity(&self, id: &str, login: &str, token: &str) -> Result<(), WardenError> {
        let now = timestamp(Utc::now());
        {
            let conn = self.db.conn()?;
            conn.execute(
                "INSERT INTO identities (id, login, token, selected_repo, created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    login = excluded.login,
                    token = excluded.token,
                    updated_at = excluded.updated_at",
                params![id, login, token, now],
            )
            .map_err(db_err)?;
        }
        self.evict(id);
        info!(identity = id, login, "identity stored");
        Ok(())
    }

    /// Replace the token of an existing identity.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::NoCredential`] if the identity does not exist.
    pub fn rotate_token(&self, id: &str, token: &str) -> Result<(), WardenError> {
        let changed = {
            let conn = self.db.conn()?;
            conn.execute(
                "UPDATE identities SET token = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, token, timestamp(Utc::now())],
            )
            .map_err(db_err)?
        };
        if changed == 0 {
            return Err(WardenError::NoCredential(format!(
                "identity {id} has not authorized"
            )));
        }
        self.evict(id);
        info!(identity = id, "token rotated");
        Ok(())
    }

    /// Record `repo` as the review target of `id`.
    pub fn set_selected_repo(&self, id: &str, repo: &RepoRef) -> Result<(), WardenError> {
        let changed = {
            let conn = self.db.conn()?;
            conn.execute(
                "UPDATE identities SET selected_repo = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, repo.full_name(), timestamp(Utc::now())],
            )
            .map_err(db_err)?
        };
        if changed == 0 {
            return Err(WardenError::NoCredential(format!(
                "identity {id} has not authorized"
            )));
        }
        self.evict(id);
        info!(identity = id, repo = %repo, "repository selected");
        Ok(())
    }

    pub fn identity(&self, id: &str) -> Result<Option<Identity>, WardenError> {
        let conn = self.db.conn()?;
        let row = conn
            .query_row(
                "SELECT id, login, token, selected_repo, created_at, updated_at
                 FROM identities WHERE id = ?1",
                params![id],
                raw_identity,
            )
            .optional()
            .map_err(db_err)?;
        row.map(RawIdentity::into_identity).transpose()
    }

    /// All identities, oldest first.
    pub fn list_identities(&self) -> Result<Vec<Identity>, WardenError> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, login, token, selected_repo, created_at, updated_at
                 FROM identities ORDER BY created_at, id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], raw_identity)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().map(RawIdentity::into_identity).collect()
    }

    fn load(&self, id: &str) -> Result<Credential, WardenError> {
        let Some(identity) = self.identity(id)? else {
            return Err(WardenError::NoCredential(format!(
                "identity {id} has not authorized"
            )));
        };
        let Some(repo) = identity.selected_repo else {
            return Err(WardenError::NoRepositorySelected(format!(
                "identity {id} has not selected a repository"
            )));
        };
        let credential = Credential::new(identity.id, identity.token, repo);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(id.to_string(), credential.clone());
        }
        Ok(credential)
    }

    /// Cached credential of `id` if it still targets `repo`, else the durable
    /// record. Selections made by another handle are only visible in the latter.
    fn credential_for(&self, id: &str, repo: &RepoRef) -> Result<Credential, WardenError> {
        match self.cached(id) {
            Some(credential) if credential.repository == *repo => Ok(credential),
            _ => self.load(id),
        }
    }

    fn cached(&self, id: &str) -> Option<Credential> {
        self.cache.read().ok()?.get(id).cloned()
    }

    fn evict(&self, id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(id);
        }
    }

    fn identities_for_repo(&self, repo: &RepoRef) -> Result<Vec<String>, WardenError> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM identities WHERE selected_repo = ?1 ORDER BY created_at, id",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![repo.full_name()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    fn identity_count(&self) -> Result<i64, WardenError> {
        let conn = self.db.conn()?;
        conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .map_err(db_err)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get(&self, identity: &str) -> Result<Credential, WardenError> {
        if let Some(credential) = self.cached(identity) {
            return Ok(credential);
        }
        self.load(identity)
    }

    async fn refresh(&self, identity: &str) -> Result<Credential, WardenError> {
        debug!(identity, "refreshing credential from store");
        self.evict(identity);
        self.load(identity)
    }

    async fn select_repository(&self, identity: &str, repo: &RepoRef) -> Result<(), WardenError> {
        self.set_selected_repo(identity, repo)
    }

    async fn resolve(
        &self,
        repo: &RepoRef,
        selector: Option<&str>,
    ) -> Result<Credential, WardenError> {
        if let Some(id) = selector {
            let credential = self.credential_for(id, repo)?;
            if credential.repository != *repo {
                return Err(WardenError::NoRepositorySelected(format!(
                    "identity {id} selected {} rather than {repo}",
                    credential.repository
                )));
            }
            return Ok(credential);
        }

        let candidates = self.identities_for_repo(repo)?;
        let chosen = match self.default_identity.as_deref() {
            Some(default) if candidates.iter().any(|c| c == default) => Some(default.to_string()),
            _ => candidates.into_iter().next(),
        };
        match chosen {
            Some(id) => self.credential_for(&id, repo),
            None if self.identity_count()? == 0 => Err(WardenError::NoCredential(
                "no identity has completed authorization".into(),
            )),
            None => Err(WardenError::NoRepositorySelected(format!(
                "no identity selected {repo}"
            ))),
        }
    }
}

struct RawIdentity {
    id: String,
    login: String,
    token: String,
    selected_repo: Option<String>,
    created_at: String,
    updated_at: String,
}

fn raw_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawIdentity> {
    Ok(RawIdentity {
        id: row.get(0)?,
        login: row.get(1)?,
        token: row.get(2)?,
        selected_repo: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl RawIdentity {
    fn into_identity(self) -> Result<Identity, WardenError> {
        let selected_repo = self
            .selected_repo
            .as_deref()
            .map(str::parse::<RepoRef>)
            .transpose()?;
        Ok(Identity {
            id: self.id,
            login: self.login,
            token: self.token,
            selected_repo,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
