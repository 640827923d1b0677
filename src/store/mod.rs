//! Durable keyed payload store backed by SQLite.
//!
//! The [`PayloadStore`] is the only gateway to `payloads.db` in the cache
//! directory. Every value is stored together with its [`PayloadKind`] so a
//! typed read can detect schema drift between versions sharing one cache.
//!
//! Each operation acquires a pooled connection for exactly one statement and
//! releases it on return. Individual reads and writes are atomic; there are
//! no multi-key transactions and concurrent writes to one key are
//! last-write-wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::credentials::Credential;
use crate::types::{ContactRecord, InboundMessage};

/// File name of the database inside the cache directory.
pub const DB_FILE_NAME: &str = "payloads.db";

/// Key under which the process-wide credential is stored.
pub const CREDENTIAL_KEY: &str = "access_token";

/// Maximum pooled connections.
const MAX_CONNECTIONS: u32 = 4;

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT_SECS: u64 = 5;

/// Schema bootstrap, idempotent.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_payloads.sql");

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from payload store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No value is stored under the key.
    #[error("payload not found: {0}")]
    NotFound(String),

    /// The stored value does not have the expected shape.
    #[error("payload under {key:?} is {found}, expected {expected}")]
    TypeMismatch {
        /// Key that was read.
        key: String,
        /// Kind the caller asked for.
        expected: PayloadKind,
        /// Kind (or decode failure) actually found.
        found: String,
    },

    /// The stored kind tag is not one this version understands.
    #[error("payload under {key:?} has unknown kind {kind:?}")]
    UnknownKind {
        /// Key that was read.
        key: String,
        /// Raw tag found in the database.
        kind: String,
    },

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A payload could not be serialized for storage.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The cache directory could not be prepared.
    #[error("cache directory {path}: {source}")]
    Io {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Payload kinds
// ---------------------------------------------------------------------------

/// Shape tag persisted alongside every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// An [`InboundMessage`].
    Message,
    /// A [`ContactRecord`].
    Contact,
    /// A [`Credential`].
    Credential,
}

impl PayloadKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Contact => "contact",
            Self::Credential => "credential",
        }
    }

    /// Parse from a SQLite text value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "contact" => Some(Self::Contact),
            "credential" => Some(Self::Credential),
            _ => None,
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value that can be stored through the typed accessors.
pub trait Payload: Serialize + DeserializeOwned {
    /// Tag written next to the serialized body.
    const KIND: PayloadKind;
}

impl Payload for InboundMessage {
    const KIND: PayloadKind = PayloadKind::Message;
}

impl Payload for ContactRecord {
    const KIND: PayloadKind = PayloadKind::Contact;
}

impl Payload for Credential {
    const KIND: PayloadKind = PayloadKind::Credential;
}

/// A raw stored value: kind tag plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPayload {
    /// Shape tag.
    pub kind: PayloadKind,
    /// Serialized payload.
    pub body: serde_json::Value,
}

impl StoredPayload {
    /// Wrap a typed payload for storage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Encode`] if the payload cannot be serialized.
    pub fn encode<T: Payload>(payload: &T) -> Result<Self, StoreError> {
        Ok(Self {
            kind: T::KIND,
            body: serde_json::to_value(payload)?,
        })
    }

    /// Decode into `T`, checking the kind tag first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TypeMismatch`] if the tag differs or the body
    /// does not deserialize into `T`.
    pub fn decode<T: Payload>(self, key: &str) -> Result<T, StoreError> {
        if self.kind != T::KIND {
            return Err(StoreError::TypeMismatch {
                key: key.to_owned(),
                expected: T::KIND,
                found: self.kind.as_str().to_owned(),
            });
        }
        serde_json::from_value(self.body).map_err(|e| StoreError::TypeMismatch {
            key: key.to_owned(),
            expected: T::KIND,
            found: format!("undecodable {} ({e})", self.kind),
        })
    }
}

/// Key for a message payload.
pub fn message_key(message_id: &str) -> String {
    format!("message-{message_id}")
}

/// Key for a contact payload.
pub fn contact_key(contact_id: &str) -> String {
    format!("contact-{contact_id}")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable mapping from string keys to typed payloads.
///
/// Cheap to clone; clones share the underlying pool.
#[derive(Clone)]
pub struct PayloadStore {
    pool: SqlitePool,
    dir: PathBuf,
}

impl std::fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStore")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl PayloadStore {
    /// Open (creating if needed) the store inside `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created and
    /// [`StoreError::Database`] if the database cannot be opened or
    /// bootstrapped.
    pub async fn open(cache_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(cache_dir).map_err(|source| StoreError::Io {
            path: cache_dir.to_path_buf(),
            source,
        })?;

        let options = SqliteConnectOptions::new()
            .filename(cache_dir.join(DB_FILE_NAME))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;

        info!(dir = %cache_dir.display(), "payload store opened");
        Ok(Self {
            pool,
            dir: cache_dir.to_path_buf(),
        })
    }

    /// Directory holding the database file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the raw value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the key is absent, and
    /// [`StoreError::UnknownKind`] or [`StoreError::TypeMismatch`] when the
    /// row cannot be interpreted.
    pub async fn get(&self, key: &str) -> Result<StoredPayload, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT kind, body FROM payloads WHERE key = ?1")
                .bind(key)
                .fetch_optional(&mut *conn)
                .await?;
        drop(conn);

        let (kind, body) = row.ok_or_else(|| StoreError::NotFound(key.to_owned()))?;
        let kind = PayloadKind::parse(&kind).ok_or_else(|| StoreError::UnknownKind {
            key: key.to_owned(),
            kind: kind.clone(),
        })?;
        let body = serde_json::from_str(&body).map_err(|e| StoreError::TypeMismatch {
            key: key.to_owned(),
            expected: kind,
            found: format!("corrupt body ({e})"),
        })?;
        Ok(StoredPayload { kind, body })
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn set(&self, key: &str, value: &StoredPayload) -> Result<(), StoreError> {
        let body = serde_json::to_string(&value.body)?;
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "INSERT INTO payloads (key, kind, body) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET kind = excluded.kind, body = excluded.body, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(key)
        .bind(value.kind.as_str())
        .bind(body)
        .execute(&mut *conn)
        .await?;
        debug!(key, kind = %value.kind, "payload stored");
        Ok(())
    }

    async fn get_typed<T: Payload>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await {
            Ok(stored) => stored.decode(key).map(Some),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_typed<T: Payload>(&self, key: &str, payload: &T) -> Result<(), StoreError> {
        self.set(key, &StoredPayload::encode(payload)?).await
    }

    /// Load a message payload by platform message id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent, or
    /// [`StoreError::TypeMismatch`] if the key holds something else.
    pub async fn get_message(&self, message_id: &str) -> Result<InboundMessage, StoreError> {
        let key = message_key(message_id);
        self.get_typed(&key)
            .await?
            .ok_or(StoreError::NotFound(key))
    }

    /// Store a message payload under its platform message id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn set_message(
        &self,
        message_id: &str,
        payload: &InboundMessage,
    ) -> Result<(), StoreError> {
        self.set_typed(&message_key(message_id), payload).await
    }

    /// Load a contact payload by `openid`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if absent, or
    /// [`StoreError::TypeMismatch`] if the key holds something else.
    pub async fn get_contact(&self, contact_id: &str) -> Result<ContactRecord, StoreError> {
        let key = contact_key(contact_id);
        self.get_typed(&key)
            .await?
            .ok_or(StoreError::NotFound(key))
    }

    /// Store a contact payload under its `openid`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn set_contact(
        &self,
        contact_id: &str,
        payload: &ContactRecord,
    ) -> Result<(), StoreError> {
        self.set_typed(&contact_key(contact_id), payload).await
    }

    /// Load the persisted credential. Absence is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TypeMismatch`] if the credential key holds
    /// something else.
    pub async fn get_credential(&self) -> Result<Option<Credential>, StoreError> {
        self.get_typed(CREDENTIAL_KEY).await
    }

    /// Replace the persisted credential.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn set_credential(&self, payload: &Credential) -> Result<(), StoreError> {
        self.set_typed(CREDENTIAL_KEY, payload).await
    }

    /// Close the pool, waiting for in-use connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(dir = %self.dir.display(), "payload store closed");
    }
}
