//! Persistence for client identities and file records.
//!
//! The core only talks to the `Persistence` trait. Callers are expected to
//! hold the persistence lock (see `server::locks`) around every
//! check-then-act sequence; the store itself does no coordination.

mod keyspace;

pub use keyspace::{Store, StoreHandle};

use crate::crypto::SymmetricKey;
use crate::error::Result;
use crate::protocol::ClientId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: [u8; 16],
    pub name: String,
    /// DER public key as the client sent it
    pub public_key: Option<Vec<u8>>,
    pub symmetric_key: Option<Vec<u8>>,
    /// Unix seconds
    pub last_seen: i64,
}

impl ClientRecord {
    pub fn new(id: ClientId, name: impl Into<String>) -> Self {
        Self {
            id: id.0,
            name: name.into(),
            public_key: None,
            symmetric_key: None,
            last_seen: chrono::Utc::now().timestamp(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        ClientId(self.id)
    }

    pub fn symmetric_key(&self) -> Option<SymmetricKey> {
        self.symmetric_key
            .as_deref()
            .and_then(|k| SymmetricKey::from_slice(k).ok())
    }
}

/// An uploaded (or in-flight) file of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub client_id: [u8; 16],
    pub file_name: String,
    pub path: PathBuf,
    pub verified: bool,
}

impl FileRecord {
    pub fn new(client_id: ClientId, file_name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            client_id: client_id.0,
            file_name: file_name.into(),
            path,
            verified: false,
        }
    }
}

/// Synchronous record access. Calls may fsync, so async callers run them on
/// the blocking pool (see `Resources::persist`).
pub trait Persistence: Clone + Send + Sync + 'static {
    fn lookup_client_by_name(&self, name: &str) -> Result<Option<ClientRecord>>;

    fn lookup_client_by_id(&self, id: &ClientId) -> Result<Option<ClientRecord>>;

    fn insert_client(&self, client: &ClientRecord) -> Result<()>;

    /// Store new key material and refresh `last_seen`. Returns false if the client is unknown.
    fn update_client_keys(
        &self,
        id: &ClientId,
        public_key: &[u8],
        symmetric_key: &SymmetricKey,
    ) -> Result<bool>;

    fn file_exists(&self, id: &ClientId, file_name: &str) -> Result<bool>;

    fn lookup_file(&self, id: &ClientId, file_name: &str) -> Result<Option<FileRecord>>;

    fn insert_file(&self, file: &FileRecord) -> Result<()>;

    /// Returns false if there is no such record.
    fn mark_verified(&self, id: &ClientId, file_name: &str) -> Result<bool>;

    /// Remove the record, returning it if it existed.
    fn delete_file(&self, id: &ClientId, file_name: &str) -> Result<Option<FileRecord>>;
}
