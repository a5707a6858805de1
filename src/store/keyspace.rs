// fjall-backed store
//
// Partitions:
//   clients       id(16)              -> ClientRecord (bincode)
//   client_names  name                -> id(16)
//   files         id(16) ++ file_name -> FileRecord (bincode)

use super::{ClientRecord, FileRecord, Persistence};
use crate::crypto::SymmetricKey;
use crate::error::Result;
use crate::protocol::ClientId;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::de::DeserializeOwned;
use std::path::Path;

/// The opened database. One per process.
pub struct Store {
    keyspace: Keyspace,
    clients: PartitionHandle,
    names: PartitionHandle,
    files: PartitionHandle,
}

impl Store {
    /// Open or create the database under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let keyspace = Config::new(path).open()?;
        let clients = keyspace.open_partition("clients", PartitionCreateOptions::default())?;
        let names = keyspace.open_partition("client_names", PartitionCreateOptions::default())?;
        let files = keyspace.open_partition("files", PartitionCreateOptions::default())?;

        tracing::debug!("Opened store at {}", path.display());

        Ok(Self {
            keyspace,
            clients,
            names,
            files,
        })
    }

    /// A private handle for one connection worker.
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            keyspace: self.keyspace.clone(),
            clients: self.clients.clone(),
            names: self.names.clone(),
            files: self.files.clone(),
        }
    }
}

/// Per-worker access to the store.
#[derive(Clone)]
pub struct StoreHandle {
    keyspace: Keyspace,
    clients: PartitionHandle,
    names: PartitionHandle,
    files: PartitionHandle,
}

fn file_key(id: &ClientId, file_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + file_name.len());
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(file_name.as_bytes());
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

impl StoreHandle {
    fn commit(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    fn put_client(&self, client: &ClientRecord) -> Result<()> {
        self.clients
            .insert(client.id.to_vec(), bincode::serialize(client)?)?;
        Ok(())
    }

    fn put_file(&self, file: &FileRecord) -> Result<()> {
        let key = file_key(&ClientId(file.client_id), &file.file_name);
        self.files.insert(key, bincode::serialize(file)?)?;
        Ok(())
    }
}

impl Persistence for StoreHandle {
    fn lookup_client_by_name(&self, name: &str) -> Result<Option<ClientRecord>> {
        match self.names.get(name.as_bytes())? {
            Some(id) => {
                let id = ClientId::from_slice(&id)?;
                self.lookup_client_by_id(&id)
            }
            None => Ok(None),
        }
    }

    fn lookup_client_by_id(&self, id: &ClientId) -> Result<Option<ClientRecord>> {
        self.clients
            .get(id.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn insert_client(&self, client: &ClientRecord) -> Result<()> {
        let mut batch = self.keyspace.batch();
        batch.insert(&self.clients, client.id.to_vec(), bincode::serialize(client)?);
        batch.insert(&self.names, client.name.as_bytes().to_vec(), client.id.to_vec());
        batch.commit()?;
        self.commit()
    }

    fn update_client_keys(
        &self,
        id: &ClientId,
        public_key: &[u8],
        symmetric_key: &SymmetricKey,
    ) -> Result<bool> {
        let Some(mut client) = self.lookup_client_by_id(id)? else {
            return Ok(false);
        };
        client.public_key = Some(public_key.to_vec());
        client.symmetric_key = Some(symmetric_key.as_bytes().to_vec());
        client.last_seen = chrono::Utc::now().timestamp();
        self.put_client(&client)?;
        self.commit()?;
        Ok(true)
    }

    fn file_exists(&self, id: &ClientId, file_name: &str) -> Result<bool> {
        Ok(self.files.contains_key(file_key(id, file_name))?)
    }

    fn lookup_file(&self, id: &ClientId, file_name: &str) -> Result<Option<FileRecord>> {
        self.files
            .get(file_key(id, file_name))?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn insert_file(&self, file: &FileRecord) -> Result<()> {
        self.put_file(file)?;
        self.commit()
    }

    fn mark_verified(&self, id: &ClientId, file_name: &str) -> Result<bool> {
        let Some(mut file) = self.lookup_file(id, file_name)? else {
            return Ok(false);
        };
        file.verified = true;
        self.put_file(&file)?;
        self.commit()?;
        Ok(true)
    }

    fn delete_file(&self, id: &ClientId, file_name: &str) -> Result<Option<FileRecord>> {
        let existing = self.lookup_file(id, file_name)?;
        if existing.is_some() {
            self.files.remove(file_key(id, file_name))?;
            self.commit()?;
        }
        Ok(existing)
    }
}
