//! Registration, public key exchange and reconnection.
//!
//! Every operation runs its whole lookup-then-write sequence inside one
//! persistence scope, on the blocking pool (RSA wrapping included).

use super::Resources;
use crate::crypto::{self, SymmetricKey};
use crate::error::{Result, TransferError};
use crate::files::validate_client_name;
use crate::protocol::ClientId;
use crate::store::{ClientRecord, Persistence};

/// A fresh symmetric key and its RSA-wrapped form.
#[derive(Debug)]
pub struct WrappedKey {
    pub symmetric_key: SymmetricKey,
    pub encrypted_key: Vec<u8>,
}

/// Look up the client by id and require the asserted name to match.
///
/// Unknown id and wrong name are the same failure.
fn validate_identity<P: Persistence>(db: &P, id: &ClientId, name: &str) -> Result<ClientRecord> {
    match db.lookup_client_by_id(id)? {
        Some(client) if client.name == name => Ok(client),
        _ => Err(TransferError::UnregisteredClient(id.to_string())),
    }
}

/// Generate a key, wrap it for `public_key` and store both.
///
/// Nothing is written if the key cannot be wrapped.
fn rotate_key<P: Persistence>(db: &P, id: &ClientId, public_key: &[u8]) -> Result<WrappedKey> {
    let symmetric_key = SymmetricKey::generate();
    let encrypted_key = crypto::wrap_key(public_key, &symmetric_key)?;
    if !db.update_client_keys(id, public_key, &symmetric_key)? {
        return Err(TransferError::UnregisteredClient(id.to_string()));
    }
    Ok(WrappedKey {
        symmetric_key,
        encrypted_key,
    })
}

impl<P: Persistence> Resources<P> {
    pub async fn register(&self, name: &str) -> Result<ClientId> {
        validate_client_name(name)?;

        let name = name.to_string();
        let id = self
            .persist(move |db| {
                if let Some(existing) = db.lookup_client_by_name(&name)? {
                    return Err(TransferError::DuplicateClient(format!(
                        "{} (id {})",
                        name,
                        existing.client_id()
                    )));
                }
                let id = loop {
                    let candidate = ClientId::random();
                    if db.lookup_client_by_id(&candidate)?.is_none() {
                        break candidate;
                    }
                };
                db.insert_client(&ClientRecord::new(id, &name))?;
                tracing::info!("Client {} registered as {:?}", id, name);
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    pub async fn exchange_public_key(
        &self,
        id: ClientId,
        name: &str,
        public_key: &[u8],
    ) -> Result<WrappedKey> {
        let name = name.to_string();
        let public_key = public_key.to_vec();
        self.persist(move |db| {
            validate_identity(db, &id, &name)?;
            let wrapped = rotate_key(db, &id, &public_key).map_err(|e| {
                if let TransferError::Crypto(_) = e {
                    tracing::warn!("Public key of client {} is corrupted", id);
                }
                e
            })?;
            tracing::info!(
                "Client {} sent a {}-byte public key, issued new symmetric key",
                id,
                public_key.len()
            );
            Ok(wrapped)
        })
        .await
    }

    /// Re-wrap the stored public key with a brand new symmetric key.
    pub async fn reconnect(&self, id: ClientId, name: &str) -> Result<WrappedKey> {
        let name = name.to_string();
        self.persist(move |db| {
            let client = validate_identity(db, &id, &name)?;
            let public_key = client
                .public_key
                .ok_or_else(|| TransferError::UnregisteredClient(id.to_string()))?;
            let wrapped = rotate_key(db, &id, &public_key)?;
            tracing::info!("Client {} reconnected, symmetric key rotated", id);
            Ok(wrapped)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::ClientFiles;
    use crate::server::locks::Coordinator;
    use crate::store::Store;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn resources(tmp: &TempDir) -> (Store, Resources<crate::store::StoreHandle>) {
        let store = Store::open(&tmp.path().join("db")).unwrap();
        let resources = Resources {
            store: store.handle(),
            files: ClientFiles::new(tmp.path()),
            coordinator: Arc::new(Coordinator::new()),
        };
        (store, resources)
    }

    fn keypair() -> (RsaPrivateKey, Vec<u8>) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .unwrap()
            .as_bytes()
            .to_vec();
        (private, der)
    }

    #[tokio::test]
    async fn test_register_then_duplicate() {
        let tmp = TempDir::new().unwrap();
        let (_store, res) = resources(&tmp);

        let id = res.register("alice").await.unwrap();
        assert_ne!(id, ClientId::NIL);

        let err = res.register("alice").await.unwrap_err();
        assert!(matches!(err, TransferError::DuplicateClient(_)));

        let other = res.register("bob").await.unwrap();
        assert_ne!(other, id);
    }

    #[tokio::test]
    async fn test_register_rejects_path_like_names() {
        let tmp = TempDir::new().unwrap();
        let (_store, res) = resources(&tmp);
        assert!(matches!(
            res.register("../root").await,
            Err(TransferError::Protocol(_))
        ));
        assert!(matches!(res.register("").await, Err(TransferError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_exchange_requires_matching_name() {
        let tmp = TempDir::new().unwrap();
        let (_store, res) = resources(&tmp);
        let (private, der) = keypair();
        let id = res.register("alice").await.unwrap();

        let err = res.exchange_public_key(id, "mallory", &der).await.unwrap_err();
        assert!(matches!(err, TransferError::UnregisteredClient(_)));

        let err = res
            .exchange_public_key(ClientId::random(), "alice", &der)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnregisteredClient(_)));

        let wrapped = res.exchange_public_key(id, "alice", &der).await.unwrap();
        assert_eq!(wrapped.encrypted_key.len(), 128);
        let unwrapped = crypto::unwrap_key(&private, &wrapped.encrypted_key).unwrap();
        assert_eq!(unwrapped, wrapped.symmetric_key);

        let stored = res.store.lookup_client_by_id(&id).unwrap().unwrap();
        assert_eq!(stored.symmetric_key(), Some(wrapped.symmetric_key));
        assert_eq!(stored.public_key, Some(der));
    }

    #[tokio::test]
    async fn test_corrupt_key_persists_nothing() {
        let tmp = TempDir::new().unwrap();
        let (_store, res) = resources(&tmp);
        let id = res.register("alice").await.unwrap();

        let err = res
            .exchange_public_key(id, "alice", &[0x42; 160])
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Crypto(_)));
        let stored = res.store.lookup_client_by_id(&id).unwrap().unwrap();
        assert!(stored.public_key.is_none());
        assert!(stored.symmetric_key.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_rotates_key() {
        let tmp = TempDir::new().unwrap();
        let (_store, res) = resources(&tmp);
        let (private, der) = keypair();
        let id = res.register("alice").await.unwrap();

        // no public key on file yet
        assert!(matches!(
            res.reconnect(id, "alice").await,
            Err(TransferError::UnregisteredClient(_))
        ));

        let first = res.exchange_public_key(id, "alice", &der).await.unwrap();
        let second = res.reconnect(id, "alice").await.unwrap();
        assert_ne!(first.symmetric_key, second.symmetric_key);
        assert_eq!(
            crypto::unwrap_key(&private, &second.encrypted_key).unwrap(),
            second.symmetric_key
        );

        assert!(matches!(
            res.reconnect(id, "alicia").await,
            Err(TransferError::UnregisteredClient(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_winner() {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("db")).unwrap();
        let coordinator = Arc::new(Coordinator::new());

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let res = Resources {
                store: store.handle(),
                files: ClientFiles::new(tmp.path()),
                coordinator: coordinator.clone(),
            };
            tasks.push(tokio::spawn(async move { res.register("zed").await.is_ok() }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
