//! TCP server: accept connections and hand each one to a pooled worker.
//!
//! At most `max_workers` connections are served at once; further clients
//! wait in the listen backlog until a worker frees up.

pub mod handler;
mod keys;
pub mod locks;
pub mod session;
mod upload;

pub use handler::ConnectionHandler;
pub use keys::WrappedKey;

use crate::config::ServerConfig;
use crate::files::ClientFiles;
use crate::store::{Persistence, Store, StoreHandle};
use anyhow::{Context, Result};
use locks::Coordinator;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::Instrument;

/// Everything a connection worker needs to act on shared state.
///
/// Each worker owns its own store handle; the coordinator is shared.
pub struct Resources<P> {
    pub store: P,
    pub files: ClientFiles,
    pub coordinator: Arc<Coordinator>,
}

impl<P: Persistence> Resources<P> {
    /// Run `work` against the store on the blocking pool, inside one persistence scope.
    ///
    /// Store writes fsync, so they stay off the async workers.
    async fn persist<T, F>(&self, work: F) -> crate::error::Result<T>
    where
        F: FnOnce(&P) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.coordinator.persistence(&self.store).await;
        let store = (*db).clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(std::io::Error::other)?
    }
}

pub struct Server {
    listener: TcpListener,
    store: Store,
    files: ClientFiles,
    coordinator: Arc<Coordinator>,
    workers: Arc<Semaphore>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let store_dir = config.store_dir();
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
        let store = Store::open(&store_dir)
            .with_context(|| format!("Failed to open store at {}", store_dir.display()))?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        Ok(Self {
            listener,
            store,
            files: ClientFiles::new(&config.data_dir),
            coordinator: Arc::new(Coordinator::new()),
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// An extra handle on the server's store, for inspection.
    pub fn store_handle(&self) -> StoreHandle {
        self.store.handle()
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. In-flight connections are left to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                permit = self.workers.clone().acquire_owned() => permit?,
                _ = &mut shutdown => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };

            let resources = Resources {
                store: self.store.handle(),
                files: self.files.clone(),
                coordinator: self.coordinator.clone(),
            };

            tokio::spawn(
                async move {
                    tracing::info!("Accepted connection");
                    if let Err(e) = ConnectionHandler::new(stream, resources).run().await {
                        tracing::error!("Connection failed: {}", e);
                    }
                    tracing::info!("Connection closed");
                    drop(permit);
                }
                .instrument(tracing::info_span!("conn", %peer)),
            );
        }

        tracing::info!("Server shutting down");
        Ok(())
    }
}
