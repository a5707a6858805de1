//! The two global lock domains shared by all connection handlers.
//!
//! Persistence and filesystem are each guarded by one mutex, independent of
//! which client a request concerns. A resource is only reachable through a
//! `Locked` guard, so a check-then-act sequence is correct exactly when it
//! runs inside a single guard's lifetime. Dropping the guard (on any path,
//! including `?`) releases the lock.
//!
//! When a sequence needs both, take filesystem first and persistence inside
//! it. Nothing takes them the other way round.

use std::ops::Deref;
use tokio::sync::{Mutex, MutexGuard};

/// Scoped access to a resource while its domain lock is held.
pub struct Locked<'a, T: ?Sized> {
    _guard: MutexGuard<'a, ()>,
    resource: &'a T,
}

impl<T: ?Sized> Deref for Locked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource
    }
}

#[derive(Debug, Default)]
pub struct Coordinator {
    persistence: Mutex<()>,
    filesystem: Mutex<()>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn persistence<'a, T: ?Sized>(&'a self, store: &'a T) -> Locked<'a, T> {
        Locked {
            _guard: self.persistence.lock().await,
            resource: store,
        }
    }

    pub async fn filesystem<'a, T: ?Sized>(&'a self, files: &'a T) -> Locked<'a, T> {
        Locked {
            _guard: self.filesystem.lock().await,
            resource: files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_persistence_scope_is_exclusive() {
        let coordinator = Arc::new(Coordinator::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let resource = ();
                let _scope = coordinator.persistence(&resource).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        let coordinator = Coordinator::new();
        let store = "store";
        let files = "files";
        let db = coordinator.persistence(&store).await;
        // filesystem lock is still available while persistence is held
        let fs = tokio::time::timeout(Duration::from_secs(1), coordinator.filesystem(&files))
            .await
            .expect("filesystem lock should not wait on persistence");
        assert_eq!(*db, "store");
        assert_eq!(*fs, "files");
    }

    #[tokio::test]
    async fn test_guard_released_on_error_path() {
        let coordinator = Coordinator::new();
        let value = 5u32;

        async fn failing(c: &Coordinator, v: &u32) -> Result<(), ()> {
            let scope = c.persistence(v).await;
            if *scope == 5 {
                return Err(());
            }
            Ok(())
        }

        assert!(failing(&coordinator, &value).await.is_err());
        let again = tokio::time::timeout(Duration::from_secs(1), coordinator.persistence(&value)).await;
        assert!(again.is_ok());
    }
}
