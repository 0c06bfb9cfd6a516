//! Generation-stamped, lazily built client handle.
//!
//! The first caller builds the client through the async factory; concurrent
//! callers wait on the same [`OnceCell`]. A failed generation is discarded
//! with [`ReloadingCell::invalidate`]; only the first invalidation of a given
//! generation takes effect, so a burst of failures triggers one rebuild.

use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Async constructor of the wrapped client
pub type ClientFactory<S> = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<S>>> + Send + Sync>;

struct Generation<S: ?Sized> {
    id: u64,
    cell: Arc<OnceCell<Arc<S>>>,
}

impl<S: ?Sized> Generation<S> {
    fn new(id: u64) -> Self {
        Self {
            id,
            cell: Arc::new(OnceCell::new()),
        }
    }
}

pub struct ReloadingCell<S: ?Sized> {
    target: &'static str,
    factory: ClientFactory<S>,
    current: Mutex<Generation<S>>,
}

impl<S: ?Sized> fmt::Debug for ReloadingCell<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadingCell")
            .field("target", &self.target)
            .field("generation", &self.current.lock().id)
            .finish()
    }
}

impl<S: ?Sized + Send + Sync> ReloadingCell<S> {
    /// `target` labels logs and the reconnect metric
    pub fn new(target: &'static str, factory: ClientFactory<S>) -> Self {
        Self {
            target,
            factory,
            current: Mutex::new(Generation::new(0)),
        }
    }

    /// Current client and the generation it belongs to, building it on first use
    pub async fn instance(&self) -> Result<(u64, Arc<S>)> {
        let (id, cell) = {
            let current = self.current.lock();
            (current.id, current.cell.clone())
        };
        let client = cell.get_or_try_init(|| (self.factory)()).await?;
        Ok((id, client.clone()))
    }

    /// Discard generation `id`. Returns `false` if a newer generation already
    /// replaced it.
    pub fn invalidate(&self, id: u64) -> bool {
        let mut current = self.current.lock();
        if current.id != id {
            return false;
        }
        *current = Generation::new(id + 1);
        drop(current);

        info!(
            client = self.target,
            generation = id + 1,
            "Rebuilding client after authorization failure"
        );
        crate::stats::record_reconnect(self.target);
        true
    }

    pub fn generation(&self) -> u64 {
        self.current.lock().id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_factory(built: Arc<AtomicUsize>) -> ClientFactory<String> {
        Arc::new(move || {
            let built = built.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let n = built.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(Arc::new(format!("client-{}", n)))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_single_flight_construction() {
        let built = Arc::new(AtomicUsize::new(0));
        let cell = Arc::new(ReloadingCell::new("test", counting_factory(built.clone())));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.instance().await.map(|(_, c)| c) })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().as_str(), "client-0");
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_once_per_generation() {
        let built = Arc::new(AtomicUsize::new(0));
        let cell = ReloadingCell::new("test", counting_factory(built.clone()));

        let (generation, _) = cell.instance().await.unwrap();
        assert!(cell.invalidate(generation));
        assert!(!cell.invalidate(generation));

        let (next, client) = cell.instance().await.unwrap();
        assert_eq!(next, generation + 1);
        assert_eq!(client.as_str(), "client-1");
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_construction_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let factory: ClientFactory<String> = Arc::new(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Transient("connect".into()))
                } else {
                    Ok(Arc::new("ready".to_string()))
                }
            }
            .boxed()
        });
        let cell = ReloadingCell::new("test", factory);

        assert!(cell.instance().await.is_err());
        let (_, client) = cell.instance().await.unwrap();
        assert_eq!(client.as_str(), "ready");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
