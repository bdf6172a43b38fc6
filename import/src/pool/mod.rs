//! Connection-pool management.
//!
//! The NNTP wire protocol lives in an external library; the core only needs
//! two primitives from a pool of connections: a cheap existence probe
//! ([NntpPool::stat]) and a body stream ([NntpPool::get]). The
//! [PoolManager] owns at most one pool at a time and atomically replaces it
//! when the provider configuration changes.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use futures::ready;
use parking_lot::RwLock;
use pin_project_lite::pin_project;
use tracing::{debug, instrument};

use crate::config::ProviderConfig;
use crate::Error;

mod memory;
pub mod metrics;

pub use memory::MemoryNntpPool;
pub use metrics::{MetricsTracker, Snapshot, Totals};

/// Header-level information a STAT/HEAD round trip yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArticleStat {
    pub id: String,
    /// Declared byte count, when the server reports one.
    pub bytes: Option<u64>,
}

/// An [tokio::io::AsyncRead] yielding a raw yEnc article body.
pub trait ArticleBody: tokio::io::AsyncRead + Send + Unpin {}
impl<T: tokio::io::AsyncRead + Send + Unpin> ArticleBody for T {}

/// The pool surface the import core consumes.
#[async_trait]
pub trait NntpPool: Send + Sync {
    /// Label for metrics attribution, normally the primary provider host.
    fn name(&self) -> &str;

    /// Check the article exists on some provider, without fetching the body.
    async fn stat(&self, id: &str, groups: &[String]) -> io::Result<ArticleStat>;

    /// Stream the raw article body.
    async fn get(&self, id: &str, groups: &[String]) -> io::Result<Box<dyn ArticleBody>>;

    /// Drain and quit all connections. Dropping the pool must also release
    /// them; this exists for orderly QUITs on provider swaps.
    async fn close(&self) {}
}

/// Builds a pool from provider configuration. The returned pool is expected
/// to connect lazily; construction itself must not block on the network.
pub type PoolFactory =
    Box<dyn Fn(&[ProviderConfig]) -> Result<Arc<dyn NntpPool>, Error> + Send + Sync>;

/// Owns the single process-wide pool and its metrics.
///
/// Reads take the shared lock; [PoolManager::set_providers] takes the
/// exclusive lock for the swap, so a caller sees either the previous pool in
/// full or the new one in full, never a torn view.
pub struct PoolManager {
    pool: RwLock<Option<Arc<dyn NntpPool>>>,
    factory: PoolFactory,
    metrics: Arc<MetricsTracker>,
}

impl PoolManager {
    pub fn new(factory: PoolFactory) -> Self {
        Self::with_metrics(factory, Arc::new(MetricsTracker::new()))
    }

    pub fn with_metrics(factory: PoolFactory, metrics: Arc<MetricsTracker>) -> Self {
        PoolManager {
            pool: RwLock::new(None),
            factory,
            metrics,
        }
    }

    /// Non-blocking pool lookup.
    pub fn get_pool(&self) -> Result<Arc<dyn NntpPool>, Error> {
        self.pool.read().clone().ok_or(Error::NoPool)
    }

    pub fn has_pool(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Atomically replace the pool. An empty provider list clears it. The
    /// previous pool is drain-quit after the swap.
    #[instrument(skip_all, fields(providers = providers.len()))]
    pub async fn set_providers(&self, providers: &[ProviderConfig]) -> Result<(), Error> {
        let next = if providers.is_empty() {
            None
        } else {
            let pool = (self.factory)(providers)?;
            Some(Arc::new(MeteredPool {
                inner: pool,
                metrics: self.metrics.clone(),
            }) as Arc<dyn NntpPool>)
        };

        let previous = {
            let mut slot = self.pool.write();
            std::mem::replace(&mut *slot, next)
        };

        if let Some(previous) = previous {
            debug!(pool = previous.name(), "draining replaced pool");
            previous.close().await;
        }
        Ok(())
    }

    pub async fn clear_pool(&self) {
        let previous = self.pool.write().take();
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsTracker> {
        &self.metrics
    }

    pub fn get_metrics(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset()
    }
}

/// Wraps the factory-built pool so every stat/get feeds the metrics tracker.
struct MeteredPool {
    inner: Arc<dyn NntpPool>,
    metrics: Arc<MetricsTracker>,
}

#[async_trait]
impl NntpPool for MeteredPool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn stat(&self, id: &str, groups: &[String]) -> io::Result<ArticleStat> {
        match self.inner.stat(id, groups).await {
            Ok(stat) => Ok(stat),
            Err(e) => {
                self.metrics.record_error(self.inner.name());
                Err(e)
            }
        }
    }

    async fn get(&self, id: &str, groups: &[String]) -> io::Result<Box<dyn ArticleBody>> {
        match self.inner.get(id, groups).await {
            Ok(body) => {
                self.metrics.record_article_downloaded();
                Ok(Box::new(MeteredBody {
                    inner: body,
                    metrics: self.metrics.clone(),
                }))
            }
            Err(e) => {
                self.metrics.record_error(self.inner.name());
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

pin_project! {
    /// Counts bytes flowing out of an article body stream.
    struct MeteredBody {
        #[pin]
        inner: Box<dyn ArticleBody>,
        metrics: Arc<MetricsTracker>,
    }
}

impl tokio::io::AsyncRead for MeteredBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let filled_before = buf.filled().len();
        let this = self.project();
        ready!(this.inner.poll_read(cx, buf))?;
        let bytes_read = buf.filled().len() - filled_before;
        if bytes_read > 0 {
            this.metrics.record_download(bytes_read as i64);
        }
        Ok(()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn memory_factory(pool: Arc<MemoryNntpPool>) -> PoolFactory {
        Box::new(move |_providers| Ok(pool.clone() as Arc<dyn NntpPool>))
    }

    fn provider(host: &str) -> ProviderConfig {
        serde_json::from_str(&format!(r#"{{"host": "{host}"}}"#)).expect("provider")
    }

    #[tokio::test]
    async fn empty_provider_list_clears_pool() {
        let manager = PoolManager::new(memory_factory(Arc::new(MemoryNntpPool::default())));
        assert!(!manager.has_pool());
        assert!(matches!(manager.get_pool(), Err(Error::NoPool)));

        manager.set_providers(&[provider("a")]).await.expect("set");
        assert!(manager.has_pool());

        manager.set_providers(&[]).await.expect("clear via set");
        assert!(matches!(manager.get_pool(), Err(Error::NoPool)));
    }

    #[tokio::test]
    async fn swap_replaces_whole_pool() {
        let first = Arc::new(MemoryNntpPool::named("first"));
        let second = Arc::new(MemoryNntpPool::named("second"));

        let pools = parking_lot::Mutex::new(vec![
            second.clone() as Arc<dyn NntpPool>,
            first.clone() as Arc<dyn NntpPool>,
        ]);
        let manager = PoolManager::new(Box::new(move |_| Ok(pools.lock().pop().expect("pool"))));

        manager.set_providers(&[provider("a")]).await.expect("set");
        assert_eq!("first", manager.get_pool().expect("pool").name());

        manager.set_providers(&[provider("b")]).await.expect("swap");
        assert_eq!("second", manager.get_pool().expect("pool").name());
        assert_eq!(1, first.close_count());
    }

    #[tokio::test]
    async fn metered_get_counts_bytes_and_articles() {
        let inner = Arc::new(MemoryNntpPool::default());
        inner.put_article("a@test", b"raw body".to_vec());

        let manager = PoolManager::new(memory_factory(inner));
        manager.set_providers(&[provider("a")]).await.expect("set");

        let pool = manager.get_pool().expect("pool");
        let mut body = pool.get("a@test", &[]).await.expect("get");
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.expect("read");

        let snap = manager.get_metrics();
        assert_eq!(8, snap.totals.bytes_downloaded);
        assert_eq!(1, snap.totals.articles_downloaded);
    }

    #[tokio::test]
    async fn metered_errors_attribute_to_provider() {
        let inner = Arc::new(MemoryNntpPool::named("news.example.com"));
        let manager = PoolManager::new(memory_factory(inner));
        manager.set_providers(&[provider("a")]).await.expect("set");

        let pool = manager.get_pool().expect("pool");
        pool.stat("missing@test", &[]).await.expect_err("missing");

        let snap = manager.get_metrics();
        assert_eq!(1, snap.totals.errors);
        assert_eq!(
            Some(&1),
            snap.totals.per_provider_errors.get("news.example.com")
        );
    }
}
