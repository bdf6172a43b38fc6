//! In-memory pool, for tests and local development.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ArticleBody, ArticleStat, NntpPool};

/// Serves articles out of a `message-id -> body` map. Counts calls so tests
/// can assert on probe and fetch behavior.
pub struct MemoryNntpPool {
    name: String,
    articles: RwLock<HashMap<String, Vec<u8>>>,
    stat_calls: AtomicUsize,
    get_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl Default for MemoryNntpPool {
    fn default() -> Self {
        Self::named("memory")
    }
}

impl MemoryNntpPool {
    pub fn named(name: &str) -> Self {
        MemoryNntpPool {
            name: name.to_string(),
            articles: RwLock::new(HashMap::new()),
            stat_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Store a raw article body under the given message id.
    pub fn put_article(&self, id: &str, body: Vec<u8>) {
        self.articles.write().insert(id.to_string(), body);
    }

    pub fn remove_article(&self, id: &str) {
        self.articles.write().remove(id);
    }

    pub fn stat_count(&self) -> usize {
        self.stat_calls.load(Ordering::Relaxed)
    }

    pub fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl NntpPool for MemoryNntpPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, id: &str, _groups: &[String]) -> io::Result<ArticleStat> {
        self.stat_calls.fetch_add(1, Ordering::Relaxed);
        let articles = self.articles.read();
        match articles.get(id) {
            Some(body) => Ok(ArticleStat {
                id: id.to_string(),
                bytes: Some(body.len() as u64),
            }),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such article: {id}"),
            )),
        }
    }

    async fn get(&self, id: &str, _groups: &[String]) -> io::Result<Box<dyn ArticleBody>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let articles = self.articles.read();
        match articles.get(id) {
            Some(body) => Ok(Box::new(Cursor::new(body.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such article: {id}"),
            )),
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::Relaxed);
    }
}
