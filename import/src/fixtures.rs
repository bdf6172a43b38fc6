//! Shared test fixtures: a seeded in-memory pool behind a manager, and
//! helpers to turn payload chunks into yEnc articles plus the matching
//! segment lists.

use std::sync::Arc;

use crate::config::ProviderConfig;
use crate::nzb::{ParsedFile, Segment};
use crate::pool::{MemoryNntpPool, NntpPool, PoolManager};
use crate::yenc;

pub(crate) fn provider(host: &str) -> ProviderConfig {
    ProviderConfig {
        host: host.to_string(),
        port: 563,
        tls: true,
        username: String::new(),
        password: String::new(),
        max_connections: 4,
    }
}

/// A pool manager whose factory always hands back the given memory pool.
pub(crate) async fn manager_with(pool: Arc<MemoryNntpPool>) -> Arc<PoolManager> {
    let factory_pool = pool.clone();
    let manager = Arc::new(PoolManager::new(Box::new(move |_| {
        Ok(factory_pool.clone() as Arc<dyn NntpPool>)
    })));
    manager
        .set_providers(&[provider("news.example.com")])
        .await
        .expect("set providers");
    manager
}

/// Store `chunks` as yEnc articles in the pool and return the ParsedFile
/// describing them. Article ids are `<name>-<index>@test`.
pub(crate) fn file_from_chunks(name: &str, chunks: &[&[u8]], pool: &MemoryNntpPool) -> ParsedFile {
    let mut segments = Vec::with_capacity(chunks.len());
    let mut size = 0i64;

    for (i, chunk) in chunks.iter().enumerate() {
        let id = format!("{name}-{i}@test");
        pool.put_article(&id, yenc::encode(name, chunk));
        segments.push(Segment {
            id,
            start: 0,
            end: chunk.len() as i64 - 1,
            size: chunk.len() as i64,
        });
        size += chunk.len() as i64;
    }

    ParsedFile {
        filename: name.to_string(),
        size,
        groups: vec!["alt.binaries.test".to_string()],
        segments,
        ..Default::default()
    }
}
