//! # Block Cache
//!
//! A bounded LRU of recently read blocks in front of storage, with
//! single-flight coalescing: concurrent misses for the same height share
//! one underlying fetch, and every waiter gets that fetch's result (or
//! error).
//!
//! ```text
//!   get(h) ──► LRU hit? ──yes──► Arc<Block>
//!                 │no
//!                 ▼
//!          in-flight[h]? ──yes──► await shared fetch
//!                 │no
//!                 ▼
//!          start fetch, publish in in-flight[h], await
//!                 │
//!                 ▼
//!          put into LRU, then remove in-flight[h]
//! ```
//!
//! The LRU is filled before the in-flight entry is removed, so a caller
//! arriving in between always finds one or the other.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use super::block::Block;
use super::db::{DbError, LedgerDB};
use crate::config::BLOCK_CACHE_CAPACITY;

/// Error handed to every waiter of a failed fetch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("block fetch failed: {0}")]
    Fetch(Arc<DbError>),
}

/// Where cache misses are served from.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    async fn fetch_block(&self, height: u64) -> Result<Option<Block>, DbError>;
}

#[async_trait]
impl BlockSource for LedgerDB {
    async fn fetch_block(&self, height: u64) -> Result<Option<Block>, DbError> {
        self.get_block(height)
    }
}

type FetchResult = Result<Option<Arc<Block>>, CacheError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

pub struct BlockCache<S: BlockSource> {
    source: Arc<S>,
    lru: Mutex<LruCache<u64, Arc<Block>>>,
    inflight: DashMap<u64, SharedFetch>,
}

impl<S: BlockSource> BlockCache<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self::with_capacity(source, BLOCK_CACHE_CAPACITY)
    }

    pub fn with_capacity(source: Arc<S>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            lru: Mutex::new(LruCache::new(capacity)),
            inflight: DashMap::new(),
        }
    }

    /// Block at `height`, or `None` if storage has none. Absence is not cached.
    pub async fn get(&self, height: u64) -> FetchResult {
        if let Some(block) = self.lru.lock().get(&height) {
            return Ok(Some(Arc::clone(block)));
        }

        let fetch = match self.inflight.entry(height) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // A fetch may have finished between the LRU check and here.
                if let Some(block) = self.lru.lock().get(&height) {
                    return Ok(Some(Arc::clone(block)));
                }
                debug!(height, "block cache miss, fetching");
                let source = Arc::clone(&self.source);
                let fetch = async move {
                    source
                        .fetch_block(height)
                        .await
                        .map(|found| found.map(Arc::new))
                        .map_err(|e| CacheError::Fetch(Arc::new(e)))
                }
                .boxed()
                .shared();
                entry.insert(fetch.clone());
                fetch
            }
        };

        let result = fetch.clone().await;
        if let Ok(Some(block)) = &result {
            self.lru.lock().put(height, Arc::clone(block));
        }
        self.inflight
            .remove_if(&height, |_, current| current.ptr_eq(&fetch));
        result
    }

    /// Seed the cache with a block that was just committed.
    pub fn insert(&self, block: Arc<Block>) {
        self.lru.lock().put(block.height(), block);
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, height: u64) -> bool {
        self.lru.lock().contains(&height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::ConsensusProgram;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Source that counts fetches and answers slowly.
    struct CountingSource {
        fetches: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl BlockSource for CountingSource {
        async fn fetch_block(&self, height: u64) -> Result<Option<Block>, DbError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(DbError::NotFound(format!("block {height}")));
            }
            if height == 0 {
                return Ok(None);
            }
            let mut block = Block::initial(height, ConsensusProgram::open());
            block.header.height = height;
            Ok(Some(block))
        }
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        let source = CountingSource::new(false);
        let cache = Arc::new(BlockCache::new(Arc::clone(&source)));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get(7).await })
            })
            .collect();

        for handle in handles {
            let block = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(block.height(), 7);
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(cache.contains(7));
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn hits_do_not_refetch() {
        let source = CountingSource::new(false);
        let cache = BlockCache::new(Arc::clone(&source));
        cache.get(3).await.unwrap();
        cache.get(3).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_reach_every_waiter_and_are_not_cached() {
        let source = CountingSource::new(true);
        let cache = Arc::new(BlockCache::new(Arc::clone(&source)));

        let (a, b) = tokio::join!(cache.get(5), cache.get(5));
        assert!(matches!(a, Err(CacheError::Fetch(_))));
        assert!(matches!(b, Err(CacheError::Fetch(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty());

        let _ = cache.get(5).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_blocks_are_not_cached() {
        let source = CountingSource::new(false);
        let cache = BlockCache::new(Arc::clone(&source));
        assert!(cache.get(0).await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_bounds_the_cache() {
        let source = CountingSource::new(false);
        let cache = BlockCache::with_capacity(Arc::clone(&source), 2);
        for h in 1..=3 {
            cache.get(h).await.unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(1));
        assert!(cache.contains(3));
    }

    #[tokio::test]
    async fn ledger_db_serves_as_source() {
        use crate::state::snapshot::Snapshot;
        use crate::storage::db::BlockCommit;

        let db = Arc::new(LedgerDB::open_temporary().unwrap());
        let block = Block::initial(1, ConsensusProgram::open());
        db.commit_block(&BlockCommit {
            block: &block,
            snapshot: &Snapshot::default(),
            spent: vec![],
            created: vec![],
            asset_changes: vec![],
        })
        .unwrap();

        let cache = BlockCache::new(db);
        assert_eq!(*cache.get(1).await.unwrap().unwrap(), block);
        assert!(cache.get(2).await.unwrap().is_none());
    }
}
