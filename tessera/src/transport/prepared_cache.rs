//! Bounded caches with single-flight fills.
//!
//! Two caches share the machinery here: the prepared-statement cache,
//! keyed by (host, keyspace, statement text), and the routing-info cache,
//! keyed by (keyspace, statement text). Both guarantee that concurrent
//! callers for an absent key trigger exactly one fill; the losers wait on
//! the winner's completion signal.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::routing::partitioner::PartitionerName;
use crate::transport::errors::QueryError;
use bytes::Bytes;
use tessera_cql::frame::response::result::PartitionKeyIndex;

type FillResult<V> = Result<Arc<V>, QueryError>;

enum Slot<V> {
    /// A fill is in progress; waiters subscribe to the channel.
    /// The sender lives in the filling task.
    Inflight(watch::Receiver<Option<FillResult<V>>>),
    Ready(Arc<V>),
}

struct CacheInner<K, V> {
    entries: HashMap<K, (Slot<V>, u64)>,
    // LRU bookkeeping: ordinal of last use -> key.
    usage: BTreeMap<u64, K>,
    next_ordinal: u64,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn touch(&mut self, key: &K) {
        if let Some((_slot, ordinal)) = self.entries.get_mut(key) {
            self.usage.remove(ordinal);
            *ordinal = self.next_ordinal;
            self.usage.insert(self.next_ordinal, key.clone());
            self.next_ordinal += 1;
        }
    }

    fn insert(&mut self, key: K, slot: Slot<V>) {
        if let Some((_old_slot, old_ordinal)) = self.entries.remove(&key) {
            self.usage.remove(&old_ordinal);
        }
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.usage.insert(ordinal, key.clone());
        self.entries.insert(key, (slot, ordinal));
    }

    fn remove(&mut self, key: &K) {
        if let Some((_slot, ordinal)) = self.entries.remove(key) {
            self.usage.remove(&ordinal);
        }
    }

    // Evicts least-recently-used Ready entries until the cache fits in
    // `capacity`. Inflight entries are never evicted - that would break
    // the single-flight guarantee.
    fn evict_down_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let victim = self
                .usage
                .iter()
                .find(|(_ordinal, key)| {
                    matches!(self.entries.get(*key), Some((Slot::Ready(_), _)))
                })
                .map(|(_ordinal, key)| key.clone());

            match victim {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

/// A bounded LRU map whose misses are filled by an async closure,
/// with at most one fill in flight per key.
pub(crate) struct SingleFlightCache<K, V> {
    inner: StdMutex<CacheInner<K, V>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> SingleFlightCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: StdMutex::new(CacheInner {
                entries: HashMap::new(),
                usage: BTreeMap::new(),
                next_ordinal: 0,
            }),
            capacity,
        }
    }

    /// Returns the cached value, or fills it with `fill`. Concurrent calls
    /// for the same absent key run `fill` exactly once; all of them receive
    /// the same result. A failed fill clears the entry so that the next
    /// caller retries.
    pub(crate) async fn get_or_fill<F, Fut>(&self, key: K, fill: F) -> FillResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, QueryError>>,
    {
        enum Action<V> {
            Lead(watch::Sender<Option<FillResult<V>>>),
            Wait(watch::Receiver<Option<FillResult<V>>>),
        }

        let action = {
            let mut inner = self.inner.lock().unwrap();
            match inner.entries.get(&key) {
                Some((Slot::Ready(value), _)) => {
                    let value = value.clone();
                    inner.touch(&key);
                    return Ok(value);
                }
                Some((Slot::Inflight(receiver), _)) => Action::Wait(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    inner.insert(key.clone(), Slot::Inflight(receiver));
                    inner.evict_down_to(self.capacity);
                    Action::Lead(sender)
                }
            }
        };

        match action {
            Action::Lead(sender) => {
                let result: FillResult<V> = fill().await.map(Arc::new);

                {
                    let mut inner = self.inner.lock().unwrap();
                    match &result {
                        // The entry may have been invalidated while we were
                        // preparing; only fulfill a still-inflight slot.
                        Ok(value) => {
                            if let Some((slot @ Slot::Inflight(_), _)) =
                                inner.entries.get_mut(&key)
                            {
                                *slot = Slot::Ready(value.clone());
                            }
                        }
                        Err(_) => {
                            if matches!(inner.entries.get(&key), Some((Slot::Inflight(_), _))) {
                                inner.remove(&key);
                            }
                        }
                    }
                }

                // Waiters do not care whether this send reaches anyone.
                let _ = sender.send(Some(result.clone()));
                result
            }
            Action::Wait(mut receiver) => loop {
                {
                    let value = receiver.borrow_and_update();
                    if let Some(result) = value.as_ref() {
                        return result.clone();
                    }
                }
                if receiver.changed().await.is_err() {
                    // The filling task died without a verdict; report the
                    // connection as broken rather than looping forever.
                    return Err(QueryError::IoError(Arc::new(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "Connection broken",
                    ))));
                }
            },
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((Slot::Ready(value), _)) = inner.entries.get(key) {
            let value = value.clone();
            inner.touch(key);
            Some(value)
        } else {
            None
        }
    }

    pub(crate) fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(key);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

/// Value of the prepared-statement cache: what a host knows about
/// a statement prepared on it.
#[derive(Debug)]
pub(crate) struct PreparedEntry {
    id: Bytes,
    result_metadata_id: StdMutex<Option<Bytes>>,
}

impl PreparedEntry {
    pub(crate) fn new(id: Bytes, result_metadata_id: Option<Bytes>) -> Self {
        Self {
            id,
            result_metadata_id: StdMutex::new(result_metadata_id),
        }
    }

    pub(crate) fn id(&self) -> &Bytes {
        &self.id
    }

    pub(crate) fn result_metadata_id(&self) -> Option<Bytes> {
        self.result_metadata_id.lock().unwrap().clone()
    }

    pub(crate) fn update_result_metadata_id(&self, new_id: Bytes) {
        *self.result_metadata_id.lock().unwrap() = Some(new_id);
    }
}

pub(crate) type PreparedCacheKey = (Uuid, String, String);

/// Bounded per-host prepared statement cache with single-flight prepares.
pub(crate) struct PreparedStatementCache {
    cache: SingleFlightCache<PreparedCacheKey, PreparedEntry>,
}

impl PreparedStatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: SingleFlightCache::new(capacity),
        }
    }

    pub(crate) fn key(
        &self,
        host_id: Uuid,
        keyspace: Option<&str>,
        statement: &str,
    ) -> PreparedCacheKey {
        (
            host_id,
            keyspace.unwrap_or_default().to_owned(),
            statement.to_owned(),
        )
    }

    /// Returns the host's entry for the statement, preparing it with
    /// `prepare_fn` when absent. At most one PREPARE per key is in flight.
    pub(crate) async fn get_or_prepare<F, Fut>(
        &self,
        key: PreparedCacheKey,
        prepare_fn: F,
    ) -> Result<Arc<PreparedEntry>, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PreparedEntry, QueryError>>,
    {
        self.cache.get_or_fill(key, prepare_fn).await
    }

    /// Used when EXECUTE returns UNPREPARED: the next use re-prepares.
    pub(crate) fn invalidate(&self, key: &PreparedCacheKey) {
        self.cache.invalidate(key);
    }

    /// Applied when a Metadata_changed response arrives. Applied through
    /// the cache so that parallel callers with stale views converge.
    pub(crate) fn update_result_metadata(&self, key: &PreparedCacheKey, new_metadata_id: Bytes) {
        if let Some(entry) = self.cache.get(key) {
            entry.update_result_metadata_id(new_metadata_id);
        }
    }
}

/// What the driver must know about a statement to route it: which bound
/// values form the partition key, and the partitioner of its table.
#[derive(Debug, Clone)]
pub(crate) struct RoutingKeyInfo {
    pub(crate) pk_indexes: Vec<PartitionKeyIndex>,
    pub(crate) partitioner: PartitionerName,
    pub(crate) keyspace: Option<String>,
}

/// Bounded cache of routing info for unprepared statements, keyed by
/// (keyspace, statement text), filled by preparing the statement once.
pub(crate) struct RoutingInfoCache {
    cache: SingleFlightCache<(String, String), RoutingKeyInfo>,
}

impl RoutingInfoCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: SingleFlightCache::new(capacity),
        }
    }

    pub(crate) fn key(&self, keyspace: Option<&str>, statement: &str) -> (String, String) {
        (keyspace.unwrap_or_default().to_owned(), statement.to_owned())
    }

    pub(crate) async fn get_or_fetch<F, Fut>(
        &self,
        key: (String, String),
        fetch_fn: F,
    ) -> Result<Arc<RoutingKeyInfo>, QueryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RoutingKeyInfo, QueryError>>,
    {
        self.cache.get_or_fill(key, fetch_fn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn entry(id: &'static [u8]) -> PreparedEntry {
        PreparedEntry::new(Bytes::from_static(id), None)
    }

    #[tokio::test]
    async fn concurrent_callers_prepare_once() {
        let cache = Arc::new(PreparedStatementCache::new(128));
        let prepare_count = Arc::new(AtomicUsize::new(0));

        let host = Uuid::new_v4();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let prepare_count = prepare_count.clone();
            handles.push(tokio::spawn(async move {
                let key = cache.key(host, Some("ks"), "SELECT a FROM t WHERE pk = ?");
                cache
                    .get_or_prepare(key, || async {
                        prepare_count.fetch_add(1, Ordering::SeqCst);
                        // Give other callers time to pile up on the inflight
                        // entry.
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(entry(b"stmt_id"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.id(), &Bytes::from_static(b"stmt_id"));
        }

        assert_eq!(prepare_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_prepare_clears_the_entry() {
        let cache = PreparedStatementCache::new(128);
        let host = Uuid::new_v4();
        let key = cache.key(host, None, "SELECT");

        let result = cache
            .get_or_prepare(key.clone(), || async {
                Err(QueryError::TimeoutError)
            })
            .await;
        assert!(result.is_err());

        // The next caller retries and can succeed.
        let result = cache
            .get_or_prepare(key, || async { Ok(entry(b"id")) })
            .await
            .unwrap();
        assert_eq!(result.id(), &Bytes::from_static(b"id"));
    }

    #[tokio::test]
    async fn invalidation_forces_a_new_prepare() {
        let cache = PreparedStatementCache::new(128);
        let host = Uuid::new_v4();
        let key = cache.key(host, Some("ks"), "INSERT");

        let first = cache
            .get_or_prepare(key.clone(), || async { Ok(entry(b"first")) })
            .await
            .unwrap();
        assert_eq!(first.id(), &Bytes::from_static(b"first"));

        cache.invalidate(&key);

        let second = cache
            .get_or_prepare(key, || async { Ok(entry(b"second")) })
            .await
            .unwrap();
        assert_eq!(second.id(), &Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn metadata_update_converges_through_the_cache() {
        let cache = PreparedStatementCache::new(128);
        let host = Uuid::new_v4();
        let key = cache.key(host, Some("ks"), "SELECT a FROM t");

        let stale_view = cache
            .get_or_prepare(key.clone(), || async {
                Ok(PreparedEntry::new(
                    Bytes::from_static(b"id"),
                    Some(Bytes::from_static(b"metadata_v1")),
                ))
            })
            .await
            .unwrap();

        cache.update_result_metadata(&key, Bytes::from_static(b"metadata_v2"));

        // The previously obtained handle observes the new metadata id.
        assert_eq!(
            stale_view.result_metadata_id(),
            Some(Bytes::from_static(b"metadata_v2"))
        );
    }

    #[tokio::test]
    async fn lru_eviction_respects_capacity_and_recency() {
        let cache: SingleFlightCache<u32, u32> = SingleFlightCache::new(2);

        cache.get_or_fill(1, || async { Ok(1) }).await.unwrap();
        cache.get_or_fill(2, || async { Ok(2) }).await.unwrap();
        // Touch 1 so that 2 becomes the LRU entry; a cache hit must not
        // run the fill closure.
        let hit = cache
            .get_or_fill(1, || async { Err(QueryError::TimeoutError) })
            .await
            .unwrap();
        assert_eq!(*hit, 1);
        cache.get_or_fill(3, || async { Ok(3) }).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&3).is_some());
    }
}
