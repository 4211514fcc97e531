//! Captured requests waiting for their challenge to be solved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;
use moka::future::Cache;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task::JoinHandle;
use tokio::time;

/// Bookkeeping charged to every entry on top of its request bytes, so
/// bodiless requests still count against the budget.
const ENTRY_OVERHEAD_BYTES: usize = 512;

/// Snapshot of one inbound request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    /// Target as received: path and query.
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Path plus query string, `/` when the target has neither.
    pub fn path_and_query(&self) -> &str {
        self.uri.path_and_query().map_or("/", |pq| pq.as_str())
    }
}

#[derive(Debug)]
struct PendingEntry {
    request: CapturedRequest,
    expires_at: Instant,
}

/// In-memory store of captured requests keyed by an opaque identifier.
///
/// Entries live for a fixed TTL. Taking an entry removes it, so each
/// identifier replays at most once. The store is bounded by the
/// approximate bytes its requests occupy; past the budget moka evicts
/// or refuses entries.
#[derive(Clone)]
pub struct PendingRequests {
    cache: Cache<String, Arc<PendingEntry>>,
    ttl: Duration,
}

impl PendingRequests {
    /// Create a store whose entries expire after `ttl` and which holds
    /// roughly `max_bytes` of requests at most.
    pub fn new(ttl: Duration, max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .weigher(|id: &String, entry: &Arc<PendingEntry>| entry_weight(id, entry))
            .max_capacity(max_bytes)
            .time_to_live(ttl)
            .build();
        Self { cache, ttl }
    }

    /// Store a request and return its freshly generated identifier.
    pub async fn put(&self, request: CapturedRequest) -> String {
        let id = new_request_id();
        let entry = Arc::new(PendingEntry {
            request,
            expires_at: Instant::now() + self.ttl,
        });
        self.cache.insert(id.clone(), entry).await;
        id
    }

    /// Remove and return the request stored under `id`.
    ///
    /// Returns `None` for unknown, expired or already taken identifiers.
    pub async fn take(&self, id: &str) -> Option<CapturedRequest> {
        let entry = self.cache.remove(id).await?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(match Arc::try_unwrap(entry) {
            Ok(entry) => entry.request,
            Err(shared) => shared.request.clone(),
        })
    }

    /// Whether a live entry exists for `id`, without consuming it.
    pub async fn contains(&self, id: &str) -> bool {
        self.cache
            .get(id)
            .await
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    /// Approximate number of stored entries, accurate after a sweep.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry now.
    pub async fn sweep(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Sweep expired entries every `every`, independently of request handling.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let pending = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                pending.sweep().await;
                tracing::debug!(remaining = pending.len(), "swept expired pending requests");
            }
        })
    }
}

fn entry_weight(id: &str, entry: &PendingEntry) -> u32 {
    let request = &entry.request;
    let headers: usize = request
        .headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum();
    let bytes = ENTRY_OVERHEAD_BYTES
        + id.len()
        + request.path_and_query().len()
        + headers
        + request.body.len();
    u32::try_from(bytes).unwrap_or(u32::MAX)
}

/// 128 random bits, hex encoded.
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
