use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;

/// Freshness window a cached value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowId {
    /// floor(now / ttl)
    Bucket(u64),
    /// Caller supplied key; never matches a bucket
    Bust(u64),
}

/// Window for `now_secs` under a `ttl` freshness window
pub fn bucket(now_secs: u64, ttl: Duration) -> WindowId {
    let ttl = ttl.as_secs().max(1);
    WindowId::Bucket(now_secs / ttl)
}

struct Slot<V> {
    window: WindowId,
    cell: Arc<OnceCell<V>>,
}

/// Memoizer holding exactly one value per operation key. A call for a
/// different window replaces the slot; concurrent calls for the same key
/// and window share one computation.
pub struct TtlCache<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    next_bust: AtomicU64,
    clock: Clock,
}

/// Source of the current time in whole seconds
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(unix_now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_bust: AtomicU64::new(0),
            clock,
        }
    }

    /// A cache-busting key that has never been handed out before
    pub fn bust_key(&self) -> u64 {
        self.next_bust.fetch_add(1, Ordering::Relaxed)
    }

    /// Memoize `compute` under `key` for the current `ttl` window, or under
    /// `bust` verbatim when given (always a miss for a fresh bust key).
    pub async fn memoize<F, Fut>(&self, key: &str, ttl: Duration, bust: Option<u64>, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let window = self.window(ttl, bust);
        self.memoize_at(key, window, compute).await
    }

    pub async fn memoize_at<F, Fut>(&self, key: &str, window: WindowId, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = self.cell(key, window);
        cell.get_or_init(compute).await.clone()
    }

    /// Like [`TtlCache::memoize`], but a failed computation is not retained:
    /// the next caller in the same window computes again.
    pub async fn try_memoize<E, F, Fut>(&self, key: &str, ttl: Duration, bust: Option<u64>, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let window = self.window(ttl, bust);
        self.try_memoize_at(key, window, compute).await
    }

    pub async fn try_memoize_at<E, F, Fut>(&self, key: &str, window: WindowId, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.cell(key, window);
        cell.get_or_try_init(compute).await.cloned()
    }

    /// Number of occupied slots
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    fn window(&self, ttl: Duration, bust: Option<u64>) -> WindowId {
        match bust {
            Some(key) => WindowId::Bust(key),
            None => bucket((self.clock)(), ttl),
        }
    }

    fn cell(&self, key: &str, window: WindowId) -> Arc<OnceCell<V>> {
        let mut slots = self.lock_slots();
        match slots.get(key) {
            Some(slot) if slot.window == window => slot.cell.clone(),
            _ => {
                let cell = Arc::new(OnceCell::new());
                slots.insert(key.to_string(), Slot { window, cell: cell.clone() });
                cell
            }
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}
