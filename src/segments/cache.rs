use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Keys not queried for this long are left out of background passes.
pub const DROP_INTERVAL: Duration = Duration::from_secs(600);

/// Outcome of the latest computation for one key.
///
/// `value` is the last value that computed successfully. A crash keeps the
/// previous value around and only flips `crashed`.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult<V> {
    pub value: Option<V>,
    pub computed_at: Instant,
    pub crashed: bool,
}

impl<V> CachedResult<V> {
    pub fn ok(value: V) -> Self {
        Self {
            value: Some(value),
            computed_at: Instant::now(),
            crashed: false,
        }
    }

    pub fn crashed(previous: Option<V>) -> Self {
        Self {
            value: previous,
            computed_at: Instant::now(),
            crashed: true,
        }
    }

    pub fn age(&self) -> Duration {
        self.computed_at.elapsed()
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, Arc<CachedResult<V>>>,
    /// Last time each key was asked for by a render.
    observed: HashMap<K, Instant>,
}

/// Per-segment result table. Entries are replaced wholesale, so a reader
/// holding an `Arc` from [`KeyedCache::get`] never sees a half-written one.
pub struct KeyedCache<K, V> {
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                observed: HashMap::new(),
            }),
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &K) -> Option<Arc<CachedResult<V>>> {
        self.lock().entries.get(key).cloned()
    }

    /// Record that a render asked for `key`, keeping it live for the next
    /// [`DROP_INTERVAL`].
    pub fn observe(&self, key: K) {
        self.lock().observed.insert(key, Instant::now());
    }

    pub fn replace(&self, key: K, result: CachedResult<V>) {
        self.lock().entries.insert(key, Arc::new(result));
    }

    /// Keys observed within `drop_interval`. Older observations are
    /// forgotten; their cached results stay.
    pub fn live_keys(&self, drop_interval: Duration) -> Vec<K> {
        let mut state = self.lock();
        state.observed.retain(|_, seen| seen.elapsed() < drop_interval);
        state.observed.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
