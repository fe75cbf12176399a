//! Contains the key-value store backing the keyed memoizer.
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[cfg(test)]
use mock_instant::global::Instant;
#[cfg(not(test))]
use std::time::Instant;

use linked_hash_map::LinkedHashMap;

/// A store which can be shared across several memoized functions or call sites.
///
/// Note that identical keys used by unrelated logical calls will alias in a shared store -
/// sharing is a feature for callers which want exactly that (or which want to impose their
/// own eviction policy from the outside).
pub type SharedStore<K, V> = Arc<Mutex<KeyedStore<K, V>>>;

/// Stores the entries of a keyed memoizer along with their expiry timestamps.
///
/// Each entry is created by exactly one successful invocation of the memoized function. An
/// entry with an expiry timestamp is removed lazily once a lookup encounters it past its
/// expiry - or eagerly by [KeyedStore::cleanup], which is invoked periodically when a cleaner
/// has been spawned via [spawn_cleaner].
///
/// The store keeps simple usage metrics (reads, writes, hit rate) around for diagnostics.
///
/// # Examples
/// ```
/// # use mnemo::keyed::KeyedStore;
/// # use std::time::Duration;
/// let mut store = KeyedStore::new();
///
/// store.set("foo", 42, Some(Duration::from_secs(60)));
/// assert_eq!(store.get(&"foo"), Some(&42));
/// assert_eq!(store.has(&"foo"), true);
///
/// assert_eq!(store.delete(&"foo"), true);
/// assert_eq!(store.get(&"foo"), None);
/// ```
pub struct KeyedStore<K: Eq + Hash, V> {
    map: LinkedHashMap<K, StoreEntry<V>>,
    reads: usize,
    hits: usize,
    writes: usize,
}

struct StoreEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> StoreEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }
}

impl<K: Eq + Hash, V> KeyedStore<K, V> {
    /// Creates a new empty store.
    pub fn new() -> Self {
        KeyedStore {
            map: LinkedHashMap::new(),
            reads: 0,
            hits: 0,
            writes: 0,
        }
    }

    /// Creates a new empty store which is ready to be shared.
    ///
    /// This is the form expected by [KeyedOptions::cache](crate::keyed::KeyedOptions::cache)
    /// and [spawn_cleaner].
    pub fn shared() -> SharedStore<K, V> {
        Arc::new(Mutex::new(KeyedStore::new()))
    }

    /// Returns the value stored for the given key or **None** if no valid value is present.
    ///
    /// An entry past its expiry is treated as absent and removed on the spot, so a caller can
    /// never observe an expired value, not even between two runs of the periodic sweep.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.reads += 1;

        let now = Instant::now();
        let expired = match self.map.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return None,
        };

        if expired {
            let _ = self.map.remove(key);
            return None;
        }

        self.hits += 1;
        self.map.get(key).map(|entry| &entry.value)
    }

    /// Determines if a valid (non-expired) value is stored for the given key.
    ///
    /// Just like [KeyedStore::get] this removes an expired entry when encountering it.
    pub fn has(&mut self, key: &K) -> bool {
        let now = Instant::now();
        let expired = match self.map.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return false,
        };

        if expired {
            let _ = self.map.remove(key);
            return false;
        }

        true
    }

    /// Stores the given value for the given key.
    ///
    /// If a `max_age` is given, the entry expires once this duration has elapsed. Otherwise
    /// it remains valid until it is deleted or the store is cleared. A previously stored
    /// value for the same key is replaced, along with its expiry timestamp.
    pub fn set(&mut self, key: K, value: V, max_age: Option<Duration>) {
        self.writes += 1;

        let entry = StoreEntry {
            value,
            expires_at: max_age.map(|max_age| Instant::now() + max_age),
        };
        let _ = self.map.insert(key, entry);
    }

    /// Removes the entry for the given key if present.
    ///
    /// Returns **true** if an entry was actually removed.
    pub fn delete(&mut self, key: &K) -> bool {
        self.map.remove(key).is_some()
    }

    /// Removes all entries in this store.
    ///
    /// Note that this will also zero all metrics (reads, writes, cache hits).
    pub fn clear(&mut self) {
        self.map.clear();
        self.reads = 0;
        self.hits = 0;
        self.writes = 0;
    }

    /// Removes all entries whose expiry timestamp has passed.
    ///
    /// Returns the number of removed entries. This is invoked periodically by the cleaner
    /// task (see [spawn_cleaner]) but can of course also be called manually.
    pub fn cleanup(&mut self) -> usize {
        let now = Instant::now();

        let entries = std::mem::replace(&mut self.map, LinkedHashMap::new());
        let num_entries = entries.len();
        for (key, entry) in entries {
            if !entry.is_expired(now) {
                let _ = self.map.insert(key, entry);
            }
        }

        num_entries - self.map.len()
    }

    /// Returns the stored value for the given key without touching metrics or expiry.
    ///
    /// This is used by the rejection observer of the asynchronous adapter, which must inspect
    /// the current store contents without perturbing them.
    pub(crate) fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|entry| &entry.value)
    }

    /// Returns the number of entries in the store.
    ///
    /// Note that this might include entries which are already past their expiry but have
    /// neither been looked up nor swept yet.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the total number of reads performed on this store since the last clear.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the total number of writes performed on this store since the last clear.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the cache hit rate in percent.
    ///
    /// Note that all metrics are reset when [KeyedStore::clear] is called.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }
}

impl<K: Eq + Hash, V> Default for KeyedStore<K, V> {
    fn default() -> Self {
        KeyedStore::new()
    }
}

/// Spawns a background task which periodically sweeps expired entries from the given store.
///
/// The task runs [KeyedStore::cleanup] once per interval (which must be non-zero) and
/// terminates by itself once the store has been dropped - it only keeps a weak reference and
/// therefore never keeps the store alive. Note that this requires a running
/// [tokio] runtime.
pub fn spawn_cleaner<K, V>(store: &SharedStore<K, V>, interval: Duration)
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    log::debug!(
        "Starting a cache cleaner with an interval of {}...",
        crate::fmt::format_duration(interval)
    );

    let store = Arc::downgrade(store);
    crate::spawn!(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            let _ = timer.tick().await;
            match store.upgrade() {
                Some(store) => {
                    let removed = store
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .cleanup();
                    if removed > 0 {
                        log::debug!("Cache cleanup removed {} expired entries...", removed);
                    }
                }
                None => {
                    log::debug!("Stopping cache cleaner as its store is gone...");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::keyed::{spawn_cleaner, KeyedStore};
    use mock_instant::global::MockClock;
    use std::sync::PoisonError;
    use std::time::Duration;

    #[test]
    fn values_are_stored_and_retrieved() {
        let mut store = KeyedStore::new();

        store.set("foo", 1, None);
        store.set("bar", 2, None);
        assert_eq!(store.get(&"foo"), Some(&1));
        assert_eq!(store.get(&"bar"), Some(&2));
        assert_eq!(store.has(&"foo"), true);
        assert_eq!(store.len(), 2);

        // Replacing a value does not create a second entry...
        store.set("foo", 3, None);
        assert_eq!(store.get(&"foo"), Some(&3));
        assert_eq!(store.len(), 2);

        // ...and deleted values are gone.
        assert_eq!(store.delete(&"foo"), true);
        assert_eq!(store.delete(&"foo"), false);
        assert_eq!(store.get(&"foo"), None);

        store.clear();
        assert_eq!(store.is_empty(), true);
    }

    #[test]
    fn expired_entries_are_removed_lazily() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        let mut store = KeyedStore::new();
        store.set("foo", 1, Some(Duration::from_millis(100)));
        store.set("bar", 2, None);

        assert_eq!(store.get(&"foo"), Some(&1));

        MockClock::advance(Duration::from_millis(150));

        // The expired entry is reported as absent and removed on access...
        assert_eq!(store.get(&"foo"), None);
        assert_eq!(store.len(), 1);

        // ...while the unbounded entry remains valid.
        assert_eq!(store.get(&"bar"), Some(&2));
    }

    #[test]
    fn cleanup_sweeps_expired_entries() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        let mut store = KeyedStore::new();
        store.set("eternal", 0, None);
        store.set("short", 1, Some(Duration::from_millis(100)));
        store.set("long", 2, Some(Duration::from_millis(200)));

        assert_eq!(store.cleanup(), 0);

        MockClock::advance(Duration::from_millis(150));
        assert_eq!(store.cleanup(), 1);
        assert_eq!(store.len(), 2);

        MockClock::advance(Duration::from_millis(100));
        assert_eq!(store.cleanup(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&"eternal"), Some(&0));
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let mut store = KeyedStore::new();

        store.set("a", 1, None);
        store.set("b", 2, None);
        store.set("c", 3, None);

        // Perform 4 reads, of which 3 hit an entry...
        assert_eq!(store.get(&"a").is_some(), true);
        assert_eq!(store.get(&"b").is_some(), true);
        assert_eq!(store.get(&"c").is_some(), true);
        assert_eq!(store.get(&"d").is_none(), true);

        assert_eq!(store.writes(), 3);
        assert_eq!(store.reads(), 4);
        assert_eq!(store.hit_rate().round() as i32, 75);

        // Clearing the store resets the metrics as well...
        store.clear();
        assert_eq!(store.reads(), 0);
        assert_eq!(store.writes(), 0);
        assert_eq!(store.hit_rate().round() as i32, 0);
    }

    #[test]
    fn the_cleaner_task_sweeps_in_the_background() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        crate::init_logging();
        crate::testing::test_async(async {
            let store = KeyedStore::shared();
            {
                let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                store.set("foo", 1, Some(Duration::from_millis(50)));
                store.set("bar", 2, None);
            }

            MockClock::advance(Duration::from_millis(100));
            spawn_cleaner(&store, Duration::from_millis(10));

            // Give the cleaner some (real) time to perform a sweep...
            tokio::time::sleep(Duration::from_millis(50)).await;

            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            assert_eq!(store.len(), 1);
            assert_eq!(store.get(&"bar"), Some(&2));
        });
    }
}
