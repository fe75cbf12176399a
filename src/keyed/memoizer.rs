//! Contains the keyed memoizer for synchronous results and the clear registry.
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fnv::FnvHashMap;

use crate::keyed::{KeyedStore, SharedStore};

/// Derives the default cache key from an argument list.
///
/// The default derivation uses the **first argument verbatim** - nothing is stringified or
/// hashed up front, the argument value itself becomes the key (compared and hashed per its
/// own `Eq`/`Hash` implementation). This is implemented for tuples up to four elements (the
/// key being the first element), for the unit argument list and for the common scalar types
/// when used as a single bare argument.
///
/// Be aware of the deliberate pitfall this inherits: a two-argument call derives its key from
/// the first argument *only*, so calls differing in the second argument alias to the same
/// entry. Supply [KeyedOptions::with_cache_key] if later arguments matter.
pub trait FirstKey {
    /// The type of the derived key.
    type Key: Eq + Hash + Clone + 'static;

    /// Derives the cache key from this argument list.
    fn first_key(&self) -> Self::Key;
}

impl FirstKey for () {
    type Key = ();

    fn first_key(&self) -> Self::Key {}
}

macro_rules! first_key_scalar {
    ($($t:ty),* $(,)?) => {
        $(impl FirstKey for $t {
            type Key = $t;

            fn first_key(&self) -> Self::Key {
                self.clone()
            }
        })*
    };
}

first_key_scalar!(
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    String,
    &'static str,
);

macro_rules! first_key_tuple {
    ($(($first:ident $(, $rest:ident)*)),+ $(,)?) => {
        $(impl<$first: Eq + Hash + Clone + 'static $(, $rest)*> FirstKey for ($first, $($rest,)*) {
            type Key = $first;

            fn first_key(&self) -> Self::Key {
                self.0.clone()
            }
        })+
    };
}

first_key_tuple!((A0), (A0, A1), (A0, A1, A2), (A0, A1, A2, A3));

/// Configures a keyed memoizer.
///
/// [KeyedOptions::new] starts out with the default key derivation (see [FirstKey]), a fresh
/// private store and no expiry. [KeyedOptions::with_cache_key] starts out with a custom key
/// derivation instead, which may use any key type.
///
/// # Examples
/// ```
/// use mnemo::keyed::{KeyedMemo, KeyedOptions};
///
/// // The default key derivation uses the first argument only...
/// let aliasing = KeyedMemo::new(|args: &(u32, u32)| Ok::<_, String>(args.0 + args.1));
/// assert_eq!(aliasing.call((1, 2)).unwrap(), 3);
/// assert_eq!(aliasing.call((1, 5)).unwrap(), 3);
///
/// // ...whereas a custom derivation can take all arguments into account.
/// let options = KeyedOptions::with_cache_key(|args: &(u32, u32)| *args);
/// let exact = KeyedMemo::with_options(|args: &(u32, u32)| Ok::<_, String>(args.0 + args.1), options);
/// assert_eq!(exact.call((1, 2)).unwrap(), 3);
/// assert_eq!(exact.call((1, 5)).unwrap(), 6);
/// ```
pub struct KeyedOptions<A: 'static, K: Eq + Hash + 'static, V> {
    pub(super) cache: Option<SharedStore<K, V>>,
    pub(super) cache_key: Box<dyn Fn(&A) -> K + Send + Sync>,
    pub(super) max_age: Option<Duration>,
}

impl<A: FirstKey + 'static, V> KeyedOptions<A, <A as FirstKey>::Key, V> {
    /// Creates a new set of options using the default key derivation.
    pub fn new() -> Self {
        KeyedOptions {
            cache: None,
            cache_key: Box::new(|args: &A| args.first_key()),
            max_age: None,
        }
    }
}

impl<A: FirstKey + 'static, V> Default for KeyedOptions<A, <A as FirstKey>::Key, V> {
    fn default() -> Self {
        KeyedOptions::new()
    }
}

impl<A: 'static, K: Eq + Hash + 'static, V> KeyedOptions<A, K, V> {
    /// Creates a new set of options using the given key derivation.
    ///
    /// The function receives the full argument list and may derive any key type from it.
    pub fn with_cache_key(cache_key: impl Fn(&A) -> K + Send + Sync + 'static) -> Self {
        KeyedOptions {
            cache: None,
            cache_key: Box::new(cache_key),
            max_age: None,
        }
    }

    /// Supplies an external store to place the entries in.
    ///
    /// By default each memoized function uses a fresh store of its own. Supplying a store
    /// permits sharing it across several functions (where identical keys will alias) or
    /// applying an external eviction policy.
    pub fn cache(mut self, cache: SharedStore<K, V>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Specifies how long each entry remains valid after it has been created.
    ///
    /// Every new entry expires once this duration has elapsed - it is then removed lazily by
    /// the next lookup or eagerly by the periodic sweep (see
    /// [spawn_cleaner](crate::keyed::spawn_cleaner)). If never set, entries do not expire by
    /// time.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Specifies the entry validity just like [KeyedOptions::max_age], but parses the
    /// duration from a string like "100ms", "30 s" or "15m" (see [crate::fmt::parse_duration]).
    pub fn max_age_str(self, max_age: impl AsRef<str>) -> anyhow::Result<Self> {
        Ok(self.max_age(crate::fmt::parse_duration(max_age)?))
    }
}

/// Identifies a memoized function within the clear registry.
///
/// An id stays valid for as long as its memoized function lives. See [clear].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoId(u64);

lazy_static::lazy_static! {
    /// Associates each live memoized function with a way to clear its store.
    ///
    /// Only a weak reference to the store is held here, so the registry never keeps a store
    /// alive - entries are removed when the memoized function is dropped.
    static ref CLEARERS: Mutex<FnvHashMap<u64, Box<dyn Fn() -> bool + Send>>> =
        Mutex::new(FnvHashMap::default());
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(super) fn register<K, V>(store: &SharedStore<K, V>) -> MemoId
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    let store = Arc::downgrade(store);
    let clear_store = Box::new(move || match store.upgrade() {
        Some(store) => {
            store
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            true
        }
        None => false,
    });

    let _ = CLEARERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id, clear_store);

    MemoId(id)
}

pub(super) fn deregister(id: MemoId) {
    let _ = CLEARERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id.0);
}

/// Clears the cache of the memoized function identified by the given id.
///
/// This works without any knowledge of the function's key derivation or store contents. The
/// next call for any key will therefore re-invoke the underlying function exactly once per
/// key.
///
/// # Errors
/// Fails with a descriptive error if the id does not refer to a live memoized function -
/// either because it was never issued by this library or because the memoized function has
/// been dropped in the meantime. This is never silently ignored.
pub fn clear(id: MemoId) -> anyhow::Result<()> {
    let clearers = CLEARERS.lock().unwrap_or_else(PoisonError::into_inner);
    match clearers.get(&id.0) {
        Some(clear_store) if clear_store() => Ok(()),
        _ => Err(anyhow::anyhow!(
            "Not a memoized function: {:?} does not refer to a live memoized function.",
            id
        )),
    }
}

/// Memoizes the results of a synchronous function per derived key.
///
/// Looking up a present key is a pure read: the stored value is returned and the underlying
/// function is not invoked - even if it would behave differently by now. Any `Err` returned
/// by the function propagates to the caller of that specific invocation and is never stored.
///
/// Unlike the single-slot [Memo](crate::memo::Memo), results for different keys coexist: a
/// new key never overwrites the still-valid entry of another key.
///
/// # Examples
/// ```
/// use mnemo::keyed::KeyedMemo;
///
/// let memo = KeyedMemo::new(|args: &(String, u32)| Ok::<_, String>(args.1 * 2));
///
/// assert_eq!(memo.call((String::from("a"), 2)).unwrap(), 4);
/// assert_eq!(memo.call((String::from("b"), 5)).unwrap(), 10);
/// // Both entries remain valid side by side...
/// assert_eq!(memo.call((String::from("a"), 2)).unwrap(), 4);
/// ```
pub struct KeyedMemo<A: 'static, K: Eq + Hash + 'static, V, F> {
    func: F,
    cache_key: Box<dyn Fn(&A) -> K + Send + Sync>,
    max_age: Option<Duration>,
    store: SharedStore<K, V>,
    id: MemoId,
}

impl<A, K, V, E, F> KeyedMemo<A, K, V, F>
where
    F: Fn(&A) -> Result<V, E>,
    A: 'static,
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Wraps the given function using the default options.
    pub fn new(func: F) -> Self
    where
        A: FirstKey<Key = K>,
    {
        KeyedMemo::with_options(func, KeyedOptions::new())
    }

    /// Wraps the given function using the given options.
    pub fn with_options(func: F, options: KeyedOptions<A, K, V>) -> Self {
        let store = options.cache.unwrap_or_else(KeyedStore::shared);
        let id = register(&store);

        KeyedMemo {
            func,
            cache_key: options.cache_key,
            max_age: options.max_age,
            store,
            id,
        }
    }

    /// Invokes the memoized function.
    ///
    /// Derives the key from the given arguments and returns the stored value if the store
    /// contains it. Otherwise the underlying function is invoked - on success its result is
    /// committed under the derived key (with an expiry timestamp if `max_age` is configured)
    /// and returned, on failure the error propagates and the store is left untouched.
    pub fn call(&self, args: A) -> Result<V, E> {
        let key = (self.cache_key)(&args);

        {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(value) = store.get(&key) {
                return Ok(value.clone());
            }
        }

        // As with the single-slot memoizer, the store is not locked while the function runs.
        let value = (self.func)(&args)?;

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.set(key, value.clone(), self.max_age);

        Ok(value)
    }

    /// Returns the id under which this memoized function is registered.
    ///
    /// The id can be handed to [clear] to reset the cache without access to this instance.
    pub fn id(&self) -> MemoId {
        self.id
    }

    /// Removes all cached entries of this memoized function.
    pub fn clear(&self) {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns the store which holds the cached entries.
    ///
    /// This is most useful to hand the store to [spawn_cleaner](crate::keyed::spawn_cleaner)
    /// or to inspect its metrics.
    pub fn store(&self) -> SharedStore<K, V> {
        self.store.clone()
    }
}

impl<A: 'static, K: Eq + Hash + 'static, V, F> Drop for KeyedMemo<A, K, V, F> {
    fn drop(&mut self) {
        deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use crate::keyed::{clear, KeyedMemo, KeyedOptions, KeyedStore};
    use mock_instant::global::MockClock;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::PoisonError;
    use std::time::Duration;

    #[test]
    fn results_are_cached_per_key() {
        let calls = Cell::new(0);
        let memo = KeyedMemo::new(|args: &(String, i32)| {
            calls.set(calls.get() + 1);
            Ok::<_, String>(args.1 * 2)
        });

        assert_eq!(memo.call((String::from("a"), 1)).unwrap(), 2);
        assert_eq!(memo.call((String::from("a"), 1)).unwrap(), 2);
        assert_eq!(calls.get(), 1);

        // The default key is the first argument only - differing second arguments alias...
        assert_eq!(memo.call((String::from("a"), 5)).unwrap(), 2);
        assert_eq!(calls.get(), 1);

        // ...while a new first argument computes a fresh result...
        assert_eq!(memo.call((String::from("b"), 5)).unwrap(), 10);
        assert_eq!(calls.get(), 2);

        // ...without overwriting the still-valid entry of the old key.
        assert_eq!(memo.call((String::from("a"), 1)).unwrap(), 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn a_custom_cache_key_takes_all_arguments_into_account() {
        let calls = Cell::new(0);
        let memo = KeyedMemo::with_options(
            |args: &(String, i32)| {
                calls.set(calls.get() + 1);
                Ok::<_, String>(args.1 * 2)
            },
            KeyedOptions::with_cache_key(|args: &(String, i32)| args.clone()),
        );

        assert_eq!(memo.call((String::from("a"), 1)).unwrap(), 2);
        assert_eq!(memo.call((String::from("a"), 1)).unwrap(), 2);
        assert_eq!(calls.get(), 1);

        assert_eq!(memo.call((String::from("a"), 5)).unwrap(), 10);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn each_call_sequence_yields_the_next_counter_value() {
        // One shared counter backs three memoized functions of different arity, illustrating
        // how each distinct key computes once and every repetition is answered from the cache.
        let counter = Rc::new(Cell::new(0));

        let no_args_counter = counter.clone();
        let no_args = KeyedMemo::new(move |_args: &()| {
            let value = no_args_counter.get();
            no_args_counter.set(value + 1);
            Ok::<_, String>(value)
        });

        let one_arg_counter = counter.clone();
        let one_arg = KeyedMemo::new(move |_args: &String| {
            let value = one_arg_counter.get();
            one_arg_counter.set(value + 1);
            Ok::<_, String>(value)
        });

        let two_args_counter = counter.clone();
        let two_args = KeyedMemo::new(move |_args: &(String, String)| {
            let value = two_args_counter.get();
            two_args_counter.set(value + 1);
            Ok::<_, String>(value)
        });

        assert_eq!(no_args.call(()).unwrap(), 0);
        assert_eq!(no_args.call(()).unwrap(), 0);
        assert_eq!(no_args.call(()).unwrap(), 0);

        assert_eq!(one_arg.call(String::from("foo")).unwrap(), 1);
        assert_eq!(one_arg.call(String::from("foo")).unwrap(), 1);

        // A differing argument list yields a freshly computed result...
        assert_eq!(
            two_args
                .call((String::from("foo"), String::from("bar")))
                .unwrap(),
            2
        );
    }

    #[test]
    fn errors_are_propagated_and_never_stored() {
        let calls = Cell::new(0);
        let memo = KeyedMemo::new(|args: &(i32,)| {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err(String::from("boom"))
            } else {
                Ok(args.0 * 2)
            }
        });

        assert_eq!(memo.call((1,)).unwrap_err(), "boom");
        assert_eq!(calls.get(), 1);

        // The failure was not committed, so the same key re-invokes the function...
        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(calls.get(), 2);

        // ...and the recovery is cached.
        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn clearing_fully_resets_the_cache() {
        let calls = Cell::new(0);
        let memo = KeyedMemo::new(|args: &(i32,)| {
            calls.set(calls.get() + 1);
            Ok::<_, String>(args.0 * 2)
        });

        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(calls.get(), 1);

        clear(memo.id()).unwrap();

        // The previously cached key is recomputed exactly once more...
        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(calls.get(), 2);
        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(calls.get(), 2);

        // ...and the clear method on the instance behaves identically.
        memo.clear();
        assert_eq!(memo.call((1,)).unwrap(), 2);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn clearing_an_unknown_function_fails() {
        let stale_id = {
            let memo = KeyedMemo::new(|args: &(i32,)| Ok::<_, String>(args.0));
            assert_eq!(memo.call((1,)).unwrap(), 1);
            memo.id()
        };

        // The memoized function is gone, so its id must be rejected with a descriptive error.
        let error = clear(stale_id).unwrap_err();
        assert_eq!(error.to_string().contains("Not a memoized function"), true);
    }

    #[test]
    fn entries_expire_after_max_age() {
        let _guard = crate::testing::SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        let counter = Cell::new(0);
        let memo = KeyedMemo::with_options(
            |_args: &(i32,)| {
                let value = counter.get();
                counter.set(value + 1);
                Ok::<_, String>(value)
            },
            KeyedOptions::new().max_age(Duration::from_millis(100)),
        );

        assert_eq!(memo.call((1,)).unwrap(), 0);

        // Still within the validity window...
        MockClock::advance(Duration::from_millis(50));
        assert_eq!(memo.call((1,)).unwrap(), 0);

        // ...but well past it, a fresh value is computed and the expired entry is gone.
        MockClock::advance(Duration::from_millis(250));
        assert_eq!(memo.call((1,)).unwrap(), 1);
        assert_eq!(memo.store().lock().unwrap().len(), 1);
        assert_eq!(memo.call((1,)).unwrap(), 1);
    }

    #[test]
    fn an_external_store_is_shared_between_functions() {
        let store = KeyedStore::shared();
        let calls = Cell::new(0);

        let first = KeyedMemo::with_options(
            |args: &(String,)| {
                calls.set(calls.get() + 1);
                Ok::<_, String>(args.0.len())
            },
            KeyedOptions::new().cache(store.clone()),
        );
        let second = KeyedMemo::with_options(
            |args: &(String,)| {
                calls.set(calls.get() + 1);
                Ok::<_, String>(args.0.len())
            },
            KeyedOptions::new().cache(store.clone()),
        );

        // Identical keys alias in a shared store, so the second function never runs...
        assert_eq!(first.call((String::from("foo"),)).unwrap(), 3);
        assert_eq!(second.call((String::from("foo"),)).unwrap(), 3);
        assert_eq!(calls.get(), 1);

        assert_eq!(store.lock().unwrap_or_else(PoisonError::into_inner).len(), 1);
    }

    #[test]
    fn max_age_can_be_parsed_from_a_string() {
        let options = KeyedOptions::<(i32,), i32, i32>::new()
            .max_age_str("15m")
            .unwrap();
        let memo = KeyedMemo::with_options(|args: &(i32,)| Ok::<_, String>(args.0), options);
        assert_eq!(memo.call((1,)).unwrap(), 1);

        assert_eq!(
            KeyedOptions::<(i32,), i32, i32>::new()
                .max_age_str("1 y")
                .is_err(),
            true
        );
    }
}
