//! Contains the asynchronous adapter of the keyed memoizer.
use std::hash::Hash;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use crate::keyed::memoizer::{deregister, register};
use crate::keyed::{FirstKey, KeyedOptions, KeyedStore, MemoId, SharedStore};
use crate::memo::SharedResult;

/// Memoizes the pending results of an asynchronous function per derived key.
///
/// The in-flight pending handle is committed into the store *immediately* (an optimistic
/// insert), so concurrent callers with the same key share one underlying computation and
/// resolve together. Should the pending result eventually reject, the entry is deleted as
/// soon as the rejection is observed - a subsequent call with the same key then re-invokes
/// the function instead of replaying the rejection. The rejection itself still propagates to
/// every caller awaiting the handle.
///
/// The eviction is performed by an observer task which consults the store at settlement time:
/// if the entry has already been replaced by a fresher handle for the same key, the stale
/// rejection leaves it alone. Entries of other keys are never affected.
///
/// Callers which prefer to replay rejections verbatim can opt in via
/// [FutureKeyedMemo::cache_rejections] - the rejected handle then simply remains stored like
/// any other value.
///
/// Note that invoking the memoizer requires a running [tokio] runtime, as the rejection
/// observer is spawned onto it.
///
/// # Examples
/// ```
/// use futures::FutureExt;
/// use mnemo::keyed::FutureKeyedMemo;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let memo = FutureKeyedMemo::new(|args: &(String,)| {
///     let name = args.0.clone();
///     async move { Ok::<_, String>(format!("contents of {}", name)) }.boxed()
/// });
///
/// let first = memo.call((String::from("a"),));
/// let second = memo.call((String::from("a"),));
///
/// // Both callers share one underlying computation...
/// assert_eq!(first.ptr_eq(&second), true);
/// assert_eq!(first.await.unwrap(), "contents of a");
/// # }
/// ```
pub struct FutureKeyedMemo<A: 'static, K: Eq + Hash + 'static, T: 'static, E: 'static, F> {
    func: F,
    cache_key: Box<dyn Fn(&A) -> K + Send + Sync>,
    max_age: Option<Duration>,
    cache_rejections: bool,
    store: SharedStore<K, SharedResult<T, E>>,
    id: MemoId,
}

impl<A, K, T, E, F> FutureKeyedMemo<A, K, T, E, F>
where
    F: Fn(&A) -> BoxFuture<'static, Result<T, E>>,
    A: 'static,
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wraps the given function using the default options.
    pub fn new(func: F) -> Self
    where
        A: FirstKey<Key = K>,
    {
        FutureKeyedMemo::with_options(func, KeyedOptions::new())
    }

    /// Wraps the given function using the given options.
    pub fn with_options(func: F, options: KeyedOptions<A, K, SharedResult<T, E>>) -> Self {
        let store = options.cache.unwrap_or_else(KeyedStore::shared);
        let id = register(&store);

        FutureKeyedMemo {
            func,
            cache_key: options.cache_key,
            max_age: options.max_age,
            cache_rejections: false,
            store,
            id,
        }
    }

    /// Specifies whether rejected results remain cached.
    ///
    /// By default a rejected pending handle is deleted from the store once its rejection is
    /// observed. When enabled, the handle remains stored instead and subsequent calls with
    /// the same key replay the rejection verbatim.
    pub fn cache_rejections(mut self, cache_rejections: bool) -> Self {
        self.cache_rejections = cache_rejections;
        self
    }

    /// Invokes the memoized function.
    ///
    /// Derives the key from the given arguments and returns the stored pending handle if
    /// present. Otherwise the underlying function is invoked and its future is committed
    /// under the derived key right away - settlement is not awaited here, the returned handle
    /// is awaited by the caller.
    pub fn call(&self, args: A) -> SharedResult<T, E> {
        let key = (self.cache_key)(&args);

        {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = store.get(&key) {
                return handle.clone();
            }
        }

        let handle = (self.func)(&args).shared();

        {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            store.set(key.clone(), handle.clone(), self.max_age);
        }

        if !self.cache_rejections {
            self.evict_on_rejection(key, handle.clone());
        }

        handle
    }

    /// Returns the id under which this memoized function is registered.
    ///
    /// The id can be handed to [clear](crate::keyed::clear) to reset the cache without access
    /// to this instance.
    pub fn id(&self) -> MemoId {
        self.id
    }

    /// Removes all cached entries of this memoized function.
    ///
    /// Note that this only forgets cached handles - computations which are already in flight
    /// keep running and settle normally for whoever awaits them.
    pub fn clear(&self) {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Returns the store which holds the cached entries.
    pub fn store(&self) -> SharedStore<K, SharedResult<T, E>> {
        self.store.clone()
    }

    /// Spawns an observer which deletes the entry for the given key once the given pending
    /// handle rejects.
    ///
    /// The store is consulted at settlement time: the entry is only deleted if it still holds
    /// this very handle. A rejection belonging to an older in-flight call must never evict an
    /// entry which a later call has already replaced.
    fn evict_on_rejection(&self, key: K, handle: SharedResult<T, E>) {
        let store = Arc::downgrade(&self.store);

        crate::spawn!(async move {
            if handle.clone().await.is_err() {
                if let Some(store) = store.upgrade() {
                    let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                    let still_current = store
                        .peek(&key)
                        .map(|current| current.ptr_eq(&handle))
                        .unwrap_or(false);
                    if still_current {
                        let _ = store.delete(&key);
                    }
                }
            }
        });
    }
}

impl<A: 'static, K: Eq + Hash + 'static, T: 'static, E: 'static, F> Drop
    for FutureKeyedMemo<A, K, T, E, F>
{
    fn drop(&mut self) {
        deregister(self.id);
    }
}
