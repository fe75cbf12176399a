//! Provides the keyed memoizer.
//!
//! In contrast to the single-slot design (see [crate::memo]), a keyed memoizer remembers one
//! entry *per key*, where the key is derived from the arguments of each call. A call whose key
//! is present in the store is answered from the cache - without re-invoking the underlying
//! function, even if that function would behave differently by now. A call whose key is absent
//! invokes the function and commits the result under the derived key, optionally with an
//! expiry timestamp (`max_age`).
//!
//! # Key derivation
//! By default the key is the **first argument** of the call (see [FirstKey]). This mirrors the
//! contract this design descends from, and it is as convenient as it is surprising: two calls
//! which differ only in their second argument derive the same key and therefore share one
//! cache entry. If later arguments matter, supply a key derivation function via
//! [KeyedOptions::with_cache_key] which takes all of them into account.
//!
//! # Stores, sweeping and clearing
//! Entries live in a [KeyedStore] which is private to the memoized function by default but can
//! be supplied externally (see [KeyedOptions::cache]) to share a store across several
//! functions or to apply an own eviction policy. Expired entries are removed lazily whenever
//! they are looked up; additionally [spawn_cleaner] runs a periodic sweep which removes them
//! without waiting for the next lookup.
//!
//! Each memoized function is registered under an opaque [MemoId] for as long as it lives, so
//! its store can be cleared through [clear] without any knowledge of the key derivation.
//! Passing an id which does not refer to a live memoized function yields a descriptive error
//! rather than silently doing nothing.
//!
//! # Asynchronous results
//! [FutureKeyedMemo] layers rejection handling over the keyed store: the in-flight pending
//! handle is committed immediately, so concurrent callers with the same key share one
//! computation. If the handle rejects, the entry is deleted as soon as the rejection is
//! observed - unless it has already been replaced by a fresher entry, or rejection caching
//! has been enabled deliberately.
mod future;
mod memoizer;
mod store;

pub use future::FutureKeyedMemo;
pub use memoizer::clear;
pub use memoizer::FirstKey;
pub use memoizer::KeyedMemo;
pub use memoizer::KeyedOptions;
pub use memoizer::MemoId;
pub use store::spawn_cleaner;
pub use store::KeyedStore;
pub use store::SharedStore;
