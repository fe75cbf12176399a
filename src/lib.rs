//! Mnemo is a library for memoizing synchronous and asynchronous function results with
//! equality- and expiry-driven invalidation.
//!
//! # Introduction
//! **Mnemo** wraps a **pure-ish** callable so that repeated invocations with unchanged inputs
//! return the previously computed result instead of re-running the computation. The interesting
//! part of such a cache is not storing values but *invalidating* them: deciding when a cached
//! result is still trustworthy, never committing a computation which failed, and unwinding
//! partially-settled asynchronous results without dropping concurrently in-flight successful
//! ones.
//!
//! Two closely related designs are provided which share one contract surface:
//!
//! * The **single-slot memoizer** ([memo]) remembers exactly one (context, arguments, result)
//!   triple per wrapped function. Comparing the calling context (by identity) and the arguments
//!   (by shallow equality) against the previous call decides hit or miss. A `max_age` turns the
//!   slot stale after a bounded validity window.
//! * The **keyed memoizer** ([keyed]) remembers many (key → value, expiry) entries per wrapped
//!   function, where the key is derived from the arguments (by default: the first argument).
//!   A periodic cleaner removes entries once their expiry has passed.
//!
//! Both designs guarantee that errors are never cached: a failing invocation propagates to its
//! caller and leaves the previously cached state untouched. For asynchronous results, the
//! *pending handle* itself is cached, so concurrent callers share one underlying computation -
//! and a late rejection of an older in-flight call can never invalidate a fresher success.
//!
//! # Features
//! * **Identity-aware equality** - the default argument comparator performs shallow per-position
//!   checks, treats two NaN values as equal and compares shared pointers ([std::sync::Arc]) by
//!   identity rather than by value. A custom equality function can replace it entirely.
//! * **Expiry without clock plumbing** - validity windows are recorded as deadlines and enforced
//!   at the cache gate; the keyed store additionally supports a background sweep driven by
//!   [keyed::spawn_cleaner].
//! * **100% Async/Await** - asynchronous results build upon [tokio](https://tokio.rs/) and the
//!   shared futures of the [futures](https://docs.rs/futures) crate. Rejection handling runs as
//!   a spawned observer which consults the cache state at settlement time.
//! * **Shareable stores** - a [keyed::KeyedStore] can be supplied externally and shared across
//!   several memoized functions or cleared through an opaque handle id.
//!
//! # Modules
//! * **memo**: the single-slot memoizer for synchronous ([memo::Memo]) and asynchronous
//!   ([memo::FutureMemo]) results. See [crate::memo].
//! * **keyed**: the keyed memoizer ([keyed::KeyedMemo]), its asynchronous adapter
//!   ([keyed::FutureKeyedMemo]), the underlying store and the cleanup machinery.
//!   See [crate::keyed].
//! * **equality**: the [equality::ShallowEq] trait implementing the default argument
//!   comparator. See [crate::equality].
//! * **fmt**: parsing and formatting helpers for durations. See [crate::fmt].
//!
//! # Examples
//! ```
//! use mnemo::memo::Memo;
//!
//! let memo = Memo::new(|_ctx: Option<&()>, args: &(i32, i32)| Ok::<_, String>(args.0 + args.1));
//!
//! assert_eq!(memo.call((1, 2)).unwrap(), 3);
//! // The second call is answered from the cache without re-invoking the function...
//! assert_eq!(memo.call((1, 2)).unwrap(), 3);
//! // ...whereas changed arguments re-invoke it.
//! assert_eq!(memo.call((2, 2)).unwrap(), 4);
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod equality;
pub mod fmt;
pub mod keyed;
pub mod memo;

/// Initializes the logging system.
///
/// Note that this is provided for applications which do not set up a logger themselves. All
/// diagnostic output of the library is emitted via the [log](https://docs.rs/log) facade and
/// will be picked up by whatever logger the embedding application installs.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate mnemo;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This is most notably the mocked clock, which is process-global and
        /// therefore must not be advanced by two tests at once. Using this lock, we can
        /// still execute all other tests in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
