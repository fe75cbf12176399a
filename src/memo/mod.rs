//! Provides the single-slot memoizer.
//!
//! A single-slot memoizer remembers exactly one invocation: the calling context, the argument
//! list and the result of the most recent successful call. If the next call arrives with the
//! identical context and equal arguments while the slot is still valid, the cached result is
//! returned and the underlying function is not invoked. In every other case the underlying
//! function runs and - if it succeeds - replaces the slot contents.
//!
//! This is the right tool whenever only the *latest* result matters, e.g. for derived values
//! which are recomputed whenever their inputs change but requested much more often than they
//! change. In contrast to a keyed cache (see [crate::keyed]) there is nothing to evict and
//! nothing to sweep: the slot is replaced on change and turns stale after `max_age`.
//!
//! Three rules govern the slot:
//! * The slot is only ever written after a *successful* invocation. A failing call propagates
//!   its error and leaves the previous slot contents untouched, so the next call with the
//!   previously successful arguments is still answered from the cache.
//! * The calling context is always compared by identity ([std::sync::Arc::ptr_eq]) and this
//!   check cannot be overridden. Argument equality defaults to [crate::equality::ShallowEq]
//!   and can be replaced entirely via [MemoOptions::is_equal].
//! * For asynchronous results (see [FutureMemo]) the slot caches the *pending handle*, not the
//!   settled value. Repeated calls within the validity window receive the same handle and
//!   resolve together. If the handle rejects, the slot is marked stale - unless a later call
//!   has replaced it in the meantime, in which case the late rejection is ignored.
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mock_instant::global::Instant;
#[cfg(not(test))]
use std::time::Instant;

mod future;
mod single;

pub use future::FutureMemo;
pub use future::SharedResult;
pub use single::Memo;

/// Compares a new argument list against the one of the previous call.
///
/// Returning **true** means "unchanged" and permits a cache hit. When supplied via
/// [MemoOptions::is_equal], this function alone governs argument equality - the default
/// shallow comparison (including its NaN handling) is bypassed entirely.
pub type EqualityFn<A> = Box<dyn Fn(&A, &A) -> bool + Send + Sync>;

/// Configures a single-slot memoizer.
///
/// All options are optional: by default the arguments are compared via
/// [ShallowEq](crate::equality::ShallowEq) and the cached result stays valid indefinitely.
///
/// # Examples
/// ```
/// use mnemo::memo::{Memo, MemoOptions};
/// use std::time::Duration;
///
/// let options = MemoOptions::new()
///     .is_equal(|new_args: &(i32,), last_args: &(i32,)| new_args.0 == last_args.0)
///     .max_age(Duration::from_secs(30));
///
/// let memo = Memo::with_options(|_ctx: Option<&()>, args: &(i32,)| Ok::<_, String>(args.0), options);
/// assert_eq!(memo.call((42,)).unwrap(), 42);
/// ```
pub struct MemoOptions<A: 'static> {
    is_equal: Option<EqualityFn<A>>,
    max_age: Option<Duration>,
}

impl<A: 'static> MemoOptions<A> {
    /// Creates a new set of options using the defaults described above.
    pub fn new() -> Self {
        MemoOptions {
            is_equal: None,
            max_age: None,
        }
    }

    /// Replaces the default argument comparator by the given function.
    ///
    /// The function receives the new argument list first and the previous one second. Note
    /// that it is never consulted for the very first call and also not if the calling context
    /// has changed - the context identity check always runs first.
    pub fn is_equal(mut self, is_equal: impl Fn(&A, &A) -> bool + Send + Sync + 'static) -> Self {
        self.is_equal = Some(Box::new(is_equal));
        self
    }

    /// Specifies how long a cached result remains valid after a successful call.
    ///
    /// Once this duration has elapsed, the slot is considered stale and the next call will
    /// re-invoke the underlying function. If never set, the cached result is valid
    /// indefinitely (until the inputs change).
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Specifies the validity window just like [MemoOptions::max_age], but parses the duration
    /// from a string like "100ms", "30 s" or "15m" (see [crate::fmt::parse_duration]).
    pub fn max_age_str(self, max_age: impl AsRef<str>) -> anyhow::Result<Self> {
        Ok(self.max_age(crate::fmt::parse_duration(max_age)?))
    }
}

impl<A: 'static> Default for MemoOptions<A> {
    fn default() -> Self {
        MemoOptions::new()
    }
}

/// Contains the cached state of a single-slot memoizer.
///
/// The slot is committed as a whole after a successful invocation. Staleness is tracked both
/// as an explicit flag (set by the rejection observer of [FutureMemo]) and as a deadline
/// which is recorded at commit time and consulted by the gate - each successful invocation
/// supersedes the previous deadline.
struct Slot<C, A, R> {
    last_ctx: Option<Arc<C>>,
    last_args: Option<A>,
    last_result: Option<R>,
    called_once: bool,
    stale: bool,
    valid_until: Option<Instant>,
}

impl<C, A: 'static, R> Slot<C, A, R> {
    fn empty() -> Self {
        Slot {
            last_ctx: None,
            last_args: None,
            last_result: None,
            called_once: false,
            stale: false,
            valid_until: None,
        }
    }

    /// Determines if the given invocation can be answered from the slot.
    ///
    /// The checks run in a fixed order: a result must have been committed at all, it must
    /// neither be marked stale nor past its deadline, the context must be identical and only
    /// then the argument comparator is consulted.
    fn is_fresh_hit(&self, ctx: Option<&Arc<C>>, args: &A, is_equal: &EqualityFn<A>) -> bool {
        self.called_once
            && !self.stale
            && self
                .valid_until
                .map(|deadline| Instant::now() < deadline)
                .unwrap_or(true)
            && same_context(ctx, self.last_ctx.as_ref())
            && match self.last_args.as_ref() {
                Some(last_args) => is_equal(args, last_args),
                None => false,
            }
    }

    /// Commits a successful invocation into the slot.
    fn commit(&mut self, ctx: Option<&Arc<C>>, args: A, result: R, max_age: Option<Duration>) {
        self.last_result = Some(result);
        self.called_once = true;
        self.last_ctx = ctx.cloned();
        self.last_args = Some(args);
        self.stale = false;
        self.valid_until = max_age.map(|max_age| Instant::now() + max_age);
    }
}

/// Compares two calling contexts by identity.
fn same_context<C>(ctx: Option<&Arc<C>>, last_ctx: Option<&Arc<C>>) -> bool {
    match (ctx, last_ctx) {
        (None, None) => true,
        (Some(ctx), Some(last_ctx)) => Arc::ptr_eq(ctx, last_ctx),
        _ => false,
    }
}
