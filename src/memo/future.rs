//! Contains the single-slot memoizer for asynchronous results.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::equality::ShallowEq;
use crate::memo::{EqualityFn, MemoOptions, Slot};

/// The pending handle under which an asynchronous result is cached and shared.
///
/// Awaiting a clone of this handle drives the underlying computation; all clones settle
/// together and yield the same (cloned) result.
pub type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Memoizes the latest pending result of an asynchronous function.
///
/// This behaves like [Memo](crate::memo::Memo) with one important difference: what is cached
/// is the *pending handle*, not the settled value. Invoking the memoizer never awaits
/// anything - it either returns the cached handle or invokes the underlying function, commits
/// the freshly created handle and returns it. Repeated calls within the validity window
/// therefore share one underlying computation and resolve together.
///
/// If the pending result eventually rejects, the slot is marked stale so that the next call
/// re-invokes the function instead of replaying the rejection. This happens through an
/// observer task which consults the slot at settlement time: a rejection belonging to an
/// older in-flight call never invalidates a slot which a later call has already replaced.
/// The rejection itself still propagates to every caller awaiting the handle. Successful
/// settlement writes nothing - the slot already holds the handle.
///
/// Note that invoking the memoizer requires a running [tokio] runtime, as the rejection
/// observer is spawned onto it.
///
/// # Examples
/// ```
/// use futures::FutureExt;
/// use mnemo::memo::FutureMemo;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let memo = FutureMemo::new(|_ctx: Option<&()>, args: &(u64,)| {
///     let n = args.0;
///     async move { Ok::<_, String>(n * 2) }.boxed()
/// });
///
/// let first = memo.call((21,));
/// let second = memo.call((21,));
///
/// // Both handles refer to the same underlying computation...
/// assert_eq!(first.ptr_eq(&second), true);
/// assert_eq!(first.await.unwrap(), 42);
/// assert_eq!(second.await.unwrap(), 42);
/// # }
/// ```
pub struct FutureMemo<C, A: 'static, T: 'static, E: 'static, F> {
    func: F,
    is_equal: EqualityFn<A>,
    max_age: Option<Duration>,
    slot: Arc<Mutex<Slot<C, A, SharedResult<T, E>>>>,
}

impl<C, A, T, E, F> FutureMemo<C, A, T, E, F>
where
    F: Fn(Option<&C>, &A) -> BoxFuture<'static, Result<T, E>>,
    C: Send + Sync + 'static,
    A: ShallowEq + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wraps the given function using the default options.
    pub fn new(func: F) -> Self {
        FutureMemo::with_options(func, MemoOptions::new())
    }

    /// Wraps the given function using the given options.
    pub fn with_options(func: F, options: MemoOptions<A>) -> Self {
        FutureMemo {
            func,
            is_equal: options
                .is_equal
                .unwrap_or_else(|| Box::new(|args: &A, last_args: &A| args.shallow_eq(last_args))),
            max_age: options.max_age,
            slot: Arc::new(Mutex::new(Slot::empty())),
        }
    }

    /// Invokes the memoized function without a calling context.
    pub fn call(&self, args: A) -> SharedResult<T, E> {
        self.call_with(None, args)
    }

    /// Invokes the memoized function with the given calling context.
    ///
    /// Returns the cached pending handle if the slot holds a valid one for the identical
    /// context and equal arguments. Otherwise the underlying function is invoked, its future
    /// is committed into the slot as the new pending handle and returned - along with a
    /// spawned observer which marks the slot stale should this handle reject while it is
    /// still the current one.
    pub fn call_with(&self, ctx: Option<&Arc<C>>, args: A) -> SharedResult<T, E> {
        {
            let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_fresh_hit(ctx, &args, &self.is_equal) {
                if let Some(handle) = slot.last_result.as_ref() {
                    return handle.clone();
                }
            }
        }

        let handle = (self.func)(ctx.map(|ctx| ctx.as_ref()), &args).shared();

        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.commit(ctx, args, handle.clone(), self.max_age);
        }

        self.watch_rejection(handle.clone());

        handle
    }

    /// Spawns an observer which reacts to a rejection of the given pending handle.
    ///
    /// The observer consults the slot at settlement time: only if the slot still holds this
    /// very handle it is marked stale. A handle which has already been superseded by a later
    /// call must not invalidate that call's result.
    fn watch_rejection(&self, handle: SharedResult<T, E>) {
        let slot = Arc::downgrade(&self.slot);

        crate::spawn!(async move {
            if handle.clone().await.is_err() {
                if let Some(slot) = slot.upgrade() {
                    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    let still_current = slot
                        .last_result
                        .as_ref()
                        .map(|current| current.ptr_eq(&handle))
                        .unwrap_or(false);
                    if still_current {
                        slot.stale = true;
                    }
                }
            }
        });
    }
}
