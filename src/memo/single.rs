//! Contains the single-slot memoizer for synchronous results.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::equality::ShallowEq;
use crate::memo::{EqualityFn, MemoOptions, Slot};

/// Memoizes the latest successful result of a synchronous function.
///
/// The wrapped function receives an optional calling context (compared by identity, see the
/// [module docs](crate::memo)) and a reference to the argument list. Arbitrary arities are
/// expressed as tuples. Any `Err` returned by the function propagates to the caller of that
/// specific invocation and is never cached.
///
/// # Examples
/// ```
/// use mnemo::memo::Memo;
///
/// let memo = Memo::new(|_ctx: Option<&()>, args: &(u32, u32)| Ok::<_, String>(args.0 + args.1));
///
/// assert_eq!(memo.call((1, 2)).unwrap(), 3);
/// assert_eq!(memo.call((1, 2)).unwrap(), 3);
/// assert_eq!(memo.call((2, 2)).unwrap(), 4);
/// ```
///
/// Passing a calling context makes the same memoizer usable from several "receivers" - the
/// slot is busted whenever the context identity changes:
/// ```
/// use mnemo::memo::Memo;
/// use std::sync::Arc;
///
/// let memo = Memo::new(|ctx: Option<&u32>, _args: &()| Ok::<_, String>(*ctx.unwrap() * 2));
///
/// let first = Arc::new(10);
/// let second = Arc::new(20);
/// assert_eq!(memo.call_with(Some(&first), ()).unwrap(), 20);
/// assert_eq!(memo.call_with(Some(&second), ()).unwrap(), 40);
/// ```
pub struct Memo<C, A: 'static, R, F> {
    func: F,
    is_equal: EqualityFn<A>,
    max_age: Option<Duration>,
    slot: Mutex<Slot<C, A, R>>,
}

impl<C, A, R, E, F> Memo<C, A, R, F>
where
    F: Fn(Option<&C>, &A) -> Result<R, E>,
    A: ShallowEq + 'static,
    R: Clone,
{
    /// Wraps the given function using the default options.
    ///
    /// The arguments are compared via [ShallowEq] and the cached result remains valid until
    /// the inputs change.
    pub fn new(func: F) -> Self {
        Memo::with_options(func, MemoOptions::new())
    }

    /// Wraps the given function using the given options.
    pub fn with_options(func: F, options: MemoOptions<A>) -> Self {
        Memo {
            func,
            is_equal: options
                .is_equal
                .unwrap_or_else(|| Box::new(|args: &A, last_args: &A| args.shallow_eq(last_args))),
            max_age: options.max_age,
            slot: Mutex::new(Slot::empty()),
        }
    }

    /// Invokes the memoized function without a calling context.
    pub fn call(&self, args: A) -> Result<R, E> {
        self.call_with(None, args)
    }

    /// Invokes the memoized function with the given calling context.
    ///
    /// If the slot holds a valid result for the identical context and equal arguments, it is
    /// returned without invoking the underlying function and without any side effect on the
    /// cached state. Otherwise the underlying function is invoked with the given context and
    /// arguments - on success the slot is replaced, on failure it is left untouched and the
    /// error is passed on.
    pub fn call_with(&self, ctx: Option<&Arc<C>>, args: A) -> Result<R, E> {
        {
            let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_fresh_hit(ctx, &args, &self.is_equal) {
                if let Some(result) = slot.last_result.as_ref() {
                    return Ok(result.clone());
                }
            }
        }

        // Note that the lock is not held while the underlying function runs. This keeps
        // re-entrant calls (memoized recursion) from deadlocking.
        let result = (self.func)(ctx.map(|ctx| ctx.as_ref()), &args)?;

        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.commit(ctx, args, result.clone(), self.max_age);

        Ok(result)
    }
}
