//! Shared execution context (spec.md §4.5 "SetExecutionContext" / §4.6
//! "GetContext<T>() / GetUnsynchronizedContext<T>()").
//!
//! Grounded on `examples/original_source/async_grpc/rpc_handler.h`'s
//! `GetContext`/`GetUnsynchronizedContext`: `GetContext<T>()` locks the
//! context and downcasts, returning a guard tied to the lock's lifetime;
//! `GetUnsynchronizedContext<T>()` downcasts without locking, for context
//! types the caller already knows are not concurrently mutated (e.g. set up
//! once before `Start()` and read-only afterward). There is no code-generated
//! `T`, so downcasting uses `std::any::Any` instead of the original's
//! `dynamic_cast`.

use std::any::Any;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard};

/// One process-wide, type-erased user state object, installed once via
/// `ServerBuilder::set_execution_context` before `Start()` (spec.md §5
/// "Completion-queue pool and event-queue pool are immutable after
/// `Start()`" — the execution context follows the same discipline).
pub struct ExecutionContext {
    lock: Mutex<()>,
    value: Box<dyn Any + Send + Sync>,
}

impl ExecutionContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self { lock: Mutex::new(()), value: Box::new(value) }
    }

    /// Locked, checked access. Returns `None` if `T` does not match the
    /// installed context type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Synchronized<'_, T>> {
        let guard = self.lock.lock().unwrap();
        self.value.downcast_ref::<T>().map(|value| Synchronized { _guard: guard, value })
    }

    /// Unlocked, checked access — the caller vouches that nothing is
    /// concurrently mutating the context.
    pub fn get_unsynchronized<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

/// A reference to the execution context held alongside the lock that
/// protects it. Dereferences to `&T`.
pub struct Synchronized<'a, T> {
    _guard: MutexGuard<'a, ()>,
    value: &'a T,
}

impl<'a, T> Deref for Synchronized<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counters {
        requests: std::sync::atomic::AtomicU64,
    }

    #[test]
    fn synchronized_access_downcasts_to_installed_type() {
        let ctx = ExecutionContext::new(Counters { requests: std::sync::atomic::AtomicU64::new(0) });
        let counters = ctx.get::<Counters>().expect("type matches");
        counters.requests.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(counters.requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn mismatched_type_returns_none() {
        let ctx = ExecutionContext::new(42u32);
        assert!(ctx.get::<String>().is_none());
        assert!(ctx.get_unsynchronized::<String>().is_none());
    }

    #[test]
    fn unsynchronized_access_skips_the_lock() {
        let ctx = ExecutionContext::new(7i64);
        assert_eq!(*ctx.get_unsynchronized::<i64>().unwrap(), 7);
    }
}
