//! Handler surface (spec.md §4.6).
//!
//! Grounded on `examples/original_source/async_grpc/rpc_handler.h` and
//! `rpc_handler_interface.h`: the original expresses the handler surface as
//! a CRTP base class (`RpcHandler<RpcServiceMethodConcept>`) providing
//! `Send`/`Finish`/`GetWriter`/`GetContext` via an `Rpc*` and
//! `ExecutionContext*` injected by `SetRpc`/`SetExecutionContext`. This
//! crate has no code-generated per-method base class to inherit from, so
//! the same capability set is offered by composition: a handler implements
//! the small [`RpcHandler`] trait and is handed an [`RpcHandle`] at
//! `initialize` time, which bundles the weak RPC reference and the
//! execution context the original attaches as fields.

use std::any::Any;
use std::sync::{Arc, Weak};

use crate::context::{ExecutionContext, Synchronized};
use crate::rpc::Rpc;
use crate::status::Status;
use crate::transport::BoxMessage;

/// User-supplied per-RPC handler (spec.md §4.6). One instance is created per
/// call by the registered [`RpcHandlerFactory`] and lives for the RPC's
/// entire lifetime on its assigned event queue.
///
/// Exact-once semantics are enforced by the caller (the RPC state machine),
/// not by this trait: `on_request` fires once per request message,
/// `on_reads_done` at most once, `on_finish` exactly once (spec.md §4.6).
pub trait RpcHandler: Send {
    /// Called once, immediately after construction, on the RPC's event
    /// queue, before any `on_request` (spec.md §4.3 "NEW_CONNECTION").
    fn initialize(&mut self, handle: RpcHandle) {
        let _ = handle;
    }

    /// Called once per incoming request message.
    fn on_request(&mut self, request: BoxMessage);

    /// Called at most once, when the client half-closes its write side.
    fn on_reads_done(&mut self) {}

    /// Called exactly once, after the call has fully terminated, before the
    /// RPC is destroyed.
    fn on_finish(&mut self) {}
}

/// Constructs a fresh, uninitialized handler for one new call.
pub type RpcHandlerFactory = Arc<dyn Fn() -> Box<dyn RpcHandler> + Send + Sync>;

/// Bundles everything a handler needs to act on its own RPC: the weak
/// back-reference plus the server's execution context. Handed to
/// `RpcHandler::initialize` and normally stored by the handler so `send`,
/// `finish`, and `writer` stay reachable for the call's duration.
#[derive(Clone)]
pub struct RpcHandle {
    rpc: Weak<Rpc>,
    execution_context: Arc<ExecutionContext>,
}

impl RpcHandle {
    pub(crate) fn new(rpc: Weak<Rpc>, execution_context: Arc<ExecutionContext>) -> Self {
        Self { rpc, execution_context }
    }

    /// Enqueues an outgoing message (spec.md §4.3 "Send(response)"). A
    /// no-op if the RPC has already been destroyed.
    pub fn send(&self, response: BoxMessage) {
        if let Some(rpc) = self.rpc.upgrade() {
            rpc.send(response);
        }
    }

    /// Ends the call with `status` (spec.md §4.3 "Finish(status)"). A no-op
    /// if the RPC has already been destroyed; idempotent otherwise.
    pub fn finish(&self, status: Status) {
        if let Some(rpc) = self.rpc.upgrade() {
            rpc.finish(status);
        }
    }

    /// A thread-safe, weak-referenced facade usable from any thread,
    /// including after this handler's own event-queue thread has moved on
    /// (spec.md §4.3 "Foreign-thread writes", Scenario 7).
    pub fn writer(&self) -> Writer {
        Writer { rpc: self.rpc.clone() }
    }

    /// Locked, checked access to the server's execution context.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Synchronized<'_, T>> {
        self.execution_context.get::<T>()
    }

    /// Unlocked, checked access to the server's execution context.
    pub fn unsynchronized_context<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.execution_context.get_unsynchronized::<T>()
    }
}

/// A thread-safe, weak-referenced handle permitting writes and finishes from
/// outside the RPC's own event queue (spec.md §3 "a *weak* back-handle
/// exposed to user code"). Every operation re-enters through the normal
/// `send`/`finish` path, so foreign-thread writes are still serialized on
/// the RPC's event queue; they simply become a silent no-op once the RPC is
/// gone instead of touching freed state (spec.md §8 invariant 3).
#[derive(Clone)]
pub struct Writer {
    rpc: Weak<Rpc>,
}

impl Writer {
    pub fn write(&self, response: BoxMessage) -> bool {
        match self.rpc.upgrade() {
            Some(rpc) => {
                rpc.send(response);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, status: Status) -> bool {
        match self.rpc.upgrade() {
            Some(rpc) => {
                rpc.finish(status);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_is_noop_once_rpc_is_gone() {
        let rpc: Weak<Rpc> = Weak::new();
        let writer = Writer { rpc };
        assert!(!writer.write(Box::new(42i32)));
        assert!(!writer.finish(Status::ok()));
    }
}
