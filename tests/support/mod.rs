//! Example handlers for the end-to-end scenarios (spec.md §8), grounded on
//! the handler shapes the scenarios name directly: `GetSquare`, `GetSum`,
//! `GetSequence`, `GetRunningSum`.

use std::sync::{Arc, Mutex};

use async_rpc::descriptor::{MessageDescriptor, MethodInfo, StreamType};
use async_rpc::handler::{RpcHandle, RpcHandler, RpcHandlerFactory, Writer};
use async_rpc::status::Status;
use async_rpc::transport::BoxMessage;

#[derive(Debug, Clone)]
pub struct IntRequest {
    pub input: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntResponse {
    pub output: i64,
}

fn downcast_request(message: BoxMessage) -> IntRequest {
    *message.downcast::<IntRequest>().expect("request message type checked at the boundary")
}

pub fn method_info(fully_qualified_name: &str, stream_type: StreamType, handler_factory: RpcHandlerFactory) -> MethodInfo {
    MethodInfo {
        request_descriptor: MessageDescriptor::of::<IntRequest>("IntRequest"),
        response_descriptor: MessageDescriptor::of::<IntResponse>("IntResponse"),
        stream_type,
        handler_factory,
        fully_qualified_name: Arc::from(fully_qualified_name),
    }
}

/// Scenario 1/2 — `GetSquare: input -> output = input*input`; negative
/// input finishes `INTERNAL("internal error")` with no response.
#[derive(Default)]
struct SquareHandler {
    handle: Option<RpcHandle>,
}

impl RpcHandler for SquareHandler {
    fn initialize(&mut self, handle: RpcHandle) {
        self.handle = Some(handle);
    }

    fn on_request(&mut self, request: BoxMessage) {
        let request = downcast_request(request);
        let handle = self.handle.as_ref().expect("initialized before any request");
        if request.input < 0 {
            handle.finish(Status::internal("internal error"));
            return;
        }
        handle.send(Box::new(IntResponse { output: request.input * request.input }));
        handle.finish(Status::ok());
    }
}

pub fn square_factory() -> RpcHandlerFactory {
    Arc::new(|| Box::new(SquareHandler::default()) as Box<dyn RpcHandler>)
}

/// Scenario 3 — `GetSum`: accumulates `sum += 10 + request.input` per
/// request, responds once on `OnReadsDone`.
#[derive(Default)]
struct SumHandler {
    handle: Option<RpcHandle>,
    sum: i64,
}

const SUM_INCREMENT: i64 = 10;

impl RpcHandler for SumHandler {
    fn initialize(&mut self, handle: RpcHandle) {
        self.handle = Some(handle);
    }

    fn on_request(&mut self, request: BoxMessage) {
        let request = downcast_request(request);
        self.sum += SUM_INCREMENT + request.input;
    }

    fn on_reads_done(&mut self) {
        let handle = self.handle.as_ref().expect("initialized before reads done");
        handle.send(Box::new(IntResponse { output: self.sum }));
        handle.finish(Status::ok());
    }
}

pub fn sum_factory() -> RpcHandlerFactory {
    Arc::new(|| Box::new(SumHandler::default()) as Box<dyn RpcHandler>)
}

/// Scenario 4 — `GetSequence`: given `{input:n}` emits `{output:0}..{output:n-1}`
/// then finishes OK.
#[derive(Default)]
struct SequenceHandler {
    handle: Option<RpcHandle>,
}

impl RpcHandler for SequenceHandler {
    fn initialize(&mut self, handle: RpcHandle) {
        self.handle = Some(handle);
    }

    fn on_request(&mut self, request: BoxMessage) {
        let request = downcast_request(request);
        let handle = self.handle.as_ref().expect("initialized before any request");
        for i in 0..request.input {
            handle.send(Box::new(IntResponse { output: i }));
        }
        handle.finish(Status::ok());
    }
}

pub fn sequence_factory() -> RpcHandlerFactory {
    Arc::new(|| Box::new(SequenceHandler::default()) as Box<dyn RpcHandler>)
}

/// Scenario 5 — `GetRunningSum`: on each request emits two identical
/// responses carrying the running sum, finishes OK on `OnReadsDone`.
#[derive(Default)]
struct RunningSumHandler {
    handle: Option<RpcHandle>,
    sum: i64,
}

impl RpcHandler for RunningSumHandler {
    fn initialize(&mut self, handle: RpcHandle) {
        self.handle = Some(handle);
    }

    fn on_request(&mut self, request: BoxMessage) {
        let request = downcast_request(request);
        self.sum += request.input;
        let handle = self.handle.as_ref().expect("initialized before any request");
        handle.send(Box::new(IntResponse { output: self.sum }));
        handle.send(Box::new(IntResponse { output: self.sum }));
    }

    fn on_reads_done(&mut self) {
        self.handle.as_ref().expect("initialized before reads done").finish(Status::ok());
    }
}

pub fn running_sum_factory() -> RpcHandlerFactory {
    Arc::new(|| Box::new(RunningSumHandler::default()) as Box<dyn RpcHandler>)
}

/// Scenario 7 — a handler that publishes its `Writer` to an external slot
/// at `initialize` time instead of ever calling `send`/`finish` itself, so a
/// foreign thread can drive the call.
struct PublishWriterHandler {
    slot: Arc<Mutex<Option<Writer>>>,
}

impl RpcHandler for PublishWriterHandler {
    fn initialize(&mut self, handle: RpcHandle) {
        *self.slot.lock().unwrap() = Some(handle.writer());
    }

    fn on_request(&mut self, _request: BoxMessage) {}
}

pub fn publish_writer_factory() -> (RpcHandlerFactory, Arc<Mutex<Option<Writer>>>) {
    let slot: Arc<Mutex<Option<Writer>>> = Arc::new(Mutex::new(None));
    let slot_for_factory = slot.clone();
    let factory: RpcHandlerFactory = Arc::new(move || Box::new(PublishWriterHandler { slot: slot_for_factory.clone() }));
    (factory, slot)
}
