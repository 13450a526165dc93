//! `async_rpc` — an asynchronous RPC framework built around a
//! completion-queue-driven server runtime and event-queue-serialized
//! per-call handler callbacks.
//!
//! Modeled on Google Cartographer's `async_grpc` C++ library: a small,
//! transport-agnostic layer on top of a completion-queue abstraction,
//! providing the server-side state machine (`New -> Reading -> Processing
//! -> Writing -> Finishing -> Done`), a retrying synchronous client, and a
//! callback-based asynchronous client, over four RPC shapes (unary,
//! client-streaming, server-streaming, bidirectional streaming).
//!
//! ## Layout
//!
//! - [`status`] / [`descriptor`]: the small value types every other module
//!   builds on (status codes, method/stream-type descriptors).
//! - [`completion`] / [`event_queue`]: the two thread pools the runtime is
//!   built from — driver threads draining transport completions, and
//!   event-queue threads serializing per-RPC callbacks.
//! - [`transport`]: the pluggable boundary to the underlying wire protocol,
//!   plus a complete in-process loopback transport used by the test suite.
//! - [`context`]: the shared, type-erased execution context handlers can
//!   read through locked or unlocked accessors.
//! - [`handler`] / [`rpc`] / [`service`] / [`server`]: the server-side
//!   state machine, its handler surface, the per-service dispatcher, and
//!   the top-level builder/lifecycle.
//! - [`retry`]: the pure retry-strategy decorator used by the synchronous
//!   client.
//! - [`credentials`]: client-side credential providers (token-file OAuth).
//! - [`span`]: optional tracing spans around a call's lifetime.
//! - [`client`]: the synchronous (retrying) and asynchronous (callback)
//!   client surfaces.

pub mod client;
pub mod completion;
pub mod context;
pub mod credentials;
pub mod descriptor;
pub mod event_queue;
pub mod handler;
pub mod retry;
pub mod rpc;
pub mod server;
pub mod service;
pub mod span;
pub mod status;
pub mod transport;

pub use client::{AsyncServerStreamingClient, AsyncUnaryClient, Channel, Client as SyncClient};
pub use completion::{Completion, CompletionQueuePool, GlobalCompletionQueuePool};
pub use context::ExecutionContext;
pub use credentials::{ClientContext, CredentialsProvider, TokenFileCredentials};
pub use descriptor::{MessageDescriptor, MethodInfo, StreamType};
pub use event_queue::{EventQueuePool, EventQueueSelector};
pub use handler::{RpcHandle, RpcHandler, RpcHandlerFactory, Writer};
pub use retry::{retry_with_strategy, RetryStrategy};
pub use server::{Server, ServerBuilder, ServerCredentials};
pub use service::Service;
pub use span::{start_span, NoopSpan, Span};
pub use status::{Code, Status};
