//! Synchronous client (spec.md §4.8).
//!
//! Grounded on `examples/original_source/async_grpc/client.h`'s `Client<T>`:
//! one client per call, not reusable, exposing `Write`/`StreamRead`/
//! `StreamWritesDone`/`StreamFinish`. The source blocks the calling thread
//! inside gRPC's synchronous stubs; this client reproduces that by driving
//! the async [`crate::transport::Dialer`]/[`crate::transport::ClientTransport`]
//! to completion on a caller-supplied [`tokio::runtime::Handle`] via
//! `block_on`, so callers outside of any Tokio context still see a plain
//! blocking call.

use std::any::Any;

use crate::client::channel::Channel;
use crate::descriptor::StreamType;
use crate::retry::{retry_with_strategy, RetryStrategy};
use crate::status::Status;
use crate::transport::ClientTransport;

/// One RPC call. Constructed fresh per call (spec.md §4.8 "Lifecycle: one
/// client per call; not thread-safe; not reusable across calls").
pub struct Client {
    channel: Channel,
    stream_type: StreamType,
    retry_strategy: Option<RetryStrategy>,
    runtime: tokio::runtime::Handle,
    transport: Option<Box<dyn ClientTransport>>,
}

impl Client {
    pub fn new(channel: Channel, stream_type: StreamType, runtime: tokio::runtime::Handle) -> Self {
        Self { channel, stream_type, retry_strategy: None, runtime, transport: None }
    }

    /// Retry is only legal for `UNARY` methods (spec.md §4.7 "Retry is only
    /// legal for unary RPCs in the synchronous client").
    pub fn with_retry_strategy(mut self, retry_strategy: RetryStrategy) -> Self {
        assert_eq!(
            self.stream_type,
            StreamType::Unary,
            "retry is only supported for unary RPCs"
        );
        self.retry_strategy = Some(retry_strategy);
        self
    }

    async fn unary_attempt<Req, Resp>(&self, request: Req) -> Result<Resp, Status>
    where
        Req: Any + Send + 'static,
        Resp: Any + Send + 'static,
    {
        let _client_context = self.channel.client_context().await?;
        let mut transport = self
            .channel
            .dialer()
            .dial()
            .await
            .map_err(|error| Status::internal(format!("dial failed: {error}")))?;
        transport
            .write(Box::new(request))
            .await
            .map_err(|error| Status::internal(format!("write failed: {error}")))?;
        transport
            .writes_done()
            .await
            .map_err(|error| Status::internal(format!("writes_done failed: {error}")))?;
        let message = transport
            .read()
            .await
            .map_err(|error| Status::internal(format!("read failed: {error}")))?;
        let status = transport
            .finish()
            .await
            .map_err(|error| Status::internal(format!("finish failed: {error}")))?;
        if !status.is_ok() {
            return Err(status);
        }
        let message = message.ok_or_else(|| Status::internal("server finished OK without a response"))?;
        message
            .downcast::<Resp>()
            .map(|boxed| *boxed)
            .map_err(|_| Status::internal("response message type mismatch"))
    }

    /// Blocking unary call (spec.md §4.8 "Write(request, *status_out) ->
    /// bool"), retried per the configured [`RetryStrategy`] if any.
    pub fn call_unary<Req, Resp>(&self, request: Req) -> Result<Resp, Status>
    where
        Req: Any + Send + Clone + 'static,
        Resp: Any + Send + 'static,
    {
        assert_eq!(self.stream_type, StreamType::Unary, "call_unary is only valid for UNARY methods");
        let mut response_slot: Option<Resp> = None;
        let mut last_status = Status::ok();
        let ok = retry_with_strategy(
            self.retry_strategy.as_ref(),
            || {
                let status = self.runtime.block_on(self.unary_attempt(request.clone()));
                last_status = match status {
                    Ok(response) => {
                        response_slot = Some(response);
                        Status::ok()
                    }
                    Err(status) => status,
                };
                last_status.clone()
            },
            || {},
        );
        if ok {
            Ok(response_slot.take().expect("ok attempt always stores a response"))
        } else {
            Err(last_status)
        }
    }

    async fn ensure_transport_dialed(&mut self) -> Result<(), Status> {
        if self.transport.is_none() {
            let _client_context = self.channel.client_context().await?;
            let transport = self
                .channel
                .dialer()
                .dial()
                .await
                .map_err(|error| Status::internal(format!("dial failed: {error}")))?;
            self.transport = Some(transport);
        }
        Ok(())
    }

    /// Writes one request on a streaming call (spec.md §4.8). Not retried:
    /// streaming retries would require replaying prior writes (spec.md
    /// §4.7).
    pub fn stream_write<Req: Any + Send + 'static>(&mut self, request: Req) -> Result<(), Status> {
        assert_ne!(
            self.stream_type,
            StreamType::Unary,
            "stream_write is only valid for streaming methods"
        );
        let runtime = self.runtime.clone();
        runtime.block_on(async {
            self.ensure_transport_dialed().await?;
            self.transport
                .as_mut()
                .expect("just dialed")
                .write(Box::new(request))
                .await
                .map_err(|error| Status::internal(format!("write failed: {error}")))
        })
    }

    /// Reads one response on a streaming call. `Ok(None)` means end-of-stream
    /// (spec.md §4.8 "StreamRead").
    pub fn stream_read<Resp: Any + Send + 'static>(&mut self) -> Result<Option<Resp>, Status> {
        assert!(
            self.stream_type.server_streams(),
            "stream_read is only valid for server-streaming/bidi methods"
        );
        let runtime = self.runtime.clone();
        runtime.block_on(async {
            self.ensure_transport_dialed().await?;
            let message = self
                .transport
                .as_mut()
                .expect("just dialed")
                .read()
                .await
                .map_err(|error| Status::internal(format!("read failed: {error}")))?;
            match message {
                None => Ok(None),
                Some(message) => message
                    .downcast::<Resp>()
                    .map(|boxed| Some(*boxed))
                    .map_err(|_| Status::internal("response message type mismatch")),
            }
        })
    }

    /// Half-closes the client's write side (spec.md §4.8 "StreamWritesDone").
    pub fn stream_writes_done(&mut self) -> Result<(), Status> {
        assert!(
            self.stream_type.client_streams(),
            "stream_writes_done is only valid for client-streaming/bidi methods"
        );
        let runtime = self.runtime.clone();
        runtime.block_on(async {
            self.ensure_transport_dialed().await?;
            self.transport
                .as_mut()
                .expect("just dialed")
                .writes_done()
                .await
                .map_err(|error| Status::internal(format!("writes_done failed: {error}")))
        })
    }

    /// Waits for the server's terminal status (spec.md §4.8 "StreamFinish").
    pub fn stream_finish(&mut self) -> Result<Status, Status> {
        let runtime = self.runtime.clone();
        runtime.block_on(async {
            self.ensure_transport_dialed().await?;
            self.transport
                .as_mut()
                .expect("just dialed")
                .finish()
                .await
                .map_err(|error| Status::internal(format!("finish failed: {error}")))
        })
    }
}
