//! Asynchronous client (spec.md §4.9).
//!
//! Grounded on `examples/original_source/async_grpc/async_client.h`: one
//! concrete variant per stream type, sharing the process-wide
//! [`GlobalCompletionQueuePool`], invoking the caller's callback directly
//! from the completion-queue driver thread exactly as the source's
//! `HandleEvent` does — there is no event-queue indirection on the client
//! side, only on the server's handler-callback path (spec.md §4.6).

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::client::channel::Channel;
use crate::completion::{Completion, CompletionQueue, GlobalCompletionQueuePool};
use crate::status::Status;
use crate::transport::BoxMessage;

fn downcast<T: Any>(message: BoxMessage) -> Option<T> {
    message.downcast::<T>().ok().map(|boxed| *boxed)
}

type Callback<Resp> = Arc<dyn Fn(Status, Option<Resp>) + Send + Sync>;

/// Async client for `NORMAL_RPC` methods: exactly one callback invocation,
/// `(status, response_or_none)` (spec.md §4.9).
pub struct AsyncUnaryClient<Resp> {
    channel: Channel,
    completion_queue: Arc<CompletionQueue>,
    runtime: tokio::runtime::Handle,
    callback: Callback<Resp>,
    _marker: PhantomData<Resp>,
}

impl<Resp: Any + Send + 'static> AsyncUnaryClient<Resp> {
    pub fn new(
        channel: Channel,
        runtime: tokio::runtime::Handle,
        callback: impl Fn(Status, Option<Resp>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel,
            completion_queue: GlobalCompletionQueuePool::next_queue(),
            runtime,
            callback: Arc::new(callback),
            _marker: PhantomData,
        }
    }

    /// Starts the call (spec.md §4.9 "WriteAsync(request)"). Returns
    /// immediately; the callback fires once, later, from a driver thread.
    pub fn write_async<Req: Any + Send + 'static>(&self, request: Req) {
        let channel = self.channel.clone();
        let completion_queue = self.completion_queue.clone();
        let callback = self.callback.clone();
        self.runtime.spawn(async move {
            let outcome: Result<Option<Resp>, Status> = async {
                let _client_context = channel.client_context().await?;
                let mut transport = channel
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
                Ok(message.and_then(downcast::<Resp>))
            }
            .await;
            completion_queue.post(Box::new(UnaryCompletion { outcome, callback }), true);
        });
    }
}

struct UnaryCompletion<Resp> {
    outcome: Result<Option<Resp>, Status>,
    callback: Callback<Resp>,
}

impl<Resp: Send + 'static> Completion for UnaryCompletion<Resp> {
    fn complete(self: Box<Self>, _ok: bool) {
        match self.outcome {
            Ok(response) => (self.callback)(Status::ok(), response),
            Err(status) => (self.callback)(status, None),
        }
    }
}

/// Async client for `SERVER_STREAMING` methods: one callback per streamed
/// response, then a final `(OK-or-failure, None)` callback signalling
/// end-of-stream (spec.md §8 Scenario 8).
pub struct AsyncServerStreamingClient<Resp> {
    channel: Channel,
    completion_queue: Arc<CompletionQueue>,
    runtime: tokio::runtime::Handle,
    callback: Callback<Resp>,
    _marker: PhantomData<Resp>,
}

impl<Resp: Any + Send + 'static> AsyncServerStreamingClient<Resp> {
    pub fn new(
        channel: Channel,
        runtime: tokio::runtime::Handle,
        callback: impl Fn(Status, Option<Resp>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel,
            completion_queue: GlobalCompletionQueuePool::next_queue(),
            runtime,
            callback: Arc::new(callback),
            _marker: PhantomData,
        }
    }

    pub fn write_async<Req: Any + Send + 'static>(&self, request: Req) {
        let channel = self.channel.clone();
        let completion_queue = self.completion_queue.clone();
        let callback = self.callback.clone();
        self.runtime.spawn(async move {
            let status = stream_responses::<Resp>(&channel, &completion_queue, &callback, request).await;
            completion_queue.post(Box::new(UnaryCompletion { outcome: Err(status), callback }), true);
        });
    }
}

async fn stream_responses<Resp: Any + Send + 'static>(
    channel: &Channel,
    completion_queue: &Arc<CompletionQueue>,
    callback: &Callback<Resp>,
    request: impl Any + Send + 'static,
) -> Status {
    let attempt: Result<Status, Status> = async {
        let _client_context = channel.client_context().await?;
        let mut transport = channel
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
        loop {
            let message = transport
                .read()
                .await
                .map_err(|error| Status::internal(format!("read failed: {error}")))?;
            match message {
                Some(message) => {
                    let response = downcast::<Resp>(message);
                    completion_queue.post(
                        Box::new(UnaryCompletion { outcome: Ok(response), callback: callback.clone() }),
                        true,
                    );
                }
                None => break,
            }
        }
        transport
            .finish()
            .await
            .map_err(|error| Status::internal(format!("finish failed: {error}")))
    }
    .await;
    match attempt {
        Ok(status) => status,
        Err(status) => status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::transport::loopback;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Echo(i64);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unary_callback_fires_once_with_the_response() {
        let (acceptor, dialer) = loopback(4);
        tokio::spawn(async move {
            let transport = acceptor.accept().await.unwrap();
            let (mut reader, mut writer) = transport.split();
            let request = reader.read().await.unwrap().unwrap();
            let value = request.downcast::<Echo>().unwrap();
            writer.write(Box::new(Echo(value.0 * 2))).await.unwrap();
            writer.finish(Status::ok()).await.unwrap();
        });

        let channel = Channel::new(dialer);
        let runtime = tokio::runtime::Handle::current();
        let results: Arc<Mutex<Vec<(Status, Option<Echo>)>>> = Arc::new(Mutex::new(Vec::new()));
        let results_clone = results.clone();
        let client = AsyncUnaryClient::new(channel, runtime, move |status, response| {
            results_clone.lock().unwrap().push((status, response));
        });
        client.write_async(Echo(21));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], (Status::ok(), Some(Echo(42))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn server_streaming_fires_one_callback_per_response_then_end_of_stream() {
        let (acceptor, dialer) = loopback(16);
        tokio::spawn(async move {
            let transport = acceptor.accept().await.unwrap();
            let (mut reader, mut writer) = transport.split();
            let request = reader.read().await.unwrap().unwrap();
            let count = request.downcast::<i64>().unwrap();
            for i in 0..*count {
                writer.write(Box::new(i)).await.unwrap();
            }
            writer.finish(Status::ok()).await.unwrap();
        });

        let channel = Channel::new(dialer);
        let runtime = tokio::runtime::Handle::current();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let finishes = Arc::new(AtomicUsize::new(0));
        let responses_clone = responses.clone();
        let finishes_clone = finishes.clone();
        let client = AsyncServerStreamingClient::new(channel, runtime, move |status, response: Option<i64>| {
            match response {
                Some(value) => responses_clone.lock().unwrap().push(value),
                None => {
                    assert!(status.is_ok());
                    finishes_clone.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        client.write_async(10i64);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*responses.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(finishes.load(Ordering::SeqCst), 1);
    }
}
