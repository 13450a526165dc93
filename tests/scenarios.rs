//! End-to-end scenarios (spec.md §8).

mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_rpc::descriptor::StreamType;
use async_rpc::retry::{limited_retry_indicator, unlimited_constant_delay_strategy_except, RetryStrategy};
use async_rpc::status::Code;
use async_rpc::transport::loopback;
use async_rpc::{Channel, ServerBuilder, SyncClient};

use support::{method_info, IntRequest, IntResponse};

fn start_test_server(
    method_name: &'static str,
    stream_type: StreamType,
    factory: async_rpc::RpcHandlerFactory,
) -> (Arc<async_rpc::Server>, Channel, tokio::runtime::Handle) {
    let (acceptor, dialer) = loopback(8);
    let info = method_info(&format!("/test.Scenarios/{method_name}"), stream_type, factory);
    let server = ServerBuilder::new()
        .set_num_completion_queues(1)
        .set_num_event_queues(1)
        .register_handler(info, acceptor)
        .expect("well-formed method name")
        .build();
    let server = Arc::new(server);
    server.start().expect("server starts");
    let runtime = tokio::runtime::Handle::current();
    (server, Channel::new(dialer), runtime)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_1_unary_square() {
    let (server, channel, runtime) = start_test_server("GetSquare", StreamType::Unary, support::square_factory());
    let client = SyncClient::new(channel, StreamType::Unary, runtime.clone());
    let response = tokio::task::spawn_blocking(move || client.call_unary::<IntRequest, IntResponse>(IntRequest { input: 11 }))
        .await
        .unwrap()
        .expect("should succeed");
    assert_eq!(response, IntResponse { output: 121 });
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_2_unary_error() {
    let (server, channel, runtime) = start_test_server("GetSquareError", StreamType::Unary, support::square_factory());
    let client = SyncClient::new(channel, StreamType::Unary, runtime.clone());
    let status = tokio::task::spawn_blocking(move || client.call_unary::<IntRequest, IntResponse>(IntRequest { input: -11 }))
        .await
        .unwrap()
        .expect_err("should fail");
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "internal error");
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_3_client_streaming_sum() {
    let (server, channel, runtime) =
        start_test_server("GetSum", StreamType::ClientStreaming, support::sum_factory());
    let response = tokio::task::spawn_blocking(move || {
        let mut client = SyncClient::new(channel, StreamType::ClientStreaming, runtime);
        for input in [0, 1, 2] {
            client.stream_write(IntRequest { input }).expect("write should succeed");
        }
        client.stream_writes_done().expect("writes_done should succeed");
        let status = client.stream_finish().expect("finish should succeed");
        assert!(status.is_ok());
        client.stream_read::<IntResponse>()
    })
    .await
    .unwrap()
    .expect("read should succeed");
    assert_eq!(response, Some(IntResponse { output: 33 }));
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_4_server_streaming_sequence() {
    let (server, channel, runtime) =
        start_test_server("GetSequence", StreamType::ServerStreaming, support::sequence_factory());
    let responses = tokio::task::spawn_blocking(move || {
        let mut client = SyncClient::new(channel, StreamType::ServerStreaming, runtime);
        client.stream_write(IntRequest { input: 12 }).expect("write should succeed");
        let mut responses = Vec::new();
        while let Some(response) = client.stream_read::<IntResponse>().expect("read should succeed") {
            responses.push(response);
        }
        responses
    })
    .await
    .unwrap();
    let expected: Vec<IntResponse> = (0..12).map(|output| IntResponse { output }).collect();
    assert_eq!(responses, expected);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_5_bidi_running_sum() {
    let (server, channel, runtime) =
        start_test_server("GetRunningSum", StreamType::BidiStreaming, support::running_sum_factory());
    let responses = tokio::task::spawn_blocking(move || {
        let mut client = SyncClient::new(channel, StreamType::BidiStreaming, runtime);
        let mut responses = Vec::new();
        for input in [0, 1, 2] {
            client.stream_write(IntRequest { input }).expect("write should succeed");
            responses.push(client.stream_read::<IntResponse>().unwrap().unwrap());
            responses.push(client.stream_read::<IntResponse>().unwrap().unwrap());
        }
        client.stream_writes_done().expect("writes_done should succeed");
        assert!(client.stream_read::<IntResponse>().unwrap().is_none());
        responses
    })
    .await
    .unwrap();
    let expected = [0, 0, 1, 1, 3, 3].map(|output| IntResponse { output });
    assert_eq!(responses, expected);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_6_retry_with_unrecoverable_code_stops_after_one_attempt() {
    let (server, channel, runtime) = start_test_server("GetSquareRetry", StreamType::Unary, support::square_factory());
    let mut unrecoverable = HashSet::new();
    unrecoverable.insert(Code::Internal);
    let strategy: RetryStrategy =
        unlimited_constant_delay_strategy_except(Duration::from_secs(1), unrecoverable);
    let client = SyncClient::new(channel, StreamType::Unary, runtime).with_retry_strategy(strategy);

    let start = Instant::now();
    let status = tokio::task::spawn_blocking(move || client.call_unary::<IntRequest, IntResponse>(IntRequest { input: -1 }))
        .await
        .unwrap()
        .expect_err("should fail");
    assert_eq!(status.code(), Code::Internal);
    assert!(start.elapsed() < Duration::from_millis(500), "should not have slept a whole retry delay");
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_6b_limited_retries_eventually_give_up() {
    let (server, channel, runtime) = start_test_server("GetSquareLimited", StreamType::Unary, support::square_factory());
    let strategy = RetryStrategy::new(
        limited_retry_indicator(3),
        async_rpc::retry::constant_delay(Duration::from_millis(1)),
    );
    let client = SyncClient::new(channel, StreamType::Unary, runtime).with_retry_strategy(strategy);
    let status = tokio::task::spawn_blocking(move || client.call_unary::<IntRequest, IntResponse>(IntRequest { input: -1 }))
        .await
        .unwrap()
        .expect_err("should fail");
    assert_eq!(status.code(), Code::Internal);
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_7_cross_thread_writer() {
    let (factory, slot) = support::publish_writer_factory();
    let (acceptor, dialer) = loopback(4);
    let info = method_info("/test.Scenarios/Publish", StreamType::ServerStreaming, factory);
    let server = ServerBuilder::new()
        .set_num_completion_queues(1)
        .set_num_event_queues(1)
        .register_handler(info, acceptor)
        .expect("well-formed method name")
        .build();
    server.start().expect("server starts");

    let runtime = tokio::runtime::Handle::current();
    let channel = Channel::new(dialer);
    let read_task = tokio::task::spawn_blocking(move || {
        let mut client = SyncClient::new(channel, StreamType::ServerStreaming, runtime);
        client.stream_write(IntRequest { input: 0 }).expect("write should succeed");
        client.stream_read::<IntResponse>()
    });

    // Wait for the handler to publish its writer, then drive the call from
    // this thread instead of the handler's own event-queue thread.
    let writer = loop {
        if let Some(writer) = slot.lock().unwrap().clone() {
            break writer;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert!(writer.write(Box::new(IntResponse { output: 42 })));
    assert!(writer.finish(async_rpc::Status::ok()));

    let response = read_task.await.unwrap().expect("read should succeed");
    assert_eq!(response, Some(IntResponse { output: 42 }));
}
