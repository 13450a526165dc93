//! The transport boundary (spec.md §1 "Deliberately out of scope: ... the
//! byte-level framing of the underlying transport").
//!
//! The framework assumes messages are opaque, typed payloads (spec.md §1);
//! it never serializes them itself. `BoxMessage` is the type-erased carrier
//! (checked against a [`crate::descriptor::MessageDescriptor`] at the
//! boundary, spec.md §4.6/§9 "Dynamic dispatch"), and [`ServerTransport`] /
//! [`ClientTransport`] are the pluggable interfaces a real wire protocol
//! would implement. The server side is split into a read half and a write
//! half (spec.md §4.3 BIDI_STREAM: `(READ ∥ WRITE)*`, reads and writes must
//! be able to progress concurrently), the same shape as `tokio::io::split`.
//! This crate ships one concrete, complete transport: an in-process
//! loopback built on `tokio::sync::{mpsc, oneshot}`, grounded on the
//! teacher's use of `tokio::io::duplex` to connect a socket-facing task to
//! its command queue
//! (`examples/lunixbochs-nfs-mamont-mirror/src/protocol/rpc/wire.rs`).

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::status::Status;

pub type BoxMessage = Box<dyn Any + Send>;

/// The read half of one accepted call.
#[async_trait]
pub trait ServerTransportReader: Send {
    /// Waits for the next request message. `Ok(None)` means the client
    /// half-closed (spec.md §4.3 "READ(ok=false)").
    async fn read(&mut self) -> std::io::Result<Option<BoxMessage>>;
}

/// The write half of one accepted call.
#[async_trait]
pub trait ServerTransportWriter: Send {
    /// Writes one response message.
    async fn write(&mut self, message: BoxMessage) -> std::io::Result<()>;
    /// Sends the terminal status. Idempotent: a second call is a no-op.
    async fn finish(&mut self, status: Status) -> std::io::Result<()>;
}

/// One accepted call, before it is split into independently-drivable halves.
pub trait ServerTransport: Send {
    fn split(self: Box<Self>) -> (Box<dyn ServerTransportReader>, Box<dyn ServerTransportWriter>);
}

/// Produces one fresh [`ServerTransport`] per incoming call for one method.
/// The service keeps exactly one `accept` in flight per method per
/// completion queue at all times (spec.md §4.4 "acceptor pattern").
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> std::io::Result<Box<dyn ServerTransport>>;
}

/// The client's view of one call.
#[async_trait]
pub trait ClientTransport: Send {
    async fn write(&mut self, message: BoxMessage) -> std::io::Result<()>;
    async fn read(&mut self) -> std::io::Result<Option<BoxMessage>>;
    /// Half-closes the client's write side.
    async fn writes_done(&mut self) -> std::io::Result<()>;
    /// Waits for the server's terminal status.
    async fn finish(&mut self) -> std::io::Result<Status>;
}

/// Opens a new [`ClientTransport`] for one call to a fixed method, the
/// client-side analogue of [`Acceptor`]. A `Channel` (spec.md §6) wraps one
/// of these per destination.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> std::io::Result<Box<dyn ClientTransport>>;
}

/// Builds a connected in-process acceptor/dialer pair. Every `dial()` call
/// creates a fresh duplex pair and hands the server half to the next
/// `accept()` in FIFO order, modeling one TCP accept per RPC without any
/// byte-level framing.
pub fn loopback(buffer: usize) -> (Arc<LoopbackAcceptor>, Arc<LoopbackDialer>) {
    let (connection_tx, connection_rx) = mpsc::channel(buffer);
    let acceptor = Arc::new(LoopbackAcceptor { incoming: tokio::sync::Mutex::new(connection_rx) });
    let dialer = Arc::new(LoopbackDialer { connection_tx, buffer });
    (acceptor, dialer)
}

pub struct LoopbackAcceptor {
    incoming: tokio::sync::Mutex<mpsc::Receiver<Box<dyn ServerTransport>>>,
}

#[async_trait]
impl Acceptor for LoopbackAcceptor {
    async fn accept(&self) -> std::io::Result<Box<dyn ServerTransport>> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "acceptor closed"))
    }
}

pub struct LoopbackDialer {
    connection_tx: mpsc::Sender<Box<dyn ServerTransport>>,
    buffer: usize,
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self) -> std::io::Result<Box<dyn ClientTransport>> {
        let (request_tx, request_rx) = mpsc::channel::<BoxMessage>(self.buffer);
        let (response_tx, response_rx) = mpsc::channel::<BoxMessage>(self.buffer);
        let (finish_tx, finish_rx) = oneshot::channel::<Status>();

        let server_side = LoopbackServerTransport {
            reader: LoopbackServerReader { request_rx },
            writer: LoopbackServerWriter { response_tx, finish_tx: Some(finish_tx) },
        };
        self.connection_tx
            .send(Box::new(server_side))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no acceptor listening"))?;

        Ok(Box::new(LoopbackClientTransport {
            request_tx: Some(request_tx),
            response_rx,
            finish_rx: Some(finish_rx),
            cached_status: None,
        }))
    }
}

struct LoopbackServerReader {
    request_rx: mpsc::Receiver<BoxMessage>,
}

#[async_trait]
impl ServerTransportReader for LoopbackServerReader {
    async fn read(&mut self) -> std::io::Result<Option<BoxMessage>> {
        Ok(self.request_rx.recv().await)
    }
}

struct LoopbackServerWriter {
    response_tx: mpsc::Sender<BoxMessage>,
    finish_tx: Option<oneshot::Sender<Status>>,
}

#[async_trait]
impl ServerTransportWriter for LoopbackServerWriter {
    async fn write(&mut self, message: BoxMessage) -> std::io::Result<()> {
        self.response_tx
            .send(message)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "client gone"))
    }

    async fn finish(&mut self, status: Status) -> std::io::Result<()> {
        if let Some(tx) = self.finish_tx.take() {
            // The client may already have dropped its receiver; that is not
            // a transport failure from the server's point of view.
            let _ = tx.send(status);
        }
        Ok(())
    }
}

struct LoopbackServerTransport {
    reader: LoopbackServerReader,
    writer: LoopbackServerWriter,
}

impl ServerTransport for LoopbackServerTransport {
    fn split(self: Box<Self>) -> (Box<dyn ServerTransportReader>, Box<dyn ServerTransportWriter>) {
        (Box::new(self.reader), Box::new(self.writer))
    }
}

struct LoopbackClientTransport {
    request_tx: Option<mpsc::Sender<BoxMessage>>,
    response_rx: mpsc::Receiver<BoxMessage>,
    finish_rx: Option<oneshot::Receiver<Status>>,
    cached_status: Option<Status>,
}

#[async_trait]
impl ClientTransport for LoopbackClientTransport {
    async fn write(&mut self, message: BoxMessage) -> std::io::Result<()> {
        match &self.request_tx {
            Some(tx) => tx
                .send(message)
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "server gone")),
            None => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writes already closed")),
        }
    }

    async fn read(&mut self) -> std::io::Result<Option<BoxMessage>> {
        Ok(self.response_rx.recv().await)
    }

    async fn writes_done(&mut self) -> std::io::Result<()> {
        self.request_tx = None;
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<Status> {
        if let Some(status) = &self.cached_status {
            return Ok(status.clone());
        }
        let status = match self.finish_rx.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| Status::internal("server dropped without finishing")),
            None => Status::internal("finish already observed"),
        };
        self.cached_status = Some(status.clone());
        Ok(status)
    }
}
