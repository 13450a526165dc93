//! Server + builder (spec.md §4.5).
//!
//! Grounded on `examples/original_source/async_grpc/service.h`'s shape
//! (a vector of `Service`s driven by a shared completion-queue/event-queue
//! pool) and on the teacher's top-level `Server`
//! (`examples/lunixbochs-nfs-mamont-mirror/src/lib.rs`) for the
//! start/bind/shutdown lifecycle and its use of `tracing` for lifecycle
//! logging.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::completion::CompletionQueuePool;
use crate::context::ExecutionContext;
use crate::descriptor::{parse_method_full_name, MethodInfo};
use crate::event_queue::{EventQueuePool, EventQueueSelector};
use crate::service::Service;
use crate::transport::Acceptor;

/// Opaque marker for server-side transport credentials (spec.md §6
/// "SetServerCredentials(creds) — optional server-side credentials"). The
/// transport layer that would consume these is out of scope; the server
/// only threads the value through so a real transport implementation can
/// retrieve it.
pub trait ServerCredentials: Send + Sync {}

const DEFAULT_NUM_COMPLETION_QUEUES: usize = 2;
const DEFAULT_NUM_EVENT_QUEUES: usize = 4;

/// Builds a [`Server`] (spec.md §4.5 "`Builder` records: bind address,
/// number of completion queues, number of event queues, optional server
/// credentials, optional event-queue selector").
pub struct ServerBuilder {
    address: Option<String>,
    num_completion_queues: usize,
    num_event_queues: usize,
    credentials: Option<Arc<dyn ServerCredentials>>,
    event_queue_selector: Option<EventQueueSelector>,
    execution_context: Option<Arc<ExecutionContext>>,
    send_unfinished_writes: bool,
    registrations: HashMap<String, Vec<(Arc<MethodInfo>, Arc<dyn Acceptor>)>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            address: None,
            num_completion_queues: DEFAULT_NUM_COMPLETION_QUEUES,
            num_event_queues: DEFAULT_NUM_EVENT_QUEUES,
            credentials: None,
            event_queue_selector: None,
            execution_context: None,
            send_unfinished_writes: true,
            registrations: HashMap::new(),
        }
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_server_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Number of completion queues (spec.md §6 "SetNumGrpcThreads(N)").
    pub fn set_num_completion_queues(mut self, n: usize) -> Self {
        assert!(n >= 1, "a server needs at least one completion queue");
        self.num_completion_queues = n;
        self
    }

    /// Number of event queues (spec.md §6 "SetNumEventThreads(M)").
    pub fn set_num_event_queues(mut self, m: usize) -> Self {
        assert!(m >= 1, "a server needs at least one event queue");
        self.num_event_queues = m;
        self
    }

    pub fn set_server_credentials(mut self, credentials: Arc<dyn ServerCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn set_event_queue_selector(mut self, selector: EventQueueSelector) -> Self {
        self.event_queue_selector = Some(selector);
        self
    }

    pub fn set_execution_context<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.execution_context = Some(Arc::new(ExecutionContext::new(value)));
        self
    }

    /// Default-true policy controlling whether writes queued before
    /// `Finish` are drained before finishing, or dropped (spec.md §4.3
    /// "send_unfinished_writes").
    pub fn set_send_unfinished_writes(mut self, send_unfinished_writes: bool) -> Self {
        self.send_unfinished_writes = send_unfinished_writes;
        self
    }

    /// Registers one method's handler factory and its acceptor. There is no
    /// code-generated service-method trait to derive `MethodInfo` from
    /// (spec.md §1 scope), so the caller supplies it directly instead of
    /// via `RegisterHandler<H>()`'s static derivation.
    pub fn register_handler(mut self, method_info: MethodInfo, acceptor: Arc<dyn Acceptor>) -> anyhow::Result<Self> {
        let (service_name, _method_name) = parse_method_full_name(&method_info.fully_qualified_name)?;
        self.registrations.entry(service_name).or_default().push((Arc::new(method_info), acceptor));
        Ok(self)
    }

    pub fn build(self) -> Server {
        let event_queue_selector = self.event_queue_selector.unwrap_or_else(EventQueuePool::round_robin_selector);
        let execution_context = self.execution_context.unwrap_or_else(|| Arc::new(ExecutionContext::new(())));
        let services = self
            .registrations
            .into_iter()
            .map(|(service_name, methods)| Service::new(service_name, methods, event_queue_selector.clone()))
            .collect();
        Server {
            address: self.address,
            num_completion_queues: self.num_completion_queues,
            num_event_queues: self.num_event_queues,
            _credentials: self.credentials,
            execution_context,
            send_unfinished_writes: self.send_unfinished_writes,
            services,
            running: AtomicBool::new(false),
            completion_queue_pool: Mutex::new(None),
            event_queue_pool: Mutex::new(None),
            runtime: Mutex::new(None),
        }
    }
}

/// Top-level server lifecycle (spec.md §4.5). `Start`/`Shutdown` are the
/// only entry points; both are idempotent barriers around the pools and
/// services they own.
pub struct Server {
    address: Option<String>,
    num_completion_queues: usize,
    num_event_queues: usize,
    _credentials: Option<Arc<dyn ServerCredentials>>,
    execution_context: Arc<ExecutionContext>,
    send_unfinished_writes: bool,
    services: Vec<Arc<Service>>,
    running: AtomicBool,
    completion_queue_pool: Mutex<Option<CompletionQueuePool>>,
    event_queue_pool: Mutex<Option<Arc<EventQueuePool>>>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl Server {
    /// Starts completion queues, event queues, and every registered
    /// service's acceptors. Fails if already running (spec.md §7 "Fatal
    /// conditions: ... double-start").
    pub fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("server already started");
        }
        info!(address = ?self.address, "starting server");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|error| anyhow::anyhow!("failed to start transport runtime: {error}"))?;
        let runtime_handle = runtime.handle().clone();

        let completion_queue_pool = CompletionQueuePool::new(self.num_completion_queues);
        let event_queue_pool = Arc::new(EventQueuePool::new(self.num_event_queues));

        for service in &self.services {
            service.start_serving(
                &completion_queue_pool,
                &event_queue_pool,
                &self.execution_context,
                &runtime_handle,
                self.send_unfinished_writes,
            );
        }

        *self.completion_queue_pool.lock().unwrap() = Some(completion_queue_pool);
        *self.event_queue_pool.lock().unwrap() = Some(event_queue_pool);
        *self.runtime.lock().unwrap() = Some(runtime);
        Ok(())
    }

    /// Drains every service, then stops the event-queue pool, the
    /// completion-queue pool, and finally the transport runtime. Returns
    /// only once every in-flight RPC has reached `DONE` (spec.md §8
    /// invariant 6 "Shutdown is a total barrier").
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down server");
        for service in &self.services {
            service.shutdown();
        }
        if let Some(event_queue_pool) = self.event_queue_pool.lock().unwrap().take() {
            event_queue_pool.shutdown();
        }
        if let Some(completion_queue_pool) = self.completion_queue_pool.lock().unwrap().take() {
            completion_queue_pool.shutdown();
        }
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_rpc_count(&self) -> usize {
        self.services.iter().map(|service| service.active_rpc_count()).sum()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
