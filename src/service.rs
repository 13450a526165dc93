//! Service dispatcher (spec.md §4.4).
//!
//! Grounded on `examples/original_source/async_grpc/service.h`: a per-service
//! method registry plus an `ActiveRpcs` set, creating one acceptor RPC per
//! `(method, completion queue)` pair and keeping exactly one armed at all
//! times by re-arming a sibling immediately on every accepted connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::completion::{Completion, CompletionQueue, CompletionQueuePool};
use crate::context::ExecutionContext;
use crate::descriptor::MethodInfo;
use crate::event_queue::{EventQueue, EventQueuePool, EventQueueSelector};
use crate::rpc::{ActiveRpcs, Rpc};
use crate::transport::{Acceptor, ServerTransport};

struct MethodRegistration {
    method_info: Arc<MethodInfo>,
    acceptor: Arc<dyn Acceptor>,
}

/// A named group of methods sharing one `ActiveRpcs` set and one event-queue
/// selection policy (spec.md §4.4 "Service(service_name, method_map,
/// event_queue_selector)").
pub struct Service {
    #[allow(dead_code)]
    service_name: String,
    methods: HashMap<String, MethodRegistration>,
    event_queue_selector: EventQueueSelector,
    active_rpcs: Arc<ActiveRpcs>,
    shutting_down: AtomicBool,
}

impl Service {
    pub fn new(
        service_name: impl Into<String>,
        methods: Vec<(Arc<MethodInfo>, Arc<dyn Acceptor>)>,
        event_queue_selector: EventQueueSelector,
    ) -> Arc<Self> {
        let methods = methods
            .into_iter()
            .map(|(method_info, acceptor)| {
                let short_name = method_info.fully_qualified_name.rsplit('/').next().unwrap_or("").to_string();
                (short_name, MethodRegistration { method_info, acceptor })
            })
            .collect();
        Arc::new(Self {
            service_name: service_name.into(),
            methods,
            event_queue_selector,
            active_rpcs: Arc::new(ActiveRpcs::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn active_rpc_count(&self) -> usize {
        self.active_rpcs.len()
    }

    /// Arms one acceptor per `(method, completion queue)` pair (spec.md §4.4
    /// "there is always exactly one armed Rpc per method per completion
    /// queue waiting for incoming calls").
    pub(crate) fn start_serving(
        self: &Arc<Self>,
        completion_queue_pool: &CompletionQueuePool,
        event_queue_pool: &Arc<EventQueuePool>,
        execution_context: &Arc<ExecutionContext>,
        runtime: &tokio::runtime::Handle,
        send_unfinished_writes: bool,
    ) {
        for method_name in self.methods.keys().cloned().collect::<Vec<_>>() {
            for _ in 0..completion_queue_pool.len() {
                let completion_queue = completion_queue_pool.next_queue();
                self.clone().arm_accept(
                    method_name.clone(),
                    completion_queue,
                    event_queue_pool.clone(),
                    execution_context.clone(),
                    runtime.clone(),
                    send_unfinished_writes,
                );
            }
        }
    }

    fn arm_accept(
        self: Arc<Self>,
        method_name: String,
        completion_queue: Arc<CompletionQueue>,
        event_queue_pool: Arc<EventQueuePool>,
        execution_context: Arc<ExecutionContext>,
        runtime: tokio::runtime::Handle,
        send_unfinished_writes: bool,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let acceptor = self.methods[&method_name].acceptor.clone();
        let runtime_for_spawn = runtime.clone();
        runtime_for_spawn.spawn(async move {
            let result = acceptor.accept().await;
            let (ok, transport) = match result {
                Ok(transport) => (true, Some(transport)),
                Err(error) => {
                    warn!(%error, method = %method_name, "acceptor failed");
                    (false, None)
                }
            };
            completion_queue.post(
                Box::new(NewConnectionCompletion {
                    service: self,
                    method_name,
                    transport,
                    completion_queue: completion_queue.clone(),
                    event_queue_pool,
                    execution_context,
                    runtime,
                    send_unfinished_writes,
                }),
                ok,
            );
        });
    }

    fn spawn_rpc(
        self: &Arc<Self>,
        method_name: &str,
        transport: Box<dyn ServerTransport>,
        completion_queue: Arc<CompletionQueue>,
        event_queue: Arc<EventQueue>,
        execution_context: Arc<ExecutionContext>,
        runtime: tokio::runtime::Handle,
        send_unfinished_writes: bool,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let method_info = self.methods[method_name].method_info.clone();
        let id = Rpc::next_id();
        let handler = (method_info.handler_factory)();
        let active_rpcs = self.active_rpcs.clone();
        let on_done: Arc<dyn Fn(u64) + Send + Sync> = Arc::new(move |id| active_rpcs.remove(id));
        let rpc = Rpc::new(
            id,
            method_info,
            execution_context,
            transport,
            completion_queue,
            event_queue,
            runtime,
            send_unfinished_writes,
            handler,
            on_done,
        );
        self.active_rpcs.insert(rpc.clone());
        rpc.start();
    }

    /// Stops registering new RPCs and blocks until every in-flight RPC has
    /// reached `DONE` (spec.md §4.4 "the server never destroys state while
    /// an RPC is still pending").
    pub(crate) fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.active_rpcs.wait_until_empty();
        debug!(service = %self.service_name, "service drained");
    }
}

struct NewConnectionCompletion {
    service: Arc<Service>,
    method_name: String,
    transport: Option<Box<dyn ServerTransport>>,
    completion_queue: Arc<CompletionQueue>,
    event_queue_pool: Arc<EventQueuePool>,
    execution_context: Arc<ExecutionContext>,
    runtime: tokio::runtime::Handle,
    send_unfinished_writes: bool,
}

impl Completion for NewConnectionCompletion {
    /// On `NEW_CONNECTION` (spec.md §4.3). Re-arms the acceptor immediately
    /// (the acceptor is always armed) and hands the accepted call to an
    /// event queue, which constructs the handler and starts the RPC.
    fn complete(self: Box<Self>, ok: bool) {
        let NewConnectionCompletion {
            service,
            method_name,
            transport,
            completion_queue,
            event_queue_pool,
            execution_context,
            runtime,
            send_unfinished_writes,
        } = *self;

        if !ok {
            debug!(method = %method_name, "acceptor closed; no longer accepting new connections");
            return;
        }

        service.clone().arm_accept(
            method_name.clone(),
            completion_queue.clone(),
            event_queue_pool.clone(),
            execution_context.clone(),
            runtime.clone(),
            send_unfinished_writes,
        );

        let transport = transport.expect("a successful accept always carries a transport");
        let spawn_service = service.clone();
        let spawn_runtime = runtime.clone();
        // Choosing the event queue and constructing the handler both run on
        // the event-queue thread, never on this completion-queue driver.
        let chosen_index = (service.event_queue_selector)(&event_queue_pool);
        let chosen_queue = event_queue_pool.get(chosen_index);
        let event_queue_for_rpc = chosen_queue.clone();
        chosen_queue.post(move || {
            spawn_service.spawn_rpc(
                &method_name,
                transport,
                completion_queue,
                event_queue_for_rpc,
                execution_context,
                spawn_runtime,
                send_unfinished_writes,
            );
        });
    }
}
