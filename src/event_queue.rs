//! Event queue + event-thread pool (spec.md §4.2).
//!
//! Grounded on the teacher's `CommandQueue`
//! (`examples/lunixbochs-nfs-mamont-mirror/src/protocol/rpc/command_queue.rs`):
//! an unbounded channel plus one dedicated consumer that drains it strictly
//! in order. The teacher drains with a `tokio::spawn`ed task because its
//! commands are themselves `async fn`; this framework's closures are plain
//! `FnOnce() + Send` (handler callbacks and state-machine transitions do not
//! need to `.await` anything directly — the operations they kick off are
//! posted to the transport and resumed via the next completion), so the
//! drainer is a dedicated `std::thread` blocking on `recv`, matching
//! spec.md §4.2's requirement that one thread per queue executes serially
//! and that no two event-queue threads ever touch the same RPC.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::debug;

type Closure = Box<dyn FnOnce() + Send>;

enum Item {
    Work(Closure),
    Shutdown,
}

/// One FIFO of closures with exactly one thread draining it.
pub struct EventQueue {
    sender: mpsc::UnboundedSender<Item>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub(crate) fn start(index: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Item>();
        let drainer = std::thread::Builder::new()
            .name(format!("event-queue-{index}"))
            .spawn(move || {
                while let Some(item) = receiver.blocking_recv() {
                    match item {
                        Item::Work(closure) => closure(),
                        Item::Shutdown => break,
                    }
                }
                debug!(queue = index, "event queue drainer exiting");
            })
            .expect("failed to spawn event queue drainer thread");
        Self { sender, drainer: Mutex::new(Some(drainer)) }
    }

    /// Posts a closure to run on this queue's drainer thread. Callable both
    /// by completion-queue drivers (translating a completion into a
    /// transition) and by user handler code re-entering the framework via
    /// `Send`/`Finish` from a foreign thread (spec.md §4.2).
    pub fn post(&self, closure: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Item::Work(Box::new(closure)));
    }

    /// Posts the terminal sentinel and joins the drainer thread once it has
    /// seen it (spec.md §4.2 "Cancellation on shutdown").
    pub(crate) fn shutdown(&self) {
        let _ = self.sender.send(Item::Shutdown);
        if let Some(handle) = self.drainer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// A fixed-size pool of event queues bound to a server (or, for tests, to a
/// standalone handler harness) for its lifetime.
pub struct EventQueuePool {
    queues: Vec<Arc<EventQueue>>,
}

/// Chooses which event queue a new RPC is bound to for its lifetime
/// (spec.md §3 "EventQueue"). The default is round robin; `Service` accepts
/// an override (`EventQueueSelector` in spec.md §4.4/§4.5).
pub type EventQueueSelector = std::sync::Arc<dyn Fn(&EventQueuePool) -> usize + Send + Sync>;

impl EventQueuePool {
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "EventQueuePool requires at least one event queue");
        let queues = (0..n).map(|i| Arc::new(EventQueue::start(i))).collect();
        Self { queues }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn get(&self, index: usize) -> Arc<EventQueue> {
        self.queues[index % self.queues.len()].clone()
    }

    /// The default selector: round robin over the pool, one index per call.
    pub fn round_robin_selector() -> EventQueueSelector {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let counter = std::sync::Arc::new(AtomicUsize::new(0));
        std::sync::Arc::new(move |pool: &EventQueuePool| {
            counter.fetch_add(1, Ordering::Relaxed) % pool.len()
        })
    }

    pub fn shutdown(&self) {
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}
