//! The completion-queue driver pool (spec.md §4.1).
//!
//! Grounded on the teacher's `SocketMessageHandler` read loop
//! (`examples/lunixbochs-nfs-mamont-mirror/src/protocol/rpc/wire.rs`), which
//! spawns one task per connection to pump bytes and feed a queue — the same
//! shape, scaled here to a small fixed pool of dedicated OS threads rather
//! than one task per connection, because the spec requires `Next()` to block
//! a *hot*, never-user-code thread (spec.md §5).
//!
//! `grpc::CompletionQueue::Next(&tag, &ok)` has no single Rust analogue:
//! nothing in std blocks a thread on "the next of N async I/O completions"
//! without an executor. This framework reproduces the contract with a
//! `tokio::sync::mpsc` channel fed by async I/O tasks and drained with
//! `blocking_recv` on a dedicated `std::thread` — the channel supplies the
//! "typed completion queue", the thread supplies the "driver thread that
//! must not run user code".

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Anything that can arrive as a completion-queue tag. `complete` is called
/// on the driver thread with the transport's `ok` flag and must do only
/// O(1) work: decode, look up the RPC, and post a closure to an event queue
/// (spec.md §4.1 "Contract").
pub trait Completion: Send {
    fn complete(self: Box<Self>, ok: bool);
}

type Tagged = (Box<dyn Completion>, bool);

/// One transport completion queue plus its dedicated driver thread.
pub struct CompletionQueue {
    sender: mpsc::UnboundedSender<Tagged>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionQueue {
    fn start(index: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Tagged>();
        let driver = std::thread::Builder::new()
            .name(format!("completion-queue-{index}"))
            .spawn(move || {
                // `blocking_recv` is this framework's `Next(&tag, &ok)`: it
                // blocks the thread and returns `None` once every sender
                // (every in-flight async op) has dropped, i.e. on shutdown.
                while let Some((completion, ok)) = receiver.blocking_recv() {
                    completion.complete(ok);
                }
                debug!(queue = index, "completion queue driver exiting");
            })
            .expect("failed to spawn completion queue driver thread");
        Self { sender, driver: Mutex::new(Some(driver)) }
    }

    /// Posts a completion to this queue. Called from the async I/O task that
    /// observed the transport event, never from a driver thread itself.
    pub fn post(&self, completion: Box<dyn Completion>, ok: bool) {
        // A send error means the queue has been shut down; the event is
        // simply dropped, matching `DONE` already having fired for the RPC.
        let _ = self.sender.send((completion, ok));
    }

    /// Shuts the queue down: closes the channel so the driver thread's
    /// `blocking_recv` returns `None` and drains, then joins it.
    pub(crate) fn shutdown(&self) {
        if let Some(handle) = self.driver.lock().unwrap().take() {
            // Dropping the owned sender clone that `start` created above is
            // not enough on its own if other senders still exist; callers
            // drop the queue itself (see `CompletionQueuePool::shutdown`)
            // before joining.
            let _ = handle.join();
        }
    }
}

/// A fixed-size pool of completion queues, striping work across them by
/// round robin (spec.md §4.1 "Selecting which completion queue").
pub struct CompletionQueuePool {
    queues: Vec<Arc<CompletionQueue>>,
    next: AtomicUsize,
}

impl CompletionQueuePool {
    /// Creates and starts `n` completion queues. `n` must be at least 1.
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "CompletionQueuePool requires at least one completion queue");
        let queues = (0..n).map(|i| Arc::new(CompletionQueue::start(i))).collect();
        Self { queues, next: AtomicUsize::new(0) }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Returns the next completion queue in round-robin order. The caller is
    /// expected to fix this choice for the lifetime of the RPC/async client
    /// it is selecting for (spec.md §4.1).
    pub fn next_queue(&self) -> Arc<CompletionQueue> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[i].clone()
    }

    pub fn shutdown(&self) {
        info!("shutting down completion queue pool");
        for queue in &self.queues {
            queue.shutdown();
        }
    }
}

/// Process-wide, lazily initialized completion-queue pool for the
/// asynchronous client (spec.md §4.1 "servers create their own pool bound to
/// the server lifetime" / clients share a singleton; see also spec.md §9
/// "Global singletons").
pub struct GlobalCompletionQueuePool;

enum GlobalState {
    Uninitialized { number_completion_queues: usize },
    Initialized(CompletionQueuePool),
}

fn global_state() -> &'static Mutex<GlobalState> {
    static STATE: OnceLock<Mutex<GlobalState>> = OnceLock::new();
    STATE.get_or_init(|| {
        Mutex::new(GlobalState::Uninitialized { number_completion_queues: DEFAULT_NUMBER_COMPLETION_QUEUES })
    })
}

const DEFAULT_NUMBER_COMPLETION_QUEUES: usize = 2;

impl GlobalCompletionQueuePool {
    /// Sets the size of the lazily-initialized global pool. Fails (testable
    /// property #5) if the pool has already been initialized by a prior call
    /// to [`Self::next_queue`].
    pub fn set_number_completion_queues(n: usize) -> anyhow::Result<()> {
        assert!(n >= 1, "number of completion queues must be at least 1");
        let mut state = global_state().lock().unwrap();
        match &*state {
            GlobalState::Initialized(_) => {
                anyhow::bail!("can't change number of completion queues after initialization")
            }
            GlobalState::Uninitialized { .. } => {
                *state = GlobalState::Uninitialized { number_completion_queues: n };
                Ok(())
            }
        }
    }

    /// Returns a completion queue from the global pool, initializing it on
    /// first use with whatever size was last configured via
    /// [`Self::set_number_completion_queues`].
    pub fn next_queue() -> Arc<CompletionQueue> {
        let mut state = global_state().lock().unwrap();
        if let GlobalState::Uninitialized { number_completion_queues } = &*state {
            let pool = CompletionQueuePool::new(*number_completion_queues);
            *state = GlobalState::Initialized(pool);
        }
        match &*state {
            GlobalState::Initialized(pool) => pool.next_queue(),
            GlobalState::Uninitialized { .. } => unreachable!("just initialized above"),
        }
    }
}
