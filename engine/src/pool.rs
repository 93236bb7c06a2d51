//! A bounded-less priority MPMC queue plus the worker threads draining
//! it.
//!
//! This is deliberately a hand-rolled mutex + condition variable queue
//! rather than a lock-free one: the queue is never the bottleneck here
//! (operator runtimes dominate), and a priority heap with a stable FIFO
//! tie-break is awkward to express lock-free. `std::sync` primitives
//! keep the scheduling logic auditable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use engine_core::{DispatchFn, OpBlock, RunContext, StreamHandle};

struct QueuedOp(Arc<OpBlock>);

impl PartialEq for QueuedOp {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority() == other.0.priority() && self.0.seq() == other.0.seq()
    }
}
impl Eq for QueuedOp {}

impl PartialOrd for QueuedOp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedOp {
    /// `BinaryHeap` is a max-heap: higher priority pops first, and among
    /// equal priorities the lower (earlier) sequence number pops first,
    /// which is why `seq` compares in reverse.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority()
            .cmp(&other.0.priority())
            .then_with(|| other.0.seq().cmp(&self.0.seq()))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<QueuedOp>>,
    ready: Condvar,
    shutdown: Mutex<bool>,
}

/// A named group of worker threads draining one priority queue, each
/// running ready operators pinned to `device`.
pub struct WorkerPool {
    label: String,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `nthreads` workers. Each pops the highest-priority ready
    /// operator (FIFO among ties) and invokes it with a `RunContext`
    /// carrying a per-thread `StreamHandle`, then feeds its completion
    /// back through `dispatch` exactly as a completion token would.
    pub fn spawn(
        label: impl Into<String>,
        nthreads: usize,
        device: engine_core::Device,
        dispatch: DispatchFn,
    ) -> std::io::Result<WorkerPool> {
        let label = label.into();
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            ready: Condvar::new(),
            shutdown: Mutex::new(false),
        });

        let mut workers = Vec::with_capacity(nthreads);
        for worker_idx in 0..nthreads {
            let shared = shared.clone();
            let dispatch = dispatch.clone();
            let thread_label = format!("{}-{}", label, worker_idx);
            let stream = StreamHandle(worker_idx as u64);
            let handle = thread::Builder::new()
                .name(thread_label.clone())
                .spawn(move || worker_loop(shared, dispatch, device, stream, thread_label))?;
            workers.push(handle);
        }

        Ok(WorkerPool { label, workers, shared })
    }

    /// Enqueue a ready operator. Wakes exactly one idle worker.
    pub fn enqueue(&self, op: Arc<OpBlock>) {
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(QueuedOp(op));
        self.shared.ready.notify_one();
    }

    /// How many ready-but-not-yet-picked-up operators are waiting.
    pub fn backlog(&self) -> usize {
        self.shared.heap.lock().unwrap().len()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Signal every worker to exit once its queue is drained, and join
    /// them. Blocks until all workers have returned.
    pub fn shutdown(mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    dispatch: DispatchFn,
    device: engine_core::Device,
    stream: StreamHandle,
    thread_label: String,
) {
    loop {
        let op = {
            let mut heap = shared.heap.lock().unwrap();
            loop {
                if let Some(QueuedOp(op)) = heap.pop() {
                    break Some(op);
                }
                if *shared.shutdown.lock().unwrap() {
                    break None;
                }
                heap = shared.ready.wait(heap).unwrap();
            }
        };
        let op = match op {
            Some(op) => op,
            None => break,
        };

        let ctx = RunContext { device, stream: Some(stream) };
        let op_for_panic = op.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            op.invoke(ctx, dispatch.clone());
        }));
        if let Err(payload) = result {
            let msg = panic_message(&payload);
            log::error!(
                "worker {}: {}",
                thread_label,
                engine_core::ErrorKind::CallableFailure(op_for_panic.id().as_u64(), msg)
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
