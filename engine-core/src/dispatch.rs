//! The push/complete pipeline tying operators to variable version chains.
//!
//! Everything here is plain data-flow: no thread is spawned, no pool is
//! touched. The `engine` crate supplies the `DispatchFn` (an enqueue
//! callback into its worker pools) and calls `push`/`complete` from the
//! call sites where those events actually happen (the public push
//! surface, and the worker loop after a callable returns or its
//! completion token fires).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::op::{DispatchFn, OpBlock};

/// Submit a freshly constructed block: append it to each of its
/// variables' version chains, then dispatch it if that left its wait
/// counter at zero.
///
/// Caller contract: `op` must not have been pushed before (each
/// `OpBlock` is single-use; a registered `Operator` gets a new one per
/// invocation).
pub fn push(op: Arc<OpBlock>, dispatch: &DispatchFn) {
    for v in op.mutable_vars() {
        v.append_write(&op);
    }
    for v in op.const_vars() {
        v.append_read(&op);
    }
    if op.decr_wait() == 0 {
        dispatch(op);
    }
}

/// Propagate a finished invocation back to its variables, potentially
/// dispatching whatever was queued behind it, and release the
/// invocation slot on its parent operator.
pub fn complete(op: &Arc<OpBlock>, dispatch: &DispatchFn) {
    for v in op.mutable_vars() {
        v.complete_write(&|ready| dispatch(ready));
    }
    for v in op.const_vars() {
        v.complete_read(&|ready| dispatch(ready));
    }
    op.finish_invocation();
}

/// Counts operators pushed but not yet completed, so `wait_for_all` can
/// block without needing to enumerate every live variable.
#[derive(Clone)]
pub struct Tracker {
    outstanding: Arc<AtomicUsize>,
    gate: Arc<(Mutex<()>, Condvar)>,
}

impl Tracker {
    pub fn new() -> Tracker {
        Tracker {
            outstanding: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub fn on_push(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_complete(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.gate.0.lock().unwrap();
            self.gate.1.notify_all();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Block until no operators are outstanding.
    pub fn wait_for_all(&self) {
        let mut guard = self.gate.0.lock().unwrap();
        while self.outstanding.load(Ordering::Acquire) != 0 {
            guard = self.gate.1.wait(guard).unwrap();
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
