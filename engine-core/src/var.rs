//! Versioned variables and their dependency chains.
//!
//! A [`Variable`] is an opaque handle to a logical datum. Internally it
//! owns a **version chain**: the FIFO of not-yet-resolved operator
//! references queued against it. Chain entries are represented as a
//! `VecDeque` rather than a linked list of raw, back-pointer-carrying
//! nodes (see the original threaded engine this is modelled on) — the
//! ordering and promotion rules are identical, but there is nothing to
//! free by hand.
//!
//! At most one write can be "pending" (queued and already dispatched,
//! waiting to run) at a time; it always sits at the front of the queue.
//! Reads queued behind it wait for it to complete. When no write is
//! pending, reads resolve immediately and are never queued at all.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::ErrorKind;
use crate::op::OpBlock;

/// Unique identifier for a [`Variable`], stable for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

struct Node {
    write: bool,
    trigger: Arc<OpBlock>,
}

struct VarState {
    /// Not-yet-resolved chain entries, in submission order. The front
    /// entry, if any, is always a write (the "pending write"); reads
    /// ahead of any pending write resolve in `append_read` and never
    /// enter this queue.
    queue: VecDeque<Node>,
    /// `Some(n)`: `n` readers are currently live (dispatched, not yet
    /// completed). `None`: the write at the front of `queue` has been
    /// dispatched and is running (the `kWriteTriggered` sentinel).
    reader_count: Option<u32>,
    to_delete: bool,
    released: bool,
}

impl VarState {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.reader_count.map_or(true, |c| c == 0)
    }
}

struct VarInner {
    id: VarId,
    state: Mutex<VarState>,
    idle: Condvar,
    live_count: Arc<AtomicUsize>,
}

/// A handle to a logical datum tracked by the engine's dependency graph.
///
/// Cheap to clone (an `Arc` underneath); every clone refers to the same
/// underlying version chain.
#[derive(Clone)]
pub struct Variable(Arc<VarInner>);

impl Variable {
    pub(crate) fn new(live_count: Arc<AtomicUsize>) -> Variable {
        live_count.fetch_add(1, Ordering::Relaxed);
        Variable(Arc::new(VarInner {
            id: VarId(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)),
            state: Mutex::new(VarState {
                queue: VecDeque::new(),
                reader_count: Some(0),
                to_delete: false,
                released: false,
            }),
            idle: Condvar::new(),
            live_count,
        }))
    }

    /// Stable identifier, useful for logging and for deduplicating
    /// variable sets on an operator.
    pub fn id(&self) -> VarId {
        self.0.id
    }

    /// Append `op` as a read dependency. Decrements `op`'s wait counter
    /// immediately if no write is currently pending.
    pub fn append_read(&self, op: &Arc<OpBlock>) {
        let mut state = self.0.state.lock().unwrap();
        if state.released {
            log::error!("{}", ErrorKind::UseAfterDelete("variable", self.0.id.0));
            std::process::abort();
        }
        if state.queue.is_empty() {
            state.reader_count = Some(state.reader_count.unwrap_or(0) + 1);
            drop(state);
            op.decr_wait();
        } else {
            state.queue.push_back(Node { write: false, trigger: op.clone() });
        }
    }

    /// Append `op` as a write dependency. Decrements `op`'s wait counter
    /// immediately only if the chain was empty and no reads are live.
    pub fn append_write(&self, op: &Arc<OpBlock>) {
        let mut state = self.0.state.lock().unwrap();
        if state.released {
            log::error!("{}", ErrorKind::UseAfterDelete("variable", self.0.id.0));
            std::process::abort();
        }
        let becomes_pending = state.queue.is_empty() && state.reader_count.map_or(true, |c| c == 0);
        state.queue.push_back(Node { write: true, trigger: op.clone() });
        if becomes_pending {
            state.reader_count = None;
            drop(state);
            op.decr_wait();
        }
    }

    /// Signal that one outstanding read has finished. If it was the last
    /// live reader and a write is queued behind it, promotes that write
    /// to pending and dispatches it.
    pub fn complete_read(&self, dispatch: &dyn Fn(Arc<OpBlock>)) {
        let mut state = self.0.state.lock().unwrap();
        let count = state.reader_count.expect("complete_read with no pending reads").checked_sub(1)
            .expect("complete_read underflowed reader count");
        state.reader_count = Some(count);
        let mut to_trigger = None;
        if count == 0 {
            if let Some(front) = state.queue.front() {
                debug_assert!(front.write, "non-write node at front with zero pending reads");
                state.reader_count = None;
                to_trigger = Some(front.trigger.clone());
            }
        }
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.0.idle.notify_all();
        }
        if let Some(trigger) = to_trigger {
            if trigger.decr_wait() == 0 {
                dispatch(trigger);
            }
        }
    }

    /// Signal that the pending write has finished. Walks the chain
    /// forward, dispatching every contiguous read that follows, and
    /// promotes (and dispatches) the next write if there are none.
    /// Returns `true` if the variable's storage should now be released.
    pub fn complete_write(&self, dispatch: &dyn Fn(Arc<OpBlock>)) -> bool {
        let mut state = self.0.state.lock().unwrap();
        let front = state.queue.pop_front();
        debug_assert!(front.map_or(false, |n| n.write), "complete_write with no pending write");

        if state.to_delete && state.queue.is_empty() {
            state.released = true;
            drop(state);
            self.0.live_count.fetch_sub(1, Ordering::Relaxed);
            self.0.idle.notify_all();
            return true;
        }

        let mut ready_reads = Vec::new();
        let mut live_reads = 0u32;
        while let Some(n) = state.queue.front() {
            if n.write {
                break;
            }
            live_reads += 1;
            ready_reads.push(state.queue.pop_front().unwrap().trigger);
        }
        state.reader_count = Some(live_reads);

        let mut write_to_trigger = None;
        if live_reads == 0 {
            if let Some(front) = state.queue.front() {
                debug_assert!(front.write);
                state.reader_count = None;
                write_to_trigger = Some(front.trigger.clone());
            }
        }
        let idle = state.is_idle();
        drop(state);
        if idle {
            self.0.idle.notify_all();
        }

        for trigger in ready_reads {
            if trigger.decr_wait() == 0 {
                dispatch(trigger);
            }
        }
        if let Some(trigger) = write_to_trigger {
            if trigger.decr_wait() == 0 {
                dispatch(trigger);
            }
        }
        false
    }

    /// Mark this variable for deletion. If the chain is already drained
    /// the release happens synchronously; otherwise it happens the
    /// moment the last queued operator completes.
    pub fn delete(&self) {
        let mut state = self.0.state.lock().unwrap();
        if state.to_delete {
            log::error!("{}", ErrorKind::DoubleDelete("variable", self.0.id.0));
            std::process::abort();
        }
        state.to_delete = true;
        if state.is_idle() && !state.released {
            state.released = true;
            drop(state);
            self.0.live_count.fetch_sub(1, Ordering::Relaxed);
            self.0.idle.notify_all();
        }
    }

    /// Block the calling thread until this variable has no operators
    /// queued against it. Returns immediately if already idle,
    /// including when called twice back-to-back.
    pub fn wait_until_idle(&self) {
        let mut state = self.0.state.lock().unwrap();
        while !state.is_idle() {
            state = self.0.idle.wait(state).unwrap();
        }
    }

    /// Whether this variable's storage has already been released.
    pub fn is_released(&self) -> bool {
        self.0.state.lock().unwrap().released
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Variable({})", self.0.id)
    }
}

/// Tracks every live [`Variable`] so the engine can answer "is the table
/// empty" at teardown.
#[derive(Clone)]
pub struct VariableRegistry {
    live_count: Arc<AtomicUsize>,
}

impl VariableRegistry {
    pub fn new() -> VariableRegistry {
        VariableRegistry { live_count: Arc::new(AtomicUsize::new(0)) }
    }

    /// Allocate a fresh variable with an empty chain.
    pub fn new_variable(&self) -> Variable {
        Variable::new(self.live_count.clone())
    }

    /// Number of variables that have not yet been released.
    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Relaxed)
    }
}

impl Default for VariableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{DispatchFn, Operator, OpBlock};
    use crate::device::Device;
    use crate::property::FnProperty;
    use std::sync::Mutex as StdMutex;

    fn noop_operator(reads: Vec<Variable>, writes: Vec<Variable>) -> Arc<Operator> {
        Operator::new_ephemeral(reads, writes, FnProperty::Normal, Box::new(|_ctx, token| {
            token.complete();
        }))
    }

    fn push_block(op: Arc<Operator>, dispatch: &DispatchFn) -> Arc<OpBlock> {
        let block = OpBlock::new(op, Device::Cpu, 0);
        crate::dispatch::push(block.clone(), dispatch);
        block
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn raw_hazard_orders_read_after_write() {
        init_logging();
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let ready = Arc::new(StdMutex::new(Vec::new()));

        let dispatch: DispatchFn = {
            let ready = ready.clone();
            Arc::new(move |op: Arc<OpBlock>| ready.lock().unwrap().push(op))
        };

        let w = noop_operator(vec![], vec![v.clone()]);
        let w_block = push_block(w, &dispatch);
        let r = noop_operator(vec![v.clone()], vec![]);
        let r_block = push_block(r, &dispatch);

        // write became ready immediately (nothing was queued ahead of it)
        assert_eq!(ready.lock().unwrap().len(), 1);
        order.lock().unwrap().push("write-dispatched");
        crate::dispatch::complete(&w_block, &dispatch);
        order.lock().unwrap().push("write-complete");
        // now the read should have become ready
        assert_eq!(ready.lock().unwrap().len(), 2);
        crate::dispatch::complete(&r_block, &dispatch);

        assert_eq!(*order.lock().unwrap(), vec!["write-dispatched", "write-complete"]);
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn war_hazard_orders_write_after_read() {
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        let dispatched = Arc::new(StdMutex::new(Vec::new()));
        let dispatch: DispatchFn = {
            let dispatched = dispatched.clone();
            Arc::new(move |op: Arc<OpBlock>| dispatched.lock().unwrap().push(op))
        };

        let r = noop_operator(vec![v.clone()], vec![]);
        let r_block = push_block(r, &dispatch);
        let w = noop_operator(vec![], vec![v.clone()]);
        let w_block = push_block(w, &dispatch);

        // only the read is ready; the write must wait
        assert_eq!(dispatched.lock().unwrap().len(), 1);
        crate::dispatch::complete(&r_block, &dispatch);
        assert_eq!(dispatched.lock().unwrap().len(), 2);
        crate::dispatch::complete(&w_block, &dispatch);
        assert_eq!(reg.live_count(), 1);
    }

    #[test]
    fn delete_after_write_releases_on_completion() {
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        let dispatch: DispatchFn = Arc::new(|_op: Arc<OpBlock>| {});

        let w = noop_operator(vec![], vec![v.clone()]);
        let w_block = push_block(w, &dispatch);
        v.delete();
        assert!(!v.is_released());
        crate::dispatch::complete(&w_block, &dispatch);
        assert!(v.is_released());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn delete_with_no_pending_ops_is_synchronous() {
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        assert_eq!(reg.live_count(), 1);
        v.delete();
        assert!(v.is_released());
        assert_eq!(reg.live_count(), 0);
    }

    #[test]
    fn double_wait_returns_immediately() {
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        v.wait_until_idle();
        v.wait_until_idle();
    }
}
