//! Operators: the callable work items the engine schedules.
//!
//! Two layers mirror the split between a registered function and each
//! time it runs:
//!
//! - [`Operator`] is the persistent record created by `new_operator` (or,
//!   for a one-shot `push`, an anonymous one created on the fly): the
//!   callable itself plus its fixed read/write variable sets.
//! - [`OpBlock`] is a single invocation of an `Operator` — the thing
//!   actually threaded through the version chains, with its own wait
//!   counter, device and priority. A registered operator gets a fresh
//!   `OpBlock` every time it is pushed; an ephemeral one gets exactly one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{Device, Priority};
use crate::property::FnProperty;
use crate::var::Variable;

/// Stable identifier for a registered [`Operator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperatorId(u64);

impl std::fmt::Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for a single [`OpBlock`] (one invocation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpBlockId(u64);

impl std::fmt::Display for OpBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl OpBlockId {
    /// Raw numeric value, for constructing `ErrorKind` variants (e.g.
    /// `CallableFailure`) from outside this crate.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// What a worker hands a callable so it can see where it is running.
#[derive(Clone, Copy, Debug)]
pub struct RunContext {
    pub device: Device,
    pub stream: Option<StreamHandle>,
}

/// Opaque identity for a device stream/lane a worker thread owns.
/// Carries no GPU binding itself; the pool that created it is
/// responsible for associating it with a real stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// A callable queued against an operator. Boxed as `FnMut` since a
/// registered operator may be invoked more than once.
pub type Callable = Box<dyn FnMut(RunContext, CompletionToken) + Send>;

/// Callback used to hand a now-ready `OpBlock` back to the dispatch
/// core for enqueueing. Always `Fn`, never `FnMut`: enqueueing is
/// inherently shareable (the pool registry does its own locking), and
/// this needs to be cloned cheaply into completion tokens.
pub type DispatchFn = Arc<dyn Fn(Arc<OpBlock>) + Send + Sync>;

struct CompletionInner {
    op: Arc<OpBlock>,
    dispatch: DispatchFn,
}

/// Handed to a callable so it can signal "I'm done".
///
/// Consuming `complete()` by value means a callable that has called it
/// once cannot call it again by construction. If the token is instead
/// simply dropped — the callable returned without firing it and without
/// stashing it anywhere that will — that is treated as the async
/// contract being violated: a leak is logged and completion still fires
/// so waiters don't deadlock, but the violation is visible immediately
/// rather than only at some later teardown scan.
pub struct CompletionToken {
    inner: Option<CompletionInner>,
}

impl CompletionToken {
    pub(crate) fn new(op: Arc<OpBlock>, dispatch: DispatchFn) -> CompletionToken {
        CompletionToken { inner: Some(CompletionInner { op, dispatch }) }
    }

    /// Signal that the operator's callable has finished running.
    pub fn complete(mut self) {
        if let Some(inner) = self.inner.take() {
            crate::dispatch::complete(&inner.op, &inner.dispatch);
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            log::error!("{}", crate::error::ErrorKind::CompletionLeak(inner.op.id.0));
            crate::dispatch::complete(&inner.op, &inner.dispatch);
        }
    }
}

/// A registered operator: a callable plus the fixed variable sets it
/// reads from and writes to. Created once via `new_operator` and pushed
/// (as many times as needed) via `push_operator`; or created anonymously
/// for a single `push`.
pub struct Operator {
    id: OperatorId,
    const_vars: Vec<Variable>,
    mutable_vars: Vec<Variable>,
    property: FnProperty,
    callable: Mutex<Option<Callable>>,
    registered: bool,
    delete_pending: AtomicBool,
    pending_invocations: AtomicUsize,
    /// Set by `OperatorRegistry::register` for registered operators only.
    /// Taken (exactly once) by whichever of `delete`/`end_invocation`
    /// first observes "delete pending and idle", so the registry entry
    /// is released the instant that becomes true regardless of which
    /// side won the race.
    registry_hook: Mutex<Option<OperatorRegistry>>,
}

impl Operator {
    fn build(
        mut const_vars: Vec<Variable>,
        mut mutable_vars: Vec<Variable>,
        property: FnProperty,
        callable: Callable,
        registered: bool,
    ) -> Arc<Operator> {
        // Write-wins: a variable named in both sets is only ever a
        // dependency once, as a write.
        let write_ids: HashSet<_> = mutable_vars.iter().map(Variable::id).collect();
        const_vars.retain(|v| !write_ids.contains(&v.id()));
        let mut seen = HashSet::with_capacity(mutable_vars.len());
        mutable_vars.retain(|v| seen.insert(v.id()));
        let mut seen = HashSet::with_capacity(const_vars.len());
        const_vars.retain(|v| seen.insert(v.id()));

        Arc::new(Operator {
            id: OperatorId(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed)),
            const_vars,
            mutable_vars,
            property,
            callable: Mutex::new(Some(callable)),
            registered,
            delete_pending: AtomicBool::new(false),
            pending_invocations: AtomicUsize::new(0),
            registry_hook: Mutex::new(None),
        })
    }

    /// Create a registered operator (`new_operator`), reusable across
    /// many `push_operator` calls.
    pub fn new_registered(
        const_vars: Vec<Variable>,
        mutable_vars: Vec<Variable>,
        property: FnProperty,
        callable: Callable,
    ) -> Arc<Operator> {
        Self::build(const_vars, mutable_vars, property, callable, true)
    }

    /// Create a throwaway operator for a single `push`. Not tracked by
    /// any registry; it is dropped once its one invocation completes.
    pub fn new_ephemeral(
        const_vars: Vec<Variable>,
        mutable_vars: Vec<Variable>,
        property: FnProperty,
        callable: Callable,
    ) -> Arc<Operator> {
        Self::build(const_vars, mutable_vars, property, callable, false)
    }

    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn const_vars(&self) -> &[Variable] {
        &self.const_vars
    }

    pub fn mutable_vars(&self) -> &[Variable] {
        &self.mutable_vars
    }

    pub fn property(&self) -> FnProperty {
        self.property
    }

    /// Mark a registered operator for deletion. If no invocation is
    /// currently in flight this takes effect immediately; otherwise it
    /// takes effect the moment the last in-flight invocation completes.
    /// Pushing a delete-pending operator again is a programmer error.
    pub fn delete(self: &Arc<Self>) {
        if self.is_delete_pending() {
            log::error!("{}", crate::error::ErrorKind::DoubleDelete("operator", self.id.0));
            std::process::abort();
        }
        self.delete_pending.store(true, Ordering::Release);
        self.maybe_unregister();
    }

    pub fn is_delete_pending(&self) -> bool {
        self.delete_pending.load(Ordering::Acquire)
    }

    pub fn pending_invocations(&self) -> usize {
        self.pending_invocations.load(Ordering::Acquire)
    }

    /// Record `registry` as the table this operator should remove itself
    /// from once delete-pending and idle. Only meaningful for registered
    /// operators; called once, by `OperatorRegistry::register`.
    pub(crate) fn attach_registry(self: &Arc<Self>, registry: OperatorRegistry) {
        *self.registry_hook.lock().unwrap() = Some(registry);
    }

    /// If delete is pending and no invocation is in flight, remove this
    /// operator from its registry. Safe to call from multiple racing
    /// threads: the hook is taken at most once.
    fn maybe_unregister(self: &Arc<Self>) {
        if self.is_delete_pending() && self.pending_invocations() == 0 {
            if let Some(registry) = self.registry_hook.lock().unwrap().take() {
                registry.unregister(self);
            }
        }
    }

    fn begin_invocation(self: &Arc<Self>) {
        if self.is_delete_pending() {
            log::error!("{}", crate::error::ErrorKind::UseAfterDelete("operator", self.id.0));
            std::process::abort();
        }
        self.pending_invocations.fetch_add(1, Ordering::AcqRel);
    }

    fn end_invocation(self: &Arc<Self>) {
        self.pending_invocations.fetch_sub(1, Ordering::AcqRel);
        self.maybe_unregister();
    }
}

/// One invocation of an [`Operator`]: its own wait counter, device and
/// priority. This is what actually gets queued on variable version
/// chains and enqueued into worker pools.
pub struct OpBlock {
    id: OpBlockId,
    seq: u64,
    device: Device,
    priority: Priority,
    /// `const_vars.len() + mutable_vars.len() + 1`. The extra one is a
    /// pseudo-dependency on the push pipeline itself finishing; without
    /// it, a dependency that resolves instantly from another thread
    /// while `push` is still appending to later variables could race
    /// the pipeline's own final readiness check.
    wait: AtomicIsize,
    operator: Arc<Operator>,
    /// Fired, at most once, from `finish_invocation`. The `engine` crate
    /// uses this to decrement its outstanding-operator tracker without
    /// this crate needing to know that tracker exists.
    on_complete: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OpBlock {
    pub fn new(operator: Arc<Operator>, device: Device, priority: Priority) -> Arc<OpBlock> {
        Self::with_completion_hook(operator, device, priority, None)
    }

    /// Like `new`, but `on_complete` (if given) runs once `finish_invocation`
    /// has propagated this block's completion to every variable it touched.
    pub fn with_completion_hook(
        operator: Arc<Operator>,
        device: Device,
        priority: Priority,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Arc<OpBlock> {
        operator.begin_invocation();
        let wait = operator.const_vars.len() + operator.mutable_vars.len() + 1;
        Arc::new(OpBlock {
            id: OpBlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            device,
            priority,
            wait: AtomicIsize::new(wait as isize),
            operator,
            on_complete: Mutex::new(on_complete),
        })
    }

    pub fn id(&self) -> OpBlockId {
        self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn property(&self) -> FnProperty {
        self.operator.property
    }

    pub fn const_vars(&self) -> &[Variable] {
        &self.operator.const_vars
    }

    pub fn mutable_vars(&self) -> &[Variable] {
        &self.operator.mutable_vars
    }

    /// Decrement the wait counter, returning its post-decrement value.
    /// Whichever caller observes zero is the one responsible for
    /// dispatching this block; the atomic decrement guarantees exactly
    /// one caller sees that transition.
    pub fn decr_wait(self: &Arc<Self>) -> isize {
        self.wait.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Run the operator's callable with a fresh completion token.
    /// Panics from the callable are caught at the worker boundary (see
    /// the `engine` crate's pool), not here.
    pub fn invoke(self: &Arc<Self>, ctx: RunContext, dispatch: DispatchFn) {
        let token = CompletionToken::new(self.clone(), dispatch);
        let mut guard = self.operator.callable.lock().unwrap();
        let callable = guard
            .as_mut()
            .expect("operator invoked after its callable was taken");
        callable(ctx, token);
    }

    /// Called once this block's completion has been fully propagated to
    /// its variables' version chains.
    pub(crate) fn finish_invocation(&self) {
        self.operator.end_invocation();
        if let Some(hook) = self.on_complete.lock().unwrap().take() {
            hook();
        }
    }

    pub fn operator(&self) -> &Arc<Operator> {
        &self.operator
    }
}

impl std::fmt::Debug for OpBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "OpBlock(id={}, device={}, priority={})",
            self.id, self.device, self.priority
        )
    }
}

/// Tracks live registered operators for teardown leak scans. Ephemeral
/// (anonymous, one-shot) operators are never registered here.
#[derive(Clone)]
pub struct OperatorRegistry {
    live: Arc<AtomicUsize>,
}

impl OperatorRegistry {
    pub fn new() -> OperatorRegistry {
        OperatorRegistry { live: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn register(&self, op: &Arc<Operator>) {
        debug_assert!(op.registered);
        self.live.fetch_add(1, Ordering::Relaxed);
        op.attach_registry(self.clone());
    }

    pub fn unregister(&self, op: &Arc<Operator>) {
        debug_assert!(op.registered);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::VariableRegistry;
    use std::sync::Mutex as StdMutex;

    fn dispatch_collecting() -> (DispatchFn, Arc<StdMutex<Vec<Arc<OpBlock>>>>) {
        let ready = Arc::new(StdMutex::new(Vec::new()));
        let dispatch: DispatchFn = {
            let ready = ready.clone();
            Arc::new(move |op: Arc<OpBlock>| ready.lock().unwrap().push(op))
        };
        (dispatch, ready)
    }

    #[test]
    fn read_and_write_of_same_variable_is_write_only() {
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        let op = Operator::new_ephemeral(
            vec![v.clone()],
            vec![v.clone()],
            FnProperty::Normal,
            Box::new(|_ctx, token| token.complete()),
        );
        assert_eq!(op.const_vars().len(), 0, "write-wins: shared var must drop out of const_vars");
        assert_eq!(op.mutable_vars().len(), 1);

        let (dispatch, ready) = dispatch_collecting();
        let block = OpBlock::new(op, Device::Cpu, 0);
        crate::dispatch::push(block, &dispatch);
        // One real dependency (the write) plus the pipeline's own
        // pseudo-dependency; both clear immediately on a fresh variable,
        // so the op is ready — it was never double-counted as a read too.
        assert_eq!(ready.lock().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_entries_in_write_set_are_deduplicated() {
        let reg = VariableRegistry::new();
        let v = reg.new_variable();
        let op = Operator::new_ephemeral(
            vec![],
            vec![v.clone(), v.clone()],
            FnProperty::Normal,
            Box::new(|_ctx, token| token.complete()),
        );
        assert_eq!(op.mutable_vars().len(), 1, "duplicate write entries must collapse to one");

        let (dispatch, ready) = dispatch_collecting();
        let block = OpBlock::new(op, Device::Cpu, 0);
        crate::dispatch::push(block, &dispatch);
        // Had the duplicate not been collapsed, the wait counter would
        // have been initialised one too high and this op would sit
        // forever at wait == 1 instead of becoming ready here.
        assert_eq!(ready.lock().unwrap().len(), 1);
    }
}
