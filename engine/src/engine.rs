//! The public façade: `Engine` is the one type most callers touch.
//!
//! It wires the three things the rest of this crate builds in isolation
//! — variable registry, operator registry, and worker-pool backend —
//! into the push/wait/delete/stop surface described for the original
//! threaded engine this is modelled on. Construction is explicit
//! (`Engine::new`/`Engine::with_config`); the process-wide default
//! instance lives behind `engine::global()` (see `lib.rs`) rather than
//! being baked into this type itself, so a test can build as many
//! independent engines as it likes.

use std::sync::{Arc, Mutex, OnceLock};

use engine_core::{
    Callable, CompletionToken, Device, DispatchFn, FnProperty, OpBlock, Operator,
    OperatorRegistry, Priority, RunContext, Tracker, Variable, VariableRegistry,
};

use crate::backend::Backend;
use crate::config::EngineConfig;

struct Inner {
    vars: VariableRegistry,
    operators: OperatorRegistry,
    tracker: Tracker,
    backend: Mutex<Option<Backend>>,
    config: EngineConfig,
    /// The closure every `OpBlock` is ultimately handed so it can
    /// re-enter dispatch once ready. Set exactly once, right after
    /// `Inner` itself exists (it closes over an `Arc<Inner>`), and
    /// cloned cheaply for every push thereafter.
    dispatch: OnceLock<DispatchFn>,
}

/// A running dependency-tracking execution engine.
///
/// Cheap to clone (an `Arc` underneath); every clone shares the same
/// variable table, operator table, and worker pools. Pushes are
/// non-blocking from any thread; `wait_for_var`/`wait_for_all` are the
/// only calls that suspend the caller.
#[derive(Clone)]
pub struct Engine(Arc<Inner>);

impl Engine {
    /// Build a fresh engine from an explicit configuration. Fails only
    /// if the backend could not spawn its worker threads (resource
    /// exhaustion, not a programmer error — see `error::ErrorKind::EngineConstruction`).
    pub fn new(config: EngineConfig) -> engine_core::Result<Engine> {
        let inner = Arc::new(Inner {
            vars: VariableRegistry::new(),
            operators: OperatorRegistry::new(),
            tracker: Tracker::new(),
            backend: Mutex::new(None),
            config,
            dispatch: OnceLock::new(),
        });

        let dispatch = make_dispatch(inner.clone());
        let backend = Backend::start(&inner.config, dispatch.clone()).map_err(|e| {
            engine_core::ErrorKind::EngineConstruction(e.to_string())
        })?;
        *inner.backend.lock().unwrap() = Some(backend);
        inner
            .dispatch
            .set(dispatch)
            .unwrap_or_else(|_| unreachable!("Engine::new sets dispatch exactly once"));

        log::info!("engine started: {:?}", inner.config.kind);
        Ok(Engine(inner))
    }

    /// Build a fresh engine from `EngineConfig::default()` merged with
    /// the `ENGINE_*` environment (equivalent to
    /// `Engine::new(EngineConfig::builder().build())`).
    pub fn with_default_config() -> engine_core::Result<Engine> {
        Self::new(EngineConfig::builder().build())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    /// Allocate a fresh variable with an empty version chain.
    pub fn new_variable(&self) -> Variable {
        self.0.vars.new_variable()
    }

    /// Create a registered, reusable operator. Invoke it (as many times
    /// as needed) with `push_operator`; free it with `delete_operator`.
    pub fn new_operator(
        &self,
        const_vars: Vec<Variable>,
        mutable_vars: Vec<Variable>,
        property: FnProperty,
        callable: Callable,
    ) -> Arc<Operator> {
        let op = Operator::new_registered(const_vars, mutable_vars, property, callable);
        self.0.operators.register(&op);
        op
    }

    /// Submit one invocation of a previously registered operator.
    pub fn push_operator(&self, op: &Arc<Operator>, device: Device, priority: Priority) {
        self.push_block(op.clone(), device, priority);
    }

    /// Submit an ephemeral, one-shot operator. `callable` must invoke its
    /// `CompletionToken` exactly once; for `Async`-tagged pushes that may
    /// happen on another thread, later.
    pub fn push(
        &self,
        const_vars: Vec<Variable>,
        mutable_vars: Vec<Variable>,
        device: Device,
        priority: Priority,
        property: FnProperty,
        callable: Callable,
    ) {
        let op = Operator::new_ephemeral(const_vars, mutable_vars, property, callable);
        self.push_block(op, device, priority);
    }

    /// Convenience wrapper over `push` for a synchronous callable: `f`
    /// runs to completion and the engine fires the completion token for
    /// it automatically.
    pub fn push_sync<F>(
        &self,
        const_vars: Vec<Variable>,
        mutable_vars: Vec<Variable>,
        device: Device,
        priority: Priority,
        property: FnProperty,
        mut f: F,
    ) where
        F: FnMut(RunContext) + Send + 'static,
    {
        self.push(
            const_vars,
            mutable_vars,
            device,
            priority,
            property,
            Box::new(move |ctx, token| {
                f(ctx);
                token.complete();
            }),
        );
    }

    /// Convenience wrapper over `push` for a callable that takes the
    /// completion token directly and is responsible for firing it
    /// itself, possibly asynchronously. Equivalent to `push` with an
    /// `Async` property, spelled out for readability at call sites.
    pub fn push_async<F>(
        &self,
        const_vars: Vec<Variable>,
        mutable_vars: Vec<Variable>,
        device: Device,
        priority: Priority,
        f: F,
    ) where
        F: FnMut(RunContext, CompletionToken) + Send + 'static,
    {
        self.push(
            const_vars,
            mutable_vars,
            device,
            priority,
            FnProperty::Async,
            Box::new(f),
        );
    }

    fn push_block(&self, op: Arc<Operator>, device: Device, priority: Priority) {
        let tracker = self.0.tracker.clone();
        tracker.on_push();
        let block = OpBlock::with_completion_hook(
            op,
            device,
            priority,
            Some(Box::new(move || tracker.on_complete())),
        );
        engine_core::dispatch::push(block, self.dispatch_fn());
    }

    fn dispatch_fn(&self) -> &DispatchFn {
        self.0
            .dispatch
            .get()
            .expect("Engine::new always sets dispatch before returning")
    }

    /// Mark a variable for deletion. Its storage is released the moment
    /// its version chain drains (synchronously, if it is already idle).
    pub fn delete_variable(&self, var: &Variable) {
        var.delete();
    }

    /// Mark a registered operator for deletion. Takes effect immediately
    /// if idle, or the moment its last in-flight invocation completes.
    pub fn delete_operator(&self, op: &Arc<Operator>) {
        op.delete();
    }

    /// Block until `var` has no operators queued against it. Returns
    /// immediately if already idle, including on a second back-to-back
    /// call.
    pub fn wait_for_var(&self, var: &Variable) {
        var.wait_until_idle();
    }

    /// Block until every pushed operator has completed.
    pub fn wait_for_all(&self) {
        self.0.tracker.wait_for_all();
    }

    /// Number of variables not yet released.
    pub fn live_variable_count(&self) -> usize {
        self.0.vars.live_count()
    }

    /// Number of registered operators not yet unregistered.
    pub fn live_operator_count(&self) -> usize {
        self.0.operators.live_count()
    }

    /// Number of pushed operators that have not yet completed.
    pub fn outstanding_count(&self) -> usize {
        self.0.tracker.outstanding()
    }

    /// Total ready-but-unclaimed operators across every worker pool.
    pub fn backlog(&self) -> usize {
        self.0
            .backend
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, Backend::total_backlog)
    }

    /// Stop accepting new pushes, join every worker thread, and assert
    /// the engine drained cleanly. Calling this with operators still
    /// outstanding is a programmer error (the caller skipped
    /// `wait_for_all`) and aborts the process after logging, per the
    /// engine's error taxonomy — it is never reported as a `Result`.
    pub fn stop(&self) {
        let outstanding = self.0.tracker.outstanding();
        if outstanding != 0 {
            log::error!("{}", engine_core::ErrorKind::ShutdownWithPending(outstanding));
            std::process::abort();
        }
        if let Some(backend) = self.0.backend.lock().unwrap().take() {
            backend.shutdown();
        }
        log::info!("engine stopped");
    }

    /// Alias for `stop`, matching the façade's `notify_shutdown` name.
    pub fn notify_shutdown(&self) {
        self.stop();
    }
}

/// Build the closure every `OpBlock` eventually receives to hand itself
/// back to the dispatch core once its wait counter reaches zero. Shared
/// between `push` (the initial readiness check) and `complete` (every
/// later one), and threaded down into worker pools so an `Async`
/// callable's completion token can keep using it long after `push`
/// returned.
fn make_dispatch(inner: Arc<Inner>) -> DispatchFn {
    Arc::new(move |op: Arc<OpBlock>| {
        let guard = inner.backend.lock().unwrap();
        match guard.as_ref() {
            Some(backend) => backend.route(op),
            None => {
                log::error!(
                    "operator {:?} became ready after engine stop; this is a programmer error \
                     (a push outlived its engine, or stop() ran before wait_for_all())",
                    op
                );
                std::process::abort();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn naive_engine() -> Engine {
        Engine::new(EngineConfig::builder().kind(EngineKind::Naive).build()).unwrap()
    }

    fn pooled_engine(cpu_threads: usize) -> Engine {
        Engine::new(
            EngineConfig::builder()
                .kind(EngineKind::Pooled)
                .cpu_worker_nthreads(cpu_threads)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn raw_hazard_runs_read_strictly_after_write() {
        init_logging();
        let engine = pooled_engine(4);
        let v = engine.new_variable();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let order_w = order.clone();
        engine.push_sync(vec![], vec![v.clone()], Device::Cpu, 0, FnProperty::Normal, move |_ctx| {
            order_w.lock().unwrap().push("write");
        });
        let order_r = order.clone();
        engine.push_sync(vec![v.clone()], vec![], Device::Cpu, 0, FnProperty::Normal, move |_ctx| {
            order_r.lock().unwrap().push("read");
        });

        engine.wait_for_all();
        assert_eq!(*order.lock().unwrap(), vec!["write", "read"]);
        engine.delete_variable(&v);
        engine.stop();
    }

    #[test]
    fn war_hazard_runs_write_strictly_after_read_even_with_higher_priority() {
        let engine = pooled_engine(4);
        let v = engine.new_variable();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let order_r = order.clone();
        engine.push_sync(vec![v.clone()], vec![], Device::Cpu, 0, FnProperty::Normal, move |_ctx| {
            std::thread::sleep(Duration::from_millis(20));
            order_r.lock().unwrap().push("read");
        });
        let order_w = order.clone();
        // Higher priority than the read, but must still wait on it.
        engine.push_sync(vec![], vec![v.clone()], Device::Cpu, 100, FnProperty::Normal, move |_ctx| {
            order_w.lock().unwrap().push("write");
        });

        engine.wait_for_all();
        assert_eq!(*order.lock().unwrap(), vec!["read", "write"]);
        engine.delete_variable(&v);
        engine.stop();
    }

    #[test]
    fn parallel_readers_both_see_write_complete_first() {
        let engine = pooled_engine(4);
        let v = engine.new_variable();
        let write_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        engine.push_sync(vec![], vec![v.clone()], Device::Cpu, 0, FnProperty::Normal, {
            let write_done = write_done.clone();
            move |_ctx| {
                std::thread::sleep(Duration::from_millis(10));
                write_done.store(true, Ordering::SeqCst);
            }
        });
        for _ in 0..2 {
            let write_done = write_done.clone();
            let violations = violations.clone();
            engine.push_sync(vec![v.clone()], vec![], Device::Cpu, 0, FnProperty::Normal, move |_ctx| {
                if !write_done.load(Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        engine.wait_for_all();
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        engine.delete_variable(&v);
        engine.stop();
    }

    #[test]
    fn priority_within_class_dequeues_highest_first() {
        let engine = pooled_engine(1);
        // Block the single worker so every priority ends up queued at once.
        let gate = Arc::new(std::sync::Barrier::new(2));
        {
            let gate = gate.clone();
            engine.push_sync(vec![], vec![], Device::Cpu, 1000, FnProperty::Normal, move |_ctx| {
                gate.wait();
            });
        }
        let order: Arc<StdMutex<Vec<i32>>> = Arc::new(StdMutex::new(Vec::new()));
        for priority in 1..=100 {
            let order = order.clone();
            engine.push_sync(vec![], vec![], Device::Cpu, priority, FnProperty::Normal, move |_ctx| {
                order.lock().unwrap().push(priority);
            });
        }
        gate.wait();

        engine.wait_for_all();
        let observed = order.lock().unwrap().clone();
        let mut expected: Vec<i32> = (1..=100).collect();
        expected.reverse();
        assert_eq!(observed, expected);
        engine.stop();
    }

    #[test]
    fn delete_immediately_after_write_is_safe() {
        let engine = pooled_engine(2);
        let v = engine.new_variable();
        engine.push_sync(vec![], vec![v.clone()], Device::Cpu, 0, FnProperty::Normal, |_ctx| {});
        engine.delete_variable(&v);
        engine.wait_for_all();
        assert!(v.is_released());
        engine.stop();
    }

    #[test]
    fn naive_engine_runs_ready_pushes_inline() {
        let engine = naive_engine();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        engine.push_sync(vec![], vec![], Device::Cpu, 0, FnProperty::Normal, move |_ctx| {
            ran2.store(true, Ordering::SeqCst);
        });
        // Naive runs the callable synchronously inside push; no wait needed.
        assert!(ran.load(Ordering::SeqCst));
        engine.stop();
    }

    #[test]
    fn naive_engine_resolves_any_device_to_cpu() {
        let engine = naive_engine();
        let seen = Arc::new(StdMutex::new(None));
        let seen2 = seen.clone();
        engine.push_sync(vec![], vec![], Device::Any, 0, FnProperty::Normal, move |ctx| {
            *seen2.lock().unwrap() = Some(ctx.device);
        });
        assert_eq!(*seen.lock().unwrap(), Some(Device::Cpu));
        engine.stop();
    }

    #[test]
    fn push_operator_can_run_a_registered_operator_twice() {
        let engine = pooled_engine(2);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let op = engine.new_operator(
            vec![],
            vec![],
            FnProperty::Normal,
            Box::new(move |_ctx, token| {
                count2.fetch_add(1, Ordering::SeqCst);
                token.complete();
            }),
        );
        engine.push_operator(&op, Device::Cpu, 0);
        engine.push_operator(&op, Device::Cpu, 0);
        engine.wait_for_all();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        engine.delete_operator(&op);
        assert_eq!(engine.live_operator_count(), 0);
        engine.stop();
    }

    #[test]
    fn async_callable_completes_from_another_thread() {
        let engine = pooled_engine(2);
        let v = engine.new_variable();
        engine.push_async(vec![], vec![v.clone()], Device::Cpu, 0, move |_ctx, token| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                token.complete();
            });
        });
        engine.wait_for_var(&v);
        engine.wait_for_var(&v); // second call returns immediately
        engine.delete_variable(&v);
        engine.stop();
    }

    #[test]
    fn panic_in_callable_still_fires_completion() {
        init_logging();
        let engine = pooled_engine(2);
        let v = engine.new_variable();
        engine.push_sync(vec![], vec![v.clone()], Device::Cpu, 0, FnProperty::Normal, |_ctx| {
            panic!("boom");
        });
        // If completion didn't fire, this would hang forever.
        engine.wait_for_var(&v);
        engine.delete_variable(&v);
        engine.stop();
    }

    #[test]
    fn no_leak_after_wait_for_all_and_delete_everything() {
        let engine = pooled_engine(2);
        let vars: Vec<_> = (0..10).map(|_| engine.new_variable()).collect();
        for v in &vars {
            engine.push_sync(vec![], vec![v.clone()], Device::Cpu, 0, FnProperty::Normal, |_ctx| {});
        }
        engine.wait_for_all();
        for v in &vars {
            engine.delete_variable(v);
        }
        assert_eq!(engine.live_variable_count(), 0);
        engine.stop();
    }

    #[test]
    fn copy_lane_runs_concurrently_with_compute_on_same_gpu() {
        init_logging();
        let engine = Engine::new(
            EngineConfig::builder()
                .kind(EngineKind::Pooled)
                .cpu_worker_nthreads(1)
                .gpu_worker_nthreads(1)
                .gpu_count(1)
                .build(),
        )
        .unwrap();

        let copy_var = engine.new_variable();
        let compute_var = engine.new_variable();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let copy_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let compute_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let barrier = barrier.clone();
            let copy_ran = copy_ran.clone();
            engine.push_sync(
                vec![],
                vec![copy_var.clone()],
                Device::Gpu(0),
                0,
                FnProperty::CopyFromGPU,
                move |_ctx| {
                    copy_ran.store(true, Ordering::SeqCst);
                    barrier.wait();
                },
            );
        }
        {
            let barrier = barrier.clone();
            let compute_ran = compute_ran.clone();
            engine.push_sync(
                vec![],
                vec![compute_var.clone()],
                Device::Gpu(0),
                0,
                FnProperty::Normal,
                move |_ctx| {
                    compute_ran.store(true, Ordering::SeqCst);
                    barrier.wait();
                },
            );
        }

        // Each callable blocks on the shared barrier until the other
        // arrives. Had the copy op and the compute op landed on the same
        // single-thread pool, neither could ever reach the barrier before
        // the other returned, and this would hang instead of completing.
        engine.wait_for_all();
        assert!(copy_ran.load(Ordering::SeqCst));
        assert!(compute_ran.load(Ordering::SeqCst));
        engine.delete_variable(&copy_var);
        engine.delete_variable(&compute_var);
        engine.stop();
    }
}
