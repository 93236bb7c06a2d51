//! Routes a ready operator to the pool that should run it, and owns the
//! pools themselves.
//!
//! Three backends share one routing rule (§4.4's property-driven pool
//! selection): `Normal` and `FlushToMem` land on a device's *compute*
//! pool (`FlushToMem` always resolves to the CPU's, regardless of the
//! operator's nominal device); `CopyToGPU`/`CopyFromGPU`/
//! `CopyToSameDevice` land on a *copy lane*, kept separate from compute
//! so a long-running kernel never blocks a pending transfer (and vice
//! versa). What differs between backends is how many compute pools
//! exist: `Pooled` shares one among every GPU, `PerDevice` gives each
//! GPU (and the CPU) its own, and `Naive` has none at all — it runs
//! everything inline on the thread that pushed it.

use std::collections::HashMap;
use std::sync::Arc;

use engine_core::{Device, DispatchFn, FnProperty, OpBlock, RunContext};

use crate::config::{EngineConfig, EngineKind};
use crate::pool::WorkerPool;

/// Picks, for a given operator, which logical queue it belongs on.
/// `Copy` queues are always per-GPU. `Compute` queues are: always a
/// dedicated CPU queue, plus either one shared GPU queue (`Pooled`) or
/// one per GPU id (`PerDevice`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ComputeKey {
    Cpu,
    Gpu(Option<u32>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum QueueKey {
    Compute(ComputeKey),
    Copy(u32),
}

fn queue_key(device: Device, property: FnProperty, per_device_compute: bool) -> QueueKey {
    match property {
        FnProperty::FlushToMem => QueueKey::Compute(ComputeKey::Cpu),
        FnProperty::CopyFromGPU | FnProperty::CopyToGPU => match device.gpu_id() {
            Some(id) => QueueKey::Copy(id),
            None => QueueKey::Compute(ComputeKey::Cpu),
        },
        FnProperty::CopyToSameDevice | FnProperty::Normal | FnProperty::Async => {
            match device.gpu_id() {
                Some(id) if per_device_compute => QueueKey::Compute(ComputeKey::Gpu(Some(id))),
                Some(_) => QueueKey::Compute(ComputeKey::Gpu(None)),
                None => QueueKey::Compute(ComputeKey::Cpu),
            }
        }
    }
}

/// Owns every worker pool a running engine needs and knows how to route
/// a ready operator to the right one.
pub enum Backend {
    /// Carries its own copy of the dispatch closure: with no worker
    /// threads to capture one at spawn time, `route` has to supply it
    /// to `invoke` itself so a synchronously-resolving downstream
    /// operator can recurse back through dispatch.
    Naive(DispatchFn),
    Threaded {
        per_device_compute: bool,
        pools: HashMap<QueueKey, WorkerPool>,
    },
}

impl Backend {
    pub fn start(config: &EngineConfig, dispatch: DispatchFn) -> std::io::Result<Backend> {
        match config.kind {
            EngineKind::Naive => Ok(Backend::Naive(dispatch)),
            EngineKind::Pooled | EngineKind::PerDevice => {
                let per_device_compute = config.kind == EngineKind::PerDevice;
                let mut pools = HashMap::new();

                // FlushToMem and CPU-targeted Normal ops both land here.
                pools.insert(
                    QueueKey::Compute(ComputeKey::Cpu),
                    WorkerPool::spawn(
                        "cpu-compute",
                        config.cpu_worker_nthreads,
                        Device::Cpu,
                        dispatch.clone(),
                    )?,
                );

                if !per_device_compute && config.gpu_count > 0 {
                    pools.insert(
                        QueueKey::Compute(ComputeKey::Gpu(None)),
                        WorkerPool::spawn(
                            "gpu-compute-shared",
                            config.gpu_worker_nthreads,
                            Device::Gpu(0),
                            dispatch.clone(),
                        )?,
                    );
                }

                for gpu in 0..config.gpu_count {
                    if per_device_compute {
                        pools.insert(
                            QueueKey::Compute(ComputeKey::Gpu(Some(gpu))),
                            WorkerPool::spawn(
                                format!("gpu{}-compute", gpu),
                                config.gpu_worker_nthreads,
                                Device::Gpu(gpu),
                                dispatch.clone(),
                            )?,
                        );
                    }
                    pools.insert(
                        QueueKey::Copy(gpu),
                        WorkerPool::spawn(
                            format!("gpu{}-copy", gpu),
                            1,
                            Device::Gpu(gpu),
                            dispatch.clone(),
                        )?,
                    );
                }

                Ok(Backend::Threaded { per_device_compute, pools })
            }
        }
    }

    /// Route a now-ready operator to its pool, or run it inline under
    /// `Naive`.
    pub fn route(&self, op: Arc<OpBlock>) {
        match self {
            Backend::Naive(dispatch) => {
                // `Any` is only ever a push-time hint; resolve it the same
                // way the threaded backends implicitly do (falling through
                // to the CPU compute queue) rather than leaking it into
                // the callable's `RunContext`.
                let device = match op.device() {
                    Device::Any => Device::Cpu,
                    other => other,
                };
                let ctx = RunContext { device, stream: None };
                op.invoke(ctx, dispatch.clone());
            }
            Backend::Threaded { per_device_compute, pools } => {
                let key = queue_key(op.device(), op.property(), *per_device_compute);
                match pools.get(&key) {
                    Some(pool) => pool.enqueue(op),
                    // A GPU op arrived but no pool was provisioned for it
                    // (e.g. `gpu_count` undercounts the caller's devices).
                    // Falls back to the CPU compute pool rather than
                    // silently dropping the operator.
                    None => {
                        log::warn!(
                            "no pool provisioned for {:?}/{:?}, falling back to cpu-compute",
                            op.device(),
                            op.property()
                        );
                        pools[&QueueKey::Compute(ComputeKey::Cpu)].enqueue(op);
                    }
                }
            }
        }
    }

    /// Total ready-but-unclaimed operators across every pool. Always 0
    /// under `Naive`.
    pub fn total_backlog(&self) -> usize {
        match self {
            Backend::Naive(_) => 0,
            Backend::Threaded { pools, .. } => pools.values().map(WorkerPool::backlog).sum(),
        }
    }

    pub fn shutdown(self) {
        if let Backend::Threaded { pools, .. } = self {
            for (_, pool) in pools {
                pool.shutdown();
            }
        }
    }
}
