//! Engine configuration: which backend to run and how big its worker
//! pools are, with environment-variable overrides for the process-wide
//! default engine.

use std::env;

use engine_core::Priority;

/// Which scheduling backend `Engine` runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineKind {
    /// Every push runs synchronously on the calling thread. No worker
    /// threads are spawned. Useful for debugging dependency bugs: a
    /// deadlock or a hazard violation reproduces without interleaving.
    Naive,
    /// One compute pool shared by all GPUs, one CPU compute pool, and
    /// one copy lane per GPU.
    Pooled,
    /// One compute pool per device (including the CPU), plus one copy
    /// lane per GPU. Higher thread count, better isolation between
    /// devices that contend for the same compute pool under `Pooled`.
    PerDevice,
}

impl EngineKind {
    fn parse(s: &str) -> Option<EngineKind> {
        match s {
            "naive" => Some(EngineKind::Naive),
            "pooled" => Some(EngineKind::Pooled),
            "per_device" | "perdevice" => Some(EngineKind::PerDevice),
            _ => None,
        }
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Pooled
    }
}

/// Construction-time configuration for an [`Engine`](crate::engine::Engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Worker threads per CPU compute pool.
    pub cpu_worker_nthreads: usize,
    /// Worker threads per GPU compute pool (ignored under `Naive`).
    pub gpu_worker_nthreads: usize,
    /// Number of distinct GPU device ids this engine is willing to
    /// stand up copy lanes and (under `PerDevice`) compute pools for.
    pub gpu_count: u32,
    /// Log every push/complete decision at `debug` level.
    pub debug_deps: bool,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// sensible defaults for anything unset or unparseable:
    ///
    /// - `ENGINE_TYPE` (`naive` | `pooled` | `per_device`)
    /// - `ENGINE_CPU_WORKER_NTHREADS` (default: number of logical CPUs)
    /// - `ENGINE_GPU_WORKER_NTHREADS` (default: 1)
    /// - `ENGINE_GPU_COUNT` (default: 0)
    /// - `ENGINE_DEBUG_DEPS` (`1`/`true` to enable)
    pub fn from_env() -> EngineConfig {
        let kind = env::var("ENGINE_TYPE")
            .ok()
            .and_then(|v| EngineKind::parse(&v))
            .unwrap_or_default();
        let cpu_worker_nthreads = env::var("ENGINE_CPU_WORKER_NTHREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(num_cpus::get);
        let gpu_worker_nthreads = env::var("ENGINE_GPU_WORKER_NTHREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let gpu_count = env::var("ENGINE_GPU_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let debug_deps = env::var("ENGINE_DEBUG_DEPS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        EngineConfig {
            kind,
            cpu_worker_nthreads: cpu_worker_nthreads.max(1),
            gpu_worker_nthreads: gpu_worker_nthreads.max(1),
            gpu_count,
            debug_deps,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            kind: EngineKind::default(),
            cpu_worker_nthreads: num_cpus::get().max(1),
            gpu_worker_nthreads: 1,
            gpu_count: 0,
            debug_deps: false,
        }
    }
}

impl EngineConfig {
    /// Start building a config. Any field left unset falls back to its
    /// `ENGINE_*` environment variable, and failing that to the same
    /// default `from_env` would use — so the builder always wins over
    /// the environment wherever both are supplied.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Explicit overrides for [`EngineConfig`], layered on top of
/// `EngineConfig::from_env()`. Every setter is optional; `build()` only
/// falls through to the environment (and from there to the hardcoded
/// defaults) for whatever the caller didn't set.
#[derive(Clone, Debug, Default)]
pub struct EngineConfigBuilder {
    kind: Option<EngineKind>,
    cpu_worker_nthreads: Option<usize>,
    gpu_worker_nthreads: Option<usize>,
    gpu_count: Option<u32>,
    debug_deps: Option<bool>,
}

impl EngineConfigBuilder {
    pub fn kind(mut self, kind: EngineKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn cpu_worker_nthreads(mut self, n: usize) -> Self {
        self.cpu_worker_nthreads = Some(n);
        self
    }

    pub fn gpu_worker_nthreads(mut self, n: usize) -> Self {
        self.gpu_worker_nthreads = Some(n);
        self
    }

    pub fn gpu_count(mut self, n: u32) -> Self {
        self.gpu_count = Some(n);
        self
    }

    pub fn debug_deps(mut self, v: bool) -> Self {
        self.debug_deps = Some(v);
        self
    }

    pub fn build(self) -> EngineConfig {
        let env = EngineConfig::from_env();
        EngineConfig {
            kind: self.kind.unwrap_or(env.kind),
            cpu_worker_nthreads: self.cpu_worker_nthreads.unwrap_or(env.cpu_worker_nthreads).max(1),
            gpu_worker_nthreads: self.gpu_worker_nthreads.unwrap_or(env.gpu_worker_nthreads).max(1),
            gpu_count: self.gpu_count.unwrap_or(env.gpu_count),
            debug_deps: self.debug_deps.unwrap_or(env.debug_deps),
        }
    }
}

/// Default priority assigned to a push that doesn't specify one.
pub const DEFAULT_PRIORITY: Priority = 0;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `env::set_var` is process-global; serialize the tests that touch it
    // so they don't observe each other's in-flight state.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn builder_overrides_take_precedence_over_env() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::set_var("ENGINE_TYPE", "naive");
        env::set_var("ENGINE_CPU_WORKER_NTHREADS", "7");
        let cfg = EngineConfig::builder().kind(EngineKind::PerDevice).build();
        assert_eq!(cfg.kind, EngineKind::PerDevice);
        // left unset on the builder, so the env value wins.
        assert_eq!(cfg.cpu_worker_nthreads, 7);
        env::remove_var("ENGINE_TYPE");
        env::remove_var("ENGINE_CPU_WORKER_NTHREADS");
    }

    #[test]
    fn unset_builder_falls_back_to_hardcoded_default() {
        let _guard = ENV_GUARD.lock().unwrap();
        env::remove_var("ENGINE_TYPE");
        let cfg = EngineConfig::builder().build();
        assert_eq!(cfg.kind, EngineKind::Pooled);
    }
}
