//! Device-aware worker pools and the public façade around them.
//!
//! `engine-core` knows how to decide *whether* an operator is ready;
//! this crate decides *where* it runs. [`engine::Engine`] ties the two
//! together: it owns the variable/operator registries from
//! `engine-core`, a [`backend::Backend`] (the worker pools, or none
//! under the `naive` debug variant), and the push/wait/delete/stop
//! surface callers actually use.
//!
//! A process usually wants exactly one of these; [`global`] lazily
//! builds one from `EngineConfig::builder().build()` (environment
//! variables, see [`config`]) the first time anything asks for it, and
//! hands back the same handle forever after. Tests that want an
//! isolated engine should call [`Engine::new`] directly instead.

pub mod backend;
pub mod config;
#[allow(clippy::module_inception)]
mod engine;
pub mod paramstore;
pub mod pool;

pub use crate::config::{EngineConfig, EngineConfigBuilder, EngineKind, DEFAULT_PRIORITY};
pub use crate::engine::Engine;
pub use crate::paramstore::{Buffer, CommStrategy, ParamStore, Updater};

pub use engine_core::{
    Callable, CompletionToken, Device, Error, ErrorKind, FnProperty, OpBlockId, Operator,
    OperatorId, Priority, Result, RunContext, StreamHandle, VarId, Variable,
};

use std::sync::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    static ref GLOBAL: Mutex<Option<Engine>> = Mutex::new(None);
}

/// Return the process-wide default engine, building it from
/// `EngineConfig::builder().build()` on first use. No module-load-time
/// side effects: nothing runs until the first caller actually asks for
/// it.
///
/// Panics (via `expect`) if construction fails — the same resource
/// exhaustion that would make `Engine::new` return
/// `Err(EngineConstruction)` for an explicit engine. Prefer
/// `Engine::new` directly if you want to handle that case instead of
/// aborting.
pub fn global() -> Engine {
    let mut guard = GLOBAL.lock().unwrap();
    if guard.is_none() {
        let engine = Engine::with_default_config().expect("failed to start the default engine");
        *guard = Some(engine);
    }
    guard.as_ref().unwrap().clone()
}

/// Tear down the process-wide default engine, if one was ever built.
/// A no-op if `global()` was never called. Like `Engine::stop`, aborts
/// if operators are still outstanding.
pub fn shutdown_global() {
    if let Some(engine) = GLOBAL.lock().unwrap().take() {
        engine.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_is_lazily_built_and_stable() {
        let a = global();
        let b = global();
        assert_eq!(a.live_variable_count(), b.live_variable_count());
        let v = a.new_variable();
        assert_eq!(b.live_variable_count(), 1);
        a.delete_variable(&v);
        shutdown_global();
    }
}
