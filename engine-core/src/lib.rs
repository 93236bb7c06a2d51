//! Device-aware, dependency-tracking execution core.
//!
//! This crate has no threads and no I/O of its own. It models the
//! bookkeeping a scheduler needs — versioned variables, the operators
//! queued against them, and the push/complete pipeline connecting the
//! two — so that a pool implementation (see the `engine` crate) only
//! has to decide *where* a ready operator runs, never *whether* it is
//! safe to run yet.

pub mod device;
pub mod dispatch;
pub mod error;
pub mod op;
pub mod property;
pub mod var;

pub use self::device::{Device, Priority};
pub use self::dispatch::Tracker;
pub use self::error::{Error, ErrorKind, Result};
pub use self::op::{
    Callable, CompletionToken, DispatchFn, OpBlock, OpBlockId, Operator, OperatorId,
    OperatorRegistry, RunContext, StreamHandle,
};
pub use self::property::FnProperty;
pub use self::var::{VarId, Variable, VariableRegistry};
