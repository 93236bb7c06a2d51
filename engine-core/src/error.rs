//! Error types for the dependency engine core.

use std::fmt;
use failure::{Context, Fail, Backtrace};

/// Engine result type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The kind of failure the engine core encountered.
///
/// `Programmer` variants are not meant to be handled: callers that hit them
/// have violated an invariant documented on the type they called into, and
/// the engine aborts the process after logging rather than returning
/// `Err` for them to (mis)handle. They are still represented here, rather
/// than panicking directly at the call site, so that tests can assert on
/// which invariant was violated.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    /// A variable was appended to, or an operator pushed, after it was
    /// already marked for deletion. `_0` names the kind of thing
    /// ("variable" or "operator"); `_1` is its id.
    #[fail(display = "use of {} {} after it was deleted", _0, _1)]
    UseAfterDelete(&'static str, u64),
    /// `delete_variable`/`delete_operator` was called twice for the same
    /// thing. `_0` names the kind of thing; `_1` is its id.
    #[fail(display = "{} {} deleted twice", _0, _1)]
    DoubleDelete(&'static str, u64),
    /// An async callable returned without invoking its completion token
    /// and without stashing it anywhere reachable; detected at teardown.
    #[fail(display = "operator {} leaked: completion callback never fired", _0)]
    CompletionLeak(u64),
    /// The engine was asked to shut down while operators were still
    /// in flight and the caller never called `wait_for_all`.
    #[fail(display = "shutdown requested with {} operator(s) still pending", _0)]
    ShutdownWithPending(usize),
    /// A callable panicked during execution; captured at the worker
    /// boundary. Completion still fires for the operator; this variant
    /// only reaches a caller through the process-level error sink.
    #[fail(display = "operator {} panicked: {}", _0, _1)]
    CallableFailure(u64, String),
    /// Worker thread spawn failed (resource exhaustion at construction
    /// time). Propagated to the caller of `Engine::new`/`init`, not
    /// treated as a programmer error.
    #[fail(display = "failed to spawn worker thread: {}", _0)]
    EngineConstruction(String),
}

/// An engine error, wrapping an [`ErrorKind`] with an optional backtrace.
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    /// Returns the error variant and contents.
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    /// Returns the immediate cause of this error, if any.
    pub fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { inner: Context::new(kind) }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

unsafe impl Send for Error {}
unsafe impl Sync for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_preserved_through_error_conversion() {
        let err: Error = ErrorKind::DoubleDelete("variable", 7).into();
        match err.kind() {
            ErrorKind::DoubleDelete(what, id) => {
                assert_eq!(*what, "variable");
                assert_eq!(*id, 7);
            }
            other => panic!("expected DoubleDelete, got {:?}", other),
        }
    }

    #[test]
    fn display_messages_name_the_offending_id() {
        assert_eq!(
            ErrorKind::UseAfterDelete("operator", 3).to_string(),
            "use of operator 3 after it was deleted"
        );
        assert_eq!(
            ErrorKind::CompletionLeak(5).to_string(),
            "operator 5 leaked: completion callback never fired"
        );
        assert_eq!(
            ErrorKind::ShutdownWithPending(2).to_string(),
            "shutdown requested with 2 operator(s) still pending"
        );
        assert_eq!(
            ErrorKind::CallableFailure(9, "boom".to_string()).to_string(),
            "operator 9 panicked: boom"
        );
    }
}
