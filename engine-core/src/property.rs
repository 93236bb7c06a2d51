//! The property tag steering worker-pool selection for an operator.

/// Categorical hint the dispatch core uses to pick a pool and queue for
/// an operator (see `dispatch::select_queue`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FnProperty {
    /// Ordinary compute; goes to the target device's compute queue.
    Normal,
    /// Device-to-host transfer; goes to the *source* GPU's copy queue.
    CopyFromGPU,
    /// Host-to-device transfer; goes to the *destination* GPU's copy queue.
    CopyToGPU,
    /// Device-to-device (or host-to-host) transfer that stays on the
    /// target device's compute queue.
    CopyToSameDevice,
    /// Forces serialization onto the CPU compute queue regardless of the
    /// operator's nominal target device.
    FlushToMem,
    /// The callable is responsible for invoking the completion callback
    /// itself, possibly from a different thread or driver callback.
    Async,
}

impl FnProperty {
    /// Whether the callable for this property is expected to complete
    /// asynchronously (i.e. not simply on return from `invoke`).
    pub fn is_async(&self) -> bool {
        matches!(self, FnProperty::Async)
    }
}

impl Default for FnProperty {
    fn default() -> Self {
        FnProperty::Normal
    }
}
