//! Target device addressing.

use std::fmt;

/// Where an operator runs, or where a variable's storage lives.
///
/// `Any` is only valid as a push-time hint for operators that don't care
/// which compute device they land on (the dispatch core resolves it to a
/// concrete pool at enqueue time); a [`Variable`](crate::var::Variable)
/// itself is always pinned to a concrete device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    /// The CPU compute pool.
    Cpu,
    /// GPU `id`'s pools.
    Gpu(u32),
    /// No device preference; resolved by the dispatch core.
    Any,
}

impl Device {
    /// Returns the GPU id, if this is a `Gpu` device.
    pub fn gpu_id(&self) -> Option<u32> {
        match *self {
            Device::Gpu(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this device is a GPU.
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(id) => write!(f, "gpu{}", id),
            Device::Any => write!(f, "any"),
        }
    }
}

/// Caller-supplied scheduling priority. Higher runs earlier within its
/// (device, property) queue; ties broken by submission order.
pub type Priority = i32;
