//! A small parameter store: `init`/`push`/`pull`/`broadcast` over named
//! values replicated across devices, expressed entirely as engine
//! operators so cross-device aggregation is ordered correctly against
//! downstream compute without any separate barrier.
//!
//! Modelled on the historical split between a CPU-side reduction
//! communicator and a device-side one (`CommCPU` vs. `CommDevice` in
//! the engine this crate is adapted from): `CommStrategy::Cpu` always
//! aggregates on the CPU compute queue (`FlushToMem`, serialized with
//! every other flush); `CommStrategy::Device` aggregates on whichever
//! device the caller names when the key is initialised, landing on that
//! device's ordinary compute queue. Concrete tensor math is out of
//! scope for the engine itself, so a key's value here is a plain
//! `Vec<f32>` rather than an `NDArray`; the reduction is elementwise sum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use engine_core::{Device, FnProperty, Variable};

use crate::config::DEFAULT_PRIORITY;
use crate::engine::Engine;

/// Which side of the wire does the reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommStrategy {
    /// Aggregate on the CPU regardless of where the per-device values
    /// live. Every `push` lands on the CPU's `FlushToMem` queue.
    Cpu,
    /// Aggregate on a device named at `init` time (standing in for
    /// "the largest participant, chosen to minimize cross-device
    /// traffic" in the source this is adapted from — this crate has no
    /// real shapes to rank by, so the caller picks).
    Device,
}

/// A caller-supplied closure run once, inside the `push` operator,
/// after the per-device values have been reduced into the aggregation
/// buffer. Typically an optimizer step (SGD, momentum, ...); `None`
/// leaves `push` a pure reduction.
pub type Updater = Box<dyn Fn(&mut [f32]) + Send + Sync>;

/// One named parameter: an engine `Variable` guarding access to a plain
/// buffer of values, plus the device it's pinned to for dependency
/// purposes.
#[derive(Clone)]
pub struct Buffer {
    variable: Variable,
    device: Device,
    data: Arc<Mutex<Vec<f32>>>,
}

impl Buffer {
    /// Wrap a fresh engine variable around caller-owned values pinned to
    /// `device`. Used both for a key's aggregation buffer (via `init`)
    /// and for the per-device source/destination buffers callers pass
    /// to `push`/`pull`/`broadcast`.
    pub fn new(engine: &Engine, device: Device, initial: Vec<f32>) -> Buffer {
        Buffer {
            variable: engine.new_variable(),
            device,
            data: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// A point-in-time copy of the buffer's contents. Safe to call at
    /// any time; for a value that's mid-flight through a push/pull,
    /// call `wait_for_var` on `variable()` first if you want to observe
    /// it only once settled.
    pub fn snapshot(&self) -> Vec<f32> {
        self.data.lock().unwrap().clone()
    }
}

struct Entry {
    buffer: Buffer,
    updater: Option<Updater>,
}

/// In-process store for parameters replicated across devices. One
/// `ParamStore` owns its own engine handle (cheap to clone) and routes
/// every `push`/`pull`/`broadcast` through it as ordinary operators, so
/// a `pull` issued right after a `push` on the same key always observes
/// that push's effect — the two are serialised by the buffer's
/// `Variable`, with no explicit barrier needed.
#[derive(Clone)]
pub struct ParamStore {
    engine: Engine,
    comm: CommStrategy,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ParamStore {
    pub fn new(engine: Engine, comm: CommStrategy) -> ParamStore {
        ParamStore { engine, comm, entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Allocate the aggregation buffer for `key`. Pure bookkeeping — no
    /// engine traffic. Under `CommStrategy::Cpu` the buffer always lives
    /// on `Device::Cpu` regardless of `device`; under `CommStrategy::Device`
    /// it lives on `device`.
    pub fn init(&self, key: impl Into<String>, device: Device, initial: Vec<f32>) -> Buffer {
        let buffer_device = match self.comm {
            CommStrategy::Cpu => Device::Cpu,
            CommStrategy::Device => device,
        };
        let buffer = Buffer::new(&self.engine, buffer_device, initial);
        let key = key.into();
        let mut entries = self.entries.lock().unwrap();
        assert!(!entries.contains_key(&key), "parameter {:?} initialised twice", key);
        entries.insert(key, Entry { buffer: buffer.clone(), updater: None });
        buffer
    }

    /// Install (or replace) the updater run after every `push` to this
    /// key.
    pub fn set_updater(&self, key: &str, updater: Updater) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key).unwrap_or_else(|| panic!("parameter {:?} not initialised", key));
        entry.updater = Some(updater);
    }

    pub fn buffer(&self, key: &str) -> Buffer {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .unwrap_or_else(|| panic!("parameter {:?} not initialised", key))
            .buffer
            .clone()
    }

    /// Reduce `sources` (one value per contributing device) into the
    /// key's aggregation buffer, then run the updater if one is
    /// installed. Modelled as a single engine op: write set `{buffer}`,
    /// read set `sources`.
    pub fn push(&self, key: &str, sources: &[Buffer]) {
        let buffer = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(key)
                .unwrap_or_else(|| panic!("parameter {:?} not initialised", key))
                .buffer
                .clone()
        };
        let property = match self.comm {
            CommStrategy::Cpu => FnProperty::FlushToMem,
            CommStrategy::Device => FnProperty::Normal,
        };

        let reads: Vec<Variable> = sources.iter().map(|b| b.variable.clone()).collect();
        let writes = vec![buffer.variable.clone()];
        let width = buffer.data.lock().unwrap().len();
        for s in sources {
            assert_eq!(s.snapshot().len(), width, "parameter {:?}: source width mismatch", key);
        }

        let source_data: Vec<Arc<Mutex<Vec<f32>>>> = sources.iter().map(|b| b.data.clone()).collect();
        let dest_data = buffer.data.clone();
        let entries = self.entries.clone();
        let key = key.to_string();
        let device = buffer.device;

        self.engine.push_sync(reads, writes, device, DEFAULT_PRIORITY, property, move |_ctx| {
            let mut dest = dest_data.lock().unwrap();
            for slot in dest.iter_mut() {
                *slot = 0.0;
            }
            for src in &source_data {
                let src = src.lock().unwrap();
                for (d, s) in dest.iter_mut().zip(src.iter()) {
                    *d += *s;
                }
            }
            if let Some(entry) = entries.lock().unwrap().get(&key) {
                if let Some(updater) = entry.updater.as_ref() {
                    updater(&mut dest);
                }
            }
        });
    }

    /// Broadcast the key's aggregation buffer out to every destination.
    /// Modelled as one engine op per destination (read `{buffer}`, write
    /// `{dest}`), so independent destinations can fan out in parallel.
    pub fn pull(&self, key: &str, dests: &[Buffer]) {
        let buffer = self.buffer(key);
        for dest in dests {
            let property = copy_property(buffer.device, dest.device);
            // A copy lands on whichever end is a GPU (the source for a
            // device-to-host transfer, the destination for host-to-device);
            // `queue_key` resolves `CopyFromGPU`/`CopyToGPU` off this device.
            let transfer_device = if buffer.device.is_gpu() { buffer.device } else { dest.device };
            let src_data = buffer.data.clone();
            let dst_data = dest.data.clone();
            self.engine.push_sync(
                vec![buffer.variable.clone()],
                vec![dest.variable.clone()],
                transfer_device,
                DEFAULT_PRIORITY,
                property,
                move |_ctx| {
                    let src = src_data.lock().unwrap().clone();
                    *dst_data.lock().unwrap() = src;
                },
            );
        }
    }

    /// `push(key, &[source.clone()])` followed by `pull(key, dests)`.
    pub fn broadcast(&self, key: &str, source: &Buffer, dests: &[Buffer]) {
        self.push(key, std::slice::from_ref(source));
        self.pull(key, dests);
    }
}

/// Pick the property tag for a single-source, single-destination copy:
/// a device-to-host read, a host-to-device write, or a same-device
/// (possibly host-to-host) copy if neither end is a GPU transfer away
/// from the other.
fn copy_property(src: Device, dst: Device) -> FnProperty {
    match (src.is_gpu(), dst.is_gpu()) {
        (true, false) => FnProperty::CopyFromGPU,
        (false, true) => FnProperty::CopyToGPU,
        _ => FnProperty::CopyToSameDevice,
    }
}
