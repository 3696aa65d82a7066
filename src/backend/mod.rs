//! Device backend adapters.
//!
//! The tuner talks to a device through the [`DeviceAdapter`] trait: compile
//! a kernel from source, allocate and fill buffers, enqueue a launch, wait
//! for its completion time. Adapters are synchronous; `enqueue` may return
//! before the kernel finishes, `wait` blocks until it has.

pub mod sim;

#[cfg(feature = "cuda")]
pub mod cuda;

use std::time::Duration;

use thiserror::Error;

use crate::core::device::DeviceLimits;

/// Handle to a compiled kernel, valid for the lifetime of its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// Handle to a device allocation, valid for the lifetime of its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// Token returned by `enqueue`, redeemed with `wait` for the launch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchEvent(pub u64);

/// Argument passed to a kernel launch, in declaration order.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg {
    Buffer(BufferId),
    Uint(u32),
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend compiler rejected the generated source. Recoverable:
    /// the driver skips the candidate.
    #[error("kernel compilation failed for '{name}': {log}")]
    Compile { name: String, log: String },

    /// A launch was rejected or faulted. Recoverable like `Compile`.
    #[error("kernel launch failed for '{name}': {reason}")]
    Launch { name: String, reason: String },

    #[error("device allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: usize, reason: String },

    #[error("unknown kernel id {0}")]
    UnknownKernel(u64),

    #[error("unknown buffer id {0}")]
    UnknownBuffer(u64),

    #[error("device lost: {0}")]
    DeviceLost(String),
}

impl BackendError {
    /// Compile and launch failures are per-candidate; the tuning run
    /// continues without that candidate. Everything else is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Compile { .. } | Self::Launch { .. })
    }
}

/// Uniform surface the tuner drives, whatever the device underneath.
pub trait DeviceAdapter {
    fn limits(&self) -> DeviceLimits;

    /// Compiles `source` and resolves the entry point `name`.
    fn compile(&self, source: &str, name: &str) -> Result<KernelId, BackendError>;

    /// Drops a compiled kernel and any device resources backing it. The
    /// tuning driver releases each candidate as soon as its timing is
    /// recorded; only the profile outlives the measurement.
    fn release(&self, kernel: KernelId) -> Result<(), BackendError>;

    fn alloc(&self, bytes: usize) -> Result<BufferId, BackendError>;

    fn write(&self, buffer: BufferId, data: &[u8]) -> Result<(), BackendError>;

    /// Enqueues one launch over `global` items in groups of `local`.
    /// Completion is observed through `wait`.
    fn enqueue(
        &self,
        kernel: KernelId,
        global: [usize; 2],
        local: [usize; 2],
        args: &[KernelArg],
    ) -> Result<LaunchEvent, BackendError>;

    /// Blocks until the launch behind `event` completes and returns its
    /// execution time.
    fn wait(&self, event: LaunchEvent) -> Result<Duration, BackendError>;

    /// Drains all outstanding work on the device.
    fn synchronize(&self) -> Result<(), BackendError>;
}
