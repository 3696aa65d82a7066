//! In-process device adapter with an analytic performance model.
//!
//! Lets the tuning loop run end to end without a physical GPU: compilation
//! stores the source, launches are costed from the problem size and a
//! deterministic per-kernel rate derived from the source text. Tests use
//! the compile-failure hook to exercise the skip path.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{
    BackendError, BufferId, DeviceAdapter, KernelArg, KernelId, LaunchEvent,
};
use crate::core::device::DeviceLimits;

type CompileHook = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct SimState {
    next_id: u64,
    kernels: HashMap<u64, String>,
    buffers: HashMap<u64, usize>,
    events: HashMap<u64, Duration>,
    compiles: usize,
    launches: usize,
}

pub struct SimulatedDevice {
    limits: DeviceLimits,
    state: Mutex<SimState>,
    /// Returns true if compilation of the given source should fail.
    fail_compile: Option<CompileHook>,
}

impl SimulatedDevice {
    pub fn new(limits: DeviceLimits) -> Self {
        Self { limits, state: Mutex::new(SimState::default()), fail_compile: None }
    }

    /// Device with the conservative reference limits; the default test rig.
    pub fn reference() -> Self {
        Self::new(DeviceLimits::reference_cl())
    }

    /// Installs a predicate that fails compilation for matching sources.
    pub fn with_compile_failure<F>(mut self, pred: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.fail_compile = Some(Box::new(pred));
        self
    }

    pub fn compile_count(&self) -> usize {
        self.state.lock().map(|s| s.compiles).unwrap_or(0)
    }

    /// Kernels compiled but not yet released.
    pub fn resident_kernels(&self) -> usize {
        self.state.lock().map(|s| s.kernels.len()).unwrap_or(0)
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().map(|s| s.launches).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::DeviceLost("simulator state poisoned".to_string()))
    }

    /// Deterministic effective rate in FLOP/s for one kernel. Perturbed by
    /// the source hash so different candidates rank differently and reruns
    /// reproduce the same ordering.
    fn rate_for(source: &str) -> f64 {
        let mut h = DefaultHasher::new();
        source.hash(&mut h);
        let jitter = (h.finish() % 1000) as f64 / 1000.0;
        const BASE_FLOPS: f64 = 2.0e11;
        BASE_FLOPS * (0.25 + 0.75 * jitter)
    }
}

impl DeviceAdapter for SimulatedDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn compile(&self, source: &str, name: &str) -> Result<KernelId, BackendError> {
        if let Some(pred) = &self.fail_compile {
            if pred(source) {
                return Err(BackendError::Compile {
                    name: name.to_string(),
                    log: "simulated compiler rejection".to_string(),
                });
            }
        }
        let mut state = self.lock()?;
        state.next_id += 1;
        state.compiles += 1;
        let id = state.next_id;
        state.kernels.insert(id, source.to_string());
        Ok(KernelId(id))
    }

    fn release(&self, kernel: KernelId) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        state
            .kernels
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or(BackendError::UnknownKernel(kernel.0))
    }

    fn alloc(&self, bytes: usize) -> Result<BufferId, BackendError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.buffers.insert(id, bytes);
        Ok(BufferId(id))
    }

    fn write(&self, buffer: BufferId, data: &[u8]) -> Result<(), BackendError> {
        let state = self.lock()?;
        match state.buffers.get(&buffer.0) {
            Some(&bytes) if data.len() <= bytes => Ok(()),
            Some(&bytes) => Err(BackendError::Allocation {
                bytes: data.len(),
                reason: format!("write exceeds allocation of {bytes} bytes"),
            }),
            None => Err(BackendError::UnknownBuffer(buffer.0)),
        }
    }

    fn enqueue(
        &self,
        kernel: KernelId,
        _global: [usize; 2],
        _local: [usize; 2],
        args: &[KernelArg],
    ) -> Result<LaunchEvent, BackendError> {
        let mut state = self.lock()?;
        let source = state
            .kernels
            .get(&kernel.0)
            .cloned()
            .ok_or(BackendError::UnknownKernel(kernel.0))?;
        for arg in args {
            if let KernelArg::Buffer(b) = arg {
                if !state.buffers.contains_key(&b.0) {
                    return Err(BackendError::UnknownBuffer(b.0));
                }
            }
        }
        // Scalar args carry the problem dims M, N, K in order.
        let dims: Vec<u64> = args
            .iter()
            .filter_map(|a| match a {
                KernelArg::Uint(v) => Some(*v as u64),
                _ => None,
            })
            .collect();
        let (m, n, k) = match dims.as_slice() {
            [m, n, k, ..] => (*m, *n, *k),
            _ => {
                return Err(BackendError::Launch {
                    name: format!("kernel#{}", kernel.0),
                    reason: "expected M, N, K scalar arguments".to_string(),
                })
            }
        };
        let flops = 2.0 * m as f64 * n as f64 * k as f64;
        let secs = flops / Self::rate_for(&source);
        state.next_id += 1;
        state.launches += 1;
        let id = state.next_id;
        state.events.insert(id, Duration::from_secs_f64(secs));
        Ok(LaunchEvent(id))
    }

    fn wait(&self, event: LaunchEvent) -> Result<Duration, BackendError> {
        let mut state = self.lock()?;
        state
            .events
            .remove(&event.0)
            .ok_or_else(|| BackendError::Launch {
                name: format!("event#{}", event.0),
                reason: "no such pending launch".to_string(),
            })
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        state.events.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_time_is_deterministic_for_same_source_and_size() {
        let dev = SimulatedDevice::reference();
        let k = dev.compile("__kernel void gemm() {}", "gemm").unwrap();
        let args = [KernelArg::Uint(512), KernelArg::Uint(512), KernelArg::Uint(512)];
        let e1 = dev.enqueue(k, [512, 512], [16, 16], &args).unwrap();
        let t1 = dev.wait(e1).unwrap();
        let e2 = dev.enqueue(k, [512, 512], [16, 16], &args).unwrap();
        let t2 = dev.wait(e2).unwrap();
        assert_eq!(t1, t2);
        assert!(t1 > Duration::ZERO);
    }

    #[test]
    fn compile_hook_fails_matching_sources() {
        let dev = SimulatedDevice::reference()
            .with_compile_failure(|src| src.contains("poison"));
        assert!(dev.compile("kernel with poison marker", "k").is_err());
        assert!(dev.compile("clean kernel", "k").is_ok());
        // Rejected sources never reach the compiled-kernel table.
        assert_eq!(dev.compile_count(), 1);
    }

    #[test]
    fn released_kernels_are_gone() {
        let dev = SimulatedDevice::reference();
        let k = dev.compile("__kernel void gemm() {}", "gemm").unwrap();
        assert_eq!(dev.resident_kernels(), 1);
        dev.release(k).unwrap();
        assert_eq!(dev.resident_kernels(), 0);
        let args = [KernelArg::Uint(64), KernelArg::Uint(64), KernelArg::Uint(64)];
        assert!(matches!(
            dev.enqueue(k, [64, 64], [16, 16], &args),
            Err(BackendError::UnknownKernel(_))
        ));
        assert!(dev.release(k).is_err());
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let dev = SimulatedDevice::reference();
        let err = dev
            .enqueue(KernelId(99), [1, 1], [1, 1], &[KernelArg::Uint(1)])
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownKernel(99)));
        assert!(matches!(dev.write(BufferId(7), &[0u8; 4]), Err(BackendError::UnknownBuffer(7))));
    }

    #[test]
    fn larger_problems_take_longer() {
        let dev = SimulatedDevice::reference();
        let k = dev.compile("__kernel void gemm() {}", "gemm").unwrap();
        let small = [KernelArg::Uint(256), KernelArg::Uint(256), KernelArg::Uint(256)];
        let big = [KernelArg::Uint(2048), KernelArg::Uint(2048), KernelArg::Uint(2048)];
        let ts = dev.wait(dev.enqueue(k, [256, 256], [16, 16], &small).unwrap()).unwrap();
        let tb = dev.wait(dev.enqueue(k, [2048, 2048], [16, 16], &big).unwrap()).unwrap();
        assert!(tb > ts);
        assert_eq!(dev.launch_count(), 2);
    }
}
