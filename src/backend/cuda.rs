//! CUDA adapter: NVRTC compilation plus wall-clock launch timing.
//!
//! Modules are loaded through the driver API so each candidate's binary
//! can be unloaded again as soon as the tuner releases it; a tuning round
//! compiles thousands of kernels and must not keep them resident.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cudarc::driver::sys::{self, CUresult};
use cudarc::driver::{CudaDevice, CudaSlice, DevicePtr};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use crate::backend::{
    BackendError, BufferId, DeviceAdapter, KernelArg, KernelId, LaunchEvent,
};
use crate::core::device::DeviceLimits;

/// Owned driver-API module; unloaded on drop.
struct CudaModule(sys::CUmodule);

impl Drop for CudaModule {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                let res = sys::lib().cuModuleUnload(self.0);
                if res != CUresult::CUDA_SUCCESS {
                    eprintln!("[Tuner] failed to unload CUDA module: {res:?}");
                }
            }
        }
    }
}

unsafe impl Send for CudaModule {}
unsafe impl Sync for CudaModule {}

struct CompiledKernel {
    func: sys::CUfunction,
    _module: CudaModule,
}

unsafe impl Send for CompiledKernel {}
unsafe impl Sync for CompiledKernel {}

struct CudaState {
    next_id: u64,
    kernels: HashMap<u64, CompiledKernel>,
    buffers: HashMap<u64, CudaSlice<u8>>,
    /// Host-side launch start per outstanding event; resolved by `wait`
    /// through a device synchronize.
    events: HashMap<u64, Instant>,
}

pub struct CudaAdapter {
    dev: Arc<CudaDevice>,
    /// NVRTC target arch; leaked once at construction, reused for every
    /// candidate compile.
    arch: &'static str,
    limits: DeviceLimits,
    state: Mutex<CudaState>,
}

impl CudaAdapter {
    pub fn new(ordinal: usize) -> Result<Self, BackendError> {
        let dev = CudaDevice::new(ordinal)
            .map_err(|e| BackendError::DeviceLost(format!("cuda init failed: {e}")))?;
        use cudarc::driver::sys::CUdevice_attribute as Attr;
        let major = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(6);
        let local_mem = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)
            .unwrap_or(48 * 1024) as usize;
        let max_wg = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)
            .unwrap_or(1024) as usize;
        let cus = dev
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .unwrap_or(1) as u32;
        let limits = DeviceLimits {
            name: dev.name().unwrap_or_else(|_| "CUDA device".to_string()),
            local_mem_size: local_mem,
            max_work_group_size: max_wg,
            max_compute_units: cus,
        };
        let arch: &'static str =
            Box::leak(format!("compute_{major}{minor}").into_boxed_str());
        Ok(Self {
            dev,
            arch,
            limits,
            state: Mutex::new(CudaState {
                next_id: 0,
                kernels: HashMap::new(),
                buffers: HashMap::new(),
                events: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CudaState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::DeviceLost("adapter state poisoned".to_string()))
    }
}

impl DeviceAdapter for CudaAdapter {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn compile(&self, source: &str, name: &str) -> Result<KernelId, BackendError> {
        let compile_err = |log: String| BackendError::Compile {
            name: name.to_string(),
            log,
        };
        let opts = CompileOptions {
            arch: Some(self.arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(source, opts).map_err(|e| compile_err(e.to_string()))?;
        let ptx_src =
            CString::new(ptx.to_src()).map_err(|e| compile_err(format!("bad ptx text: {e}")))?;
        let name_c =
            CString::new(name).map_err(|e| compile_err(format!("bad kernel name: {e}")))?;

        let module;
        let mut func: sys::CUfunction = std::ptr::null_mut();
        unsafe {
            let lib = sys::lib();
            let mut raw: sys::CUmodule = std::ptr::null_mut();
            let res = lib.cuModuleLoadData(&mut raw, ptx_src.as_ptr() as *const _);
            if res != CUresult::CUDA_SUCCESS {
                return Err(compile_err(format!("cuModuleLoadData failed: {res:?}")));
            }
            module = CudaModule(raw);
            let res = lib.cuModuleGetFunction(&mut func, module.0, name_c.as_ptr());
            if res != CUresult::CUDA_SUCCESS {
                return Err(compile_err(format!("cuModuleGetFunction failed: {res:?}")));
            }
        }

        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.kernels.insert(id, CompiledKernel { func, _module: module });
        Ok(KernelId(id))
    }

    fn release(&self, kernel: KernelId) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        // Dropping the entry unloads the module.
        state
            .kernels
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or(BackendError::UnknownKernel(kernel.0))
    }

    fn alloc(&self, bytes: usize) -> Result<BufferId, BackendError> {
        let slice = self
            .dev
            .alloc_zeros::<u8>(bytes)
            .map_err(|e| BackendError::Allocation { bytes, reason: e.to_string() })?;
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.buffers.insert(id, slice);
        Ok(BufferId(id))
    }

    fn write(&self, buffer: BufferId, data: &[u8]) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        let slice = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::UnknownBuffer(buffer.0))?;
        self.dev
            .htod_sync_copy_into(data, slice)
            .map_err(|e| BackendError::Allocation { bytes: data.len(), reason: e.to_string() })
    }

    fn enqueue(
        &self,
        kernel: KernelId,
        global: [usize; 2],
        local: [usize; 2],
        args: &[KernelArg],
    ) -> Result<LaunchEvent, BackendError> {
        let mut state = self.lock()?;
        let func = state
            .kernels
            .get(&kernel.0)
            .map(|k| k.func)
            .ok_or(BackendError::UnknownKernel(kernel.0))?;
        let launch_err = |reason: String| BackendError::Launch {
            name: format!("kernel#{}", kernel.0),
            reason,
        };

        // Kernel parameters are passed as pointers into a stable store of
        // 64-bit slots; a 32-bit scalar reads the low half.
        let mut arg_store: Vec<u64> = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                KernelArg::Buffer(b) => {
                    let slice = state
                        .buffers
                        .get(&b.0)
                        .ok_or(BackendError::UnknownBuffer(b.0))?;
                    arg_store.push(*slice.device_ptr());
                }
                KernelArg::Uint(v) => arg_store.push(*v as u64),
            }
        }
        let mut params: Vec<*mut c_void> = arg_store
            .iter_mut()
            .map(|slot| slot as *mut u64 as *mut c_void)
            .collect();

        let grid = (
            (global[0] / local[0]) as u32,
            (global[1] / local[1]) as u32,
            1u32,
        );
        let block = (local[0] as u32, local[1] as u32, 1u32);

        let start = Instant::now();
        unsafe {
            let res = sys::lib().cuLaunchKernel(
                func,
                grid.0,
                grid.1,
                grid.2,
                block.0,
                block.1,
                block.2,
                0,
                std::ptr::null_mut(),
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            );
            if res != CUresult::CUDA_SUCCESS {
                return Err(launch_err(format!("cuLaunchKernel failed: {res:?}")));
            }
        }
        state.next_id += 1;
        let id = state.next_id;
        state.events.insert(id, start);
        Ok(LaunchEvent(id))
    }

    fn wait(&self, event: LaunchEvent) -> Result<Duration, BackendError> {
        let start = {
            let mut state = self.lock()?;
            state.events.remove(&event.0).ok_or_else(|| BackendError::Launch {
                name: format!("event#{}", event.0),
                reason: "no such pending launch".to_string(),
            })?
        };
        self.dev
            .synchronize()
            .map_err(|e| BackendError::DeviceLost(e.to_string()))?;
        Ok(start.elapsed())
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        self.dev
            .synchronize()
            .map_err(|e| BackendError::DeviceLost(e.to_string()))
    }
}
