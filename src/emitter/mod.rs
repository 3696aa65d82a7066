//! Kernel source generation.
//!
//! One parameterized matrix-product emitter covers all four transpose
//! layouts and both target dialects; the tuning profile only changes
//! constants and staging/load idioms, never the control structure.

pub mod gemm;

pub use gemm::emit_gemm;

/// Source language the generated kernel is written in. The dialect picks
/// qualifiers, builtins and barrier spelling; the algorithm is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDialect {
    OpenCl,
    Cuda,
}

/// A generated kernel plus the launch geometry derived alongside it.
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub name: String,
    pub text: String,
    /// Local-memory footprint the kernel declares, for launch validation.
    pub local_mem_bytes: usize,
    /// Work-group shape: `[ml/ms, nl/ns]`.
    pub local_size: [usize; 2],
    /// Elements computed per work item in each dimension: `[ms, ns]`.
    pub sub_tile: [usize; 2],
}

impl KernelSource {
    /// Global work size for an `m x n` result, in work items.
    pub fn global_size(&self, m: usize, n: usize) -> [usize; 2] {
        [m / self.sub_tile[0], n / self.sub_tile[1]]
    }
}
