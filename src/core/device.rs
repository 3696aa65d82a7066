use serde::{Deserialize, Serialize};

/// Capability limits of one compute device, as reported by the backend
/// adapter. Everything the validity predicate needs, nothing more.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLimits {
    pub name: String,
    /// Local (shared/threadgroup) memory available to one work-group, bytes.
    pub local_mem_size: usize,
    pub max_work_group_size: usize,
    pub max_compute_units: u32,
}

impl DeviceLimits {
    pub fn rtx3070() -> Self {
        Self {
            name: "NVIDIA GeForce RTX 3070".to_string(),
            local_mem_size: 48 * 1024,
            max_work_group_size: 1024,
            max_compute_units: 46,
        }
    }

    /// A conservative profile typical of older OpenCL devices.
    pub fn reference_cl() -> Self {
        Self {
            name: "Reference OpenCL Device".to_string(),
            local_mem_size: 16 * 1024,
            max_work_group_size: 256,
            max_compute_units: 16,
        }
    }
}

impl std::fmt::Display for DeviceLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (local mem {} KB, max work-group {}, {} CUs)",
            self.name,
            self.local_mem_size / 1024,
            self.max_work_group_size,
            self.max_compute_units
        )
    }
}
