use serde::{Deserialize, Serialize};

use crate::core::device::DeviceLimits;
use crate::core::tuning::ParamValues;
use crate::error::TuneError;

/// Register-tile budget per work item used by the validity heuristic.
/// Deliberately conservative; the backend compiler has the final word and
/// rejected kernels are skipped by the driver anyway.
const MAX_REGISTER_TILE: u32 = 256;

/// One point in the tuning search space for the matrix-product kernel.
///
/// `ml/kl/nl` are the block dims processed by one work-group, `ms/ks/ns`
/// the sub-tile handled by one work item. Constructed fresh per candidate
/// and discarded after its timing is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmProfile {
    pub ml: u32,
    pub kl: u32,
    pub nl: u32,
    pub ms: u32,
    pub ks: u32,
    pub ns: u32,
    pub vector_width: u32,
    pub lhs_in_local: bool,
    pub rhs_in_local: bool,
    pub unroll: u32,
}

impl GemmProfile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ml: u32,
        kl: u32,
        nl: u32,
        ms: u32,
        ks: u32,
        ns: u32,
        vector_width: u32,
        lhs_in_local: bool,
        rhs_in_local: bool,
        unroll: u32,
    ) -> Self {
        Self { ml, kl, nl, ms, ks, ns, vector_width, lhs_in_local, rhs_in_local, unroll }
    }

    /// Assembles a profile from the current values of a tuning-parameter
    /// set. Pure data assembly, no device access.
    pub fn from_params(params: &ParamValues) -> Result<Self, TuneError> {
        Ok(Self {
            ml: params.get("ml")?,
            kl: params.get("kl")?,
            nl: params.get("nl")?,
            ms: params.get("ms")?,
            ks: params.get("ks")?,
            ns: params.get("ns")?,
            vector_width: params.get("vector")?,
            lhs_in_local: params.get("lhs_storage")? != 0,
            rhs_in_local: params.get("rhs_storage")? != 0,
            unroll: params.get("unroll")?,
        })
    }

    /// Work items per work-group: `(ml/ms) * (nl/ns)`.
    pub fn work_group_size(&self) -> usize {
        (self.ml / self.ms) as usize * (self.nl / self.ns) as usize
    }

    /// Local-memory footprint of the staged sub-blocks, in bytes.
    pub fn local_mem_bytes(&self, elem_size: usize) -> usize {
        let mut elems = 0usize;
        if self.lhs_in_local {
            elems += (self.ml * self.kl) as usize;
        }
        if self.rhs_in_local {
            elems += (self.kl * self.nl) as usize;
        }
        elems * elem_size
    }

    /// Per-item register-tile estimate: accumulator plus operand fragments.
    fn register_tile(&self) -> u32 {
        self.ms * self.ns + self.ms + self.ns
    }

    /// Cheap feasibility check against device limits, evaluated for every
    /// candidate before the expensive compile-and-run path. True means the
    /// profile must not be emitted.
    pub fn is_invalid(&self, device: &DeviceLimits, elem_size: usize) -> bool {
        if self.ms == 0 || self.ks == 0 || self.ns == 0 || self.vector_width == 0 {
            return true;
        }
        // Block dims must tile evenly into per-item sub-tiles.
        if self.ml % self.ms != 0 || self.kl % self.ks != 0 || self.nl % self.ns != 0 {
            return true;
        }
        // Sub-tile dims must admit vector loads of the configured width.
        if self.ms % self.vector_width != 0 || self.ns % self.vector_width != 0 {
            return true;
        }
        if self.ks > self.kl {
            return true;
        }
        if self.local_mem_bytes(elem_size) > device.local_mem_size {
            return true;
        }
        if self.work_group_size() > device.max_work_group_size {
            return true;
        }
        if self.register_tile() * (elem_size as u32 / 4).max(1) > MAX_REGISTER_TILE {
            return true;
        }
        false
    }
}

impl std::fmt::Display for GemmProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ml={} kl={} nl={} ms={} ks={} ns={} vec={} lhs_local={} rhs_local={} unroll={}",
            self.ml,
            self.kl,
            self.nl,
            self.ms,
            self.ks,
            self.ns,
            self.vector_width,
            self.lhs_in_local as u8,
            self.rhs_in_local as u8,
            self.unroll
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tuning::{StepFn, TuningSpace};

    fn device_16kb() -> DeviceLimits {
        DeviceLimits {
            name: "test".into(),
            local_mem_size: 16 * 1024,
            max_work_group_size: 256,
            max_compute_units: 8,
        }
    }

    #[test]
    fn oversized_staging_is_invalid_on_16kb_device() {
        // 256x256 blocks staged on both sides at 4-byte elements need
        // 2 * 256 * 256 * 4 = 512 KB of local memory.
        let p = GemmProfile::new(256, 256, 256, 4, 4, 4, 1, true, true, 1);
        assert!(p.local_mem_bytes(4) > 16 * 1024);
        assert!(p.is_invalid(&device_16kb(), 4));
    }

    #[test]
    fn valid_profile_fits_device_limits() {
        let dev = device_16kb();
        let p = GemmProfile::new(32, 32, 32, 4, 4, 4, 2, true, false, 1);
        assert!(!p.is_invalid(&dev, 4));
        assert!(p.local_mem_bytes(4) <= dev.local_mem_size);
        assert!(p.work_group_size() <= dev.max_work_group_size);
    }

    #[test]
    fn indivisible_tiles_are_invalid() {
        let dev = device_16kb();
        // nl = 16 not divisible by ns = 3
        let p = GemmProfile::new(16, 16, 16, 4, 4, 3, 1, false, false, 1);
        assert!(p.is_invalid(&dev, 4));
        // ms = 2 not a multiple of vector width 4
        let p = GemmProfile::new(16, 16, 16, 2, 4, 4, 4, false, false, 1);
        assert!(p.is_invalid(&dev, 4));
    }

    #[test]
    fn oversized_work_group_is_invalid() {
        let dev = device_16kb(); // max work-group 256
        let p = GemmProfile::new(64, 16, 64, 2, 2, 2, 1, false, false, 1);
        assert_eq!(p.work_group_size(), 32 * 32);
        assert!(p.is_invalid(&dev, 4));
    }

    #[test]
    fn every_enumerated_valid_profile_respects_limits() {
        let mut space = TuningSpace::new();
        space.add_tuning_param("ml", 16, 64, StepFn::MulByTwo);
        space.add_tuning_param("kl", 16, 64, StepFn::MulByTwo);
        space.add_tuning_param("nl", 16, 64, StepFn::MulByTwo);
        space.add_tuning_param("ms", 2, 8, StepFn::MulByTwo);
        space.add_tuning_param("ks", 2, 8, StepFn::MulByTwo);
        space.add_tuning_param("ns", 2, 8, StepFn::MulByTwo);
        space.add_tuning_param("vector", 1, 4, StepFn::MulByTwo);
        space.add_tuning_param("lhs_storage", 0, 1, StepFn::AddOne);
        space.add_tuning_param("rhs_storage", 0, 1, StepFn::AddOne);
        space.add_tuning_param("unroll", 1, 1, StepFn::MulByTwo);

        let dev = device_16kb();
        let mut saw_valid = false;
        for point in space.enumerate() {
            let p = GemmProfile::from_params(&point).unwrap();
            if !p.is_invalid(&dev, 4) {
                saw_valid = true;
                assert!(p.local_mem_bytes(4) <= dev.local_mem_size);
                assert!(p.work_group_size() <= dev.max_work_group_size);
                assert_eq!(p.ml % p.ms, 0);
                assert_eq!(p.kl % p.ks, 0);
                assert_eq!(p.nl % p.ns, 0);
            }
        }
        assert!(saw_valid);
    }
}
