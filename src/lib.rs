//! Autotuning kernel-source generator for dense matrix-matrix products.
//!
//! The pipeline: build a symbolic `dst = prod(lhs, rhs)` statement, sweep
//! a declared tuning space, lower each feasible profile to kernel source,
//! and benchmark the candidates on a device adapter over a multi-round
//! schedule that narrows the field at growing problem sizes.

pub mod backend;
pub mod core;
pub mod emitter;
pub mod error;
pub mod optimizer;

pub use crate::core::device::DeviceLimits;
pub use crate::core::expr::{ExprBuilder, ExprTree, GemmVariant, ScalarType};
pub use crate::core::profile::GemmProfile;
pub use crate::core::tuning::{StepFn, TuningSpace};
pub use crate::emitter::{emit_gemm, KernelDialect, KernelSource};
pub use crate::error::TuneError;
pub use crate::optimizer::{Autotuner, RoundConfig, TuningOutcome};
