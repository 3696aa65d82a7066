//! Multi-round benchmark-driven search over the tuning space.
//!
//! Round 0 enumerates the full space; every later round re-times only the
//! profiles retained by the previous round, at its own problem size. Each
//! round keeps the fastest `keep_count` entries. Compile and launch
//! failures drop the candidate and the round continues; device-level
//! failures abort the run.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::backend::{DeviceAdapter, KernelArg};
use crate::core::expr::{ExprTree, ScalarType};
use crate::core::profile::GemmProfile;
use crate::core::tuning::TuningSpace;
use crate::emitter::{emit_gemm, KernelDialect};
use crate::error::TuneError;

/// One stage of the schedule: square problem size and how many of the
/// fastest profiles survive into the next stage.
#[derive(Debug, Clone, Copy)]
pub struct RoundConfig {
    pub problem_size: usize,
    pub keep_count: usize,
}

/// A benchmarked candidate.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimedProfile {
    pub time: Duration,
    pub profile: GemmProfile,
}

impl TimedProfile {
    /// Throughput for the square problem this timing was taken at.
    pub fn gflops(&self, size: usize) -> f64 {
        let s = size as f64 / 1000.0;
        2.0 * s * s * s / self.time.as_secs_f64()
    }
}

/// Per-round bookkeeping, reported alongside the final ranking.
#[derive(Debug, Clone, Serialize)]
pub struct RoundStats {
    pub problem_size: usize,
    /// Candidates the round started from (full space in round 0,
    /// the previous round's survivors afterwards).
    pub candidates: usize,
    pub evaluated: usize,
    pub skipped_invalid: usize,
    pub skipped_failed: usize,
    pub kept: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningOutcome {
    /// Final round's timing table, fastest first.
    pub ranked: Vec<TimedProfile>,
    pub rounds: Vec<RoundStats>,
}

impl TuningOutcome {
    pub fn best(&self) -> Option<&TimedProfile> {
        self.ranked.first()
    }
}

pub struct Autotuner<'a> {
    device: &'a dyn DeviceAdapter,
    tree: ExprTree,
    scalar: ScalarType,
    dialect: KernelDialect,
}

impl<'a> Autotuner<'a> {
    pub fn new(
        device: &'a dyn DeviceAdapter,
        tree: ExprTree,
        scalar: ScalarType,
        dialect: KernelDialect,
    ) -> Self {
        Self { device, tree, scalar, dialect }
    }

    pub fn run(
        &self,
        space: &TuningSpace,
        rounds: &[RoundConfig],
    ) -> Result<TuningOutcome, TuneError> {
        let limits = self.device.limits();
        let elem = self.scalar.size_of();
        let mut retained: Vec<GemmProfile> = Vec::new();
        let mut stats = Vec::new();
        let mut table: Vec<TimedProfile> = Vec::new();

        for (round, rc) in rounds.iter().enumerate() {
            let candidates: Vec<GemmProfile> = if round == 0 {
                space
                    .enumerate()
                    .map(|p| GemmProfile::from_params(&p))
                    .collect::<Result<_, _>>()?
            } else {
                retained.clone()
            };
            eprintln!(
                "[Tuner] round {} at size {}: {} candidates",
                round + 1,
                rc.problem_size,
                candidates.len()
            );

            let n = rc.problem_size;
            let bytes = n * n * elem;
            let dst = self.device.alloc(bytes)?;
            let lhs = self.device.alloc(bytes)?;
            let rhs = self.device.alloc(bytes)?;
            self.device.write(lhs, &random_operand(n * n, self.scalar))?;
            self.device.write(rhs, &random_operand(n * n, self.scalar))?;
            self.device.synchronize()?;

            table.clear();
            let mut skipped_invalid = 0usize;
            let mut skipped_failed = 0usize;

            for profile in &candidates {
                if profile.is_invalid(&limits, elem) {
                    skipped_invalid += 1;
                    continue;
                }
                let source = emit_gemm(&self.tree, profile, self.scalar, self.dialect)?;
                let kernel = match self.device.compile(&source.text, &source.name) {
                    Ok(k) => k,
                    Err(e) if e.is_recoverable() => {
                        eprintln!("[Tuner] skipping candidate ({profile}): {e}");
                        skipped_failed += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let global = source.global_size(n, n);
                let local = source.local_size;
                let args = [
                    KernelArg::Buffer(dst),
                    KernelArg::Buffer(lhs),
                    KernelArg::Buffer(rhs),
                    KernelArg::Uint(n as u32),
                    KernelArg::Uint(n as u32),
                    KernelArg::Uint(n as u32),
                ];

                // One warmup launch, then the timed one.
                let timed = self
                    .device
                    .enqueue(kernel, global, local, &args)
                    .and_then(|ev| self.device.wait(ev))
                    .and_then(|_| self.device.enqueue(kernel, global, local, &args))
                    .and_then(|ev| self.device.wait(ev));
                // The binary is not needed past its measurement; only the
                // profile is carried forward.
                self.device.release(kernel)?;
                match timed {
                    Ok(time) => table.push(TimedProfile { time, profile: *profile }),
                    Err(e) if e.is_recoverable() => {
                        eprintln!("[Tuner] skipping candidate ({profile}): {e}");
                        skipped_failed += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let evaluated = table.len() + skipped_failed;
            // Stable sort: equal times keep evaluation order.
            table.sort_by(|a, b| a.time.cmp(&b.time));
            table.truncate(rc.keep_count);
            retained = table.iter().map(|t| t.profile).collect();
            stats.push(RoundStats {
                problem_size: n,
                candidates: candidates.len(),
                evaluated,
                skipped_invalid,
                skipped_failed,
                kept: retained.len(),
            });
            if let Some(best) = table.first() {
                eprintln!(
                    "[Tuner] round {} best: {:.2} GFLOP/s ({})",
                    round + 1,
                    best.gflops(n),
                    best.profile
                );
            }
        }

        Ok(TuningOutcome { ranked: table, rounds: stats })
    }
}

/// Uniform `[0, 1)` fill for one operand, as raw device bytes.
fn random_operand(count: usize, scalar: ScalarType) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(count * scalar.size_of());
    match scalar {
        ScalarType::F32 => {
            for _ in 0..count {
                out.extend_from_slice(&rng.gen::<f32>().to_le_bytes());
            }
        }
        ScalarType::F64 => {
            for _ in 0..count {
                out.extend_from_slice(&rng.gen::<f64>().to_le_bytes());
            }
        }
    }
    out
}
