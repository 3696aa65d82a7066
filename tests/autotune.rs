//! End-to-end tuning runs against the simulated device.

use gemmforge::backend::sim::SimulatedDevice;
use gemmforge::backend::DeviceAdapter;
use gemmforge::{
    Autotuner, DeviceLimits, ExprTree, KernelDialect, RoundConfig, ScalarType, StepFn,
    TuningSpace,
};

fn small_space() -> TuningSpace {
    let mut space = TuningSpace::new();
    space.add_tuning_param("ml", 16, 32, StepFn::MulByTwo);
    space.add_tuning_param("kl", 16, 32, StepFn::MulByTwo);
    space.add_tuning_param("nl", 16, 32, StepFn::MulByTwo);
    space.add_tuning_param("ms", 2, 4, StepFn::MulByTwo);
    space.add_tuning_param("ks", 2, 4, StepFn::MulByTwo);
    space.add_tuning_param("ns", 2, 4, StepFn::MulByTwo);
    space.add_tuning_param("vector", 1, 1, StepFn::MulByTwo);
    space.add_tuning_param("lhs_storage", 1, 1, StepFn::AddOne);
    space.add_tuning_param("rhs_storage", 0, 0, StepFn::AddOne);
    space.add_tuning_param("unroll", 1, 1, StepFn::MulByTwo);
    space
}

fn gemm_tree() -> ExprTree {
    ExprTree::gemm(false, false)
}

#[test]
fn later_rounds_retime_only_the_survivors() {
    let device = SimulatedDevice::reference();
    let tuner = Autotuner::new(&device, gemm_tree(), ScalarType::F32, KernelDialect::OpenCl);
    let space = small_space();
    let rounds = [
        RoundConfig { problem_size: 64, keep_count: 5 },
        RoundConfig { problem_size: 128, keep_count: 3 },
    ];
    let outcome = tuner.run(&space, &rounds).unwrap();

    assert_eq!(outcome.rounds.len(), 2);
    assert_eq!(outcome.rounds[0].candidates, space.cardinality());
    assert_eq!(outcome.rounds[0].kept, 5);
    // Round 2 starts from round 1's survivors, never the full space.
    assert_eq!(outcome.rounds[1].candidates, outcome.rounds[0].kept);
    assert_eq!(outcome.ranked.len(), 3);
}

#[test]
fn timing_table_is_sorted_fastest_first() {
    let device = SimulatedDevice::reference();
    let tuner = Autotuner::new(&device, gemm_tree(), ScalarType::F32, KernelDialect::OpenCl);
    let rounds = [RoundConfig { problem_size: 64, keep_count: 10 }];
    let outcome = tuner.run(&small_space(), &rounds).unwrap();

    assert!(!outcome.ranked.is_empty());
    assert!(outcome.ranked.windows(2).all(|w| w[0].time <= w[1].time));
    assert_eq!(
        outcome.best().unwrap().time,
        outcome.ranked[0].time
    );
}

#[test]
fn compile_failures_skip_the_candidate_without_aborting() {
    // Every source carries a banner with its block shape; poisoning one
    // shape knocks out exactly that family of candidates.
    let device = SimulatedDevice::reference()
        .with_compile_failure(|src| src.contains("32x32x32 block, 4x4 per item"));
    let tuner = Autotuner::new(&device, gemm_tree(), ScalarType::F32, KernelDialect::OpenCl);
    let rounds = [RoundConfig { problem_size: 64, keep_count: 100 }];
    let outcome = tuner.run(&small_space(), &rounds).unwrap();

    assert!(outcome.rounds[0].skipped_failed > 0);
    for t in &outcome.ranked {
        let p = t.profile;
        assert!(!(p.ml == 32 && p.kl == 32 && p.nl == 32 && p.ms == 4 && p.ns == 4));
    }
    // The rest of the space still made it into the table.
    assert!(!outcome.ranked.is_empty());
}

#[test]
fn infeasible_candidates_are_never_benchmarked() {
    // 2 KB of local memory invalidates every 32-wide staged block.
    let device = SimulatedDevice::new(DeviceLimits {
        name: "tiny".into(),
        local_mem_size: 2 * 1024,
        max_work_group_size: 256,
        max_compute_units: 4,
    });
    let tuner = Autotuner::new(&device, gemm_tree(), ScalarType::F32, KernelDialect::OpenCl);
    let rounds = [RoundConfig { problem_size: 64, keep_count: 100 }];
    let outcome = tuner.run(&small_space(), &rounds).unwrap();

    assert!(outcome.rounds[0].skipped_invalid > 0);
    let limits = device.limits();
    for t in &outcome.ranked {
        assert!(!t.profile.is_invalid(&limits, 4));
        assert!(t.profile.local_mem_bytes(4) <= limits.local_mem_size);
    }
    assert_eq!(
        outcome.rounds[0].evaluated + outcome.rounds[0].skipped_invalid,
        outcome.rounds[0].candidates
    );
}

#[test]
fn compiled_kernels_are_released_after_timing() {
    let device = SimulatedDevice::reference();
    let tuner = Autotuner::new(&device, gemm_tree(), ScalarType::F32, KernelDialect::OpenCl);
    let rounds = [
        RoundConfig { problem_size: 64, keep_count: 8 },
        RoundConfig { problem_size: 128, keep_count: 4 },
    ];
    let outcome = tuner.run(&small_space(), &rounds).unwrap();

    assert!(!outcome.ranked.is_empty());
    assert!(device.compile_count() > 0);
    // Every candidate's binary is dropped once its time is recorded.
    assert_eq!(device.resident_kernels(), 0);
}

#[test]
fn tuning_runs_are_reproducible() {
    let rounds = [
        RoundConfig { problem_size: 64, keep_count: 8 },
        RoundConfig { problem_size: 128, keep_count: 4 },
    ];
    let run = || {
        let device = SimulatedDevice::reference();
        let tuner =
            Autotuner::new(&device, gemm_tree(), ScalarType::F32, KernelDialect::OpenCl);
        tuner.run(&small_space(), &rounds).unwrap()
    };
    let a = run();
    let b = run();
    let pa: Vec<gemmforge::GemmProfile> = a.ranked.iter().map(|t| t.profile).collect();
    let pb: Vec<gemmforge::GemmProfile> = b.ranked.iter().map(|t| t.profile).collect();
    assert_eq!(pa, pb);
}

#[test]
fn transposed_layouts_tune_end_to_end() {
    for (lhs_t, rhs_t) in [(false, true), (true, false), (true, true)] {
        let device = SimulatedDevice::reference();
        let tree = ExprTree::gemm(lhs_t, rhs_t);
        let tuner = Autotuner::new(&device, tree, ScalarType::F64, KernelDialect::OpenCl);
        let rounds = [RoundConfig { problem_size: 64, keep_count: 4 }];
        let outcome = tuner.run(&small_space(), &rounds).unwrap();
        assert!(!outcome.ranked.is_empty());
    }
}
