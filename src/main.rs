use std::env;
use std::fs::File;
use std::io::Write;

use chrono::Local;
use serde_json::json;

use gemmforge::backend::sim::SimulatedDevice;
use gemmforge::backend::DeviceAdapter;
use gemmforge::{
    Autotuner, DeviceLimits, ExprTree, GemmVariant, KernelDialect, RoundConfig, ScalarType,
    StepFn, TuneError, TuningSpace,
};

fn main() {
    if let Err(e) = run() {
        eprintln!("[Tuner] fatal: {e}");
        std::process::exit(1);
    }
}

struct CliArgs {
    device_index: usize,
    variant: GemmVariant,
    scalar: ScalarType,
    output_file: String,
}

fn parse_args(args: &[String]) -> Result<CliArgs, TuneError> {
    if args.len() < 4 {
        return Err(TuneError::Configuration("missing arguments".to_string()));
    }
    let device_index: usize = args[1]
        .parse()
        .map_err(|_| TuneError::Configuration(format!("bad device index '{}'", args[1])))?;
    let layout: u32 = args[2]
        .parse()
        .map_err(|_| TuneError::Configuration(format!("bad layout '{}'", args[2])))?;
    let variant = GemmVariant::from_layout(layout)?;
    let scalar = ScalarType::parse(&args[3])?;
    // The only accepted tail is a complete `--out <file>` pair.
    let output_file = match &args[4..] {
        [] => "tuning_report.json".to_string(),
        [flag, file] if flag == "--out" => file.clone(),
        rest => {
            return Err(TuneError::Configuration(format!(
                "unexpected arguments: {}",
                rest.join(" ")
            )))
        }
    };
    Ok(CliArgs { device_index, variant, scalar, output_file })
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let parsed = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("[Tuner] {e}");
            eprintln!("Usage: gemmforge <device_index> <layout> <scalar_type> [--out <file>]");
            eprintln!("  layout:      0 = AA, 1 = TA, 2 = AT, 3 = TT");
            eprintln!("  scalar_type: float | double");
            std::process::exit(1);
        }
    };
    let CliArgs { device_index, variant, scalar, output_file } = parsed;
    let (device, dialect) = select_device(device_index);
    println!("Tuning {variant} matrix product ({scalar}) on {}", device.limits());

    let tree = ExprTree::gemm(variant.lhs_transposed(), variant.rhs_transposed());
    let space = default_space();
    println!("Search space: {} candidates", space.cardinality());

    let rounds = [
        RoundConfig { problem_size: 512, keep_count: 70 },
        RoundConfig { problem_size: 4096, keep_count: 20 },
    ];
    let final_size = rounds[rounds.len() - 1].problem_size;

    let tuner = Autotuner::new(device.as_ref(), tree, scalar, dialect);
    let outcome = tuner.run(&space, &rounds)?;

    println!();
    for (i, t) in outcome.ranked.iter().enumerate() {
        println!("{:>3}. {:>9.2} GFLOP/s  {}", i + 1, t.gflops(final_size), t.profile);
    }
    match outcome.best() {
        Some(best) => {
            println!();
            println!("Best: {} ({:.2} GFLOP/s)", best.profile, best.gflops(final_size));
        }
        None => println!("No candidate survived tuning."),
    }

    let report = json!({
        "timestamp": Local::now().to_rfc3339(),
        "device": device.limits().name,
        "variant": variant.to_string(),
        "scalar": scalar.to_string(),
        "rounds": outcome.rounds,
        "ranked": outcome.ranked,
    });
    let mut file = File::create(&output_file)?;
    file.write_all(serde_json::to_string_pretty(&report)?.as_bytes())?;
    println!("Report saved to {output_file}");

    Ok(())
}

/// The default search space for square matrix products.
fn default_space() -> TuningSpace {
    let mut space = TuningSpace::new();
    space.add_tuning_param("ml", 16, 256, StepFn::MulByTwo);
    space.add_tuning_param("kl", 16, 256, StepFn::MulByTwo);
    space.add_tuning_param("nl", 16, 256, StepFn::MulByTwo);
    space.add_tuning_param("ms", 2, 16, StepFn::MulByTwo);
    space.add_tuning_param("ks", 2, 16, StepFn::MulByTwo);
    space.add_tuning_param("ns", 2, 16, StepFn::MulByTwo);
    space.add_tuning_param("vector", 1, 4, StepFn::MulByTwo);
    space.add_tuning_param("lhs_storage", 1, 1, StepFn::AddOne);
    space.add_tuning_param("rhs_storage", 0, 0, StepFn::AddOne);
    space.add_tuning_param("unroll", 1, 1, StepFn::MulByTwo);
    space
}

#[cfg(feature = "cuda")]
fn select_device(index: usize) -> (Box<dyn DeviceAdapter>, KernelDialect) {
    match gemmforge::backend::cuda::CudaAdapter::new(index) {
        Ok(dev) => (Box::new(dev), KernelDialect::Cuda),
        Err(e) => {
            eprintln!("[Tuner] CUDA device {index} unavailable ({e}); using simulator");
            (
                Box::new(SimulatedDevice::new(DeviceLimits::rtx3070())),
                KernelDialect::OpenCl,
            )
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn select_device(index: usize) -> (Box<dyn DeviceAdapter>, KernelDialect) {
    if index != 0 {
        eprintln!("[Tuner] device {index} not available in this build; using simulator");
    } else {
        eprintln!("[Tuner] built without a device backend; using simulator");
    }
    (
        Box::new(SimulatedDevice::new(DeviceLimits::rtx3070())),
        KernelDialect::OpenCl,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn well_formed_arguments_parse() {
        let parsed = parse_args(&argv(&["gemmforge", "0", "3", "double"])).unwrap();
        assert_eq!(parsed.device_index, 0);
        assert_eq!(parsed.variant, GemmVariant::TT);
        assert_eq!(parsed.scalar, ScalarType::F64);
        assert_eq!(parsed.output_file, "tuning_report.json");

        let parsed =
            parse_args(&argv(&["gemmforge", "1", "0", "float", "--out", "r.json"])).unwrap();
        assert_eq!(parsed.output_file, "r.json");
    }

    #[test]
    fn malformed_trailing_arguments_are_rejected() {
        // --out without a file
        assert!(parse_args(&argv(&["gemmforge", "0", "0", "float", "--out"])).is_err());
        // misspelled flag
        assert!(parse_args(&argv(&["gemmforge", "0", "0", "float", "--output", "r.json"]))
            .is_err());
        // trailing garbage after a valid pair
        assert!(parse_args(&argv(&["gemmforge", "0", "0", "float", "--out", "r.json", "x"]))
            .is_err());
    }

    #[test]
    fn missing_or_bad_positional_arguments_are_rejected() {
        assert!(parse_args(&argv(&["gemmforge", "0", "0"])).is_err());
        assert!(parse_args(&argv(&["gemmforge", "zero", "0", "float"])).is_err());
        assert!(parse_args(&argv(&["gemmforge", "0", "7", "float"])).is_err());
        assert!(parse_args(&argv(&["gemmforge", "0", "0", "f16"])).is_err());
    }
}
