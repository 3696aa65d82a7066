pub mod autotune;

pub use autotune::{Autotuner, RoundConfig, RoundStats, TimedProfile, TuningOutcome};
