//! Declarative description of the tuning search space.
//!
//! Each axis is a named integer range walked by a step function. The full
//! space is the cartesian product of all registered axes, enumerated in
//! registration order (first axis outermost, so it changes slowest).

use crate::error::TuneError;

/// Step function applied repeatedly to walk an axis from `min` to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFn {
    /// Geometric sweep: 16 -> 32 -> 64 -> ...
    MulByTwo,
    /// Linear sweep, used for binary / near-constant flags.
    AddOne,
}

impl StepFn {
    pub fn apply(self, value: u32) -> u32 {
        match self {
            Self::MulByTwo => value.saturating_mul(2),
            Self::AddOne => value + 1,
        }
    }
}

/// One axis of the search space.
#[derive(Debug, Clone)]
pub struct TuningParam {
    pub name: &'static str,
    pub min: u32,
    pub max: u32,
    pub step: StepFn,
}

impl TuningParam {
    /// All values on this axis, min..=max by repeated stepping. The step
    /// functions are strictly increasing on positive values, so this always
    /// terminates.
    pub fn values(&self) -> Vec<u32> {
        let mut out = Vec::new();
        let mut v = self.min;
        while v <= self.max {
            out.push(v);
            let next = self.step.apply(v);
            if next <= v {
                break; // guards min = 0 with MulByTwo
            }
            v = next;
        }
        out
    }
}

/// A concrete point in the space: `(name, value)` pairs in axis
/// registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamValues {
    values: Vec<(&'static str, u32)>,
}

impl ParamValues {
    pub fn get(&self, name: &str) -> Result<u32, TuneError> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| TuneError::Configuration(format!("missing tuning parameter '{name}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        self.values.iter().copied()
    }
}

/// The declared search space for one kernel family.
#[derive(Debug, Clone, Default)]
pub struct TuningSpace {
    params: Vec<TuningParam>,
}

impl TuningSpace {
    pub fn new() -> Self {
        Self { params: Vec::new() }
    }

    pub fn add_tuning_param(&mut self, name: &'static str, min: u32, max: u32, step: StepFn) {
        self.params.push(TuningParam { name, min, max, step });
    }

    pub fn params(&self) -> &[TuningParam] {
        &self.params
    }

    /// Number of points in the full-factorial sweep.
    pub fn cardinality(&self) -> usize {
        self.params.iter().map(|p| p.values().len()).product()
    }

    /// Full-factorial enumeration. Axis 0 (first registered) is the
    /// outermost loop; the last registered axis cycles fastest.
    pub fn enumerate(&self) -> SpaceIter<'_> {
        let axes: Vec<Vec<u32>> = self.params.iter().map(|p| p.values()).collect();
        let done = axes.iter().any(|a| a.is_empty());
        SpaceIter {
            space: self,
            cursor: vec![0; axes.len()],
            axes,
            done,
        }
    }
}

/// Odometer iterator over the cartesian product of all axes.
pub struct SpaceIter<'a> {
    space: &'a TuningSpace,
    axes: Vec<Vec<u32>>,
    cursor: Vec<usize>,
    done: bool,
}

impl Iterator for SpaceIter<'_> {
    type Item = ParamValues;

    fn next(&mut self) -> Option<ParamValues> {
        if self.done {
            return None;
        }
        let values = self
            .space
            .params
            .iter()
            .zip(self.axes.iter().zip(self.cursor.iter()))
            .map(|(p, (axis, &i))| (p.name, axis[i]))
            .collect();

        // Advance the odometer, last axis fastest.
        let mut i = self.cursor.len();
        loop {
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
            self.cursor[i] += 1;
            if self.cursor[i] < self.axes[i].len() {
                break;
            }
            self.cursor[i] = 0;
        }
        if self.cursor.is_empty() {
            self.done = true;
        }

        Some(ParamValues { values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_by_two_sweep_is_strictly_increasing_and_terminates() {
        let p = TuningParam { name: "ml", min: 16, max: 256, step: StepFn::MulByTwo };
        let vals = p.values();
        assert_eq!(vals, vec![16, 32, 64, 128, 256]);
        assert!(vals.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn add_one_covers_flag_ranges() {
        let p = TuningParam { name: "lhs_storage", min: 0, max: 1, step: StepFn::AddOne };
        assert_eq!(p.values(), vec![0, 1]);
        let fixed = TuningParam { name: "rhs_storage", min: 0, max: 0, step: StepFn::AddOne };
        assert_eq!(fixed.values(), vec![0]);
    }

    #[test]
    fn enumeration_is_full_factorial() {
        let mut space = TuningSpace::new();
        space.add_tuning_param("a", 1, 4, StepFn::MulByTwo);
        space.add_tuning_param("b", 0, 1, StepFn::AddOne);
        space.add_tuning_param("c", 2, 8, StepFn::MulByTwo);
        assert_eq!(space.cardinality(), 3 * 2 * 3);
        let points: Vec<_> = space.enumerate().collect();
        assert_eq!(points.len(), 18);
    }

    #[test]
    fn first_registered_axis_changes_slowest() {
        let mut space = TuningSpace::new();
        space.add_tuning_param("outer", 1, 2, StepFn::MulByTwo);
        space.add_tuning_param("inner", 1, 2, StepFn::MulByTwo);
        let points: Vec<_> = space.enumerate().collect();
        let pairs: Vec<(u32, u32)> = points
            .iter()
            .map(|p| (p.get("outer").unwrap(), p.get("inner").unwrap()))
            .collect();
        assert_eq!(pairs, vec![(1, 1), (1, 2), (2, 1), (2, 2)]);
    }

    #[test]
    fn missing_parameter_lookup_is_an_error() {
        let mut space = TuningSpace::new();
        space.add_tuning_param("a", 1, 1, StepFn::AddOne);
        let point = space.enumerate().next().unwrap();
        assert!(point.get("nope").is_err());
    }
}
