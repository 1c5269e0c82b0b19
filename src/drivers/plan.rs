use serde::{Deserialize, Serialize};

use crate::drivers::error::ScanError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Spacing {
    #[default]
    Linear,
    Log,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
    Alternating,
}

/// Frequencies visited by a sweep. `steps` counts intervals, so there are `steps + 1` points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    pub start_mhz: f64,
    pub stop_mhz: f64,
    pub steps: usize,
    #[serde(default)]
    pub spacing: Spacing,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self {
            start_mhz: 0.1,
            stop_mhz: 100.0,
            steps: 400,
            spacing: Spacing::Linear,
        }
    }
}

impl SweepPlan {
    pub fn new(start_mhz: f64, stop_mhz: f64, steps: usize, spacing: Spacing) -> Result<Self, ScanError> {
        let plan = Self {
            start_mhz,
            stop_mhz,
            steps,
            spacing,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.steps < 1 {
            return Err(ScanError::InvalidPlan("at least one step is required".into()));
        }
        if !self.start_mhz.is_finite() || !self.stop_mhz.is_finite() {
            return Err(ScanError::InvalidPlan("frequencies must be finite".into()));
        }
        if self.spacing == Spacing::Log && (self.start_mhz <= 0.0 || self.stop_mhz <= 0.0) {
            return Err(ScanError::InvalidPlan(
                "log spacing needs positive start and stop".into(),
            ));
        }
        Ok(())
    }

    pub fn points(&self) -> usize {
        self.steps + 1
    }

    pub fn is_log(&self) -> bool {
        self.spacing == Spacing::Log
    }

    pub fn frequency(&self, step: usize) -> f64 {
        let step = step.min(self.steps);
        let t = step as f64 / self.steps as f64;
        match self.spacing {
            Spacing::Linear => self.start_mhz + (self.stop_mhz - self.start_mhz) * t,
            Spacing::Log => self.start_mhz * (self.stop_mhz / self.start_mhz).powf(t),
        }
    }

    pub fn frequencies(&self) -> Vec<f64> {
        (0..self.points()).map(|i| self.frequency(i)).collect()
    }

    pub fn low_mhz(&self) -> f64 {
        self.start_mhz.min(self.stop_mhz)
    }

    pub fn high_mhz(&self) -> f64 {
        self.start_mhz.max(self.stop_mhz)
    }
}

/// Outcome of moving the step cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Advance {
    pub index: usize,
    /// A traversal finished: wrap in forward/reverse, reversal in alternating mode.
    pub boundary: bool,
}

/// Step index bookkeeping for the three direction modes.
#[derive(Clone, Debug)]
pub struct StepCursor {
    index: usize,
    last: usize,
    increment: i64,
    direction: Direction,
}

impl StepCursor {
    pub fn new(steps: usize, direction: Direction) -> Self {
        let (index, increment) = match direction {
            Direction::Reverse => (steps, -1),
            Direction::Forward | Direction::Alternating => (0, 1),
        };
        Self {
            index,
            last: steps,
            increment,
            direction,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn increment(&self) -> i64 {
        self.increment
    }

    pub fn advance(&mut self) -> Advance {
        let last = self.last as i64;
        let current = self.index as i64;
        let (next, boundary) = match self.direction {
            Direction::Forward => {
                if current >= last {
                    (0, true)
                } else {
                    (current + 1, false)
                }
            }
            Direction::Reverse => {
                if current <= 0 {
                    (last, true)
                } else {
                    (current - 1, false)
                }
            }
            Direction::Alternating => {
                if last == 0 {
                    (0, true)
                } else {
                    let mut next = current + self.increment;
                    let mut boundary = false;
                    if next > last || next < 0 {
                        self.increment = -self.increment;
                        next = current + self.increment;
                        boundary = true;
                    }
                    (next, boundary)
                }
            }
        };
        self.index = next as usize;
        Advance {
            index: self.index,
            boundary,
        }
    }

    /// Moves to `step` modulo the point count. Returns true when the move skipped
    /// over steps, which invalidates continuity tracking.
    pub fn jump(&mut self, step: usize) -> bool {
        let target = step % (self.last + 1);
        let skipped = (target as i64 - self.index as i64).abs() > 1;
        self.index = target;
        skipped
    }
}

/// Mixing band used to reach a frequency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyBand {
    /// Fundamental, LO1 above the signal.
    G1,
    /// LO1 second harmonic.
    G2,
    /// LO1 below the signal; the IF is spectrally inverted.
    G3,
}

impl FrequencyBand {
    pub fn for_frequency(freq_mhz: f64) -> Self {
        if freq_mhz < 1000.0 {
            FrequencyBand::G1
        } else if freq_mhz < 2000.0 {
            FrequencyBand::G2
        } else {
            FrequencyBand::G3
        }
    }
}

/// IF chain and tracking-generator offsets used to derive LO targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoPlan {
    pub lo2_mhz: f64,
    pub final_if_mhz: f64,
    pub tg_offset_mhz: f64,
    pub forced_band: Option<FrequencyBand>,
}

impl Default for LoPlan {
    fn default() -> Self {
        Self {
            lo2_mhz: 1024.0,
            final_if_mhz: 10.7,
            tg_offset_mhz: 0.0,
            forced_band: None,
        }
    }
}

impl LoPlan {
    pub fn if1_mhz(&self) -> f64 {
        self.lo2_mhz - self.final_if_mhz
    }

    pub fn band(&self, freq_mhz: f64) -> FrequencyBand {
        self.forced_band
            .unwrap_or_else(|| FrequencyBand::for_frequency(freq_mhz))
    }

    pub fn lo1_mhz(&self, freq_mhz: f64, band: FrequencyBand) -> f64 {
        let if1 = self.if1_mhz();
        match band {
            FrequencyBand::G1 => freq_mhz + if1,
            FrequencyBand::G2 => (freq_mhz + if1) / 2.0,
            FrequencyBand::G3 => freq_mhz - if1,
        }
    }

    /// Tracking generator LO. Mixed with LO1 it lands on the swept frequency, so it
    /// follows the LO1 frequency actually reached rather than the requested one.
    pub fn lo3_mhz(&self, freq_mhz: f64, lo1_actual_mhz: f64, band: FrequencyBand) -> f64 {
        match band {
            FrequencyBand::G1 => lo1_actual_mhz - freq_mhz + self.tg_offset_mhz,
            FrequencyBand::G2 | FrequencyBand::G3 => self.if1_mhz() + self.tg_offset_mhz,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_and_log_frequencies() {
        let lin = SweepPlan::new(0.0, 100.0, 4, Spacing::Linear).unwrap();
        assert_eq!(lin.frequencies(), vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        let log = SweepPlan::new(1.0, 100.0, 2, Spacing::Log).unwrap();
        let f = log.frequencies();
        assert!((f[1] - 10.0).abs() < 1e-9);
        assert!((f[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_plans_are_rejected() {
        assert!(SweepPlan::new(1.0, 2.0, 0, Spacing::Linear).is_err());
        assert!(SweepPlan::new(0.0, 2.0, 10, Spacing::Log).is_err());
    }

    #[test]
    fn alternating_reverses_exactly_at_boundary() {
        let mut cursor = StepCursor::new(10, Direction::Alternating);
        let mut seen = vec![cursor.index()];
        for _ in 0..11 {
            seen.push(cursor.advance().index);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 9]);
    }

    #[test]
    fn forward_and_reverse_wrap() {
        let mut fwd = StepCursor::new(2, Direction::Forward);
        let idx: Vec<_> = (0..4).map(|_| fwd.advance()).collect();
        assert_eq!(idx.iter().map(|a| a.index).collect::<Vec<_>>(), vec![1, 2, 0, 1]);
        assert!(idx[2].boundary);

        let mut rev = StepCursor::new(2, Direction::Reverse);
        assert_eq!(rev.index(), 2);
        let idx: Vec<_> = (0..3).map(|_| rev.advance().index).collect();
        assert_eq!(idx, vec![1, 0, 2]);
    }

    #[test]
    fn jumps_wrap_modulo_points_and_flag_skips() {
        let mut cursor = StepCursor::new(10, Direction::Forward);
        assert!(!cursor.jump(1));
        assert!(cursor.jump(15));
        assert_eq!(cursor.index(), 4);
        assert!(!cursor.jump(5));
    }

    #[test]
    fn lo_targets_per_band() {
        let plan = LoPlan::default();
        assert!((plan.if1_mhz() - 1013.3).abs() < 1e-9);
        assert_eq!(plan.band(500.0), FrequencyBand::G1);
        assert!((plan.lo1_mhz(500.0, FrequencyBand::G1) - 1513.3).abs() < 1e-9);
        assert!((plan.lo1_mhz(1500.0, FrequencyBand::G2) - 1256.65).abs() < 1e-9);
        assert!((plan.lo1_mhz(2500.0, FrequencyBand::G3) - 1486.7).abs() < 1e-9);
        let lo3 = plan.lo3_mhz(500.0, 1513.31, FrequencyBand::G1);
        assert!((lo3 - 1013.31).abs() < 1e-9);
        assert!((plan.lo3_mhz(2500.0, 1486.7, FrequencyBand::G3) - 1013.3).abs() < 1e-9);
    }
}
