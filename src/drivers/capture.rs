//! Turning raw ADC codes into corrected magnitude and phase for one step.
use serde::{Deserialize, Serialize};

use crate::drivers::caltables::{FrequencyTable, MagnitudeTable};
use crate::drivers::plan::FrequencyBand;

/// Degrees of phase per MHz per ns of reference-plane extension.
pub const PLANE_EXTENSION_DEG_PER_MHZ_NS: f64 = 0.36;

pub use crate::drivers::calibration::wrap_degrees as wrap180;

/// Phase code to degrees in `[0, 360)`.
pub fn phase_degrees(code: u32, full_scale: u32) -> f64 {
    code as f64 / (full_scale as f64 + 1.0) * 360.0
}

/// Region of the phase detector's transfer curve that cannot be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BadQuadrant {
    pub center_deg: f64,
    pub half_width_deg: f64,
}

impl Default for BadQuadrant {
    fn default() -> Self {
        Self {
            center_deg: 180.0,
            half_width_deg: 22.5,
        }
    }
}

impl BadQuadrant {
    pub fn contains(&self, raw_deg: f64) -> bool {
        wrap180(raw_deg - self.center_deg).abs() <= self.half_width_deg
    }
}

/// Magnitude and phase corrections that depend only on the current reading.
#[derive(Clone, Debug, Default)]
pub struct Corrector {
    pub magnitude_table: Option<MagnitudeTable>,
    pub frequency_table: Option<FrequencyTable>,
    pub full_scale: u32,
    /// Phase shift introduced by the reference inversion switch.
    pub inversion_offset_deg: f64,
    pub plane_extension_ns: f64,
}

impl Corrector {
    pub fn magnitude_db(&self, code: u32, freq_mhz: f64) -> f64 {
        let linear = match &self.magnitude_table {
            Some(table) => table.dbm(code as f64),
            None => MagnitudeTable::raw_estimate_dbm(code, self.full_scale),
        };
        let offset = self
            .frequency_table
            .as_ref()
            .map(|t| t.offset_db(freq_mhz))
            .unwrap_or(0.0);
        linear + offset
    }

    pub fn phase_deg(&self, code: u32, mag_code: u32, freq_mhz: f64, inverted: bool, band: FrequencyBand) -> f64 {
        let mut deg = phase_degrees(code, self.full_scale);
        if inverted {
            deg -= self.inversion_offset_deg;
        }
        if band == FrequencyBand::G3 {
            deg = -deg;
        }
        if let Some(table) = &self.magnitude_table {
            deg -= table.phase_offset(mag_code as f64);
        }
        deg += PLANE_EXTENSION_DEG_PER_MHZ_NS * self.plane_extension_ns * freq_mhz;
        wrap180(deg)
    }
}

fn quadrant(deg: f64) -> u8 {
    (((deg + 180.0) / 90.0).floor() as i64).clamp(0, 3) as u8
}

/// Running bases that keep phase and magnitude continuous across wraps and band edges.
#[derive(Clone, Debug, Default)]
pub struct ContinuityTracker {
    last_quadrant: Option<u8>,
    phase_base: f64,
    history: Vec<f64>,
    mag_base: f64,
    last_band: Option<FrequencyBand>,
    /// Calibration phase shift applied at the previous step.
    cal_offset: Option<f64>,
}

impl ContinuityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn phase_base(&self) -> f64 {
        self.phase_base
    }

    /// Unwrapped phase for a wrapped reading.
    pub fn unwrap_phase(&mut self, deg: f64) -> f64 {
        let q = quadrant(deg);
        match (self.last_quadrant, q) {
            (Some(3), 0) => self.phase_base += 360.0,
            (Some(0), 3) => self.phase_base -= 360.0,
            _ => {}
        }
        self.last_quadrant = Some(q);
        self.phase_base + deg
    }

    /// Unwrapped phase without updating the tracker, for readings that cannot be trusted.
    pub fn peek_phase(&self, deg: f64) -> f64 {
        self.phase_base + deg
    }

    /// Calibration phase shift `delta_deg`, moved onto the 360 degree branch nearest the
    /// previous step's shift.
    pub fn track_offset(&mut self, delta_deg: f64) -> f64 {
        let offset = self.peek_offset(delta_deg);
        self.cal_offset = Some(offset);
        offset
    }

    pub fn peek_offset(&self, delta_deg: f64) -> f64 {
        match self.cal_offset {
            Some(prev) => prev + wrap180(delta_deg - prev),
            None => wrap180(delta_deg),
        }
    }

    /// Offsets `db` so a band change continues the line through the last two samples.
    pub fn correct_magnitude(&mut self, db: f64, band: FrequencyBand) -> f64 {
        let band_changed = self.last_band.map(|b| b != band).unwrap_or(false);
        if band_changed && self.history.len() == 2 {
            let expected = 2.0 * self.history[1] - self.history[0];
            self.mag_base = expected - db;
        }
        self.last_band = Some(band);
        let corrected = db + self.mag_base;
        if self.history.len() == 2 {
            self.history.remove(0);
        }
        self.history.push(corrected);
        corrected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::caltables::MagnitudeEntry;

    #[test]
    fn wrap_keeps_half_open_range() {
        assert_eq!(wrap180(190.0), -170.0);
        assert_eq!(wrap180(-180.0), 180.0);
        assert_eq!(wrap180(540.0), 180.0);
        assert_eq!(wrap180(-10.0), -10.0);
    }

    #[test]
    fn bad_quadrant_window() {
        let bad = BadQuadrant::default();
        assert!(bad.contains(180.0));
        assert!(bad.contains(200.0));
        assert!(!bad.contains(210.0));
        assert!(!bad.contains(0.0));
    }

    #[test]
    fn unwrapped_phase_is_monotonic_across_two_wraps() {
        let mut tracker = ContinuityTracker::new();
        let mut previous = None;
        let mut true_phase: f64 = 100.0;
        for _ in 0..80 {
            let out = tracker.unwrap_phase(wrap180(true_phase));
            if let Some(prev) = previous {
                let delta: f64 = out - prev;
                assert!(delta > 0.0 && (delta - 10.0).abs() < 1.0, "jump {delta}");
            }
            assert!((out - true_phase).abs() < 1e-9);
            previous = Some(out);
            true_phase += 10.0;
        }
        assert!(true_phase > 100.0 + 720.0);
    }

    #[test]
    fn decreasing_phase_unwraps_downwards() {
        let mut tracker = ContinuityTracker::new();
        let outs: Vec<f64> = [-150.0, -175.0, 170.0, 150.0]
            .iter()
            .map(|&d| tracker.unwrap_phase(d))
            .collect();
        assert_eq!(outs, vec![-150.0, -175.0, -190.0, -210.0]);
    }

    #[test]
    fn calibration_offset_stays_on_one_branch() {
        let mut tracker = ContinuityTracker::new();
        let offsets: Vec<f64> = [-178.0, -179.0, 179.0, 178.0]
            .iter()
            .map(|&d| tracker.track_offset(d))
            .collect();
        assert_eq!(offsets, vec![-178.0, -179.0, -181.0, -182.0]);
        assert_eq!(tracker.peek_offset(177.0), -183.0);
        tracker.reset();
        assert_eq!(tracker.track_offset(179.0), 179.0);
    }

    #[test]
    fn band_edge_magnitude_step_is_removed() {
        let mut tracker = ContinuityTracker::new();
        assert_eq!(tracker.correct_magnitude(-10.0, FrequencyBand::G1), -10.0);
        assert_eq!(tracker.correct_magnitude(-11.0, FrequencyBand::G1), -11.0);
        // the second band reads 5 dB low
        let out = tracker.correct_magnitude(-17.0, FrequencyBand::G2);
        assert!((out - -12.0).abs() < 1e-12);
        let out = tracker.correct_magnitude(-18.0, FrequencyBand::G2);
        assert!((out - -13.0).abs() < 1e-12);
        tracker.reset();
        assert_eq!(tracker.correct_magnitude(-17.0, FrequencyBand::G2), -17.0);
    }

    #[test]
    fn phase_corrections_apply_in_order() {
        let table = MagnitudeTable::new(vec![
            MagnitudeEntry { adc: 0.0, dbm: -100.0, phase_deg: 2.0 },
            MagnitudeEntry { adc: 1000.0, dbm: 0.0, phase_deg: 2.0 },
        ])
        .unwrap();
        let corrector = Corrector {
            magnitude_table: Some(table),
            frequency_table: None,
            full_scale: 359,
            inversion_offset_deg: 180.0,
            plane_extension_ns: 1.0,
        };
        // 90 raw, no inversion, -2 table, +0.36 * 10
        let deg = corrector.phase_deg(90, 500, 10.0, false, FrequencyBand::G1);
        assert!((deg - 91.6).abs() < 1e-9);
        // 270 - 180 inverted = 90, negated in band 3 = -90, -2, +3.6
        let deg = corrector.phase_deg(270, 500, 10.0, true, FrequencyBand::G3);
        assert!((deg - -88.4).abs() < 1e-9);
        assert!((corrector.magnitude_db(500, 10.0) - -50.0).abs() < 1e-9);
    }
}
