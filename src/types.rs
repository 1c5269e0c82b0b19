// src/types.rs
use std::time::SystemTime;

use rustfft::num_complex::Complex64;

use crate::drivers::calibration::CalPoint;
use crate::drivers::network::polar;
use crate::drivers::plan::FrequencyBand;

/// One corrected measurement, published once per step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepSample {
    /// Increments on every `configure_and_start`.
    pub scan_id: u64,
    pub step: usize,
    pub freq_mhz: f64,
    pub band: FrequencyBand,
    pub mag_code: u32,
    pub phase_code: u32,
    /// After linearisation and continuity, before calibration.
    pub raw_magnitude_db: f64,
    pub magnitude_db: f64,
    /// Wrapped to +/-180.
    pub phase_deg: f64,
    pub phase_unwrapped_deg: f64,
    /// False when the magnitude was under the noise floor.
    pub phase_valid: bool,
    pub inverted: bool,
    pub timestamp: SystemTime,
}

impl StepSample {
    /// S21 or S11 as a complex ratio.
    pub fn s_param(&self) -> Complex64 {
        polar(self.magnitude_db, self.phase_deg)
    }

    pub fn cal_point(&self) -> CalPoint {
        CalPoint {
            freq_mhz: self.freq_mhz,
            db: self.magnitude_db,
            deg: self.phase_deg,
        }
    }
}

/// Messages from the scan worker to whoever drains the event queue.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanEvent {
    Log(String),
    Error(String),
    /// Samples up to `step` are queued.
    DataReady { scan_id: u64, step: usize },
    Halted { scan_id: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Halted,
}
