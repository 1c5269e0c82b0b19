//! Calibration spectra and the store that decides which one applies to a sweep.
//!
//! Precedence is Band > Base > None. A Band calibration only applies when its
//! frequency grid is the sweep's grid; otherwise a range-compatible Base
//! calibration is interpolated onto the sweep. Reflection and transmission
//! calibrations never substitute for one another.
use std::path::Path;

use log::{info, warn};
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::drivers::caltables::{FrequencyTable, MagnitudeTable};
use crate::drivers::error::CalibrationError;
use crate::drivers::plan::SweepPlan;
use crate::recorder::{self, SavedSpectrum};

/// Start/stop frequencies closer than this are the same frequency.
pub const FREQ_TOLERANCE_MHZ: f64 = 1e-8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalMode {
    #[default]
    Transmission,
    Reflection,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CalLevel {
    #[default]
    None,
    Base,
    Band,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalPoint {
    pub freq_mhz: f64,
    pub db: f64,
    pub deg: f64,
}

/// Folds an angle into `(-180, 180]`.
pub fn wrap_degrees(deg: f64) -> f64 {
    let wrapped = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

/// Reference response over frequency. Values are owned; clones never share storage.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationSpectrum {
    points: Vec<CalPoint>,
    mode: CalMode,
    log_spaced: bool,
}

impl CalibrationSpectrum {
    pub fn new(points: Vec<CalPoint>, mode: CalMode, log_spaced: bool) -> Result<Self, CalibrationError> {
        if points.is_empty() {
            return Err(CalibrationError::Empty);
        }
        let ascending = points.windows(2).all(|w| w[0].freq_mhz <= w[1].freq_mhz);
        let descending = points.windows(2).all(|w| w[0].freq_mhz >= w[1].freq_mhz);
        if !ascending && !descending {
            return Err(CalibrationError::Malformed {
                line: 0,
                reason: "calibration frequencies are not monotonic".into(),
            });
        }
        if log_spaced && points.iter().any(|p| p.freq_mhz <= 0.0) {
            return Err(CalibrationError::Malformed {
                line: 0,
                reason: "log-spaced calibration needs positive frequencies".into(),
            });
        }
        Ok(Self {
            points,
            mode,
            log_spaced,
        })
    }

    /// Builds a spectrum from a saved trace, detecting log spacing from the grid.
    pub fn from_saved(saved: &SavedSpectrum, mode: CalMode) -> Result<Self, CalibrationError> {
        let log_spaced = looks_log_spaced(&saved.points);
        Self::new(saved.points.clone(), mode, log_spaced)
    }

    pub fn load(path: impl AsRef<Path>, mode: CalMode) -> Result<Self, CalibrationError> {
        let saved = recorder::load_spectrum(path)?;
        Self::from_saved(&saved, mode)
    }

    pub fn points(&self) -> &[CalPoint] {
        &self.points
    }

    pub fn mode(&self) -> CalMode {
        self.mode
    }

    pub fn is_log_spaced(&self) -> bool {
        self.log_spaced
    }

    pub fn start_mhz(&self) -> f64 {
        self.points[0].freq_mhz
    }

    pub fn stop_mhz(&self) -> f64 {
        self.points[self.points.len() - 1].freq_mhz
    }

    fn low_mhz(&self) -> f64 {
        self.start_mhz().min(self.stop_mhz())
    }

    fn high_mhz(&self) -> f64 {
        self.start_mhz().max(self.stop_mhz())
    }

    /// Same endpoints, point count and spacing as the sweep.
    pub fn matches_exactly(&self, plan: &SweepPlan) -> bool {
        (self.start_mhz() - plan.start_mhz).abs() <= FREQ_TOLERANCE_MHZ
            && (self.stop_mhz() - plan.stop_mhz).abs() <= FREQ_TOLERANCE_MHZ
            && self.points.len() == plan.points()
            && self.log_spaced == plan.is_log()
    }

    pub fn covers(&self, low_mhz: f64, high_mhz: f64) -> bool {
        low_mhz >= self.low_mhz() - FREQ_TOLERANCE_MHZ && high_mhz <= self.high_mhz() + FREQ_TOLERANCE_MHZ
    }

    fn axis(&self, freq_mhz: f64) -> f64 {
        if self.log_spaced {
            freq_mhz.max(f64::MIN_POSITIVE).ln()
        } else {
            freq_mhz
        }
    }

    /// Linear interpolation in the spectrum's own frequency axis. Phase takes the short way round.
    pub fn value_at(&self, freq_mhz: f64) -> (f64, f64) {
        let ascending = self.start_mhz() <= self.stop_mhz();
        let key = |p: &CalPoint| if ascending { p.freq_mhz } else { -p.freq_mhz };
        let target = if ascending { freq_mhz } else { -freq_mhz };
        let upper = self.points.partition_point(|p| key(p) <= target);
        if upper == 0 {
            let p = self.points[0];
            return (p.db, p.deg);
        }
        if upper >= self.points.len() {
            let p = self.points[self.points.len() - 1];
            return (p.db, p.deg);
        }
        let a = self.points[upper - 1];
        let b = self.points[upper];
        let (xa, xb) = (self.axis(a.freq_mhz), self.axis(b.freq_mhz));
        if xa == xb {
            return (a.db, a.deg);
        }
        let t = (self.axis(freq_mhz) - xa) / (xb - xa);
        let db = a.db + (b.db - a.db) * t;
        let deg = wrap_degrees(a.deg + wrap_degrees(b.deg - a.deg) * t);
        (db, deg)
    }

    /// Resamples onto `targets`, which must lie within this spectrum's range.
    pub fn interpolate(&self, targets: &[f64]) -> Result<CalibrationSpectrum, CalibrationError> {
        let low = targets.iter().copied().fold(f64::INFINITY, f64::min);
        let high = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if targets.is_empty() {
            return Err(CalibrationError::Empty);
        }
        if !self.covers(low, high) {
            return Err(CalibrationError::OutOfRange {
                cal_start: self.low_mhz(),
                cal_stop: self.high_mhz(),
                start: low,
                stop: high,
            });
        }
        let points = targets
            .iter()
            .map(|&f| {
                let (db, deg) = self.value_at(f);
                CalPoint {
                    freq_mhz: f,
                    db,
                    deg,
                }
            })
            .collect();
        Ok(CalibrationSpectrum {
            points,
            mode: self.mode,
            log_spaced: self.log_spaced,
        })
    }
}

fn looks_log_spaced(points: &[CalPoint]) -> bool {
    if points.len() < 3 || points.iter().any(|p| p.freq_mhz <= 0.0) {
        return false;
    }
    let first_diff = points[1].freq_mhz - points[0].freq_mhz;
    let linear = points
        .windows(2)
        .all(|w| ((w[1].freq_mhz - w[0].freq_mhz) - first_diff).abs() <= 1e-6 * first_diff.abs().max(1e-9));
    if linear {
        return false;
    }
    let first_ratio = points[1].freq_mhz / points[0].freq_mhz;
    points
        .windows(2)
        .all(|w| (w[1].freq_mhz / w[0].freq_mhz - first_ratio).abs() <= 1e-6)
}

/// Measured open/short/load reflections, already referenced to the OSL line reference.
#[derive(Clone, Debug, PartialEq)]
pub struct OslStandards {
    pub freq_mhz: Vec<f64>,
    pub open: Vec<Complex64>,
    pub short: Vec<Complex64>,
    pub load: Vec<Complex64>,
}

/// Three-term error model at one frequency.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErrorTerms {
    pub directivity: Complex64,
    pub source_match: Complex64,
    pub tracking: Complex64,
}

impl ErrorTerms {
    /// Error terms from ideal standards (open = 1, short = -1, load = 0).
    pub fn from_measured(open: Complex64, short: Complex64, load: Complex64) -> Self {
        let directivity = load;
        let span = open - short;
        let source_match = if span.norm() > 0.0 {
            (open + short - load * 2.0) / span
        } else {
            Complex64::new(0.0, 0.0)
        };
        let tracking = (open - load) * (Complex64::new(1.0, 0.0) - source_match);
        Self {
            directivity,
            source_match,
            tracking,
        }
    }

    pub fn correct(&self, measured: Complex64) -> Complex64 {
        let d = measured - self.directivity;
        let denom = self.tracking + self.source_match * d;
        if denom.norm() == 0.0 {
            return measured;
        }
        d / denom
    }
}

/// OSL reflection calibration: a line reference plus the three standards.
#[derive(Clone, Debug, PartialEq)]
pub struct OslCalibration {
    reference: CalibrationSpectrum,
    standards: OslStandards,
}

impl OslCalibration {
    pub fn new(reference: CalibrationSpectrum, standards: OslStandards) -> Result<Self, CalibrationError> {
        let n = standards.freq_mhz.len();
        if n == 0 {
            return Err(CalibrationError::Empty);
        }
        if standards.open.len() != n || standards.short.len() != n || standards.load.len() != n {
            return Err(CalibrationError::Malformed {
                line: 0,
                reason: "OSL standards have differing lengths".into(),
            });
        }
        if reference.mode() != CalMode::Reflection {
            return Err(CalibrationError::Malformed {
                line: 0,
                reason: "OSL reference must be a reflection calibration".into(),
            });
        }
        Ok(Self {
            reference,
            standards,
        })
    }

    pub fn reference(&self) -> &CalibrationSpectrum {
        &self.reference
    }

    pub fn terms_at(&self, freq_mhz: f64) -> ErrorTerms {
        let s = &self.standards;
        let upper = s.freq_mhz.partition_point(|&f| f <= freq_mhz);
        let (i0, i1) = if upper == 0 {
            (0, 0)
        } else if upper >= s.freq_mhz.len() {
            (s.freq_mhz.len() - 1, s.freq_mhz.len() - 1)
        } else {
            (upper - 1, upper)
        };
        let t = if i0 == i1 || s.freq_mhz[i1] == s.freq_mhz[i0] {
            0.0
        } else {
            (freq_mhz - s.freq_mhz[i0]) / (s.freq_mhz[i1] - s.freq_mhz[i0])
        };
        let lerp = |v: &[Complex64]| v[i0] + (v[i1] - v[i0]) * t;
        ErrorTerms::from_measured(lerp(&s.open), lerp(&s.short), lerp(&s.load))
    }

    pub fn correct(&self, freq_mhz: f64, measured: Complex64) -> Complex64 {
        self.terms_at(freq_mhz).correct(measured)
    }
}

/// Calibration chosen for one sweep, resampled onto the sweep's grid.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveCalibration {
    pub level: CalLevel,
    pub spectrum: CalibrationSpectrum,
}

impl ActiveCalibration {
    pub fn at_step(&self, step: usize) -> (f64, f64) {
        let p = self.spectrum.points()[step.min(self.spectrum.points().len() - 1)];
        (p.db, p.deg)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CalibrationStore {
    band: Option<CalibrationSpectrum>,
    base: Option<CalibrationSpectrum>,
    osl: Option<OslCalibration>,
    magnitude: Option<MagnitudeTable>,
    frequency: Option<FrequencyTable>,
}

impl CalibrationStore {
    pub fn band(&self) -> Option<&CalibrationSpectrum> {
        self.band.as_ref()
    }

    pub fn base(&self) -> Option<&CalibrationSpectrum> {
        self.base.as_ref()
    }

    pub fn osl(&self) -> Option<&OslCalibration> {
        self.osl.as_ref()
    }

    pub fn magnitude_table(&self) -> Option<&MagnitudeTable> {
        self.magnitude.as_ref()
    }

    pub fn frequency_table(&self) -> Option<&FrequencyTable> {
        self.frequency.as_ref()
    }

    pub fn set_band(&mut self, spectrum: CalibrationSpectrum) {
        self.band = Some(spectrum);
    }

    pub fn set_base(&mut self, spectrum: CalibrationSpectrum) {
        self.base = Some(spectrum);
    }

    pub fn set_osl(&mut self, osl: OslCalibration) {
        self.osl = Some(osl);
    }

    pub fn set_magnitude_table(&mut self, table: MagnitudeTable) {
        self.magnitude = Some(table);
    }

    pub fn set_frequency_table(&mut self, table: FrequencyTable) {
        self.frequency = Some(table);
    }

    pub fn clear_spectra(&mut self) {
        self.band = None;
        self.base = None;
        self.osl = None;
    }

    /// Loads a magnitude table; on failure the previous table stays in place.
    pub fn load_magnitude_table(&mut self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        match MagnitudeTable::load(path) {
            Ok(table) => {
                info!("loaded magnitude table {}", path.display());
                self.magnitude = Some(table);
                Ok(())
            }
            Err(e) => {
                warn!("ignoring magnitude table {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    pub fn load_frequency_table(&mut self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        match FrequencyTable::load(path) {
            Ok(table) => {
                info!("loaded frequency table {}", path.display());
                self.frequency = Some(table);
                Ok(())
            }
            Err(e) => {
                warn!("ignoring frequency table {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    pub fn load_base(&mut self, path: impl AsRef<Path>, mode: CalMode) -> Result<(), CalibrationError> {
        let spectrum = CalibrationSpectrum::load(path, mode)?;
        self.base = Some(spectrum);
        Ok(())
    }

    /// Band calibration applies to this exact sweep grid.
    pub fn matches_exactly(&self, plan: &SweepPlan) -> bool {
        self.band
            .as_ref()
            .map(|band| band.matches_exactly(plan))
            .unwrap_or(false)
    }

    /// Base calibration resampled onto `targets`.
    pub fn interpolate(&self, targets: &[f64]) -> Result<CalibrationSpectrum, CalibrationError> {
        self.base
            .as_ref()
            .ok_or(CalibrationError::Empty)?
            .interpolate(targets)
    }

    /// Picks the best calibration not above `requested` for the sweep, in `mode` only.
    pub fn select(&self, requested: CalLevel, mode: CalMode, plan: &SweepPlan) -> Option<ActiveCalibration> {
        if requested == CalLevel::None {
            return None;
        }
        if requested == CalLevel::Band {
            if let Some(band) = self.band.as_ref().filter(|b| b.mode() == mode) {
                if band.matches_exactly(plan) {
                    return Some(ActiveCalibration {
                        level: CalLevel::Band,
                        spectrum: band.clone(),
                    });
                }
                info!("band calibration does not match the sweep; trying base");
            }
        }
        let base = self.base.as_ref().filter(|b| b.mode() == mode)?;
        match base.interpolate(&plan.frequencies()) {
            Ok(spectrum) => Some(ActiveCalibration {
                level: CalLevel::Base,
                spectrum,
            }),
            Err(e) => {
                warn!("base calibration unusable for this sweep: {}", e);
                None
            }
        }
    }
}
