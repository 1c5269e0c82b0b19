// src/session.rs
//! Everything one instrument connection owns: the board, the three oscillators,
//! the ADC reader, calibration and the per-scan correction state.
use std::time::SystemTime;

use log::{debug, error, info, warn};

use crate::config::{HardwareConfig, ScanConfig, ScanMode};
use crate::drivers::board::{ControlBoard, NullBoard};
use crate::drivers::buffer::TraceSnapshot;
use crate::drivers::bus::{self, AdcReader, AdcSample};
use crate::drivers::calibration::{ActiveCalibration, CalLevel, CalMode, CalibrationStore};
use crate::drivers::capture::{phase_degrees, wrap180, ContinuityTracker, Corrector};
use crate::drivers::error::{BoardError, CalibrationError, ScanError, SynthError};
use crate::drivers::network::{polar, to_db_deg};
use crate::drivers::plan::{FrequencyBand, SweepPlan};
use crate::drivers::synth::{DeviceFrame, Oscillator};
use crate::types::StepSample;

/// Switch byte bit selecting the inverted reference phase.
pub const SWITCH_PHASE_INVERT: u8 = 0x01;
/// Control-port bit that latches the switch byte.
pub const SWITCH_LATCH: u8 = 0x80;

/// A captured step plus any diagnostics worth forwarding to the consumer.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub sample: StepSample,
    pub notes: Vec<String>,
}

pub struct Session {
    hardware: HardwareConfig,
    board: Box<dyn ControlBoard>,
    hardware_present: bool,
    lo1: Oscillator,
    lo2: Oscillator,
    lo3: Option<Oscillator>,
    adc: AdcReader,
    calibration: CalibrationStore,
    corrector: Corrector,
    continuity: ContinuityTracker,
    scan: ScanConfig,
    active: Option<ActiveCalibration>,
    inverted: bool,
    first_step: bool,
    /// Diagnostics raised before the first scan, handed out by `prepare_scan`.
    pending_notes: Vec<String>,
}

impl Session {
    /// Opens a session on `board`. A board that does not answer, or answers with the
    /// wrong version, is replaced by `NullBoard` for the life of the session. A config that
    /// fails validation is refused.
    pub fn connect(hardware: HardwareConfig, board: Box<dyn ControlBoard>) -> Result<Self, ScanError> {
        hardware
            .validate()
            .map_err(|e| ScanError::InvalidConfig(format!("{:#}", e)))?;
        let mut board = board;
        let mut present = board.is_present();
        if present {
            if let Err(e) = bus::verify_board(board.as_mut(), hardware.board_version) {
                warn!("control board unusable ({}); continuing without hardware", e);
                board = Box::new(NullBoard);
                present = false;
            }
        }
        let keep_sync = hardware.keep_sync && present;
        let adc = AdcReader::new(hardware.adc_bits, keep_sync, hardware.sync_retry_budget);
        let mut calibration = CalibrationStore::default();
        let mut pending_notes = Vec::new();
        if let Some(path) = &hardware.magnitude_table {
            if let Err(e) = calibration.load_magnitude_table(path) {
                pending_notes.push(format!("magnitude table {} ignored: {}", path.display(), e));
            }
        }
        if let Some(path) = &hardware.frequency_table {
            if let Err(e) = calibration.load_frequency_table(path) {
                pending_notes.push(format!("frequency table {} ignored: {}", path.display(), e));
            }
        }
        let corrector = Corrector {
            magnitude_table: calibration.magnitude_table().cloned(),
            frequency_table: calibration.frequency_table().cloned(),
            full_scale: adc.full_scale(),
            inversion_offset_deg: hardware.inversion_offset_deg,
            plane_extension_ns: 0.0,
        };
        info!("session open, hardware present: {}", present);
        Ok(Self {
            lo1: Oscillator::new(hardware.lo1.clone(), hardware.master_clock_mhz),
            lo2: Oscillator::new(hardware.lo2.clone(), hardware.master_clock_mhz),
            lo3: hardware
                .lo3
                .clone()
                .map(|c| Oscillator::new(c, hardware.master_clock_mhz)),
            hardware,
            board,
            hardware_present: present,
            adc,
            calibration,
            corrector,
            continuity: ContinuityTracker::new(),
            scan: ScanConfig::default(),
            active: None,
            inverted: false,
            first_step: true,
            pending_notes,
        })
    }

    pub fn offline(hardware: HardwareConfig) -> Result<Self, ScanError> {
        Self::connect(hardware, Box::new(NullBoard))
    }

    pub fn hardware(&self) -> &HardwareConfig {
        &self.hardware
    }

    pub fn hardware_present(&self) -> bool {
        self.hardware_present
    }

    pub fn scan(&self) -> &ScanConfig {
        &self.scan
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.scan.plan
    }

    pub fn oscillators(&self) -> (&Oscillator, &Oscillator, Option<&Oscillator>) {
        (&self.lo1, &self.lo2, self.lo3.as_ref())
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Changes take effect at the next `prepare_scan`.
    pub fn calibration_mut(&mut self) -> &mut CalibrationStore {
        &mut self.calibration
    }

    pub fn active_calibration(&self) -> Option<&ActiveCalibration> {
        self.active.as_ref()
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Installs a finished trace as the Band calibration of its own plan.
    pub fn install_band(&mut self, snapshot: &TraceSnapshot, mode: CalMode) -> Result<(), CalibrationError> {
        let spectrum = snapshot.to_calibration(mode)?;
        info!("band calibration installed ({} points)", spectrum.points().len());
        self.calibration.set_band(spectrum);
        Ok(())
    }

    pub fn continuity(&self) -> &ContinuityTracker {
        &self.continuity
    }

    pub fn reset_continuity(&mut self) {
        self.continuity.reset();
    }

    fn fall_back(&mut self, err: BoardError, notes: &mut Vec<String>) {
        if !self.hardware_present {
            return;
        }
        error!("control board failed: {}; switching to no-hardware mode", err);
        notes.push(format!("hardware lost ({}); no-hardware mode for this session", err));
        self.board = Box::new(NullBoard);
        self.hardware_present = false;
        self.adc = AdcReader::new(self.hardware.adc_bits, false, 0);
    }

    fn send(&mut self, frames: &[DeviceFrame], notes: &mut Vec<String>) {
        if let Err(e) = bus::write_frames(self.board.as_mut(), frames) {
            self.fall_back(e, notes);
        }
    }

    fn set_inverted(&mut self, inverted: bool, notes: &mut Vec<String>) {
        self.inverted = inverted;
        let byte = if inverted { SWITCH_PHASE_INVERT } else { 0 };
        let result = self
            .board
            .write_data(byte)
            .and_then(|_| self.board.write_control(SWITCH_LATCH))
            .and_then(|_| self.board.write_control(0))
            .and_then(|_| self.board.flush());
        if let Err(e) = result {
            self.fall_back(e, notes);
        }
    }

    fn read_adc(&mut self, notes: &mut Vec<String>) -> AdcSample {
        match self.adc.read(self.board.as_mut()) {
            Ok(sample) => {
                if sample.sync_dropped {
                    notes.push("ADC synchronisation lost; continuing without sync checks".into());
                }
                sample
            }
            Err(e) => {
                self.fall_back(e, notes);
                AdcSample {
                    magnitude: 0,
                    phase: 0,
                    sync_dropped: false,
                }
            }
        }
    }

    /// Loads R latches and the fixed LO2, resets correction state and picks the calibration.
    pub fn prepare_scan(&mut self, scan: &ScanConfig) -> Result<Vec<String>, ScanError> {
        scan.plan.validate()?;
        let mut notes = std::mem::take(&mut self.pending_notes);
        self.scan = scan.clone();
        self.continuity.reset();
        if let Err(e) = self.adc.resync(self.board.as_mut()) {
            self.fall_back(e, &mut notes);
        }
        self.first_step = true;
        self.corrector.plane_extension_ns = scan.plane_extension_ns;
        self.corrector.magnitude_table = self.calibration.magnitude_table().cloned();
        self.corrector.frequency_table = self.calibration.frequency_table().cloned();

        let if1 = self.hardware.lo_plan.if1_mhz();
        let lo2_settings = self.lo2.tune(self.hardware.lo_plan.lo2_mhz)?.clone();
        let mut frames = vec![self.lo2.r_frame(&lo2_settings)];
        frames.extend(self.lo2.step_frames(&lo2_settings));
        let lo1_settings = self.lo1.compute(if1)?;
        frames.push(self.lo1.r_frame(&lo1_settings));
        if let Some(lo3) = &self.lo3 {
            let lo3_settings = lo3.compute(if1)?;
            frames.push(lo3.r_frame(&lo3_settings));
        }
        // one frame per lane per write
        for frame in frames {
            self.send(&[frame], &mut notes);
        }
        self.set_inverted(false, &mut notes);

        self.active = scan
            .mode
            .cal_mode()
            .and_then(|mode| self.calibration.select(scan.calibration, mode, &scan.plan));
        let level = self.active.as_ref().map(|a| a.level);
        notes.push(format!(
            "scan prepared: {} points, {:?}, calibration {:?}",
            scan.plan.points(),
            scan.mode,
            level
        ));
        debug!("LO2 at {} MHz, R latches loaded", lo2_settings.actual_mhz);
        Ok(notes)
    }

    /// Programs the oscillators for `step`, captures it and applies every correction.
    pub fn capture_step(&mut self, scan_id: u64, step: usize) -> Result<StepOutcome, SynthError> {
        let mut notes = Vec::new();
        let freq = self.scan.plan.frequency(step);
        let lo_plan = self.hardware.lo_plan.clone();
        let band = lo_plan.band(freq);

        let lo1 = self.lo1.tune(lo_plan.lo1_mhz(freq, band))?.clone();
        let mut frames = self.lo1.step_frames(&lo1);
        let tracking = self.scan.mode != ScanMode::SpectrumAnalyzer;
        if tracking {
            if let Some(lo3) = self.lo3.as_mut() {
                let settings = lo3.tune(lo_plan.lo3_mhz(freq, lo1.actual_mhz, band))?.clone();
                frames.extend(lo3.step_frames(&settings));
            }
        }
        self.send(&frames, &mut notes);

        let settle = if self.first_step {
            self.scan.wait_ms + self.hardware.first_step_settle_ms
        } else {
            self.scan.wait_ms
        };
        self.board.wait(settle);
        let mut reading = self.read_adc(&mut notes);

        let magnitude_db = self.corrector.magnitude_db(reading.magnitude, freq);
        let phase_valid = tracking && magnitude_db >= self.hardware.noise_floor_dbm;
        if phase_valid {
            let raw = phase_degrees(reading.phase, self.adc.full_scale());
            if self.hardware.bad_quadrant.contains(raw) {
                let inverted = !self.inverted;
                self.set_inverted(inverted, &mut notes);
                self.board.wait(self.scan.wait_ms);
                reading = self.read_adc(&mut notes);
                let again = phase_degrees(reading.phase, self.adc.full_scale());
                if self.hardware.bad_quadrant.contains(again) {
                    warn!("step {}: phase still in the bad quadrant after inversion", step);
                    notes.push(format!(
                        "step {} ({:.6} MHz): phase {:.1} deg unreliable in both reference states",
                        step, freq, again
                    ));
                }
            }
        }
        let mut magnitude_db = self.corrector.magnitude_db(reading.magnitude, freq);
        if self.scan.magnitude_continuity {
            magnitude_db = self.continuity.correct_magnitude(magnitude_db, band);
        }
        let mut phase_deg = if phase_valid {
            self.corrector
                .phase_deg(reading.phase, reading.magnitude, freq, self.inverted, band)
        } else {
            0.0
        };
        let mut unwrapped = if phase_valid {
            self.continuity.unwrap_phase(phase_deg)
        } else {
            self.continuity.peek_phase(phase_deg)
        };
        let raw_magnitude_db = magnitude_db;

        if let Some((db, deg)) = self.apply_calibration(step, freq, magnitude_db, phase_deg) {
            unwrapped += if phase_valid {
                self.continuity.track_offset(deg - phase_deg)
            } else {
                self.continuity.peek_offset(deg - phase_deg)
            };
            magnitude_db = db;
            phase_deg = deg;
        }
        self.first_step = false;

        Ok(StepOutcome {
            sample: StepSample {
                scan_id,
                step,
                freq_mhz: freq,
                band,
                mag_code: reading.magnitude,
                phase_code: reading.phase,
                raw_magnitude_db,
                magnitude_db,
                phase_deg,
                phase_unwrapped_deg: unwrapped,
                phase_valid,
                inverted: self.inverted,
                timestamp: SystemTime::now(),
            },
            notes,
        })
    }

    /// Reference subtraction, then the OSL error model in reflection mode.
    fn apply_calibration(&self, step: usize, freq: f64, db: f64, deg: f64) -> Option<(f64, f64)> {
        if self.scan.mode == ScanMode::Reflection {
            if let Some(osl) = self.calibration.osl().filter(|_| self.scan.calibration != CalLevel::None) {
                let (ref_db, ref_deg) = osl.reference().value_at(freq);
                let measured = polar(db - ref_db, wrap180(deg - ref_deg));
                let (db, deg) = to_db_deg(osl.correct(freq, measured));
                return Some((db, wrap180(deg)));
            }
        }
        let active = self.active.as_ref()?;
        let (cal_db, cal_deg) = active.at_step(step);
        Some((db - cal_db, wrap180(deg - cal_deg)))
    }

    pub fn frequency_band(&self, step: usize) -> FrequencyBand {
        self.hardware.lo_plan.band(self.scan.plan.frequency(step))
    }
}
