// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::drivers::calibration::{CalLevel, CalMode};
use crate::drivers::capture::BadQuadrant;
use crate::drivers::plan::{Direction, LoPlan, SweepPlan};
use crate::drivers::synth::{DdsConfig, OscillatorConfig, PdPolarity, PllFamily};

pub use crate::drivers::bus::MAX_LANE;

/// Static description of the instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub master_clock_mhz: f64,
    pub lo_plan: LoPlan,
    pub lo1: OscillatorConfig,
    pub lo2: OscillatorConfig,
    /// Tracking generator; `None` on spectrum-analyzer-only builds.
    pub lo3: Option<OscillatorConfig>,
    pub adc_bits: u32,
    pub keep_sync: bool,
    pub sync_retry_budget: u32,
    pub board_version: u8,
    /// Extra settle time before the first step of a scan.
    pub first_step_settle_ms: u32,
    /// Readings below this carry no usable phase.
    pub noise_floor_dbm: f64,
    pub bad_quadrant: BadQuadrant,
    pub inversion_offset_deg: f64,
    pub magnitude_table: Option<PathBuf>,
    pub frequency_table: Option<PathBuf>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let dds = |lane| DdsConfig {
            nominal_mhz: 10.7,
            filter_bw_mhz: 0.015,
            lane,
        };
        Self {
            master_clock_mhz: 64.0,
            lo_plan: LoPlan::default(),
            lo1: OscillatorConfig {
                id: 1,
                family: PllFamily::Lmx2326,
                reference_mhz: 64.0,
                nominal_pdf_mhz: 0.974,
                polarity: PdPolarity::Positive,
                dds: Some(dds(0)),
                pll_lane: 1,
            },
            lo2: OscillatorConfig {
                id: 2,
                family: PllFamily::Lmx2326,
                reference_mhz: 64.0,
                nominal_pdf_mhz: 4.0,
                polarity: PdPolarity::Positive,
                dds: None,
                pll_lane: 2,
            },
            lo3: Some(OscillatorConfig {
                id: 3,
                family: PllFamily::Lmx2326,
                reference_mhz: 64.0,
                nominal_pdf_mhz: 0.974,
                polarity: PdPolarity::Positive,
                dds: Some(dds(3)),
                pll_lane: 4,
            }),
            adc_bits: 16,
            keep_sync: true,
            sync_retry_budget: 3,
            board_version: crate::drivers::board::BOARD_VERSION,
            first_step_settle_ms: 100,
            noise_floor_dbm: -110.0,
            bad_quadrant: BadQuadrant::default(),
            inversion_offset_deg: 180.0,
            magnitude_table: None,
            frequency_table: None,
        }
    }
}

impl HardwareConfig {
    pub fn oscillators(&self) -> impl Iterator<Item = &OscillatorConfig> {
        [Some(&self.lo1), Some(&self.lo2), self.lo3.as_ref()].into_iter().flatten()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.master_clock_mhz > 0.0) {
            return Err(anyhow!("master clock must be positive"));
        }
        if self.adc_bits == 0 || self.adc_bits > 24 {
            return Err(anyhow!("unsupported ADC width {}", self.adc_bits));
        }
        let mut lanes = Vec::new();
        for osc in self.oscillators() {
            lanes.push(osc.pll_lane);
            lanes.extend(osc.dds.map(|d| d.lane));
        }
        if let Some(lane) = lanes.iter().find(|&&l| l > MAX_LANE) {
            return Err(anyhow!("device lane {} collides with the switch latch", lane));
        }
        let mut sorted = lanes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != lanes.len() {
            return Err(anyhow!("two devices share a data lane"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Magnitude only; no tracking generator phase.
    SpectrumAnalyzer,
    #[default]
    Transmission,
    Reflection,
}

impl ScanMode {
    pub fn cal_mode(self) -> Option<CalMode> {
        match self {
            ScanMode::SpectrumAnalyzer => None,
            ScanMode::Transmission => Some(CalMode::Transmission),
            ScanMode::Reflection => Some(CalMode::Reflection),
        }
    }
}

/// Per-scan settings passed to `configure_and_start`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub plan: SweepPlan,
    pub direction: Direction,
    pub mode: ScanMode,
    pub wait_ms: u32,
    pub magnitude_continuity: bool,
    pub calibration: CalLevel,
    pub plane_extension_ns: f64,
    /// Stop after one full traversal instead of sweeping continuously.
    pub halt_at_end: bool,
    pub update_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            plan: SweepPlan::default(),
            direction: Direction::Forward,
            mode: ScanMode::Transmission,
            wait_ms: 5,
            magnitude_continuity: false,
            calibration: CalLevel::Band,
            plane_extension_ns: 0.0,
            halt_at_end: false,
            update_interval_ms: 100,
        }
    }
}

/// Instrument plus scan settings, as stored on disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub hardware: HardwareConfig,
    pub scan: ScanConfig,
}

pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HardwareConfig::default().validate().unwrap();
        assert_eq!(HardwareConfig::default().oscillators().count(), 3);
    }

    #[test]
    fn lane_on_latch_bit_is_rejected() {
        let mut hw = HardwareConfig::default();
        hw.lo2.pll_lane = 7;
        assert!(hw.validate().is_err());
        let mut hw = HardwareConfig::default();
        hw.lo2.pll_lane = 1;
        assert!(hw.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{"scan": {"wait_ms": 20, "mode": "Reflection"}}"#).unwrap();
        assert_eq!(cfg.scan.wait_ms, 20);
        assert_eq!(cfg.scan.mode, ScanMode::Reflection);
        assert_eq!(cfg.hardware, HardwareConfig::default());
    }

    #[test]
    fn json_file_round_trip() {
        let path = std::env::temp_dir().join(format!("msa-core-config-{}.json", std::process::id()));
        let mut cfg = AppConfig::default();
        cfg.scan.halt_at_end = true;
        save_json(&path, &cfg).unwrap();
        let loaded: AppConfig = load_json(&path).unwrap();
        assert!(loaded.scan.halt_at_end);
        assert_eq!(loaded.scan.plan.steps, cfg.scan.plan.steps);
        assert_eq!(loaded.hardware.lo1.family, PllFamily::Lmx2326);
        assert!((loaded.hardware.lo1.nominal_pdf_mhz - 0.974).abs() < 1e-12);
        let _ = fs::remove_file(&path);
        assert!(load_json::<AppConfig>(&path).is_err());
    }
}
