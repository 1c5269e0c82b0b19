//! Integer-N PLL and DDS register computation for the three local oscillators.
//!
//! LO1 and LO3 are PLLs whose reference is a DDS running near a crystal-filter
//! center frequency; the DDS is retuned every step so the PLL lands exactly on
//! the target. LO2 is a fixed PLL referenced straight to the master clock.
//!
//! Per step:
//! - R = round(reference / nominal phase-detector frequency)
//! - N = round(target / phase-detector frequency), split into B = N / 32, A = N % 32
//! - DDS output = (target / N) * R, tuning word = round(DDS * 2^32 / master clock)
use serde::{Deserialize, Serialize};

use crate::drivers::error::SynthError;

/// Dual-modulus prescaler used by every supported PLL (32/33).
pub const PRESELECTOR: u32 = 32;
/// DDS phase accumulator width.
pub const DDS_ACCUMULATOR: f64 = 4_294_967_296.0;
/// DDS serial frame: 32-bit tuning word plus one control byte.
pub const DDS_FRAME_BITS: u32 = 40;

/// Supported PLL families. Each one packs its R and N latches differently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PllFamily {
    Lmx2325,
    Lmx2326,
    Lmx2350,
    Lmx2353,
    Adf4112,
    Adf4113,
    Adf4118,
}

/// Phase-detector polarity bit carried in the N latch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdPolarity {
    #[default]
    Positive,
    Inverted,
}

#[derive(Clone, Copy, Debug)]
struct LatchLayout {
    control_bits: u32,
    n_control: u32,
    r_control: u32,
    a_bits: u32,
    b_bits: u32,
    r_bits: u32,
}

impl PllFamily {
    fn layout(self) -> LatchLayout {
        match self {
            PllFamily::Lmx2325 => LatchLayout {
                control_bits: 1,
                n_control: 0b1,
                r_control: 0b0,
                a_bits: 5,
                b_bits: 11,
                r_bits: 15,
            },
            PllFamily::Lmx2326 => LatchLayout {
                control_bits: 2,
                n_control: 0b01,
                r_control: 0b00,
                a_bits: 5,
                b_bits: 13,
                r_bits: 14,
            },
            PllFamily::Lmx2350 | PllFamily::Lmx2353 => LatchLayout {
                control_bits: 2,
                n_control: 0b11,
                r_control: 0b10,
                a_bits: 5,
                b_bits: 10,
                r_bits: 15,
            },
            PllFamily::Adf4112 | PllFamily::Adf4113 => LatchLayout {
                control_bits: 2,
                n_control: 0b01,
                r_control: 0b00,
                a_bits: 6,
                b_bits: 13,
                r_bits: 14,
            },
            PllFamily::Adf4118 => LatchLayout {
                control_bits: 2,
                n_control: 0b01,
                r_control: 0b00,
                a_bits: 5,
                b_bits: 13,
                r_bits: 14,
            },
        }
    }

    pub fn b_bits(self) -> u32 {
        self.layout().b_bits
    }

    pub fn max_b(self) -> u32 {
        (1 << self.layout().b_bits) - 1
    }

    pub fn max_r(self) -> u32 {
        (1 << self.layout().r_bits) - 1
    }

    /// Length of the N latch frame, polarity bit included.
    pub fn n_frame_bits(self) -> u32 {
        let l = self.layout();
        l.control_bits + l.a_bits + l.b_bits + 1
    }

    pub fn r_frame_bits(self) -> u32 {
        let l = self.layout();
        l.control_bits + l.r_bits
    }

    /// Packs A/B and the polarity bit into the N latch. Range checks happen in `compute`.
    pub fn pack_n(self, a: u32, b: u32, polarity: PdPolarity) -> u32 {
        let l = self.layout();
        let a_mask = (1 << l.a_bits) - 1;
        let b_mask = (1 << l.b_bits) - 1;
        let pol = match polarity {
            PdPolarity::Positive => 0,
            PdPolarity::Inverted => 1,
        };
        l.n_control
            | (a & a_mask) << l.control_bits
            | (b & b_mask) << (l.control_bits + l.a_bits)
            | pol << (l.control_bits + l.a_bits + l.b_bits)
    }

    pub fn pack_r(self, r: u32) -> u32 {
        let l = self.layout();
        l.r_control | (r & ((1 << l.r_bits) - 1)) << l.control_bits
    }
}

/// DDS stage feeding a PLL reference input.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DdsConfig {
    /// Center of the crystal filter behind the DDS.
    pub nominal_mhz: f64,
    /// Full passband of that filter.
    pub filter_bw_mhz: f64,
    /// Data lane of the DDS on the control board.
    pub lane: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OscillatorConfig {
    /// 1..=3
    pub id: u8,
    pub family: PllFamily,
    /// PLL reference when no DDS is fitted (normally the master clock).
    pub reference_mhz: f64,
    pub nominal_pdf_mhz: f64,
    #[serde(default)]
    pub polarity: PdPolarity,
    pub dds: Option<DdsConfig>,
    /// Data lane of the PLL on the control board.
    pub pll_lane: u8,
}

/// Everything `compute` derives for one target frequency.
#[derive(Clone, Debug, PartialEq)]
pub struct SynthSettings {
    pub target_mhz: f64,
    pub r_counter: u32,
    pub n_counter: u32,
    pub a_counter: u32,
    pub b_counter: u32,
    pub pdf_mhz: f64,
    pub dds_mhz: Option<f64>,
    pub dds_word: Option<u32>,
    pub actual_mhz: f64,
    pub n_word: u32,
    pub r_word: u32,
}

/// One serial frame for a device lane, sent MSB first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceFrame {
    pub lane: u8,
    pub word: u64,
    pub bits: u32,
}

pub fn dds_word(freq_mhz: f64, clock_mhz: f64) -> u32 {
    (freq_mhz * DDS_ACCUMULATOR / clock_mhz).round() as u32
}

pub fn dds_frequency(word: u32, clock_mhz: f64) -> f64 {
    word as f64 * clock_mhz / DDS_ACCUMULATOR
}

/// One local oscillator. Owned by the session; the scan worker is its only writer.
#[derive(Clone, Debug)]
pub struct Oscillator {
    config: OscillatorConfig,
    master_clock_mhz: f64,
    last: Option<SynthSettings>,
}

impl Oscillator {
    pub fn new(config: OscillatorConfig, master_clock_mhz: f64) -> Self {
        Self {
            config,
            master_clock_mhz,
            last: None,
        }
    }

    pub fn id(&self) -> u8 {
        self.config.id
    }

    pub fn config(&self) -> &OscillatorConfig {
        &self.config
    }

    pub fn last(&self) -> Option<&SynthSettings> {
        self.last.as_ref()
    }

    /// Pure register computation for `target_mhz`.
    pub fn compute(&self, target_mhz: f64) -> Result<SynthSettings, SynthError> {
        let id = self.config.id;
        let family = self.config.family;
        if !(target_mhz > 0.0) {
            return Err(SynthError::InvalidTarget { id, target_mhz });
        }
        let reference = self
            .config
            .dds
            .map(|d| d.nominal_mhz)
            .unwrap_or(self.config.reference_mhz);
        let r = ((reference / self.config.nominal_pdf_mhz).round() as u32).max(1);
        if r > family.max_r() {
            return Err(SynthError::RCounterOutOfRange {
                id,
                r,
                bits: family.layout().r_bits,
            });
        }
        let nominal_pdf = reference / r as f64;

        let n = (target_mhz / nominal_pdf).round() as u32;
        let b = n / PRESELECTOR;
        let a = n % PRESELECTOR;
        if b < 3 {
            return Err(SynthError::BCounterTooSmall { id, b });
        }
        if b > family.max_b() {
            return Err(SynthError::BCounterTooLarge {
                id,
                b,
                bits: family.b_bits(),
            });
        }
        if b < a {
            return Err(SynthError::BCounterBelowA { id, a, b });
        }

        let (pdf_mhz, dds_mhz, dds_word_value, actual_mhz) = match self.config.dds {
            Some(dds) => {
                let pdf = target_mhz / n as f64;
                let dds_out = pdf * r as f64;
                let half_bw = dds.filter_bw_mhz / 2.0;
                if (dds_out - dds.nominal_mhz).abs() > half_bw {
                    return Err(SynthError::DdsOutOfRange {
                        id,
                        actual_mhz: dds_out,
                        nominal_mhz: dds.nominal_mhz,
                        half_bw_mhz: half_bw,
                    });
                }
                let word = dds_word(dds_out, self.master_clock_mhz);
                let actual_dds = dds_frequency(word, self.master_clock_mhz);
                (pdf, Some(dds_out), Some(word), actual_dds / r as f64 * n as f64)
            }
            None => (nominal_pdf, None, None, nominal_pdf * n as f64),
        };

        Ok(SynthSettings {
            target_mhz,
            r_counter: r,
            n_counter: n,
            a_counter: a,
            b_counter: b,
            pdf_mhz,
            dds_mhz,
            dds_word: dds_word_value,
            actual_mhz,
            n_word: family.pack_n(a, b, self.config.polarity),
            r_word: family.pack_r(r),
        })
    }

    /// Computes and remembers the settings for this step.
    pub fn tune(&mut self, target_mhz: f64) -> Result<&SynthSettings, SynthError> {
        let settings = self.compute(target_mhz)?;
        Ok(self.last.insert(settings))
    }

    pub fn r_frame(&self, settings: &SynthSettings) -> DeviceFrame {
        DeviceFrame {
            lane: self.config.pll_lane,
            word: settings.r_word as u64,
            bits: self.config.family.r_frame_bits(),
        }
    }

    /// Per-step frames: the N latch plus the DDS word when a DDS is fitted.
    pub fn step_frames(&self, settings: &SynthSettings) -> Vec<DeviceFrame> {
        let mut frames = vec![DeviceFrame {
            lane: self.config.pll_lane,
            word: settings.n_word as u64,
            bits: self.config.family.n_frame_bits(),
        }];
        if let (Some(dds), Some(word)) = (self.config.dds, settings.dds_word) {
            frames.push(DeviceFrame {
                lane: dds.lane,
                word: word as u64,
                bits: DDS_FRAME_BITS,
            });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lo1() -> Oscillator {
        Oscillator::new(
            OscillatorConfig {
                id: 1,
                family: PllFamily::Lmx2326,
                reference_mhz: 64.0,
                nominal_pdf_mhz: 0.974,
                polarity: PdPolarity::Positive,
                dds: Some(DdsConfig {
                    nominal_mhz: 10.7,
                    filter_bw_mhz: 0.015,
                    lane: 0,
                }),
                pll_lane: 1,
            },
            64.0,
        )
    }

    fn lo2() -> Oscillator {
        Oscillator::new(
            OscillatorConfig {
                id: 2,
                family: PllFamily::Lmx2326,
                reference_mhz: 64.0,
                nominal_pdf_mhz: 4.0,
                polarity: PdPolarity::Positive,
                dds: None,
                pll_lane: 2,
            },
            64.0,
        )
    }

    #[test]
    fn lo1_counters_for_1024_mhz() {
        let s = lo1().compute(1024.0).unwrap();
        assert_eq!(s.r_counter, 11);
        assert_eq!(s.n_counter, 1053);
        assert_eq!(s.b_counter, 32);
        assert_eq!(s.a_counter, 29);
        let dds = s.dds_mhz.unwrap();
        assert!((dds - 10.7).abs() <= 0.0075);
        assert!((s.actual_mhz - 1024.0).abs() < 1e-5);
    }

    #[test]
    fn fixed_pll_without_dds() {
        let s = lo2().compute(1024.0).unwrap();
        assert_eq!(s.r_counter, 16);
        assert_eq!(s.n_counter, 256);
        assert_eq!((s.b_counter, s.a_counter), (8, 0));
        assert!(s.dds_word.is_none());
        assert_eq!(s.actual_mhz, 1024.0);
    }

    #[test]
    fn compute_is_idempotent() {
        let osc = lo1();
        for f in [1013.3, 1500.123456, 2000.0] {
            assert_eq!(osc.compute(f).unwrap(), osc.compute(f).unwrap());
        }
    }

    #[test]
    fn dds_word_round_trip_within_one_lsb() {
        let osc = lo1();
        for f in [1013.3, 1250.5, 1999.99] {
            let s = osc.compute(f).unwrap();
            let word = s.dds_word.unwrap();
            let again = dds_word(dds_frequency(word, 64.0), 64.0);
            assert!((again as i64 - word as i64).abs() <= 1);
        }
    }

    #[test]
    fn b_counter_below_three_is_rejected() {
        let err = lo2().compute(300.0).unwrap_err();
        assert_eq!(err, SynthError::BCounterTooSmall { id: 2, b: 2 });
    }

    #[test]
    fn b_below_a_is_rejected() {
        // N = 124 -> B = 3, A = 28
        let err = lo2().compute(124.0 * 4.0).unwrap_err();
        assert_eq!(err, SynthError::BCounterBelowA { id: 2, a: 28, b: 3 });
    }

    #[test]
    fn b_counter_overflow_is_rejected() {
        let mut cfg = lo2().config().clone();
        cfg.family = PllFamily::Lmx2350;
        let osc = Oscillator::new(cfg, 64.0);
        // N = 40000 -> B = 1250 > 1023
        assert!(matches!(
            osc.compute(160_000.0),
            Err(SynthError::BCounterTooLarge { b: 1250, bits: 10, .. })
        ));
    }

    #[test]
    fn dds_outside_filter_is_rejected() {
        let mut cfg = lo1().config().clone();
        if let Some(dds) = cfg.dds.as_mut() {
            dds.filter_bw_mhz = 0.0001;
        }
        let osc = Oscillator::new(cfg, 64.0);
        assert!(matches!(
            osc.compute(1013.3),
            Err(SynthError::DdsOutOfRange { id: 1, .. })
        ));
    }

    #[test]
    fn lmx2326_n_latch_layout() {
        let word = PllFamily::Lmx2326.pack_n(29, 32, PdPolarity::Inverted);
        assert_eq!(word & 0b11, 0b01);
        assert_eq!((word >> 2) & 0x1f, 29);
        assert_eq!((word >> 7) & 0x1fff, 32);
        assert_eq!(word >> 20, 1);
        assert_eq!(PllFamily::Lmx2326.n_frame_bits(), 21);
    }

    #[test]
    fn step_frames_include_dds() {
        let osc = lo1();
        let s = osc.compute(1100.0).unwrap();
        let frames = osc.step_frames(&s);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].bits, DDS_FRAME_BITS);
        assert_eq!(frames[1].word, s.dds_word.unwrap() as u64);
    }
}
