//! Motional parameters of a quartz crystal measured in a series fixture.
use std::f64::consts::PI;

use log::debug;

use crate::drivers::error::ParameterError;

/// Markers read off a series-jig S21 sweep around the series resonance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResonanceMarkers {
    pub fs_mhz: f64,
    pub fp_mhz: f64,
    /// S21 at the series resonance, dB.
    pub peak_db: f64,
    pub low_3db_mhz: f64,
    pub high_3db_mhz: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CrystalParameters {
    pub fs_mhz: f64,
    pub fp_mhz: f64,
    pub rm_ohms: f64,
    pub lm_henries: f64,
    pub cm_farads: f64,
    pub cp_farads: f64,
    pub loaded_q: f64,
    pub unloaded_q: f64,
}

/// Extracts the Butterworth-Van Dyke model. `r0` is the fixture's source/load resistance.
pub fn extract(markers: &ResonanceMarkers, r0: f64) -> Result<CrystalParameters, ParameterError> {
    let ResonanceMarkers {
        fs_mhz,
        fp_mhz,
        peak_db,
        low_3db_mhz,
        high_3db_mhz,
    } = *markers;
    if !(fs_mhz > 0.0) || !(fp_mhz > 0.0) {
        return Err(ParameterError::NonPositiveFrequency { fs: fs_mhz, fp: fp_mhz });
    }
    if !(low_3db_mhz < fs_mhz && fs_mhz < high_3db_mhz) {
        return Err(ParameterError::BandwidthNotStraddling {
            low: low_3db_mhz,
            high: high_3db_mhz,
            fs: fs_mhz,
        });
    }
    if fp_mhz <= fs_mhz {
        return Err(ParameterError::ParallelBelowSeries { fs: fs_mhz, fp: fp_mhz });
    }
    if !(r0 > 0.0) {
        return Err(ParameterError::NonPositiveReference(r0));
    }
    if peak_db > 0.0 {
        return Err(ParameterError::PeakAboveZero(peak_db));
    }

    let rm = 2.0 * r0 * (10f64.powf(-peak_db / 20.0) - 1.0);
    let r_eff = rm + 2.0 * r0;
    let loaded_q = fs_mhz / (high_3db_mhz - low_3db_mhz);
    let ws = 2.0 * PI * fs_mhz * 1e6;
    let wp = 2.0 * PI * fp_mhz * 1e6;
    let lm = loaded_q * r_eff / ws;
    let cm = 1.0 / (ws * ws * lm);
    let xp = wp * lm - 1.0 / (wp * cm);
    let cp = 1.0 / (wp * xp);
    let unloaded_q = if rm > 0.0 { loaded_q * r_eff / rm } else { f64::INFINITY };
    debug!(
        "crystal fs={} MHz rm={:.4} lm={:.6e} cm={:.6e} cp={:.6e}",
        fs_mhz, rm, lm, cm, cp
    );
    Ok(CrystalParameters {
        fs_mhz,
        fp_mhz,
        rm_ohms: rm,
        lm_henries: lm,
        cm_farads: cm,
        cp_farads: cp,
        loaded_q,
        unloaded_q,
    })
}

/// Finds the markers on a `(MHz, dB)` trace: series resonance at the maximum,
/// parallel resonance at the deepest point above it, -3 dB points interpolated.
pub fn locate_resonances(trace: &[(f64, f64)]) -> Result<ResonanceMarkers, ParameterError> {
    if trace.len() < 3 {
        return Err(ParameterError::Measurement("trace too short".into()));
    }
    let peak = (0..trace.len())
        .max_by(|&a, &b| trace[a].1.total_cmp(&trace[b].1))
        .ok_or_else(|| ParameterError::Measurement("empty trace".into()))?;
    let notch = (peak..trace.len())
        .min_by(|&a, &b| trace[a].1.total_cmp(&trace[b].1))
        .filter(|&n| n > peak)
        .ok_or_else(|| ParameterError::Measurement("no parallel resonance above the peak".into()))?;
    let (fs, peak_db) = trace[peak];
    let threshold = peak_db - 3.0;
    let crossing = |step: isize| -> Option<f64> {
        let mut k = peak as isize;
        loop {
            let next = k + step;
            if next < 0 || next as usize >= trace.len() {
                return None;
            }
            let (fa, da) = trace[k as usize];
            let (fb, db) = trace[next as usize];
            if db < threshold {
                let t = (threshold - da) / (db - da);
                return Some(fa + (fb - fa) * t);
            }
            k = next;
        }
    };
    let low = crossing(-1);
    let high = crossing(1);
    match (low, high) {
        (Some(low), Some(high)) => Ok(ResonanceMarkers {
            fs_mhz: fs,
            fp_mhz: trace[notch].0,
            peak_db,
            low_3db_mhz: low,
            high_3db_mhz: high,
        }),
        _ => Err(ParameterError::BandwidthNotStraddling {
            low: low.unwrap_or(f64::NAN),
            high: high.unwrap_or(f64::NAN),
            fs,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::num_complex::Complex64;

    fn reference_markers() -> ResonanceMarkers {
        ResonanceMarkers {
            fs_mhz: 20.015627,
            fp_mhz: 20.07,
            peak_db: -1.97,
            low_3db_mhz: 20.014599,
            high_3db_mhz: 20.016655,
        }
    }

    fn within(actual: f64, expected: f64, rel: f64) -> bool {
        ((actual - expected) / expected).abs() < rel
    }

    #[test]
    fn reference_crystal_matches_known_values() {
        let p = extract(&reference_markers(), 12.5).unwrap();
        assert!(within(p.rm_ohms, 6.36, 0.01), "rm {}", p.rm_ohms);
        assert!(within(p.cm_farads, 26.04e-15, 0.01), "cm {}", p.cm_farads);
        assert!(within(p.lm_henries, 2427.9e-6, 0.01), "lm {}", p.lm_henries);
        assert!(within(p.cp_farads, 4.79e-12, 0.01), "cp {}", p.cp_farads);
        assert!(p.unloaded_q > p.loaded_q);
    }

    #[test]
    fn inconsistent_markers_are_rejected() {
        let mut m = reference_markers();
        m.low_3db_mhz = 20.0157;
        assert!(matches!(
            extract(&m, 12.5),
            Err(ParameterError::BandwidthNotStraddling { .. })
        ));
        let mut m = reference_markers();
        m.fp_mhz = 20.0;
        assert!(matches!(extract(&m, 12.5), Err(ParameterError::ParallelBelowSeries { .. })));
        let mut m = reference_markers();
        m.fs_mhz = 0.0;
        assert!(matches!(extract(&m, 12.5), Err(ParameterError::NonPositiveFrequency { .. })));
        assert!(matches!(
            extract(&reference_markers(), 0.0),
            Err(ParameterError::NonPositiveReference(_))
        ));
        let mut m = reference_markers();
        m.peak_db = 0.5;
        assert!(matches!(extract(&m, 12.5), Err(ParameterError::PeakAboveZero(_))));
    }

    #[test]
    fn markers_located_on_modelled_sweep() {
        let (r0, rm, lm, cm, cp) = (12.5, 6.3646, 2427.93e-6, 26.041e-15, 4.7866e-12);
        let n = 100_001;
        let trace: Vec<(f64, f64)> = (0..n)
            .map(|i| {
                let f = 20.0 + i as f64 * 0.1 / (n - 1) as f64;
                let w = 2.0 * PI * f * 1e6;
                let j = Complex64::new(0.0, 1.0);
                let zm = Complex64::new(rm, 0.0) + j * (w * lm) + Complex64::new(1.0, 0.0) / (j * (w * cm));
                let zp = Complex64::new(1.0, 0.0) / (j * (w * cp));
                let z = zm * zp / (zm + zp);
                let s21 = Complex64::new(2.0 * r0, 0.0) / (z + 2.0 * r0);
                (f, 20.0 * s21.norm().log10())
            })
            .collect();
        let markers = locate_resonances(&trace).unwrap();
        assert!((markers.fs_mhz - 20.0158).abs() < 1e-4);
        assert!((markers.fp_mhz - 20.0702).abs() < 1e-3);
        let p = extract(&markers, r0).unwrap();
        assert!(within(p.rm_ohms, rm, 0.01));
        assert!(within(p.lm_henries, lm, 0.01));
        assert!(within(p.cp_farads, cp, 0.01));
    }

    #[test]
    fn flat_trace_has_no_bandwidth() {
        let trace: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, -1.0 - i as f64 * 0.01)).collect();
        assert!(locate_resonances(&trace).is_err());
    }
}
