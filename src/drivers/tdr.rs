//! Time-domain reflectometry from a reflection sweep.
use rustfft::{num_complex::Complex64, FftPlanner};

use crate::drivers::error::ParameterError;
use crate::drivers::network::{reflection_to_impedance, MAX_IMPEDANCE};

pub const MIN_TDR_POINTS: usize = 8;

/// Responses against round-trip time.
#[derive(Clone, Debug)]
pub struct TdrResponse {
    pub time_ns: Vec<f64>,
    pub impulse: Vec<f64>,
    pub step: Vec<f64>,
    pub impedance: Vec<f64>,
}

/// Builds the TDR response of an S11 trace taken on a uniform linear grid that
/// starts at DC or at one grid step.
pub fn transform(freqs_mhz: &[f64], s11: &[Complex64], r0: f64) -> Result<TdrResponse, ParameterError> {
    let unsuitable = ParameterError::UnsuitableSweep { min: MIN_TDR_POINTS };
    if freqs_mhz.len() < MIN_TDR_POINTS || freqs_mhz.len() != s11.len() {
        return Err(unsuitable);
    }
    let df = freqs_mhz[1] - freqs_mhz[0];
    if !(df > 0.0) {
        return Err(unsuitable);
    }
    let uniform = freqs_mhz
        .windows(2)
        .all(|w| ((w[1] - w[0]) - df).abs() <= 1e-6 * df);
    let first_bin = (freqs_mhz[0] / df).round();
    if !uniform || first_bin > 1.0 || (freqs_mhz[0] - first_bin * df).abs() > 1e-6 * df {
        return Err(unsuitable);
    }

    let mut spectrum: Vec<Complex64> = Vec::with_capacity(s11.len() + 1);
    if first_bin == 1.0 {
        // DC is not measured; a reflection at DC is real
        spectrum.push(Complex64::new(s11[0].re, 0.0));
    }
    spectrum.extend_from_slice(s11);
    let bins = spectrum.len();
    let size = (4 * bins).next_power_of_two();

    let mut buffer = vec![Complex64::new(0.0, 0.0); size];
    for (k, value) in spectrum.iter().enumerate() {
        let window = 0.5 * (1.0 + (std::f64::consts::PI * k as f64 / bins as f64).cos());
        let v = *value * window;
        buffer[k] = if k == 0 { Complex64::new(v.re, 0.0) } else { v };
        if k > 0 {
            buffer[size - k] = v.conj();
        }
    }
    let mut planner = FftPlanner::<f64>::new();
    let ifft = planner.plan_fft_inverse(size);
    ifft.process(&mut buffer);
    let impulse_full: Vec<f64> = buffer.iter().map(|c| c.re / size as f64).collect();

    let half = size / 2;
    // the windowed impulse is spread around t = 0; its negative-time half wrapped to the end
    let mut running: f64 = impulse_full[half..].iter().sum();
    let mut step = Vec::with_capacity(half);
    for &h in &impulse_full[..half] {
        running += h;
        step.push(running);
    }
    let dt_ns = 1e3 / (size as f64 * df);
    let impedance = step
        .iter()
        .map(|&rho| {
            reflection_to_impedance(Complex64::new(rho, 0.0), r0)
                .re
                .clamp(0.0, MAX_IMPEDANCE)
        })
        .collect();
    Ok(TdrResponse {
        time_ns: (0..half).map(|n| n as f64 * dt_ns).collect(),
        impulse: impulse_full[..half].to_vec(),
        step,
        impedance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(points: usize, df: f64) -> Vec<f64> {
        (0..points).map(|k| k as f64 * df).collect()
    }

    #[test]
    fn resistive_load_settles_to_its_impedance() {
        let freqs = grid(128, 1.0);
        let s11 = vec![Complex64::new(1.0 / 3.0, 0.0); freqs.len()];
        let tdr = transform(&freqs, &s11, 50.0).unwrap();
        let idx = tdr.step.len() / 2;
        assert!((tdr.impedance[idx] - 100.0).abs() < 0.5, "{}", tdr.impedance[idx]);
    }

    #[test]
    fn delayed_open_shows_up_at_its_round_trip_time() {
        let freqs = grid(256, 1.0);
        let delay_ns = 100.0;
        let s11: Vec<Complex64> = freqs
            .iter()
            .map(|f| Complex64::from_polar(1.0, -2.0 * std::f64::consts::PI * f * 1e-3 * delay_ns))
            .collect();
        let tdr = transform(&freqs, &s11, 50.0).unwrap();
        let at = |t: f64| {
            let i = tdr.time_ns.iter().position(|&x| x >= t).unwrap();
            tdr.step[i]
        };
        assert!(at(50.0).abs() < 0.05);
        assert!((at(200.0) - 1.0).abs() < 0.05);
    }

    #[test]
    fn irregular_grids_are_rejected() {
        let mut freqs = grid(16, 1.0);
        freqs[5] += 0.3;
        let s11 = vec![Complex64::new(0.0, 0.0); 16];
        assert!(transform(&freqs, &s11, 50.0).is_err());
        let freqs: Vec<f64> = (0..16).map(|k| 10.0 + k as f64).collect();
        assert!(transform(&freqs, &s11, 50.0).is_err());
        assert!(transform(&grid(4, 1.0), &s11[..4], 50.0).is_err());
    }
}
