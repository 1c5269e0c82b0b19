//! Impedance and S-parameter transforms for series/shunt fixtures and reflection bridges.
//!
//! Angles are in degrees, frequencies in MHz, delays in ns. Impedances that
//! would blow up are capped at [`MAX_IMPEDANCE`].
use std::f64::consts::PI;

use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Largest impedance magnitude reported (ohms).
pub const MAX_IMPEDANCE: f64 = 1e9;
/// Characteristic impedance of the fixture connectors.
pub const CONNECTOR_Z0: f64 = 50.0;

/// How the device under test sits in a transmission fixture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Jig {
    #[default]
    Series,
    Shunt,
}

pub fn polar(db: f64, deg: f64) -> Complex64 {
    Complex64::from_polar(10f64.powf(db / 20.0), deg.to_radians())
}

pub fn to_db_deg(value: Complex64) -> (f64, f64) {
    let mag = value.norm().max(1e-15);
    (20.0 * mag.log10(), value.arg().to_degrees())
}

fn cap(z: Complex64) -> Complex64 {
    if !z.re.is_finite() || !z.im.is_finite() {
        return Complex64::new(MAX_IMPEDANCE, 0.0);
    }
    let norm = z.norm();
    if norm > MAX_IMPEDANCE {
        z * (MAX_IMPEDANCE / norm)
    } else {
        z
    }
}

/// Inverse of S21 with gain clamped to unity.
fn inverted_s21(db: f64, deg: f64) -> Complex64 {
    polar(-db.min(0.0), -deg)
}

/// Impedance of a part in series between source and load, from S21.
pub fn series_jig_impedance(db: f64, deg: f64, r0: f64) -> Complex64 {
    if db.abs() < 0.001 && deg.abs() < 0.5 {
        // near-unity transmission: only the reactance is resolvable
        return Complex64::new(0.0, -2.0 * r0 * deg.to_radians().tan());
    }
    let z = (inverted_s21(db, deg) - 1.0) * (2.0 * r0);
    cap(Complex64::new(z.re.max(0.0), z.im))
}

/// Impedance of a part shunted across the line, from S21. `delay_ns` removes the
/// connector between the line and the part.
pub fn shunt_jig_impedance(db: f64, deg: f64, r0: f64, delay_ns: f64, freq_mhz: f64) -> Complex64 {
    let denom = inverted_s21(db, deg) - 1.0;
    if denom.norm() < 1e-12 {
        return Complex64::new(MAX_IMPEDANCE, 0.0);
    }
    let z = Complex64::new(r0 / 2.0, 0.0) / denom;
    let z = Complex64::new(z.re.max(0.0), z.im);
    if delay_ns == 0.0 {
        return cap(z);
    }
    let theta = (-0.36 * delay_ns * freq_mhz).to_radians();
    cap(remove_line(z, CONNECTOR_Z0, theta))
}

/// Impedance at the far end of a lossless line of electrical length `theta` whose input sees `z`.
pub fn remove_line(z: Complex64, z0: f64, theta: f64) -> Complex64 {
    let j = Complex64::new(0.0, 1.0);
    let t = theta.tan();
    let denom = Complex64::new(z0, 0.0) - j * z * t;
    if denom.norm() < 1e-15 {
        return Complex64::new(MAX_IMPEDANCE, 0.0);
    }
    (z - j * z0 * t) * z0 / denom
}

pub fn reflection_to_impedance(gamma: Complex64, r0: f64) -> Complex64 {
    let denom = Complex64::new(1.0, 0.0) - gamma;
    if denom.norm() < 1e-12 {
        return Complex64::new(MAX_IMPEDANCE, 0.0);
    }
    cap((Complex64::new(1.0, 0.0) + gamma) / denom * r0)
}

pub fn impedance_to_reflection(z: Complex64, r0: f64) -> Complex64 {
    let denom = z + r0;
    if denom.norm() < 1e-15 {
        return Complex64::new(-1.0, 0.0);
    }
    (z - r0) / denom
}

/// Impedance implied by a transmission measurement in the given fixture.
pub fn transmission_to_impedance(jig: Jig, s21: Complex64, r0: f64) -> Complex64 {
    if s21.norm() < 1e-15 {
        return match jig {
            Jig::Series => Complex64::new(MAX_IMPEDANCE, 0.0),
            Jig::Shunt => Complex64::new(0.0, 0.0),
        };
    }
    let inv = Complex64::new(1.0, 0.0) / s21 - 1.0;
    match jig {
        Jig::Series => cap(inv * (2.0 * r0)),
        Jig::Shunt => {
            if inv.norm() < 1e-15 {
                Complex64::new(MAX_IMPEDANCE, 0.0)
            } else {
                cap(Complex64::new(r0, 0.0) / (inv * 2.0))
            }
        }
    }
}

/// Equivalent S11 of a transmission measurement, optionally pulled back onto the unit circle.
pub fn transmission_to_reflection(jig: Jig, s21: Complex64, r0: f64, clamp: bool) -> Complex64 {
    let gamma = impedance_to_reflection(transmission_to_impedance(jig, s21, r0), r0);
    if clamp && gamma.norm() > 1.0 {
        gamma / gamma.norm()
    } else {
        gamma
    }
}

pub fn return_loss_db(gamma: Complex64) -> f64 {
    -20.0 * gamma.norm().max(1e-15).log10()
}

pub fn vswr(gamma: Complex64) -> f64 {
    let rho = gamma.norm();
    if rho >= 1.0 {
        f64::INFINITY
    } else {
        (1.0 + rho) / (1.0 - rho)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reactance {
    /// Henries.
    Inductance(f64),
    /// Farads.
    Capacitance(f64),
    None,
}

/// Resistance plus a single L or C at one frequency.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Equivalent {
    pub resistance: f64,
    pub reactance_ohms: f64,
    pub reactance: Reactance,
    pub q: f64,
}

fn angular(freq_mhz: f64) -> f64 {
    2.0 * PI * freq_mhz * 1e6
}

fn reactance_component(x: f64, omega: f64) -> Reactance {
    if x > 0.0 {
        Reactance::Inductance(x / omega)
    } else if x < 0.0 {
        Reactance::Capacitance(-1.0 / (omega * x))
    } else {
        Reactance::None
    }
}

fn quality(resistance: f64, reactance: f64, parallel: bool) -> f64 {
    let (num, den) = if parallel {
        (resistance, reactance.abs())
    } else {
        (reactance.abs(), resistance)
    };
    if den == 0.0 {
        f64::INFINITY
    } else {
        num / den
    }
}

pub fn series_equivalent(z: Complex64, freq_mhz: f64) -> Equivalent {
    Equivalent {
        resistance: z.re,
        reactance_ohms: z.im,
        reactance: reactance_component(z.im, angular(freq_mhz)),
        q: quality(z.re, z.im, false),
    }
}

pub fn parallel_equivalent(z: Complex64, freq_mhz: f64) -> Equivalent {
    if z.norm() == 0.0 {
        return series_equivalent(z, freq_mhz);
    }
    let y = Complex64::new(1.0, 0.0) / z;
    let resistance = if y.re == 0.0 { f64::INFINITY } else { 1.0 / y.re };
    let reactance = if y.im == 0.0 { f64::INFINITY } else { -1.0 / y.im };
    let component = if y.im == 0.0 {
        Reactance::None
    } else {
        reactance_component(reactance, angular(freq_mhz))
    };
    Equivalent {
        resistance,
        reactance_ohms: reactance,
        reactance: component,
        q: quality(resistance, reactance, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Complex64, b: Complex64, tol: f64) -> bool {
        (a - b).norm() < tol
    }

    #[test]
    fn series_jig_unity_transmission_is_zero_ohms() {
        let z = series_jig_impedance(0.0, 0.0, 50.0);
        assert_eq!(z.re, 0.0);
        assert_eq!(z.im, 0.0);
    }

    #[test]
    fn half_voltage_through_each_jig() {
        let db = 20.0 * 0.5f64.log10();
        assert!(close(series_jig_impedance(db, 0.0, 50.0), Complex64::new(100.0, 0.0), 1e-9));
        assert!(close(shunt_jig_impedance(db, 0.0, 50.0, 0.0, 10.0), Complex64::new(25.0, 0.0), 1e-9));
    }

    #[test]
    fn shunt_connector_delay_is_removed() {
        let db = 20.0 * 0.5f64.log10();
        // 0.5 ns at 250 MHz is 45 degrees of line in front of the 25 ohm part
        let z = shunt_jig_impedance(db, 0.0, 50.0, 0.5, 250.0);
        assert!(close(z, Complex64::new(40.0, 30.0), 1e-9), "{}", z);
        let lower = shunt_jig_impedance(db, 0.0, 50.0, 0.5, 100.0);
        assert!(!close(lower, z, 1.0));
        assert!(lower.im > 0.0 && lower.im < z.im);
    }

    #[test]
    fn small_phase_uses_tangent_path() {
        let z = series_jig_impedance(0.0, 0.2, 50.0);
        assert_eq!(z.re, 0.0);
        assert!((z.im - -100.0 * 0.2f64.to_radians().tan()).abs() < 1e-12);
    }

    #[test]
    fn matched_connector_delay_is_transparent() {
        let z = remove_line(Complex64::new(50.0, 0.0), 50.0, 0.7);
        assert!(close(z, Complex64::new(50.0, 0.0), 1e-9));
        // a quarter wave turns 100 ohms into 25
        let z = remove_line(Complex64::new(100.0, 0.0), 50.0, -PI / 2.0 + 1e-9);
        assert!(close(z, Complex64::new(25.0, 0.0), 1e-3));
    }

    #[test]
    fn reflection_impedance_round_trip() {
        let gamma = Complex64::new(1.0 / 3.0, 0.0);
        let z = reflection_to_impedance(gamma, 50.0);
        assert!(close(z, Complex64::new(100.0, 0.0), 1e-9));
        assert!(close(impedance_to_reflection(z, 50.0), gamma, 1e-12));
        assert!((vswr(gamma) - 2.0).abs() < 1e-12);
        assert!((return_loss_db(gamma) - 9.542425094).abs() < 1e-6);
        assert_eq!(reflection_to_impedance(Complex64::new(1.0, 0.0), 50.0).re, MAX_IMPEDANCE);
    }

    #[test]
    fn transmission_equivalents_match_jig_formulas() {
        let s21 = Complex64::new(0.5, 0.0);
        let series = transmission_to_impedance(Jig::Series, s21, 50.0);
        assert!(close(series, Complex64::new(100.0, 0.0), 1e-9));
        let shunt = transmission_to_impedance(Jig::Shunt, s21, 50.0);
        assert!(close(shunt, Complex64::new(25.0, 0.0), 1e-9));
        let gamma = transmission_to_reflection(Jig::Series, s21, 50.0, true);
        assert!(close(gamma, Complex64::new(1.0 / 3.0, 0.0), 1e-12));
        let gamma = transmission_to_reflection(Jig::Series, Complex64::new(-0.5, 0.0), 50.0, true);
        assert!(gamma.norm() <= 1.0 + 1e-12);
    }

    #[test]
    fn series_and_parallel_equivalents() {
        let omega = angular(1.0);
        let z = Complex64::new(10.0, omega * 10e-6);
        let eq = series_equivalent(z, 1.0);
        match eq.reactance {
            Reactance::Inductance(l) => assert!((l - 10e-6).abs() < 1e-15),
            other => panic!("expected inductance, got {:?}", other),
        }
        assert!((eq.q - omega * 10e-6 / 10.0).abs() < 1e-9);

        let c = 100e-12;
        let z = Complex64::new(0.0, -1.0 / (omega * c));
        match parallel_equivalent(z, 1.0).reactance {
            Reactance::Capacitance(found) => assert!((found - c).abs() / c < 1e-9),
            other => panic!("expected capacitance, got {:?}", other),
        }
    }
}
