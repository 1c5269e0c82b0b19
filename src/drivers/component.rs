//! Component meter: picks the test frequency at which an unknown L, C or R reads best.
use std::f64::consts::PI;

use log::debug;
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::drivers::error::ParameterError;
use crate::drivers::network::{series_equivalent, Equivalent};

/// Fixed test frequencies available to the meter, ascending.
pub const TEST_FREQUENCIES_MHZ: [f64; 7] = [0.1, 0.3, 1.0, 3.0, 10.0, 30.0, 100.0];
pub const MAX_REFINEMENTS: usize = 3;

/// Something that can measure the unknown's impedance at a frequency.
pub trait ImpedanceSource {
    fn impedance_at(&mut self, freq_mhz: f64) -> Result<Complex64, ParameterError>;
}

impl<F> ImpedanceSource for F
where
    F: FnMut(f64) -> Result<Complex64, ParameterError>,
{
    fn impedance_at(&mut self, freq_mhz: f64) -> Result<Complex64, ParameterError> {
        (self)(freq_mhz)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Resistor,
    Capacitor,
    Inductor,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ComponentReading {
    pub kind: ComponentKind,
    /// Ohms, farads or henries.
    pub value: f64,
    pub freq_mhz: f64,
    pub equivalent: Equivalent,
    pub measurements: usize,
}

/// Iterative component meter. `ideal_ohms` is the reactance magnitude the fixture resolves best.
#[derive(Clone, Debug)]
pub struct ComponentMeter {
    pub kind: ComponentKind,
    pub ideal_ohms: f64,
}

impl ComponentMeter {
    pub fn new(kind: ComponentKind, ideal_ohms: f64) -> Self {
        Self { kind, ideal_ohms }
    }

    fn value(&self, z: Complex64, freq_mhz: f64) -> f64 {
        let omega = 2.0 * PI * freq_mhz * 1e6;
        match self.kind {
            ComponentKind::Resistor => z.re,
            ComponentKind::Capacitor => {
                if z.im == 0.0 {
                    f64::INFINITY
                } else {
                    -1.0 / (omega * z.im)
                }
            }
            ComponentKind::Inductor => z.im / omega,
        }
    }

    /// Frequency at which a component of `value` shows the ideal reactance.
    fn best_frequency(&self, value: f64) -> f64 {
        match self.kind {
            ComponentKind::Resistor => TEST_FREQUENCIES_MHZ[0],
            ComponentKind::Capacitor => 1.0 / (2.0 * PI * value * self.ideal_ohms) / 1e6,
            ComponentKind::Inductor => self.ideal_ohms / (2.0 * PI * value) / 1e6,
        }
    }

    /// Seed bracket from the impedance at the two extreme test frequencies.
    fn seed(&self, source: &mut dyn ImpedanceSource) -> Result<usize, ParameterError> {
        let last = TEST_FREQUENCIES_MHZ.len() - 1;
        if self.kind == ComponentKind::Resistor {
            return Ok(0);
        }
        let low = source.impedance_at(TEST_FREQUENCIES_MHZ[0])?.norm();
        let high = source.impedance_at(TEST_FREQUENCIES_MHZ[last])?.norm();
        let high_z_at_low = low > self.ideal_ohms;
        let high_z_at_high = high > self.ideal_ohms;
        let seed = match (self.kind, high_z_at_low, high_z_at_high) {
            // small capacitor: still high impedance at the top
            (ComponentKind::Capacitor, _, true) => last,
            // large capacitor: already low impedance at the bottom
            (ComponentKind::Capacitor, false, _) => 0,
            (ComponentKind::Inductor, true, _) => 0,
            (ComponentKind::Inductor, _, false) => last,
            _ => last / 2,
        };
        debug!("component meter seed {} MHz (|Z| {:.3e} .. {:.3e})", TEST_FREQUENCIES_MHZ[seed], low, high);
        Ok(seed)
    }

    pub fn measure(&self, source: &mut dyn ImpedanceSource) -> Result<ComponentReading, ParameterError> {
        let mut bracket = self.seed(source)?;
        let mut measurements = 0;
        loop {
            let freq = TEST_FREQUENCIES_MHZ[bracket];
            let z = source.impedance_at(freq)?;
            measurements += 1;
            let value = self.value(z, freq);
            let next = if value < 0.0 {
                // above self-resonance
                bracket.checked_sub(1)
            } else {
                Some(closest_bracket(self.best_frequency(value)))
            };
            let done = measurements > MAX_REFINEMENTS || next == Some(bracket) || next.is_none();
            if done {
                if value < 0.0 || !value.is_finite() {
                    return Err(ParameterError::Measurement(format!(
                        "{:?} reads {:e} at {} MHz; no usable test frequency",
                        self.kind, value, freq
                    )));
                }
                return Ok(ComponentReading {
                    kind: self.kind,
                    value,
                    freq_mhz: freq,
                    equivalent: series_equivalent(z, freq),
                    measurements,
                });
            }
            if let Some(next) = next {
                bracket = next;
            }
        }
    }
}

fn closest_bracket(freq_mhz: f64) -> usize {
    if !(freq_mhz > 0.0) || !freq_mhz.is_finite() {
        return if freq_mhz.is_infinite() { TEST_FREQUENCIES_MHZ.len() - 1 } else { 0 };
    }
    let target = freq_mhz.ln();
    (0..TEST_FREQUENCIES_MHZ.len())
        .min_by(|&a, &b| {
            let da = (TEST_FREQUENCIES_MHZ[a].ln() - target).abs();
            let db = (TEST_FREQUENCIES_MHZ[b].ln() - target).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(0)
}
