use rustfft::num_complex::Complex64;

use crate::drivers::buffer::{TraceBuffer, TraceSnapshot};
use crate::drivers::error::{ParameterError, ScanError};
use crate::drivers::network::{transmission_to_impedance, Jig};
use crate::drivers::plan::SweepPlan;
use crate::drivers::source::SampleSource;
use crate::drivers::tdr::{self, TdrResponse};

/// Consumer side of a scan: drains samples into a trace and derives views from it.
pub struct TracePipeline<S: SampleSource> {
    source: S,
    buffer: TraceBuffer,
}

impl<S: SampleSource> TracePipeline<S> {
    pub fn new(source: S, plan: SweepPlan) -> Result<Self, ScanError> {
        Ok(Self {
            source,
            buffer: TraceBuffer::new(plan)?,
        })
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Moves one sample into the trace. Returns the step it landed on.
    pub fn pump_once(&mut self) -> Result<Option<usize>, ScanError> {
        let Some(sample) = self.source.next_sample()? else {
            return Ok(None);
        };
        let step = sample.step;
        self.buffer.push(sample)?;
        Ok(Some(step))
    }

    /// Drains everything currently queued; returns how many samples arrived.
    pub fn pump_all(&mut self) -> Result<usize, ScanError> {
        let mut count = 0;
        while self.pump_once()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    pub fn buffer(&self) -> &TraceBuffer {
        &self.buffer
    }

    pub fn latest_trace(&self) -> TraceSnapshot {
        self.buffer.snapshot()
    }

    /// Impedance per filled step for a transmission fixture.
    pub fn latest_impedance(&self, jig: Jig, r0: f64) -> Vec<(f64, Complex64)> {
        self.buffer
            .snapshot()
            .samples
            .iter()
            .flatten()
            .map(|s| (s.freq_mhz, transmission_to_impedance(jig, s.s_param(), r0)))
            .collect()
    }

    /// TDR of the current reflection trace; every step must be present.
    pub fn latest_tdr(&self, r0: f64) -> Result<TdrResponse, ParameterError> {
        let snapshot = self.buffer.snapshot();
        if !snapshot.is_complete() {
            return Err(ParameterError::Measurement("trace incomplete".into()));
        }
        let (freqs, s11): (Vec<f64>, Vec<Complex64>) = snapshot
            .samples
            .iter()
            .flatten()
            .map(|s| (s.freq_mhz, s.s_param()))
            .unzip();
        tdr::transform(&freqs, &s11, r0)
    }
}
