use crate::drivers::calibration::{CalMode, CalPoint, CalibrationSpectrum};
use crate::drivers::error::{CalibrationError, ScanError};
use crate::drivers::plan::SweepPlan;
use crate::recorder::SavedSpectrum;
use crate::types::StepSample;

/// Value copy of a trace. Nothing in it aliases the live buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceSnapshot {
    pub scan_id: u64,
    pub plan: SweepPlan,
    pub samples: Vec<Option<StepSample>>,
}

impl TraceSnapshot {
    pub fn filled(&self) -> usize {
        self.samples.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.filled() == self.samples.len()
    }

    pub fn points(&self) -> Vec<CalPoint> {
        self.samples.iter().flatten().map(StepSample::cal_point).collect()
    }

    /// Installs the trace as a calibration for exactly this plan; every step must be present.
    pub fn to_calibration(&self, mode: CalMode) -> Result<CalibrationSpectrum, CalibrationError> {
        if !self.is_complete() {
            return Err(CalibrationError::Malformed {
                line: 0,
                reason: format!("trace has {} of {} steps", self.filled(), self.samples.len()),
            });
        }
        CalibrationSpectrum::new(self.points(), mode, self.plan.is_log())
    }

    pub fn to_saved(&self, comment: &str, r0: f64) -> SavedSpectrum {
        SavedSpectrum {
            comment: comment.to_string(),
            r0,
            points: self.points(),
        }
    }
}

/// Latest sample per step of the current scan.
pub struct TraceBuffer {
    plan: SweepPlan,
    scan_id: Option<u64>,
    slots: Vec<Option<StepSample>>,
}

impl TraceBuffer {
    pub fn new(plan: SweepPlan) -> Result<Self, ScanError> {
        plan.validate()?;
        let slots = vec![None; plan.points()];
        Ok(Self {
            plan,
            scan_id: None,
            slots,
        })
    }

    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    pub fn scan_id(&self) -> Option<u64> {
        self.scan_id
    }

    /// Stores the sample; a sample from a newer scan clears the trace first.
    pub fn push(&mut self, sample: StepSample) -> Result<(), ScanError> {
        match self.scan_id {
            Some(id) if sample.scan_id < id => return Ok(()),
            Some(id) if sample.scan_id == id => {}
            _ => {
                self.slots.iter_mut().for_each(|s| *s = None);
                self.scan_id = Some(sample.scan_id);
            }
        }
        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(sample.step)
            .ok_or_else(|| ScanError::InvalidPlan(format!("step {} outside {} points", sample.step, len)))?;
        *slot = Some(sample);
        Ok(())
    }

    pub fn get(&self, step: usize) -> Option<&StepSample> {
        self.slots.get(step).and_then(Option::as_ref)
    }

    pub fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            scan_id: self.scan_id.unwrap_or(0),
            plan: self.plan.clone(),
            samples: self.slots.clone(),
        }
    }
}
