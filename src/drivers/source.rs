use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, TryRecvError};

use crate::drivers::error::ScanError;
use crate::types::StepSample;

/// Something that can yield finished step samples on demand, without blocking.
pub trait SampleSource {
    fn next_sample(&mut self) -> Result<Option<StepSample>, ScanError>;
}

/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<StepSample>,
}

impl ManualSource {
    pub fn new(samples: impl IntoIterator<Item = StepSample>) -> Self {
        Self {
            queue: samples.into_iter().collect(),
        }
    }
}

impl SampleSource for ManualSource {
    fn next_sample(&mut self) -> Result<Option<StepSample>, ScanError> {
        Ok(self.queue.pop_front())
    }
}

impl SampleSource for Receiver<StepSample> {
    fn next_sample(&mut self) -> Result<Option<StepSample>, ScanError> {
        match self.try_recv() {
            Ok(sample) => Ok(Some(sample)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}
