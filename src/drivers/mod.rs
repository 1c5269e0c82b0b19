// src/drivers/mod.rs
// Hardware-facing and numeric modules
pub mod board;
pub mod buffer;
pub mod bus;
pub mod calibration;
pub mod caltables;
pub mod capture;
pub mod component;
pub mod crystal;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod plan;
pub mod source;
pub mod synth;
pub mod tdr;
// Types most callers need, re-exported at the top of the module
pub use board::{ControlBoard, NullBoard, ScriptedBoard, SimulatedBoard};
pub use buffer::{TraceBuffer, TraceSnapshot};
pub use calibration::{CalLevel, CalMode, CalPoint, CalibrationSpectrum, CalibrationStore, OslCalibration};
pub use component::{ComponentKind, ComponentMeter, ComponentReading};
pub use crystal::{CrystalParameters, ResonanceMarkers};
pub use error::{BoardError, CalibrationError, ParameterError, ScanError, SynthError};
pub use network::{Equivalent, Jig, Reactance};
pub use pipeline::TracePipeline;
pub use plan::{Direction, FrequencyBand, LoPlan, Spacing, StepCursor, SweepPlan};
pub use source::{ManualSource, SampleSource};
pub use synth::{Oscillator, OscillatorConfig, PllFamily, SynthSettings};
pub use tdr::TdrResponse;
