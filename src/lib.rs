// src/lib.rs
//! Synthesis, scan acquisition and network-parameter analysis for a scanning
//! network/spectrum analyzer.
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod session;
pub mod types;

pub use config::{AppConfig, HardwareConfig, ScanConfig, ScanMode};
pub use engine::ScanController;
pub use session::Session;
pub use types::{ScanEvent, ScanState, StepSample};
