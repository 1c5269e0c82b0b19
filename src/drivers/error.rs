use thiserror::Error;

/// Register computation failures. A step whose synthesis fails is aborted, never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SynthError {
    #[error("LO{id}: B counter {b} is below the minimum of 3")]
    BCounterTooSmall { id: u8, b: u32 },
    #[error("LO{id}: B counter {b} exceeds the {bits}-bit field of the PLL")]
    BCounterTooLarge { id: u8, b: u32, bits: u32 },
    #[error("LO{id}: B counter {b} is smaller than A counter {a}")]
    BCounterBelowA { id: u8, a: u32, b: u32 },
    #[error("LO{id}: R counter {r} does not fit the {bits}-bit field of the PLL")]
    RCounterOutOfRange { id: u8, r: u32, bits: u32 },
    #[error("LO{id}: DDS output {actual_mhz:.6} MHz is outside {nominal_mhz:.6} +/- {half_bw_mhz:.6} MHz")]
    DdsOutOfRange {
        id: u8,
        actual_mhz: f64,
        nominal_mhz: f64,
        half_bw_mhz: f64,
    },
    #[error("LO{id}: target frequency {target_mhz} MHz is not positive")]
    InvalidTarget { id: u8, target_mhz: f64 },
}

/// Control-board transport failures.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("control board did not respond: {0}")]
    NotResponding(String),
    #[error("control board version mismatch: expected {expected:#04x}, got {actual:#04x}")]
    VersionMismatch { expected: u8, actual: u8 },
    #[error("device lane {0} is outside the data port")]
    InvalidLane(u8),
    #[error("ADC synchronisation lost after {retries} retries")]
    Desynchronized { retries: u32 },
    #[error("board I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Calibration loading and application failures. The affected calibration is treated as absent.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration file version mismatch: expected {expected:?}, got {actual:?}")]
    VersionMismatch { expected: String, actual: String },
    #[error("malformed calibration data at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("calibration table is empty")]
    Empty,
    #[error("calibration covers {cal_start}..{cal_stop} MHz but {start}..{stop} MHz was requested")]
    OutOfRange {
        cal_start: f64,
        cal_stop: f64,
        start: f64,
        stop: f64,
    },
    #[error("calibration file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Physically inconsistent inputs to a parameter extraction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParameterError {
    #[error("resonance frequencies must be positive (fs={fs}, fp={fp})")]
    NonPositiveFrequency { fs: f64, fp: f64 },
    #[error("-3 dB points {low}..{high} MHz do not straddle the series resonance {fs} MHz")]
    BandwidthNotStraddling { low: f64, high: f64, fs: f64 },
    #[error("parallel resonance {fp} MHz must lie above series resonance {fs} MHz")]
    ParallelBelowSeries { fs: f64, fp: f64 },
    #[error("reference impedance must be positive, got {0}")]
    NonPositiveReference(f64),
    #[error("peak insertion loss {0} dB is not a loss")]
    PeakAboveZero(f64),
    #[error("component measurement failed: {0}")]
    Measurement(String),
    #[error("time-domain transform needs a uniform linear sweep with at least {min} points")]
    UnsuitableSweep { min: usize },
}

/// Everything the scan path can surface.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Synth(#[from] SynthError),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("invalid sweep plan: {0}")]
    InvalidPlan(String),
    #[error("invalid hardware configuration: {0}")]
    InvalidConfig(String),
    #[error("scan worker exited abnormally; the session was lost")]
    WorkerLost,
}
