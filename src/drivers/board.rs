use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::drivers::error::BoardError;

/// Status bit toggled by the board after every ADC conversion.
pub const STATUS_SYNC_BIT: u8 = 0x01;
/// Firmware version sits in the high nibble of the status byte.
pub const STATUS_VERSION_SHIFT: u8 = 4;
pub const BOARD_VERSION: u8 = 0x2;

/// Primitive register/ADC access to the instrument's control board.
///
/// Every method may legitimately be a no-op: `NullBoard` stands in when no
/// hardware is attached.
pub trait ControlBoard: Send {
    fn write_data(&mut self, byte: u8) -> Result<(), BoardError>;
    fn write_control(&mut self, byte: u8) -> Result<(), BoardError>;
    fn read_status(&mut self) -> Result<u8, BoardError>;
    fn flush(&mut self) -> Result<(), BoardError>;
    /// Clocks `bytes` out on the data port, one clock pulse per byte on the lanes in `clock_mask`.
    fn send_device_bytes(&mut self, bytes: &[u8], clock_mask: u8) -> Result<(), BoardError>;
    fn request_adc_read(&mut self, bits: u32) -> Result<(), BoardError>;
    /// Returns `(magnitude, phase)` codes of the last conversion.
    fn adc_values(&mut self, bits: u32) -> Result<(u32, u32), BoardError>;
    fn wait(&mut self, ms: u32);
    fn clear(&mut self) -> Result<(), BoardError>;
    fn is_present(&self) -> bool {
        true
    }
}

/// Board used when nothing is attached, or after a transport failure.
#[derive(Debug, Default)]
pub struct NullBoard;

impl ControlBoard for NullBoard {
    fn write_data(&mut self, _byte: u8) -> Result<(), BoardError> {
        Ok(())
    }
    fn write_control(&mut self, _byte: u8) -> Result<(), BoardError> {
        Ok(())
    }
    fn read_status(&mut self) -> Result<u8, BoardError> {
        Ok(BOARD_VERSION << STATUS_VERSION_SHIFT)
    }
    fn flush(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
    fn send_device_bytes(&mut self, _bytes: &[u8], _clock_mask: u8) -> Result<(), BoardError> {
        Ok(())
    }
    fn request_adc_read(&mut self, _bits: u32) -> Result<(), BoardError> {
        Ok(())
    }
    fn adc_values(&mut self, _bits: u32) -> Result<(u32, u32), BoardError> {
        Ok((0, 0))
    }
    fn wait(&mut self, _ms: u32) {}
    fn clear(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
    fn is_present(&self) -> bool {
        false
    }
}

/// Everything a `ScriptedBoard` saw, shared with the test that built it.
#[derive(Debug, Default, Clone)]
pub struct BoardLog {
    pub data: Vec<u8>,
    pub control: Vec<u8>,
    pub device_bytes: Vec<(Vec<u8>, u8)>,
    pub adc_requests: usize,
    pub waits_ms: Vec<u32>,
}

/// In-memory board for tests and deterministic playback.
pub struct ScriptedBoard {
    readings: VecDeque<(u32, u32)>,
    last: (u32, u32),
    conversions: u64,
    version: u8,
    stuck_sync: usize,
    fail_clear: bool,
    log: Arc<Mutex<BoardLog>>,
}

impl ScriptedBoard {
    pub fn new(readings: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
            last: (0, 0),
            conversions: 0,
            version: BOARD_VERSION,
            stuck_sync: 0,
            fail_clear: false,
            log: Arc::new(Mutex::new(BoardLog::default())),
        }
    }

    /// Holds the sync bit low on the next `count` status reads.
    pub fn with_stuck_sync(mut self, count: usize) -> Self {
        self.stuck_sync = count;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Makes `clear` fail, as a disconnected interface would.
    pub fn unresponsive(mut self) -> Self {
        self.fail_clear = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<BoardLog>> {
        Arc::clone(&self.log)
    }

    fn record(&self, f: impl FnOnce(&mut BoardLog)) {
        if let Ok(mut log) = self.log.lock() {
            f(&mut log);
        }
    }
}

impl ControlBoard for ScriptedBoard {
    fn write_data(&mut self, byte: u8) -> Result<(), BoardError> {
        self.record(|l| l.data.push(byte));
        Ok(())
    }
    fn write_control(&mut self, byte: u8) -> Result<(), BoardError> {
        self.record(|l| l.control.push(byte));
        Ok(())
    }
    fn read_status(&mut self) -> Result<u8, BoardError> {
        let mut sync = self.conversions % 2 == 1;
        if self.stuck_sync > 0 {
            self.stuck_sync -= 1;
            sync = false;
        }
        let sync_bit = if sync { STATUS_SYNC_BIT } else { 0 };
        Ok(self.version << STATUS_VERSION_SHIFT | sync_bit)
    }
    fn flush(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
    fn send_device_bytes(&mut self, bytes: &[u8], clock_mask: u8) -> Result<(), BoardError> {
        self.record(|l| l.device_bytes.push((bytes.to_vec(), clock_mask)));
        Ok(())
    }
    fn request_adc_read(&mut self, _bits: u32) -> Result<(), BoardError> {
        self.conversions += 1;
        self.record(|l| l.adc_requests += 1);
        Ok(())
    }
    fn adc_values(&mut self, _bits: u32) -> Result<(u32, u32), BoardError> {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }
    fn wait(&mut self, ms: u32) {
        self.record(|l| l.waits_ms.push(ms));
    }
    fn clear(&mut self) -> Result<(), BoardError> {
        if self.fail_clear {
            return Err(BoardError::NotResponding("no answer to clear".into()));
        }
        Ok(())
    }
}

/// Offline board producing a plausible resonator response with a little noise.
pub struct SimulatedBoard {
    rng: StdRng,
    conversions: u64,
    period: u64,
    real_time: bool,
}

impl SimulatedBoard {
    /// `period` is the number of conversions that make up one synthetic trace.
    pub fn new(seed: u64, period: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            conversions: 0,
            period: period.max(2),
            real_time: false,
        }
    }

    /// Honour `wait` requests with real sleeps.
    pub fn real_time(mut self, enabled: bool) -> Self {
        self.real_time = enabled;
        self
    }
}

impl ControlBoard for SimulatedBoard {
    fn write_data(&mut self, _byte: u8) -> Result<(), BoardError> {
        Ok(())
    }
    fn write_control(&mut self, _byte: u8) -> Result<(), BoardError> {
        Ok(())
    }
    fn read_status(&mut self) -> Result<u8, BoardError> {
        let sync_bit = if self.conversions % 2 == 1 { STATUS_SYNC_BIT } else { 0 };
        Ok(BOARD_VERSION << STATUS_VERSION_SHIFT | sync_bit)
    }
    fn flush(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
    fn send_device_bytes(&mut self, _bytes: &[u8], _clock_mask: u8) -> Result<(), BoardError> {
        Ok(())
    }
    fn request_adc_read(&mut self, _bits: u32) -> Result<(), BoardError> {
        self.conversions += 1;
        Ok(())
    }
    fn adc_values(&mut self, bits: u32) -> Result<(u32, u32), BoardError> {
        let full_scale = ((1u64 << bits.min(32)) - 1) as f64;
        let x = (self.conversions % self.period) as f64 / self.period as f64 - 0.5;
        // Lorentzian peak centered in the trace
        let response = 1.0 / (1.0 + (x * 12.0).powi(2));
        let noise: f64 = self.rng.gen_range(-0.002..0.002);
        let magnitude = ((0.35 + 0.55 * response + noise).clamp(0.0, 1.0)) * full_scale;
        let phase_frac = (0.5 - (x * 12.0).atan() / std::f64::consts::PI).rem_euclid(1.0);
        Ok((magnitude as u32, (phase_frac * full_scale) as u32))
    }
    fn wait(&mut self, ms: u32) {
        if self.real_time && ms > 0 {
            thread::sleep(Duration::from_millis(ms as u64));
        }
    }
    fn clear(&mut self) -> Result<(), BoardError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_board_replays_and_holds_last_reading() {
        let mut board = ScriptedBoard::new(vec![(10, 20), (30, 40)]);
        assert_eq!(board.adc_values(16).unwrap(), (10, 20));
        assert_eq!(board.adc_values(16).unwrap(), (30, 40));
        assert_eq!(board.adc_values(16).unwrap(), (30, 40));
    }

    #[test]
    fn scripted_board_toggles_sync_per_conversion() {
        let mut board = ScriptedBoard::new(vec![]);
        board.request_adc_read(16).unwrap();
        assert_eq!(board.read_status().unwrap() & STATUS_SYNC_BIT, STATUS_SYNC_BIT);
        board.request_adc_read(16).unwrap();
        assert_eq!(board.read_status().unwrap() & STATUS_SYNC_BIT, 0);
    }

    #[test]
    fn null_board_is_absent_and_silent() {
        let mut board = NullBoard;
        assert!(!board.is_present());
        assert_eq!(board.adc_values(16).unwrap(), (0, 0));
        assert_eq!(board.read_status().unwrap() >> STATUS_VERSION_SHIFT, BOARD_VERSION);
    }

    #[test]
    fn simulated_board_stays_in_range() {
        let mut board = SimulatedBoard::new(7, 50);
        for _ in 0..200 {
            board.request_adc_read(16).unwrap();
            let (m, p) = board.adc_values(16).unwrap();
            assert!(m <= 0xffff && p <= 0xffff);
        }
    }
}
