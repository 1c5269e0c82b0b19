//! Bit-serial register writes and synchronised ADC reads on top of `ControlBoard`.
use log::{debug, warn};

use crate::drivers::board::{ControlBoard, STATUS_SYNC_BIT, STATUS_VERSION_SHIFT};
use crate::drivers::error::BoardError;
use crate::drivers::synth::DeviceFrame;

/// Highest usable data lane. Lanes double as latch-enable bits on the control port,
/// whose bit 7 latches the switch byte.
pub const MAX_LANE: u8 = 6;

fn lane_bit(lane: u8) -> Result<u8, BoardError> {
    if lane > MAX_LANE {
        return Err(BoardError::InvalidLane(lane));
    }
    Ok(1 << lane)
}

/// Interleaves device frames into one byte stream, one data lane per device.
///
/// Frames are right aligned so every device receives its last bit on the same
/// clock; shorter frames are preceded by zeros.
pub fn interleave_frames(frames: &[DeviceFrame]) -> Result<Vec<u8>, BoardError> {
    let bits = frames
        .iter()
        .map(|f| lane_bit(f.lane))
        .collect::<Result<Vec<u8>, BoardError>>()?;
    let len = frames.iter().map(|f| f.bits).max().unwrap_or(0);
    Ok((0..len)
        .map(|slot| {
            let shift = len - 1 - slot;
            frames.iter().zip(&bits).fold(0u8, |byte, (frame, bit)| {
                if shift < frame.bits && (frame.word >> shift) & 1 == 1 {
                    byte | bit
                } else {
                    byte
                }
            })
        })
        .collect())
}

pub fn lane_mask(frames: &[DeviceFrame]) -> Result<u8, BoardError> {
    frames
        .iter()
        .try_fold(0u8, |mask, f| Ok(mask | lane_bit(f.lane)?))
}

/// Clocks the frames out MSB first and pulses the latch enables of their lanes.
pub fn write_frames(board: &mut dyn ControlBoard, frames: &[DeviceFrame]) -> Result<(), BoardError> {
    if frames.is_empty() {
        return Ok(());
    }
    let bytes = interleave_frames(frames)?;
    let mask = lane_mask(frames)?;
    board.send_device_bytes(&bytes, mask)?;
    board.write_control(mask)?;
    board.write_control(0)?;
    board.flush()
}

/// Clears the board and checks the firmware version in its status byte.
pub fn verify_board(board: &mut dyn ControlBoard, expected_version: u8) -> Result<(), BoardError> {
    board.clear()?;
    let status = board.read_status()?;
    let version = status >> STATUS_VERSION_SHIFT;
    if version != expected_version {
        return Err(BoardError::VersionMismatch {
            expected: expected_version,
            actual: version,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdcSample {
    pub magnitude: u32,
    pub phase: u32,
    /// Set on the read that exhausted the retry budget and switched keep-sync off.
    pub sync_dropped: bool,
}

/// ADC reader with the rolling sync-bit check.
#[derive(Clone, Debug)]
pub struct AdcReader {
    bits: u32,
    keep_sync: bool,
    expected_sync: bool,
    retry_budget: u32,
}

impl AdcReader {
    pub fn new(bits: u32, keep_sync: bool, retry_budget: u32) -> Self {
        Self {
            bits,
            keep_sync,
            expected_sync: true,
            retry_budget,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn full_scale(&self) -> u32 {
        ((1u64 << self.bits.min(32)) - 1) as u32
    }

    pub fn keep_sync(&self) -> bool {
        self.keep_sync
    }

    /// Takes the rolling expectation from the board's current sync bit; the next
    /// conversion toggles it.
    pub fn resync(&mut self, board: &mut dyn ControlBoard) -> Result<(), BoardError> {
        if self.keep_sync {
            let sync = board.read_status()? & STATUS_SYNC_BIT != 0;
            self.expected_sync = !sync;
        }
        Ok(())
    }

    pub fn read(&mut self, board: &mut dyn ControlBoard) -> Result<AdcSample, BoardError> {
        let mut retries = 0;
        loop {
            board.request_adc_read(self.bits)?;
            let (magnitude, phase) = board.adc_values(self.bits)?;
            if !self.keep_sync {
                return Ok(AdcSample {
                    magnitude,
                    phase,
                    sync_dropped: false,
                });
            }
            let sync = board.read_status()? & STATUS_SYNC_BIT != 0;
            let matched = sync == self.expected_sync;
            // the board toggles the bit on every conversion
            self.expected_sync = !sync;
            if matched {
                return Ok(AdcSample {
                    magnitude,
                    phase,
                    sync_dropped: false,
                });
            }
            if retries >= self.retry_budget {
                self.keep_sync = false;
                warn!(
                    "ADC sync lost after {} retries; continuing without sync checks",
                    retries
                );
                return Ok(AdcSample {
                    magnitude,
                    phase,
                    sync_dropped: true,
                });
            }
            retries += 1;
            debug!("ADC sync mismatch, retry {}/{}", retries, self.retry_budget);
        }
    }
}
