//! Saved spectrum files.
//!
//! ```text
//! !Version 1.0
//! !free-text comment
//! # MHz S DB R 50
//! 1.000000 -0.512 12.300
//! ```
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::drivers::calibration::CalPoint;
use crate::drivers::error::CalibrationError;

pub const SPECTRUM_VERSION: &str = "1.0";

#[derive(Clone, Debug, PartialEq)]
pub struct SavedSpectrum {
    pub comment: String,
    /// Reference impedance declared on the parameter line.
    pub r0: f64,
    pub points: Vec<CalPoint>,
}

impl SavedSpectrum {
    pub fn to_text(&self) -> String {
        let mut out = header(&self.comment, self.r0);
        for p in &self.points {
            let _ = writeln!(out, "{}", format_point(p));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, CalibrationError> {
        let mut lines = text.lines().enumerate();
        let (_, first) = lines.next().ok_or(CalibrationError::Empty)?;
        let version = first
            .trim()
            .strip_prefix("!Version")
            .map(str::trim)
            .ok_or_else(|| CalibrationError::Malformed {
                line: 1,
                reason: "missing !Version header".into(),
            })?;
        if version != SPECTRUM_VERSION {
            return Err(CalibrationError::VersionMismatch {
                expected: SPECTRUM_VERSION.into(),
                actual: version.into(),
            });
        }
        let comment = match lines.next() {
            Some((_, line)) if line.starts_with('!') => line[1..].trim().to_string(),
            _ => {
                return Err(CalibrationError::Malformed {
                    line: 2,
                    reason: "missing ! comment line".into(),
                })
            }
        };
        let r0 = match lines.next() {
            Some((_, line)) => parse_parameter_line(line)?,
            None => {
                return Err(CalibrationError::Malformed {
                    line: 3,
                    reason: "missing # parameter line".into(),
                })
            }
        };

        let mut points = Vec::new();
        for (idx, line) in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') {
                continue;
            }
            let values = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| CalibrationError::Malformed {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            let &[freq_mhz, db, deg] = values.as_slice() else {
                return Err(CalibrationError::Malformed {
                    line: idx + 1,
                    reason: format!("expected 3 values, found {}", values.len()),
                });
            };
            points.push(CalPoint { freq_mhz, db, deg });
        }
        if points.is_empty() {
            return Err(CalibrationError::Empty);
        }
        Ok(Self { comment, r0, points })
    }
}

fn header(comment: &str, r0: f64) -> String {
    format!(
        "!Version {}\n!{}\n# MHz S DB R {}\n",
        SPECTRUM_VERSION,
        comment.replace('\n', " "),
        r0
    )
}

fn format_point(p: &CalPoint) -> String {
    format!("{:.6} {:.4} {:.4}", p.freq_mhz, p.db, p.deg)
}

fn parse_parameter_line(line: &str) -> Result<f64, CalibrationError> {
    let malformed = |reason: &str| CalibrationError::Malformed {
        line: 3,
        reason: reason.into(),
    };
    let tokens: Vec<String> = line.split_whitespace().map(|t| t.to_ascii_uppercase()).collect();
    if tokens.first().map(String::as_str) != Some("#") {
        return Err(malformed("missing # parameter line"));
    }
    if !tokens.iter().any(|t| t == "MHZ") || !tokens.iter().any(|t| t == "DB") {
        return Err(malformed("only MHz / dB spectra are supported"));
    }
    let r_pos = tokens
        .iter()
        .position(|t| t == "R")
        .ok_or_else(|| malformed("missing reference impedance"))?;
    tokens
        .get(r_pos + 1)
        .and_then(|t| t.parse::<f64>().ok())
        .filter(|r| *r > 0.0)
        .ok_or_else(|| malformed("bad reference impedance"))
}

pub fn load_spectrum(path: impl AsRef<Path>) -> Result<SavedSpectrum, CalibrationError> {
    SavedSpectrum::parse(&fs::read_to_string(path)?)
}

pub fn save_spectrum(path: impl AsRef<Path>, spectrum: &SavedSpectrum) -> Result<(), CalibrationError> {
    fs::write(path, spectrum.to_text())?;
    Ok(())
}

/// Streams points to a saved spectrum file as they arrive.
pub struct TraceRecorder {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    points: usize,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            writer: None,
            path: None,
            points: 0,
        }
    }

    pub fn start(&mut self, path: impl AsRef<Path>, comment: &str, r0: f64) -> Result<(), CalibrationError> {
        self.stop()?;
        let path = path.as_ref();
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(header(comment, r0).as_bytes())?;
        self.writer = Some(w);
        self.path = Some(path.to_path_buf());
        self.points = 0;
        info!("recording trace to {}", path.display());
        Ok(())
    }

    pub fn write_point(&mut self, point: &CalPoint) -> Result<(), CalibrationError> {
        if let Some(w) = &mut self.writer {
            writeln!(w, "{}", format_point(point))?;
            self.points += 1;
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), CalibrationError> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            if let Some(path) = self.path.take() {
                info!("saved {} points to {}", self.points, path.display());
            }
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }
}
