//! Text calibration tables: ADC code -> (dBm, phase) linearisation and a
//! frequency-dependent magnitude offset.
//!
//! Both files start with a fixed two-line header:
//! ```text
//! *Version 1.0
//! *Magnitude calibration table        (or *Frequency calibration table)
//! ```
//! followed by `*`/`!` comment lines and whitespace- or comma-separated rows.
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;

use crate::drivers::error::CalibrationError;

pub const CAL_TABLE_VERSION: &str = "1.0";
const MAGNITUDE_TITLE: &str = "Magnitude calibration table";
const FREQUENCY_TITLE: &str = "Frequency calibration table";
/// Codes are normalised to this width before using the raw estimate curve.
const RAW_ESTIMATE_SCALE: f64 = 65535.0;

/// Linear detector estimate used when no magnitude table is loaded.
static RAW_ESTIMATE: Lazy<MagnitudeTable> = Lazy::new(|| MagnitudeTable {
    entries: vec![
        MagnitudeEntry {
            adc: 0.0,
            dbm: -120.0,
            phase_deg: 0.0,
        },
        MagnitudeEntry {
            adc: RAW_ESTIMATE_SCALE,
            dbm: 0.0,
            phase_deg: 0.0,
        },
    ],
});

/// Linear interpolation over `(x, y)` pairs sorted by x, clamped at both ends.
pub(crate) fn interpolate_sorted(points: &[(f64, f64)], x: f64) -> f64 {
    match points {
        [] => 0.0,
        [only] => only.1,
        _ => {
            let first = points[0];
            let last = points[points.len() - 1];
            if x <= first.0 {
                return first.1;
            }
            if x >= last.0 {
                return last.1;
            }
            let upper = points.partition_point(|p| p.0 <= x);
            let (x0, y0) = points[upper - 1];
            let (x1, y1) = points[upper];
            if x1 == x0 {
                return y0;
            }
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MagnitudeEntry {
    pub adc: f64,
    pub dbm: f64,
    pub phase_deg: f64,
}

/// ADC code to power and magnitude-correlated phase offset.
#[derive(Clone, Debug, PartialEq)]
pub struct MagnitudeTable {
    entries: Vec<MagnitudeEntry>,
}

impl MagnitudeTable {
    pub fn new(mut entries: Vec<MagnitudeEntry>) -> Result<Self, CalibrationError> {
        if entries.is_empty() {
            return Err(CalibrationError::Empty);
        }
        entries.sort_by(|a, b| a.adc.total_cmp(&b.adc));
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MagnitudeEntry] {
        &self.entries
    }

    pub fn dbm(&self, adc: f64) -> f64 {
        let pts: Vec<(f64, f64)> = self.entries.iter().map(|e| (e.adc, e.dbm)).collect();
        interpolate_sorted(&pts, adc)
    }

    pub fn phase_offset(&self, adc: f64) -> f64 {
        let pts: Vec<(f64, f64)> = self.entries.iter().map(|e| (e.adc, e.phase_deg)).collect();
        interpolate_sorted(&pts, adc)
    }

    /// Straight-line estimate for an uncalibrated detector.
    pub fn raw_estimate_dbm(code: u32, full_scale: u32) -> f64 {
        let normalised = code as f64 / full_scale.max(1) as f64 * RAW_ESTIMATE_SCALE;
        RAW_ESTIMATE.dbm(normalised)
    }

    pub fn parse(text: &str) -> Result<Self, CalibrationError> {
        let rows = parse_rows(text, MAGNITUDE_TITLE, 3)?;
        let entries = rows
            .into_iter()
            .map(|r| MagnitudeEntry {
                adc: r[0],
                dbm: r[1],
                phase_deg: r[2],
            })
            .collect();
        Self::new(entries)
    }

    pub fn to_text(&self) -> String {
        let mut out = header(MAGNITUDE_TITLE);
        out.push_str("*ADC\tdBm\tPhase\n");
        for e in &self.entries {
            let _ = writeln!(out, "{}\t{:.3}\t{:.3}", e.adc, e.dbm, e.phase_deg);
        }
        out
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}

/// Magnitude offset versus frequency, added after linearisation.
#[derive(Clone, Debug, PartialEq)]
pub struct FrequencyTable {
    entries: Vec<(f64, f64)>,
}

impl FrequencyTable {
    pub fn new(mut entries: Vec<(f64, f64)>) -> Result<Self, CalibrationError> {
        if entries.is_empty() {
            return Err(CalibrationError::Empty);
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { entries })
    }

    pub fn offset_db(&self, freq_mhz: f64) -> f64 {
        interpolate_sorted(&self.entries, freq_mhz)
    }

    pub fn parse(text: &str) -> Result<Self, CalibrationError> {
        let rows = parse_rows(text, FREQUENCY_TITLE, 2)?;
        Self::new(rows.into_iter().map(|r| (r[0], r[1])).collect())
    }

    pub fn to_text(&self) -> String {
        let mut out = header(FREQUENCY_TITLE);
        out.push_str("*MHz\tdB\n");
        for (f, db) in &self.entries {
            let _ = writeln!(out, "{:.6}\t{:.3}", f, db);
        }
        out
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}

fn header(title: &str) -> String {
    format!("*Version {}\n*{}\n", CAL_TABLE_VERSION, title)
}

fn parse_rows(text: &str, title: &str, columns: usize) -> Result<Vec<Vec<f64>>, CalibrationError> {
    let mut lines = text.lines().enumerate();
    let (_, first) = lines.next().ok_or(CalibrationError::Empty)?;
    let version = first
        .trim()
        .strip_prefix("*Version")
        .map(str::trim)
        .ok_or_else(|| CalibrationError::Malformed {
            line: 1,
            reason: "missing *Version header".into(),
        })?;
    if version != CAL_TABLE_VERSION {
        return Err(CalibrationError::VersionMismatch {
            expected: CAL_TABLE_VERSION.into(),
            actual: version.into(),
        });
    }
    match lines.next() {
        Some((_, line)) if line.trim().trim_start_matches('*').trim() == title => {}
        _ => {
            return Err(CalibrationError::Malformed {
                line: 2,
                reason: format!("expected *{} header", title),
            })
        }
    }

    let mut rows = Vec::new();
    for (idx, line) in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') || line.starts_with('!') {
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
        if values.len() != columns {
            return Err(CalibrationError::Malformed {
                line: idx + 1,
                reason: format!("expected {} columns, found {}", columns, values.len()),
            });
        }
        rows.push(values);
    }
    if rows.is_empty() {
        return Err(CalibrationError::Empty);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAG_TABLE: &str = "*Version 1.0\n*Magnitude calibration table\n*ADC dBm Phase\n\
        40000 -20 1.5\n0 -120 0\n20000 -70 0.5\n";

    #[test]
    fn magnitude_table_sorts_and_interpolates() {
        let table = MagnitudeTable::parse(MAG_TABLE).unwrap();
        assert_eq!(table.entries()[0].adc, 0.0);
        assert!((table.dbm(10000.0) - -95.0).abs() < 1e-9);
        assert!((table.phase_offset(30000.0) - 1.0).abs() < 1e-9);
        assert_eq!(table.dbm(60000.0), -20.0);
    }

    #[test]
    fn version_mismatch_rejects_file() {
        let text = MAG_TABLE.replace("*Version 1.0", "*Version 0.9");
        assert!(matches!(
            MagnitudeTable::parse(&text),
            Err(CalibrationError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn wrong_title_or_bad_row_is_malformed() {
        let text = MAG_TABLE.replace("Magnitude", "Frequency");
        assert!(matches!(
            MagnitudeTable::parse(&text),
            Err(CalibrationError::Malformed { line: 2, .. })
        ));
        let text = format!("{}12 abc 3\n", MAG_TABLE);
        assert!(matches!(
            MagnitudeTable::parse(&text),
            Err(CalibrationError::Malformed { line: 7, .. })
        ));
    }

    #[test]
    fn frequency_table_text_round_trip() {
        let table = FrequencyTable::new(vec![(10.0, 0.5), (1.0, 0.1)]).unwrap();
        let parsed = FrequencyTable::parse(&table.to_text()).unwrap();
        assert!((parsed.offset_db(5.5) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn raw_estimate_spans_detector_range() {
        assert_eq!(MagnitudeTable::raw_estimate_dbm(0, 4095), -120.0);
        assert_eq!(MagnitudeTable::raw_estimate_dbm(4095, 4095), 0.0);
    }
}
