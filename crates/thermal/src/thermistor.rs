//! Lookup-table based ADC-counts-to-temperature conversion.
//!
//! Unlike a Steinhart-Hart model, each RTD channel on the UHC is
//! field-calibrated against a per-channel table of (degrees F, raw ADC
//! counts) pairs rather than a fitted curve, so field technicians can swap
//! a single text file to recalibrate one channel without touching firmware.

use std::fmt;

/// First row of every calibration table, in degrees Fahrenheit.
pub const FIRST_DEGREES_F: u16 = 32;
/// Last row of every calibration table, in degrees Fahrenheit.
pub const LAST_DEGREES_F: u16 = 350;
/// Number of rows a calibration table must have: one per degree, inclusive.
pub const TABLE_ROWS: usize = (LAST_DEGREES_F - FIRST_DEGREES_F) as usize + 1;

/// Sentinel returned for a reading that falls outside the table entirely.
pub const OUT_OF_RANGE_SENTINEL: i32 = -1;

/// How many rows from either edge of the table count as the "near the
/// rails" band used to decide whether a reading is a candidate open/short
/// rather than merely an extreme but valid temperature.
const EDGE_BAND_ROWS: usize = 10;

/// One calibration row: a temperature and the raw ADC counts it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationRow {
    pub deg_f: u16,
    pub counts: u16,
}

/// Errors that can occur while parsing or validating a calibration table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    WrongRowCount { expected: usize, found: usize },
    FirstRowNotColdEnd { found: u16 },
    LastRowNotHotEnd { found: u16 },
    MalformedRow { line: usize },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::WrongRowCount { expected, found } => {
                write!(f, "expected {expected} calibration rows, found {found}")
            }
            TableError::FirstRowNotColdEnd { found } => {
                write!(f, "first row must be {FIRST_DEGREES_F}F, found {found}F")
            }
            TableError::LastRowNotHotEnd { found } => {
                write!(f, "last row must be {LAST_DEGREES_F}F, found {found}F")
            }
            TableError::MalformedRow { line } => write!(f, "malformed row at line {line}"),
        }
    }
}

impl std::error::Error for TableError {}

/// Outcome of classifying a single raw ADC reading against a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    InRange(i32),
    CandidateOpen,
    CandidateShort,
}

/// A validated per-channel calibration table, 319 rows spanning 32F..=350F,
/// sorted ascending by both temperature and raw counts.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationTable {
    rows: Vec<CalibrationRow>,
}

impl CalibrationTable {
    /// Builds a table from already-decoded rows, validating row count and
    /// the mandated first/last temperatures.
    pub fn new(rows: Vec<CalibrationRow>) -> Result<Self, TableError> {
        if rows.len() != TABLE_ROWS {
            return Err(TableError::WrongRowCount {
                expected: TABLE_ROWS,
                found: rows.len(),
            });
        }
        if rows[0].deg_f != FIRST_DEGREES_F {
            return Err(TableError::FirstRowNotColdEnd {
                found: rows[0].deg_f,
            });
        }
        if rows[rows.len() - 1].deg_f != LAST_DEGREES_F {
            return Err(TableError::LastRowNotHotEnd {
                found: rows[rows.len() - 1].deg_f,
            });
        }
        Ok(Self { rows })
    }

    /// Parses the on-disk format: first line is the row count `N`, then `N`
    /// lines of `<degF> <counts>` pairs.
    pub fn parse(text: &str) -> Result<Self, TableError> {
        let mut lines = text.lines();
        let declared_count: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or(TableError::MalformedRow { line: 1 })?;

        let mut rows = Vec::with_capacity(declared_count);
        for (i, line) in lines.enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let deg_f = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(TableError::MalformedRow { line: i + 2 })?;
            let counts = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or(TableError::MalformedRow { line: i + 2 })?;
            rows.push(CalibrationRow { deg_f, counts });
        }

        if rows.len() != declared_count {
            return Err(TableError::WrongRowCount {
                expected: declared_count,
                found: rows.len(),
            });
        }

        Self::new(rows)
    }

    /// The compiled-in default table: a linear ramp from 32F to 350F. Used
    /// when a channel's calibration file is missing or fails validation.
    pub fn default_ramp() -> Self {
        // The real default table is a non-linear characterization curve
        // burned into the factory image; a linear ramp is a safe stand-in
        // here since its only job is to keep the scanner producing plausible
        // readings until a calibration file is installed.
        const COLD_COUNTS: u32 = 900;
        const HOT_COUNTS: u32 = 3600;
        let span = HOT_COUNTS - COLD_COUNTS;
        let rows = (0..TABLE_ROWS)
            .map(|i| {
                let deg_f = FIRST_DEGREES_F + i as u16;
                let counts = COLD_COUNTS + (span * i as u32) / (TABLE_ROWS as u32 - 1);
                CalibrationRow {
                    deg_f,
                    counts: counts as u16,
                }
            })
            .collect();
        Self { rows }
    }

    pub fn rows(&self) -> &[CalibrationRow] {
        &self.rows
    }

    fn low_counts(&self) -> u16 {
        self.rows[0].counts
    }

    fn high_edge_counts(&self) -> u16 {
        self.rows[self.rows.len() - EDGE_BAND_ROWS].counts
    }

    /// Classifies a raw reading as in-range, a candidate open, or a
    /// candidate short, per the scanner's per-scan contract.
    pub fn classify(&self, raw_counts: u16) -> Classification {
        if raw_counts > self.high_edge_counts() {
            Classification::CandidateOpen
        } else if raw_counts < self.low_counts() {
            Classification::CandidateShort
        } else {
            Classification::InRange(self.to_degrees_f(raw_counts))
        }
    }

    /// Converts a raw reading to degrees Fahrenheit by linear lookup: finds
    /// the first row `i` where `table[i].counts <= raw < table[i+1].counts`
    /// and returns `table[i].degF`. Exact endpoints map to the endpoint
    /// value; a reading outside the table entirely returns the out-of-range
    /// sentinel.
    pub fn to_degrees_f(&self, raw_counts: u16) -> i32 {
        if raw_counts < self.rows[0].counts || raw_counts > self.rows[self.rows.len() - 1].counts {
            return OUT_OF_RANGE_SENTINEL;
        }
        if raw_counts == self.rows[self.rows.len() - 1].counts {
            return self.rows[self.rows.len() - 1].deg_f as i32;
        }
        for window in self.rows.windows(2) {
            let (lo, hi) = (window[0], window[1]);
            if raw_counts >= lo.counts && raw_counts < hi.counts {
                return lo.deg_f as i32;
            }
        }
        OUT_OF_RANGE_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibrationTable {
        CalibrationTable::default_ramp()
    }

    #[test]
    fn endpoints_map_to_endpoint_values() {
        let t = table();
        assert_eq!(t.to_degrees_f(t.rows()[0].counts), FIRST_DEGREES_F as i32);
        assert_eq!(
            t.to_degrees_f(t.rows()[TABLE_ROWS - 1].counts),
            LAST_DEGREES_F as i32
        );
    }

    #[test]
    fn out_of_range_is_sentinel() {
        let t = table();
        assert_eq!(t.to_degrees_f(0), OUT_OF_RANGE_SENTINEL);
        assert_eq!(t.to_degrees_f(u16::MAX), OUT_OF_RANGE_SENTINEL);
    }

    #[test]
    fn classify_candidates_near_rails() {
        let t = table();
        assert_eq!(t.classify(t.low_counts()), Classification::InRange(32));
        assert_eq!(t.classify(t.low_counts() - 1), Classification::CandidateShort);
        assert_eq!(
            t.classify(t.rows()[TABLE_ROWS - 1].counts),
            Classification::CandidateOpen
        );
    }

    #[test]
    fn parse_round_trips_default_ramp() {
        let t = table();
        let mut text = format!("{}\n", TABLE_ROWS);
        for row in t.rows() {
            text.push_str(&format!("{} {}\n", row.deg_f, row.counts));
        }
        let parsed = CalibrationTable::parse(&text).unwrap();
        assert_eq!(parsed.rows(), t.rows());
    }

    #[test]
    fn rejects_wrong_row_count() {
        let err = CalibrationTable::new(vec![CalibrationRow {
            deg_f: 32,
            counts: 100,
        }])
        .unwrap_err();
        assert!(matches!(err, TableError::WrongRowCount { .. }));
    }

    #[test]
    fn rejects_wrong_endpoints() {
        let mut rows: Vec<CalibrationRow> = table().rows().to_vec();
        rows[0].deg_f = 40;
        let err = CalibrationTable::new(rows).unwrap_err();
        assert!(matches!(err, TableError::FirstRowNotColdEnd { .. }));
    }
}
