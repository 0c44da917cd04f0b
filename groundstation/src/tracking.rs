//! Pass prediction interface and TLE text handling.
//!
//! The core never runs orbital propagation itself; it consumes a
//! [`PassPredictor`], implemented outside (the shipped frontend carries an
//! SGP4-backed one). What does live here is the plain-text side of ephemeris
//! management: extracting one satellite's TLE set from a multi-satellite
//! blob and caching it in `tle.txt`.
//!
//! [`PassPredictor`]: trait.PassPredictor.html

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Error;
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Geometry and timing of one overhead pass. All times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassData {
    pub rise_time: DateTime<Utc>,
    pub rise_azimuth_deg: f64,
    pub max_alt_time: DateTime<Utc>,
    /// Peak elevation. May be negative for a pass that never clears the
    /// horizon; callers decide whether to plan for those.
    pub max_alt_deg: f64,
    pub set_time: DateTime<Utc>,
    pub set_azimuth_deg: f64,
    /// Doppler factor (−range_rate/c) at rise.
    pub rise_doppler_factor: f64,
    /// Doppler factor at set.
    pub set_doppler_factor: f64,
}

impl fmt::Display for PassData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "rise: {} @ {:6.2} deg az",
            self.rise_time.format("%Y-%m-%d %H:%M:%S"),
            self.rise_azimuth_deg
        )?;
        writeln!(
            f,
            "peak: {} @ {:6.2} deg el",
            self.max_alt_time.format("%Y-%m-%d %H:%M:%S"),
            self.max_alt_deg
        )?;
        write!(
            f,
            "set:  {} @ {:6.2} deg az",
            self.set_time.format("%Y-%m-%d %H:%M:%S"),
            self.set_azimuth_deg
        )
    }
}

/// Orbit predictions for the tracked satellite.
///
/// `doppler_threshold_times` reports, for each requested frequency shift
/// (in Hz at `base_hz`), when during `pass` the Doppler shift falls through
/// that value; `None` if the shift never reaches it. Results are returned in
/// the same order as `thresholds`.
pub trait PassPredictor {
    /// Refreshes the underlying orbital elements. How (file reload, network
    /// fetch) is the implementation's business.
    fn update_tle(&mut self) -> Result<(), Error>;

    /// Computes the next pass beginning at or after `start`.
    fn next_pass(&mut self, start: DateTime<Utc>) -> Option<PassData>;

    /// The dimensionless Doppler factor (−range_rate/c) at `at`.
    fn doppler_factor(&self, at: DateTime<Utc>) -> f64;

    /// When, during `pass`, the Doppler shift of a `base_hz` carrier crosses
    /// each threshold.
    fn doppler_threshold_times(
        &self,
        thresholds: &[f64],
        pass: &PassData,
        base_hz: f64,
    ) -> Vec<(f64, Option<DateTime<Utc>>)>;
}

/// One satellite's two-line element set, with its optional name line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TleSet {
    pub name: String,
    pub line1: String,
    pub line2: String,
}

/// Extracts the TLE set for `norad_id` from a text blob of concatenated
/// TLEs.
///
/// Matches on the catalog-number field of line 1 (`"<id>U"`); the preceding
/// line, if any, is taken as the satellite name. Returns `None` when the id
/// is absent or the set is cut off at the end of the blob.
pub fn extract_tle(norad_id: u32, tle_data: &str) -> Option<TleSet> {
    let lines: Vec<&str> = tle_data.lines().collect();
    let wanted = format!("{}U", norad_id);
    for (i, line) in lines.iter().enumerate() {
        let mut fields = line.split_whitespace();
        let (first, second) = (fields.next(), fields.next());
        if first != Some("1") {
            continue;
        }
        if second.map(|f| f.trim()) != Some(wanted.as_str()) {
            continue;
        }
        if i + 1 >= lines.len() {
            return None;
        }
        let name = if i > 0 { lines[i - 1].trim().to_string() } else { String::new() };
        return Some(TleSet {
            name,
            line1: lines[i].trim_end().to_string(),
            line2: lines[i + 1].trim_end().to_string(),
        });
    }
    None
}

/// File cache of the tracked satellite's orbital elements.
#[derive(Debug, Clone)]
pub struct TleCache {
    path: PathBuf,
    norad_id: u32,
}

impl TleCache {
    pub fn new(path: PathBuf, norad_id: u32) -> Self {
        Self { path, norad_id }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads the cached TLE set, if the cache file exists and contains the
    /// tracked satellite.
    pub fn load(&self) -> Result<Option<TleSet>, Error> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(extract_tle(self.norad_id, &text))
    }

    /// Replaces the cache file with `tle_data`.
    pub fn store(&self, tle_data: &str) -> Result<(), Error> {
        fs::write(&self.path, tle_data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB: &str = "\
ISS (ZARYA)
1 25544U 98067A   20029.54791435  .00016717  00000-0  10270-3 0  9000
2 25544  51.6426 211.3322 0004856 283.0592  77.0010 15.49179953 12310
WL9XZE
1 43550U 18046C   20029.12345678  .00001234  00000-0  56789-4 0  9993
2 43550  51.6375 195.5806 0003886 299.4207  60.6423 15.54426521  8190
";

    #[test]
    fn extracts_by_catalog_number() {
        let set = extract_tle(43550, BLOB).unwrap();
        assert_eq!(set.name, "WL9XZE");
        assert!(set.line1.starts_with("1 43550U"));
        assert!(set.line2.starts_with("2 43550"));

        let other = extract_tle(25544, BLOB).unwrap();
        assert_eq!(other.name, "ISS (ZARYA)");
    }

    #[test]
    fn missing_or_truncated_sets_are_none() {
        assert!(extract_tle(99999, BLOB).is_none());
        // line 2 cut off
        let truncated = "WL9XZE\n1 43550U 18046C   20029.12345678  .00001234  00000-0  56789-4 0  9993";
        assert!(extract_tle(43550, truncated).is_none());
    }

    #[test]
    fn nameless_set_gets_empty_name() {
        let blob = &BLOB[BLOB.find("1 43550U").unwrap()..];
        let set = extract_tle(43550, blob).unwrap();
        assert_eq!(set.name, "");
    }
}
