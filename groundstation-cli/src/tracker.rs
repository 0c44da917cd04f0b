//! SGP4-backed pass prediction.
//!
//! Propagates the cached TLE with the `sgp4` crate and derives the
//! topocentric quantities the core asks for: rise/peak/set of the next
//! pass, azimuths, and Doppler factors. Range rate is taken by symmetric
//! differencing of the slant range, which sidesteps the frame-velocity
//! bookkeeping of an analytic derivative.
//!
//! `update_tle` re-reads the cache file; fetching fresh elements into that
//! file is an external concern.

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};

use groundstation::tracking::{PassData, PassPredictor, TleCache, TleSet};
use groundstation::Error;

/// Speed of light, m/s.
const C_M_S: f64 = 299_792_458.0;

/// WGS84 semi-major axis, km.
const WGS84_A_KM: f64 = 6378.137;

/// WGS84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Coarse step of the horizon-crossing search.
const PASS_SEARCH_STEP_S: i64 = 30;

/// How far ahead to look for a pass before giving up.
const PASS_SEARCH_HORIZON_S: i64 = 48 * 3600;

/// Geodetic observer location.
#[derive(Debug, Clone, Copy)]
pub struct Observer {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: f64,
}

struct Propagator {
    epoch: DateTime<Utc>,
    constants: sgp4::Constants,
}

/// A [`PassPredictor`] over SGP4 propagation of the cached TLE.
///
/// [`PassPredictor`]: ../../groundstation/tracking/trait.PassPredictor.html
pub struct Sgp4Predictor {
    cache: TleCache,
    observer: Observer,
    propagator: Option<Propagator>,
}

impl Sgp4Predictor {
    /// Builds a predictor reading elements from `cache`. A missing or
    /// unparseable cache leaves the predictor blind (every pass query
    /// returns `None`) until `update_tle` succeeds.
    pub fn new(cache: TleCache, observer: Observer) -> Self {
        let mut predictor = Self {
            cache,
            observer,
            propagator: None,
        };
        if let Err(e) = predictor.update_tle() {
            warn!("no usable TLE cache yet: {}", e);
        }
        predictor
    }

    /// Builds a predictor directly from a TLE set (used by tests).
    pub fn from_tle(set: &TleSet, observer: Observer) -> Result<Self, Error> {
        let mut predictor = Self {
            cache: TleCache::new("tle.txt".into(), 0),
            observer,
            propagator: None,
        };
        predictor.propagator = Some(Propagator::from_set(set)?);
        Ok(predictor)
    }

    /// Elevation and azimuth (degrees) plus slant range (km) at `at`.
    fn look_at(&self, at: DateTime<Utc>) -> Option<(f64, f64, f64)> {
        let propagator = self.propagator.as_ref()?;
        let sat = propagator.position_ecef(at)?;
        Some(look_angles(&self.observer, &sat))
    }

    fn elevation(&self, at: DateTime<Utc>) -> Option<f64> {
        self.look_at(at).map(|(el, _, _)| el)
    }

    fn range_km(&self, at: DateTime<Utc>) -> Option<f64> {
        self.look_at(at).map(|(_, _, range)| range)
    }

    /// Refines a horizon crossing between `below` and `above` (in either
    /// order) down to one second.
    fn refine_crossing(&self, mut before: DateTime<Utc>, mut after: DateTime<Utc>) -> DateTime<Utc> {
        while (after - before).num_seconds() > 1 {
            let mid = before + (after - before) / 2;
            let rising_half = match (self.elevation(before), self.elevation(mid)) {
                (Some(a), Some(b)) => (a > 0.0) == (b > 0.0),
                _ => true,
            };
            if rising_half {
                before = mid;
            } else {
                after = mid;
            }
        }
        after
    }
}

impl PassPredictor for Sgp4Predictor {
    fn update_tle(&mut self) -> Result<(), Error> {
        let set = self
            .cache
            .load()?
            .ok_or_else(|| Error::Tle(format!("no TLE in {}", self.cache.path().display())))?;
        info!("using TLEs: {} ({})", set.name, set.line1);
        self.propagator = Some(Propagator::from_set(&set)?);
        Ok(())
    }

    fn next_pass(&mut self, start: DateTime<Utc>) -> Option<PassData> {
        self.propagator.as_ref()?;
        let step = chrono::Duration::seconds(PASS_SEARCH_STEP_S);

        // skip any pass already in progress
        let mut t = start;
        let deadline = start + chrono::Duration::seconds(PASS_SEARCH_HORIZON_S);
        while self.elevation(t)? > 0.0 {
            t = t + step;
            if t > deadline {
                return None;
            }
        }

        // coarse rise search
        let rise_time = loop {
            let next = t + step;
            if next > deadline {
                return None;
            }
            if self.elevation(next)? > 0.0 {
                break self.refine_crossing(t, next);
            }
            t = next;
        };

        // coarse set search
        let mut t = rise_time + step;
        let set_time = loop {
            let next = t + step;
            if self.elevation(next)? <= 0.0 {
                break self.refine_crossing(t, next);
            }
            t = next;
        };

        // peak elevation scan
        let mut max_alt_time = rise_time;
        let mut max_alt_deg = f64::MIN;
        let mut t = rise_time;
        while t <= set_time {
            let el = self.elevation(t)?;
            if el > max_alt_deg {
                max_alt_deg = el;
                max_alt_time = t;
            }
            t = t + chrono::Duration::seconds(5);
        }

        let (_, rise_azimuth_deg, _) = self.look_at(rise_time)?;
        let (_, set_azimuth_deg, _) = self.look_at(set_time)?;
        Some(PassData {
            rise_time,
            rise_azimuth_deg,
            max_alt_time,
            max_alt_deg,
            set_time,
            set_azimuth_deg,
            rise_doppler_factor: self.doppler_factor(rise_time),
            set_doppler_factor: self.doppler_factor(set_time),
        })
    }

    fn doppler_factor(&self, at: DateTime<Utc>) -> f64 {
        let half = chrono::Duration::milliseconds(500);
        match (self.range_km(at - half), self.range_km(at + half)) {
            (Some(before), Some(after)) => {
                let range_rate_m_s = (after - before) * 1000.0;
                -range_rate_m_s / C_M_S
            }
            _ => 0.0,
        }
    }

    fn doppler_threshold_times(
        &self,
        thresholds: &[f64],
        pass: &PassData,
        base_hz: f64,
    ) -> Vec<(f64, Option<DateTime<Utc>>)> {
        let shift_at = |t: DateTime<Utc>| self.doppler_factor(t) * base_hz;
        thresholds
            .iter()
            .map(|&threshold| {
                // the shift falls monotonically through the pass
                if shift_at(pass.rise_time) < threshold || shift_at(pass.set_time) > threshold {
                    return (threshold, None);
                }
                let mut low = pass.rise_time;
                let mut high = pass.set_time;
                while (high - low).num_seconds() > 1 {
                    let mid = low + (high - low) / 2;
                    if shift_at(mid) >= threshold {
                        low = mid;
                    } else {
                        high = mid;
                    }
                }
                (threshold, Some(high))
            })
            .collect()
    }
}

impl Propagator {
    fn from_set(set: &TleSet) -> Result<Self, Error> {
        let name = if set.name.is_empty() { None } else { Some(set.name.clone()) };
        let elements = sgp4::Elements::from_tle(name, set.line1.as_bytes(), set.line2.as_bytes())
            .map_err(|e| Error::Tle(e.to_string()))?;
        let epoch = Utc.from_utc_datetime(&elements.datetime);
        let constants =
            sgp4::Constants::from_elements(&elements).map_err(|e| Error::Tle(e.to_string()))?;
        Ok(Self { epoch, constants })
    }

    /// Satellite position in earth-fixed coordinates, km.
    fn position_ecef(&self, at: DateTime<Utc>) -> Option<[f64; 3]> {
        let minutes = (at - self.epoch).num_milliseconds() as f64 / 60_000.0;
        let prediction = self
            .constants
            .propagate(sgp4::MinutesSinceEpoch(minutes))
            .ok()?;
        Some(teme_to_ecef(&prediction.position, gmst_rad(at)))
    }
}

/// Greenwich mean sidereal time, radians (IAU 1982 linear form).
fn gmst_rad(at: DateTime<Utc>) -> f64 {
    let unix = at.timestamp() as f64 + f64::from(at.timestamp_subsec_millis()) / 1000.0;
    let jd = 2_440_587.5 + unix / 86_400.0;
    let d = jd - 2_451_545.0;
    (280.460_618_37 + 360.985_647_366_29 * d).rem_euclid(360.0).to_radians()
}

/// Rotates a TEME vector into earth-fixed coordinates.
fn teme_to_ecef(position: &[f64; 3], gmst: f64) -> [f64; 3] {
    let (sin_g, cos_g) = gmst.sin_cos();
    [
        position[0] * cos_g + position[1] * sin_g,
        -position[0] * sin_g + position[1] * cos_g,
        position[2],
    ]
}

/// Observer position in earth-fixed coordinates, km (WGS84).
fn observer_ecef(observer: &Observer) -> [f64; 3] {
    let lat = observer.lat_deg.to_radians();
    let lon = observer.lon_deg.to_radians();
    let alt_km = observer.alt_m / 1000.0;
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let n = WGS84_A_KM / (1.0 - e2 * lat.sin() * lat.sin()).sqrt();
    [
        (n + alt_km) * lat.cos() * lon.cos(),
        (n + alt_km) * lat.cos() * lon.sin(),
        (n * (1.0 - e2) + alt_km) * lat.sin(),
    ]
}

/// Elevation and azimuth (degrees) and slant range (km) of `sat_ecef` as
/// seen from the observer.
fn look_angles(observer: &Observer, sat_ecef: &[f64; 3]) -> (f64, f64, f64) {
    let obs = observer_ecef(observer);
    let rho = [
        sat_ecef[0] - obs[0],
        sat_ecef[1] - obs[1],
        sat_ecef[2] - obs[2],
    ];

    let lat = observer.lat_deg.to_radians();
    let lon = observer.lon_deg.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();

    // topocentric south/east/up
    let south = sin_lat * cos_lon * rho[0] + sin_lat * sin_lon * rho[1] - cos_lat * rho[2];
    let east = -sin_lon * rho[0] + cos_lon * rho[1];
    let up = cos_lat * cos_lon * rho[0] + cos_lat * sin_lon * rho[1] + sin_lat * rho[2];

    let range = (south * south + east * east + up * up).sqrt();
    let elevation = (up / range).asin().to_degrees();
    let azimuth = east.atan2(-south).to_degrees().rem_euclid(360.0);
    (elevation, azimuth, range)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A real ISS element set (epoch 2020-07-12).
    const TLE: (&str, &str, &str) = (
        "ISS (ZARYA)",
        "1 25544U 98067A   20194.88612269 -.00002218  00000-0 -31515-4 0  9992",
        "2 25544  51.6461 221.2784 0001413  89.1723 280.4612 15.49507896236008",
    );

    fn predictor() -> Sgp4Predictor {
        let set = TleSet {
            name: TLE.0.to_string(),
            line1: TLE.1.to_string(),
            line2: TLE.2.to_string(),
        };
        let observer = Observer {
            lat_deg: 41.826,
            lon_deg: -71.403,
            alt_m: 50.0,
        };
        Sgp4Predictor::from_tle(&set, observer).unwrap()
    }

    fn epoch_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 7, 13, 0, 0, 0).unwrap()
    }

    #[test]
    fn doppler_factor_is_leo_sized() {
        let p = predictor();
        let mut t = epoch_start();
        for _ in 0..24 {
            let factor = p.doppler_factor(t);
            assert!(factor.abs() < 1.0e-4, "implausible doppler factor {}", factor);
            t = t + chrono::Duration::minutes(10);
        }
    }

    #[test]
    fn finds_a_coherent_pass() {
        let mut p = predictor();
        let pass = p.next_pass(epoch_start()).expect("ISS passes within 48h");
        assert!(pass.rise_time < pass.max_alt_time);
        assert!(pass.max_alt_time < pass.set_time);
        assert!(pass.max_alt_deg > 0.0);
        assert!(pass.set_time - pass.rise_time < chrono::Duration::minutes(20));
        // approaching at rise, receding at set
        assert!(pass.rise_doppler_factor > 0.0);
        assert!(pass.set_doppler_factor < 0.0);
    }

    #[test]
    fn threshold_times_fall_in_pass_order() {
        let mut p = predictor();
        let pass = p.next_pass(epoch_start()).unwrap();
        let step = 6250.0;
        let thresholds = [1.5 * step, 0.5 * step, -0.5 * step, -1.5 * step];
        let times = p.doppler_threshold_times(&thresholds, &pass, 435.55e6);
        assert_eq!(times.len(), 4);

        let found: Vec<_> = times.iter().filter_map(|&(_, t)| t).collect();
        for t in &found {
            assert!(*t >= pass.rise_time && *t <= pass.set_time);
        }
        // thresholds are ordered high-to-low, so crossings come in time order
        assert!(found.windows(2).all(|w| w[0] <= w[1]));
    }
}
