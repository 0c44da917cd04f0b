//! Doppler correction planning.
//!
//! The radio cannot tune continuously, so Doppler compensation runs on
//! pre-programmed channels offset from the base carrier in 6.25 kHz steps.
//! A pass plan is the list of instants at which the shift crosses the
//! midpoint between two adjacent channels; at each of those instants the
//! station activates the lower channel. One extra correction before rise
//! opens the receiver at the inbound-corrected frequency.

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use crate::tracking::{PassData, PassPredictor};

/// Channel spacing of the Doppler ladder.
pub const FREQ_STEP_HZ: f64 = 6250.0;

/// One planned channel activation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Correction {
    /// When to switch.
    pub time: DateTime<Utc>,
    /// The Doppler offset this step compensates, relative to the base
    /// carrier.
    pub offset_hz: f64,
    /// The pre-programmed channel implementing that offset.
    pub channel: u8,
}

impl Correction {
    pub fn at(time: DateTime<Utc>, offset_hz: f64) -> Self {
        Self {
            time,
            offset_hz,
            channel: channel_for_offset(offset_hz),
        }
    }
}

/// Maps a desired frequency offset onto the channel ladder, rounding away
/// from zero.
///
/// Channels: 1 carries no offset, 2/3 carry ±1 step, 4/5 carry ±2 steps
/// (positive offsets on even channels). Offsets beyond the ladder clamp to
/// its outermost rungs.
pub fn channel_for_offset(offset_hz: f64) -> u8 {
    let half_step = 0.5 * FREQ_STEP_HZ;
    let step_and_half = 1.5 * FREQ_STEP_HZ;
    if offset_hz >= step_and_half {
        4
    } else if offset_hz >= half_step {
        2
    } else if offset_hz > -half_step {
        1
    } else if offset_hz > -step_and_half {
        3
    } else {
        5
    }
}

/// Builds the correction schedule for `pass`.
///
/// Asks the predictor when the shift crosses the four channel midpoints
/// (±0.5 and ±1.5 steps), emits one correction per crossing that actually
/// occurs (activating the offset half a step below the crossing), and
/// prepends a pre-pass correction at rise whose offset depends on how much
/// of the ladder the pass climbs. Activation times are nondecreasing.
pub fn plan<P: PassPredictor>(predictor: &P, pass: &PassData, base_hz: f64) -> Vec<Correction> {
    let thresholds = [
        1.5 * FREQ_STEP_HZ,
        0.5 * FREQ_STEP_HZ,
        -0.5 * FREQ_STEP_HZ,
        -1.5 * FREQ_STEP_HZ,
    ];
    let threshold_times = predictor.doppler_threshold_times(&thresholds, pass, base_hz);

    let mut corrections: Vec<Correction> = threshold_times
        .iter()
        .filter_map(|&(threshold, time)| {
            time.map(|time| Correction::at(time, threshold - 0.5 * FREQ_STEP_HZ))
        })
        .collect();
    if corrections.len() % 2 != 0 {
        warn!("unusual doppler correction times for pass (proceeding): {:?}", corrections);
    }
    corrections.sort_by_key(|c| c.time);

    let first_offset = match corrections.len() {
        0 => {
            warn!("no doppler corrections suggested for pass, defaulting to zero correction");
            0.0
        }
        1 | 2 => FREQ_STEP_HZ,
        _ => 2.0 * FREQ_STEP_HZ,
    };
    corrections.insert(0, Correction::at(pass.rise_time, first_offset));
    corrections
}
