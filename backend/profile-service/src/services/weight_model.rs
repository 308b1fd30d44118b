use crate::models::{round3, DataSource, Observed, WeightInputs};

const BASE_WEIGHT: f64 = 1.0;

const DWELL_FLOOR_SECS: f64 = 30.0;
const DWELL_SCALE_SECS: f64 = 60.0;
const MAX_DWELL_BONUS: f64 = 2.0;

const SCROLL_FLOOR_PCT: f64 = 50.0;
const SCROLL_SCALE_PCT: f64 = 100.0;
const MAX_SCROLL_PCT: f64 = 100.0;

const TYPED_RATIO_THRESHOLD: f64 = 0.3;
const TYPED_BONUS: f64 = 0.5;

pub const MIN_WEIGHT: f64 = BASE_WEIGHT;
pub const MAX_WEIGHT: f64 = 5.0;

/// Importance of one observation derived from behavioral signals.
///
/// Pure and deterministic. Result is always in `[MIN_WEIGHT, MAX_WEIGHT]` and
/// rounded to 3 decimals.
pub fn weight(inputs: &WeightInputs) -> f64 {
    let mut weight = BASE_WEIGHT;

    let dwell = sanitize(inputs.time_spent_secs);
    if dwell > DWELL_FLOOR_SECS {
        weight += ((dwell - DWELL_FLOOR_SECS) / DWELL_SCALE_SECS).min(MAX_DWELL_BONUS);
    }

    let scroll = sanitize(inputs.scroll_depth_pct).min(MAX_SCROLL_PCT);
    if scroll > SCROLL_FLOOR_PCT {
        weight += (scroll - SCROLL_FLOOR_PCT) / SCROLL_SCALE_PCT;
    }

    if inputs.source == DataSource::History {
        let ratio = inputs.typed_count as f64 / inputs.visit_count.max(1) as f64;
        if ratio > TYPED_RATIO_THRESHOLD {
            weight += TYPED_BONUS;
        }
    }

    round3(weight.clamp(MIN_WEIGHT, MAX_WEIGHT))
}

pub fn weight_of(observation: &dyn Observed) -> f64 {
    weight(&observation.weight_inputs())
}

// NaN and negative readings count as no signal
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
