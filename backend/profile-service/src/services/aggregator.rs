//! Weighted-mean profile aggregation.
//!
//! A profile is the L2-normalized weighted mean of the embeddings of every
//! observation folded into it. Two entry points produce one:
//!
//! - [`ProfileAggregator::build`] computes it from scratch over a batch.
//! - [`ProfileAggregator::update`] folds a single observation into an existing
//!   profile without re-reading history.
//!
//! Normalization discards the magnitude of the weighted mean, so the profile
//! also carries `mean_norm` (`‖Σ vᵢwᵢ‖ / Σ wᵢ`). Together with `weight_sum` it
//! restores the exact prior weighted sum, which makes folding observations in
//! one by one agree with a single bulk build over the same set. Records written
//! without `mean_norm` read it as 1.0.
//!
//! Accumulation happens in `f64`; vectors are stored as `f32`.

use crate::models::{round3, ProfileSource, UserProfile};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Norms below this are treated as zero
const NORM_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    #[error("No observations to aggregate")]
    NoData,

    #[error("Total weight is not positive: {0}")]
    ZeroWeight(f64),

    #[error("Aggregated vector has zero norm")]
    ZeroNorm,

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("No profile exists for user; a bulk build is required")]
    MissingProfile,

    #[error("Empty vector")]
    EmptyVector,
}

/// Direction and magnitude state of a profile
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Unit-norm direction
    pub vector: Vec<f32>,
    pub weight_sum: f64,
    pub mean_norm: f64,
}

impl Aggregate {
    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            vector: profile.vector.clone(),
            weight_sum: profile.weight_sum,
            mean_norm: profile.mean_norm,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileAggregator {
    dimension: usize,
}

impl ProfileAggregator {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Weighted mean of `observations`, L2-normalized.
    pub fn build(&self, observations: &[(Vec<f32>, f64)]) -> Result<Aggregate, AggregateError> {
        if observations.is_empty() {
            return Err(AggregateError::NoData);
        }

        let mut sum = vec![0.0f64; self.dimension];
        let mut weight_sum = 0.0f64;

        for (vector, weight) in observations {
            self.check_vector(vector)?;
            check_weight(*weight)?;
            accumulate(&mut sum, vector, *weight);
            weight_sum += weight;
        }

        finalize(sum, weight_sum)
    }

    /// Folds one observation into `previous`.
    ///
    /// `previous` must come from an earlier build or update; `None` reports
    /// [`AggregateError::MissingProfile`] instead of creating a one-observation
    /// profile.
    pub fn update(
        &self,
        previous: Option<&Aggregate>,
        vector: &[f32],
        weight: f64,
    ) -> Result<Aggregate, AggregateError> {
        let previous = previous.ok_or(AggregateError::MissingProfile)?;
        self.check_vector(&previous.vector)?;
        self.check_vector(vector)?;
        check_weight(weight)?;
        check_weight(previous.weight_sum)?;

        let scale = previous.mean_norm * previous.weight_sum;
        let mut sum: Vec<f64> = previous.vector.iter().map(|x| *x as f64 * scale).collect();
        accumulate(&mut sum, vector, weight);

        finalize(sum, previous.weight_sum + weight)
    }

    /// New profile from a bulk build over `(vector, weight)` pairs
    pub fn build_profile(
        &self,
        user_id: &str,
        observations: &[(Vec<f32>, f64)],
        created_from: ProfileSource,
        now: DateTime<Utc>,
    ) -> Result<UserProfile, AggregateError> {
        let aggregate = self.build(observations)?;

        let count = observations.len();
        let (min_weight, max_weight) = observations.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(min, max), (_, w)| (min.min(*w), max.max(*w)),
        );

        Ok(UserProfile {
            user_id: user_id.to_string(),
            vector: aggregate.vector,
            weight_sum: aggregate.weight_sum,
            mean_norm: aggregate.mean_norm,
            log_count: count as u64,
            avg_weight: round3(aggregate.weight_sum / count as f64),
            max_weight,
            min_weight,
            created_from,
            created_at: now,
            last_update: now,
        })
    }

    /// `profile` with one more observation folded in; statistics follow along
    pub fn update_profile(
        &self,
        profile: Option<&UserProfile>,
        vector: &[f32],
        weight: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<UserProfile, AggregateError> {
        let profile = profile.ok_or(AggregateError::MissingProfile)?;
        let aggregate = self.update(Some(&Aggregate::from_profile(profile)), vector, weight)?;

        let log_count = profile.log_count + 1;
        let min_weight = if profile.min_weight > 0.0 {
            profile.min_weight.min(weight)
        } else {
            weight
        };

        Ok(UserProfile {
            user_id: profile.user_id.clone(),
            vector: aggregate.vector,
            weight_sum: aggregate.weight_sum,
            mean_norm: aggregate.mean_norm,
            log_count,
            avg_weight: round3(aggregate.weight_sum / log_count as f64),
            max_weight: profile.max_weight.max(weight),
            min_weight,
            created_from: profile.created_from,
            created_at: profile.created_at,
            last_update: observed_at,
        })
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), AggregateError> {
        if vector.is_empty() {
            return Err(AggregateError::EmptyVector);
        }
        if vector.len() != self.dimension {
            return Err(AggregateError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

pub fn l2_norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|x| (*x as f64) * (*x as f64))
        .sum::<f64>()
        .sqrt()
}

fn check_weight(weight: f64) -> Result<(), AggregateError> {
    if weight.is_finite() && weight > 0.0 {
        Ok(())
    } else {
        Err(AggregateError::ZeroWeight(weight))
    }
}

fn accumulate(sum: &mut [f64], vector: &[f32], weight: f64) {
    for (acc, x) in sum.iter_mut().zip(vector) {
        *acc += *x as f64 * weight;
    }
}

fn finalize(sum: Vec<f64>, weight_sum: f64) -> Result<Aggregate, AggregateError> {
    check_weight(weight_sum)?;

    let norm = sum.iter().map(|x| x * x).sum::<f64>().sqrt();
    if !norm.is_finite() || norm < NORM_EPSILON {
        return Err(AggregateError::ZeroNorm);
    }

    Ok(Aggregate {
        vector: sum.iter().map(|x| (x / norm) as f32).collect(),
        weight_sum,
        mean_norm: norm / weight_sum,
    })
}
