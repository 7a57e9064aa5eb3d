use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBound {
    pub name: String,
    pub lo: f64,
    pub hi: f64,
}

impl ParamBound {
    pub fn new(name: impl Into<String>, lo: f64, hi: f64) -> Self {
        Self {
            name: name.into(),
            lo,
            hi,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lo && value <= self.hi
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lo).min(self.hi)
    }
}

/// Ordered, immutable set of named closed bounds. Candidate vectors are
/// interpreted positionally against this ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    bounds: Vec<ParamBound>,
}

impl ParameterSpace {
    pub fn new(bounds: Vec<ParamBound>) -> HarnessResult<Self> {
        if bounds.is_empty() {
            return Err(HarnessError::config("parameter space is empty"));
        }
        for (idx, bound) in bounds.iter().enumerate() {
            if bound.lo.is_nan() || bound.hi.is_nan() || bound.lo > bound.hi {
                return Err(HarnessError::InvalidBounds {
                    name: bound.name.clone(),
                    lo: bound.lo,
                    hi: bound.hi,
                });
            }
            // samplers draw from [lo, hi] and PSO from [-(hi - lo), hi - lo]
            if !(2.0 * (bound.hi - bound.lo)).is_finite() {
                return Err(HarnessError::config(format!(
                    "parameter {} has a non-finite range [{}, {}]",
                    bound.name, bound.lo, bound.hi
                )));
            }
            if bounds[..idx].iter().any(|b| b.name == bound.name) {
                return Err(HarnessError::config(format!(
                    "duplicate parameter name: {}",
                    bound.name
                )));
            }
        }
        Ok(Self { bounds })
    }

    pub fn dim(&self) -> usize {
        self.bounds.len()
    }

    pub fn bounds(&self) -> &[ParamBound] {
        &self.bounds
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bounds.iter().map(|b| b.name.as_str())
    }

    pub fn lower(&self) -> Vec<f64> {
        self.bounds.iter().map(|b| b.lo).collect()
    }

    pub fn upper(&self) -> Vec<f64> {
        self.bounds.iter().map(|b| b.hi).collect()
    }

    pub fn check_dim(&self, vector: &[f64]) -> HarnessResult<()> {
        if vector.len() != self.dim() {
            return Err(HarnessError::DimensionMismatch {
                expected: self.dim(),
                actual: vector.len(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, vector: &[f64]) -> bool {
        vector.len() == self.dim()
            && self
                .bounds
                .iter()
                .zip(vector)
                .all(|(bound, value)| bound.contains(*value))
    }

    pub fn clamp(&self, vector: &[f64]) -> Vec<f64> {
        self.bounds
            .iter()
            .zip(vector)
            .map(|(bound, value)| bound.clamp(*value))
            .collect()
    }
}
