use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid bounds for parameter {name}: lo {lo} > hi {hi}")]
    InvalidBounds { name: String, lo: f64, hi: f64 },

    #[error("candidate has {actual} coordinates but the parameter space has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("no patch target for parameter {param} on route {route_id} in {}", path.display())]
    PatchNotFound {
        path: PathBuf,
        route_id: String,
        param: String,
    },

    #[error("simulation timed out after {0:?}")]
    SimulationTimeout(Duration),

    #[error("simulation exhausted after {attempts} attempts")]
    SimulationExhausted { attempts: u32 },

    #[error("result artifact missing: {}", .0.display())]
    ResultArtifactMissing(PathBuf),

    #[error("result artifact malformed ({}): {reason}", path.display())]
    ResultArtifactMalformed { path: PathBuf, reason: String },

    #[error("interrupted by user")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        HarnessError::Config(message.into())
    }

    /// Failures of a single execution attempt that the runner absorbs with a
    /// restart and retry.
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::SimulationTimeout(_)
                | HarnessError::ResultArtifactMissing(_)
                | HarnessError::ResultArtifactMalformed { .. }
        )
    }
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;
