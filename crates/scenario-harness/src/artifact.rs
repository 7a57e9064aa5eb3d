use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{HarnessError, HarnessResult};

/// Outcome the execution script leaves behind in the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub collision_flag: bool,
    pub min_ttc: f64,
    pub collision_status: String,
    pub distance: f64,
}

pub fn read_result_artifact(path: &Path) -> HarnessResult<ResultArtifact> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(HarnessError::ResultArtifactMissing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let artifact: ResultArtifact =
        serde_json::from_slice(&bytes).map_err(|e| HarnessError::ResultArtifactMalformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if artifact.min_ttc.is_nan() {
        return Err(HarnessError::ResultArtifactMalformed {
            path: path.to_path_buf(),
            reason: "min_ttc is NaN".to_string(),
        });
    }
    Ok(artifact)
}

/// Removes a leftover artifact so the next read can only see output from the
/// attempt that follows.
pub fn clear_result_artifact(path: &Path) -> HarnessResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
