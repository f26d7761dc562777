use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::BidsifyError;

/// Fields the cleaning pass strips from every sidecar: scanner serial
/// numbers, operator and patient identity, acquisition dates, free-text
/// comments, and vendor blobs. The dcm2niix `global` key is handled
/// separately by the pass itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanConfig {
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
        }
    }
}

impl CleanConfig {
    pub fn denies(&self, key: &str) -> bool {
        self.denylist.iter().any(|entry| entry == key)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&Utf8Path>) -> Result<CleanConfig, BidsifyError> {
        let Some(path) = path else {
            return Ok(CleanConfig::default());
        };
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| BidsifyError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| BidsifyError::ConfigParse(err.to_string()))
    }
}

pub fn default_denylist() -> Vec<String> {
    [
        "AcquisitionDateTime",
        "DeviceSerialNumber",
        "ImageComments",
        "OperatorName",
        "OperatorsName",
        "PatientBirthDate",
        "PatientID",
        "PatientName",
        "ProcedureStepDescription",
        "ReferringPhysicianName",
        "SeriesComments",
        "StudyComments",
        "WipMemBlock",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
