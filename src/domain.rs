use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveTime;
use regex::Regex;

use crate::error::BidsifyError;

/// BIDS subject label, stored without the `sub-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectLabel(String);

impl SubjectLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name form, e.g. `sub-01`.
    pub fn dir_name(&self) -> String {
        format!("sub-{}", self.0)
    }
}

impl fmt::Display for SubjectLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl FromStr for SubjectLabel {
    type Err = BidsifyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_start_matches("sub-");
        let is_valid =
            !normalized.is_empty() && normalized.chars().all(|ch| ch.is_ascii_alphanumeric());
        if !is_valid {
            return Err(BidsifyError::InvalidSubjectLabel(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// BIDS session label, stored without the `ses-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionLabel(String);

impl SessionLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn dir_name(&self) -> String {
        format!("ses-{}", self.0)
    }
}

impl fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ses-{}", self.0)
    }
}

impl FromStr for SessionLabel {
    type Err = BidsifyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_start_matches("ses-");
        let is_valid =
            !normalized.is_empty() && normalized.chars().all(|ch| ch.is_ascii_alphanumeric());
        if !is_valid {
            return Err(BidsifyError::InvalidSessionLabel(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// BIDS modality (datatype) directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modality {
    Anat,
    Func,
    Dwi,
    Fmap,
    Perf,
    Other,
}

impl Modality {
    pub fn from_dir_name(name: &str) -> Self {
        match name {
            "anat" => Modality::Anat,
            "func" => Modality::Func,
            "dwi" => Modality::Dwi,
            "fmap" => Modality::Fmap,
            "perf" => Modality::Perf,
            _ => Modality::Other,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Modality::Anat => "anat",
            Modality::Func => "func",
            Modality::Dwi => "dwi",
            Modality::Fmap => "fmap",
            Modality::Perf => "perf",
            Modality::Other => "other",
        }
    }

    /// Modalities whose series a fieldmap may be intended to correct.
    pub fn is_correctable(&self) -> bool {
        matches!(self, Modality::Func | Modality::Dwi)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Key-value entities parsed from a BIDS filename, e.g.
/// `sub-01_ses-1_task-rest_run-01_bold` yields four entities and the
/// suffix `bold`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntities {
    entities: BTreeMap<String, String>,
    suffix: String,
}

impl ScanEntities {
    /// Parse the entities out of a filename. Any extension chain after the
    /// first dot is ignored, so `.nii.gz` and `.json` parse identically.
    pub fn parse(file_name: &str) -> Self {
        let stem = match file_name.split_once('.') {
            Some((stem, _)) => stem,
            None => file_name,
        };
        let pair = Regex::new(r"^([a-zA-Z0-9]+)-(.+)$").unwrap();
        let mut entities = BTreeMap::new();
        let mut suffix = String::new();
        for chunk in stem.split('_') {
            match pair.captures(chunk) {
                Some(caps) => {
                    entities.insert(caps[1].to_string(), caps[2].to_string());
                }
                None => {
                    suffix = chunk.to_string();
                }
            }
        }
        Self { entities, suffix }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn subject(&self) -> Option<&str> {
        self.get("sub")
    }

    pub fn session(&self) -> Option<&str> {
        self.get("ses")
    }

    pub fn task(&self) -> Option<&str> {
        self.get("task")
    }

    pub fn acquisition(&self) -> Option<&str> {
        self.get("acq")
    }

    /// Whether `other` names the same fieldmap series as `self`, ignoring the
    /// run index. Used to find the bracketing fieldmap that ends an
    /// `IntendedFor` window.
    pub fn same_series_ignoring_run(&self, other: &ScanEntities) -> bool {
        if self.suffix != other.suffix {
            return false;
        }
        self.entities
            .iter()
            .filter(|(key, _)| key.as_str() != "run")
            .all(|(key, value)| other.get(key) == Some(value.as_str()))
    }
}

/// Ordering key for temporal bracketing, parsed from the sidecar
/// `AcquisitionTime` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AcquisitionTime(NaiveTime);

impl AcquisitionTime {
    /// Accepts the bare clock form dcm2niix emits (`13:14:15.250000`) and the
    /// date-time form some converters write instead.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Ok(time) = NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f") {
            return Some(Self(time));
        }
        chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|dt| Self(dt.time()))
    }
}

impl fmt::Display for AcquisitionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M:%S%.6f"))
    }
}
