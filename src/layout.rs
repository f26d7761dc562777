use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{AcquisitionTime, Modality, ScanEntities, SessionLabel, SubjectLabel};
use crate::error::BidsifyError;
use crate::sidecar::{self, Fields};

pub const IMAGE_EXT: &str = ".nii.gz";

/// A BIDS dataset root.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: Utf8PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_std_path(root: &std::path::Path) -> Result<Self, BidsifyError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|path| BidsifyError::NonUtf8Path(path.display().to_string()))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn subject_dir(&self, subject: &SubjectLabel) -> Utf8PathBuf {
        self.root.join(subject.dir_name())
    }

    /// The directory one invocation operates on: `sub-<label>` or
    /// `sub-<label>/ses-<label>`.
    pub fn scope_dir(
        &self,
        subject: &SubjectLabel,
        session: Option<&SessionLabel>,
    ) -> Utf8PathBuf {
        let mut dir = self.subject_dir(subject);
        if let Some(session) = session {
            dir.push(session.dir_name());
        }
        dir
    }

    /// Load every image+sidecar pair in scope into memory. A sidecar that is
    /// missing or fails to parse becomes a recorded failure, not a fatal
    /// error; an absent scope directory is fatal.
    pub fn load_scope(
        &self,
        subject: &SubjectLabel,
        session: Option<&SessionLabel>,
    ) -> Result<SidecarSet, BidsifyError> {
        let scope = self.scope_dir(subject, session);
        if !scope.as_std_path().is_dir() {
            return Err(BidsifyError::SubjectNotFound(scope));
        }
        let subject_dir = self.subject_dir(subject);

        let mut set = SidecarSet::default();
        let mut found = std::collections::BTreeSet::new();
        for modality_dir in modality_dirs(&scope)? {
            found.insert(Modality::from_dir_name(
                modality_dir.file_name().unwrap_or_default(),
            ));
            self.load_modality_dir(&modality_dir, &subject_dir, &mut set)?;
        }
        // Directories the completion pass reads from; their absence is worth
        // reporting but does not abort the scope.
        for modality in [Modality::Fmap, Modality::Func, Modality::Dwi] {
            if !found.contains(&modality) {
                let dir = modality.dir_name();
                warn!(scope = %scope, dir, "modality directory absent");
                set.missing_dirs
                    .push(format!("no {dir} directory under {scope}"));
            }
        }
        set.scans.sort_by(|a, b| a.image_path.cmp(&b.image_path));
        debug!(
            scans = set.scans.len(),
            failures = set.failures.len(),
            scope = %scope,
            "loaded sidecar set"
        );
        Ok(set)
    }

    fn load_modality_dir(
        &self,
        dir: &Utf8Path,
        subject_dir: &Utf8Path,
        set: &mut SidecarSet,
    ) -> Result<(), BidsifyError> {
        let modality = Modality::from_dir_name(dir.file_name().unwrap_or_default());
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| BidsifyError::Filesystem(format!("read {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
            let path = match Utf8PathBuf::from_path_buf(entry.path()) {
                Ok(path) => path,
                Err(path) => {
                    warn!(path = %path.display(), "skipping non-UTF-8 path");
                    continue;
                }
            };
            let Some(name) = path.file_name() else {
                continue;
            };
            if !name.ends_with(IMAGE_EXT) {
                continue;
            }
            let sidecar_path =
                path.parent().unwrap_or(dir).join(name.replace(IMAGE_EXT, ".json"));
            let relative = path
                .strip_prefix(subject_dir)
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            let display_path = sidecar_path
                .strip_prefix(&self.root)
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|_| sidecar_path.clone());
            let entities = ScanEntities::parse(name);
            match sidecar::load(&sidecar_path) {
                Ok(fields) => set.scans.push(ScanRecord {
                    image_path: path,
                    sidecar_path,
                    display_path,
                    relative_image_path: relative,
                    modality,
                    entities,
                    fields,
                    dirty: false,
                }),
                Err(err) => {
                    warn!(path = %display_path, error = %err, "skipping sidecar");
                    set.failures.push(FileFailure {
                        path: display_path,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// One image with its parsed sidecar.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub image_path: Utf8PathBuf,
    pub sidecar_path: Utf8PathBuf,
    /// Sidecar path relative to the dataset root, for reports.
    pub display_path: Utf8PathBuf,
    /// Image path relative to the subject directory, the form `IntendedFor`
    /// entries take.
    pub relative_image_path: Utf8PathBuf,
    pub modality: Modality,
    pub entities: ScanEntities,
    pub fields: Fields,
    pub dirty: bool,
}

impl ScanRecord {
    pub fn acquisition_time(&self) -> Option<AcquisitionTime> {
        self.fields
            .get("AcquisitionTime")
            .and_then(|value| value.as_str())
            .and_then(AcquisitionTime::parse)
    }
}

/// A sidecar that could not be loaded, carried through so one bad file never
/// blocks its siblings.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: Utf8PathBuf,
    pub error: String,
}

/// The in-memory representation both passes operate on, loaded once and
/// written back once.
#[derive(Debug, Clone, Default)]
pub struct SidecarSet {
    pub scans: Vec<ScanRecord>,
    pub failures: Vec<FileFailure>,
    /// Expected modality directories absent from the scope, reported as
    /// warnings by each pass.
    pub missing_dirs: Vec<String>,
}

impl SidecarSet {
    /// Write back every record a pass touched. Untouched files are not
    /// rewritten, which is what makes a re-run byte-identical.
    pub fn save_dirty(&mut self) -> Result<Vec<Utf8PathBuf>, BidsifyError> {
        let mut saved = Vec::new();
        for scan in &mut self.scans {
            if !scan.dirty {
                continue;
            }
            sidecar::save(&scan.sidecar_path, &scan.fields)?;
            scan.dirty = false;
            saved.push(scan.display_path.clone());
        }
        Ok(saved)
    }
}

/// Modality directories in scope. Without a session argument this descends
/// through any `ses-*` level so longitudinal layouts still enumerate fully.
fn modality_dirs(scope: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BidsifyError> {
    let mut dirs = Vec::new();
    for entry in list_dirs(scope)? {
        let name = entry.file_name().unwrap_or_default();
        if name.starts_with("ses-") {
            dirs.extend(list_dirs(&entry)?);
        } else {
            dirs.push(entry);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn list_dirs(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BidsifyError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| BidsifyError::Filesystem(format!("read {dir}: {err}")))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_subject_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::from_std_path(temp.path()).unwrap();
        let subject: SubjectLabel = "01".parse().unwrap();

        let err = layout.load_scope(&subject, None).unwrap_err();
        assert_matches!(err, BidsifyError::SubjectNotFound(_));
    }

    #[test]
    fn absent_modality_dirs_are_noted_not_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let func = temp.path().join("sub-01").join("func");
        fs::create_dir_all(&func).unwrap();
        fs::write(func.join("sub-01_task-rest_bold.nii.gz"), b"").unwrap();
        fs::write(func.join("sub-01_task-rest_bold.json"), b"{}").unwrap();

        let layout = DatasetLayout::from_std_path(temp.path()).unwrap();
        let subject: SubjectLabel = "01".parse().unwrap();

        let set = layout.load_scope(&subject, None).unwrap();
        assert_eq!(set.scans.len(), 1);
        assert!(set.missing_dirs.iter().any(|note| note.contains("fmap")));
        assert!(set.missing_dirs.iter().any(|note| note.contains("dwi")));
        assert!(!set.missing_dirs.iter().any(|note| note.contains("func")));
    }

    #[test]
    fn scope_dir_includes_session() {
        let layout = DatasetLayout::new("/data/bids");
        let subject: SubjectLabel = "01".parse().unwrap();
        let session: SessionLabel = "pre".parse().unwrap();

        assert_eq!(
            layout.scope_dir(&subject, Some(&session)),
            Utf8PathBuf::from("/data/bids/sub-01/ses-pre")
        );
        assert_eq!(
            layout.scope_dir(&subject, None),
            Utf8PathBuf::from("/data/bids/sub-01")
        );
    }
}
