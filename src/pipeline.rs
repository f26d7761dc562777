use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::clean::clean_pass;
use crate::complete::{CompleteOptions, complete_pass};
use crate::config::CleanConfig;
use crate::domain::{SessionLabel, SubjectLabel};
use crate::error::BidsifyError;
use crate::layout::{DatasetLayout, IMAGE_EXT};
use crate::report::{self, PassReport};
use crate::tools::{find_in_path, run_tool, tool_version};

pub const STATUS_FILE: &str = "bidsify_status.json";
pub const VALIDATOR_FILE: &str = "validator.txt";
pub const FAILURE_MARKER: &str = "bidsify_failure.txt";

const BIDSIGNORE_ENTRIES: &[&str] = &[".heudiconv/", "tmp/", VALIDATOR_FILE, STATUS_FILE];

/// One full conversion request: raw DICOMs in, completed and cleaned BIDS
/// subject out.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub dicom_dir: Utf8PathBuf,
    pub heuristics: Utf8PathBuf,
    pub subject: SubjectLabel,
    pub session: Option<SessionLabel>,
    pub output_dir: Utf8PathBuf,
}

/// DICOM→BIDS converter seam.
pub trait ConverterClient {
    fn convert(&self, request: &RunRequest, tmp_dir: &Utf8Path) -> Result<(), BidsifyError>;
}

/// Defacer seam, applied to each anatomical image in place.
pub trait DefacerClient {
    fn deface(&self, image: &Utf8Path, tmp_dir: &Utf8Path) -> Result<(), BidsifyError>;
}

/// BIDS validator seam; returns the validator's report text.
pub trait ValidatorClient {
    fn validate(&self, root: &Utf8Path, tmp_dir: &Utf8Path) -> Result<String, BidsifyError>;
}

pub struct HeudiconvClient {
    heudiconv: Option<PathBuf>,
}

impl HeudiconvClient {
    pub fn new() -> Self {
        Self {
            heudiconv: find_in_path("heudiconv"),
        }
    }

    pub fn version(&self) -> Option<String> {
        self.heudiconv
            .as_ref()
            .and_then(|path| tool_version(path, &["--version"]))
    }
}

impl ConverterClient for HeudiconvClient {
    fn convert(&self, request: &RunRequest, tmp_dir: &Utf8Path) -> Result<(), BidsifyError> {
        let heudiconv = self
            .heudiconv
            .as_ref()
            .ok_or_else(|| BidsifyError::MissingTool("heudiconv".to_string()))?;
        let mut args = dicom_input_args(request)?;
        args.extend([
            "-s".to_string(),
            request.subject.as_str().to_string(),
            "-f".to_string(),
            request.heuristics.to_string(),
            "-c".to_string(),
            "dcm2niix".to_string(),
            "-o".to_string(),
            request.output_dir.to_string(),
            "--bids".to_string(),
            "--overwrite".to_string(),
            "--minmeta".to_string(),
        ]);
        if let Some(session) = &request.session {
            args.extend(["-ss".to_string(), session.as_str().to_string()]);
        }
        run_tool(
            "heudiconv",
            heudiconv,
            &args,
            &[("TMPDIR", tmp_dir.to_string())],
        )?;
        Ok(())
    }
}

/// Tarball inputs go to heudiconv as a `-d` template with `{subject}` (and
/// `{session}`) placeholders; plain directories go through `--files`.
fn dicom_input_args(request: &RunRequest) -> Result<Vec<String>, BidsifyError> {
    let dicom_dir = &request.dicom_dir;
    if dicom_dir.as_std_path().is_file() {
        let mut template = dicom_dir
            .to_string()
            .replace(request.subject.as_str(), "{subject}");
        if let Some(session) = &request.session {
            template = template.replace(session.as_str(), "{session}");
        }
        Ok(vec!["-d".to_string(), template])
    } else if dicom_dir.as_std_path().is_dir() {
        Ok(vec!["--files".to_string(), dicom_dir.to_string()])
    } else {
        Err(BidsifyError::FileNotFound(dicom_dir.clone()))
    }
}

pub struct MriDefaceClient {
    mri_deface: Option<PathBuf>,
    brain_template: Utf8PathBuf,
    face_template: Utf8PathBuf,
}

impl MriDefaceClient {
    pub fn new(brain_template: Utf8PathBuf, face_template: Utf8PathBuf) -> Self {
        Self {
            mri_deface: find_in_path("mri_deface"),
            brain_template,
            face_template,
        }
    }
}

impl DefacerClient for MriDefaceClient {
    fn deface(&self, image: &Utf8Path, tmp_dir: &Utf8Path) -> Result<(), BidsifyError> {
        let mri_deface = self
            .mri_deface
            .as_ref()
            .ok_or_else(|| BidsifyError::MissingTool("mri_deface".to_string()))?;
        // Output path equals input path, so the defaced image replaces the
        // original.
        let args = vec![
            image.to_string(),
            self.brain_template.to_string(),
            self.face_template.to_string(),
            image.to_string(),
        ];
        run_tool(
            "mri_deface",
            mri_deface,
            &args,
            &[("TMPDIR", tmp_dir.to_string())],
        )?;
        Ok(())
    }
}

pub struct BidsValidatorClient {
    bids_validator: Option<PathBuf>,
}

impl BidsValidatorClient {
    pub fn new() -> Self {
        Self {
            bids_validator: find_in_path("bids-validator"),
        }
    }

    pub fn version(&self) -> Option<String> {
        self.bids_validator
            .as_ref()
            .and_then(|path| tool_version(path, &["--version"]))
    }
}

impl ValidatorClient for BidsValidatorClient {
    fn validate(&self, root: &Utf8Path, tmp_dir: &Utf8Path) -> Result<String, BidsifyError> {
        let bids_validator = self
            .bids_validator
            .as_ref()
            .ok_or_else(|| BidsifyError::MissingTool("bids-validator".to_string()))?;
        let args = vec![root.to_string(), "--ignoreWarnings".to_string()];
        run_tool(
            "bids-validator",
            bids_validator,
            &args,
            &[("TMPDIR", tmp_dir.to_string())],
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub passes: Vec<PassReport>,
    pub saved: Vec<Utf8PathBuf>,
    pub validator_report: Utf8PathBuf,
}

pub struct Workflow<C: ConverterClient, D: DefacerClient, V: ValidatorClient> {
    converter: C,
    defacer: D,
    validator: V,
    clean_config: CleanConfig,
}

impl<C: ConverterClient, D: DefacerClient, V: ValidatorClient> Workflow<C, D, V> {
    pub fn new(converter: C, defacer: D, validator: V, clean_config: CleanConfig) -> Self {
        Self {
            converter,
            defacer,
            validator,
            clean_config,
        }
    }

    pub fn run(&self, request: &RunRequest) -> Result<RunSummary, BidsifyError> {
        if !request.heuristics.as_std_path().is_file() {
            return Err(BidsifyError::FileNotFound(request.heuristics.clone()));
        }

        let layout = DatasetLayout::new(request.output_dir.clone());
        let tmp_dir = tmp_dir_for(request);
        fs::create_dir_all(tmp_dir.as_std_path())
            .map_err(|err| BidsifyError::Filesystem(format!("create {tmp_dir}: {err}")))?;
        write_bidsignore(&request.output_dir)?;

        info!(subject = %request.subject, "running converter");
        self.converter.convert(request, &tmp_dir)?;

        let scope = layout.scope_dir(&request.subject, request.session.as_ref());
        for image in anat_images(&scope)? {
            info!(image = %image, "defacing");
            self.defacer.deface(&image, &tmp_dir)?;
        }

        let mut set = layout.load_scope(&request.subject, request.session.as_ref())?;
        let passes = vec![
            complete_pass(&mut set, CompleteOptions { overwrite: true }),
            clean_pass(&mut set, &self.clean_config),
        ];
        let saved = set.save_dirty()?;
        report::write_status(&request.output_dir.join(STATUS_FILE), &passes)?;

        info!("running validator");
        let validator_output = self.validator.validate(layout.root(), &tmp_dir)?;
        let validator_report = request.output_dir.join(VALIDATOR_FILE);
        fs::write(validator_report.as_std_path(), validator_output)
            .map_err(|err| BidsifyError::Filesystem(format!("write {validator_report}: {err}")))?;

        remove_workdirs(
            &request.output_dir,
            &request.subject,
            request.session.as_ref(),
        );
        normalize_permissions(&layout.subject_dir(&request.subject));

        Ok(RunSummary {
            passes,
            saved,
            validator_report,
        })
    }
}

/// Failure marker for downstream tooling, written in place of validator
/// output when the pipeline dies partway.
pub fn write_failure_marker(output_dir: &Utf8Path, error: &BidsifyError) {
    let marker = output_dir.join(FAILURE_MARKER);
    if let Err(err) = fs::write(marker.as_std_path(), format!("{error}\n")) {
        warn!(path = %marker, error = %err, "could not write failure marker");
    }
}

fn tmp_dir_for(request: &RunRequest) -> Utf8PathBuf {
    let mut dir = request.output_dir.join("tmp").join(request.subject.as_str());
    if let Some(session) = &request.session {
        dir.push(session.as_str());
    }
    dir
}

fn write_bidsignore(output_dir: &Utf8Path) -> Result<(), BidsifyError> {
    let path = output_dir.join(".bidsignore");
    if path.as_std_path().is_file() {
        return Ok(());
    }
    let mut content = BIDSIGNORE_ENTRIES.join("\n");
    content.push('\n');
    fs::write(path.as_std_path(), content)
        .map_err(|err| BidsifyError::Filesystem(format!("write {path}: {err}")))
}

fn anat_images(scope: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BidsifyError> {
    let anat = scope.join("anat");
    if !anat.as_std_path().is_dir() {
        warn!(path = %anat, "no anatomical directory, skipping defacing");
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(anat.as_std_path())
        .map_err(|err| BidsifyError::Filesystem(format!("read {anat}: {err}")))?;
    let mut images = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path())
            && path.file_name().unwrap_or_default().ends_with(IMAGE_EXT)
        {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Drop the converter's working directories, returning the tree to plain
/// BIDS. Best effort: a leftover directory is worth a warning, not a failed
/// run.
fn remove_workdirs(output_dir: &Utf8Path, subject: &SubjectLabel, session: Option<&SessionLabel>) {
    for root in [".heudiconv", "tmp"] {
        let base = output_dir.join(root);
        if let Some(session) = session {
            let leaf = if root == ".heudiconv" {
                base.join(subject.as_str()).join(session.dir_name())
            } else {
                base.join(subject.as_str()).join(session.as_str())
            };
            remove_dir_if_present(&leaf);
        }
        remove_dir_if_present(&base.join(subject.as_str()));
        if dir_is_empty(&base) {
            remove_dir_if_present(&base);
        }
    }
}

fn remove_dir_if_present(dir: &Utf8Path) {
    if !dir.as_std_path().is_dir() {
        return;
    }
    info!(path = %dir, "removing working directory");
    if let Err(err) = fs::remove_dir_all(dir.as_std_path()) {
        warn!(path = %dir, error = %err, "could not remove working directory");
    }
}

fn dir_is_empty(dir: &Utf8Path) -> bool {
    fs::read_dir(dir.as_std_path())
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Group-writable output so the rest of the lab can work with the dataset.
#[cfg(unix)]
fn normalize_permissions(dir: &Utf8Path) {
    use std::os::unix::fs::PermissionsExt;

    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let std_path = path.as_std_path();
        let mode = if std_path.is_dir() { 0o775 } else { 0o664 };
        if let Err(err) = fs::set_permissions(std_path, fs::Permissions::from_mode(mode)) {
            warn!(path = %path, error = %err, "could not set permissions");
        }
        if !std_path.is_dir() {
            continue;
        }
        if let Ok(entries) = fs::read_dir(std_path) {
            for entry in entries.flatten() {
                if let Ok(child) = Utf8PathBuf::from_path_buf(entry.path()) {
                    stack.push(child);
                }
            }
        }
    }
}

#[cfg(not(unix))]
fn normalize_permissions(_dir: &Utf8Path) {}
