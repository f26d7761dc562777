use std::io::{self, Write};

use camino::Utf8Path;
use serde::Serialize;

use crate::error::BidsifyError;
use crate::layout::SidecarSet;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Modified,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: String,
    pub action: FileAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-file record of one pass over a sidecar set.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass: String,
    pub outcomes: Vec<FileOutcome>,
    pub warnings: Vec<String>,
}

impl PassReport {
    pub fn new(pass: &str) -> Self {
        Self {
            pass: pass.to_string(),
            outcomes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn modified(&mut self, path: &Utf8Path) {
        self.record(path, FileAction::Modified, None);
    }

    pub fn unchanged(&mut self, path: &Utf8Path) {
        self.record(path, FileAction::Unchanged, None);
    }

    pub fn skipped(&mut self, path: &Utf8Path, reason: String) {
        self.record(path, FileAction::Skipped, Some(reason));
    }

    pub fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    /// Sidecars that already failed at load time are carried into every pass
    /// as skipped files; modality directories absent from the scope become
    /// warnings.
    pub fn record_load_issues(&mut self, set: &SidecarSet) {
        for failure in &set.failures {
            self.skipped(&failure.path, failure.error.clone());
        }
        for note in &set.missing_dirs {
            self.warn(note.clone());
        }
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| outcome.action == FileAction::Skipped)
    }

    fn count(&self, action: FileAction) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.action == action)
            .count()
    }

    fn record(&mut self, path: &Utf8Path, action: FileAction, reason: Option<String>) {
        self.outcomes.push(FileOutcome {
            path: path.to_string(),
            action,
            reason,
        });
    }
}

/// Machine-readable status artifact for downstream tooling.
#[derive(Debug, Clone, Serialize)]
pub struct StatusArtifact<'a> {
    pub passes: &'a [PassReport],
}

pub fn write_status(path: &Utf8Path, reports: &[PassReport]) -> Result<(), BidsifyError> {
    let artifact = StatusArtifact { passes: reports };
    let content = serde_json::to_vec_pretty(&artifact)
        .map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
    std::fs::write(path.as_std_path(), content)
        .map_err(|err| BidsifyError::Filesystem(format!("write {path}: {err}")))?;
    Ok(())
}

pub fn print_reports(mode: OutputMode, reports: &[PassReport]) -> io::Result<()> {
    match mode {
        OutputMode::Json => print_json(&StatusArtifact { passes: reports }),
        OutputMode::Human => {
            let mut stdout = io::stdout();
            for report in reports {
                writeln!(
                    stdout,
                    "{}: {} modified, {} unchanged, {} skipped",
                    report.pass,
                    report.count(FileAction::Modified),
                    report.count(FileAction::Unchanged),
                    report.count(FileAction::Skipped),
                )?;
                for outcome in &report.outcomes {
                    if outcome.action == FileAction::Skipped {
                        writeln!(
                            stdout,
                            "  skipped {}: {}",
                            outcome.path,
                            outcome.reason.as_deref().unwrap_or("unknown"),
                        )?;
                    }
                }
                for warning in &report.warnings {
                    writeln!(stdout, "  warning: {warning}")?;
                }
            }
            Ok(())
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let mut stdout = io::stdout();
    stdout.write_all(json.as_bytes())?;
    stdout.write_all(b"\n")?;
    Ok(())
}
