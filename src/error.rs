use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BidsifyError {
    #[error("invalid subject label: {0}")]
    InvalidSubjectLabel(String),

    #[error("invalid session label: {0}")]
    InvalidSessionLabel(String),

    #[error("subject directory not found: {0}")]
    SubjectNotFound(Utf8PathBuf),

    #[error("file not found: {0}")]
    FileNotFound(Utf8PathBuf),

    #[error("malformed JSON in {path}: {message}")]
    MalformedJson {
        path: Utf8PathBuf,
        message: String,
    },

    #[error("ambiguous fieldmap linkage for {path}: {message}")]
    LinkageAmbiguous {
        path: Utf8PathBuf,
        message: String,
    },

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
}
