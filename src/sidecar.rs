use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use serde_json::Value;

use crate::error::BidsifyError;

/// Parsed sidecar contents. `serde_json::Map` keeps keys sorted, which
/// matches how the conversion tooling expects sidecars to be written and
/// makes rewrites deterministic.
pub type Fields = serde_json::Map<String, Value>;

pub fn load(path: &Utf8Path) -> Result<Fields, BidsifyError> {
    if !path.as_std_path().is_file() {
        return Err(BidsifyError::FileNotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| BidsifyError::Filesystem(format!("read {path}: {err}")))?;
    let value: Value =
        serde_json::from_str(&content).map_err(|err| BidsifyError::MalformedJson {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(BidsifyError::MalformedJson {
            path: path.to_path_buf(),
            message: format!("expected a JSON object, found {}", json_kind(&other)),
        }),
    }
}

/// Serialize with four-space indentation and a trailing newline, the layout
/// the rest of the conversion stack produces.
pub fn to_bytes(fields: &Fields) -> Result<Vec<u8>, BidsifyError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    fields
        .serialize(&mut serializer)
        .map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Write via a sibling temp file and rename, so a crash never leaves a
/// half-written sidecar.
pub fn save(path: &Utf8Path, fields: &Fields) -> Result<(), BidsifyError> {
    let content = to_bytes(fields)?;
    let parent = path
        .parent()
        .ok_or_else(|| BidsifyError::Filesystem(format!("no parent directory for {path}")))?;
    let temp = tempfile::Builder::new()
        .prefix(".bidsify-sidecar")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), &content)
        .map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| BidsifyError::Filesystem(err.to_string()))?;
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
