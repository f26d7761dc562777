use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::BidsifyError;

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

pub fn tool_version(path: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new(path).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() { None } else { Some(stdout) }
}

/// Run an external tool, returning its stdout. A non-zero exit becomes
/// `ToolFailed` carrying the tool's stderr.
pub fn run_tool(
    tool: &str,
    program: &Path,
    args: &[String],
    envs: &[(&str, String)],
) -> Result<String, BidsifyError> {
    debug!(tool, ?args, "running external tool");
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    let output = cmd.output().map_err(|err| BidsifyError::ToolFailed {
        tool: tool.to_string(),
        message: err.to_string(),
    })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    };
    Err(BidsifyError::ToolFailed {
        tool: tool.to_string(),
        message,
    })
}
