use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::process::Command;

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))?;
    Ok(value)
}

/// Run a query-style external tool to completion and return its stdout.
///
/// Non-zero exit becomes an error carrying the first stderr line, which is
/// usually the only part of a VCS tool's error output worth showing.
pub fn run_tool(label: &str, command: &mut Command) -> Result<Vec<u8>> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = match stderr.trim().lines().next() {
            Some(line) if !line.is_empty() => line.to_string(),
            _ => format!("status {}", output.status),
        };
        return Err(anyhow!("{label} failed: {detail}"));
    }
    Ok(output.stdout)
}

/// Like [`run_tool`] but treats a non-zero exit as "no answer" rather than
/// an error. Used for queries where failure legitimately means absence
/// (e.g. asking a VCS about a remote it cannot reach).
pub fn run_tool_optional(label: &str, command: &mut Command) -> Result<Option<Vec<u8>>> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_tool_reports_first_stderr_line() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; echo detail >&2; exit 3"]);
        let err = run_tool("sh", &mut cmd).unwrap_err();
        let rendered = format!("{err}");
        assert!(rendered.contains("boom"), "got: {rendered}");
        assert!(!rendered.contains("detail"));
    }

    #[test]
    fn run_tool_optional_maps_failure_to_none() {
        let mut cmd = Command::new("false");
        assert!(run_tool_optional("false", &mut cmd)
            .unwrap()
            .is_none());
    }
}
