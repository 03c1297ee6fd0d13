//! Captured trace directory: validation and the sources document.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::read_json;

/// File name of the capture-format marker every usable trace carries.
const VERSION_MARKER: &str = "version";
/// Source-description document written by the trace inspector.
const SOURCES_DOC: &str = "sources.extra";

/// Symlink recorded by the trace inspector: `from` is the link location,
/// `to` is what it points at.
#[derive(Deserialize, Debug, Clone)]
pub struct SymlinkDesc {
    pub from: String,
    pub to: String,
}

/// External debug info discovered for one binary, indexed by build id.
#[derive(Deserialize, Debug, Clone)]
pub struct ExternalDebugInfo {
    pub build_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

/// Inspector output describing everything the trace replay will read.
///
/// `files` maps a repository root (or `""` for files outside any known
/// repository) to paths relative to that root.
#[derive(Deserialize, Debug, Default)]
pub struct SourcesDoc {
    #[serde(default)]
    pub relevant_binaries: Vec<String>,
    #[serde(default)]
    pub files: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkDesc>,
    #[serde(default)]
    pub dwos: Vec<serde_json::Value>,
    #[serde(default)]
    pub external_debug_info: Vec<ExternalDebugInfo>,
}

/// A validated on-disk trace directory.
pub struct TraceDir {
    root: PathBuf,
}

impl TraceDir {
    /// Open a trace directory, requiring the capture version marker.
    pub fn open(root: &Path) -> Result<TraceDir> {
        if !root.is_dir() {
            return Err(anyhow!("trace directory {} not found", root.display()));
        }
        if !root.join(VERSION_MARKER).is_file() {
            return Err(anyhow!(
                "{} does not look like a trace: missing `{VERSION_MARKER}` marker",
                root.display()
            ));
        }
        Ok(TraceDir {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the sources document. Split-debug-object (`dwos`) captures are
    /// rejected here: the upload format has no representation for them, and
    /// silently dropping them would produce a trace that cannot replay.
    pub fn load_sources(&self) -> Result<SourcesDoc> {
        let path = self.root.join(SOURCES_DOC);
        let doc: SourcesDoc = read_json(&path)?;
        if !doc.dwos.is_empty() {
            return Err(anyhow!(
                "trace was built with split debug info (.dwo); this mode is not supported"
            ));
        }
        Ok(doc)
    }

    /// Copy external debug files into the trace's `.build-id` layout so the
    /// analysis service finds them where debuggers expect them:
    /// `debug/.build-id/<first two hex chars>/<rest>.<ext>`.
    pub fn copy_external_debug_info(&self, entries: &[ExternalDebugInfo]) -> Result<()> {
        for entry in entries {
            if entry.build_id.len() < 3 {
                return Err(anyhow!("malformed build id {:?}", entry.build_id));
            }
            let ext = match entry.kind.as_str() {
                "debuglink" => "debug",
                "debugaltlink" => "sup",
                other => {
                    return Err(anyhow!("unknown external debug info type {other:?}"));
                }
            };
            let (prefix, rest) = entry.build_id.split_at(2);
            let dest_dir = self.root.join("debug").join(".build-id").join(prefix);
            fs::create_dir_all(&dest_dir)
                .with_context(|| format!("create {}", dest_dir.display()))?;
            let dest = dest_dir.join(format!("{rest}.{ext}"));
            fs::copy(&entry.path, &dest)
                .with_context(|| format!("copy {} to {}", entry.path, dest.display()))?;
        }
        Ok(())
    }
}
