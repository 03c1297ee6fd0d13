//! Manifest construction: partition every referenced source file into
//! remote-fetchable, embedded, or placeholder, and emit `sources.user`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::resolve::{resolve, Resolution};
use crate::trace::{SourcesDoc, SymlinkDesc, TraceDir};
use crate::util::write_json;

/// Archives land under this fixed subdirectory of the trace.
const ARCHIVE_DIR: &str = "files.user";
const EMBED_ARCHIVE: &str = "files.user/sources.zip";
const PLACEHOLDER_ARCHIVE: &str = "files.user/placeholders.zip";
/// Output manifest file name.
pub const MANIFEST_NAME: &str = "sources.user";

/// Priority of the placeholder record: strongly negative so viewers treat
/// its contents as a stand-in, never as authoritative source.
const PLACEHOLDER_PRIORITY: i64 = -1000;

/// How many disallowed paths to report individually before going quiet.
const DISALLOWED_WARN_CAP: usize = 10;
/// Registry checkouts are expected to fall outside the allow-list in bulk;
/// they neither get warned about nor count toward the cap.
const VENDORED_BYPASS: &str = "/.cargo/registry/src/";

/// One mount instruction in a manifest record.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Mount {
    Url {
        url: String,
        at: String,
        #[serde(rename = "urlSuffix", skip_serializing_if = "Option::is_none")]
        url_suffix: Option<String>,
    },
    Archive {
        archive: String,
        at: String,
    },
    Symlink {
        link: String,
        at: String,
    },
}

#[derive(Serialize, Debug, Clone)]
pub struct BinaryCondition {
    pub binary: String,
}

/// OR over the relevant binary identifiers. Always an explicit list, even
/// for a single binary, so consumers need one code path.
#[derive(Serialize, Debug, Clone)]
pub struct Condition {
    pub or: Vec<BinaryCondition>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Relevant,
    NotRelevant,
}

#[derive(Serialize, Debug, Clone)]
pub struct ManifestRecord {
    pub condition: Condition,
    pub files: Vec<Mount>,
    pub relevance: Relevance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

/// A repository's candidate files together with its resolution outcome.
pub struct RepoBucket {
    pub repo: String,
    pub files: Vec<String>,
    pub resolution: Resolution,
}

/// Diagnostic counts surfaced after a build.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ManifestSummary {
    pub explicit_files: usize,
    pub non_repo_files: usize,
    pub embedded: usize,
    pub placeholders: usize,
    pub url_mounts: usize,
}

/// Resolve every real repository in the sources document. The empty-path
/// bucket (files outside any repository) passes through as `Unresolved`.
pub fn resolve_repositories(files: &BTreeMap<String, Vec<String>>) -> Result<Vec<RepoBucket>> {
    let mut buckets = Vec::new();
    for (repo, paths) in files {
        let resolution = if repo.is_empty() {
            Resolution::Unresolved
        } else {
            let candidates: BTreeSet<String> = paths.iter().cloned().collect();
            resolve(Path::new(repo), &candidates)?
        };
        buckets.push(RepoBucket {
            repo: repo.clone(),
            files: paths.clone(),
            resolution,
        });
    }
    Ok(buckets)
}

/// Build both archives and `sources.user` from resolved buckets.
///
/// Every explicit file ends up in exactly one of the two archives: the
/// embed archive if its absolute path starts with an allowed directory,
/// the placeholder archive (with synthetic content) otherwise. An allowed
/// file that can no longer be read (deleted from the working tree after
/// the diff saw it) also falls back to the placeholder archive, so the
/// explicit list stays fully accounted for.
pub fn build_manifest(
    trace: &TraceDir,
    doc: &SourcesDoc,
    buckets: &[RepoBucket],
    allowed_dirs: &[PathBuf],
) -> Result<ManifestSummary> {
    let mut summary = ManifestSummary::default();
    let mut explicit: Vec<String> = Vec::new();
    let mut url_mounts: Vec<Mount> = Vec::new();

    for bucket in buckets {
        if bucket.repo.is_empty() {
            summary.non_repo_files += bucket.files.len();
            explicit.extend(bucket.files.iter().cloned());
            continue;
        }
        match &bucket.resolution {
            Resolution::Unresolved => {
                explicit.extend(bucket.files.iter().map(|f| qualify(&bucket.repo, f)));
            }
            Resolution::Resolved {
                url,
                url_suffix,
                changed,
                ..
            } => {
                explicit.extend(changed.iter().map(|f| qualify(&bucket.repo, f)));
                // Even with zero changed files the repo still needs its
                // mount so unchanged files resolve somewhere.
                url_mounts.push(Mount::Url {
                    url: url.clone(),
                    at: bucket.repo.clone(),
                    url_suffix: url_suffix.clone(),
                });
            }
        }
    }
    summary.explicit_files = explicit.len();
    summary.url_mounts = url_mounts.len();

    let (embed, placeholder) = partition_by_allow_list(&explicit, allowed_dirs);

    let archive_dir = trace.root().join(ARCHIVE_DIR);
    std::fs::create_dir_all(&archive_dir)
        .with_context(|| format!("create {}", archive_dir.display()))?;
    let (embedded, unreadable) = write_embed_archive(&trace.root().join(EMBED_ARCHIVE), &embed)?;
    let mut placeholder_entries: Vec<(String, String)> = placeholder
        .iter()
        .map(|path| (path.clone(), placeholder_text(path, allowed_dirs)))
        .collect();
    for (path, err) in unreadable {
        let body = unreadable_text(&path, &err);
        placeholder_entries.push((path, body));
    }
    write_placeholder_archive(&trace.root().join(PLACEHOLDER_ARCHIVE), &placeholder_entries)?;
    summary.embedded = embedded;
    summary.placeholders = placeholder_entries.len();
    tracing::info!(
        explicit = summary.explicit_files,
        non_repo = summary.non_repo_files,
        embedded = summary.embedded,
        placeholders = summary.placeholders,
        "partitioned explicit files"
    );

    let mut relevant_mounts = url_mounts;
    relevant_mounts.push(Mount::Archive {
        archive: EMBED_ARCHIVE.to_string(),
        at: "/".to_string(),
    });
    for SymlinkDesc { from, to } in &doc.symlinks {
        relevant_mounts.push(Mount::Symlink {
            link: to.clone(),
            at: from.clone(),
        });
    }

    let condition = Condition {
        or: doc
            .relevant_binaries
            .iter()
            .map(|binary| BinaryCondition {
                binary: binary.clone(),
            })
            .collect(),
    };
    let records = vec![
        ManifestRecord {
            condition: condition.clone(),
            files: relevant_mounts,
            relevance: Relevance::Relevant,
            priority: None,
        },
        ManifestRecord {
            condition,
            files: vec![Mount::Archive {
                archive: PLACEHOLDER_ARCHIVE.to_string(),
                at: "/".to_string(),
            }],
            relevance: Relevance::NotRelevant,
            priority: Some(PLACEHOLDER_PRIORITY),
        },
    ];
    write_json(&trace.root().join(MANIFEST_NAME), &records)?;
    Ok(summary)
}

fn qualify(repo: &str, file: &str) -> String {
    let repo = repo.trim_end_matches('/');
    format!("{repo}/{file}")
}

fn is_allowed(path: &str, allowed_dirs: &[PathBuf]) -> bool {
    allowed_dirs
        .iter()
        .any(|dir| Path::new(path).starts_with(dir))
}

/// Split the explicit file list into (embed, placeholder) halves. The warn
/// cap keeps a big out-of-tree build from flooding the log; vendored
/// registry paths are expected and bypass both the warning and the cap.
fn partition_by_allow_list(
    explicit: &[String],
    allowed_dirs: &[PathBuf],
) -> (Vec<String>, Vec<String>) {
    let mut embed = Vec::new();
    let mut placeholder = Vec::new();
    let mut warned: usize = 0;
    for path in explicit {
        if is_allowed(path, allowed_dirs) {
            embed.push(path.clone());
            continue;
        }
        if !path.contains(VENDORED_BYPASS) {
            if warned < DISALLOWED_WARN_CAP {
                tracing::warn!(path = path.as_str(), "file outside allowed directories");
            } else if warned == DISALLOWED_WARN_CAP {
                tracing::warn!("more files outside allowed directories, not listing the rest");
            }
            warned += 1;
        }
        placeholder.push(path.clone());
    }
    (embed, placeholder)
}

fn zip_options() -> SimpleFileOptions {
    // Fixed timestamp keeps archive bytes a function of content alone.
    let fixed_time = DateTime::from_date_and_time(1980, 1, 1, 0, 0, 0).unwrap_or_default();
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(fixed_time)
}

/// Write the embed archive. Returns the number of entries written plus the
/// files that could not be read; those must be placeholdered by the caller
/// so every explicit file stays in exactly one archive.
fn write_embed_archive(dest: &Path, files: &[String]) -> Result<(usize, Vec<(String, String)>)> {
    let file =
        File::create(dest).with_context(|| format!("create archive {}", dest.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = zip_options();
    let mut written = 0;
    let mut unreadable = Vec::new();
    for path in files {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                // A diffed file can be gone by now (deleted in the working
                // tree); there is nothing to embed for it.
                tracing::warn!(path = path.as_str(), %err, "source file unreadable, placeholding");
                unreadable.push((path.clone(), err.to_string()));
                continue;
            }
        };
        zip.start_file(path.clone(), options)
            .with_context(|| format!("add {path} to archive"))?;
        zip.write_all(&bytes)
            .with_context(|| format!("write {path} to archive"))?;
        written += 1;
    }
    zip.finish()
        .with_context(|| format!("finish archive {}", dest.display()))?;
    Ok((written, unreadable))
}

fn write_placeholder_archive(dest: &Path, entries: &[(String, String)]) -> Result<()> {
    let file =
        File::create(dest).with_context(|| format!("create archive {}", dest.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = zip_options();
    for (path, body) in entries {
        zip.start_file(path.clone(), options)
            .with_context(|| format!("add {path} to archive"))?;
        zip.write_all(body.as_bytes())
            .with_context(|| format!("write {path} placeholder"))?;
    }
    zip.finish()
        .with_context(|| format!("finish archive {}", dest.display()))?;
    Ok(())
}

/// The stand-in body names the rejected path and the allow-list so a viewer
/// sees why real content is absent instead of silence.
fn placeholder_text(path: &str, allowed_dirs: &[PathBuf]) -> String {
    let mut text = format!(
        "{path}\n\nThis file was not uploaded because it is outside the allowed source directories:\n"
    );
    for dir in allowed_dirs {
        text.push_str(&format!("  {}\n", dir.display()));
    }
    text
}

fn unreadable_text(path: &str, err: &str) -> String {
    format!("{path}\n\nThis file could not be read when the trace was packaged: {err}\n")
}
