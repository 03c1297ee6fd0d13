//! Repository resolver: decide, per repository, what a remote can serve
//! and what must be embedded.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;

use crate::vcs::detect_backend;

/// Outcome of resolving one repository against its configured remotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No usable remote or ancestor revision: every candidate file must be
    /// embedded.
    Unresolved,
    /// `changed` is the union of committed drift since `revision` and
    /// working-area drift; everything else in the candidate set is
    /// reconstructible from `url` + path + revision.
    Resolved {
        revision: String,
        remote: String,
        url: String,
        url_suffix: Option<String>,
        changed: BTreeSet<String>,
    },
}

/// Resolve `repo` for the given candidate files (paths relative to the
/// repository root).
///
/// The changed set is the union of the committed diff and the working diff:
/// a file can be unchanged since the ancestor revision yet edited locally,
/// or changed upstream yet untouched locally, and either way the remote can
/// only serve the ancestor's bytes, so the on-disk copy must be embedded.
pub fn resolve(repo: &Path, candidates: &BTreeSet<String>) -> Result<Resolution> {
    let Some(backend) = detect_backend(repo) else {
        return Ok(Resolution::Unresolved);
    };

    let remotes = backend.list_remotes(repo)?;
    if remotes.is_empty() {
        tracing::info!(
            repo = %repo.display(),
            vcs = backend.name(),
            "no remotes, packaging instead"
        );
        return Ok(Resolution::Unresolved);
    }

    let Some((revision, remote)) = backend.find_best_remote_revision(repo, &remotes)? else {
        tracing::info!(
            repo = %repo.display(),
            vcs = backend.name(),
            "no usable remote ancestor, packaging instead"
        );
        return Ok(Resolution::Unresolved);
    };

    let mut changed = backend.committed_diff(repo, &revision)?;
    changed.extend(backend.working_diff(repo, &revision)?);
    changed.retain(|path| candidates.contains(path));

    let generator = &remotes[&remote];
    let (url, url_suffix) = generator.fetch_urls(&revision);
    tracing::info!(
        repo = %repo.display(),
        remote = remote.as_str(),
        revision = revision.as_str(),
        changed = changed.len(),
        candidates = candidates.len(),
        "resolved repository against remote"
    );
    Ok(Resolution::Resolved {
        revision,
        remote,
        url,
        url_suffix,
        changed,
    })
}
