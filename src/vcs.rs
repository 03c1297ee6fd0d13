//! Version-control backend adapters.
//!
//! Each backend answers four questions for the resolver: which remotes are
//! configured (and which of them live on a hosting provider we can derive
//! raw-file URLs for), which locally-known revision is reachable from one of
//! those remotes, and which files drifted from that revision in committed
//! history and in the working tree.
//!
//! Status output from the tools is parsed strictly: the formats are stable,
//! so an unrecognized line means an unsupported tool version and aborts the
//! run rather than risking a wrong embed/exclude decision.

use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use thiserror::Error;

use crate::util::{run_tool, run_tool_optional};

/// A VCS tool produced output this version of the adapter does not
/// understand. Always fatal.
#[derive(Debug, Error)]
#[error("unrecognized `{tool}` output line: {line:?}")]
pub struct VcsProtocolError {
    pub tool: &'static str,
    pub line: String,
}

/// Remotes that never serve stable content and are dropped outright.
const EXCLUDED_REMOTES: &[&str] = &["try"];

/// Derives raw-content fetch URLs for one hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUrlGenerator {
    GitHub { org: String, repo: String },
    GitLab { org: String, repo: String },
    Gitiles { host: String, path: String },
    HgWeb { path: String },
}

impl RemoteUrlGenerator {
    /// Base fetch URL for `revision`, plus an optional suffix the consumer
    /// must append to every file URL (gitiles serves base64 text behind a
    /// query parameter).
    pub fn fetch_urls(&self, revision: &str) -> (String, Option<String>) {
        match self {
            RemoteUrlGenerator::GitHub { org, repo } => (
                format!("https://raw.githubusercontent.com/{org}/{repo}/{revision}/"),
                None,
            ),
            RemoteUrlGenerator::GitLab { org, repo } => (
                format!("https://gitlab.com/{org}/{repo}/-/raw/{revision}/"),
                None,
            ),
            RemoteUrlGenerator::Gitiles { host, path } => (
                format!("https://{host}.googlesource.com/{path}/+/{revision}/"),
                Some("?format=TEXT".to_string()),
            ),
            RemoteUrlGenerator::HgWeb { path } => (
                format!("https://hg.mozilla.org/{path}/raw-file/{revision}/"),
                None,
            ),
        }
    }
}

struct ForgePattern {
    regex: Regex,
    build: fn(&regex::Captures) -> RemoteUrlGenerator,
}

/// Ordered hosting-provider table. New providers are additive entries here;
/// nothing else needs to change.
fn forge_patterns() -> &'static [ForgePattern] {
    static PATTERNS: OnceLock<Vec<ForgePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ForgePattern {
                regex: Regex::new(
                    r"^(?:https://github\.com/|git@github\.com:)([^/]+)/(.+?)(?:\.git)?/?$",
                )
                .unwrap(),
                build: |caps| RemoteUrlGenerator::GitHub {
                    org: caps[1].to_string(),
                    repo: caps[2].to_string(),
                },
            },
            ForgePattern {
                regex: Regex::new(
                    r"^(?:https://gitlab\.com/|git@gitlab\.com:)([^/]+)/(.+?)(?:\.git)?/?$",
                )
                .unwrap(),
                build: |caps| RemoteUrlGenerator::GitLab {
                    org: caps[1].to_string(),
                    repo: caps[2].to_string(),
                },
            },
            ForgePattern {
                regex: Regex::new(r"^https://([^/.]+)\.googlesource\.com/(.+?)/?$").unwrap(),
                build: |caps| RemoteUrlGenerator::Gitiles {
                    host: caps[1].to_string(),
                    path: caps[2].to_string(),
                },
            },
            ForgePattern {
                regex: Regex::new(r"^https://hg\.mozilla\.org/(.+?)/?$").unwrap(),
                build: |caps| RemoteUrlGenerator::HgWeb {
                    path: caps[1].to_string(),
                },
            },
        ]
    })
}

/// Match a raw remote URL against the provider table. Unmatched URLs yield
/// `None` and the remote is ignored.
pub fn classify_remote_url(url: &str) -> Option<RemoteUrlGenerator> {
    for pattern in forge_patterns() {
        if let Some(caps) = pattern.regex.captures(url) {
            return Some((pattern.build)(&caps));
        }
    }
    None
}

/// One repository backend. Diff results are paths relative to the
/// repository root; the resolver intersects them with its candidate set.
pub trait VcsBackend {
    fn name(&self) -> &'static str;

    /// Configured remotes that matched a known hosting provider.
    fn list_remotes(&self, repo: &Path) -> Result<BTreeMap<String, RemoteUrlGenerator>>;

    /// The best `(revision, remote name)` pair usable as a fetch baseline,
    /// or `None` if no locally-known revision is reachable from any remote.
    fn find_best_remote_revision(
        &self,
        repo: &Path,
        remotes: &BTreeMap<String, RemoteUrlGenerator>,
    ) -> Result<Option<(String, String)>>;

    /// Files changed in committed history between `revision` and the
    /// current checked-out state.
    fn committed_diff(&self, repo: &Path, revision: &str) -> Result<BTreeSet<String>>;

    /// Files changed in the working area, including untracked and ignored
    /// files, relative to the backend's natural baseline (git: the checked
    /// out head; hg: `revision` directly).
    fn working_diff(&self, repo: &Path, revision: &str) -> Result<BTreeSet<String>>;
}

/// Pick a backend for `path` by its directory markers, if any.
pub fn detect_backend(path: &Path) -> Option<Box<dyn VcsBackend>> {
    // A `.git` entry may be a file in worktrees and submodules.
    if path.join(".git").exists() {
        return Some(Box::new(GitBackend));
    }
    if path.join(".hg").is_dir() {
        return Some(Box::new(HgBackend));
    }
    None
}

pub struct GitBackend;

impl VcsBackend for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    fn list_remotes(&self, repo: &Path) -> Result<BTreeMap<String, RemoteUrlGenerator>> {
        let out = run_tool(
            "git remote",
            Command::new("git").current_dir(repo).args(["remote", "-v"]),
        )?;
        parse_git_remotes(&String::from_utf8_lossy(&out))
    }

    fn find_best_remote_revision(
        &self,
        repo: &Path,
        remotes: &BTreeMap<String, RemoteUrlGenerator>,
    ) -> Result<Option<(String, String)>> {
        let out = run_tool(
            "git log",
            Command::new("git")
                .current_dir(repo)
                .args(["log", "--format=%H%x09%D"]),
        )?;
        Ok(pick_decorated_commit(
            &String::from_utf8_lossy(&out),
            remotes,
        ))
    }

    fn committed_diff(&self, repo: &Path, revision: &str) -> Result<BTreeSet<String>> {
        let out = run_tool(
            "git diff",
            Command::new("git")
                .current_dir(repo)
                .args(["diff", "--name-only", revision, "HEAD"]),
        )?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .filter(|line| !line.is_empty())
            .map(unquote_git_path)
            .collect())
    }

    fn working_diff(&self, repo: &Path, _revision: &str) -> Result<BTreeSet<String>> {
        let out = run_tool(
            "git status",
            Command::new("git")
                .current_dir(repo)
                .args(["status", "--porcelain", "--ignored", "-uall"]),
        )?;
        let set = parse_porcelain_status(&String::from_utf8_lossy(&out))?;
        Ok(set)
    }
}

fn parse_git_remotes(text: &str) -> Result<BTreeMap<String, RemoteUrlGenerator>> {
    let mut remotes = BTreeMap::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(url), Some(kind)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(VcsProtocolError {
                tool: "git remote -v",
                line: line.to_string(),
            }
            .into());
        };
        if kind != "(fetch)" {
            continue;
        }
        if EXCLUDED_REMOTES.contains(&name) {
            continue;
        }
        match classify_remote_url(url) {
            Some(generator) => {
                remotes.insert(name.to_string(), generator);
            }
            None => {
                tracing::debug!(remote = name, url, "remote does not match any known forge");
            }
        }
    }
    Ok(remotes)
}

/// Walk `git log --format=%H%x09%D` output newest-first and return the
/// first commit decorated with a `remote/branch` ref whose remote we know.
fn pick_decorated_commit(
    log: &str,
    remotes: &BTreeMap<String, RemoteUrlGenerator>,
) -> Option<(String, String)> {
    for line in log.lines() {
        let Some((hash, decorations)) = line.split_once('\t') else {
            continue;
        };
        for token in decorations.split(", ") {
            let token = token.strip_prefix("HEAD -> ").unwrap_or(token);
            if token.starts_with("tag: ") {
                continue;
            }
            if let Some((remote, _branch)) = token.split_once('/') {
                if remotes.contains_key(remote) {
                    return Some((hash.to_string(), remote.to_string()));
                }
            }
        }
    }
    None
}

/// Parse `git status --porcelain` into the set of changed working-tree
/// paths. Renames contribute the new path.
fn parse_porcelain_status(text: &str) -> Result<BTreeSet<String>, VcsProtocolError> {
    const STATUS_CHARS: &str = " MTADRCU?!";
    let mut files = BTreeSet::new();
    for line in text.lines().filter(|line| !line.is_empty()) {
        let malformed = || VcsProtocolError {
            tool: "git status --porcelain",
            line: line.to_string(),
        };
        let mut chars = line.chars();
        let (Some(x), Some(y), Some(sep)) = (chars.next(), chars.next(), chars.next()) else {
            return Err(malformed());
        };
        if sep != ' ' || !STATUS_CHARS.contains(x) || !STATUS_CHARS.contains(y) {
            return Err(malformed());
        }
        let rest: &str = chars.as_str();
        if rest.is_empty() {
            return Err(malformed());
        }
        let path = match rest.split_once(" -> ") {
            Some((_old, new)) => new,
            None => rest,
        };
        files.insert(unquote_git_path(path));
    }
    Ok(files)
}

/// Git quotes paths containing unusual bytes. Full C-style unescaping is
/// not attempted; quoted paths keep their inner escapes.
fn unquote_git_path(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}

pub struct HgBackend;

impl VcsBackend for HgBackend {
    fn name(&self) -> &'static str {
        "hg"
    }

    fn list_remotes(&self, repo: &Path) -> Result<BTreeMap<String, RemoteUrlGenerator>> {
        let out = run_tool("hg paths", Command::new("hg").current_dir(repo).arg("paths"))?;
        parse_hg_paths(&String::from_utf8_lossy(&out))
    }

    /// Best-remote selection is a heuristic: per remote, take the highest
    /// local revision number still reachable from it and prefer the remote
    /// maximizing that number. Revision numbers are repo-local, so this is
    /// not a true most-recent-common-ancestor comparison.
    fn find_best_remote_revision(
        &self,
        repo: &Path,
        remotes: &BTreeMap<String, RemoteUrlGenerator>,
    ) -> Result<Option<(String, String)>> {
        let mut best: Option<(u64, String, String)> = None;
        for name in remotes.keys() {
            let revset = format!("last(ancestors(.) - outgoing(\"{name}\"))");
            let Some(out) = run_tool_optional(
                "hg log",
                Command::new("hg")
                    .current_dir(repo)
                    .args(["log", "-r", &revset, "--template", "{rev} {node}"]),
            )?
            else {
                continue;
            };
            let text = String::from_utf8_lossy(&out);
            let Some((rev, node)) = parse_hg_ancestor(text.trim()) else {
                continue;
            };
            if rev == 0 {
                continue;
            }
            if best.as_ref().map(|(r, _, _)| rev > *r).unwrap_or(true) {
                best = Some((rev, node, name.clone()));
            }
        }
        Ok(best.map(|(_, node, name)| (node, name)))
    }

    fn committed_diff(&self, repo: &Path, revision: &str) -> Result<BTreeSet<String>> {
        let out = run_tool(
            "hg status",
            Command::new("hg")
                .current_dir(repo)
                .args(["status", "--rev", revision, "--rev", "."]),
        )?;
        let set = parse_hg_status(&String::from_utf8_lossy(&out))?;
        Ok(set)
    }

    fn working_diff(&self, repo: &Path, revision: &str) -> Result<BTreeSet<String>> {
        let out = run_tool(
            "hg status",
            Command::new("hg").current_dir(repo).args([
                "status",
                "--modified",
                "--added",
                "--removed",
                "--unknown",
                "--ignored",
                "--rev",
                revision,
            ]),
        )?;
        let set = parse_hg_status(&String::from_utf8_lossy(&out))?;
        Ok(set)
    }
}

fn parse_hg_paths(text: &str) -> Result<BTreeMap<String, RemoteUrlGenerator>> {
    let mut remotes = BTreeMap::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let Some((name, url)) = line.split_once(" = ") else {
            return Err(VcsProtocolError {
                tool: "hg paths",
                line: line.to_string(),
            }
            .into());
        };
        let name = name.trim();
        if EXCLUDED_REMOTES.contains(&name) {
            continue;
        }
        match classify_remote_url(url.trim()) {
            Some(generator) => {
                remotes.insert(name.to_string(), generator);
            }
            None => {
                tracing::debug!(remote = name, url, "remote does not match any known forge");
            }
        }
    }
    Ok(remotes)
}

fn parse_hg_ancestor(text: &str) -> Option<(u64, String)> {
    let (rev, node) = text.split_once(' ')?;
    let rev = rev.parse::<u64>().ok()?;
    if node.is_empty() {
        return None;
    }
    Some((rev, node.to_string()))
}

fn parse_hg_status(text: &str) -> Result<BTreeSet<String>, VcsProtocolError> {
    const STATUS_CHARS: &str = "MARC?I!";
    let mut files = BTreeSet::new();
    for line in text.lines().filter(|line| !line.is_empty()) {
        let malformed = || VcsProtocolError {
            tool: "hg status",
            line: line.to_string(),
        };
        let mut chars = line.chars();
        let (Some(code), Some(sep)) = (chars.next(), chars.next()) else {
            return Err(malformed());
        };
        if sep != ' ' || !STATUS_CHARS.contains(code) {
            return Err(malformed());
        }
        let path = chars.as_str();
        if path.is_empty() {
            return Err(malformed());
        }
        files.insert(path.to_string());
    }
    Ok(files)
}
