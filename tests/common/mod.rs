//! Shared test infrastructure: scratch traces and scratch git repositories.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Skip-style check used by tests that need an external tool.
pub fn have_tool(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Run git in `repo`, panicking on failure. Identity is forced per-command
/// so tests never depend on the host's git config.
pub fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(repo)
        .args([
            "-c",
            "user.email=test@example.com",
            "-c",
            "user.name=Test",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

pub fn git_head(repo: &Path) -> String {
    let out = Command::new("git")
        .current_dir(repo)
        .args(["rev-parse", "HEAD"])
        .output()
        .expect("run git rev-parse");
    assert!(out.status.success());
    String::from_utf8(out.stdout).unwrap().trim().to_string()
}

/// A git repository with one commit of `a.c` and `b.c`, a remote named
/// `origin` pointing at a known GitHub URL, and a remote-tracking ref
/// `origin/main` at the current head (standing in for a fetched remote).
pub fn scratch_github_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().to_path_buf();
    git(&repo, &["init", "--quiet"]);
    std::fs::write(repo.join("a.c"), "int a;\n").unwrap();
    std::fs::write(repo.join("b.c"), "int b;\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "--quiet", "-m", "initial"]);
    git(&repo, &["remote", "add", "origin", "https://github.com/org/proj.git"]);
    git(&repo, &["update-ref", "refs/remotes/origin/main", "HEAD"]);
    (dir, repo)
}

/// A minimal trace directory: version marker plus the given sources doc.
pub fn scratch_trace(sources_json: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("version"), "1\n").unwrap();
    std::fs::write(dir.path().join("sources.extra"), sources_json).unwrap();
    dir
}
