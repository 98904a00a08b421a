//! Git collaborator: shells out to the system `git` binary for the eight
//! `git_*` tools (§4.7 supplement). Not a libgit2 binding — the teacher's
//! own pattern for external-tool collaborators is a thin `std::process`
//! wrapper, which this follows.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

fn run_git(repo_root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(args)
        .output()
        .map_err(|e| Error::Internal(format!("failed to spawn git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::Internal(format!("git {} failed: {stderr}", args.join(" "))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

pub fn status(repo_root: &Path) -> Result<String> {
    run_git(repo_root, &["status", "--porcelain=v1"])
}

pub fn diff(repo_root: &Path, path: Option<&str>, staged: bool) -> Result<String> {
    let mut args = vec!["diff"];
    if staged {
        args.push("--staged");
    }
    if let Some(p) = path {
        args.push("--");
        args.push(p);
    }
    run_git(repo_root, &args)
}

pub fn log(repo_root: &Path, path: Option<&str>, limit: u32) -> Result<String> {
    let n = format!("-{}", limit.max(1));
    let mut args = vec!["log", n.as_str(), "--oneline"];
    if let Some(p) = path {
        args.push("--");
        args.push(p);
    }
    run_git(repo_root, &args)
}

pub fn blame(repo_root: &Path, path: &str, start_line: Option<u32>, end_line: Option<u32>) -> Result<String> {
    let mut args = vec!["blame"];
    let range;
    if let (Some(s), Some(e)) = (start_line, end_line) {
        range = format!("-L{s},{e}");
        args.push(&range);
    }
    args.push("--");
    args.push(path);
    run_git(repo_root, &args)
}

pub fn show(repo_root: &Path, revision: &str) -> Result<String> {
    run_git(repo_root, &["show", revision])
}

pub fn file_history(repo_root: &Path, path: &str) -> Result<String> {
    run_git(repo_root, &["log", "--follow", "--oneline", "--", path])
}

/// Files most frequently committed alongside `path` over recent history,
/// sorted by descending co-change frequency (§4.7 `git_co_changed`).
pub fn co_changed(repo_root: &Path, path: &str) -> Result<Vec<(String, u32)>> {
    let commits = run_git(repo_root, &["log", "--format=%H", "-n", "200", "--", path])?;
    let mut counts: HashMap<String, u32> = HashMap::new();

    for commit in commits.lines().filter(|l| !l.is_empty()) {
        let files = run_git(repo_root, &["show", "--name-only", "--format=", commit])?;
        for f in files.lines() {
            if f != path && !f.is_empty() {
                *counts.entry(f.to_string()).or_insert(0) += 1;
            }
        }
    }

    let mut ranked: Vec<(String, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as Cmd;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            Cmd::new("git").arg("-C").arg(dir.path()).args(args).output().unwrap();
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    #[test]
    fn status_on_clean_repo_is_empty() {
        let dir = init_repo();
        let out = status(dir.path()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn log_reports_the_initial_commit() {
        let dir = init_repo();
        let out = log(dir.path(), None, 20).unwrap();
        assert!(out.contains("initial"));
    }

    #[test]
    fn diff_on_untouched_file_is_empty() {
        let dir = init_repo();
        let out = diff(dir.path(), None, false).unwrap();
        assert!(out.is_empty());
    }
}
