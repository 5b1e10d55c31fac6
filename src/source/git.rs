//! Git sources.
//!
//! Revisions are resolved to a commit with `git ls-remote` on every run so
//! moving refs are picked up; the tree for a known commit is fetched once.

use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;

/// Whether `rev` is already a full commit id.
pub fn is_commit_id(rev: &str) -> bool {
    rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolve a branch, tag or commit to a commit id.
pub fn resolve_rev(repo_url: &str, rev: &str) -> Result<String> {
    if is_commit_id(rev) {
        return Ok(rev.to_ascii_lowercase());
    }

    let out = Cmd::new("git")
        .args(["ls-remote", repo_url, rev, &format!("{rev}^{{}}")])
        .error_msg(format!("git ls-remote {repo_url} failed"))
        .run()?;

    let commit = pick_ref(&out.stdout, rev)
        .ok_or_else(|| Error::not_found(format!("git revision '{rev}'"), repo_url))?;
    debug!("resolved {}@{} to {}", repo_url, rev, commit);
    Ok(commit)
}

/// Choose the commit for `rev` from `git ls-remote` output.
///
/// Peeled tags (`^{}`) win over the tag object; exact ref names win over
/// suffix matches.
fn pick_ref(ls_remote: &str, rev: &str) -> Option<String> {
    let candidates = [
        format!("refs/tags/{rev}^{{}}"),
        format!("refs/heads/{rev}"),
        format!("refs/tags/{rev}"),
        rev.to_string(),
    ];
    let refs: Vec<(&str, &str)> = ls_remote
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(sha, name)| (sha.trim(), name.trim()))
        .collect();

    candidates
        .iter()
        .find_map(|wanted| refs.iter().find(|(_, name)| *name == wanted.as_str()))
        .or_else(|| refs.first())
        .map(|(sha, _)| sha.to_string())
}

/// Check out `commit` of `repo_url` into `dest` without VCS metadata.
pub fn checkout(repo_url: &str, commit: &str, dest: &Path) -> Result<()> {
    Cmd::new("git")
        .args(["init", "-q"])
        .arg_path(dest)
        .error_msg("git init failed")
        .run()?;

    let shallow = Cmd::new("git")
        .arg("-C")
        .arg_path(dest)
        .args(["fetch", "-q", "--depth", "1", repo_url, commit])
        .allow_fail()
        .run()?;
    if !shallow.success() {
        // Servers that refuse fetching by id still serve it via a full fetch.
        debug!("shallow fetch of {} refused, fetching all refs", commit);
        Cmd::new("git")
            .arg("-C")
            .arg_path(dest)
            .args([
                "fetch",
                "-q",
                repo_url,
                "+refs/heads/*:refs/remotes/origin/*",
                "+refs/tags/*:refs/tags/*",
            ])
            .error_msg(format!("git fetch {repo_url} failed"))
            .run()?;
    }

    Cmd::new("git")
        .arg("-C")
        .arg_path(dest)
        .args(["-c", "advice.detachedHead=false", "checkout", "-q", commit])
        .error_msg(format!("git checkout {commit} failed"))
        .run()?;

    let git_dir = dest.join(".git");
    fs::remove_dir_all(&git_dir).io_context(|| format!("removing {}", git_dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process;
    use tempfile::TempDir;

    const LS_REMOTE: &str = "\
1111111111111111111111111111111111111111\tHEAD
2222222222222222222222222222222222222222\trefs/heads/main
3333333333333333333333333333333333333333\trefs/tags/v1
4444444444444444444444444444444444444444\trefs/tags/v1^{}
";

    #[test]
    fn full_commit_ids_skip_lookup() {
        let id = "ABCDEF0123456789ABCDEF0123456789ABCDEF01";
        assert!(is_commit_id(id));
        assert_eq!(
            resolve_rev("/nonexistent", id).unwrap(),
            id.to_ascii_lowercase()
        );
    }

    #[test]
    fn peeled_tags_and_branches_are_preferred() {
        assert_eq!(pick_ref(LS_REMOTE, "v1").unwrap(), "4".repeat(40));
        assert_eq!(pick_ref(LS_REMOTE, "main").unwrap(), "2".repeat(40));
        assert_eq!(pick_ref(LS_REMOTE, "HEAD").unwrap(), "1".repeat(40));
        assert!(pick_ref("", "main").is_none());
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        Cmd::new("git")
            .arg("-C")
            .arg_path(dir)
            .args(args)
            .run()
            .unwrap()
            .stdout
    }

    #[test]
    fn checks_out_a_local_repository() {
        if !process::exists("git") {
            eprintln!("git not installed, skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "-q"]);
        git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&repo, &["config", "user.email", "dev@example.org"]);
        git(&repo, &["config", "user.name", "dev"]);
        git(&repo, &["config", "uploadpack.allowAnySHA1InWant", "true"]);
        fs::write(repo.join("PKGBUILD"), "pkgname=hello\n").unwrap();
        git(&repo, &["add", "PKGBUILD"]);
        git(&repo, &["commit", "-q", "-m", "init"]);

        let url = repo.to_string_lossy().to_string();
        let commit = resolve_rev(&url, "main").unwrap();
        assert!(is_commit_id(&commit));

        let dest = tmp.path().join("checkout");
        checkout(&url, &commit, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("PKGBUILD")).unwrap(),
            "pkgname=hello\n"
        );
        assert!(!dest.join(".git").exists());

        let err = resolve_rev(&url, "no-such-branch").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
