//! Disposable workspaces for agent runs
//!
//! Each task gets its own git worktree on a fresh branch, so the agent's
//! edits never touch the checkout the user is working in.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Longest slug used in branch and directory names
const MAX_SLUG_LEN: usize = 50;

/// An isolated checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    pub parent_repo: PathBuf,
}

/// Creates and removes workspaces
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    async fn create(&self, task: &str) -> Result<Workspace>;
    async fn cleanup(&self, workspace: &Workspace) -> Result<()>;
}

/// Worktrees next to the parent repository
#[derive(Debug, Clone)]
pub struct GitWorktreeManager {
    parent_repo: PathBuf,
    base_branch: String,
}

impl GitWorktreeManager {
    pub fn new(parent_repo: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self {
            parent_repo: parent_repo.into(),
            base_branch: base_branch.into(),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.parent_repo)
            .output()
            .await
            .map_err(|e| Error::Workspace(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Workspace(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn branches(&self) -> Result<Vec<String>> {
        let out = self
            .git(&["branch", "--list", "--format=%(refname:short)"])
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }
}

#[async_trait]
impl WorkspaceManager for GitWorktreeManager {
    async fn create(&self, task: &str) -> Result<Workspace> {
        let slug = sanitize_task_name(task);
        let base = format!("cadence/{}", slug);
        let branch = unique_branch_name(&base, &self.branches().await?);
        let suffix = branch.strip_prefix(&base).unwrap_or_default();

        let repo_name = self
            .parent_repo
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        let dir_name = format!("{}-cadence-{}{}", repo_name, slug, suffix);
        let path = self
            .parent_repo
            .parent()
            .unwrap_or(&self.parent_repo)
            .join(dir_name);

        let path_str = path.display().to_string();
        self.git(&["worktree", "add", "-B", &branch, &path_str, &self.base_branch])
            .await?;

        info!("Created worktree {} on branch {}", path.display(), branch);
        Ok(Workspace {
            path,
            branch,
            parent_repo: self.parent_repo.clone(),
        })
    }

    async fn cleanup(&self, workspace: &Workspace) -> Result<()> {
        let path = workspace.path.display().to_string();

        match self.git(&["worktree", "remove", &path, "--force"]).await {
            Ok(_) => {
                debug!("Removed worktree {}", path);
                Ok(())
            }
            Err(e) if !workspace.path.exists() => {
                warn!("Worktree {} already gone ({}), pruning", path, e);
                self.git(&["worktree", "prune"]).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

/// Lowercase, hyphen-separated, at most 50 chars; "task" when nothing is left
pub fn sanitize_task_name(task: &str) -> String {
    static NON_SLUG: OnceLock<Regex> = OnceLock::new();
    let re = NON_SLUG.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap());

    let lower = task.to_lowercase();
    let slug = re.replace_all(&lower, "-");
    let mut slug = slug.trim_matches('-').to_string();

    if slug.len() > MAX_SLUG_LEN {
        // only ASCII is left, so any index is a char boundary
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }

    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// `base`, or `base-2`, `base-3`, ... whichever is free
pub fn unique_branch_name(base: &str, existing: &[String]) -> String {
    if !existing.iter().any(|b| b == base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !existing.iter().any(|b| b == candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Resolve a possibly-relative path inside a workspace
pub fn within(workspace: Option<&Workspace>, path: &Path) -> PathBuf {
    match workspace {
        Some(ws) if path.is_relative() => ws.path.join(path),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_task_name() {
        assert_eq!(sanitize_task_name("Fix the Login bug!"), "fix-the-login-bug");
        assert_eq!(sanitize_task_name("  --weird__name--  "), "weird-name");
        assert_eq!(sanitize_task_name("???"), "task");
        assert_eq!(sanitize_task_name("héllo wörld"), "h-llo-w-rld");

        let long = sanitize_task_name(&format!("{} more words", "a".repeat(49)));
        assert_eq!(long, "a".repeat(49));
    }

    #[test]
    fn test_unique_branch_name() {
        let existing = vec!["main".to_string(), "cadence/x".to_string(), "cadence/x-2".to_string()];
        assert_eq!(unique_branch_name("cadence/y", &existing), "cadence/y");
        assert_eq!(unique_branch_name("cadence/x", &existing), "cadence/x-3");
    }

    #[test]
    fn test_within() {
        let ws = Workspace {
            path: PathBuf::from("/work/tree"),
            branch: "cadence/t".to_string(),
            parent_repo: PathBuf::from("/work/repo"),
        };
        assert_eq!(
            within(Some(&ws), Path::new("agent_state/agent_state.json")),
            PathBuf::from("/work/tree/agent_state/agent_state.json")
        );
        assert_eq!(within(Some(&ws), Path::new("/abs/s.json")), PathBuf::from("/abs/s.json"));
        assert_eq!(within(None, Path::new("s.json")), PathBuf::from("s.json"));
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_create_and_cleanup_worktree() {
        if !git_available() {
            return;
        }

        let root = TempDir::new().unwrap();
        let repo = root.path().join("project");
        std::fs::create_dir(&repo).unwrap();
        run_git(&repo, &["init", "-q"]);
        run_git(&repo, &["checkout", "-q", "-b", "main"]);
        std::fs::write(repo.join("README.md"), "hello\n").unwrap();
        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-q", "-m", "init"]);

        let manager = GitWorktreeManager::new(&repo, "main");
        let ws = manager.create("Add a feature").await.unwrap();

        assert_eq!(ws.branch, "cadence/add-a-feature");
        assert_eq!(ws.path, root.path().join("project-cadence-add-a-feature"));
        assert!(ws.path.join("README.md").exists());

        let second = manager.create("Add a feature").await.unwrap();
        assert_eq!(second.branch, "cadence/add-a-feature-2");

        manager.cleanup(&ws).await.unwrap();
        manager.cleanup(&second).await.unwrap();
        assert!(!ws.path.exists());
        assert!(!second.path.exists());
    }
}
