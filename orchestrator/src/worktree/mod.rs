//! Worktree Coordinator (C2): allocates an isolated filesystem view of the
//! repository for a story.
//!
//! Grounded on the harness's `GitManager` (retry-with-backoff subprocess
//! wrapping, checkpoint/rollback) generalized with `git worktree add/remove`
//! plumbing from the swarm-agent worktree bridge. PR creation has no
//! teacher counterpart — see DESIGN.md.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::error::{WorktreeError, WorktreeResult};

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Derive `{prefix}/{slug(title)}-{hex(uuid)}`, truncated to ≤63 bytes.
/// Slug drops non-alphanumeric characters and lowercases.
pub fn derive_branch_name(prefix: &str, title: &str, uuid: &uuid::Uuid) -> String {
    let non_alnum: Regex = Regex::new(r"[^a-z0-9]+").expect("static regex compiles");
    let lowered = title.to_lowercase();
    let slug = non_alnum.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    let hex = uuid.simple().to_string();
    let hex = &hex[..8.min(hex.len())];

    let mut name = format!("{prefix}/{slug}-{hex}");
    if name.len() > 63 {
        name.truncate(63);
        // Avoid truncating mid multi-byte char boundary.
        while !name.is_char_boundary(name.len()) {
            name.pop();
        }
    }
    name
}

/// Allocates/destroys per-story git worktrees and performs branch operations.
pub struct WorktreeCoordinator {
    base_dir: PathBuf,
    commit_prefix: String,
    max_retries: u32,
}

impl WorktreeCoordinator {
    pub fn new(base_dir: impl Into<PathBuf>, commit_prefix: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            commit_prefix: commit_prefix.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn run_git(&self, working_dir: &Path, args: &[&str]) -> WorktreeResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(working_dir)
            .output()
            .map_err(|e| WorktreeError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::git(args.join(" "), stderr.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_git_with_retry(&self, working_dir: &Path, args: &[&str]) -> WorktreeResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run_git(working_dir, args) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| WorktreeError::git("retry", "max retries exceeded")))
    }

    /// `createWorktree(repoPath, branchName, baseBranch?) → (path, error)`.
    pub fn create_worktree(
        &self,
        repo_path: &Path,
        branch_name: &str,
        base_branch: Option<&str>,
    ) -> WorktreeResult<PathBuf> {
        let wt_path = self.worktree_path_for(branch_name);
        if wt_path.exists() {
            return Err(WorktreeError::AlreadyExists(wt_path));
        }
        std::fs::create_dir_all(&self.base_dir)?;

        let mut args = vec!["worktree", "add", "-b", branch_name];
        let wt_path_str = wt_path.display().to_string();
        args.push(&wt_path_str);
        if let Some(base) = base_branch {
            args.push(base);
        }
        self.run_git_with_retry(repo_path, &args)?;

        self.seed_worktree_files(&wt_path);
        Ok(wt_path)
    }

    fn worktree_path_for(&self, branch_name: &str) -> PathBuf {
        let safe = branch_name.replace('/', "__");
        self.base_dir.join(safe)
    }

    /// Best-effort seed of `.vscode/settings.json` and
    /// `.github/<agent>-instructions.md`. Failures are warnings, never errors.
    fn seed_worktree_files(&self, worktree_path: &Path) {
        let vscode_dir = worktree_path.join(".vscode");
        if let Err(e) = std::fs::create_dir_all(&vscode_dir) {
            warn!(error = %e, "failed to create .vscode directory");
            return;
        }
        let settings_path = vscode_dir.join("settings.json");
        if !settings_path.exists() {
            let contents = serde_json::json!({
                "tasks.allowAutomaticTasks": "on"
            });
            if let Err(e) = std::fs::write(&settings_path, contents.to_string()) {
                warn!(error = %e, "failed to seed .vscode/settings.json");
            }
        }

        let github_dir = worktree_path.join(".github");
        if let Err(e) = std::fs::create_dir_all(&github_dir) {
            warn!(error = %e, "failed to create .github directory");
            return;
        }
        let instructions_path = github_dir.join("agent-instructions.md");
        if !instructions_path.exists() {
            let contents = "# Agent tool-usage addendum\n\nThis worktree is managed by the story orchestrator. Tool-call results should stay scoped to this directory.\n";
            if let Err(e) = std::fs::write(&instructions_path, contents) {
                warn!(error = %e, "failed to seed .github/agent-instructions.md");
            }
        }
    }

    /// `removeWorktree(path, force) → error`.
    pub fn remove_worktree(&self, repo_path: &Path, worktree_path: &Path, force: bool) -> WorktreeResult<()> {
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        let path_str = worktree_path.display().to_string();
        args.push(&path_str);
        self.run_git(repo_path, &args)?;
        Ok(())
    }

    /// `deleteBranch(repoPath, branchName, force)`.
    pub fn delete_branch(&self, repo_path: &Path, branch_name: &str, force: bool) -> WorktreeResult<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_git(repo_path, &["branch", flag, branch_name])?;
        Ok(())
    }

    pub fn has_uncommitted_changes(&self, path: &Path) -> WorktreeResult<bool> {
        let status = self.run_git(path, &["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    /// `commit(path, message, skipHooks) → sha` — commits every tracked change.
    pub fn commit(&self, path: &Path, message: &str, skip_hooks: bool) -> WorktreeResult<String> {
        self.run_git_with_retry(path, &["add", "-A"])?;
        if !self.has_uncommitted_changes(path)? {
            return self.run_git(path, &["rev-parse", "HEAD"]);
        }
        let mut args = vec!["commit", "-m", message];
        if skip_hooks {
            args.push("--no-verify");
        }
        self.run_git_with_retry(path, &args)?;
        self.run_git(path, &["rev-parse", "HEAD"])
    }

    /// `squashToBase(path, baseBranch, message) → sha` — soft-resets onto
    /// base and re-commits as one commit.
    pub fn squash_to_base(&self, path: &Path, base_branch: &str, message: &str) -> WorktreeResult<String> {
        let merge_base = self.run_git(path, &["merge-base", base_branch, "HEAD"])?;
        self.run_git_with_retry(path, &["reset", "--soft", &merge_base])?;
        self.commit(path, message, true)
    }

    /// `push(path, setUpstream, token) → error`.
    pub fn push(&self, path: &Path, set_upstream: bool, branch_name: &str, token: Option<&str>) -> WorktreeResult<()> {
        let mut cmd = Command::new("git");
        cmd.current_dir(path);
        cmd.arg("push");
        if set_upstream {
            cmd.args(["-u", "origin", branch_name]);
        } else {
            cmd.args(["origin", branch_name]);
        }
        if let Some(token) = token {
            cmd.env("GIT_ASKPASS", "echo");
            cmd.env("GITHUB_TOKEN", token);
        }
        let output = cmd.output().map_err(|e| WorktreeError::PushFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(WorktreeError::PushFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    /// `createPullRequest(path, title, body, baseBranch?, draft, labels, token) → url`.
    ///
    /// No teacher module shells out to a forge API; this is a thin REST call
    /// against GitHub, gated on an owner/repo derived from `origin`'s URL.
    pub async fn create_pull_request(
        &self,
        path: &Path,
        title: &str,
        body: &str,
        base_branch: Option<&str>,
        branch_name: &str,
        draft: bool,
        token: &str,
    ) -> WorktreeResult<String> {
        let remote_url = self.run_git(path, &["remote", "get-url", "origin"])?;
        let (owner, repo) = parse_github_owner_repo(&remote_url)
            .ok_or_else(|| WorktreeError::PullRequestFailed(format!("unrecognized remote url: {remote_url}")))?;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("https://api.github.com/repos/{owner}/{repo}/pulls"))
            .header("Authorization", format!("Bearer {token}"))
            .header("User-Agent", "story-orchestrator")
            .json(&serde_json::json!({
                "title": title,
                "body": body,
                "head": branch_name,
                "base": base_branch.unwrap_or("main"),
                "draft": draft,
            }))
            .send()
            .await
            .map_err(|e| WorktreeError::PullRequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WorktreeError::PullRequestFailed(format!("{status}: {text}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| WorktreeError::PullRequestFailed(e.to_string()))?;
        body.get("html_url")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| WorktreeError::PullRequestFailed("response missing html_url".into()))
    }
}

fn parse_github_owner_repo(remote_url: &str) -> Option<(String, String)> {
    let trimmed = remote_url.trim_end_matches(".git");
    let path = if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("https://github.com/") {
        rest
    } else {
        return None;
    };
    let mut parts = path.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.to_string();
    Some((owner, repo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use uuid::Uuid;

    fn setup_git_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        Command::new("git").args(["add", "."]).current_dir(dir.path()).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "init"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn branch_name_is_slugged_lowercased_and_truncated() {
        let uuid = Uuid::new_v4();
        let name = derive_branch_name("story", "Add Logging & Metrics!!", &uuid);
        assert!(name.starts_with("story/add-logging-metrics-"));
        assert!(name.len() <= 63);
    }

    #[test]
    fn branch_name_truncation_never_exceeds_63_bytes() {
        let uuid = Uuid::new_v4();
        let long_title = "a".repeat(200);
        let name = derive_branch_name("story", &long_title, &uuid);
        assert!(name.len() <= 63);
    }

    #[test]
    fn create_worktree_then_has_no_uncommitted_changes() {
        let repo = setup_git_repo();
        let wt_base = tempfile::tempdir().unwrap();
        let coordinator = WorktreeCoordinator::new(wt_base.path(), "[story]");

        let uuid = Uuid::new_v4();
        let branch = derive_branch_name("story", "test feature", &uuid);
        let wt_path = coordinator
            .create_worktree(repo.path(), &branch, None)
            .unwrap();

        assert!(wt_path.exists());
        assert!(!coordinator.has_uncommitted_changes(&wt_path).unwrap());
        assert!(wt_path.join(".vscode/settings.json").exists());
        assert!(wt_path.join(".github/agent-instructions.md").exists());
    }

    #[test]
    fn creating_the_same_worktree_twice_fails() {
        let repo = setup_git_repo();
        let wt_base = tempfile::tempdir().unwrap();
        let coordinator = WorktreeCoordinator::new(wt_base.path(), "[story]");
        let uuid = Uuid::new_v4();
        let branch = derive_branch_name("story", "dup", &uuid);

        coordinator.create_worktree(repo.path(), &branch, None).unwrap();
        let err = coordinator.create_worktree(repo.path(), &branch, None);
        assert!(err.is_err());
    }

    #[test]
    fn commit_picks_up_new_files() {
        let repo = setup_git_repo();
        let wt_base = tempfile::tempdir().unwrap();
        let coordinator = WorktreeCoordinator::new(wt_base.path(), "[story]");
        let uuid = Uuid::new_v4();
        let branch = derive_branch_name("story", "commit test", &uuid);
        let wt_path = coordinator.create_worktree(repo.path(), &branch, None).unwrap();

        std::fs::write(wt_path.join("feature.txt"), "content").unwrap();
        let sha = coordinator.commit(&wt_path, "add feature", true).unwrap();
        assert!(!sha.is_empty());
        assert!(!coordinator.has_uncommitted_changes(&wt_path).unwrap());
    }

    #[test]
    fn parses_https_and_ssh_github_remotes() {
        assert_eq!(
            parse_github_owner_repo("https://github.com/acme/widgets.git"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(
            parse_github_owner_repo("git@github.com:acme/widgets.git"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(parse_github_owner_repo("not a remote"), None);
    }
}
