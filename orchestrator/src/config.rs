//! Runtime configuration, loaded from environment variables with typed
//! defaults — the same pattern the ensemble coordinator config uses.

use std::path::PathBuf;
use std::time::Duration;

fn from_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the RocksDB-backed story store lives on disk.
    pub store_path: PathBuf,
    /// Parent directory under which per-story worktrees are created.
    pub worktree_base_dir: PathBuf,
    /// Default `Story.max_parallelism` for newly created stories.
    pub default_max_parallelism: u32,
    /// Wall-clock budget for a single build or test gate invocation.
    pub gate_timeout: Duration,
    /// Per-step wall-clock budget for the internal agent's ReAct loop.
    pub step_timeout: Duration,
    /// Max Thought/Action/Observation iterations before a step is forced to finish.
    pub max_agent_steps: u32,
    /// Branch name prefix used when deriving a story's feature branch.
    pub branch_prefix: String,
    /// Commit-message prefix the worktree coordinator stamps on its checkpoints.
    pub commit_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: from_env("STORY_STORE_PATH", PathBuf::from("./story-store")),
            worktree_base_dir: from_env("STORY_WORKTREE_BASE_DIR", PathBuf::from("/tmp/story-wt")),
            default_max_parallelism: from_env("STORY_DEFAULT_MAX_PARALLELISM", 3),
            gate_timeout: Duration::from_secs(from_env("STORY_GATE_TIMEOUT_SECS", 600)),
            step_timeout: Duration::from_secs(from_env("STORY_STEP_TIMEOUT_SECS", 600)),
            max_agent_steps: from_env("STORY_MAX_AGENT_STEPS", 15),
            branch_prefix: from_env("STORY_BRANCH_PREFIX", "story".to_string()),
            commit_prefix: from_env("STORY_COMMIT_PREFIX", "[story]".to_string()),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.default_max_parallelism, 3);
        assert_eq!(cfg.gate_timeout, Duration::from_secs(600));
        assert_eq!(cfg.branch_prefix, "story");
    }
}
