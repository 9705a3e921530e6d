//! Asset Sync
//!
//! Brings the deployed working copy in line with the remote branch.
//! Local uncommitted edits are discarded first: the remote is the source
//! of truth for what a node shows. A failed fetch is reported as
//! [`SyncError::Offline`] and callers carry on with the local state.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

use crate::config::SyncConfig;
use crate::logging::OutcomeLog;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote unreachable: {0}")]
    Offline(String),
    #[error("{0:?} is not a git working copy")]
    NotARepository(PathBuf),
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn is_offline(&self) -> bool {
        matches!(self, SyncError::Offline(_))
    }
}

/// Working copy plus the remote branch it follows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub dir: PathBuf,
    pub remote: String,
    pub branch: String,
}

impl From<&SyncConfig> for RepoRef {
    fn from(config: &SyncConfig) -> Self {
        Self {
            dir: config.repo_dir.clone(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitId(String);

impl CommitId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path) -> std::io::Result<CommandOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

pub struct AssetSync {
    runner: Arc<dyn CommandRunner>,
    log: OutcomeLog,
}

impl AssetSync {
    pub fn new(runner: Arc<dyn CommandRunner>, log: OutcomeLog) -> Self {
        Self { runner, log }
    }

    /// Discard local edits, fetch, and fast-forward to the remote head
    pub async fn sync(&self, repo: &RepoRef) -> Result<CommitId, SyncError> {
        if !repo.dir.join(".git").exists() {
            return Err(SyncError::NotARepository(repo.dir.clone()));
        }
        self.log.started(format!("syncing {:?} from {}/{}", repo.dir, repo.remote, repo.branch));

        self.git(repo, &["reset", "--hard", "HEAD"]).await?;

        let fetch = self.runner.run("git", &["fetch", &repo.remote, &repo.branch], &repo.dir).await?;
        if !fetch.success {
            let err = SyncError::Offline(fetch.stderr);
            self.log.warned(format!("{}; keeping local assets", err));
            return Err(err);
        }

        let upstream = format!("{}/{}", repo.remote, repo.branch);
        self.git(repo, &["merge", "--ff-only", &upstream]).await?;

        let head = self.git(repo, &["rev-parse", "HEAD"]).await?;
        let commit = CommitId(head.stdout);
        self.log.succeeded(format!("at commit {}", commit));
        Ok(commit)
    }

    async fn git(&self, repo: &RepoRef, args: &[&str]) -> Result<CommandOutput, SyncError> {
        let output = self.runner.run("git", args, &repo.dir).await?;
        if output.success {
            Ok(output)
        } else {
            let err = SyncError::Git {
                command: args.join(" "),
                stderr: output.stderr,
            };
            self.log.failed(&err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Answers git subcommands from a script and records every call
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        fail_fetch: bool,
        fail_merge: bool,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[&str], _cwd: &Path) -> std::io::Result<CommandOutput> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().push(line);
            let ok = |stdout: &str| CommandOutput {
                success: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
            };
            Ok(match args.first().copied() {
                Some("fetch") if self.fail_fetch => CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "fatal: unable to access: Could not resolve host".to_string(),
                },
                Some("merge") if self.fail_merge => CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "fatal: Not possible to fast-forward, aborting.".to_string(),
                },
                Some("rev-parse") => ok("4f2a9c1"),
                _ => ok(""),
            })
        }
    }

    fn repo() -> (tempfile::TempDir, RepoRef) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let repo = RepoRef {
            dir: dir.path().to_path_buf(),
            remote: "origin".into(),
            branch: "main".into(),
        };
        (dir, repo)
    }

    #[tokio::test]
    async fn test_sync_discards_local_edits_then_fast_forwards() {
        let (_dir, repo) = repo();
        let runner = Arc::new(ScriptedRunner::default());
        let sync = AssetSync::new(runner.clone(), OutcomeLog::new("asset_sync"));

        let commit = sync.sync(&repo).await.unwrap();
        assert_eq!(commit.as_str(), "4f2a9c1");
        assert_eq!(
            *runner.calls.lock(),
            vec![
                "git reset --hard HEAD".to_string(),
                "git fetch origin main".to_string(),
                "git merge --ff-only origin/main".to_string(),
                "git rev-parse HEAD".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_sync_yields_same_commit() {
        let (_dir, repo) = repo();
        let sync = AssetSync::new(Arc::new(ScriptedRunner::default()), OutcomeLog::new("asset_sync"));
        let first = sync.sync(&repo).await.unwrap();
        let second = sync.sync(&repo).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_offline() {
        let (_dir, repo) = repo();
        let runner = Arc::new(ScriptedRunner {
            fail_fetch: true,
            ..Default::default()
        });
        let sync = AssetSync::new(runner.clone(), OutcomeLog::new("asset_sync"));

        let err = sync.sync(&repo).await.unwrap_err();
        assert!(err.is_offline());
        assert!(!runner.calls.lock().iter().any(|c| c.contains("merge")));
    }

    #[tokio::test]
    async fn test_diverged_branch_is_a_git_error() {
        let (_dir, repo) = repo();
        let runner = Arc::new(ScriptedRunner {
            fail_merge: true,
            ..Default::default()
        });
        let sync = AssetSync::new(runner, OutcomeLog::new("asset_sync"));
        let err = sync.sync(&repo).await.unwrap_err();
        assert!(matches!(err, SyncError::Git { .. }));
    }

    #[tokio::test]
    async fn test_missing_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RepoRef {
            dir: dir.path().to_path_buf(),
            remote: "origin".into(),
            branch: "main".into(),
        };
        let sync = AssetSync::new(Arc::new(ScriptedRunner::default()), OutcomeLog::new("asset_sync"));
        assert!(matches!(sync.sync(&repo).await, Err(SyncError::NotARepository(_))));
    }
}
