//! Version-control gateway over the `git` command line.
//!
//! Every operation is expressed as an argument list handed to a
//! [`GitExecutor`], which returns an exit code with captured output. The
//! gateway never force-merges, rebases or stages blanket changes unless the
//! caller asks for the whole repository explicitly.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::VcsError;

/// Captured result of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    /// Exit code (0 = success, -1 = could not spawn).
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs git with an argument list against a fixed working copy.
#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn run(&self, args: &[&str]) -> GitOutput;
}

/// [`GitExecutor`] that spawns the system `git` binary.
#[derive(Debug, Clone)]
pub struct SystemGit {
    repo_root: PathBuf,
}

impl SystemGit {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

#[async_trait]
impl GitExecutor for SystemGit {
    async fn run(&self, args: &[&str]) -> GitOutput {
        let result = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) => GitOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
            Err(e) => GitOutput {
                code: -1,
                stdout: String::new(),
                stderr: format!("failed to run git: {e}"),
            },
        }
    }
}

/// How the local branch relates to its remote counterpart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchRelation {
    UpToDate,
    /// Local has commits the remote lacks.
    Ahead,
    /// Remote has commits the local lacks.
    Behind,
    Diverged,
    /// One of the two commit ids could not be resolved.
    Unresolved,
}

impl fmt::Display for BranchRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BranchRelation::UpToDate => "up-to-date",
            BranchRelation::Ahead => "ahead",
            BranchRelation::Behind => "behind",
            BranchRelation::Diverged => "diverged",
            BranchRelation::Unresolved => "unresolved",
        };
        f.write_str(s)
    }
}

/// Local vs remote view of one branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryState {
    pub branch: String,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub relation: BranchRelation,
}

impl RepositoryState {
    /// True when the remote carries commits the local branch does not.
    ///
    /// Unresolvable ids mean "nothing to do", not an error.
    pub fn remote_ahead(&self) -> bool {
        matches!(
            self.relation,
            BranchRelation::Behind | BranchRelation::Diverged
        )
    }

    pub fn short_local(&self) -> &str {
        short_id(self.local.as_deref())
    }

    pub fn short_remote(&self) -> &str {
        short_id(self.remote.as_deref())
    }
}

pub(crate) fn short_id(id: Option<&str>) -> &str {
    match id {
        Some(id) => &id[..10.min(id.len())],
        None => "?",
    }
}

/// What to stage for a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSet {
    /// Exactly these paths, relative to the repository root.
    Paths(Vec<PathBuf>),
    /// Everything in the working copy except the `exclude` paths.
    Repository { exclude: Vec<PathBuf> },
}

fn exclude_pathspecs(exclude: &[PathBuf]) -> Vec<String> {
    exclude
        .iter()
        .map(|p| format!(":(exclude){}", p.to_string_lossy()))
        .collect()
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub commit: String,
    /// False when no remote is configured.
    pub pushed: bool,
}

/// Version-control operations against one working copy and one remote.
pub struct VersionControlGateway {
    git: Box<dyn GitExecutor>,
    remote: String,
}

impl VersionControlGateway {
    pub fn new(git: impl GitExecutor + 'static, remote: impl Into<String>) -> Self {
        Self {
            git: Box::new(git),
            remote: remote.into(),
        }
    }

    /// Gateway over the system `git` binary rooted at `repo_root`.
    pub fn system(repo_root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self::new(SystemGit::new(repo_root), remote)
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    async fn run(&self, args: &[&str]) -> GitOutput {
        let output = self.git.run(args).await;
        debug!(args = ?args, code = output.code, "git");
        output
    }

    async fn run_checked(&self, args: &[&str]) -> Result<GitOutput, VcsError> {
        let output = self.run(args).await;
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::CommandFailed {
                command: args.join(" "),
                detail: output.detail(),
            })
        }
    }

    pub async fn has_remote(&self) -> bool {
        let output = self.run(&["remote"]).await;
        output.success() && output.stdout.split_whitespace().any(|r| r == self.remote)
    }

    pub async fn fetch(&self) -> Result<(), VcsError> {
        if !self.has_remote().await {
            return Err(VcsError::NoRemote {
                remote: self.remote.clone(),
            });
        }
        self.run_checked(&["fetch", self.remote.as_str()]).await?;
        Ok(())
    }

    /// Currently checked-out branch, `None` when detached or unresolvable.
    pub async fn current_branch(&self) -> Option<String> {
        let output = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await;
        let name = output.stdout.trim();
        if !output.success() || name.is_empty() || name == "HEAD" {
            return None;
        }
        Some(name.to_string())
    }

    /// Switch to `branch`, creating it from the remote branch when missing.
    pub async fn checkout_or_create(&self, branch: &str) -> Result<(), VcsError> {
        let first = self.run(&["checkout", branch]).await;
        if first.success() {
            return Ok(());
        }

        let start_point = format!("{}/{}", self.remote, branch);
        let second = self.run(&["checkout", "-B", branch, start_point.as_str()]).await;
        if second.success() {
            info!(branch = %branch, from = %start_point, "created local branch");
            return Ok(());
        }

        warn!(
            branch = %branch,
            first = %first.detail(),
            second = %second.detail(),
            "checkout failed"
        );
        Err(VcsError::NotFound {
            branch: branch.to_string(),
        })
    }

    /// Point the branch's upstream at the remote branch if it is not already.
    pub async fn ensure_upstream(&self, branch: &str) -> Result<(), VcsError> {
        if !self.has_remote().await {
            return Ok(());
        }
        let expected = format!("{}/{}", self.remote, branch);
        let current = self
            .run(&["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])
            .await;
        if current.success() && current.stdout.trim() == expected {
            return Ok(());
        }
        let flag = format!("--set-upstream-to={expected}");
        self.run_checked(&["branch", flag.as_str(), branch]).await?;
        debug!(branch = %branch, upstream = %expected, "upstream set");
        Ok(())
    }

    /// Resolve a reference to a commit id.
    pub async fn rev_parse(&self, reference: &str) -> Option<String> {
        let spec = format!("{reference}^{{commit}}");
        let output = self.run(&["rev-parse", "--verify", "--quiet", spec.as_str()]).await;
        let id = output.stdout.trim();
        if output.success() && !id.is_empty() {
            Some(id.to_string())
        } else {
            None
        }
    }

    /// Compare the local branch with the remote-tracking branch.
    ///
    /// Reflects the last fetch; callers fetch first.
    pub async fn repository_state(&self, branch: &str) -> RepositoryState {
        let local_ref = format!("refs/heads/{branch}");
        let remote_ref = format!("refs/remotes/{}/{}", self.remote, branch);
        let local = self.rev_parse(&local_ref).await;
        let remote = self.rev_parse(&remote_ref).await;

        let relation = match (&local, &remote) {
            (Some(l), Some(r)) if l == r => BranchRelation::UpToDate,
            (Some(_), Some(_)) => {
                let range = format!("{local_ref}...{remote_ref}");
                let counts = self
                    .run(&["rev-list", "--left-right", "--count", range.as_str()])
                    .await;
                match parse_left_right(&counts.stdout) {
                    Some((0, 0)) => BranchRelation::UpToDate,
                    Some((_, 0)) => BranchRelation::Ahead,
                    Some((0, _)) => BranchRelation::Behind,
                    Some(_) => BranchRelation::Diverged,
                    None => {
                        warn!(branch = %branch, "could not count commits, treating remote as ahead");
                        BranchRelation::Behind
                    }
                }
            }
            _ => BranchRelation::Unresolved,
        };

        RepositoryState {
            branch: branch.to_string(),
            local,
            remote,
            relation,
        }
    }

    pub async fn remote_ahead(&self, branch: &str) -> bool {
        self.repository_state(branch).await.remote_ahead()
    }

    /// Integrate remote history without ever creating a merge commit.
    pub async fn fast_forward_pull(&self, branch: &str) -> Result<(), VcsError> {
        let output = self
            .run(&["pull", "--ff-only", self.remote.as_str(), branch])
            .await;
        if output.success() {
            return Ok(());
        }
        Err(VcsError::Diverged {
            branch: branch.to_string(),
            detail: output.detail(),
        })
    }

    pub async fn is_tracked(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.run(&["ls-files", "--error-unmatch", "--", path.as_ref()])
            .await
            .success()
    }

    /// Whether `path` differs from HEAD. Untracked paths always differ.
    pub async fn has_diff(&self, path: &Path) -> bool {
        if !self.is_tracked(path).await {
            return true;
        }
        let path = path.to_string_lossy();
        let output = self
            .run(&["diff", "--quiet", "HEAD", "--", path.as_ref()])
            .await;
        // 1 = differences, anything else but 0 is an error; report a diff then.
        output.code != 0
    }

    /// `git status --porcelain` for the whole working copy minus `exclude`.
    ///
    /// Untracked files are listed one by one so an excluded directory never
    /// shows up through a collapsed parent entry.
    pub async fn status_porcelain(&self, exclude: &[PathBuf]) -> Result<String, VcsError> {
        let excluded = exclude_pathspecs(exclude);
        let mut args: Vec<&str> = vec!["status", "--porcelain", "--untracked-files=all"];
        if !excluded.is_empty() {
            args.extend(["--", "."]);
            args.extend(excluded.iter().map(String::as_str));
        }
        let output = self.run_checked(&args).await?;
        Ok(output.stdout.trim_end().to_string())
    }

    /// Stage, commit and push.
    ///
    /// Returns [`VcsError::NothingToCommit`] when the staged set is empty.
    /// A failed push leaves the local commit in place.
    pub async fn commit_and_push(
        &self,
        stage: &StageSet,
        message: &str,
        branch: &str,
    ) -> Result<CommitReport, VcsError> {
        let paths: Vec<String> = match stage {
            StageSet::Paths(paths) => paths
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect(),
            StageSet::Repository { exclude } => exclude_pathspecs(exclude),
        };

        let mut add: Vec<&str> = vec!["add"];
        let mut staged_check: Vec<&str> = vec!["diff", "--cached", "--quiet"];
        let mut commit: Vec<&str> = vec!["commit", "-m", message];
        match stage {
            StageSet::Paths(_) => {
                add.push("--");
                staged_check.push("--");
                commit.push("--");
                for p in &paths {
                    add.push(p.as_str());
                    staged_check.push(p.as_str());
                    commit.push(p.as_str());
                }
            }
            StageSet::Repository { .. } => {
                add.push("-A");
                if !paths.is_empty() {
                    add.extend(["--", "."]);
                    add.extend(paths.iter().map(String::as_str));
                }
            }
        }

        self.run_checked(&add).await?;

        if self.run(&staged_check).await.success() {
            return Err(VcsError::NothingToCommit);
        }

        let committed = self.run(&commit).await;
        if !committed.success() {
            let text = format!("{}{}", committed.stdout, committed.stderr).to_lowercase();
            if text.contains("nothing to commit") {
                return Err(VcsError::NothingToCommit);
            }
            return Err(VcsError::CommandFailed {
                command: "commit".to_string(),
                detail: committed.detail(),
            });
        }

        let commit_id = self.rev_parse("HEAD").await.unwrap_or_default();
        info!(branch = %branch, commit = %short_id(Some(&commit_id)), "committed");

        if !self.has_remote().await {
            warn!(remote = %self.remote, "no remote configured, commit kept local");
            return Ok(CommitReport {
                commit: commit_id,
                pushed: false,
            });
        }

        let pushed = self.run(&["push", self.remote.as_str(), branch]).await;
        if !pushed.success() {
            return Err(VcsError::PushRejected {
                branch: branch.to_string(),
                detail: pushed.detail(),
            });
        }

        Ok(CommitReport {
            commit: commit_id,
            pushed: true,
        })
    }
}

fn parse_left_right(stdout: &str) -> Option<(u64, u64)> {
    let mut parts = stdout.split_whitespace();
    let left = parts.next()?.parse().ok()?;
    let right = parts.next()?.parse().ok()?;
    Some((left, right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use std::sync::Mutex;

    fn run_git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn configure(dir: &Path) {
        run_git(dir, &["config", "user.name", "test-user"]);
        run_git(dir, &["config", "user.email", "test@example.com"]);
        run_git(dir, &["config", "commit.gpgsign", "false"]);
    }

    /// Bare remote with a `dev` branch, plus a clone checked out on `dev`.
    fn make_remote_and_clone() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("remote.git");
        let seed = root.path().join("seed");
        let work = root.path().join("work");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&seed).unwrap();

        run_git(&remote, &["init", "--bare"]);
        run_git(&seed, &["init"]);
        configure(&seed);
        std::fs::write(seed.join("README.md"), "seed\n").unwrap();
        run_git(&seed, &["add", "README.md"]);
        run_git(&seed, &["commit", "-m", "initial"]);
        let remote_str = remote.to_string_lossy().to_string();
        run_git(&seed, &["push", remote_str.as_str(), "HEAD:refs/heads/dev"]);
        run_git(&remote, &["symbolic-ref", "HEAD", "refs/heads/dev"]);

        run_git(root.path(), &["clone", remote_str.as_str(), "work"]);
        configure(&work);
        (root, remote, work)
    }

    #[test]
    fn test_parse_left_right_counts() {
        assert_eq!(parse_left_right("2\t0\n"), Some((2, 0)));
        assert_eq!(parse_left_right("garbage"), None);
    }

    #[test]
    fn test_unresolved_state_is_not_remote_ahead() {
        let state = RepositoryState {
            branch: "prod".to_string(),
            local: Some("abc".to_string()),
            remote: None,
            relation: BranchRelation::Unresolved,
        };
        assert!(!state.remote_ahead());
        assert_eq!(state.short_remote(), "?");
    }

    struct ScriptedGit {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GitExecutor for ScriptedGit {
        async fn run(&self, args: &[&str]) -> GitOutput {
            self.calls.lock().unwrap().push(args.join(" "));
            let code = if args[0] == "checkout" { 1 } else { 0 };
            GitOutput {
                code,
                stdout: String::new(),
                stderr: "pathspec did not match".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_checkout_falls_back_to_remote_branch_then_not_found() {
        let gateway = VersionControlGateway::new(
            ScriptedGit {
                calls: Mutex::new(Vec::new()),
            },
            "origin",
        );
        let err = gateway.checkout_or_create("staging").await.unwrap_err();
        assert_eq!(
            err,
            VcsError::NotFound {
                branch: "staging".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_checkout_or_create_tracks_remote_branch() {
        let (root, remote, work) = make_remote_and_clone();
        let remote_str = remote.to_string_lossy().to_string();
        run_git(&root.path().join("seed"), &["push", remote_str.as_str(), "HEAD:refs/heads/staging"]);
        run_git(&work, &["fetch", "origin"]);

        let gateway = VersionControlGateway::system(&work, "origin");
        gateway.checkout_or_create("staging").await.expect("checkout");
        assert_eq!(gateway.current_branch().await.as_deref(), Some("staging"));

        let err = gateway.checkout_or_create("nope").await.unwrap_err();
        assert!(matches!(err, VcsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_repository_state_detects_remote_ahead() {
        let (root, _remote, work) = make_remote_and_clone();
        let gateway = VersionControlGateway::system(&work, "origin");
        gateway.fetch().await.expect("fetch");

        let state = gateway.repository_state("dev").await;
        assert_eq!(state.relation, BranchRelation::UpToDate);
        assert!(!state.remote_ahead());

        let seed = root.path().join("seed");
        std::fs::write(seed.join("README.md"), "seed v2\n").unwrap();
        run_git(&seed, &["commit", "-am", "second"]);
        let remote_str = root.path().join("remote.git").to_string_lossy().to_string();
        run_git(&seed, &["push", remote_str.as_str(), "HEAD:refs/heads/dev"]);

        gateway.fetch().await.expect("fetch");
        let state = gateway.repository_state("dev").await;
        assert_eq!(state.relation, BranchRelation::Behind);
        assert!(state.remote_ahead());
        assert_ne!(state.local, state.remote);

        gateway.fast_forward_pull("dev").await.expect("ff pull");
        let state = gateway.repository_state("dev").await;
        assert_eq!(state.relation, BranchRelation::UpToDate);
    }

    #[tokio::test]
    async fn test_missing_remote_branch_is_unresolved() {
        let (_root, _remote, work) = make_remote_and_clone();
        let gateway = VersionControlGateway::system(&work, "origin");
        let state = gateway.repository_state("prod").await;
        assert_eq!(state.relation, BranchRelation::Unresolved);
        assert!(!gateway.remote_ahead("prod").await);
    }

    #[tokio::test]
    async fn test_has_diff_tracks_untracked_and_modified_paths() {
        let (_root, _remote, work) = make_remote_and_clone();
        let gateway = VersionControlGateway::system(&work, "origin");

        assert!(!gateway.has_diff(Path::new("README.md")).await);

        std::fs::write(work.join("artifact.xml"), "<a/>").unwrap();
        assert!(gateway.has_diff(Path::new("artifact.xml")).await);

        std::fs::write(work.join("README.md"), "changed\n").unwrap();
        assert!(gateway.has_diff(Path::new("README.md")).await);
    }

    #[tokio::test]
    async fn test_commit_and_push_stages_only_given_paths() {
        let (_root, remote, work) = make_remote_and_clone();
        let gateway = VersionControlGateway::system(&work, "origin");

        std::fs::write(work.join("artifact.xml"), "<a/>").unwrap();
        std::fs::write(work.join("noise.tmp"), "scratch").unwrap();

        let report = gateway
            .commit_and_push(
                &StageSet::Paths(vec![PathBuf::from("artifact.xml")]),
                "development capture",
                "dev",
            )
            .await
            .expect("commit");
        assert!(report.pushed);
        assert_eq!(report.commit.len(), 40);

        let status = gateway.status_porcelain(&[]).await.unwrap();
        assert!(status.contains("noise.tmp"));
        assert!(!status.contains("artifact.xml"));

        let remote_head = run_git(&remote, &["rev-parse", "refs/heads/dev"]);
        assert_eq!(remote_head, report.commit);

        let again = gateway
            .commit_and_push(
                &StageSet::Paths(vec![PathBuf::from("artifact.xml")]),
                "development capture",
                "dev",
            )
            .await;
        assert_eq!(again.unwrap_err(), VcsError::NothingToCommit);
    }

    #[tokio::test]
    async fn test_commit_whole_repository_sweeps_everything() {
        let (_root, _remote, work) = make_remote_and_clone();
        let gateway = VersionControlGateway::system(&work, "origin");
        std::fs::write(work.join("a.txt"), "a").unwrap();
        std::fs::write(work.join("b.txt"), "b").unwrap();

        gateway
            .commit_and_push(&StageSet::Repository { exclude: vec![] }, "sweep", "dev")
            .await
            .expect("commit");
        assert_eq!(gateway.status_porcelain(&[]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_whole_repository_commit_leaves_excluded_directory_alone() {
        let (_root, remote, work) = make_remote_and_clone();
        let gateway = VersionControlGateway::system(&work, "origin");
        let archives = PathBuf::from("exports/archives/dev");
        std::fs::create_dir_all(work.join(&archives)).unwrap();
        std::fs::write(work.join(&archives).join("PLC_DEV_1.projectarchive"), "bin").unwrap();

        let exclude = vec![archives.clone()];
        assert_eq!(gateway.status_porcelain(&exclude).await.unwrap(), "");
        assert!(!gateway.status_porcelain(&[]).await.unwrap().is_empty());

        std::fs::write(work.join("a.txt"), "a").unwrap();
        let status = gateway.status_porcelain(&exclude).await.unwrap();
        assert!(status.contains("a.txt"));
        assert!(!status.contains("projectarchive"));

        gateway
            .commit_and_push(&StageSet::Repository { exclude: exclude.clone() }, "sweep", "dev")
            .await
            .expect("commit");
        let tracked = run_git(&remote, &["ls-tree", "-r", "--name-only", "dev"]);
        assert!(tracked.contains("a.txt"));
        assert!(!tracked.contains("projectarchive"));

        let again = gateway
            .commit_and_push(&StageSet::Repository { exclude }, "sweep", "dev")
            .await;
        assert_eq!(again.unwrap_err(), VcsError::NothingToCommit);
    }

    #[tokio::test]
    async fn test_fast_forward_refuses_diverged_history() {
        let (root, remote, work) = make_remote_and_clone();
        let remote_str = remote.to_string_lossy().to_string();
        let seed = root.path().join("seed");
        std::fs::write(seed.join("README.md"), "remote side\n").unwrap();
        run_git(&seed, &["commit", "-am", "remote change"]);
        run_git(&seed, &["push", remote_str.as_str(), "HEAD:refs/heads/dev"]);

        std::fs::write(work.join("local.txt"), "local side\n").unwrap();
        run_git(&work, &["add", "local.txt"]);
        run_git(&work, &["commit", "-m", "local change"]);

        let gateway = VersionControlGateway::system(&work, "origin");
        gateway.fetch().await.expect("fetch");
        let state = gateway.repository_state("dev").await;
        assert_eq!(state.relation, BranchRelation::Diverged);
        assert!(state.remote_ahead());

        let err = gateway.fast_forward_pull("dev").await.unwrap_err();
        assert!(matches!(err, VcsError::Diverged { .. }));
    }
}
