//! Fetches plugin sources with the `git` command line.
//!
//! A fetch is a clone of the default branch followed by a checkout of the
//! first ref from [`SourceLocation::candidate_refs`] that works:
//!
//! 1. the pinned ref (commit, tag or branch), fetched explicitly since the
//!    clone is shallow and checked out detached from `FETCH_HEAD`
//! 2. the release tag `v<version>`
//! 3. the release tag `<version>`
//!
//! With no candidate refs the default branch is tested as cloned. The same
//! happens when only the pinned ref was a candidate and it could not be
//! checked out. A release tag that exists but fails to check out is an
//! error, since testing the default branch would test the wrong release.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Command, FetchError, Fetcher, ProcessError, exec, last_line};
use crate::config::GitConfig;
use crate::logs::PluginLog;
use crate::plugin::{GitRef, SourceLocation};

/// [`Fetcher`] backed by the `git` binary.
pub struct GitFetcher {
    config: GitConfig,
}

impl GitFetcher {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    fn git(&self, repo: &Path) -> Command {
        Command::new(&self.config.program)
            .working_dir(repo)
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// Runs a git subcommand in `repo`, returning whether it succeeded.
    async fn try_git(
        &self,
        repo: &Path,
        args: &[&str],
        log: &PluginLog,
    ) -> Result<bool, ProcessError> {
        let result = exec(&self.git(repo).args(args.iter().copied()), log).await?;
        Ok(result.success())
    }

    async fn checkout(
        &self,
        repo: &Path,
        reference: &GitRef,
        tags_fetched: &mut bool,
        log: &PluginLog,
    ) -> Result<bool, ProcessError> {
        match reference {
            GitRef::Pinned(reference) => {
                let fetch = ["fetch", "--quiet", "origin", reference.as_str()];
                if !self.try_git(repo, &fetch, log).await? {
                    log.warn(format!("Could not fetch {}", reference));
                    return Ok(false);
                }
                // A fetched tag or branch name creates no local ref.
                self.try_git(repo, &["checkout", "--quiet", "--detach", "FETCH_HEAD"], log)
                    .await
            }
            GitRef::Tag(tag) => {
                if !*tags_fetched {
                    if !self.try_git(repo, &["fetch", "--quiet", "--tags"], log).await? {
                        log.warn("Could not fetch tags");
                        return Ok(false);
                    }
                    *tags_fetched = true;
                }
                let branch = format!("{}-branch", tag);
                self.try_git(repo, &["checkout", "--quiet", tag, "-b", &branch], log)
                    .await
            }
        }
    }
}

#[async_trait]
impl Fetcher for GitFetcher {
    fn name(&self) -> &str {
        "git"
    }

    async fn fetch(
        &self,
        source: &SourceLocation,
        dest: &Path,
        log: &PluginLog,
    ) -> Result<PathBuf, FetchError> {
        let parent = dest.parent().unwrap_or(dest);
        let mut clone = self.git(parent).arg("clone");
        if self.config.shallow {
            clone = clone.args(["--depth", "1"]);
        }
        let clone = clone.arg(&source.url).path_arg(dest);

        let result = exec(&clone, log).await?;
        if !result.success() {
            return Err(FetchError::Clone {
                url: source.url.clone(),
                reason: last_line(&result.stderr).to_string(),
            });
        }

        let refs = source.candidate_refs();
        if refs.is_empty() {
            if source.is_dev_version() {
                log.warn("Development version has no release tag, testing default branch");
            } else {
                log.warn("No commit or release tag pinned, testing default branch");
            }
            return Ok(dest.to_path_buf());
        }

        let mut tags_fetched = false;
        for reference in &refs {
            if self.checkout(dest, reference, &mut tags_fetched, log).await? {
                log.info(format!("Checked out {}", reference));
                return Ok(dest.to_path_buf());
            }
            log.warn(format!("Could not check out {}", reference));
        }

        if !refs.iter().any(|r| matches!(r, GitRef::Tag(_))) {
            log.warn("Pinned ref unavailable and no release tag to try, testing default branch");
            return Ok(dest.to_path_buf());
        }

        Err(FetchError::Checkout {
            wanted: refs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct Upstream {
        dir: tempfile::TempDir,
        /// Commit tagged `v1.0.0`, one behind the default branch.
        tagged: String,
        /// Tip of the default branch.
        head: String,
    }

    impl Upstream {
        /// `file://` so that shallow clones stay shallow.
        fn url(&self) -> String {
            format!("file://{}", self.dir.path().display())
        }
    }

    /// Creates a local repository with a tagged commit followed by a second
    /// commit. Returns `None` when git is not installed.
    async fn upstream() -> Option<Upstream> {
        let dir = tempfile::tempdir().ok()?;
        let log = PluginLog::detached("upstream");
        let script = "git init -q . && \
             git config uploadpack.allowAnySHA1InWant true && \
             git -c user.email=t@t -c user.name=t commit -q --allow-empty -m one && \
             git tag v1.0.0 && \
             git -c user.email=t@t -c user.name=t commit -q --allow-empty -m two && \
             git rev-parse HEAD~1 HEAD";
        let cmd = Command::new("sh").args(["-c", script]).working_dir(dir.path());
        let result = exec(&cmd, &log).await.ok()?;
        if !result.success() {
            return None;
        }
        let mut lines = result.stdout.lines();
        let tagged = lines.next()?.trim().to_string();
        let head = lines.next()?.trim().to_string();
        Some(Upstream { dir, tagged, head })
    }

    fn fetcher(shallow: bool) -> GitFetcher {
        GitFetcher::new(GitConfig {
            shallow,
            ..GitConfig::default()
        })
    }

    async fn head_of(repo: &Path) -> String {
        let log = PluginLog::detached("p");
        let cmd = Command::new("git").args(["rev-parse", "HEAD"]).working_dir(repo);
        exec(&cmd, &log).await.unwrap().stdout.trim().to_string()
    }

    async fn fetch(
        shallow: bool,
        source: &SourceLocation,
    ) -> (tempfile::TempDir, Result<PathBuf, FetchError>) {
        let work = tempfile::tempdir().unwrap();
        let log = PluginLog::detached("p");
        let result = fetcher(shallow)
            .fetch(source, &work.path().join("src"), &log)
            .await;
        (work, result)
    }

    #[tokio::test]
    async fn test_fetch_checks_out_release_tag() {
        let Some(upstream) = upstream().await else {
            return; // git not available
        };

        let source = SourceLocation::new(upstream.url()).with_version("1.0.0");
        let (work, result) = fetch(false, &source).await;

        let checkout = result.unwrap();
        assert_eq!(checkout, work.path().join("src"));
        assert_eq!(head_of(&checkout).await, upstream.tagged);
    }

    #[tokio::test]
    async fn test_shallow_fetch_of_pinned_tag_name() {
        let Some(upstream) = upstream().await else {
            return;
        };

        let source = SourceLocation::new(upstream.url()).with_commit("v1.0.0");
        let (_work, result) = fetch(true, &source).await;

        assert_eq!(head_of(&result.unwrap()).await, upstream.tagged);
    }

    #[tokio::test]
    async fn test_shallow_fetch_of_pinned_commit() {
        let Some(upstream) = upstream().await else {
            return;
        };

        let source = SourceLocation::new(upstream.url()).with_commit(&upstream.tagged);
        let (_work, result) = fetch(true, &source).await;

        assert_eq!(head_of(&result.unwrap()).await, upstream.tagged);
    }

    #[tokio::test]
    async fn test_missing_pin_without_version_uses_default_branch() {
        let Some(upstream) = upstream().await else {
            return;
        };

        let missing = "0123456789abcdef0123456789abcdef01234567";
        for source in [
            SourceLocation::new(upstream.url()).with_commit(missing),
            SourceLocation::new(upstream.url())
                .with_commit(missing)
                .with_version("1.1.0.dev3"),
        ] {
            let (_work, result) = fetch(true, &source).await;
            assert_eq!(head_of(&result.unwrap()).await, upstream.head);
        }
    }

    #[tokio::test]
    async fn test_missing_pin_falls_back_to_release_tag() {
        let Some(upstream) = upstream().await else {
            return;
        };

        let source = SourceLocation::new(upstream.url())
            .with_commit("no-such-branch")
            .with_version("1.0.0");
        let (_work, result) = fetch(true, &source).await;

        assert_eq!(head_of(&result.unwrap()).await, upstream.tagged);
    }

    #[tokio::test]
    async fn test_fetch_unknown_release_tag_fails() {
        let Some(upstream) = upstream().await else {
            return;
        };

        let source = SourceLocation::new(upstream.url()).with_version("9.9.9");
        let (_work, result) = fetch(false, &source).await;

        match result {
            Err(FetchError::Checkout { wanted }) => {
                assert_eq!(wanted, "tag v9.9.9, tag 9.9.9");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_missing_repository() {
        let work = tempfile::tempdir().unwrap();
        let source = SourceLocation::new(work.path().join("no-such-repo").to_string_lossy());

        let log = PluginLog::detached("p");
        match fetcher(false).fetch(&source, &work.path().join("src"), &log).await {
            Err(FetchError::Clone { .. }) | Err(FetchError::Process(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
