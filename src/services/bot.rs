//! Bot supervisor.
//!
//! Resolves the bot user, enumerates the projects it can work on, and runs
//! one project loop per project. Crashed loops restart with exponential
//! backoff; loops that lose authorization are disabled with a warning rather
//! than taking the bot down. The supervisor owns the shared git worktree and
//! the root cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BotConfig;
use crate::error::BotError;
use crate::models::{GitLabProject, GitLabUser};
use crate::services::api::GitlabApi;
use crate::services::merge_job::JobContext;
use crate::services::project_loop::ProjectLoop;
use crate::services::worktree::{GitAuth, GitWorktree, Worktree};

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(10);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// A loop that survived this long gets its restart backoff reset.
const STABLE_RUN: Duration = Duration::from_secs(60);

pub struct Bot {
    api: Arc<dyn GitlabApi>,
    config: BotConfig,
    bot_user: GitLabUser,
    cancel: CancellationToken,
}

impl Bot {
    pub fn new(
        api: Arc<dyn GitlabApi>,
        config: BotConfig,
        bot_user: GitLabUser,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            config,
            bot_user,
            cancel,
        }
    }

    /// Run until the root token is cancelled.
    pub async fn run(&self) -> Result<(), BotError> {
        // The worktree lives in a fresh directory for this run and is torn
        // down when we return.
        let root = tempfile::tempdir()
            .map_err(|e| BotError::config(format!("cannot create worktree directory: {}", e)))?;

        let auth = if self.config.use_https {
            GitAuth::Https {
                token: self.config.auth_token.clone(),
            }
        } else {
            let key_file = self
                .config
                .ssh_key_file
                .clone()
                .ok_or_else(|| BotError::config("ssh key file missing"))?;
            GitAuth::Ssh { key_file }
        };
        let committer_email = self
            .bot_user
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@noreply.invalid", self.bot_user.username));
        let worktree: Arc<Mutex<Box<dyn Worktree>>> =
            Arc::new(Mutex::new(Box::new(GitWorktree::new(
                root.path().to_path_buf(),
                auth,
                self.config.git_timeout,
                self.bot_user.name.clone(),
                committer_email,
            ))));

        let projects = self.discover_projects().await?;
        if projects.is_empty() {
            log::warn!("no projects match the configured filters; nothing to do");
        }

        let mut tasks = JoinSet::new();
        for project in projects {
            let ctx = JobContext {
                api: self.api.clone(),
                worktree: worktree.clone(),
                bot_user: self.bot_user.clone(),
                options: self.config.merge_opts.clone(),
                cancel: self.cancel.child_token(),
            };
            let config = self.config.clone();
            tasks.spawn(Self::supervise(ctx, config, project));
        }

        while tasks.join_next().await.is_some() {}
        log::info!("all project loops stopped");
        Ok(())
    }

    /// Accessible projects filtered by the project regexp.
    async fn discover_projects(&self) -> Result<Vec<GitLabProject>, BotError> {
        let all = self.api.list_projects().await?;
        let mut kept = Vec::new();
        for project in all {
            if self
                .config
                .project_regexp
                .is_match(&project.path_with_namespace)
            {
                kept.push(project);
            } else {
                log::debug!(
                    "project {} does not match project-regexp",
                    project.path_with_namespace
                );
            }
        }
        log::info!("watching {} project(s)", kept.len());
        Ok(kept)
    }

    /// Keep one project loop alive until shutdown or a terminal condition.
    async fn supervise(ctx: JobContext, config: BotConfig, project: GitLabProject) {
        let name = project.path_with_namespace.clone();
        let mut backoff = RESTART_BACKOFF_INITIAL;

        loop {
            let started = Instant::now();
            let result = ProjectLoop::new(ctx.clone(), &config, project.clone())
                .run()
                .await;

            match result {
                Ok(()) => return,
                Err(BotError::Unauthorized { message }) => {
                    log::warn!(
                        "[loop {}] disabled: not authorized ({})",
                        name,
                        message
                    );
                    return;
                }
                Err(err) => {
                    if started.elapsed() >= STABLE_RUN {
                        backoff = RESTART_BACKOFF_INITIAL;
                    }
                    log::warn!(
                        "[loop {}] crashed ({}), restarting in {:?}",
                        name,
                        err,
                        backoff
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
                }
            }
        }
    }
}
