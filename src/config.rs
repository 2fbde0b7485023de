//! Bot configuration.
//!
//! Options can come from command-line flags, `MRL_*` environment variables or
//! an optional TOML config file; precedence is flag > environment > file >
//! default (boolean switches OR across layers). The result is one immutable
//! [`BotConfig`] constructed at startup; jobs only ever see the narrower
//! [`MergeOptions`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use regex::Regex;
use serde::Deserialize;

use crate::error::BotError;
use crate::interval::IntervalUnion;

pub const DEFAULT_CI_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_REBASE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_IDLE_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_HTTP_RETRY_BUDGET_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_MAX_INFLIGHT_REQUESTS: usize = 10;

/// How the source branch is brought on top of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Platform-side merge commit; no local branch rewriting.
    Merge,
    /// Local rebase + force-with-lease push (the default).
    Rebase,
    /// Platform-side rebase endpoint instead of the local worktree.
    GitlabRebase,
}

/// Order in which assigned MRs are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum MergeOrder {
    /// Oldest created first.
    CreatedAt,
    /// Most recently assigned last.
    AssignedAt,
}

/// Options narrow enough to hand to a single merge job.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub add_tested: bool,
    pub add_part_of: bool,
    pub add_reviewers: bool,
    pub impersonate_approvers: bool,
    pub approval_reset_timeout: Duration,
    pub embargo: IntervalUnion,
    pub ci_timeout: Duration,
    pub rebase_timeout: Duration,
    pub require_successful_ci: bool,
    pub ci_skipped_is_success: bool,
    pub batch_skip_ci: bool,
}

impl MergeOptions {
    /// Whether any option rewrites commit messages.
    pub fn requests_commit_tagging(&self) -> bool {
        self.add_tested || self.add_part_of || self.add_reviewers
    }
}

/// Full bot configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub gitlab_url: String,
    pub auth_token: String,
    pub use_https: bool,
    pub ssh_key_file: Option<PathBuf>,
    pub project_regexp: Regex,
    pub branch_regexp: Regex,
    pub source_branch_regexp: Regex,
    pub merge_order: MergeOrder,
    pub merge_opts: MergeOptions,
    pub batch: bool,
    pub batch_size: usize,
    pub git_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_interval: Duration,
    pub http_retry_budget: Duration,
    pub max_inflight_requests: usize,
}

/// Command-line options.
#[derive(Parser, Debug)]
#[command(name = "mr-lander", version, about = "Merge-request automation bot for GitLab")]
pub struct Options {
    /// Path to a TOML config file; flags and environment override it.
    #[arg(long, env = "MRL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bearer token for the GitLab API.
    #[arg(long, env = "MRL_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// File containing the bearer token (preferred over --auth-token).
    #[arg(long, env = "MRL_AUTH_TOKEN_FILE")]
    pub auth_token_file: Option<PathBuf>,

    /// Base URL of the GitLab instance, e.g. https://gitlab.example.com
    #[arg(long, env = "MRL_GITLAB_URL")]
    pub gitlab_url: Option<String>,

    /// SSH identity used for git pushes; required unless --use-https.
    #[arg(long, env = "MRL_SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    /// Push over HTTPS with the auth token instead of SSH.
    #[arg(long, env = "MRL_USE_HTTPS")]
    pub use_https: bool,

    /// Only consider projects whose path_with_namespace matches.
    #[arg(long, env = "MRL_PROJECT_REGEXP")]
    pub project_regexp: Option<String>,

    /// Only consider MRs whose target branch matches.
    #[arg(long, env = "MRL_BRANCH_REGEXP")]
    pub branch_regexp: Option<String>,

    /// Only consider MRs whose source branch matches.
    #[arg(long, env = "MRL_SOURCE_BRANCH_REGEXP")]
    pub source_branch_regexp: Option<String>,

    /// Order in which assigned MRs are attempted.
    #[arg(long, value_enum, env = "MRL_MERGE_ORDER")]
    pub merge_order: Option<MergeOrder>,

    /// Append Tested-by trailers to merged commits.
    #[arg(long, env = "MRL_ADD_TESTED")]
    pub add_tested: bool,

    /// Append Reviewed-by trailers (requires approvers with public emails).
    #[arg(long, env = "MRL_ADD_REVIEWERS")]
    pub add_reviewers: bool,

    /// Append a Part-of trailer pointing at the MR.
    #[arg(long, env = "MRL_ADD_PART_OF")]
    pub add_part_of: bool,

    /// Re-approve as each approver (sudo) after a push resets approvals.
    #[arg(long, env = "MRL_IMPERSONATE_APPROVERS")]
    pub impersonate_approvers: bool,

    /// Seconds to wait for approvals to reset after a push.
    #[arg(long, env = "MRL_APPROVAL_RESET_TIMEOUT")]
    pub approval_reset_timeout: Option<u64>,

    /// Weekly windows during which no merges happen,
    /// e.g. "Fri 18:00 - Mon 09:00".
    #[arg(long, env = "MRL_EMBARGO")]
    pub embargo: Option<String>,

    /// Maximum seconds to wait for CI per MR.
    #[arg(long, env = "MRL_CI_TIMEOUT")]
    pub ci_timeout: Option<u64>,

    /// Wait for a successful pipeline even if the project does not demand it.
    #[arg(long, env = "MRL_REQUIRE_SUCCESSFUL_CI")]
    pub require_successful_ci: bool,

    /// Treat a skipped pipeline as a failure instead of a success.
    #[arg(long, env = "MRL_CI_SKIPPED_IS_FAILURE")]
    pub ci_skipped_is_failure: bool,

    /// Force platform-side merge commits even for ff-capable projects.
    #[arg(long, env = "MRL_USE_MERGE_STRATEGY")]
    pub use_merge_strategy: bool,

    /// Use the platform's rebase endpoint instead of the local worktree.
    #[arg(long, env = "MRL_REBASE_REMOTELY")]
    pub rebase_remotely: bool,

    /// Speculatively pre-merge several MRs and validate them with one CI run.
    #[arg(long, env = "MRL_BATCH")]
    pub batch: bool,

    /// Maximum MRs per batch.
    #[arg(long, env = "MRL_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Push batch branches with `-o ci.skip`.
    #[arg(long, env = "MRL_BATCH_SKIP_CI")]
    pub batch_skip_ci: bool,

    /// Seconds between candidate scans on an active project.
    #[arg(long, env = "MRL_POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// Seconds between candidate scans when nothing is assigned.
    #[arg(long, env = "MRL_IDLE_INTERVAL")]
    pub idle_interval: Option<u64>,

    /// Timeout in seconds for individual git subprocesses.
    #[arg(long, env = "MRL_GIT_TIMEOUT")]
    pub git_timeout: Option<u64>,

    /// Log level (off, error, warn, info, debug, trace).
    #[arg(long, env = "MRL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// TOML config file layer; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub auth_token: Option<String>,
    pub auth_token_file: Option<PathBuf>,
    pub gitlab_url: Option<String>,
    pub ssh_key_file: Option<PathBuf>,
    pub use_https: Option<bool>,
    pub project_regexp: Option<String>,
    pub branch_regexp: Option<String>,
    pub source_branch_regexp: Option<String>,
    pub merge_order: Option<MergeOrder>,
    pub add_tested: Option<bool>,
    pub add_reviewers: Option<bool>,
    pub add_part_of: Option<bool>,
    pub impersonate_approvers: Option<bool>,
    pub approval_reset_timeout: Option<u64>,
    pub embargo: Option<String>,
    pub ci_timeout: Option<u64>,
    pub require_successful_ci: Option<bool>,
    pub ci_skipped_is_failure: Option<bool>,
    pub use_merge_strategy: Option<bool>,
    pub rebase_remotely: Option<bool>,
    pub batch: Option<bool>,
    pub batch_size: Option<usize>,
    pub batch_skip_ci: Option<bool>,
    pub poll_interval: Option<u64>,
    pub idle_interval: Option<u64>,
    pub git_timeout: Option<u64>,
}

impl ConfigFile {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, BotError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BotError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            BotError::config(format!("cannot parse config file {}: {}", path.display(), e))
        })
    }
}

impl BotConfig {
    /// Assemble the final configuration from flags/env and the file layer.
    pub fn assemble(opts: Options) -> Result<Self, BotError> {
        let file = match &opts.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let gitlab_url = opts
            .gitlab_url
            .or(file.gitlab_url)
            .ok_or_else(|| BotError::config("--gitlab-url is required"))?
            .trim_end_matches('/')
            .to_string();

        let auth_token = resolve_token(
            opts.auth_token.or(file.auth_token),
            opts.auth_token_file.or(file.auth_token_file),
        )?;

        let use_https = opts.use_https || file.use_https.unwrap_or(false);
        let ssh_key_file = opts.ssh_key_file.or(file.ssh_key_file);
        if !use_https && ssh_key_file.is_none() {
            return Err(BotError::config(
                "--ssh-key-file is required unless --use-https is set",
            ));
        }

        let use_merge_strategy = opts.use_merge_strategy || file.use_merge_strategy.unwrap_or(false);
        let rebase_remotely = opts.rebase_remotely || file.rebase_remotely.unwrap_or(false);
        if use_merge_strategy && rebase_remotely {
            return Err(BotError::config(
                "--use-merge-strategy and --rebase-remotely are mutually exclusive",
            ));
        }
        let strategy = if use_merge_strategy {
            MergeStrategy::Merge
        } else if rebase_remotely {
            MergeStrategy::GitlabRebase
        } else {
            MergeStrategy::Rebase
        };

        let embargo = match opts.embargo.or(file.embargo) {
            Some(spec) => IntervalUnion::from_human(&spec)?,
            None => IntervalUnion::empty(),
        };

        let merge_opts = MergeOptions {
            strategy,
            add_tested: opts.add_tested || file.add_tested.unwrap_or(false),
            add_part_of: opts.add_part_of || file.add_part_of.unwrap_or(false),
            add_reviewers: opts.add_reviewers || file.add_reviewers.unwrap_or(false),
            impersonate_approvers: opts.impersonate_approvers
                || file.impersonate_approvers.unwrap_or(false),
            approval_reset_timeout: Duration::from_secs(
                opts.approval_reset_timeout
                    .or(file.approval_reset_timeout)
                    .unwrap_or(0),
            ),
            embargo,
            ci_timeout: Duration::from_secs(
                opts.ci_timeout.or(file.ci_timeout).unwrap_or(DEFAULT_CI_TIMEOUT_SECS),
            ),
            rebase_timeout: Duration::from_secs(DEFAULT_REBASE_TIMEOUT_SECS),
            require_successful_ci: opts.require_successful_ci
                || file.require_successful_ci.unwrap_or(false),
            ci_skipped_is_success: !(opts.ci_skipped_is_failure
                || file.ci_skipped_is_failure.unwrap_or(false)),
            batch_skip_ci: opts.batch_skip_ci || file.batch_skip_ci.unwrap_or(false),
        };

        if merge_opts.requests_commit_tagging() && strategy != MergeStrategy::Rebase {
            return Err(BotError::config(
                "trailer options need the local rebase strategy \
                 (platform-side merges and rebases cannot rewrite commit messages)",
            ));
        }

        Ok(Self {
            gitlab_url,
            auth_token,
            use_https,
            ssh_key_file,
            project_regexp: compile_regexp(
                "project-regexp",
                opts.project_regexp.or(file.project_regexp),
            )?,
            branch_regexp: compile_regexp("branch-regexp", opts.branch_regexp.or(file.branch_regexp))?,
            source_branch_regexp: compile_regexp(
                "source-branch-regexp",
                opts.source_branch_regexp.or(file.source_branch_regexp),
            )?,
            merge_order: opts
                .merge_order
                .or(file.merge_order)
                .unwrap_or(MergeOrder::CreatedAt),
            merge_opts,
            batch: opts.batch || file.batch.unwrap_or(false),
            batch_size: opts.batch_size.or(file.batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
            git_timeout: Duration::from_secs(
                opts.git_timeout.or(file.git_timeout).unwrap_or(DEFAULT_GIT_TIMEOUT_SECS),
            ),
            poll_interval: Duration::from_secs(
                opts.poll_interval
                    .or(file.poll_interval)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            idle_interval: Duration::from_secs(
                opts.idle_interval
                    .or(file.idle_interval)
                    .unwrap_or(DEFAULT_IDLE_INTERVAL_SECS),
            ),
            http_retry_budget: Duration::from_secs(DEFAULT_HTTP_RETRY_BUDGET_SECS),
            max_inflight_requests: DEFAULT_MAX_INFLIGHT_REQUESTS,
        })
    }
}

fn resolve_token(
    token: Option<String>,
    token_file: Option<PathBuf>,
) -> Result<String, BotError> {
    // The file wins when both are given; a flag-visible token is worse than a
    // file-permission-guarded one.
    if let Some(path) = token_file {
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            BotError::config(format!("cannot read auth token file {}: {}", path.display(), e))
        })?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BotError::config(format!(
                "auth token file {} is empty",
                path.display()
            )));
        }
        return Ok(trimmed.to_string());
    }
    token.ok_or_else(|| BotError::config("--auth-token or --auth-token-file is required"))
}

fn compile_regexp(name: &str, pattern: Option<String>) -> Result<Regex, BotError> {
    let pattern = pattern.unwrap_or_else(|| ".*".to_string());
    Regex::new(&pattern)
        .map_err(|e| BotError::config(format!("invalid --{} {:?}: {}", name, pattern, e)))
}
