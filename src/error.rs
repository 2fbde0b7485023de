//! Error types for the merge bot.
//!
//! Every lower-level failure (HTTP, git subprocess, platform refusal) is
//! represented here; jobs fold these into a `JobOutcome` at their boundary so
//! nothing but outcomes ever reaches the project loop.

use thiserror::Error;

/// Why the platform refused an `accept` (merge) call.
///
/// These are precondition failures, never retried at the client level; the
/// job state machine decides whether to requeue or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRefusal {
    /// 409: the MR head moved since we pushed (new commits, manual rebase).
    ShaMismatch,
    /// 405: the platform considers the MR unmergeable right now.
    NotMergeable,
    /// 406: the branch cannot be merged (conflicts).
    BranchCannotBeMerged,
    /// 422 with a pipeline message: pipeline must succeed first.
    PipelineNotSucceeded,
    /// Anything else the platform said.
    Other(String),
}

impl std::fmt::Display for MergeRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShaMismatch => write!(f, "the merge request changed while I was working on it"),
            Self::NotMergeable => write!(f, "GitLab refused to merge (not mergeable)"),
            Self::BranchCannotBeMerged => write!(f, "the branch cannot be merged"),
            Self::PipelineNotSucceeded => write!(f, "the pipeline has not succeeded"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Bot-level errors.
#[derive(Debug, Error)]
pub enum BotError {
    /// Fatal configuration problem; aborts the process with a non-zero exit.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transient upstream failure that survived the retry budget.
    #[error("Network error: {message}")]
    Network { message: String },

    /// GitLab API request failed with a non-transient status.
    #[error("GitLab API error: {message}")]
    Api {
        message: String,
        status_code: Option<u16>,
        endpoint: Option<String>,
    },

    /// 401/403; never retried.
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// The merge call was refused by the platform.
    #[error("Merge refused: {refusal}")]
    MergeRefused { refusal: MergeRefusal },

    /// A git subprocess returned non-zero.
    #[error("Git error: {message}")]
    Git { message: String, stderr: String },

    /// Rebase (or merge) hit conflicts; the worktree has been cleaned up.
    #[error("Rebase conflict")]
    RebaseConflict { stderr: String },

    /// A conditional push found the remote no longer where we expected it.
    #[error("Remote branch {branch} moved since we last fetched")]
    RemoteMoved { branch: String },

    /// A bounded wait ran out.
    #[error("Timed out {waiting_for}")]
    Timeout { waiting_for: String },

    /// Shutdown requested; silent, no comments, no mutations.
    #[error("Cancelled")]
    Cancelled,
}

impl BotError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a network (transient upstream) error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create an API error without request context.
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            status_code: None,
            endpoint: None,
        }
    }

    /// Create an API error with status code and endpoint.
    pub fn api_full(
        message: impl Into<String>,
        status_code: u16,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::Api {
            message: message.into(),
            status_code: Some(status_code),
            endpoint: Some(endpoint.into()),
        }
    }

    /// Create an authorization error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a git subprocess error carrying stderr.
    pub fn git(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Git {
            message: message.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(waiting_for: impl Into<String>) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.into(),
        }
    }

    /// Whether this failure is worth retrying later (the MR stays a candidate).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Whether this is the silent shutdown signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// Conversions from common error types

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("Request timed out")
        } else if err.is_connect() {
            Self::network("Failed to connect to server")
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        Self::api(format!("Failed to parse response: {}", err))
    }
}
