//! GitLab API capability trait.
//!
//! Jobs and loops talk to the platform exclusively through [`GitlabApi`] so
//! tests can substitute an in-memory fake. [`super::gitlab_client::GitLabClient`]
//! is the production implementation.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BotError;
use crate::models::{
    GitLabBranch, GitLabCommit, GitLabMergeRequest, GitLabPipeline, GitLabProject, GitLabUser,
    MergeRequestApprovals,
};

/// Parameters for the conditional merge (accept) call.
///
/// `sha` pins the merge to the exact head we validated; the platform refuses
/// with a conflict if the MR moved.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptParams {
    pub sha: String,
    pub should_remove_source_branch: bool,
    pub merge_when_pipeline_succeeds: bool,
    pub squash: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squash_commit_message: Option<String>,
}

/// A note (comment) on an MR; used to reconstruct assignment times.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MrNote {
    pub body: String,
    pub created_at: String,
}

/// Typed operations against the platform.
///
/// List operations hide pagination and always return complete finite vectors.
/// Transient upstream failures are retried internally; what escapes is either
/// a definitive answer or one of the error kinds in [`BotError`].
#[async_trait]
pub trait GitlabApi: Send + Sync {
    /// The user the auth token belongs to.
    async fn current_user(&self) -> Result<GitLabUser, BotError>;

    async fn user_by_id(&self, user_id: i64) -> Result<GitLabUser, BotError>;

    /// Projects the bot is a member of, with merge requests enabled.
    async fn list_projects(&self) -> Result<Vec<GitLabProject>, BotError>;

    async fn get_project(&self, project_id: i64) -> Result<GitLabProject, BotError>;

    /// All open MRs on the project, oldest first.
    async fn list_open_mrs(&self, project_id: i64) -> Result<Vec<GitLabMergeRequest>, BotError>;

    async fn get_mr(&self, project_id: i64, mr_iid: i64)
        -> Result<GitLabMergeRequest, BotError>;

    async fn list_mr_commits(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<Vec<GitLabCommit>, BotError>;

    async fn list_mr_notes(&self, project_id: i64, mr_iid: i64)
        -> Result<Vec<MrNote>, BotError>;

    /// Pipelines for a specific commit, newest first.
    async fn list_pipelines(
        &self,
        project_id: i64,
        sha: &str,
    ) -> Result<Vec<GitLabPipeline>, BotError>;

    async fn get_approvals(
        &self,
        project_id: i64,
        mr_iid: i64,
    ) -> Result<MergeRequestApprovals, BotError>;

    async fn get_branch(&self, project_id: i64, branch: &str)
        -> Result<GitLabBranch, BotError>;

    async fn delete_branch(&self, project_id: i64, branch: &str) -> Result<(), BotError>;

    /// Post a plain-text comment on the MR.
    async fn comment(&self, project_id: i64, mr_iid: i64, body: &str) -> Result<(), BotError>;

    /// Replace the MR's assignees; an empty slice unassigns everyone.
    async fn set_assignees(
        &self,
        project_id: i64,
        mr_iid: i64,
        assignee_ids: &[i64],
    ) -> Result<(), BotError>;

    /// Conditional merge. Refusals surface as `BotError::MergeRefused`.
    async fn accept_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
        params: &AcceptParams,
    ) -> Result<GitLabMergeRequest, BotError>;

    /// Trigger a platform-side rebase of the MR's source branch.
    async fn rebase_mr(&self, project_id: i64, mr_iid: i64) -> Result<(), BotError>;

    /// Approve the MR, optionally impersonating another user via sudo.
    async fn approve_mr(
        &self,
        project_id: i64,
        mr_iid: i64,
        sudo_user_id: Option<i64>,
    ) -> Result<(), BotError>;
}
