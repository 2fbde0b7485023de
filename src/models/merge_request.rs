//! GitLab merge request payloads.

use serde::{Deserialize, Serialize};

use super::user::GitLabUser;

/// GitLab merge request from API.
///
/// Fetched with `include_rebase_in_progress=true` so `rebase_in_progress` is
/// populated; list endpoints omit it, hence the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabMergeRequest {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,
    pub source_project_id: i64,
    #[serde(default)]
    pub target_project_id: Option<i64>,
    pub title: String,
    pub state: String,
    pub source_branch: String,
    pub target_branch: String,
    /// Head commit of the source branch; null for MRs without commits.
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub work_in_progress: bool,
    #[serde(default)]
    pub squash: bool,
    pub web_url: String,
    pub author: GitLabUser,
    #[serde(default)]
    pub assignees: Vec<GitLabUser>,
    #[serde(default)]
    pub merge_status: Option<String>,
    #[serde(default)]
    pub merge_error: Option<String>,
    #[serde(default)]
    pub rebase_in_progress: bool,
    #[serde(default)]
    pub blocking_discussions_resolved: Option<bool>,
    #[serde(default)]
    pub force_remove_source_branch: Option<bool>,
    #[serde(default)]
    pub should_remove_source_branch: Option<bool>,
}

impl GitLabMergeRequest {
    pub fn is_open(&self) -> bool {
        matches!(self.state.as_str(), "opened" | "reopened" | "locked")
    }

    pub fn assignee_ids(&self) -> Vec<i64> {
        self.assignees.iter().map(|a| a.id).collect()
    }

    pub fn is_assigned_to(&self, user_id: i64) -> bool {
        self.assignees.iter().any(|a| a.id == user_id)
    }

    /// Whether this MR comes from a forked source project.
    ///
    /// `project_id` on an MR payload is always the target project.
    pub fn is_from_fork(&self) -> bool {
        self.source_project_id != self.project_id
    }

    /// Whether the source branch should be deleted after merging.
    pub fn wants_source_branch_removed(&self) -> bool {
        self.should_remove_source_branch
            .or(self.force_remove_source_branch)
            .unwrap_or(false)
    }

    pub fn blocking_discussions_resolved(&self) -> bool {
        self.blocking_discussions_resolved.unwrap_or(true)
    }
}
