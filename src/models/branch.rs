//! Repository branch payloads.

use serde::{Deserialize, Serialize};

/// Tip commit of a branch, as embedded in branch responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchCommit {
    pub id: String,
}

/// GitLab branch from API (GET /projects/:id/repository/branches/:name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabBranch {
    pub name: String,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub developers_can_push: Option<bool>,
    #[serde(default)]
    pub commit: Option<BranchCommit>,
}

impl GitLabBranch {
    /// Whether a developer-level account (the bot) may push to this branch.
    pub fn pushable_by_developers(&self) -> bool {
        !self.protected || self.developers_can_push.unwrap_or(false)
    }

    pub fn tip(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| c.id.as_str())
    }
}
