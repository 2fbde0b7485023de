//! GitLab project payloads.

use serde::{Deserialize, Serialize};

/// How the project integrates merge requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Merge commit created by the platform.
    Merge,
    /// Merge commit with semi-linear history; source must be rebased first.
    RebaseMerge,
    /// Fast-forward only; no merge commits.
    Ff,
}

/// Project-level squash policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquashOption {
    Always,
    DefaultOff,
    DefaultOn,
    Never,
}

/// GitLab project from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabProject {
    pub id: i64,
    pub path_with_namespace: String,
    pub default_branch: String,
    pub ssh_url_to_repo: String,
    pub http_url_to_repo: String,
    #[serde(default = "default_merge_method")]
    pub merge_method: MergeMethod,
    #[serde(default)]
    pub only_allow_merge_if_pipeline_succeeds: bool,
    #[serde(default)]
    pub only_allow_merge_if_all_discussions_are_resolved: bool,
    #[serde(default)]
    pub squash_option: Option<SquashOption>,
    #[serde(default)]
    pub remove_source_branch_after_merge: Option<bool>,
}

fn default_merge_method() -> MergeMethod {
    MergeMethod::Merge
}

impl GitLabProject {
    /// Whether the platform will only ever fast-forward this project's MRs.
    pub fn is_fast_forward(&self) -> bool {
        self.merge_method == MergeMethod::Ff
    }

    /// Whether MR sources must sit on top of the target before merging.
    pub fn requires_linear_history(&self) -> bool {
        matches!(self.merge_method, MergeMethod::RebaseMerge | MergeMethod::Ff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_project() {
        let json = r#"{
            "id": 1234,
            "path_with_namespace": "group/widget",
            "default_branch": "main",
            "ssh_url_to_repo": "git@gitlab.example.com:group/widget.git",
            "http_url_to_repo": "https://gitlab.example.com/group/widget.git",
            "merge_method": "ff",
            "only_allow_merge_if_pipeline_succeeds": true,
            "squash_option": "default_off"
        }"#;
        let project: GitLabProject = serde_json::from_str(json).unwrap();
        assert_eq!(project.merge_method, MergeMethod::Ff);
        assert!(project.is_fast_forward());
        assert!(project.requires_linear_history());
        assert_eq!(project.squash_option, Some(SquashOption::DefaultOff));
        assert!(!project.only_allow_merge_if_all_discussions_are_resolved);
    }

    #[test]
    fn test_missing_merge_method_defaults_to_merge() {
        let json = r#"{
            "id": 1,
            "path_with_namespace": "a/b",
            "default_branch": "master",
            "ssh_url_to_repo": "git@h:a/b.git",
            "http_url_to_repo": "https://h/a/b.git"
        }"#;
        let project: GitLabProject = serde_json::from_str(json).unwrap();
        assert_eq!(project.merge_method, MergeMethod::Merge);
        assert!(!project.requires_linear_history());
    }
}
