//! Commit payloads.

use serde::{Deserialize, Serialize};

/// GitLab commit from API (MR commits listing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabCommit {
    pub id: String,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

impl GitLabCommit {
    /// A commit with more than one parent is a merge commit; their presence
    /// makes the MR history non-linear.
    pub fn is_merge_commit(&self) -> bool {
        self.parent_ids.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_commit_detection() {
        let json = r#"{"id": "abc", "parent_ids": ["p1", "p2"]}"#;
        let commit: GitLabCommit = serde_json::from_str(json).unwrap();
        assert!(commit.is_merge_commit());
    }

    #[test]
    fn test_regular_commit() {
        let json = r#"{"id": "abc", "parent_ids": ["p1"], "author_email": "dev@example.com"}"#;
        let commit: GitLabCommit = serde_json::from_str(json).unwrap();
        assert!(!commit.is_merge_commit());
        assert_eq!(commit.author_email.as_deref(), Some("dev@example.com"));
    }
}
