//! MR approval payloads.

use serde::{Deserialize, Serialize};

use super::user::GitLabUser;

/// User who approved an MR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedBy {
    pub user: GitLabUser,
}

/// Response from the MR approvals endpoint.
///
/// Instances without the approvals feature omit `approvals_left`; treat that
/// as "nothing left".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequestApprovals {
    #[serde(default)]
    pub approvals_required: Option<i64>,
    #[serde(default)]
    pub approvals_left: Option<i64>,
    #[serde(default)]
    pub approved_by: Vec<ApprovedBy>,
}

impl MergeRequestApprovals {
    pub fn approvals_left(&self) -> i64 {
        self.approvals_left.unwrap_or(0)
    }

    /// Whether enough approvals have been collected.
    pub fn sufficient(&self) -> bool {
        self.approvals_left() == 0
    }

    pub fn approver_ids(&self) -> Vec<i64> {
        self.approved_by.iter().map(|a| a.user.id).collect()
    }

    pub fn approver_usernames(&self) -> Vec<String> {
        self.approved_by
            .iter()
            .map(|a| a.user.username.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sufficient_when_none_left() {
        let json = r#"{
            "approvals_required": 1,
            "approvals_left": 0,
            "approved_by": [{"user": {"id": 5, "username": "rev", "name": "Reviewer"}}]
        }"#;
        let approvals: MergeRequestApprovals = serde_json::from_str(json).unwrap();
        assert!(approvals.sufficient());
        assert_eq!(approvals.approver_ids(), vec![5]);
        assert_eq!(approvals.approver_usernames(), vec!["rev"]);
    }

    #[test]
    fn test_insufficient() {
        let json = r#"{"approvals_required": 2, "approvals_left": 1, "approved_by": []}"#;
        let approvals: MergeRequestApprovals = serde_json::from_str(json).unwrap();
        assert!(!approvals.sufficient());
        assert_eq!(approvals.approvals_left(), 1);
    }

    #[test]
    fn test_missing_fields_mean_sufficient() {
        let approvals: MergeRequestApprovals = serde_json::from_str("{}").unwrap();
        assert!(approvals.sufficient());
        assert!(approvals.approver_ids().is_empty());
    }
}
