//! GitLab user payloads.

use serde::{Deserialize, Serialize};

/// GitLab user from API.
///
/// The `email` field is only visible to admins and to the user themselves;
/// trailer generation must handle its absence explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabUser {
    pub id: i64,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Only present on `GET /user` responses.
    #[serde(default)]
    pub is_admin: Option<bool>,
}

impl GitLabUser {
    pub fn is_admin(&self) -> bool {
        self.is_admin.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_user() {
        let json = r#"{"id": 7, "username": "marge", "name": "Marge Bot"}"#;
        let user: GitLabUser = serde_json::from_str(json).unwrap();
        assert_eq!(user.id, 7);
        assert_eq!(user.username, "marge");
        assert!(user.email.is_none());
        assert!(!user.is_admin());
    }
}
