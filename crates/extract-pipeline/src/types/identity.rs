//! Caller identity as resolved by the auth collaborator

use serde::{Deserialize, Serialize};

/// User role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Professor,
    Diretor,
}

/// Which institutions a non-admin may act on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    All,
    Specific,
}

/// Authenticated caller; `user_id` is the rate-limiting key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub access_level: AccessLevel,
    /// Institution codes permitted under `AccessLevel::Specific`
    #[serde(default)]
    pub allowed_institutions: Vec<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Access check for one institution code
    pub fn can_access(&self, institution_code: &str) -> bool {
        if self.is_admin() || self.access_level == AccessLevel::All {
            return true;
        }
        self.allowed_institutions
            .iter()
            .any(|code| code == institution_code)
    }
}
