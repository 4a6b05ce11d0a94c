//! Who is acting on whose portfolio.
//!
//! Every write takes an [`AccessContext`]; read-only sessions are refused
//! before anything is touched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRole {
    Owner,
    Editor,
    Viewer,
}

impl AccessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessRole::Owner => "owner",
            AccessRole::Editor => "editor",
            AccessRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<AccessRole> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(AccessRole::Owner),
            "editor" => Some(AccessRole::Editor),
            "viewer" => Some(AccessRole::Viewer),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessContext {
    /// Portfolio being read or written.
    pub owner_id: Uuid,
    /// Logged-in user.
    pub actor_id: Uuid,
    pub role: AccessRole,
}

impl AccessContext {
    /// The owner acting on their own portfolio.
    pub fn owner(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            actor_id: owner_id,
            role: AccessRole::Owner,
        }
    }

    pub fn delegated(owner_id: Uuid, actor_id: Uuid, role: AccessRole) -> Self {
        Self {
            owner_id,
            actor_id,
            role,
        }
    }

    /// Read-only when a delegate is not an editor.
    pub fn is_read_only(&self) -> bool {
        self.actor_id != self.owner_id && self.role != AccessRole::Editor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_and_editor_can_write_viewer_cannot() {
        let owner = Uuid::from_u128(1);
        let other = Uuid::from_u128(2);
        assert!(!AccessContext::owner(owner).is_read_only());
        assert!(!AccessContext::delegated(owner, other, AccessRole::Editor).is_read_only());
        assert!(AccessContext::delegated(owner, other, AccessRole::Viewer).is_read_only());
        // A stale role claim on one's own book still writes.
        assert!(!AccessContext::delegated(owner, owner, AccessRole::Viewer).is_read_only());
    }

    #[test]
    fn role_parse_is_case_insensitive() {
        assert_eq!(AccessRole::parse("Editor"), Some(AccessRole::Editor));
        assert_eq!(AccessRole::parse("admin"), None);
    }
}
