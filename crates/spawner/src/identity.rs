//! User identity as supplied by the hub
//!
//! Identity and entitlement are validated upstream by the hub's auth
//! layer; this core trusts them as input.

use serde::{Deserialize, Serialize};

/// A group membership with its numeric gid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

/// Stable identity for one hub user, immutable for a session's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Hub username, the per-session key
    pub username: String,
    /// Numeric uid the lab container runs as
    pub uid: u32,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Optional quota class used to pick resource presets
    #[serde(default)]
    pub quota_class: Option<String>,
}

impl UserIdentity {
    pub fn new(username: impl Into<String>, uid: u32) -> Self {
        Self {
            username: username.into(),
            uid,
            groups: Vec::new(),
            quota_class: None,
        }
    }

    /// Comma separated `name:gid` list passed to the lab environment
    ///
    /// Example: `"group1:1000,group2:1001"`
    pub fn external_groups(&self) -> String {
        self.groups
            .iter()
            .map(|g| format!("{}:{}", g.name, g.gid))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_groups_format() {
        let mut identity = UserIdentity::new("alice", 1000);
        identity.groups = vec![
            Group {
                name: "science".to_string(),
                gid: 2000,
            },
            Group {
                name: "staff".to_string(),
                gid: 2001,
            },
        ];
        assert_eq!(identity.external_groups(), "science:2000,staff:2001");
    }

    #[test]
    fn test_external_groups_empty() {
        let identity = UserIdentity::new("bob", 1001);
        assert_eq!(identity.external_groups(), "");
    }
}
