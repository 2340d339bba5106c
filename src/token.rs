// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Agent tokens, permissions, and role definitions.
//!
//! A token is an opaque signed capability of the form `{random}.{hex-hmac}`
//! that references a role and a permission set. Roles carry fixed default
//! permission sets; individual tokens may override them at mint time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Fine-grained agent permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Read,
    Write,
    Execute,
    Admin,
    CreateHandoff,
    ReadHandoff,
    DeleteHandoff,
    ModifyConfig,
    ViewLogs,
    ManageTokens,
}

impl Permission {
    /// Every permission, in declaration order.
    pub fn all() -> [Permission; 10] {
        [
            Permission::Read,
            Permission::Write,
            Permission::Execute,
            Permission::Admin,
            Permission::CreateHandoff,
            Permission::ReadHandoff,
            Permission::DeleteHandoff,
            Permission::ModifyConfig,
            Permission::ViewLogs,
            Permission::ManageTokens,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "READ",
            Permission::Write => "WRITE",
            Permission::Execute => "EXECUTE",
            Permission::Admin => "ADMIN",
            Permission::CreateHandoff => "CREATE_HANDOFF",
            Permission::ReadHandoff => "READ_HANDOFF",
            Permission::DeleteHandoff => "DELETE_HANDOFF",
            Permission::ModifyConfig => "MODIFY_CONFIG",
            Permission::ViewLogs => "VIEW_LOGS",
            Permission::ManageTokens => "MANAGE_TOKENS",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Ok(Permission::Read),
            "WRITE" => Ok(Permission::Write),
            "EXECUTE" => Ok(Permission::Execute),
            "ADMIN" => Ok(Permission::Admin),
            "CREATE_HANDOFF" => Ok(Permission::CreateHandoff),
            "READ_HANDOFF" => Ok(Permission::ReadHandoff),
            "DELETE_HANDOFF" => Ok(Permission::DeleteHandoff),
            "MODIFY_CONFIG" => Ok(Permission::ModifyConfig),
            "VIEW_LOGS" => Ok(Permission::ViewLogs),
            "MANAGE_TOKENS" => Ok(Permission::ManageTokens),
            other => Err(format!("unknown permission: {}", other)),
        }
    }
}

/// Agent roles with predefined permission sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Orchestrator,
    Specialist,
    Reviewer,
    Observer,
    Guest,
}

impl Role {
    /// Every role, in declaration order.
    pub fn all() -> [Role; 6] {
        [
            Role::Admin,
            Role::Orchestrator,
            Role::Specialist,
            Role::Reviewer,
            Role::Observer,
            Role::Guest,
        ]
    }

    /// The fixed permission set granted to freshly minted tokens of this role.
    pub fn permissions(&self) -> Vec<Permission> {
        match self {
            Role::Admin => Permission::all().to_vec(),
            Role::Orchestrator => vec![
                Permission::Read,
                Permission::Write,
                Permission::Execute,
                Permission::CreateHandoff,
                Permission::ReadHandoff,
                Permission::DeleteHandoff,
                Permission::ViewLogs,
            ],
            Role::Specialist => vec![
                Permission::Read,
                Permission::Write,
                Permission::Execute,
                Permission::CreateHandoff,
                Permission::ReadHandoff,
            ],
            Role::Reviewer => vec![
                Permission::Read,
                Permission::ReadHandoff,
                Permission::ViewLogs,
            ],
            Role::Observer => vec![Permission::Read, Permission::ViewLogs],
            Role::Guest => vec![Permission::Read],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Orchestrator => "ORCHESTRATOR",
            Role::Specialist => "SPECIALIST",
            Role::Reviewer => "REVIEWER",
            Role::Observer => "OBSERVER",
            Role::Guest => "GUEST",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "ORCHESTRATOR" => Ok(Role::Orchestrator),
            "SPECIALIST" => Ok(Role::Specialist),
            "REVIEWER" => Ok(Role::Reviewer),
            "OBSERVER" => Ok(Role::Observer),
            "GUEST" => Ok(Role::Guest),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Secure token for agent authentication.
///
/// Serialized shape is the persistence format of the token store; fields and
/// their order are part of the on-disk contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentToken {
    /// Logical identity of the agent this token was minted for.
    pub agent_id: String,
    /// The signed token string, `{random}.{hex-hmac}`.
    pub token: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    /// `None` means the token never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Issued only for lifetimes longer than one hour.
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
}

impl AgentToken {
    /// Check whether the token has expired.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() > expires_at,
            None => false,
        }
    }

    /// Check whether the token carries a specific permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// First eight characters of the token, for audit lines.
    pub fn preview(&self) -> String {
        token_preview(&self.token)
    }
}

/// Shorten a token string for logging: first eight characters plus ellipsis.
pub fn token_preview(token: &str) -> String {
    let head: String = token.chars().take(8).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_has_all_permissions() {
        let perms = Role::Admin.permissions();
        assert_eq!(perms.len(), 10);
        for p in Permission::all() {
            assert!(perms.contains(&p));
        }
    }

    #[test]
    fn test_specialist_permission_set() {
        let perms = Role::Specialist.permissions();
        assert_eq!(
            perms,
            vec![
                Permission::Read,
                Permission::Write,
                Permission::Execute,
                Permission::CreateHandoff,
                Permission::ReadHandoff,
            ]
        );
    }

    #[test]
    fn test_guest_is_read_only() {
        assert_eq!(Role::Guest.permissions(), vec![Permission::Read]);
    }

    #[test]
    fn test_role_round_trip_via_str() {
        for role in Role::all() {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("wizard".parse::<Role>().is_err());
    }

    #[test]
    fn test_permission_parse_case_insensitive() {
        assert_eq!(
            "create_handoff".parse::<Permission>().unwrap(),
            Permission::CreateHandoff
        );
    }

    #[test]
    fn test_permission_wire_format() {
        let json = serde_json::to_string(&Permission::ManageTokens).unwrap();
        assert_eq!(json, "\"MANAGE_TOKENS\"");
    }

    #[test]
    fn test_token_expiry() {
        let mut token = sample_token();
        assert!(!token.is_expired());

        token.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(token.is_expired());

        token.expires_at = None;
        assert!(!token.is_expired());
    }

    #[test]
    fn test_token_serde_round_trip() {
        let token = sample_token();
        let json = serde_json::to_string(&token).unwrap();
        let back: AgentToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, token.agent_id);
        assert_eq!(back.role, token.role);
        assert_eq!(back.permissions, token.permissions);
        assert_eq!(back.usage_count, token.usage_count);
    }

    #[test]
    fn test_token_preview() {
        assert_eq!(token_preview("abcdefghijklmnop"), "abcdefgh...");
        assert_eq!(token_preview("ab"), "ab...");
    }

    fn sample_token() -> AgentToken {
        AgentToken {
            agent_id: "alice".to_string(),
            token: "raw.signature".to_string(),
            role: Role::Specialist,
            permissions: Role::Specialist.permissions(),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
            refresh_token: None,
            metadata: HashMap::new(),
            last_used: None,
            usage_count: 0,
        }
    }
}
