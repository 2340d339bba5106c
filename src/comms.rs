// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Workspace-level facade over authentication, sanitization, and handoffs.
//!
//! One [`CommsManager`] is created per workspace and threaded through
//! callers explicitly; there are no global singletons. Construction runs a
//! synchronous initialization phase that mints the SYSTEM admin token before
//! the value is returned, so internal operations never race a half-built
//! authentication layer.
//!
//! In-process callers that own this value may omit a token on handoff
//! operations and the SYSTEM token is used on their behalf. External entry
//! points must always pass an explicit token.

use chrono::Duration;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::{AuthConfig, AuthManager, TokenInfo};
use crate::error::SecurityError;
use crate::handoff::{AccessControl, HandoffRecord, HandoffStore};
use crate::sanitize::{InputSanitizer, SanitizationStats};
use crate::token::{AgentToken, Permission, Role};

/// Snapshot of the authentication system state.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub enabled: bool,
    pub has_system_token: bool,
    pub workspace: String,
    pub auth_directory: Option<String>,
}

/// Manages structured communication between agents for one workspace.
pub struct CommsManager {
    workspace_dir: PathBuf,
    sanitizer: Arc<InputSanitizer>,
    auth_manager: Option<Arc<AuthManager>>,
    handoff_store: HandoffStore,
    system_token: Option<AgentToken>,
}

impl CommsManager {
    /// Build the manager and synchronously mint the SYSTEM token.
    pub fn new(workspace_dir: &Path, config: AuthConfig) -> Result<Self, SecurityError> {
        fs::create_dir_all(workspace_dir)?;
        let workspace_dir = fs::canonicalize(workspace_dir)?;

        let sanitizer = Arc::new(InputSanitizer::new());
        let auth_manager = if config.enable_auth {
            Some(Arc::new(AuthManager::new(&workspace_dir, config)?))
        } else {
            None
        };

        let access = auth_manager
            .clone()
            .map(|manager| manager as Arc<dyn AccessControl>);
        let handoff_store = HandoffStore::new(&workspace_dir, access, Arc::clone(&sanitizer))?;

        let mut manager = Self {
            workspace_dir,
            sanitizer,
            auth_manager,
            handoff_store,
            system_token: None,
        };
        manager.initialize()?;
        Ok(manager)
    }

    /// Open a workspace with default configuration.
    pub fn open(workspace_dir: &Path) -> Result<Self, SecurityError> {
        Self::new(workspace_dir, AuthConfig::default())
    }

    // Mints the SYSTEM admin token used for internal operations. Runs before
    // the constructor returns so the first request never observes a missing
    // system token.
    fn initialize(&mut self) -> Result<(), SecurityError> {
        if let Some(auth) = &self.auth_manager {
            let mut metadata = HashMap::new();
            metadata.insert("type".to_string(), serde_json::json!("system"));
            metadata.insert("created_by".to_string(), serde_json::json!("CommsManager"));

            let token = auth.create_token("SYSTEM", Role::Admin, None, None, Some(metadata))?;
            self.system_token = Some(token);
            tracing::info!(
                target: "security::comms",
                "System token created for internal operations"
            );
        }
        Ok(())
    }

    /// Workspace root.
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// The SYSTEM token, when authentication is enabled.
    pub fn system_token(&self) -> Option<&AgentToken> {
        self.system_token.as_ref()
    }

    /// Create a new authentication token for an agent.
    ///
    /// When `admin_token` is supplied it must carry MANAGE_TOKENS. Omitting
    /// it is reserved for in-process callers that own this manager.
    pub fn create_token(
        &self,
        agent_id: &str,
        role: Role,
        admin_token: Option<&str>,
        custom_permissions: Option<Vec<Permission>>,
        lifetime: Option<Duration>,
    ) -> Result<AgentToken, SecurityError> {
        let auth = self.auth()?;

        if let Some(admin_token) = admin_token {
            let token = auth
                .authenticate(admin_token)
                .ok_or(SecurityError::AuthenticationFailed)?;
            if !auth.authorize(&token, Permission::ManageTokens, None) {
                return Err(SecurityError::AuthorizationFailed {
                    permission: Permission::ManageTokens,
                });
            }
        }

        auth.create_token(agent_id, role, custom_permissions, lifetime, None)
    }

    /// Authenticate a signed token string.
    pub fn authenticate(&self, token_str: &str) -> Result<Option<AgentToken>, SecurityError> {
        Ok(self.auth()?.authenticate(token_str))
    }

    /// Authorize an action for an authenticated token.
    pub fn authorize(
        &self,
        token: &AgentToken,
        permission: Permission,
        resource: Option<&str>,
    ) -> Result<bool, SecurityError> {
        Ok(self.auth()?.authorize(token, permission, resource))
    }

    /// Exchange a refresh secret for a new token.
    pub fn refresh_token(&self, refresh_str: &str) -> Result<Option<AgentToken>, SecurityError> {
        self.auth()?.refresh_token(refresh_str)
    }

    /// Revoke a token. With an `admin_token`, the caller must hold
    /// MANAGE_TOKENS and is recorded as the revoking actor; otherwise the
    /// revocation is attributed to SYSTEM.
    pub fn revoke_token(
        &self,
        token_to_revoke: &str,
        admin_token: Option<&str>,
    ) -> Result<(), SecurityError> {
        let auth = self.auth()?;

        let actor = match admin_token {
            Some(admin_token) => {
                let token = auth
                    .authenticate(admin_token)
                    .ok_or(SecurityError::AuthenticationFailed)?;
                if !auth.authorize(&token, Permission::ManageTokens, None) {
                    return Err(SecurityError::AuthorizationFailed {
                        permission: Permission::ManageTokens,
                    });
                }
                token.agent_id
            }
            None => "SYSTEM".to_string(),
        };

        auth.revoke_token(token_to_revoke, Some(&actor))
    }

    /// Change an agent's role across all of its active tokens.
    pub fn update_permissions(
        &self,
        agent_id: &str,
        new_role: Role,
        admin_token: &str,
    ) -> Result<bool, SecurityError> {
        let auth = self.auth()?;
        let token = auth
            .authenticate(admin_token)
            .ok_or(SecurityError::AuthenticationFailed)?;
        auth.update_permissions(agent_id, new_role, &token)
    }

    /// Validate a token and return its public information.
    pub fn validate_token(&self, token_str: &str) -> Result<Option<TokenInfo>, SecurityError> {
        Ok(self.auth()?.validate_token(token_str))
    }

    /// Create a handoff. Without an explicit token, the SYSTEM token is used
    /// on behalf of the in-process caller.
    pub fn create_handoff(
        &self,
        from_agent: &str,
        to_agent: &str,
        handoff_type: &str,
        data: &serde_json::Value,
        instructions: &str,
        auth_token: Option<&str>,
    ) -> Result<String, SecurityError> {
        let token = auth_token.or(self.system_token_str());
        self.handoff_store
            .create_handoff(from_agent, to_agent, handoff_type, data, instructions, token)
    }

    /// Read a handoff record.
    pub fn read_handoff(
        &self,
        handoff_id: &str,
        auth_token: Option<&str>,
    ) -> Result<Option<HandoffRecord>, SecurityError> {
        let token = auth_token.or(self.system_token_str());
        self.handoff_store.read_handoff(handoff_id, token)
    }

    /// List handoff ids, optionally filtered by involved agent.
    pub fn list_handoffs(
        &self,
        agent_name: Option<&str>,
        auth_token: Option<&str>,
    ) -> Result<Vec<String>, SecurityError> {
        let token = auth_token.or(self.system_token_str());
        self.handoff_store.list_handoffs(agent_name, token)
    }

    /// Current authentication system status.
    pub fn get_auth_status(&self) -> AuthStatus {
        AuthStatus {
            enabled: self.auth_manager.is_some(),
            has_system_token: self.system_token.is_some(),
            workspace: self.workspace_dir.display().to_string(),
            auth_directory: self
                .auth_manager
                .as_ref()
                .map(|auth| auth.auth_dir().display().to_string()),
        }
    }

    /// Sanitization statistics for security monitoring.
    pub fn get_sanitization_stats(&self) -> SanitizationStats {
        self.sanitizer.stats()
    }

    /// Reset sanitization statistics after exporting them.
    pub fn reset_sanitization_stats(&self) {
        self.sanitizer.reset_stats();
    }

    /// Remove expired tokens. Returns the count removed.
    pub fn cleanup_expired(&self) -> Result<usize, SecurityError> {
        self.auth()?.cleanup_expired()
    }

    /// Snapshot of active tokens, for listings.
    pub fn active_tokens(&self) -> Result<Vec<AgentToken>, SecurityError> {
        Ok(self.auth()?.active_tokens())
    }

    /// Path of the audit log, when authentication is enabled.
    pub fn audit_path(&self) -> Option<&PathBuf> {
        self.auth_manager.as_ref().map(|auth| auth.audit_path())
    }

    fn auth(&self) -> Result<&Arc<AuthManager>, SecurityError> {
        self.auth_manager.as_ref().ok_or(SecurityError::AuthDisabled)
    }

    fn system_token_str(&self) -> Option<&str> {
        self.system_token.as_ref().map(|t| t.token.as_str())
    }
}
