// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Authentication and authorization manager.
//!
//! Mints HMAC-signed capability tokens, verifies them with a constant-time
//! signature check, enforces role-based permissions, rotates tokens through
//! refresh secrets, and tracks failed attempts for brute-force lockout.
//!
//! The manager exclusively owns the token store and the audit log for a
//! workspace; other components integrate through the
//! [`AccessControl`](crate::handoff::AccessControl) seam.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::audit::SecurityAuditLog;
use crate::error::SecurityError;
use crate::handoff::AccessControl;
use crate::locks::resilient_lock;
use crate::secret::SecretKey;
use crate::store::TokenStore;
use crate::token::{token_preview, AgentToken, Permission, Role};

/// Configuration for an [`AuthManager`].
///
/// Every recognized option is an explicit field; unknown knobs do not exist.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Externally supplied signing key; when `None`, the workspace key file
    /// is loaded or created.
    pub secret_key: Option<String>,
    /// Lifetime applied when `create_token` is called without one. `None`
    /// mints non-expiring tokens.
    pub default_lifetime: Option<Duration>,
    /// Validity window intended for refresh secrets.
    pub refresh_lifetime: Duration,
    /// Failed attempts within the lockout window before an agent is locked.
    pub max_failed_attempts: usize,
    /// Sliding window for counting failed attempts.
    pub lockout_duration: Duration,
    /// Master switch consumed by the comms facade.
    pub enable_auth: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            default_lifetime: Some(Duration::hours(24)),
            refresh_lifetime: Duration::days(7),
            max_failed_attempts: 5,
            lockout_duration: Duration::minutes(15),
            enable_auth: true,
        }
    }
}

/// Projection of a valid token returned by `validate_token`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub agent_id: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Main authentication and authorization manager for one workspace.
pub struct AuthManager {
    auth_dir: PathBuf,
    token_store: TokenStore,
    audit_log: SecurityAuditLog,
    secret: SecretKey,
    failed_attempts: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    config: AuthConfig,
}

impl AuthManager {
    /// Build the manager for `workspace_dir`, creating the `auth/` tree.
    pub fn new(workspace_dir: &Path, config: AuthConfig) -> Result<Self, SecurityError> {
        let auth_dir = workspace_dir.join("auth");
        std::fs::create_dir_all(&auth_dir)?;

        let token_store = TokenStore::new(&auth_dir.join("tokens"))?;
        let audit_log = SecurityAuditLog::new(&auth_dir.join("audit"))?;
        let secret = match &config.secret_key {
            Some(key) => SecretKey::from_string(key.clone()),
            None => SecretKey::load_or_create(&auth_dir)?,
        };

        Ok(Self {
            auth_dir,
            token_store,
            audit_log,
            secret,
            failed_attempts: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Directory holding the secret, token files, and audit log.
    pub fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }

    /// Path of the audit log file.
    pub fn audit_path(&self) -> &PathBuf {
        self.audit_log.path()
    }

    /// Create a new authentication token for an agent.
    ///
    /// The token body is 32 bytes of CSPRNG output, URL-safe encoded; the
    /// signature is `hex(HMAC-SHA256(secret, body))`. A refresh secret is
    /// issued only for lifetimes longer than one hour.
    pub fn create_token(
        &self,
        agent_id: &str,
        role: Role,
        custom_permissions: Option<Vec<Permission>>,
        lifetime: Option<Duration>,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<AgentToken, SecurityError> {
        let raw = random_urlsafe();
        let signature = self.secret.sign(&raw);
        let token_str = format!("{}.{}", raw, signature);

        let permissions = custom_permissions.unwrap_or_else(|| role.permissions());
        let lifetime = lifetime.or(self.config.default_lifetime);
        let now = Utc::now();
        let expires_at = lifetime.map(|l| now + l);
        let refresh_token = match lifetime {
            Some(l) if l > Duration::hours(1) => Some(random_urlsafe()),
            _ => None,
        };

        let token = AgentToken {
            agent_id: agent_id.to_string(),
            token: token_str,
            role,
            permissions,
            created_at: now,
            expires_at,
            refresh_token,
            metadata: metadata.unwrap_or_default(),
            last_used: None,
            usage_count: 0,
        };

        self.token_store.store(token.clone())?;
        self.audit_log
            .log_token_created(agent_id, role.as_str(), expires_at)?;

        Ok(token)
    }

    /// Authenticate a signed token string.
    ///
    /// Returns `None` on signature mismatch, unknown/expired/revoked tokens,
    /// and locked-out agents. A successful lookup updates `last_used` and
    /// `usage_count` inside the store. Locked-out agents observe the same
    /// opaque failure as invalid tokens.
    pub fn authenticate(&self, token_str: &str) -> Option<AgentToken> {
        if !self.verify_signature(token_str) {
            self.record_audit(self.audit_log.log_suspicious_activity(
                "unknown",
                "invalid_signature",
                &format!("Token: {}", token_preview(token_str)),
            ));
            return None;
        }

        let token = self.token_store.get(token_str)?;

        if self.is_locked_out(&token.agent_id) {
            self.record_audit(self.audit_log.log_auth_failure(
                &token.agent_id,
                "AUTH",
                "token",
                "account_locked",
            ));
            return None;
        }

        Some(token)
    }

    /// Authorize an action based on token permissions.
    ///
    /// A denial is audited and counts toward the agent's lockout window.
    pub fn authorize(
        &self,
        token: &AgentToken,
        permission: Permission,
        resource: Option<&str>,
    ) -> bool {
        let resource = resource.unwrap_or("unknown");

        if !token.has_permission(permission) {
            self.record_audit(self.audit_log.log_auth_failure(
                &token.agent_id,
                permission.as_str(),
                resource,
                "insufficient_permissions",
            ));
            self.record_failed_attempt(&token.agent_id);
            return false;
        }

        self.record_audit(
            self.audit_log
                .log_auth_success(&token.agent_id, permission.as_str(), resource),
        );
        true
    }

    /// Exchange a refresh secret for a new token.
    ///
    /// The old token is revoked and a replacement is minted with the same
    /// role, permissions, and metadata under the configured default lifetime.
    pub fn refresh_token(&self, refresh_str: &str) -> Result<Option<AgentToken>, SecurityError> {
        let Some(old) = self.token_store.find_by_refresh(refresh_str) else {
            self.record_audit(self.audit_log.log_suspicious_activity(
                "unknown",
                "invalid_refresh",
                &format!("Token: {}", token_preview(refresh_str)),
            ));
            return Ok(None);
        };

        self.token_store.revoke(&old.token)?;
        let new_token = self.create_token(
            &old.agent_id,
            old.role,
            Some(old.permissions.clone()),
            None,
            Some(old.metadata.clone()),
        )?;

        tracing::info!(target: "security::auth", "Token refreshed for agent {}", old.agent_id);
        Ok(Some(new_token))
    }

    /// Revoke a token. Idempotent; unknown tokens still land in the revoked
    /// set so they can never be resurrected.
    pub fn revoke_token(&self, token_str: &str, actor: Option<&str>) -> Result<(), SecurityError> {
        let removed = self.token_store.revoke(token_str)?;
        if let Some(token) = removed {
            self.audit_log
                .log_token_revoked(&token.agent_id, &token_preview(token_str), actor)?;
        }
        Ok(())
    }

    /// Change the role (and permission set) of every active token held by
    /// `agent_id`. Requires the ADMIN permission on `admin_token`; an
    /// unauthorized caller gets `Ok(false)`, never an error.
    pub fn update_permissions(
        &self,
        agent_id: &str,
        new_role: Role,
        admin_token: &AgentToken,
    ) -> Result<bool, SecurityError> {
        if !self.authorize(admin_token, Permission::Admin, None) {
            return Ok(false);
        }

        let updated =
            self.token_store
                .update_agent_tokens(agent_id, new_role, new_role.permissions())?;
        for (_, old_role) in &updated {
            self.audit_log.log_permission_change(
                agent_id,
                old_role.as_str(),
                new_role.as_str(),
                &admin_token.agent_id,
            )?;
        }

        Ok(!updated.is_empty())
    }

    /// Whether an agent is currently locked out by failed attempts.
    ///
    /// Lockout state is in-memory only and resets on process restart.
    pub fn is_locked_out(&self, agent_id: &str) -> bool {
        let mut attempts = resilient_lock(&self.failed_attempts);
        let Some(list) = attempts.get_mut(agent_id) else {
            return false;
        };
        let cutoff = Utc::now() - self.config.lockout_duration;
        list.retain(|t| *t > cutoff);
        list.len() >= self.config.max_failed_attempts
    }

    /// Validate a token string and project its public information.
    pub fn validate_token(&self, token_str: &str) -> Option<TokenInfo> {
        let token = self.authenticate(token_str)?;
        Some(TokenInfo {
            agent_id: token.agent_id,
            role: token.role,
            permissions: token.permissions,
            expires_at: token.expires_at,
            usage_count: token.usage_count,
            last_used: token.last_used,
        })
    }

    /// Remove expired tokens from the store. Returns the count removed.
    pub fn cleanup_expired(&self) -> Result<usize, SecurityError> {
        self.token_store.cleanup_expired()
    }

    /// Snapshot of active tokens, for listings.
    pub fn active_tokens(&self) -> Vec<AgentToken> {
        self.token_store.active_tokens()
    }

    fn verify_signature(&self, signed_token: &str) -> bool {
        match signed_token.rsplit_once('.') {
            Some((raw, signature)) if !raw.is_empty() => self.secret.verify(raw, signature),
            _ => false,
        }
    }

    fn record_failed_attempt(&self, agent_id: &str) {
        let reached_limit = {
            let mut attempts = resilient_lock(&self.failed_attempts);
            let list = attempts.entry(agent_id.to_string()).or_default();
            list.push(Utc::now());
            list.len() >= self.config.max_failed_attempts
        };

        if reached_limit {
            self.record_audit(self.audit_log.log_suspicious_activity(
                agent_id,
                "account_locked",
                &format!(
                    "Too many failed attempts ({})",
                    self.config.max_failed_attempts
                ),
            ));
        }
    }

    // Audit records from bool/Option paths cannot propagate; a write failure
    // is reported through tracing so it is never silently lost.
    fn record_audit(&self, result: Result<(), SecurityError>) {
        if let Err(e) = result {
            tracing::error!(target: "security::auth", "Failed to write audit record: {}", e);
        }
    }
}

impl AccessControl for AuthManager {
    fn authenticate_token(&self, token_str: &str) -> Option<AgentToken> {
        self.authenticate(token_str)
    }

    fn check_permission(&self, token: &AgentToken, permission: Permission, resource: &str) -> bool {
        self.authorize(token, permission, Some(resource))
    }
}

/// 32 bytes from the thread-local CSPRNG, URL-safe base64 without padding.
fn random_urlsafe() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> AuthManager {
        AuthManager::new(dir.path(), AuthConfig::default()).unwrap()
    }

    #[test]
    fn test_token_format() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token("alice", Role::Specialist, None, None, None)
            .unwrap();

        let (raw, sig) = token.token.rsplit_once('.').unwrap();
        assert!(!raw.contains('.'));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_are_unique() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let a = auth
            .create_token("alice", Role::Guest, None, None, None)
            .unwrap();
        let b = auth
            .create_token("alice", Role::Guest, None, None, None)
            .unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_authenticate_round_trip() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token("alice", Role::Specialist, None, None, None)
            .unwrap();

        let found = auth.authenticate(&token.token).unwrap();
        assert_eq!(found.agent_id, "alice");
        assert_eq!(found.usage_count, 1);
        assert!(found.last_used.is_some());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token("alice", Role::Specialist, None, None, None)
            .unwrap();

        let mut tampered = token.token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });
        assert!(auth.authenticate(&tampered).is_none());

        // The original still authenticates
        assert!(auth.authenticate(&token.token).is_some());
    }

    #[test]
    fn test_malformed_token_rejected() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        assert!(auth.authenticate("no-dot-here").is_none());
        assert!(auth.authenticate(".onlysig").is_none());
        assert!(auth.authenticate("").is_none());
    }

    #[test]
    fn test_custom_permissions_override_role() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token(
                "probe",
                Role::Guest,
                Some(vec![Permission::Read, Permission::ViewLogs]),
                None,
                None,
            )
            .unwrap();
        assert_eq!(token.permissions, vec![Permission::Read, Permission::ViewLogs]);
    }

    #[test]
    fn test_refresh_token_issuance_boundary() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);

        let short = auth
            .create_token("a", Role::Specialist, None, Some(Duration::hours(1)), None)
            .unwrap();
        assert!(short.refresh_token.is_none());

        let long = auth
            .create_token(
                "b",
                Role::Specialist,
                None,
                Some(Duration::hours(1) + Duration::seconds(1)),
                None,
            )
            .unwrap();
        assert!(long.refresh_token.is_some());
    }

    #[test]
    fn test_authorize_logs_and_denies() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token("alice", Role::Specialist, None, None, None)
            .unwrap();

        assert!(auth.authorize(&token, Permission::CreateHandoff, None));
        assert!(!auth.authorize(&token, Permission::Admin, None));

        let audit = std::fs::read_to_string(auth.audit_path()).unwrap();
        assert!(audit.contains("AUTH_SUCCESS"));
        assert!(audit.contains("AUTH_FAILURE"));
        assert!(audit.contains("insufficient_permissions"));
    }

    #[test]
    fn test_lockout_after_failed_attempts() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig {
            lockout_duration: Duration::milliseconds(400),
            ..AuthConfig::default()
        };
        let auth = AuthManager::new(dir.path(), config).unwrap();
        let token = auth
            .create_token("alice", Role::Specialist, None, None, None)
            .unwrap();

        for _ in 0..6 {
            assert!(!auth.authorize(&token, Permission::Admin, None));
        }
        assert!(auth.is_locked_out("alice"));
        assert!(auth.authenticate(&token.token).is_none());

        // Window expires, the same token authenticates again
        std::thread::sleep(std::time::Duration::from_millis(450));
        assert!(!auth.is_locked_out("alice"));
        assert!(auth.authenticate(&token.token).is_some());
    }

    #[test]
    fn test_refresh_rotates_token() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let old = auth
            .create_token("alice", Role::Orchestrator, None, Some(Duration::hours(2)), None)
            .unwrap();
        let refresh = old.refresh_token.clone().unwrap();

        let new = auth.refresh_token(&refresh).unwrap().unwrap();
        assert_ne!(new.token, old.token);
        assert_eq!(new.role, Role::Orchestrator);
        assert_eq!(new.permissions, old.permissions);

        assert!(auth.authenticate(&old.token).is_none());
        assert!(auth.authenticate(&new.token).is_some());
    }

    #[test]
    fn test_refresh_with_unknown_secret() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        assert!(auth.refresh_token("bogus").unwrap().is_none());

        let audit = std::fs::read_to_string(auth.audit_path()).unwrap();
        assert!(audit.contains("invalid_refresh"));
    }

    #[test]
    fn test_revoke_is_permanent_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token("alice", Role::Specialist, None, None, None)
            .unwrap();

        auth.revoke_token(&token.token, Some("admin")).unwrap();
        assert!(auth.authenticate(&token.token).is_none());
        auth.revoke_token(&token.token, Some("admin")).unwrap();
        assert!(auth.authenticate(&token.token).is_none());
    }

    #[test]
    fn test_update_permissions_requires_admin() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let admin = auth
            .create_token("root", Role::Admin, None, None, None)
            .unwrap();
        let worker = auth
            .create_token("worker", Role::Guest, None, None, None)
            .unwrap();

        // Non-admin caller is refused without an error
        assert!(!auth.update_permissions("worker", Role::Reviewer, &worker).unwrap());

        assert!(auth.update_permissions("worker", Role::Reviewer, &admin).unwrap());
        let updated = auth.authenticate(&worker.token).unwrap();
        assert_eq!(updated.role, Role::Reviewer);
        assert_eq!(updated.permissions, Role::Reviewer.permissions());

        // No matching agent updates nothing
        assert!(!auth.update_permissions("ghost", Role::Guest, &admin).unwrap());
    }

    #[test]
    fn test_validate_token_projection() {
        let dir = TempDir::new().unwrap();
        let auth = manager(&dir);
        let token = auth
            .create_token("alice", Role::Reviewer, None, None, None)
            .unwrap();

        let info = auth.validate_token(&token.token).unwrap();
        assert_eq!(info.agent_id, "alice");
        assert_eq!(info.role, Role::Reviewer);
        assert_eq!(info.usage_count, 1);
        assert!(auth.validate_token("garbage.token").is_none());
    }

    #[test]
    fn test_external_secret_key() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig {
            secret_key: Some("f".repeat(64)),
            ..AuthConfig::default()
        };
        let auth = AuthManager::new(dir.path(), config).unwrap();
        let token = auth
            .create_token("alice", Role::Guest, None, None, None)
            .unwrap();
        assert!(auth.authenticate(&token.token).is_some());
        // No key file is written when the secret is supplied externally
        assert!(!dir.path().join("auth/.secret_key").exists());
    }
}
