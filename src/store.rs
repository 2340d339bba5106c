// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Durable storage for agent tokens.
//!
//! State is a map of active tokens plus a set of revoked token strings,
//! persisted as two JSON files. Every mutation happens under one mutex and
//! is flushed with a write-to-temp-then-rename so a crash never leaves a
//! partial file behind. A corrupt file on load is logged and replaced with
//! empty state rather than taking the process down.

use fs2::FileExt;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::SecurityError;
use crate::locks::resilient_lock;
use crate::token::{token_preview, AgentToken, Permission, Role};

const TOKENS_FILE: &str = "tokens.json";
const REVOKED_FILE: &str = "revoked_tokens.json";
const LOCK_FILE: &str = ".tokens.lock";

struct StoreState {
    active: HashMap<String, AgentToken>,
    revoked: HashSet<String>,
}

/// Secure storage for agent tokens.
pub struct TokenStore {
    tokens_file: PathBuf,
    revoked_file: PathBuf,
    lock_file: PathBuf,
    state: Mutex<StoreState>,
}

impl TokenStore {
    /// Open the store rooted at `storage_path`, creating it if needed.
    pub fn new(storage_path: &Path) -> Result<Self, SecurityError> {
        fs::create_dir_all(storage_path)?;
        let tokens_file = storage_path.join(TOKENS_FILE);
        let revoked_file = storage_path.join(REVOKED_FILE);
        let lock_file = storage_path.join(LOCK_FILE);

        let state = StoreState {
            active: Self::load_active(&tokens_file),
            revoked: Self::load_revoked(&revoked_file),
        };

        Ok(Self {
            tokens_file,
            revoked_file,
            lock_file,
            state: Mutex::new(state),
        })
    }

    /// Store a new token. I/O errors surface to the caller.
    pub fn store(&self, token: AgentToken) -> Result<(), SecurityError> {
        let mut state = resilient_lock(&self.state);
        let agent_id = token.agent_id.clone();
        state.active.insert(token.token.clone(), token);
        self.save(&state)?;
        tracing::info!(target: "security::store", "Token stored for agent {}", agent_id);
        Ok(())
    }

    /// Retrieve a token and update its usage statistics.
    ///
    /// Returns `None` for revoked, absent, or expired tokens; an expired
    /// token is removed from the store as a side effect. The `last_used`
    /// and `usage_count` updates are persisted before the token is returned.
    pub fn get(&self, token_str: &str) -> Option<AgentToken> {
        let mut state = resilient_lock(&self.state);

        if state.revoked.contains(token_str) {
            return None;
        }

        let expired = match state.active.get(token_str) {
            Some(token) => token.is_expired(),
            None => return None,
        };

        if expired {
            state.active.remove(token_str);
            self.save_or_log(&state);
            return None;
        }

        let token = state.active.get_mut(token_str)?;
        token.last_used = Some(Utc::now());
        token.usage_count += 1;
        let snapshot = token.clone();
        self.save_or_log(&state);
        Some(snapshot)
    }

    /// Revoke a token. Idempotent; the token string is always added to the
    /// revoked set. Returns the removed token when it was still active.
    pub fn revoke(&self, token_str: &str) -> Result<Option<AgentToken>, SecurityError> {
        let mut state = resilient_lock(&self.state);
        let removed = state.active.remove(token_str);
        state.revoked.insert(token_str.to_string());
        self.save(&state)?;
        tracing::info!(
            target: "security::store",
            "Token revoked: {}",
            token_preview(token_str)
        );
        Ok(removed)
    }

    /// Remove all expired tokens. Returns the number removed.
    pub fn cleanup_expired(&self) -> Result<usize, SecurityError> {
        let mut state = resilient_lock(&self.state);
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, token)| token.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.active.remove(key);
        }

        if !expired.is_empty() {
            self.save(&state)?;
            tracing::info!(
                target: "security::store",
                "Cleaned up {} expired tokens",
                expired.len()
            );
        }
        Ok(expired.len())
    }

    /// Replace role and permissions for every active token of `agent_id`,
    /// atomically under the store lock. Returns `(token, old_role)` pairs
    /// for the tokens that changed.
    pub fn update_agent_tokens(
        &self,
        agent_id: &str,
        new_role: Role,
        permissions: Vec<Permission>,
    ) -> Result<Vec<(String, Role)>, SecurityError> {
        let mut state = resilient_lock(&self.state);
        let mut updated = Vec::new();

        for token in state.active.values_mut() {
            if token.agent_id == agent_id {
                updated.push((token.token.clone(), token.role));
                token.role = new_role;
                token.permissions = permissions.clone();
            }
        }

        if !updated.is_empty() {
            self.save(&state)?;
        }
        Ok(updated)
    }

    /// Find the active token holding a given refresh token. No usage-count
    /// side effects; expected token counts are small, so a linear scan is
    /// acceptable.
    pub fn find_by_refresh(&self, refresh_token: &str) -> Option<AgentToken> {
        let state = resilient_lock(&self.state);
        state
            .active
            .values()
            .find(|token| token.refresh_token.as_deref() == Some(refresh_token))
            .cloned()
    }

    /// Snapshot of all active tokens.
    pub fn active_tokens(&self) -> Vec<AgentToken> {
        let state = resilient_lock(&self.state);
        state.active.values().cloned().collect()
    }

    fn load_active(tokens_file: &Path) -> HashMap<String, AgentToken> {
        if !tokens_file.exists() {
            return HashMap::new();
        }
        let raw = match fs::read_to_string(tokens_file) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(target: "security::store", "Failed to load tokens: {}", e);
                return HashMap::new();
            }
        };
        match serde_json::from_str::<HashMap<String, AgentToken>>(&raw) {
            Ok(map) => map
                .into_iter()
                .filter(|(_, token)| !token.is_expired())
                .collect(),
            Err(e) => {
                tracing::error!(target: "security::store", "Failed to load tokens: {}", e);
                HashMap::new()
            }
        }
    }

    fn load_revoked(revoked_file: &Path) -> HashSet<String> {
        if !revoked_file.exists() {
            return HashSet::new();
        }
        let raw = match fs::read_to_string(revoked_file) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(target: "security::store", "Failed to load revoked tokens: {}", e);
                return HashSet::new();
            }
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(list) => list.into_iter().collect(),
            Err(e) => {
                tracing::error!(target: "security::store", "Failed to load revoked tokens: {}", e);
                HashSet::new()
            }
        }
    }

    fn save(&self, state: &StoreState) -> Result<(), SecurityError> {
        let lock = File::create(&self.lock_file)?;
        lock.lock_exclusive()?;

        let result = (|| -> Result<(), SecurityError> {
            let tokens = serde_json::to_string_pretty(&state.active)?;
            Self::write_atomic(&self.tokens_file, &tokens)?;

            let revoked: Vec<&String> = {
                let mut list: Vec<&String> = state.revoked.iter().collect();
                list.sort();
                list
            };
            let revoked = serde_json::to_string_pretty(&revoked)?;
            Self::write_atomic(&self.revoked_file, &revoked)?;
            Ok(())
        })();

        let _ = lock.unlock();
        result
    }

    // Persistence failures inside `get` must not turn a valid token into an
    // authentication failure; they are logged and the lookup proceeds.
    fn save_or_log(&self, state: &StoreState) {
        if let Err(e) = self.save(state) {
            tracing::error!(target: "security::store", "Failed to save tokens: {}", e);
        }
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<(), SecurityError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    fn token_for(agent: &str, token: &str, lifetime: Option<Duration>) -> AgentToken {
        AgentToken {
            agent_id: agent.to_string(),
            token: token.to_string(),
            role: Role::Specialist,
            permissions: Role::Specialist.permissions(),
            created_at: Utc::now(),
            expires_at: lifetime.map(|l| Utc::now() + l),
            refresh_token: None,
            metadata: StdHashMap::new(),
            last_used: None,
            usage_count: 0,
        }
    }

    #[test]
    fn test_store_and_get_updates_usage() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        store
            .store(token_for("alice", "tok.sig", Some(Duration::hours(1))))
            .unwrap();

        let first = store.get("tok.sig").unwrap();
        assert_eq!(first.usage_count, 1);
        assert!(first.last_used.is_some());

        let second = store.get("tok.sig").unwrap();
        assert_eq!(second.usage_count, 2);
        assert!(second.last_used >= first.last_used);
    }

    #[test]
    fn test_get_unknown_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        assert!(store.get("missing.sig").is_none());
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        store
            .store(token_for("alice", "tok.sig", Some(Duration::hours(1))))
            .unwrap();

        let removed = store.revoke("tok.sig").unwrap();
        assert!(removed.is_some());
        assert!(store.get("tok.sig").is_none());

        // Second revoke is a no-op
        let removed = store.revoke("tok.sig").unwrap();
        assert!(removed.is_none());
        assert!(store.get("tok.sig").is_none());
    }

    #[test]
    fn test_revocation_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = TokenStore::new(dir.path()).unwrap();
            store
                .store(token_for("alice", "tok.sig", Some(Duration::hours(1))))
                .unwrap();
            store.revoke("tok.sig").unwrap();
        }
        let store = TokenStore::new(dir.path()).unwrap();
        assert!(store.get("tok.sig").is_none());
    }

    #[test]
    fn test_expired_token_removed_on_get() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        store
            .store(token_for("alice", "tok.sig", Some(Duration::milliseconds(-1))))
            .unwrap();

        assert!(store.get("tok.sig").is_none());
        assert!(store.active_tokens().is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        store
            .store(token_for("old", "old.sig", Some(Duration::milliseconds(-1))))
            .unwrap();
        store
            .store(token_for("new", "new.sig", Some(Duration::hours(1))))
            .unwrap();

        assert_eq!(store.cleanup_expired().unwrap(), 1);
        assert_eq!(store.cleanup_expired().unwrap(), 0);
        let remaining = store.active_tokens();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].agent_id, "new");
    }

    #[test]
    fn test_corrupt_files_start_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(TOKENS_FILE), "{not json").unwrap();
        fs::write(dir.path().join(REVOKED_FILE), "also not json").unwrap();

        let store = TokenStore::new(dir.path()).unwrap();
        assert!(store.active_tokens().is_empty());
        store
            .store(token_for("alice", "tok.sig", Some(Duration::hours(1))))
            .unwrap();
        assert!(store.get("tok.sig").is_some());
    }

    #[test]
    fn test_expired_tokens_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        {
            let store = TokenStore::new(dir.path()).unwrap();
            store
                .store(token_for("old", "old.sig", Some(Duration::milliseconds(5))))
                .unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let store = TokenStore::new(dir.path()).unwrap();
        assert!(store.active_tokens().is_empty());
    }

    #[test]
    fn test_update_agent_tokens() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        store
            .store(token_for("alice", "a1.sig", Some(Duration::hours(1))))
            .unwrap();
        store
            .store(token_for("alice", "a2.sig", Some(Duration::hours(1))))
            .unwrap();
        store
            .store(token_for("bob", "b1.sig", Some(Duration::hours(1))))
            .unwrap();

        let updated = store
            .update_agent_tokens("alice", Role::Reviewer, Role::Reviewer.permissions())
            .unwrap();
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|(_, old)| *old == Role::Specialist));

        let alice = store.get("a1.sig").unwrap();
        assert_eq!(alice.role, Role::Reviewer);
        assert_eq!(alice.permissions, Role::Reviewer.permissions());
        let bob = store.get("b1.sig").unwrap();
        assert_eq!(bob.role, Role::Specialist);
    }

    #[test]
    fn test_find_by_refresh_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        let mut token = token_for("alice", "tok.sig", Some(Duration::hours(2)));
        token.refresh_token = Some("refresh-secret".to_string());
        store.store(token).unwrap();

        let found = store.find_by_refresh("refresh-secret").unwrap();
        assert_eq!(found.usage_count, 0);
        assert!(store.find_by_refresh("wrong").is_none());
    }

    #[test]
    fn test_no_partial_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path()).unwrap();
        store
            .store(token_for("alice", "tok.sig", Some(Duration::hours(1))))
            .unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
