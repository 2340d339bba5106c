// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed handoff channel between agents.
//!
//! A handoff is an immutable record written once by a sender and read many
//! times by receivers: a structured `{id}.json` plus a rendered `{id}.md`,
//! both under `<workspace>/communication/handoffs/`. Every filesystem access
//! goes through the path-safety protocol; every write goes through the input
//! sanitizer first.
//!
//! Authorization is delegated through the [`AccessControl`] interface
//! supplied at construction, so this module never depends on the
//! authentication manager directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::SecurityError;
use crate::sanitize::InputSanitizer;
use crate::token::{AgentToken, Permission};

/// Subdirectory names handoff traffic is allowed to touch.
const ALLOWED_SUBDIRS: [&str; 5] = ["communication", "handoffs", "logs", "data", "auth"];

/// Handoff creations allowed per token per minute.
const CREATE_RATE_LIMIT: usize = 50;
/// Handoff reads allowed per token per minute.
const READ_RATE_LIMIT: usize = 100;

/// Authorization seam between the handoff channel and the token system.
pub trait AccessControl: Send + Sync {
    /// Resolve a signed token string to its token, or `None` if invalid.
    fn authenticate_token(&self, token_str: &str) -> Option<AgentToken>;

    /// Whether the token may perform an action on a resource. Denials are
    /// expected to be audited by the implementation.
    fn check_permission(&self, token: &AgentToken, permission: Permission, resource: &str) -> bool;
}

/// One immutable handoff record, as persisted in `{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub handoff_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub handoff_type: String,
    pub data: serde_json::Value,
    pub instructions: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

/// Creates and reads handoff records under a whitelisted workspace subtree.
pub struct HandoffStore {
    workspace_dir: PathBuf,
    handoffs_dir: PathBuf,
    access: Option<Arc<dyn AccessControl>>,
    sanitizer: Arc<InputSanitizer>,
}

impl HandoffStore {
    /// Open the store for a workspace, creating `communication/handoffs`.
    ///
    /// Passing `access: None` disables authorization checks for the
    /// workspace; rate limits and sanitization still apply.
    pub fn new(
        workspace_dir: &Path,
        access: Option<Arc<dyn AccessControl>>,
        sanitizer: Arc<InputSanitizer>,
    ) -> Result<Self, SecurityError> {
        fs::create_dir_all(workspace_dir)?;
        // Canonical form so prefix checks agree with resolved candidates
        let workspace_dir = fs::canonicalize(workspace_dir)?;

        let mut store = Self {
            workspace_dir,
            handoffs_dir: PathBuf::new(),
            access,
            sanitizer,
        };

        let communication_dir =
            store.create_safe_directory(&store.workspace_dir.join("communication"))?;
        store.handoffs_dir = store.create_safe_directory(&communication_dir.join("handoffs"))?;
        Ok(store)
    }

    /// Workspace root this store is confined to.
    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Create a formal handoff between agents.
    ///
    /// All inputs are sanitized before anything touches the filesystem, the
    /// target paths are re-validated, and a failure writing the markdown
    /// view removes the JSON record so no partial pair is left behind.
    pub fn create_handoff(
        &self,
        from_agent: &str,
        to_agent: &str,
        handoff_type: &str,
        data: &serde_json::Value,
        instructions: &str,
        token: Option<&str>,
    ) -> Result<String, SecurityError> {
        let actor = self.require_permission(
            token,
            Permission::CreateHandoff,
            &format!("handoff:{}->{}", from_agent, to_agent),
        )?;
        if let Some(actor) = &actor {
            tracing::info!(
                target: "security::handoff",
                "Authenticated handoff creation by {}",
                actor.agent_id
            );
        }

        let rate_id = rate_identifier(token);
        if !self
            .sanitizer
            .check_rate_limit(&format!("create_handoff:{}", rate_id), CREATE_RATE_LIMIT, 60)
        {
            return Err(SecurityError::RateLimitExceeded {
                operation: "create_handoff".to_string(),
            });
        }

        let from_agent = self.sanitizer.sanitize_agent_name(from_agent)?;
        let to_agent = self.sanitizer.sanitize_agent_name(to_agent)?;
        let handoff_type = self.sanitizer.sanitize_agent_name(handoff_type)?;
        let data = self.sanitizer.sanitize_json(data, 10)?;
        let instructions = self.sanitizer.sanitize_markdown(instructions, false);

        let now = Utc::now();
        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let tag = id_tag(&from_agent, &to_agent, &stamp);
        let handoff_id = self
            .sanitizer
            .sanitize_filename(&format!("handoff_{}_{:04x}", stamp, tag));

        let record = HandoffRecord {
            handoff_id: handoff_id.clone(),
            from_agent: from_agent.clone(),
            to_agent: to_agent.clone(),
            handoff_type,
            data,
            instructions,
            timestamp: now,
            status: "created".to_string(),
        };

        let json_name = self.sanitizer.sanitize_filename(&format!("{}.json", handoff_id));
        let json_path = self
            .validate_safe_path(&self.handoffs_dir.join(json_name))
            .ok_or_else(|| SecurityError::InvalidInput("invalid handoff file path".to_string()))?;
        fs::write(&json_path, serde_json::to_string_pretty(&record)?)?;

        let md_name = self.sanitizer.sanitize_filename(&format!("{}.md", handoff_id));
        let md_written = (|| -> Result<(), SecurityError> {
            let md_path = self
                .validate_safe_path(&self.handoffs_dir.join(md_name))
                .ok_or_else(|| {
                    SecurityError::InvalidInput("invalid markdown file path".to_string())
                })?;
            fs::write(&md_path, render_markdown(&record)?)?;
            Ok(())
        })();

        if let Err(e) = md_written {
            let _ = fs::remove_file(&json_path);
            return Err(e);
        }

        tracing::info!(
            target: "security::handoff",
            "Handoff created: {} from {} to {}",
            handoff_id,
            record.from_agent,
            record.to_agent
        );
        Ok(handoff_id)
    }

    /// Read a handoff record.
    ///
    /// Returns `Ok(None)` for ids that fail validation and for absent or
    /// unreadable files; authorization and rate-limit failures are errors.
    pub fn read_handoff(
        &self,
        handoff_id: &str,
        token: Option<&str>,
    ) -> Result<Option<HandoffRecord>, SecurityError> {
        self.require_permission(
            token,
            Permission::ReadHandoff,
            &format!("handoff:{}", handoff_id),
        )?;

        let rate_id = rate_identifier(token);
        if !self
            .sanitizer
            .check_rate_limit(&format!("read_handoff:{}", rate_id), READ_RATE_LIMIT, 60)
        {
            return Err(SecurityError::RateLimitExceeded {
                operation: "read_handoff".to_string(),
            });
        }

        let safe_id = match self.sanitizer.sanitize_agent_name(handoff_id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };

        let candidate = self.handoffs_dir.join(format!("{}.json", safe_id));
        let Some(path) = self.validate_safe_path(&candidate) else {
            tracing::warn!(
                target: "security::handoff",
                "Handoff not found or invalid path: {}",
                handoff_id
            );
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    tracing::error!(
                        target: "security::handoff",
                        "Failed to read handoff {}: {}",
                        handoff_id,
                        e
                    );
                    Ok(None)
                }
            },
            Err(e) => {
                tracing::error!(
                    target: "security::handoff",
                    "Failed to read handoff {}: {}",
                    handoff_id,
                    e
                );
                Ok(None)
            }
        }
    }

    /// List handoff ids, optionally filtered to those where `agent_name`
    /// appears as sender or receiver. Most recent first.
    pub fn list_handoffs(
        &self,
        agent_name: Option<&str>,
        token: Option<&str>,
    ) -> Result<Vec<String>, SecurityError> {
        self.require_permission(token, Permission::Read, "handoffs:list")?;

        let mut handoffs = Vec::new();
        let Some(dir) = self.validate_safe_path(&self.handoffs_dir) else {
            return Ok(handoffs);
        };
        if !dir.exists() {
            return Ok(handoffs);
        }

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if self.validate_safe_path(&path).is_none() {
                tracing::warn!(
                    target: "security::handoff",
                    "Skipping potentially unsafe file: {}",
                    path.display()
                );
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };

            match agent_name {
                Some(agent) => {
                    let involved = fs::read_to_string(&path)
                        .ok()
                        .and_then(|raw| serde_json::from_str::<HandoffRecord>(&raw).ok())
                        .map(|r| r.from_agent == agent || r.to_agent == agent)
                        .unwrap_or(false);
                    if involved {
                        handoffs.push(stem);
                    }
                }
                None => handoffs.push(stem),
            }
        }

        handoffs.sort_by(|a, b| b.cmp(a));
        Ok(handoffs)
    }

    /// Validate that a path cannot escape the workspace.
    ///
    /// Rejects raw traversal sequences (`../`, `..\`, `%2e%2e`, `%252e`),
    /// normalizes to an absolute form, requires the workspace as prefix, and
    /// re-validates symlink targets against the same rules.
    fn validate_safe_path(&self, candidate: &Path) -> Option<PathBuf> {
        let raw = candidate.to_string_lossy();
        let lowered = raw.to_ascii_lowercase();
        if raw.contains("../")
            || raw.contains("..\\")
            || lowered.contains("%2e%2e")
            || lowered.contains("%252e")
        {
            tracing::warn!(
                target: "security::handoff",
                "Path traversal attempt detected: {}",
                raw
            );
            return None;
        }

        let absolute = if candidate.is_absolute() {
            normalize(candidate)
        } else {
            normalize(&self.workspace_dir.join(candidate))
        };

        if !absolute.starts_with(&self.workspace_dir) {
            tracing::warn!(
                target: "security::handoff",
                "Path outside allowed directory: {}",
                absolute.display()
            );
            return None;
        }

        if let Ok(meta) = fs::symlink_metadata(&absolute) {
            if meta.file_type().is_symlink() {
                let real = fs::canonicalize(&absolute).ok()?;
                if !real.starts_with(&self.workspace_dir) {
                    tracing::warn!(
                        target: "security::handoff",
                        "Symbolic link points outside allowed directory: {}",
                        absolute.display()
                    );
                    return None;
                }
            }
        }

        Some(absolute)
    }

    fn create_safe_directory(&self, directory: &Path) -> Result<PathBuf, SecurityError> {
        let safe = self.validate_safe_path(directory).ok_or_else(|| {
            SecurityError::InvalidInput(format!("unsafe directory path: {}", directory.display()))
        })?;

        if safe != self.workspace_dir {
            if let Ok(rel) = safe.strip_prefix(&self.workspace_dir) {
                let whitelisted = rel.components().any(|c| {
                    ALLOWED_SUBDIRS.contains(&c.as_os_str().to_string_lossy().as_ref())
                });
                if !whitelisted {
                    tracing::info!(
                        target: "security::handoff",
                        "Creating new directory outside whitelist: {}",
                        safe.display()
                    );
                }
            }
        }

        fs::create_dir_all(&safe)?;
        Ok(safe)
    }

    fn require_permission(
        &self,
        token: Option<&str>,
        permission: Permission,
        resource: &str,
    ) -> Result<Option<AgentToken>, SecurityError> {
        let Some(access) = &self.access else {
            return Ok(None);
        };
        let token_str = token.ok_or(SecurityError::AuthenticationRequired)?;
        let authenticated = access
            .authenticate_token(token_str)
            .ok_or(SecurityError::AuthenticationFailed)?;
        if !access.check_permission(&authenticated, permission, resource) {
            return Err(SecurityError::AuthorizationFailed { permission });
        }
        Ok(Some(authenticated))
    }
}

/// Lexical normalization: drop `.` components, fold `..` onto the parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Rate-limit identity: first 20 characters of the token, or `anonymous`.
fn rate_identifier(token: Option<&str>) -> String {
    token
        .map(|t| t.chars().take(20).collect())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Two-byte discriminator appended to handoff ids.
fn id_tag(from_agent: &str, to_agent: &str, stamp: &str) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}_{}", from_agent, to_agent, stamp).as_bytes());
    let digest = hasher.finalize();
    u16::from_be_bytes([digest[0], digest[1]])
}

fn render_markdown(record: &HandoffRecord) -> Result<String, SecurityError> {
    Ok(format!(
        "# Handoff: {id}\n\n\
         **From**: @{from}  \n\
         **To**: @{to}  \n\
         **Type**: {kind}  \n\
         **Created**: {created}\n\n\
         ## Instructions\n{instructions}\n\n\
         ## Data\n```json\n{data}\n```\n",
        id = record.handoff_id,
        from = record.from_agent,
        to = record.to_agent,
        kind = record.handoff_type,
        created = record.timestamp.to_rfc3339(),
        instructions = record.instructions,
        data = serde_json::to_string_pretty(&record.data)?,
    ))
}
