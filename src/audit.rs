// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security audit logging.
//!
//! Appends one line per security event to `security_audit.log`:
//!
//! `2024-01-15 10:23:45 - WARNING - AUTH_FAILURE - Agent: builder, Permission: ADMIN, ...`
//!
//! The log is append-only and never read by the core; the CLI and dashboards
//! consume it as external clients. A process-local mutex around the file
//! handle keeps concurrent writers from interleaving partial records.

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::SecurityError;
use crate::locks::resilient_lock;

const AUDIT_FILE_NAME: &str = "security_audit.log";

/// Severity attached to each audit line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warning => write!(f, "WARNING"),
        }
    }
}

/// Append-only audit trail for security events.
pub struct SecurityAuditLog {
    audit_path: PathBuf,
    file: Mutex<File>,
}

impl SecurityAuditLog {
    /// Open (or create) the audit log under `log_dir`.
    pub fn new(log_dir: &std::path::Path) -> Result<Self, SecurityError> {
        std::fs::create_dir_all(log_dir)?;
        let audit_path = log_dir.join(AUDIT_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)?;
        Ok(Self {
            audit_path,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &PathBuf {
        &self.audit_path
    }

    pub fn log_auth_success(
        &self,
        agent_id: &str,
        permission: &str,
        resource: &str,
    ) -> Result<(), SecurityError> {
        self.write_line(
            Level::Info,
            "AUTH_SUCCESS",
            &format!(
                "Agent: {}, Permission: {}, Resource: {}",
                agent_id, permission, resource
            ),
        )
    }

    pub fn log_auth_failure(
        &self,
        agent_id: &str,
        permission: &str,
        resource: &str,
        reason: &str,
    ) -> Result<(), SecurityError> {
        self.write_line(
            Level::Warning,
            "AUTH_FAILURE",
            &format!(
                "Agent: {}, Permission: {}, Resource: {}, Reason: {}",
                agent_id, permission, resource, reason
            ),
        )
    }

    pub fn log_token_created(
        &self,
        agent_id: &str,
        role: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), SecurityError> {
        let expiry = expires_at
            .map(|e| e.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        self.write_line(
            Level::Info,
            "TOKEN_CREATED",
            &format!("Agent: {}, Role: {}, Expires: {}", agent_id, role, expiry),
        )
    }

    pub fn log_token_revoked(
        &self,
        agent_id: &str,
        token_preview: &str,
        actor: Option<&str>,
    ) -> Result<(), SecurityError> {
        let mut detail = format!("Agent: {}, Token: {}", agent_id, token_preview);
        if let Some(actor) = actor {
            detail.push_str(&format!(", By: {}", actor));
        }
        self.write_line(Level::Info, "TOKEN_REVOKED", &detail)
    }

    pub fn log_permission_change(
        &self,
        agent_id: &str,
        old_role: &str,
        new_role: &str,
        admin_id: &str,
    ) -> Result<(), SecurityError> {
        self.write_line(
            Level::Info,
            "PERMISSION_CHANGE",
            &format!(
                "Agent: {}, Old: {}, New: {}, Admin: {}",
                agent_id, old_role, new_role, admin_id
            ),
        )
    }

    pub fn log_suspicious_activity(
        &self,
        agent_id: &str,
        activity: &str,
        details: &str,
    ) -> Result<(), SecurityError> {
        self.write_line(
            Level::Warning,
            "SUSPICIOUS_ACTIVITY",
            &format!(
                "Agent: {}, Activity: {}, Details: {}",
                agent_id, activity, details
            ),
        )
    }

    fn write_line(&self, level: Level, event: &str, detail: &str) -> Result<(), SecurityError> {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let mut file = resilient_lock(&self.file);
        writeln!(file, "{} - {} - {} - {}", timestamp, level, event, detail)?;
        file.flush()?;
        Ok(())
    }
}
