// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! agentgate - Agent authentication and secure handoff library
//!
//! Mints signed, role-scoped capability tokens for software agents, enforces
//! permission checks on every inter-agent operation, sanitizes untrusted
//! content, keeps an auditable security log, and mediates a file-backed
//! handoff channel between agents. Everything persists under a single
//! workspace directory; the library performs no network I/O.
//!
//! # Core Modules
//!
//! - [`auth`] - Token minting, verification, authorization, and lockout
//! - [`store`] - Durable token state with atomic JSON persistence
//! - [`sanitize`] - Input sanitizers and the sliding-window rate limiter
//! - [`handoff`] - Path-safe file handoffs between agents
//! - [`comms`] - Workspace facade wiring the pieces together
//! - [`audit`] - Append-only security audit log
//! - [`secret`] - Workspace HMAC signing key
//! - [`error`] - Error taxonomy shared across the crate
//!
//! # Example
//!
//! ```no_run
//! use agentgate::{CommsManager, Role};
//! use std::path::Path;
//!
//! let comms = CommsManager::open(Path::new("./workspace"))?;
//! let token = comms.create_token("backend-dev", Role::Specialist, None, None, None)?;
//! let id = comms.create_handoff(
//!     "backend-dev",
//!     "reviewer",
//!     "analysis",
//!     &serde_json::json!({"files": 3}),
//!     "Please review the attached analysis.",
//!     Some(&token.token),
//! )?;
//! let record = comms.read_handoff(&id, Some(&token.token))?;
//! # Ok::<(), agentgate::SecurityError>(())
//! ```

pub mod audit;
pub mod auth;
pub mod comms;
pub mod error;
pub mod handoff;
pub mod locks;
pub mod sanitize;
pub mod secret;
pub mod store;
pub mod token;

// Re-export commonly used types
pub use auth::{AuthConfig, AuthManager, TokenInfo};
pub use comms::{AuthStatus, CommsManager};
pub use error::SecurityError;
pub use handoff::{AccessControl, HandoffRecord, HandoffStore};
pub use sanitize::{InputSanitizer, SanitizationStats};
pub use secret::SecretKey;
pub use store::TokenStore;
pub use token::{AgentToken, Permission, Role};
