// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Handoff channel security tests.
//!
//! Hostile inputs end-to-end through the comms facade: path traversal,
//! markdown injection, permission enforcement, and token rotation.

use serde_json::json;
use tempfile::TempDir;

use agentgate::{AuthConfig, CommsManager, Permission, Role, SecurityError};

// =============================================================================
// Path traversal containment
// =============================================================================

#[test]
fn traversal_agent_names_never_escape_workspace() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();

    let id = comms
        .create_handoff(
            "../../etc/passwd",
            "..\\..\\sam",
            "t",
            &json!({"k": "v"}),
            "hi",
            None,
        )
        .unwrap();

    let record = comms.read_handoff(&id, None).unwrap().unwrap();
    assert!(!record.from_agent.contains('/'));
    assert!(!record.from_agent.contains('\\'));
    assert!(!record.from_agent.contains(".."));
    assert!(!record.to_agent.contains('/'));
    assert!(!record.to_agent.contains('\\'));
    assert!(!record.to_agent.contains(".."));

    // Files exist only under communication/handoffs
    let handoffs = dir.path().join("communication/handoffs");
    let created: Vec<_> = std::fs::read_dir(&handoffs)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(created.len(), 2);

    // Nothing landed outside the workspace tree (e.g. /etc)
    assert!(!dir.path().join("etc").exists());
}

#[test]
fn traversal_handoff_id_reads_nothing() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();
    comms
        .create_handoff("a", "b", "t", &json!({}), "x", None)
        .unwrap();

    for hostile in ["../../../etc/passwd", "..%2f..%2fsecret", "%2e%2e/x"] {
        let result = comms.read_handoff(hostile, None).unwrap();
        assert!(result.is_none(), "{:?} must not resolve", hostile);
    }
}

// =============================================================================
// Markdown sanitization end to end
// =============================================================================

#[test]
fn markdown_injection_is_neutralized_on_disk() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();

    let id = comms
        .create_handoff(
            "attacker",
            "victim",
            "t",
            &json!({}),
            "<script>alert(1)</script>[x](javascript:alert(1))",
            None,
        )
        .unwrap();

    let md_path = dir
        .path()
        .join("communication/handoffs")
        .join(format!("{}.md", id));
    let md = std::fs::read_to_string(md_path).unwrap();
    assert!(!md.contains("<script"));
    assert!(!md.contains("javascript:"));
    assert!(md.contains("#blocked-url") || md.contains("#blocked-scheme"));

    // Reading yields the sanitized inputs, not the raw inputs
    let record = comms.read_handoff(&id, None).unwrap().unwrap();
    assert!(!record.instructions.contains("<script"));
    assert!(!record.instructions.contains("javascript:"));
}

#[test]
fn nested_payloads_respect_depth_limit() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();

    let mut deep = json!("leaf");
    for _ in 0..11 {
        deep = json!({ "inner": deep });
    }
    let result = comms.create_handoff("a", "b", "t", &deep, "x", None);
    assert!(matches!(result, Err(SecurityError::DepthExceeded { .. })));

    // Nothing was written
    let listed = comms.list_handoffs(None, None).unwrap();
    assert!(listed.is_empty());
}

// =============================================================================
// Permission enforcement through the access-control seam
// =============================================================================

#[test]
fn reviewer_can_read_but_not_create() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();

    let reviewer = comms
        .create_token("ray", Role::Reviewer, None, None, None)
        .unwrap();

    let denied = comms.create_handoff("ray", "b", "t", &json!({}), "x", Some(&reviewer.token));
    assert!(matches!(
        denied,
        Err(SecurityError::AuthorizationFailed {
            permission: Permission::CreateHandoff
        })
    ));

    let id = comms
        .create_handoff("a", "b", "t", &json!({}), "x", None)
        .unwrap();
    assert!(comms
        .read_handoff(&id, Some(&reviewer.token))
        .unwrap()
        .is_some());
    assert_eq!(comms.list_handoffs(None, Some(&reviewer.token)).unwrap().len(), 1);
}

#[test]
fn revoked_token_cannot_touch_handoffs() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();
    let worker = comms
        .create_token("worker", Role::Specialist, None, None, None)
        .unwrap();

    comms.revoke_token(&worker.token, None).unwrap();
    let result = comms.create_handoff("worker", "b", "t", &json!({}), "x", Some(&worker.token));
    assert!(matches!(result, Err(SecurityError::AuthenticationFailed)));
}

#[test]
fn auth_disabled_workspace_skips_checks_but_still_sanitizes() {
    let dir = TempDir::new().unwrap();
    let config = AuthConfig {
        enable_auth: false,
        ..AuthConfig::default()
    };
    let comms = CommsManager::new(dir.path(), config).unwrap();

    let id = comms
        .create_handoff("x/../y", "b", "t", &json!({}), "<script>hi</script>", None)
        .unwrap();
    let record = comms.read_handoff(&id, None).unwrap().unwrap();
    assert!(!record.from_agent.contains(".."));
    assert!(!record.instructions.contains("<script"));
}

// =============================================================================
// Refresh rotation
// =============================================================================

#[test]
fn refresh_rotates_orchestrator_token() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();

    let old = comms
        .create_token(
            "conductor",
            Role::Orchestrator,
            None,
            None,
            Some(chrono::Duration::hours(2)),
        )
        .unwrap();
    let refresh = old.refresh_token.clone().expect("2h lifetime issues refresh");

    let new = comms.refresh_token(&refresh).unwrap().unwrap();
    assert_ne!(new.token, old.token);
    assert_eq!(new.role, Role::Orchestrator);

    assert!(comms.authenticate(&old.token).unwrap().is_none());
    let authenticated = comms.authenticate(&new.token).unwrap().unwrap();
    assert_eq!(authenticated.agent_id, "conductor");
}

#[test]
fn refresh_with_garbage_is_refused() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();
    assert!(comms.refresh_token("not-a-refresh-token").unwrap().is_none());
}

// =============================================================================
// Listing
// =============================================================================

#[test]
fn listing_filters_by_agent_and_sorts_descending() {
    let dir = TempDir::new().unwrap();
    let comms = CommsManager::open(dir.path()).unwrap();

    comms
        .create_handoff("alpha", "beta", "t", &json!({}), "1", None)
        .unwrap();
    comms
        .create_handoff("beta", "gamma", "t", &json!({}), "2", None)
        .unwrap();
    comms
        .create_handoff("gamma", "alpha", "t", &json!({}), "3", None)
        .unwrap();

    let all = comms.list_handoffs(None, None).unwrap();
    assert_eq!(all.len(), 3);
    let mut sorted = all.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(all, sorted);

    assert_eq!(comms.list_handoffs(Some("alpha"), None).unwrap().len(), 2);
    assert_eq!(comms.list_handoffs(Some("beta"), None).unwrap().len(), 2);
    assert_eq!(comms.list_handoffs(Some("nobody"), None).unwrap().len(), 0);
}
