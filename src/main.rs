// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! agentgate CLI - manage agent tokens and inspect workspace security state.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process;

use agentgate::{CommsManager, InputSanitizer, Role, SecurityError};

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Data error - invalid input data format
    pub const DATA_ERR: i32 = 65;
    /// I/O error - file operation failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Permission denied - authentication or authorization failed
    pub const NOPERM: i32 = 77;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

#[derive(Parser)]
#[command(
    name = "agentgate",
    version,
    about = "Agent token management and secure handoffs",
    long_about = "Manage signed capability tokens for software agents and inspect \
                  the security state of an agentgate workspace."
)]
struct Cli {
    /// Workspace directory holding auth state and handoffs
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new agent token
    Create {
        /// Agent identifier the token is minted for
        #[arg(long)]
        agent: String,
        /// Role to assign (admin, orchestrator, specialist, reviewer, observer, guest)
        #[arg(long, default_value = "specialist")]
        role: String,
        /// Token lifetime in hours (defaults to the configured lifetime)
        #[arg(long)]
        lifetime_hours: Option<i64>,
        /// Custom permission overriding the role set (repeatable)
        #[arg(long = "permission")]
        permissions: Vec<String>,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// List active tokens
    List {
        #[arg(long)]
        json: bool,
    },
    /// Validate a token and show its information
    Validate {
        token: String,
        #[arg(long)]
        json: bool,
    },
    /// Revoke a token
    Revoke { token: String },
    /// Change an agent's role (requires an admin token)
    Update {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        admin_token: String,
    },
    /// Show recent security audit events
    Audit {
        /// Number of trailing log lines to print
        #[arg(long, default_value_t = 20)]
        lines: usize,
    },
    /// Show authentication system status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove expired tokens
    Cleanup,
    /// Show roles and their permission sets
    Roles,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            match e.downcast_ref::<SecurityError>() {
                Some(sec) => exit_code_for(sec),
                None => ERROR,
            }
        }
    };
    process::exit(code);
}

fn exit_code_for(err: &SecurityError) -> i32 {
    match err {
        SecurityError::AuthenticationRequired
        | SecurityError::AuthenticationFailed
        | SecurityError::AuthorizationFailed { .. } => NOPERM,
        SecurityError::InvalidInput(_)
        | SecurityError::PayloadTooLarge { .. }
        | SecurityError::DepthExceeded { .. } => DATA_ERR,
        SecurityError::RateLimitExceeded { .. } => TEMP_FAIL,
        SecurityError::AuthDisabled => CONFIG,
        SecurityError::Storage(_) | SecurityError::Serialization(_) => IO_ERR,
    }
}

fn run(cli: Cli) -> Result<i32> {
    // The roles table is static; no workspace needed
    if let Commands::Roles = cli.command {
        return Ok(cmd_roles());
    }

    let comms = CommsManager::open(&cli.workspace)?;

    match cli.command {
        Commands::Create {
            agent,
            role,
            lifetime_hours,
            permissions,
            json,
        } => cmd_create(&comms, &agent, &role, lifetime_hours, &permissions, json),
        Commands::List { json } => cmd_list(&comms, json),
        Commands::Validate { token, json } => cmd_validate(&comms, &token, json),
        Commands::Revoke { token } => cmd_revoke(&comms, &token),
        Commands::Update {
            agent,
            role,
            admin_token,
        } => cmd_update(&comms, &agent, &role, &admin_token),
        Commands::Audit { lines } => cmd_audit(&comms, lines),
        Commands::Status { json } => cmd_status(&comms, json),
        Commands::Cleanup => cmd_cleanup(&comms),
        Commands::Roles => unreachable!("handled above"),
    }
}

fn cmd_create(
    comms: &CommsManager,
    agent: &str,
    role: &str,
    lifetime_hours: Option<i64>,
    permissions: &[String],
    json: bool,
) -> Result<i32> {
    let role: Role = match role.parse() {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            return Ok(USAGE);
        }
    };

    let custom_permissions = if permissions.is_empty() {
        None
    } else {
        let mut parsed = Vec::new();
        for raw in permissions {
            match raw.parse() {
                Ok(p) => parsed.push(p),
                Err(e) => {
                    eprintln!("{} {}", "[X]".red(), e);
                    return Ok(USAGE);
                }
            }
        }
        Some(parsed)
    };

    let lifetime = lifetime_hours.map(chrono::Duration::hours);
    let token = comms.create_token(agent, role, None, custom_permissions, lifetime)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&token)?);
    } else {
        let permissions: Vec<&str> = token.permissions.iter().map(|p| p.as_str()).collect();
        println!("{} Token created successfully", "[OK]".green());
        println!();
        println!("  {:<14}{}", "Agent ID:".bold(), token.agent_id);
        println!("  {:<14}{}", "Role:".bold(), token.role);
        println!("  {:<14}{}", "Token:".bold(), token.token);
        println!(
            "  {:<14}{}",
            "Expires:".bold(),
            token
                .expires_at
                .map(|e| e.to_rfc3339())
                .unwrap_or_else(|| "Never".to_string())
        );
        println!("  {:<14}{}", "Permissions:".bold(), permissions.join(", "));
        if let Some(refresh) = &token.refresh_token {
            println!("  {:<14}{}", "Refresh:".bold(), refresh);
        }
    }

    // Convenience copy for the agent's operator, mirroring `create` output
    let sanitizer = InputSanitizer::new();
    let file_name = sanitizer.sanitize_filename(&format!("token_{}.json", token.agent_id));
    let out_path = comms.workspace_dir().join("auth").join(file_name);
    std::fs::write(&out_path, serde_json::to_string_pretty(&token)?)?;
    if !json {
        println!();
        println!("{}", format!("Token saved to: {}", out_path.display()).dimmed());
    }

    Ok(SUCCESS)
}

fn cmd_list(comms: &CommsManager, json: bool) -> Result<i32> {
    let mut tokens = comms.active_tokens()?;
    tokens.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

    if json {
        println!("{}", serde_json::to_string_pretty(&tokens)?);
        return Ok(SUCCESS);
    }

    if tokens.is_empty() {
        println!("No active tokens.");
        return Ok(SUCCESS);
    }

    println!(
        "{:<20} {:<13} {:<28} {:<17} {:<17} {:>6}",
        "AGENT".bold(),
        "ROLE".bold(),
        "PERMISSIONS".bold(),
        "CREATED".bold(),
        "EXPIRES".bold(),
        "USAGE".bold()
    );
    for token in tokens {
        let shown: Vec<&str> = token
            .permissions
            .iter()
            .take(3)
            .map(|p| p.as_str())
            .collect();
        let extra = token.permissions.len().saturating_sub(3);
        let mut perms = shown.join(", ");
        if extra > 0 {
            perms.push_str(&format!(" (+{})", extra));
        }

        println!(
            "{:<20} {:<13} {:<28} {:<17} {:<17} {:>6}",
            token.agent_id,
            token.role.to_string(),
            perms,
            token.created_at.format("%Y-%m-%d %H:%M"),
            token
                .expires_at
                .map(|e| e.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "Never".to_string()),
            token.usage_count
        );
    }
    Ok(SUCCESS)
}

fn cmd_validate(comms: &CommsManager, token: &str, json: bool) -> Result<i32> {
    match comms.validate_token(token)? {
        Some(info) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                let permissions: Vec<&str> = info.permissions.iter().map(|p| p.as_str()).collect();
                println!("{} Token is valid", "[OK]".green());
                println!();
                println!("  {:<14}{}", "Agent ID:".bold(), info.agent_id);
                println!("  {:<14}{}", "Role:".bold(), info.role);
                println!("  {:<14}{}", "Permissions:".bold(), permissions.join(", "));
                println!("  {:<14}{}", "Usage Count:".bold(), info.usage_count);
                println!(
                    "  {:<14}{}",
                    "Last Used:".bold(),
                    info.last_used
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "Never".to_string())
                );
                println!(
                    "  {:<14}{}",
                    "Expires:".bold(),
                    info.expires_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "Never".to_string())
                );
            }
            Ok(SUCCESS)
        }
        None => {
            eprintln!("{} Token is invalid, expired, or revoked", "[X]".red());
            Ok(NOPERM)
        }
    }
}

fn cmd_revoke(comms: &CommsManager, token: &str) -> Result<i32> {
    comms.revoke_token(token, None)?;
    println!("{} Token revoked", "[OK]".green());
    Ok(SUCCESS)
}

fn cmd_update(comms: &CommsManager, agent: &str, role: &str, admin_token: &str) -> Result<i32> {
    let role: Role = match role.parse() {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            return Ok(USAGE);
        }
    };

    if comms.update_permissions(agent, role, admin_token)? {
        println!("{} Agent '{}' updated to role {}", "[OK]".green(), agent, role);
        Ok(SUCCESS)
    } else {
        eprintln!(
            "{} Update refused: missing ADMIN permission or no matching tokens",
            "[X]".red()
        );
        Ok(NOPERM)
    }
}

fn cmd_audit(comms: &CommsManager, lines: usize) -> Result<i32> {
    // The core never reads its own log; the CLI tails the file as a client
    let Some(path) = comms.audit_path() else {
        println!("Authentication is disabled; no audit log.");
        return Ok(SUCCESS);
    };
    if !path.exists() {
        println!("No audit events recorded yet.");
        return Ok(SUCCESS);
    }

    let content = std::fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        if line.contains(" - WARNING - ") {
            println!("{}", line.yellow());
        } else {
            println!("{}", line);
        }
    }
    Ok(SUCCESS)
}

fn cmd_status(comms: &CommsManager, json: bool) -> Result<i32> {
    let status = comms.get_auth_status();
    let stats = comms.get_sanitization_stats();

    if json {
        let combined = serde_json::json!({
            "auth": status,
            "sanitization": stats,
        });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(SUCCESS);
    }

    let enabled = if status.enabled {
        "enabled".green().to_string()
    } else {
        "disabled".yellow().to_string()
    };
    println!("{}", "Workspace security status".bold());
    println!();
    println!("  {:<22}{}", "Authentication:", enabled);
    println!("  {:<22}{}", "System token:", status.has_system_token);
    println!("  {:<22}{}", "Workspace:", status.workspace);
    if let Some(auth_dir) = status.auth_directory {
        println!("  {:<22}{}", "Auth directory:", auth_dir);
    }
    println!();
    println!("  {:<22}{}", "Sanitizations:", stats.total_sanitizations);
    println!("  {:<22}{}", "Blocked attempts:", stats.blocked_attempts);
    println!("  {:<22}{}", "Modified inputs:", stats.modified_inputs);
    Ok(SUCCESS)
}

fn cmd_cleanup(comms: &CommsManager) -> Result<i32> {
    let removed = comms.cleanup_expired()?;
    println!("{} Removed {} expired token(s)", "[OK]".green(), removed);
    Ok(SUCCESS)
}

fn cmd_roles() -> i32 {
    println!("{:<14} {}", "ROLE".bold(), "PERMISSIONS".bold());
    for role in Role::all() {
        let permissions: Vec<&str> = role.permissions().iter().map(|p| p.as_str()).collect();
        println!("{:<14} {}", role.to_string(), permissions.join(", "));
    }
    SUCCESS
}
