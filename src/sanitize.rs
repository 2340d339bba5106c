// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Input sanitization for untrusted agent content.
//!
//! Stateless validators for agent names, JSON payloads, markdown, and
//! filenames, plus a per-identifier sliding-window rate limiter. Every
//! sanitizer records statistics so operators can monitor how much hostile
//! input the workspace is absorbing.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use crate::error::SecurityError;
use crate::locks::resilient_lock;

/// Maximum accepted agent-name length.
pub const MAX_AGENT_NAME_LENGTH: usize = 64;
/// Maximum serialized payload size (10 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;
/// Maximum length for a single string value.
pub const MAX_STRING_LENGTH: usize = 100_000;
/// Maximum accepted URL length in markdown links.
pub const MAX_URL_LENGTH: usize = 2048;
/// URL schemes allowed in markdown links.
pub const ALLOWED_URL_SCHEMES: [&str; 5] = ["http", "https", "ftp", "mailto", "tel"];

/// JUSTIFICATION for .expect(): these are static, compile-time-validated
/// regex patterns. If any fail to compile it is a programmer error that
/// should be caught in testing, not at request time.
static AGENT_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("agent name regex is valid"));

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("control char regex is valid")
});

static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("markdown link regex is valid"));

static DANGEROUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<script[^>]*>.*?</script>",
        r"(?is)<iframe[^>]*>.*?</iframe>",
        r"(?i)<embed[^>]*>",
        r"(?is)<object[^>]*>.*?</object>",
        r"(?i)javascript:",
        r"(?i)data:text/html",
        r"(?i)vbscript:",
        r"(?i)on\w+\s*=",
        r"(?i)<form[^>]*>",
        r"(?i)<input[^>]*>",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("dangerous pattern regex is valid"))
    .collect()
});

/// HTML tags preserved when `allow_html` is enabled.
const SAFE_HTML_TAGS: [&str; 17] = [
    "p", "br", "strong", "em", "u", "li", "ul", "ol", "blockquote", "code", "pre", "a", "h1",
    "h2", "h3", "h4", "h5",
];

/// Counters exposed for security monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SanitizationStats {
    pub total_sanitizations: u64,
    pub blocked_attempts: u64,
    pub modified_inputs: u64,
}

/// Comprehensive input sanitizer with rate limiting and statistics.
pub struct InputSanitizer {
    rate_limiter: Mutex<HashMap<String, Vec<Instant>>>,
    stats: Mutex<SanitizationStats>,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSanitizer {
    pub fn new() -> Self {
        Self {
            rate_limiter: Mutex::new(HashMap::new()),
            stats: Mutex::new(SanitizationStats::default()),
        }
    }

    /// Sanitize an agent name.
    ///
    /// Only `[A-Za-z0-9_-]` survives; names are trimmed and truncated to 64
    /// characters. An empty result becomes `unknown_agent`.
    pub fn sanitize_agent_name(&self, name: &str) -> Result<String, SecurityError> {
        self.bump_total();

        let mut name = name.trim().to_string();
        if name.is_empty() {
            return Ok("unknown_agent".to_string());
        }

        if name.chars().count() > MAX_AGENT_NAME_LENGTH {
            tracing::warn!(target: "security::sanitize", "Agent name too long: {} chars", name.chars().count());
            name = name.chars().take(MAX_AGENT_NAME_LENGTH).collect();
            self.bump_modified();
        }

        let stripped: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if stripped != name {
            tracing::info!(target: "security::sanitize", "Sanitized agent name: '{}' -> '{}'", name, stripped);
            self.bump_modified();
        }

        if stripped.is_empty() {
            return Ok("unknown_agent".to_string());
        }

        if !AGENT_NAME_PATTERN.is_match(&stripped) {
            self.bump_blocked();
            return Err(SecurityError::InvalidInput(format!(
                "invalid agent name format: {}",
                stripped
            )));
        }

        Ok(stripped)
    }

    /// Recursively sanitize a JSON payload.
    ///
    /// Enforces the serialized size cap and a maximum nesting depth; strips
    /// control bytes from keys and string values and caps their lengths.
    pub fn sanitize_json(
        &self,
        data: &serde_json::Value,
        max_depth: usize,
    ) -> Result<serde_json::Value, SecurityError> {
        self.bump_total();

        let size = serde_json::to_string(data)?.len();
        if size > MAX_PAYLOAD_SIZE {
            tracing::error!(target: "security::sanitize", "JSON payload too large: {} bytes", size);
            self.bump_blocked();
            return Err(SecurityError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        self.sanitize_json_value(data, 0, max_depth)
    }

    fn sanitize_json_value(
        &self,
        value: &serde_json::Value,
        depth: usize,
        max_depth: usize,
    ) -> Result<serde_json::Value, SecurityError> {
        if depth > max_depth {
            tracing::warn!(target: "security::sanitize", "Maximum nesting depth exceeded: {}", depth);
            return Err(SecurityError::DepthExceeded { max_depth });
        }

        match value {
            serde_json::Value::Object(map) => {
                let mut sanitized = serde_json::Map::new();
                for (key, val) in map {
                    let safe_key = self.clean_string(key, 256);
                    sanitized.insert(safe_key, self.sanitize_json_value(val, depth + 1, max_depth)?);
                }
                Ok(serde_json::Value::Object(sanitized))
            }
            serde_json::Value::Array(items) => {
                let sanitized = items
                    .iter()
                    .map(|item| self.sanitize_json_value(item, depth + 1, max_depth))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(serde_json::Value::Array(sanitized))
            }
            serde_json::Value::String(s) => Ok(serde_json::Value::String(
                self.clean_string(s, MAX_STRING_LENGTH),
            )),
            other => Ok(other.clone()),
        }
    }

    /// Sanitize markdown content against XSS and injection.
    ///
    /// Link targets are validated before the dangerous-pattern pass so a
    /// `javascript:` link is reported as blocked rather than silently
    /// de-schemed.
    pub fn sanitize_markdown(&self, content: &str, allow_html: bool) -> String {
        self.bump_total();

        if content.is_empty() {
            return String::new();
        }

        let mut content = CONTROL_CHARS.replace_all(content, "").into_owned();

        if content.chars().count() > MAX_STRING_LENGTH {
            tracing::warn!(target: "security::sanitize", "Markdown content too long: {} chars", content.chars().count());
            content = content.chars().take(MAX_STRING_LENGTH).collect();
            self.bump_modified();
        }

        content = self.sanitize_markdown_urls(&content);

        for pattern in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(&content) {
                tracing::warn!(target: "security::sanitize", "Dangerous pattern found in markdown: {}", pattern.as_str());
                content = pattern.replace_all(&content, "").into_owned();
                self.bump_modified();
            }
        }

        content = if allow_html {
            selective_html_escape(&content)
        } else {
            escape_html(&content)
        };

        // Neutralize command-prefix patterns at line start
        content
            .split('\n')
            .map(|line| {
                if line.trim_start().starts_with('!') {
                    format!("\\{}", line)
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn sanitize_markdown_urls(&self, content: &str) -> String {
        MARKDOWN_LINK
            .replace_all(content, |caps: &regex::Captures<'_>| {
                let text = &caps[1];
                let url = caps[2].trim();

                if url.len() > MAX_URL_LENGTH {
                    tracing::warn!(target: "security::sanitize", "URL too long: {} chars", url.len());
                    return format!("[{}](#invalid-url)", text);
                }

                let lowered = url.to_ascii_lowercase();
                if lowered.starts_with("javascript:")
                    || lowered.starts_with("data:")
                    || lowered.starts_with("vbscript:")
                {
                    let head: String = url.chars().take(50).collect();
                    tracing::warn!(target: "security::sanitize", "Blocked dangerous URL: {}", head);
                    self.bump_blocked();
                    return format!("[{}](#blocked-url)", text);
                }

                if let Some(scheme) = url_scheme(url) {
                    if !ALLOWED_URL_SCHEMES.contains(&scheme.as_str()) {
                        tracing::warn!(target: "security::sanitize", "Blocked URL scheme: {}", scheme);
                        self.bump_blocked();
                        return format!("[{}](#blocked-scheme)", text);
                    }
                }

                caps[0].to_string()
            })
            .into_owned()
    }

    /// Sanitize a filename against path injection.
    ///
    /// Never returns a string containing `/`, `\`, or `..`; never empty;
    /// result length at most 255 characters with a short extension kept.
    pub fn sanitize_filename(&self, filename: &str) -> String {
        if filename.is_empty() {
            return "unnamed_file".to_string();
        }

        // Control bytes go first so their removal cannot splice a new ".."
        let mut sanitized = CONTROL_CHARS.replace_all(filename, "").into_owned();
        while sanitized.contains("..") {
            sanitized = sanitized.replace("..", "_");
        }
        for ch in ['/', '\\', '~', ':', '*', '?', '"', '<', '>', '|', '\0', '\n', '\r', '\t'] {
            sanitized = sanitized.replace(ch, "_");
        }

        let chars: Vec<char> = sanitized.chars().collect();
        let max_length = 255;
        if chars.len() > max_length {
            // Keep a trailing extension of at most 20 characters
            let dot = chars.iter().rposition(|&c| c == '.');
            sanitized = match dot {
                Some(pos) if pos > 0 && pos + 20 >= chars.len() => {
                    let ext: String = chars[pos..].iter().collect();
                    let keep = max_length - ext.chars().count();
                    let mut head: String = chars[..keep].iter().collect();
                    head.push_str(&ext);
                    head
                }
                _ => chars[..max_length].iter().collect(),
            };
        }

        let trimmed = sanitized.trim();
        if trimmed.is_empty() || ["", ".", "..", "CON", "PRN", "AUX", "NUL"].contains(&trimmed) {
            return "unnamed_file".to_string();
        }

        sanitized
    }

    /// Sliding-window rate limit check.
    ///
    /// Returns `true` when the request is within the limit; a `false` result
    /// increments `blocked_attempts` and records nothing, so a denied caller
    /// does not consume window capacity.
    pub fn check_rate_limit(
        &self,
        identifier: &str,
        max_requests: usize,
        window_seconds: u64,
    ) -> bool {
        let now = Instant::now();
        let window = Duration::from_secs(window_seconds);

        let mut limiter = resilient_lock(&self.rate_limiter);
        let entries = limiter.entry(identifier.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max_requests {
            tracing::warn!(target: "security::sanitize", "Rate limit exceeded for {}", identifier);
            drop(limiter);
            self.bump_blocked();
            return false;
        }

        entries.push(now);
        true
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> SanitizationStats {
        *resilient_lock(&self.stats)
    }

    /// Reset statistics, e.g. after exporting them for monitoring.
    pub fn reset_stats(&self) {
        *resilient_lock(&self.stats) = SanitizationStats::default();
    }

    fn clean_string(&self, text: &str, max_length: usize) -> String {
        let cleaned = CONTROL_CHARS.replace_all(text, "");
        if cleaned.chars().count() > max_length {
            self.bump_modified();
            cleaned.chars().take(max_length).collect()
        } else {
            cleaned.into_owned()
        }
    }

    fn bump_total(&self) {
        resilient_lock(&self.stats).total_sanitizations += 1;
    }

    fn bump_blocked(&self) {
        resilient_lock(&self.stats).blocked_attempts += 1;
    }

    fn bump_modified(&self) {
        resilient_lock(&self.stats).modified_inputs += 1;
    }
}

/// Extract a URL scheme when one is syntactically present.
fn url_scheme(url: &str) -> Option<String> {
    let colon = url.find(':')?;
    if let Some(stop) = url.find(&['/', '?', '#'][..]) {
        if stop < colon {
            return None;
        }
    }
    let scheme = &url[..colon];
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

/// Escape all HTML-significant characters.
fn escape_html(content: &str) -> String {
    content
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Escape HTML while preserving a fixed set of safe formatting tags.
fn selective_html_escape(content: &str) -> String {
    let mut content = content.to_string();
    for tag in SAFE_HTML_TAGS {
        content = content.replace(&format!("<{}>", tag), &format!("__SAFE_OPEN_{}__", tag));
        content = content.replace(&format!("</{}>", tag), &format!("__SAFE_CLOSE_{}__", tag));
    }
    content = escape_html(&content);
    for tag in SAFE_HTML_TAGS {
        content = content.replace(&format!("__SAFE_OPEN_{}__", tag), &format!("<{}>", tag));
        content = content.replace(&format!("__SAFE_CLOSE_{}__", tag), &format!("</{}>", tag));
    }
    content
}
