// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Workspace signing secret.
//!
//! One HMAC key per workspace, stored as 64 hex characters in
//! `auth/.secret_key` with owner-only permissions. Tokens signed with this
//! key must survive restarts, so a failure to persist the key is fatal to
//! workspace initialization; there is no in-memory fallback.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::Path;
use subtle::ConstantTimeEq;

use crate::error::SecurityError;

type HmacSha256 = Hmac<Sha256>;

const SECRET_FILE_NAME: &str = ".secret_key";

/// HMAC-SHA256 signing key for capability tokens.
#[derive(Clone)]
pub struct SecretKey {
    key: String,
}

impl SecretKey {
    /// Wrap an externally supplied key string.
    pub fn from_string(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Load the workspace secret, generating and persisting one on first use.
    ///
    /// The key file is written with mode 0600 on Unix. Any I/O failure is
    /// surfaced to the caller; minted tokens would not survive a restart if
    /// the key only lived in memory.
    pub fn load_or_create(auth_dir: &Path) -> Result<Self, SecurityError> {
        let key_path = auth_dir.join(SECRET_FILE_NAME);

        if key_path.exists() {
            let key = fs::read_to_string(&key_path)?.trim().to_string();
            return Ok(Self { key });
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = hex::encode(bytes);

        fs::write(&key_path, &key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&key_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&key_path, perms)?;
        }

        tracing::info!(target: "security::secret", "Generated new workspace signing key");
        Ok(Self { key })
    }

    /// Sign a raw token body, returning the hex HMAC-SHA256 signature.
    pub fn sign(&self, raw: &str) -> String {
        let mut mac = self.mac();
        mac.update(raw.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a signature over a raw token body in constant time.
    pub fn verify(&self, raw: &str, signature: &str) -> bool {
        let expected = self.sign(raw);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }

    /// JUSTIFICATION for .expect(): HMAC-SHA256 accepts keys of any length,
    /// so constructing the MAC from a byte slice cannot fail.
    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.key.as_bytes()).expect("HMAC accepts any key length")
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_created_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let first = SecretKey::load_or_create(dir.path()).unwrap();
        let second = SecretKey::load_or_create(dir.path()).unwrap();
        assert_eq!(first.sign("body"), second.sign("body"));

        let on_disk = fs::read_to_string(dir.path().join(SECRET_FILE_NAME)).unwrap();
        assert_eq!(on_disk.trim().len(), 64);
        assert!(on_disk.trim().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        SecretKey::load_or_create(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(SECRET_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_sign_and_verify() {
        let key = SecretKey::from_string("0123abcd".repeat(8));
        let sig = key.sign("hello");
        assert_eq!(sig.len(), 64);
        assert!(key.verify("hello", &sig));
        assert!(!key.verify("hello", "deadbeef"));
        assert!(!key.verify("other", &sig));
    }

    #[test]
    fn test_different_keys_disagree() {
        let a = SecretKey::from_string("a".repeat(64));
        let b = SecretKey::from_string("b".repeat(64));
        let sig = a.sign("body");
        assert!(!b.verify("body", &sig));
    }
}
