//! Peer authentication
//!
//! Terminals authenticate with the single allowed client key; admins with
//! a password checked against stored SHA-256 digests.

use std::collections::HashMap;

use russh_keys::key::PublicKey;
use sha2::{Digest, Sha256};

use cs_core::config::ServerConfig;

/// Hex SHA-256 digest of a password, as stored in the admin table
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// The one key every terminal daemon presents
#[derive(Debug, Clone)]
pub struct TerminalKey {
    username: String,
    fingerprint: String,
}

impl TerminalKey {
    /// Accept `username` with the key whose fingerprint is `fingerprint`
    pub fn new(username: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Take both values from the server configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(&config.client_username, &config.client_key_fingerprint)
    }

    /// Whether nothing can ever match
    pub fn is_unset(&self) -> bool {
        self.fingerprint.is_empty()
    }

    /// Check a public-key login
    pub fn verify(&self, user: &str, key: &PublicKey) -> bool {
        !self.is_unset() && user == self.username && key.fingerprint() == self.fingerprint
    }
}

/// Admin name to password digest
#[derive(Debug, Clone, Default)]
pub struct AdminCredentials {
    digests: HashMap<String, String>,
}

impl AdminCredentials {
    /// Build from name/digest pairs
    pub fn new(digests: HashMap<String, String>) -> Self {
        let digests = digests
            .into_iter()
            .map(|(name, digest)| (name, digest.trim().to_ascii_lowercase()))
            .collect();
        Self { digests }
    }

    /// Number of admin accounts
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// Whether no admin can log in
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Check a password login
    pub fn verify(&self, user: &str, password: &str) -> bool {
        let Some(expected) = self.digests.get(user) else {
            return false;
        };
        let presented = hash_password(password);
        // Compare every byte so timing does not depend on the prefix
        expected.len() == presented.len()
            && expected
                .bytes()
                .zip(presented.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::key::KeyPair;

    #[test]
    fn test_hash_password() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_admin_credentials() {
        let mut digests = HashMap::new();
        digests.insert("judge".to_string(), hash_password("s3cret").to_uppercase());
        let creds = AdminCredentials::new(digests);

        assert!(creds.verify("judge", "s3cret"));
        assert!(!creds.verify("judge", "s3cret "));
        assert!(!creds.verify("other", "s3cret"));
        assert_eq!(creds.len(), 1);
    }

    #[test]
    fn test_terminal_key() {
        let key = KeyPair::generate_ed25519().unwrap();
        let public = key.clone_public_key().unwrap();
        let other = KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap();

        let allowed = TerminalKey::new("consys", public.fingerprint());
        assert!(allowed.verify("consys", &public));
        assert!(!allowed.verify("root", &public));
        assert!(!allowed.verify("consys", &other));

        assert!(!TerminalKey::new("consys", "").verify("consys", &public));
    }
}
