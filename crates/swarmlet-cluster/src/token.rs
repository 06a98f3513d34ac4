//! Join token management.
//!
//! A token is 32 random bytes shown as URL-safe base64. Any node that
//! holds the cluster shared secret can validate a token it has never
//! seen by recomputing `sha256(secret || token_bytes)` and comparing it
//! to a stored hash. An empty token set accepts any well-formed token
//! (first-node bootstrap).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// A join token and its validation hash.
#[derive(Debug, Clone)]
pub struct JoinToken {
    pub value: String,
    pub hash: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

struct TokenInner {
    tokens: HashMap<String, JoinToken>,
}

/// Manages join tokens for cluster boot authorization.
pub struct TokenManager {
    secret: Vec<u8>,
    inner: RwLock<TokenInner>,
}

impl TokenManager {
    /// Create a token manager with the given shared secret, generating
    /// a random 32-byte secret when none is supplied.
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        let secret = match secret {
            Some(s) if !s.is_empty() => s,
            _ => {
                let mut s = vec![0u8; 32];
                OsRng.fill_bytes(&mut s);
                s
            }
        };
        TokenManager {
            secret,
            inner: RwLock::new(TokenInner {
                tokens: HashMap::new(),
            }),
        }
    }

    /// The cluster shared secret (also the gossip encryption key).
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Generate and remember a fresh join token.
    pub fn generate(&self) -> String {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);

        let value = URL_SAFE.encode(raw);
        let hash = self.token_hash(&raw);

        let token = JoinToken {
            value: value.clone(),
            hash,
            created_at: epoch_secs(),
            expires_at: None,
        };
        self.inner
            .write()
            .expect("token lock")
            .tokens
            .insert(value.clone(), token);
        value
    }

    /// Validate a presented token.
    ///
    /// Accepted when the token is stored (and unexpired), when its
    /// keyed hash matches any stored token's hash, or when no tokens
    /// are known yet (bootstrap). Revocation removes the stored entry
    /// only; a handshake already in flight is not torn down.
    pub fn validate(&self, token: &str) -> bool {
        let mut inner = self.inner.write().expect("token lock");

        if let Some(stored) = inner.tokens.get(token) {
            if let Some(expires) = stored.expires_at {
                if epoch_secs() > expires {
                    inner.tokens.remove(token);
                    return false;
                }
            }
            return true;
        }

        let raw = match URL_SAFE.decode(token) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let hash = self.token_hash(&raw);
        if inner.tokens.values().any(|t| t.hash == hash) {
            return true;
        }

        // First-node bootstrap: nothing to validate against yet.
        inner.tokens.is_empty()
    }

    /// Revoke a token by removal.
    pub fn revoke(&self, token: &str) {
        self.inner.write().expect("token lock").tokens.remove(token);
    }

    /// All currently stored token values.
    pub fn list(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("token lock")
            .tokens
            .keys()
            .cloned()
            .collect()
    }

    fn token_hash(&self, raw: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(raw);
        hex::encode(hasher.finalize())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
