//! API bearer-token management.
//!
//! Tokens are 32 random bytes shown as URL-safe base64 and validated by
//! map lookup. Listings mask the token value. Expired tokens are swept
//! by a periodic cleanup the daemon drives.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;

/// A named API token.
#[derive(Debug, Clone, Serialize)]
pub struct ApiToken {
    /// Masked in listings.
    pub token: String,
    pub name: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Manages bearer tokens for the HTTP API.
pub struct ApiTokenManager {
    tokens: RwLock<HashMap<String, ApiToken>>,
}

impl Default for ApiTokenManager {
    fn default() -> Self {
        ApiTokenManager::new()
    }
}

impl ApiTokenManager {
    pub fn new() -> Self {
        ApiTokenManager {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a token. `expires_at` is unix seconds, None for no expiry.
    pub fn generate(&self, name: &str, expires_at: Option<u64>) -> String {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE.encode(raw);

        self.tokens.write().expect("token lock").insert(
            token.clone(),
            ApiToken {
                token: token.clone(),
                name: name.to_string(),
                created_at: epoch_secs(),
                expires_at,
            },
        );
        token
    }

    /// A token is valid when stored and unexpired.
    pub fn validate(&self, token: &str) -> bool {
        let tokens = self.tokens.read().expect("token lock");
        match tokens.get(token) {
            Some(t) => t.expires_at.map(|e| epoch_secs() <= e).unwrap_or(true),
            None => false,
        }
    }

    /// Returns whether the token existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .write()
            .expect("token lock")
            .remove(token)
            .is_some()
    }

    /// Token metadata with values masked.
    pub fn list(&self) -> Vec<ApiToken> {
        self.tokens
            .read()
            .expect("token lock")
            .values()
            .map(|t| ApiToken {
                token: "***".to_string(),
                name: t.name.clone(),
                created_at: t.created_at,
                expires_at: t.expires_at,
            })
            .collect()
    }

    /// Drop expired tokens.
    pub fn cleanup_expired(&self) {
        let now = epoch_secs();
        self.tokens
            .write()
            .expect("token lock")
            .retain(|_, t| t.expires_at.map(|e| now <= e).unwrap_or(true));
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
