//! In-memory bearer-token store.
//!
//! Any token present in the store is valid; the mapped value is
//! reserved for future account data and unused today. Tokens live for
//! the process lifetime and are never persisted.

use std::collections::HashMap;
use std::sync::Mutex;

/// Fixed development token so a fresh server is usable without a
/// Register round-trip.
// TODO: gate the seeded token behind a --dev flag before any shared deployment.
pub const DEV_TOKEN: &str = "dGhpcy1pcy1hLWRldi1vbmx5LXRva2VuLTAxMjM0NTY=";

#[derive(Debug)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(DEV_TOKEN.to_string(), String::new());
        Self {
            tokens: Mutex::new(tokens),
        }
    }

    pub fn insert(&self, token: impl Into<String>, value: impl Into<String>) {
        self.tokens
            .lock()
            .expect("token store lock poisoned")
            .insert(token.into(), value.into());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens
            .lock()
            .expect("token store lock poisoned")
            .get(token)
            .cloned()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .expect("token store lock poisoned")
            .contains_key(token)
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}
