//! Mints the single-use credentials that admit sibling connections.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Token rejection reasons. The strings are part of the wire contract: they
/// travel back to the client verbatim in the connector's error reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token does not exists")]
    Missing,
    #[error("Token's username or connection name is wrong")]
    Mismatch,
}

/// Generates opaque one-shot tokens bound to `(username, connection name)`.
///
/// A token admits exactly one connection: `release` consumes it on success
/// and leaves it in place otherwise, so a mistyped name cannot burn the
/// credential.
#[derive(Debug, Default)]
pub struct TokenGenerator {
    inner: Mutex<TokenTable>,
}

#[derive(Debug, Default)]
struct TokenTable {
    tokens: HashMap<String, (String, String)>,
    minted: u64,
}

impl TokenGenerator {
    pub fn new() -> TokenGenerator {
        TokenGenerator::default()
    }

    /// Mint a token for the given user's pending connection name.
    pub fn generate(&self, username: &str, connection_name: &str) -> String {
        let mut table = self.inner.lock().unwrap();
        table.minted += 1;
        // Random part for unguessability, counter part for uniqueness.
        let token = format!("{:016x}{:08x}", rand::random::<u64>(), table.minted);
        table.tokens.insert(
            token.clone(),
            (username.to_string(), connection_name.to_string()),
        );
        token
    }

    /// Verify the presented token against `(username, connection_name)` and
    /// consume it.
    pub fn release(
        &self,
        token: &str,
        username: &str,
        connection_name: &str,
    ) -> Result<(), TokenError> {
        let mut table = self.inner.lock().unwrap();
        let (real_username, real_name) = table.tokens.get(token).ok_or(TokenError::Missing)?;
        if real_username != username || real_name != connection_name {
            return Err(TokenError::Mismatch);
        }
        table.tokens.remove(token);
        Ok(())
    }

    /// Drop a token that will never be used (an admission that failed after
    /// minting).
    pub fn discard(&self, token: &str) {
        self.inner.lock().unwrap().tokens.remove(token);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().tokens.len()
    }
}
