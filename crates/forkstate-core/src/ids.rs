//! Session id and secure token generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::session::{SecureToken, SessionId};

/// Default length of generated secure tokens.
pub const DEFAULT_TOKEN_LEN: usize = 32;

/// Source of fresh session identifiers and secure tokens.
pub trait IdGenerator: Send + Sync {
    /// Generate a new session id.
    fn session_id(&self) -> SessionId;

    /// Generate a new secure token.
    fn secure_token(&self) -> SecureToken;
}

/// Generator backed by the thread-local CSPRNG.
///
/// Session ids are non-zero and fit in 63 bits so they survive a round trip
/// through signed integer columns. Tokens are alphanumeric.
#[derive(Debug, Clone)]
pub struct RandomIdGenerator {
    token_len: usize,
}

impl RandomIdGenerator {
    pub fn new(token_len: usize) -> Self {
        Self { token_len }
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_LEN)
    }
}

impl IdGenerator for RandomIdGenerator {
    fn session_id(&self) -> SessionId {
        SessionId(rand::thread_rng().gen_range(1..=i64::MAX as u64))
    }

    fn secure_token(&self) -> SecureToken {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.token_len)
            .map(char::from)
            .collect();
        SecureToken::new(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_length_and_alphabet() {
        let generator = RandomIdGenerator::new(48);
        let token = generator.secure_token();
        assert_eq!(token.as_str().len(), 48);
        assert!(token.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_session_ids_are_positive_and_unique() {
        let generator = RandomIdGenerator::default();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = generator.session_id();
            assert!(id.0 > 0 && id.0 <= i64::MAX as u64);
            assert!(seen.insert(id), "Duplicate session id generated");
        }
    }
}
