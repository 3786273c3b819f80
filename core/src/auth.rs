/// Session credentials presented to the duplex transport
use crate::error::{ChatError, Result};
use crate::types::UserId;
use std::fmt;

/// Opaque bearer token. Only its three-segment shape is checked client-side.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Cheap well-formedness gate before attempting to connect
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(ChatError::InvalidToken(format!(
                "expected 3 segments, got {}",
                segments.len()
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(ChatError::InvalidToken("empty segment".to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Never print the token itself
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: UserId,
    pub token: AuthToken,
}

impl Credentials {
    pub fn new(user_id: UserId, token: AuthToken) -> Self {
        Self { user_id, token }
    }
}
