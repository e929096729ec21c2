//! Peer identity
//!
//! Peers are addressed by an opaque identifier assigned by the signaling
//! service. The identifier is exchanged out of band (copied, pasted, read
//! aloud) so it stays a plain string.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identifier assigned to a participant by the signaling service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier, trimming surrounding whitespace
    pub fn new(s: impl Into<String>) -> Self {
        let s = s.into();
        let trimmed = s.trim();
        if trimmed.len() == s.len() {
            Self(s)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Parse user input into an identifier, rejecting blank input
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let id = Self::new(s);
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is blank
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
