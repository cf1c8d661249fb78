// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User/tech reason pairs attached to every state transition
//!
//! The user string is safe for operator UIs; the tech string carries
//! diagnostic context and is truncated to a bounded length so a chatty
//! error chain cannot bloat status traffic.

use serde::{Deserialize, Serialize};

/// Maximum length of the tech string, in characters
const MAX_TECH_LEN: usize = 500;

/// A two-audience explanation for a state or transition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub user: String,
    pub tech: String,
}

impl Reason {
    /// Create a reason, truncating the tech string to a bounded length
    pub fn new(user: impl Into<String>, tech: impl Into<String>) -> Self {
        let mut tech: String = tech.into();
        if tech.chars().count() > MAX_TECH_LEN {
            tech = tech.chars().take(MAX_TECH_LEN).collect();
            tech.push('…');
        }
        Self {
            user: user.into(),
            tech,
        }
    }

    /// Create a reason where the user string doubles as the tech string
    pub fn user_only(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(text.clone(), text)
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.tech.is_empty()
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_only_copies_text() {
        let reason = Reason::user_only("Waiting for source");
        assert_eq!(reason.user, "Waiting for source");
        assert_eq!(reason.tech, "Waiting for source");
    }

    #[test]
    fn tech_string_is_truncated() {
        let long = "x".repeat(2000);
        let reason = Reason::new("short", long);
        assert!(reason.tech.chars().count() <= MAX_TECH_LEN + 1);
        assert!(reason.tech.ends_with('…'));
        assert_eq!(reason.user, "short");
    }

    #[test]
    fn display_shows_user_string() {
        let reason = Reason::new("for operators", "for debugging");
        assert_eq!(reason.to_string(), "for operators");
    }
}
