//! The closed set of coding-agent providers this crate knows about.
//!
//! Per SPEC_FULL.md Design Notes, provider dispatch is a tagged enum rather
//! than string matching: adding a provider means extending this enum, and
//! every `match` over it becomes a compile-time checklist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Claude, Provider::Codex, Provider::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }

    /// Credential file basenames this provider reads, in preference order
    /// (first entry wins when more than one is present; SPEC_FULL §4.3).
    pub fn credential_basenames(&self) -> &'static [&'static str] {
        match self {
            Provider::Claude => &[".credentials.json", ".claude.json"],
            Provider::Codex => &["auth.json"],
            Provider::Gemini => &["settings.json"],
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = crate::error::CaamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            "gemini" => Ok(Provider::Gemini),
            other => Err(crate::error::CaamError::validation(
                "provider",
                format!("unknown provider `{other}`, expected one of claude, codex, gemini"),
            )),
        }
    }
}

/// A profile name: UTF-8, no path separators, `_`-prefixed reserved for
/// system use (SPEC_FULL §3/§6).
pub fn validate_profile_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty() {
        return Err(crate::error::CaamError::validation("profile", "profile name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(crate::error::CaamError::validation(
            "profile",
            "profile name must not contain path separators",
        ));
    }
    Ok(())
}

/// True when `name` is reserved for system use (e.g. `_original`).
pub fn is_system_profile(name: &str) -> bool {
    name.starts_with('_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_from_str() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_provider_is_validation_error() {
        let err = "chatgpt".parse::<Provider>().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn reserved_profile_names_detected() {
        assert!(is_system_profile("_original"));
        assert!(!is_system_profile("work"));
    }
}
