use std::path::PathBuf;

/// Typed error taxonomy surfaced at every public boundary of this crate.
///
/// Callers categorise failures by variant, never by matching on a message
/// string. See SPEC_FULL.md §7 for the propagation policy of each kind.
#[derive(Debug, thiserror::Error)]
pub enum CaamError {
    #[error("validation error on field `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict requires --force: {reason}")]
    ConflictRequiresForce { reason: String },

    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    #[error("transport error talking to {peer}: {kind}")]
    Transport { peer: String, kind: TransportErrorKind },

    #[error("corruption detected: {reason}")]
    Corruption { reason: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sub-taxonomy for transport failures, so callers can discriminate without
/// string matching (§4.5's "every user-visible sync failure is attributable
/// to one of these").
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("timed out")]
    Timeout,
    #[error("authentication exhausted")]
    Auth,
    #[error("network error")]
    Network,
    #[error("host key mismatch")]
    HostKeyMismatch,
    #[error("sftp error")]
    Sftp,
    #[error("unknown transport failure")]
    Unknown,
}

impl CaamError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CaamError::Validation { field: field.into(), message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CaamError::NotFound { what: what.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        CaamError::ConflictRequiresForce { reason: reason.into() }
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        CaamError::Auth { reason: reason.into() }
    }

    pub fn transport(peer: impl Into<String>, kind: TransportErrorKind) -> Self {
        CaamError::Transport { peer: peer.into(), kind }
    }

    pub fn corruption(reason: impl Into<String>) -> Self {
        CaamError::Corruption { reason: reason.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaamError::Io { path: path.into(), source }
    }

    /// Maps this error onto the exit-code contract a front-end is expected to
    /// honor (SPEC_FULL.md §6).
    pub fn exit_code(&self) -> u8 {
        match self {
            CaamError::Validation { .. } => 2,
            CaamError::Corruption { .. } => 3,
            CaamError::Auth { .. } => 4,
            CaamError::Transport { .. } => 5,
            CaamError::ConflictRequiresForce { .. } => 6,
            CaamError::NotFound { .. } => 1,
            CaamError::Internal(_) | CaamError::Io { .. } => 1,
        }
    }

    /// True for the "precondition, not failure" predicate the sync planner
    /// needs to discriminate missing-on-one-side from a real error (§4.6).
    pub fn is_not_found(&self) -> bool {
        matches!(self, CaamError::NotFound { .. })
            || matches!(self, CaamError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, CaamError>;
