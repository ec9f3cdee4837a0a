//! Error normalization for the shell-facing boundary.
//!
//! The remote service reports failures as free-text messages (`"5 NOT_FOUND:
//! ..."`, `"PERMISSION_DENIED: ..."`), not a typed enum, so classification is
//! substring matching over the raw message. This is a best-effort heuristic:
//! new backend error strings degrade to [`ErrorKind::Unknown`] rather than
//! breaking callers.

use thiserror::Error;

/// Stable user-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Service account file missing, unreadable, or unparsable.
    CredentialRead,
    DatabaseNotFound,
    PermissionDenied,
    Timeout,
    /// Anything else, raw message passed through unchanged.
    Unknown,
}

/// A categorized failure. The message always carries the original diagnostic
/// detail so the raw backend text stays visible to the user.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new(
            ErrorKind::Unknown,
            "Not connected to Firestore. Connect with a service account first.",
        )
    }

    pub fn credential_read(source: &anyhow::Error) -> Self {
        Self::new(
            ErrorKind::CredentialRead,
            format!("Unable to read service account file: {}", error_chain(source)),
        )
    }

    pub fn timeout(secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Operation timed out after {secs} seconds"),
        )
    }
}

struct Pattern {
    needles: &'static [&'static str],
    kind: ErrorKind,
    prefix: &'static str,
}

/// Classification table, first match wins. Kept as data so new categories can
/// be added without touching call sites.
const PATTERNS: &[Pattern] = &[
    Pattern {
        needles: &["NOT_FOUND"],
        kind: ErrorKind::DatabaseNotFound,
        prefix: "Firestore database not found",
    },
    Pattern {
        needles: &["PERMISSION_DENIED"],
        kind: ErrorKind::PermissionDenied,
        prefix: "Permission denied",
    },
    Pattern {
        needles: &["DEADLINE_EXCEEDED", "timed out"],
        kind: ErrorKind::Timeout,
        prefix: "Operation timed out",
    },
];

/// Map a raw remote or script failure message to a [`NormalizedError`].
/// Pure: the same input always yields the same category.
pub fn normalize_remote(raw: &str) -> NormalizedError {
    for pattern in PATTERNS {
        if pattern.needles.iter().any(|needle| raw.contains(needle)) {
            return NormalizedError::new(pattern.kind, format!("{}: {raw}", pattern.prefix));
        }
    }
    NormalizedError::new(ErrorKind::Unknown, raw)
}

/// Flatten an error and its cause chain into one diagnostic string.
pub fn error_chain(e: &anyhow::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.chain().skip(1) {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
    }
    msg
}
