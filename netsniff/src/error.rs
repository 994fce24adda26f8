//! Error types for capture sessions.
use thiserror::Error;

/// Everything that can go wrong while acquiring frames.
///
/// Only [`CaptureError::CaptureUnavailable`] and [`CaptureError::SubprocessCrash`]
/// ever reach the caller of a session; the rest are recovered internally by
/// moving on to the next backend or dropping a single frame.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The backend executable could not be found.
    #[error("{backend}: executable not found")]
    BackendUnavailable { backend: &'static str },

    /// The backend started but the OS refused it capture rights.
    #[error("{backend}: insufficient privileges ({detail})")]
    PrivilegeDenied { backend: &'static str, detail: String },

    /// The backend produced nothing within the startup window.
    #[error("{backend}: no output within {waited_ms}ms")]
    NoOutput { backend: &'static str, waited_ms: u64 },

    /// The subprocess could not be spawned at all.
    #[error("{backend}: failed to spawn: {source}")]
    SpawnFailed {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The active backend exited or broke its output stream mid-session.
    #[error("{backend}: capture process ended unexpectedly ({detail})")]
    SubprocessCrash { backend: &'static str, detail: String },

    /// A single unit of backend output could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Every backend in the chain failed.
    #[error("no capture backend available (tried: {tried})")]
    CaptureUnavailable { tried: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Heuristic used on backend stderr / error text to spot permission failures.
pub fn looks_like_privilege_error(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    ["permission denied", "operation not permitted", "you don't have permission", "password is required", "a terminal is required"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_errors_are_detected() {
        assert!(looks_like_privilege_error(
            "tcpdump: eth0: You don't have permission to capture on that device"
        ));
        assert!(looks_like_privilege_error("socket: Operation not permitted"));
        assert!(looks_like_privilege_error("sudo: a password is required"));
        assert!(!looks_like_privilege_error("listening on eth0"));
    }
}
