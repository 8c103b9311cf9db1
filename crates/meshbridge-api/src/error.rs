use thiserror::Error;

/// Top-level error type for the `meshbridge-api` crate.
///
/// Covers every failure a collaborator can report back to the core:
/// coordinator lifecycle, wire-level requests, and converter routines.
/// `meshbridge-core` maps these into its own connection/validation taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Coordinator ─────────────────────────────────────────────────
    /// The adapter (serial or TCP radio link) failed.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// The coordinator has not been started yet.
    #[error("Coordinator is not started")]
    NotStarted,

    /// A coordinator round-trip did not settle in time.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// No device with this identity is known to the coordinator.
    #[error("Device not found: {identity}")]
    DeviceNotFound { identity: String },

    // ── Wire ────────────────────────────────────────────────────────
    /// The device rejected a value as out of range.
    #[error("Value out of range: {detail}")]
    OutOfRange { detail: String },

    /// A request reached the radio but failed (no ACK, route error, ...).
    #[error("Request failed: {0}")]
    Request(String),

    // ── Converters ──────────────────────────────────────────────────
    /// A decode/encode/configure routine failed.
    #[error("Converter error: {message}")]
    Converter { message: String },

    /// The collaborator does not implement this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// The range detail if this is a wire-level range violation.
    pub fn range_detail(&self) -> Option<&str> {
        match self {
            Self::OutOfRange { detail } => Some(detail.trim()),
            _ => None,
        }
    }
}
