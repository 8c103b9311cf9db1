// ── Core error types ──
//
// What get/set callers and the embedding process see. Collaborator
// failures arrive as `meshbridge_api::Error` and are folded into the
// connection/validation taxonomy here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    // ── Connection errors ────────────────────────────────────────────
    /// The link is down, not started, or the wire request failed.
    #[error("{message}{}", .cause.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    Connection {
        message: String,
        cause: Option<String>,
    },

    #[error("Timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Value errors ─────────────────────────────────────────────────
    /// The device rejected the value, e.g. out of range.
    #[error("{detail}")]
    Validation { detail: String },

    #[error("Wrong format")]
    WrongFormat,

    /// An option value was written before its base field ever reported.
    #[error("Please, wait for data changes")]
    AwaitingSample,

    // ── Setup errors ─────────────────────────────────────────────────
    #[error("{message}")]
    Unknown { message: String },

    #[error("{operation} is not supported: {reason}")]
    Unsupported {
        operation: &'static str,
        reason: String,
    },

    #[error("Property not found: {property}")]
    PropertyNotFound { property: String },

    #[error("Node not found: {identity}")]
    NodeNotFound { identity: String },

    #[error("Invalid node schema: {message}")]
    Schema { message: String },

    // ── Persistence errors ───────────────────────────────────────────
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn not_connected() -> Self {
        Self::Connection {
            message: "coordinator is not connected".into(),
            cause: None,
        }
    }

    pub fn update_failed(cause: impl Into<String>) -> Self {
        Self::Connection {
            message: "could not update device value".into(),
            cause: Some(cause.into()),
        }
    }

    /// Translate a wire failure from a get/set round trip.
    ///
    /// Range violations keep their detail, everything else is reported
    /// as a failed update carrying the cause.
    pub fn from_wire(err: &meshbridge_api::Error) -> Self {
        match err.range_detail() {
            Some(detail) => Self::Validation {
                detail: detail.to_owned(),
            },
            None => Self::update_failed(err.to_string()),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

// ── Conversion from collaborator errors ──────────────────────────────

impl From<meshbridge_api::Error> for BridgeError {
    fn from(err: meshbridge_api::Error) -> Self {
        match err {
            meshbridge_api::Error::OutOfRange { detail } => Self::Validation {
                detail: detail.trim().to_owned(),
            },
            meshbridge_api::Error::Timeout { timeout_secs } => Self::Timeout { timeout_secs },
            other => Self::Connection {
                message: other.to_string(),
                cause: None,
            },
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}
