//! Error types and result definitions for the tuyactl crate.
//! Every failure is terminal for the command that produced it; numeric codes
//! follow the TinyTuya convention so callers can report them consistently.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to a Tuya device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaError {
    /// TCP connection could not be established, or the session is already closed
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Session key negotiation (v3.4+) failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Payload could not be encrypted or failed to decrypt/authenticate
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Malformed wire frame or integrity trailer mismatch
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// No response from the device within the deadline
    #[error("Timeout waiting for device")]
    Timeout,

    /// The device answered with the wrong sequence number or command
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A status filter path does not exist in the response
    #[error("Path '{path}' not found (missing segment '{segment}')")]
    PathNotFound { path: String, segment: String },

    /// Socket error after the connection was established
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// The local key is not 16 bytes long
    #[error("Local key must be 16 bytes")]
    InvalidKey,

    #[error("Unsupported protocol version '{0}'")]
    UnsupportedVersion(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TuyaError::Timeout,
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Connect(_) => ERR_CONNECT,
            TuyaError::Handshake(_) => ERR_KEY_OR_VER,
            TuyaError::Crypto(_) => ERR_KEY_OR_VER,
            TuyaError::Frame(_) => ERR_PAYLOAD,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::Protocol(_) => ERR_STATE,
            TuyaError::PathNotFound { .. } => ERR_PATH,
            TuyaError::Io(_) => ERR_OFFLINE,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::InvalidKey => ERR_KEY_OR_VER,
            TuyaError::UnsupportedVersion(_) => ERR_PARAMS,
        }
    }

    /// Message from the error code table, e.g. for a status line next to the code.
    pub fn description(&self) -> &'static str {
        get_error_message(self.code())
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device in Unknown State",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_PATH = 916 => "Status Filter Path Not Found",
}
