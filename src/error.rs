//! Error types and result definitions for the domolink crate.
//! Includes numeric fault codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Everything that can go wrong while driving a device link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Standard IO error (socket read/write, bind, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// The TCP connection could not be established
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The connect attempt was abandoned by the watchdog
    #[error("Connect attempt timed out")]
    ConnectTimeout,

    /// A send was attempted while the link is down
    #[error("Device not connected")]
    NotConnected,

    /// The command queue rejected a new entry (drop-newest)
    #[error("Command queue full (capacity {0})")]
    QueueFull(usize),

    /// Too many requests without a reply; the device is presumed wedged
    #[error("Device unresponsive: {0} requests outstanding")]
    Wedged(u32),

    /// The codec has no handshake of the requested kind
    #[error("Handshake not supported by this protocol")]
    HandshakeUnsupported,

    /// The device refused the configured credential
    #[error("Credential rejected by device")]
    CredentialRejected,

    /// The device answered a request with an error
    #[error("Device rejected request: {0}")]
    Rejected(String),

    /// A reply could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No command of that name exists for the codec
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Device ID already exists in manager
    #[error("Device ID '{0}' already exists")]
    DuplicateDevice(String),

    /// Device ID not found in manager
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),

    /// The background task of the device has exited
    #[error("Device task stopped")]
    Stopped,
}

/// Failures of `ProtocolCodec::decode`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes do not form a frame of the protocol
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame checksum did not match
    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },

    /// Payload was not valid UTF-8 text
    #[error("invalid UTF-8 in reply")]
    Utf8,

    /// Payload was not valid JSON
    #[error("invalid JSON in reply: {0}")]
    Json(String),
}

/// A specialized Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Json(err.to_string())
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Json(err.to_string())
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(_: std::str::Utf8Error) -> Self {
        DecodeError::Utf8
    }
}

impl LinkError {
    pub fn code(&self) -> u32 {
        match self {
            LinkError::Io(_) => ERR_CONNECT,
            LinkError::Json(_) => ERR_JSON,
            LinkError::ConnectFailed(_) => ERR_CONNECT,
            LinkError::ConnectTimeout => ERR_TIMEOUT,
            LinkError::NotConnected => ERR_OFFLINE,
            LinkError::QueueFull(_) => ERR_QUEUE_FULL,
            LinkError::Wedged(_) => ERR_WEDGED,
            LinkError::HandshakeUnsupported => ERR_FUNCTION,
            LinkError::CredentialRejected => ERR_AUTH,
            LinkError::Rejected(_) => ERR_STATE,
            LinkError::Decode(_) => ERR_PAYLOAD,
            LinkError::UnknownCommand(_) => ERR_FUNCTION,
            LinkError::Config(_) => ERR_PARAMS,
            LinkError::DuplicateDevice(_) => ERR_DUPLICATE,
            LinkError::DeviceNotFound(_) => ERR_PARAMS,
            LinkError::Stopped => ERR_OFFLINE,
        }
    }

    /// Whether the error ends the current connect attempt or connection.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_)
                | LinkError::ConnectFailed(_)
                | LinkError::ConnectTimeout
                | LinkError::Wedged(_)
        )
    }
}

define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device Rejected Request",
    ERR_FUNCTION = 907 => "Function Not Supported by Device",
    ERR_AUTH = 908 => "Pairing Key or Session Rejected",
    ERR_QUEUE_FULL = 909 => "Command Queue Full",
    ERR_WEDGED = 910 => "Device Unresponsive: Too Many Outstanding Requests",
    ERR_PARAMS = 912 => "Invalid or Missing Parameters",
    ERR_DUPLICATE = 915 => "Device ID already exists",
}
