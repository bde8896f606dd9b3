//! The seam between the generic link core and a device's wire protocol.

use crate::config::DeviceConfig;
use crate::error::{DecodeError, LinkError, Result};
use crate::poll::PollTable;
use crate::state::StateField;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Statically configured secret: an LG pairing key or an inverter serial number.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for values of two characters or less, which count as
    /// "no key configured".
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.len() <= 2 {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Short-lived token handed out by the device after a successful auth request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How the device treats the transport between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// One long-lived connection carries every request.
    Persistent,
    /// The device closes the connection after answering each request (HTTP style).
    PerRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeReply {
    /// The device accepted a pairing-key request and shows the key on screen.
    PairingKeyShown,
    Token(SessionToken),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFault {
    /// 401 or equivalent: the session token or credential is not accepted.
    Unauthorized,
    Rejected(String),
}

/// One decoded unit received from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Handshake(HandshakeReply),
    /// Status report. `topic` keys the poll table (e.g. `"PW"` for AVR power).
    Status {
        topic: Option<&'static str>,
        fields: Vec<StateField>,
    },
    CommandAck {
        fields: Vec<StateField>,
    },
    Error(DeviceFault),
}

impl Reply {
    pub fn status(fields: Vec<StateField>) -> Self {
        Reply::Status {
            topic: None,
            fields,
        }
    }

    pub fn ack() -> Self {
        Reply::CommandAck { fields: Vec::new() }
    }
}

/// Encodes commands for a device and decodes what it sends back.
///
/// Implementations keep whatever partial-frame state they need; the core owns
/// the receive buffer and calls `decode` until it returns `Ok(None)`.
pub trait ProtocolCodec: Send + 'static {
    /// Closed set of commands understood by this device.
    type Command: Clone + fmt::Debug + Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Adjusts protocol-specific defaults (port, heartbeat, policies).
    fn preset(&self, config: DeviceConfig) -> DeviceConfig {
        config
    }

    fn exchange(&self) -> Exchange {
        Exchange::Persistent
    }

    /// Whether commands may only be sent after a pairing/session handshake.
    fn requires_session(&self) -> bool {
        false
    }

    fn encode_pairing_request(&mut self) -> Result<Vec<u8>> {
        Err(LinkError::HandshakeUnsupported)
    }

    fn encode_auth_request(&mut self, _credential: &Credential) -> Result<Vec<u8>> {
        Err(LinkError::HandshakeUnsupported)
    }

    /// Encoders take `&mut self` so a codec can remember what it asked for.
    fn encode(&mut self, command: &Self::Command, token: Option<&SessionToken>) -> Result<Vec<u8>>;

    /// Status polls sent on idle heartbeats, keyed by the last status topic.
    fn poll_table(&self) -> PollTable<Self::Command> {
        PollTable::none()
    }

    /// Pops one reply off the front of `buf`. `Ok(None)` means more bytes are needed.
    fn decode(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError>;

    /// The peer closed the connection with `buf` still pending. Frames
    /// delimited by the close itself are completed here.
    fn decode_eof(&mut self, _buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
        Ok(None)
    }

    /// Called on every fresh connection, before any bytes arrive.
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_is_trimmed_and_masked() {
        let credential = Credential::new("  482915 ").unwrap();
        assert_eq!(credential.as_str(), "482915");
        assert_eq!(format!("{:?}", credential), "Credential(***)");
        assert!(Credential::new("ab").is_none());
    }
}
