//! Pairing-key and session-token handshake, driven by link events.

use crate::codec::{Credential, HandshakeReply, ProtocolCodec, SessionToken};
use crate::error::Result;
use crate::state::{HandshakeStep, SessionState};
use log::{debug, info, warn};

/// What the core has to do after the link came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    /// Commands may flow.
    Active,
    /// A handshake request of this kind has to go out first.
    Request(HandshakeStep),
}

/// Outcome of an unauthorized reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The token expired; a fresh auth request is needed.
    SessionExpired,
    /// The device refused the stored credential itself.
    CredentialRejected,
    /// Nothing was pending; ignored.
    Unexpected,
}

pub struct SessionNegotiator {
    id: String,
    state: SessionState,
    requires_session: bool,
    credential: Option<Credential>,
    token: Option<SessionToken>,
}

impl SessionNegotiator {
    pub fn new(id: &str, requires_session: bool, credential: Option<Credential>) -> Self {
        Self {
            id: id.to_string(),
            state: SessionState::Unpaired,
            requires_session,
            credential,
            token: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.token.as_ref()
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Decides the first step on a fresh connection.
    pub fn on_connected(&mut self) -> SessionStep {
        if !self.requires_session || self.token.is_some() {
            self.state = SessionState::SessionActive;
            return SessionStep::Active;
        }
        let step = if self.credential.is_some() {
            HandshakeStep::SessionToken
        } else {
            HandshakeStep::PairingKey
        };
        debug!("Device {} needs a handshake: {:?}", self.id, step);
        self.state = SessionState::PairingRequested(step);
        SessionStep::Request(step)
    }

    /// Builds the wire request for `step`.
    pub fn request_frame<C: ProtocolCodec>(&self, codec: &mut C, step: HandshakeStep) -> Result<Vec<u8>> {
        match (step, self.credential.as_ref()) {
            (HandshakeStep::SessionToken, Some(credential)) => codec.encode_auth_request(credential),
            _ => codec.encode_pairing_request(),
        }
    }

    /// Returns true when the reply activated the session.
    pub fn on_handshake(&mut self, reply: HandshakeReply) -> bool {
        match (self.state, reply) {
            (SessionState::PairingRequested(HandshakeStep::SessionToken), HandshakeReply::Token(token)) => {
                info!("Session established with device {}", self.id);
                self.token = Some(token);
                self.state = SessionState::SessionActive;
                true
            }
            (SessionState::PairingRequested(HandshakeStep::PairingKey), HandshakeReply::PairingKeyShown) => {
                info!(
                    "Device {} is displaying its pairing key; configure it as the credential",
                    self.id
                );
                false
            }
            (state, reply) => {
                warn!(
                    "Unexpected handshake reply from device {} in state {:?}: {:?}",
                    self.id, state, reply
                );
                false
            }
        }
    }

    pub fn on_unauthorized(&mut self) -> AuthFailure {
        match self.state {
            SessionState::SessionActive if self.requires_session => {
                info!("Session of device {} expired, re-authenticating", self.id);
                self.token = None;
                self.state = SessionState::PairingRequested(HandshakeStep::SessionToken);
                AuthFailure::SessionExpired
            }
            SessionState::PairingRequested(_) => {
                warn!("Device {} rejected the configured credential", self.id);
                AuthFailure::CredentialRejected
            }
            _ => {
                debug!("Ignoring unauthorized reply from device {} in state {:?}", self.id, self.state);
                AuthFailure::Unexpected
            }
        }
    }

    /// The link went down. Returns whether a session was active. The token is kept.
    pub fn on_link_lost(&mut self) -> bool {
        let was_active = self.state.is_active();
        self.state = SessionState::Unpaired;
        was_active
    }
}
