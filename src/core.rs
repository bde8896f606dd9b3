//! Per-device link core: connection, session, queue and codec glued together.
//!
//! `DeviceCore` is sans-IO. It is driven by three inputs, all from the same
//! task: `submit` for user commands, `on_link_event` for socket completions
//! and `heartbeat` (see `heartbeat.rs`) for the periodic tick. Every output
//! leaves through the `Connector`'s socket or the `DeviceStateSink`.

use crate::codec::{DeviceFault, Exchange, ProtocolCodec, Reply};
use crate::config::{DeviceConfig, QueuePolicy};
use crate::connection::{ConnectionManager, Connector, LinkEvent};
use crate::error::{LinkError, Result};
use crate::heartbeat::HeartbeatClock;
use crate::poll::PollTable;
use crate::queue::CommandQueue;
use crate::session::{AuthFailure, SessionNegotiator, SessionStep};
use crate::sink::DeviceStateSink;
use crate::state::{ConnectionState, SessionState, StateField};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Instant;

/// Point-in-time view of a device's link, for hosts and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub protocol: &'static str,
    pub connection: ConnectionState,
    pub session: SessionState,
    pub queued: usize,
    pub outstanding: u32,
    pub failed_attempts: u32,
}

pub struct DeviceCore<C: ProtocolCodec, K: Connector, S: DeviceStateSink> {
    pub(crate) id: String,
    pub(crate) config: DeviceConfig,
    pub(crate) codec: C,
    pub(crate) link: ConnectionManager<K>,
    pub(crate) session: SessionNegotiator,
    pub(crate) queue: CommandQueue<C::Command>,
    pub(crate) clock: HeartbeatClock,
    pub(crate) sink: S,
    poll: PollTable<C::Command>,
    last_topic: Option<&'static str>,
    rx_buf: Vec<u8>,
}

impl<C: ProtocolCodec, K: Connector, S: DeviceStateSink> DeviceCore<C, K, S> {
    pub fn new(id: &str, config: &DeviceConfig, codec: C, connector: K, sink: S) -> Self {
        let link = ConnectionManager::new(id, connector, config.connect_timeout, config.max_outstanding);
        let session = SessionNegotiator::new(id, codec.requires_session(), config.credential.clone());
        let poll = codec.poll_table();
        Self {
            id: id.to_string(),
            config: config.clone(),
            link,
            session,
            queue: CommandQueue::new(config.max_queued),
            clock: HeartbeatClock::new(config.heartbeat_interval, config.reconnect_every),
            sink,
            poll,
            codec,
            last_topic: None,
            rx_buf: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn queue(&self) -> &CommandQueue<C::Command> {
        &self.queue
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn connector(&self) -> &K {
        self.link.connector()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            protocol: self.codec.name(),
            connection: self.link.state(),
            session: self.session.state(),
            queued: self.queue.len(),
            outstanding: self.link.outstanding().count(),
            failed_attempts: self.link.failure_streak(),
        }
    }

    /// Queues a command. It goes out immediately when the link is idle,
    /// otherwise on a later round trip or heartbeat.
    pub fn submit(&mut self, command: C::Command, now: Instant) -> Result<()> {
        if let Err(e) = self.queue.enqueue(command, now) {
            warn!("Dropping command for device {}: {}", self.id, e);
            return Err(e);
        }
        if self.link.ensure_connected(false, now)
            && self.session.is_active()
            && self.link.outstanding().count() == 0
        {
            self.drain_one();
        }
        Ok(())
    }

    /// Queues a pause; commands behind it wait for an idle heartbeat.
    pub fn submit_barrier(&mut self, now: Instant) -> Result<()> {
        self.queue.enqueue_barrier(now).inspect_err(|e| {
            warn!("Dropping barrier for device {}: {}", self.id, e);
        })
    }

    pub fn on_link_event(&mut self, event: LinkEvent, now: Instant) {
        match event {
            LinkEvent::Connected { epoch } => self.on_connect_result(epoch, Ok(())),
            LinkEvent::ConnectFailed { epoch, error } => self.on_connect_result(epoch, Err(error)),
            LinkEvent::Received { epoch, bytes } => self.on_received(epoch, &bytes),
            LinkEvent::Closed { epoch } => self.on_disconnected(epoch, now),
        }
    }

    pub fn on_connect_result(&mut self, epoch: u64, result: Result<()>) {
        match result {
            Ok(()) => {
                if !self.link.on_connected(epoch) {
                    return;
                }
                self.codec.reset();
                self.rx_buf.clear();
                self.sink.set_reachable(true);
                match self.session.on_connected() {
                    SessionStep::Active => self.on_activated(),
                    SessionStep::Request(step) => {
                        match self.session.request_frame(&mut self.codec, step) {
                            Ok(frame) => self.send_frame(frame),
                            Err(e) => warn!("Cannot build handshake for device {}: {}", self.id, e),
                        }
                    }
                }
            }
            Err(error) => {
                if self.link.on_connect_failed(epoch, &error) {
                    self.connect_failed(error);
                }
            }
        }
    }

    /// Shared tail of failed and abandoned connect attempts.
    pub(crate) fn connect_failed(&mut self, error: LinkError) {
        self.sink.report_fault(&error);
        self.sink.set_reachable(false);
        self.session.on_link_lost();
        if self.config.on_connect_failure == QueuePolicy::Clear {
            let dropped = self.queue.clear();
            if dropped > 0 {
                info!("Cleared {} queued commands of device {} after failed connect", dropped, self.id);
            }
        }
    }

    pub fn on_disconnected(&mut self, epoch: u64, now: Instant) {
        if self.link.is_current(epoch) && self.link.is_connected() && !self.rx_buf.is_empty() {
            self.finish_frame();
        }
        if self.link.on_closed(epoch) {
            let expected = self.codec.exchange() == Exchange::PerRequest;
            self.link_lost(expected, now);
        }
    }

    /// Drops the link on our side and applies the disconnect policy.
    pub fn force_disconnect(&mut self, reason: LinkError, now: Instant) {
        if self.link.state() == ConnectionState::Disconnected {
            return;
        }
        self.link.force_disconnect(&reason);
        self.sink.report_fault(&reason);
        self.link_lost(false, now);
    }

    /// Closes the link without reporting a fault. Heartbeats may reconnect.
    pub fn close(&mut self, now: Instant) {
        if self.link.state() == ConnectionState::Disconnected {
            return;
        }
        info!("Closing connection to device {}", self.id);
        self.link.close();
        self.link_lost(false, now);
    }

    /// `expected` marks the routine close of a one-request-per-connection link.
    fn link_lost(&mut self, expected: bool, now: Instant) {
        let had_session = self.session.on_link_lost();
        self.rx_buf.clear();
        if expected {
            // Carry on with a fresh connection. Without a session the next
            // attempt waits for the heartbeat.
            if had_session && self.queue.has_ready() {
                self.link.ensure_connected(false, now);
            }
            return;
        }
        self.sink.set_reachable(false);
        let dropped = self.queue.on_disconnect(self.config.on_disconnect, had_session);
        if dropped > 0 {
            info!("Cleared {} queued commands of device {} after disconnect", dropped, self.id);
        }
    }

    pub fn on_received(&mut self, epoch: u64, bytes: &[u8]) {
        if !self.link.is_current(epoch) || !self.link.is_connected() {
            debug!("Ignoring {} bytes from stale link of device {}", bytes.len(), self.id);
            return;
        }
        debug!("Received {} bytes from {}: {}", bytes.len(), self.id, hex::encode(bytes));
        self.rx_buf.extend_from_slice(bytes);

        while self.link.is_connected() {
            match self.codec.decode(&mut self.rx_buf) {
                Ok(Some(reply)) => {
                    self.link.reply_received();
                    self.handle_reply(reply);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "Discarding {} undecodable bytes from device {}: {}",
                        self.rx_buf.len(),
                        self.id,
                        e
                    );
                    self.rx_buf.clear();
                    break;
                }
            }
        }
    }

    /// Gives the codec a last look at bytes the close left behind.
    fn finish_frame(&mut self) {
        match self.codec.decode_eof(&mut self.rx_buf) {
            Ok(Some(reply)) => {
                self.link.reply_received();
                self.handle_reply(reply);
            }
            Ok(None) => {}
            Err(e) => warn!("Discarding truncated reply from device {}: {}", self.id, e),
        }
    }

    fn handle_reply(&mut self, reply: Reply) {
        match reply {
            Reply::Handshake(handshake) => {
                if self.session.on_handshake(handshake) && self.round_trip_continues() {
                    self.on_activated();
                }
            }
            Reply::Status { topic, fields } => {
                self.publish(&fields);
                if let Some(topic) = topic.filter(|t| self.poll.tracks(t)) {
                    self.last_topic = Some(topic);
                }
                if self.round_trip_continues() && self.queue.has_ready() {
                    self.drain_one();
                }
            }
            Reply::CommandAck { fields } => {
                self.publish(&fields);
                if self.round_trip_continues() {
                    if self.queue.has_ready() {
                        self.drain_one();
                    } else if self.queue.is_empty() {
                        self.send_poll();
                    }
                }
            }
            Reply::Error(DeviceFault::Unauthorized) => match self.session.on_unauthorized() {
                AuthFailure::SessionExpired => {
                    if self.codec.exchange() == Exchange::Persistent {
                        self.send_handshake_retry();
                    }
                }
                AuthFailure::CredentialRejected => self.sink.report_fault(&LinkError::CredentialRejected),
                AuthFailure::Unexpected => {}
            },
            Reply::Error(DeviceFault::Rejected(reason)) => {
                warn!("Device {} rejected a request: {}", self.id, reason);
                self.sink.report_fault(&LinkError::Rejected(reason));
            }
        }
    }

    /// Persistent links carry the next request right after a reply;
    /// per-request links wait for the close.
    fn round_trip_continues(&self) -> bool {
        self.session.is_active() && self.codec.exchange() == Exchange::Persistent
    }

    fn send_handshake_retry(&mut self) {
        if let SessionState::PairingRequested(step) = self.session.state() {
            match self.session.request_frame(&mut self.codec, step) {
                Ok(frame) => self.send_frame(frame),
                Err(e) => warn!("Cannot build handshake for device {}: {}", self.id, e),
            }
        }
    }

    fn on_activated(&mut self) {
        debug!("Device {} ready for commands", self.id);
        if self.queue.has_ready() {
            self.drain_one();
        } else if self.queue.is_empty() {
            self.send_poll();
        }
    }

    fn publish(&mut self, fields: &[StateField]) {
        for field in fields {
            self.sink.update_state(field);
        }
    }

    /// Sends the head command, if one is ready.
    pub(crate) fn drain_one(&mut self) {
        let Some(pending) = self.queue.dequeue_next() else {
            return;
        };
        debug!("Device {} sending {:?}", self.id, pending.command);
        match self.codec.encode(&pending.command, self.session.token()) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                warn!("Cannot encode {:?} for device {}: {}", pending.command, self.id, e);
                self.sink.report_fault(&e);
            }
        }
    }

    /// Sends the status request following the last reported topic.
    pub(crate) fn send_poll(&mut self) {
        let Some(command) = self.poll.next(self.last_topic).cloned() else {
            return;
        };
        match self.codec.encode(&command, self.session.token()) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("Cannot encode poll {:?} for device {}: {}", command, self.id, e),
        }
    }

    fn send_frame(&mut self, frame: Vec<u8>) {
        if let Err(e) = self.link.send(frame) {
            debug!("Send to device {} failed: {}", self.id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::codec::{Credential, HandshakeReply, SessionToken};
    use crate::error::DecodeError;
    use crate::state::StateField;

    /// Line protocol used to exercise the core.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum TestCommand {
        Poll,
        Say(u8),
    }

    pub(crate) struct LineCodec {
        pub exchange: Exchange,
        pub requires_session: bool,
    }

    impl LineCodec {
        pub(crate) fn persistent() -> Self {
            Self {
                exchange: Exchange::Persistent,
                requires_session: false,
            }
        }

        pub(crate) fn with_session(exchange: Exchange) -> Self {
            Self {
                exchange,
                requires_session: true,
            }
        }
    }

    impl ProtocolCodec for LineCodec {
        type Command = TestCommand;

        fn name(&self) -> &'static str {
            "line"
        }

        fn exchange(&self) -> Exchange {
            self.exchange
        }

        fn requires_session(&self) -> bool {
            self.requires_session
        }

        fn encode_pairing_request(&mut self) -> Result<Vec<u8>> {
            Ok(b"PAIR\n".to_vec())
        }

        fn encode_auth_request(&mut self, credential: &Credential) -> Result<Vec<u8>> {
            Ok(format!("AUTH {}\n", credential.as_str()).into_bytes())
        }

        fn encode(&mut self, command: &TestCommand, token: Option<&SessionToken>) -> Result<Vec<u8>> {
            let body = match command {
                TestCommand::Poll => "?".to_string(),
                TestCommand::Say(n) => format!("S{}", n),
            };
            Ok(match token {
                Some(token) => format!("{}@{}\n", body, token.as_str()),
                None => format!("{}\n", body),
            }
            .into_bytes())
        }

        fn poll_table(&self) -> PollTable<TestCommand> {
            PollTable::fixed(TestCommand::Poll)
        }

        fn decode(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
            let Some(end) = buf.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line: Vec<u8> = buf.drain(..=end).collect();
            let line = std::str::from_utf8(&line[..end])?;
            let reply = match line {
                "ok" => Reply::ack(),
                "key" => Reply::Handshake(HandshakeReply::PairingKeyShown),
                "401" => Reply::Error(DeviceFault::Unauthorized),
                "on" => Reply::status(vec![StateField::new("power", true)]),
                other => match other.strip_prefix("tok:") {
                    Some(token) => Reply::Handshake(HandshakeReply::Token(SessionToken::new(token))),
                    None => return Err(DecodeError::Malformed(other.to_string())),
                },
            };
            Ok(Some(reply))
        }

        /// An unterminated last line ends at the close.
        fn decode_eof(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
            if buf.is_empty() {
                return Ok(None);
            }
            buf.push(b'\n');
            self.decode(buf)
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub fields: Vec<StateField>,
        pub reachable: Vec<bool>,
        pub faults: Vec<LinkError>,
    }

    impl DeviceStateSink for RecordingSink {
        fn update_state(&mut self, field: &StateField) {
            self.fields.push(field.clone());
        }

        fn set_reachable(&mut self, reachable: bool) {
            self.reachable.push(reachable);
        }

        fn report_fault(&mut self, fault: &LinkError) {
            self.faults.push(fault.clone());
        }
    }
}
