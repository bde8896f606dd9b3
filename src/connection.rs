//! Ownership of the single logical socket to a device.
//! Tracks connect state, the connect watchdog and in-flight requests.

use crate::error::{LinkError, Result};
use crate::state::ConnectionState;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// The live half of a connection, created by a `Connector`.
///
/// Both operations are fire-and-forget; outcomes come back as `LinkEvent`s.
pub trait Socket: Send {
    fn send(&mut self, frame: Vec<u8>);
    fn close(&mut self);
}

/// Creates sockets. `open` starts a connect attempt and returns immediately.
pub trait Connector: Send + 'static {
    type Socket: Socket;

    fn open(&mut self, epoch: u64) -> Self::Socket;
}

/// I/O completions delivered back into the device's single-threaded context.
///
/// `epoch` identifies the socket the event belongs to; events of abandoned
/// sockets are ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected { epoch: u64 },
    ConnectFailed { epoch: u64, error: LinkError },
    Received { epoch: u64, bytes: Vec<u8> },
    Closed { epoch: u64 },
}

impl LinkEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            LinkEvent::Connected { epoch }
            | LinkEvent::ConnectFailed { epoch, .. }
            | LinkEvent::Received { epoch, .. }
            | LinkEvent::Closed { epoch } => *epoch,
        }
    }
}

/// Requests sent without a reply yet.
///
/// `waits` counts heartbeats that passed while a request was pending and
/// nothing else could be sent. Both add up toward the wedge limit.
#[derive(Debug, Clone, Copy)]
pub struct OutstandingRequests {
    count: u32,
    waits: u32,
    limit: u32,
}

impl OutstandingRequests {
    pub fn new(limit: u32) -> Self {
        Self { count: 0, waits: 0, limit }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn waits(&self) -> u32 {
        self.waits
    }

    pub fn sent(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn settled(&mut self) {
        self.count = self.count.saturating_sub(1);
        self.waits = 0;
    }

    pub fn waited(&mut self) {
        self.waits = self.waits.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.waits = 0;
    }

    pub fn exceeded(&self) -> bool {
        self.count.saturating_add(self.waits) > self.limit
    }
}

pub struct ConnectionManager<K: Connector> {
    id: String,
    connector: K,
    socket: Option<K::Socket>,
    state: ConnectionState,
    epoch: u64,
    connecting_since: Option<Instant>,
    connect_timeout: Duration,
    outstanding: OutstandingRequests,
    failure_streak: u32,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(id: &str, connector: K, connect_timeout: Duration, max_outstanding: u32) -> Self {
        Self {
            id: id.to_string(),
            connector,
            socket: None,
            state: ConnectionState::Disconnected,
            epoch: 0,
            connecting_since: None,
            connect_timeout,
            outstanding: OutstandingRequests::new(max_outstanding),
            failure_streak: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether an event tagged with `epoch` belongs to the current socket.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.socket.is_some() && epoch == self.epoch
    }

    pub fn outstanding(&self) -> &OutstandingRequests {
        &self.outstanding
    }

    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Returns true iff connected. Otherwise, unless `check_only` or an
    /// attempt is already running, opens a fresh socket.
    pub fn ensure_connected(&mut self, check_only: bool, now: Instant) -> bool {
        match self.state {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => false,
            ConnectionState::Disconnected => {
                if !check_only {
                    self.start_connect(now);
                }
                false
            }
        }
    }

    fn start_connect(&mut self, now: Instant) {
        if let Some(mut stale) = self.socket.take() {
            debug!("Dropping leftover socket of {} before reconnecting", self.id);
            stale.close();
        }
        self.epoch += 1;
        debug!("Connecting to device {} (epoch {})", self.id, self.epoch);
        self.outstanding.reset();
        self.socket = Some(self.connector.open(self.epoch));
        self.state = ConnectionState::Connecting;
        self.connecting_since = Some(now);
    }

    /// Successful connect. Returns false for events of an abandoned socket.
    pub fn on_connected(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            debug!("Ignoring stale connect result for {} (epoch {})", self.id, epoch);
            return false;
        }
        if self.failure_streak > 0 {
            info!(
                "Connected to device {} after {} failed attempts",
                self.id, self.failure_streak
            );
        } else {
            info!("Connected to device {}", self.id);
        }
        self.state = ConnectionState::Connected;
        self.connecting_since = None;
        self.outstanding.reset();
        self.failure_streak = 0;
        true
    }

    /// Failed connect: drops the socket so the next attempt creates a new one.
    /// Returns false for events of an abandoned socket.
    pub fn on_connect_failed(&mut self, epoch: u64, error: &LinkError) -> bool {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            debug!("Ignoring stale connect failure for {} (epoch {})", self.id, epoch);
            return false;
        }
        self.record_failure(error);
        self.teardown();
        true
    }

    /// Only the first failure of a streak is logged loudly.
    fn record_failure(&mut self, error: &LinkError) {
        self.failure_streak = self.failure_streak.saturating_add(1);
        if self.failure_streak == 1 {
            warn!("Failed to connect to device {}: {}", self.id, error);
        } else {
            debug!(
                "Failed to connect to device {}: {} (attempt {})",
                self.id, error, self.failure_streak
            );
        }
    }

    /// The peer closed the connection. Returns whether it was the live link.
    pub fn on_closed(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        debug!("Connection to device {} closed", self.id);
        self.socket = None;
        self.state = ConnectionState::Disconnected;
        self.connecting_since = None;
        true
    }

    /// Abandons an attempt that has been connecting for too long.
    pub fn check_watchdog(&mut self, now: Instant) -> Option<LinkError> {
        let since = self.connecting_since?;
        if self.state != ConnectionState::Connecting
            || now.saturating_duration_since(since) < self.connect_timeout
        {
            return None;
        }
        let error = LinkError::ConnectTimeout;
        self.record_failure(&error);
        self.teardown();
        Some(error)
    }

    /// Closes and drops the socket regardless of its state.
    pub fn force_disconnect(&mut self, reason: &LinkError) {
        if self.socket.is_none() && self.state == ConnectionState::Disconnected {
            return;
        }
        warn!("Forcing disconnect of device {}: {}", self.id, reason);
        self.teardown();
    }

    /// Closes the link on request of the host.
    pub fn close(&mut self) {
        debug!("Closing connection to device {}", self.id);
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
        self.state = ConnectionState::Disconnected;
        self.connecting_since = None;
    }

    /// Hands a frame to the socket and counts it as outstanding.
    pub fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let socket = self.socket.as_mut().ok_or(LinkError::NotConnected)?;
        debug!("Sending {} bytes to {}: {}", frame.len(), self.id, hex::encode(&frame));
        socket.send(frame);
        self.outstanding.sent();
        Ok(())
    }

    pub fn reply_received(&mut self) {
        self.outstanding.settled();
    }

    /// A heartbeat passed with a request still unanswered.
    pub fn waited_for_reply(&mut self) {
        self.outstanding.waited();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    /// What the fake sockets saw, shared with the test.
    #[derive(Debug, Default)]
    pub(crate) struct Wire {
        pub opened: Vec<u64>,
        pub sent: Vec<(u64, Vec<u8>)>,
        pub closed: Vec<u64>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeConnector {
        pub wire: Arc<Mutex<Wire>>,
    }

    pub(crate) struct FakeSocket {
        epoch: u64,
        wire: Arc<Mutex<Wire>>,
    }

    impl Connector for FakeConnector {
        type Socket = FakeSocket;

        fn open(&mut self, epoch: u64) -> FakeSocket {
            self.wire.lock().opened.push(epoch);
            FakeSocket {
                epoch,
                wire: self.wire.clone(),
            }
        }
    }

    impl Socket for FakeSocket {
        fn send(&mut self, frame: Vec<u8>) {
            self.wire.lock().sent.push((self.epoch, frame));
        }

        fn close(&mut self) {
            self.wire.lock().closed.push(self.epoch);
        }
    }

    impl FakeConnector {
        pub(crate) fn sent_frames(&self) -> Vec<Vec<u8>> {
            self.wire.lock().sent.iter().map(|(_, f)| f.clone()).collect()
        }

        pub(crate) fn opened(&self) -> usize {
            self.wire.lock().opened.len()
        }

        pub(crate) fn closed(&self) -> usize {
            self.wire.lock().closed.len()
        }
    }
}
