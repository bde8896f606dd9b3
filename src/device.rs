//! Async handle for one managed device.
//! A background task owns the `DeviceCore` and multiplexes heartbeats,
//! user commands and socket events with `tokio::select!`.

use crate::codec::ProtocolCodec;
use crate::config::DeviceConfig;
use crate::connection::LinkEvent;
use crate::core::{DeviceCore, DeviceSnapshot};
use crate::error::{LinkError, Result};
use crate::sink::{BroadcastSink, DedupSink, DeviceEvent};
use crate::state::{ConnectionState, SessionState};
use crate::transport::TcpConnector;
use futures_core::stream::Stream;
use log::{debug, error, info};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const COMMAND_CHANNEL: usize = 32;
const LINK_EVENT_CHANNEL: usize = 64;
const EVENT_CHANNEL: usize = 32;
const MAX_JITTER_MS: u64 = 5000;

/// Internal commands for the background device task.
enum DeviceCommand<C> {
    Submit {
        command: C,
        resp_tx: oneshot::Sender<Result<()>>,
    },
    Barrier {
        resp_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// Handle to a running device. Cheap to clone; all clones drive the same task.
pub struct Device<C: ProtocolCodec> {
    id: String,
    tx: mpsc::Sender<DeviceCommand<C::Command>>,
    events: broadcast::Sender<DeviceEvent>,
    snapshot: Arc<RwLock<DeviceSnapshot>>,
    cancel_token: CancellationToken,
}

impl<C: ProtocolCodec> Clone for Device<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
            events: self.events.clone(),
            snapshot: self.snapshot.clone(),
            cancel_token: self.cancel_token.clone(),
        }
    }
}

impl<C: ProtocolCodec> Device<C> {
    /// Starts the device task. Must be called inside a tokio runtime.
    ///
    /// The codec's preset is not applied here; see [`DeviceBuilder`].
    pub fn spawn(id: &str, config: DeviceConfig, codec: C) -> Result<Self> {
        let config = config.validate()?;
        let addr = config.socket_addr()?;

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL);
        let (events, _) = broadcast::channel(EVENT_CHANNEL);
        let cancel_token = CancellationToken::new();
        let snapshot = Arc::new(RwLock::new(DeviceSnapshot {
            id: id.to_string(),
            protocol: codec.name(),
            connection: ConnectionState::Disconnected,
            session: SessionState::Unpaired,
            queued: 0,
            outstanding: 0,
            failed_attempts: 0,
        }));

        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_CHANNEL);
        let connector = TcpConnector::new(
            id,
            addr,
            config.connect_timeout,
            link_tx,
            cancel_token.child_token(),
        );
        let sink = DedupSink::new(BroadcastSink::new(events.clone()));
        let core = DeviceCore::new(id, &config, codec, connector, sink);

        let task = DeviceTask {
            core,
            heartbeat: config.heartbeat_interval,
            snapshot: snapshot.clone(),
            cancel_token: cancel_token.clone(),
        };
        tokio::spawn(task.run(rx, link_rx));

        info!("Device {} started ({} at {}:{})", id, snapshot.read().protocol, config.address, config.port);
        Ok(Self {
            id: id.to_string(),
            tx,
            events,
            snapshot,
            cancel_token,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queues a command. Resolves once the command was accepted by the queue,
    /// not when the device answered; state changes arrive on [`stream`](Self::stream).
    pub async fn send(&self, command: C::Command) -> Result<()> {
        self.request(|resp_tx| DeviceCommand::Submit { command, resp_tx }).await
    }

    /// Queues a barrier: later commands wait for the next idle heartbeat.
    pub async fn barrier(&self) -> Result<()> {
        self.request(|resp_tx| DeviceCommand::Barrier { resp_tx }).await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> DeviceCommand<C::Command>,
    ) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(make(resp_tx)).await.is_err() {
            error!("Cannot send command for device {}: task not running", self.id);
            return Err(LinkError::Stopped);
        }
        resp_rx.await.map_err(|_| LinkError::Stopped)?
    }

    /// Returns a Stream of state, reachability and fault events.
    pub fn stream(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.events.subscribe();
        let id = self.id.clone();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Event stream of {} lagged by {} events", id, n);
                        continue;
                    }
                }
            }
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.read().connection == ConnectionState::Connected
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.read().clone()
    }

    /// Closes the current connection. Later commands and heartbeats reconnect.
    pub async fn close(&self) {
        info!("Closing connection to device {}", self.id);
        let _ = self.tx.send(DeviceCommand::Disconnect).await;
    }

    /// Stops the device and its background tasks permanently.
    pub async fn stop(&self) {
        self.shutdown();
    }

    pub(crate) fn shutdown(&self) {
        info!("Stopping device {}", self.id);
        self.cancel_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

type TcpCore<C> = DeviceCore<C, TcpConnector, DedupSink<BroadcastSink>>;

struct DeviceTask<C: ProtocolCodec> {
    core: TcpCore<C>,
    heartbeat: Duration,
    snapshot: Arc<RwLock<DeviceSnapshot>>,
    cancel_token: CancellationToken,
}

impl<C: ProtocolCodec> DeviceTask<C> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<DeviceCommand<C::Command>>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
    ) {
        // Initial random jitter so devices added together do not tick together.
        let jitter = Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MS));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + jitter, self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let id = self.core.id().to_string();
        debug!("Starting background task for device {}", id);

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Background task for {} received stop signal", id);
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(DeviceCommand::Submit { command, resp_tx }) => {
                        let _ = resp_tx.send(self.core.submit(command, Instant::now()));
                    }
                    Some(DeviceCommand::Barrier { resp_tx }) => {
                        let _ = resp_tx.send(self.core.submit_barrier(Instant::now()));
                    }
                    Some(DeviceCommand::Disconnect) => self.core.close(Instant::now()),
                    None => {
                        debug!("All handles for device {} dropped, stopping task", id);
                        break;
                    }
                },
                _ = heartbeat.tick() => self.core.heartbeat(Instant::now()),
                Some(event) = link_rx.recv() => self.core.on_link_event(event, Instant::now()),
            }
            *self.snapshot.write() = self.core.snapshot();
        }

        self.core.close(Instant::now());
        *self.snapshot.write() = self.core.snapshot();
        self.cancel_token.cancel();
        debug!("Background task for {} exited", id);
    }
}

/// Fluent construction of a [`Device`], starting from the codec's preset.
pub struct DeviceBuilder<C: ProtocolCodec> {
    id: String,
    codec: C,
    config: DeviceConfig,
}

impl<C: ProtocolCodec> DeviceBuilder<C> {
    pub fn new<I: Into<String>, A: Into<String>>(id: I, address: A, codec: C) -> Self {
        let mut config = codec.preset(DeviceConfig::default());
        config.address = address.into();
        Self {
            id: id.into(),
            codec,
            config,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn credential<S: Into<String>>(self, credential: S) -> Self {
        let config = self.config.clone().with_credential(credential);
        Self { config, ..self }
    }

    /// Applies further settings on top of the preset.
    pub fn configure(mut self, f: impl FnOnce(DeviceConfig) -> DeviceConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn spawn(self) -> Result<Device<C>> {
        Device::spawn(&self.id, self.config, self.codec)
    }
}
