//! TCP implementation of `Connector`/`Socket` on top of tokio.
//!
//! Each socket runs a connect-then-read task and a writer task. Their results
//! are delivered as epoch-tagged `LinkEvent`s on one channel that the device
//! task selects on.

use crate::connection::{Connector, LinkEvent, Socket};
use crate::error::LinkError;
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const READ_BUFFER: usize = 4096;

pub struct TcpConnector {
    id: String,
    addr: String,
    connect_timeout: Duration,
    events: mpsc::Sender<LinkEvent>,
    cancel_token: CancellationToken,
}

impl TcpConnector {
    /// `cancel_token` tears down every socket created by this connector.
    pub fn new(
        id: &str,
        addr: String,
        connect_timeout: Duration,
        events: mpsc::Sender<LinkEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            id: id.to_string(),
            addr,
            connect_timeout,
            events,
            cancel_token,
        }
    }
}

pub struct TcpSocket {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    cancel_token: CancellationToken,
}

impl Socket for TcpSocket {
    fn send(&mut self, frame: Vec<u8>) {
        if self.frames.send(frame).is_err() {
            debug!("Writer already gone, frame dropped");
        }
    }

    fn close(&mut self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl Connector for TcpConnector {
    type Socket = TcpSocket;

    fn open(&mut self, epoch: u64) -> TcpSocket {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let socket_token = self.cancel_token.child_token();

        let link = LinkTask {
            id: self.id.clone(),
            addr: self.addr.clone(),
            epoch,
            connect_timeout: self.connect_timeout,
            events: self.events.clone(),
            cancel_token: socket_token.clone(),
        };
        tokio::spawn(link.run(frames_rx));

        TcpSocket {
            frames: frames_tx,
            cancel_token: socket_token,
        }
    }
}

struct LinkTask {
    id: String,
    addr: String,
    epoch: u64,
    connect_timeout: Duration,
    events: mpsc::Sender<LinkEvent>,
    cancel_token: CancellationToken,
}

impl LinkTask {
    async fn run(self, frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        let epoch = self.epoch;
        let connected = tokio::select! {
            _ = self.cancel_token.cancelled() => return,
            res = self.connect() => res,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(error) => {
                self.emit(LinkEvent::ConnectFailed { epoch, error }).await;
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY for {}: {}", self.id, e);
        }
        self.emit(LinkEvent::Connected { epoch }).await;

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(write_loop(
            self.id.clone(),
            write_half,
            frames,
            self.cancel_token.clone(),
        ));
        self.read_loop(read_half).await;
    }

    async fn connect(&self) -> Result<TcpStream, LinkError> {
        debug!("Opening TCP connection to {} at {}", self.id, self.addr);
        timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LinkError::ConnectTimeout)?
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))
    }

    async fn read_loop(&self, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let epoch = self.epoch;
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    // Stale once the core dropped this socket itself.
                    self.emit(LinkEvent::Closed { epoch }).await;
                    break;
                }
                res = read_half.read(&mut buf) => match res {
                    Ok(0) => {
                        debug!("Device {} closed the connection", self.id);
                        self.emit(LinkEvent::Closed { epoch }).await;
                        break;
                    }
                    Ok(n) => {
                        self.emit(LinkEvent::Received { epoch, bytes: buf[..n].to_vec() }).await;
                    }
                    Err(e) => {
                        warn!("Read from device {} failed: {}", self.id, e);
                        self.emit(LinkEvent::Closed { epoch }).await;
                        break;
                    }
                }
            }
        }
        self.cancel_token.cancel();
        debug!("Reader task for {} stopped", self.id);
    }

    async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Device task for {} is gone, dropping link event", self.id);
        }
    }
}

async fn write_loop(
    id: String,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_half.write_all(&frame).await {
                        warn!("Write to device {} failed: {}", id, e);
                        cancel_token.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn delivers_connect_receive_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(16);
        let mut connector = TcpConnector::new("t", addr, Duration::from_secs(5), tx, CancellationToken::new());

        let mut socket = connector.open(7);
        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Connected { epoch: 7 }));

        socket.send(b"PW?\r".to_vec());
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PW?\r");

        peer.write_all(b"PWON\r").await.unwrap();
        match rx.recv().await {
            Some(LinkEvent::Received { epoch: 7, bytes }) => assert_eq!(bytes, b"PWON\r"),
            other => panic!("unexpected event {:?}", other),
        }

        drop(peer);
        assert_eq!(rx.recv().await, Some(LinkEvent::Closed { epoch: 7 }));
    }

    #[tokio::test]
    async fn cancelled_socket_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(16);
        let mut connector = TcpConnector::new("t", addr, Duration::from_secs(5), tx, CancellationToken::new());

        let mut socket = connector.open(3);
        // Keep the peer open: the reader must not depend on it noticing anything.
        let (_peer, _) = listener.accept().await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Connected { epoch: 3 }));

        socket.close();
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(event, Some(LinkEvent::Closed { epoch: 3 }));
    }

    #[tokio::test]
    async fn refused_connect_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(4);
        let mut connector = TcpConnector::new("t", addr, Duration::from_secs(5), tx, CancellationToken::new());
        let _socket = connector.open(1);
        match rx.recv().await {
            Some(LinkEvent::ConnectFailed { epoch: 1, error }) => assert!(error.is_link_fault()),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
