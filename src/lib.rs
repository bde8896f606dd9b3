//! # Domolink
//!
//! Connection, session and command-queue core for home-automation device
//! adapters. One [`Device`] owns one TCP link to a receiver, TV, LED
//! controller or inverter, keeps it alive on a heartbeat, authenticates where
//! the device asks for it and delivers queued commands one round trip at a time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use domolink::DeviceBuilder;
//! use domolink::codecs::{AvrCodec, AvrCommand};
//! use futures_util::StreamExt;
//!
//! # async fn run() -> domolink::Result<()> {
//! let device = DeviceBuilder::new("living-room", "192.168.1.20", AvrCodec::default()).spawn()?;
//! device.send(AvrCommand::Power(true)).await?;
//!
//! let mut events = Box::pin(device.stream());
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The protocol-independent state machine lives in [`DeviceCore`](crate::core::DeviceCore); it
//! performs no I/O and can be driven directly with a custom [`connection::Connector`].
#[macro_use]
mod macros;
pub mod codec;
pub mod codecs;
pub mod config;
pub mod connection;
pub mod core;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod poll;
pub mod queue;
pub mod session;
pub mod sink;
pub mod state;
pub mod transport;
pub mod wol;

pub use codec::{Credential, Exchange, ProtocolCodec, Reply, SessionToken};
pub use config::{DeviceConfig, QueuePolicy};
pub use crate::core::{DeviceCore, DeviceSnapshot};
pub use device::{Device, DeviceBuilder};
pub use error::{DecodeError, LinkError, Result};
pub use manager::{Manager, ManagerEvent};
pub use sink::{DeviceEvent, DeviceStateSink};
pub use state::{ConnectionState, FieldValue, SessionState, StateField};
pub use wol::MacAddress;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
