//! Wire protocols of the supported device families.

pub mod avr;
pub mod inverter;
pub mod jsonrpc;
pub mod ledstrip;
pub mod lgtv;

pub use avr::{AvrCodec, AvrCommand};
pub use inverter::{InverterCodec, InverterCommand};
pub use jsonrpc::{HyperionCodec, HyperionCommand};
pub use ledstrip::{LedCommand, LedStripCodec, Rgbw};
pub use lgtv::{LgKey, LgTvCodec};
