//! LEDENET / UFO RGBW controller binary protocol (TCP port 5577).

use crate::codec::{ProtocolCodec, Reply, SessionToken};
use crate::config::DeviceConfig;
use crate::error::{DecodeError, Result};
use crate::poll::PollTable;
use crate::state::StateField;
use log::debug;

pub const DEFAULT_PORT: u16 = 5577;

const STATUS_QUERY: [u8; 4] = [0x81, 0x8A, 0x8B, 0x96];
const POWER_ON: [u8; 4] = [0x71, 0x23, 0x0F, 0xA3];
const POWER_OFF: [u8; 4] = [0x71, 0x24, 0x0F, 0xA4];
const STATUS_HEADER: u8 = 0x81;
const STATUS_LEN: usize = 14;
const STATE_ON: u8 = 0x23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgbw {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub white: u8,
}

impl Rgbw {
    pub fn new(red: u8, green: u8, blue: u8, white: u8) -> Self {
        Self {
            red,
            green,
            blue,
            white,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    QueryStatus,
    Power(bool),
    Color(Rgbw),
}

/// Dimmer percentage (0..=100) to channel level (0..=255).
pub fn percent_to_level(percent: u8) -> u8 {
    let percent = u16::from(percent.min(100));
    ((percent * 255 + 50) / 100) as u8
}

/// Channel level (0..=255) to dimmer percentage (0..=100).
pub fn level_to_percent(level: u8) -> u8 {
    ((u16::from(level) * 100 + 127) / 255) as u8
}

fn color_frame(color: Rgbw) -> [u8; 8] {
    // r + g + b + 0x3F + (w - 0xFF), modulo 256
    let checksum = [color.red, color.green, color.blue, 0x3F, color.white, 0x01]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    [
        0x31,
        color.red,
        color.green,
        color.blue,
        color.white,
        0x00,
        0x0F,
        checksum,
    ]
}

#[derive(Debug, Default)]
pub struct LedStripCodec;

impl LedStripCodec {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolCodec for LedStripCodec {
    type Command = LedCommand;

    fn name(&self) -> &'static str {
        "ledstrip"
    }

    fn preset(&self, config: DeviceConfig) -> DeviceConfig {
        let port = if config.port == 0 { DEFAULT_PORT } else { config.port };
        DeviceConfig { port, ..config }.with_max_outstanding(2)
    }

    /// Writes are not answered, so each one is followed by a status query;
    /// every frame then yields exactly one status reply.
    fn encode(&mut self, command: &LedCommand, _token: Option<&SessionToken>) -> Result<Vec<u8>> {
        let mut frame = match command {
            LedCommand::QueryStatus => return Ok(STATUS_QUERY.to_vec()),
            LedCommand::Power(true) => POWER_ON.to_vec(),
            LedCommand::Power(false) => POWER_OFF.to_vec(),
            LedCommand::Color(color) => color_frame(*color).to_vec(),
        };
        frame.extend_from_slice(&STATUS_QUERY);
        Ok(frame)
    }

    fn poll_table(&self) -> PollTable<LedCommand> {
        PollTable::fixed(LedCommand::QueryStatus)
    }

    fn decode(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
        // Skip anything before a status header; writes may echo short acks.
        if let Some(skip) = buf.iter().position(|b| *b == STATUS_HEADER) {
            if skip > 0 {
                debug!("Skipping {} bytes before LEDENET status: {}", skip, hex::encode(&buf[..skip]));
                buf.drain(..skip);
            }
        } else {
            buf.clear();
            return Ok(None);
        }
        if buf.len() < STATUS_LEN {
            return Ok(None);
        }

        let frame: Vec<u8> = buf.drain(..STATUS_LEN).collect();
        let expected = frame[..STATUS_LEN - 1].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        let actual = frame[STATUS_LEN - 1];
        if expected != actual {
            return Err(DecodeError::Checksum { expected, actual });
        }

        Ok(Some(Reply::status(vec![
            StateField::new("power", frame[2] == STATE_ON),
            StateField::new("red", frame[6]),
            StateField::new("green", frame[7]),
            StateField::new("blue", frame[8]),
            StateField::new("white", frame[9]),
        ])))
    }
}
