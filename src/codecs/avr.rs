//! Denon/Marantz AVR line protocol (telnet, port 23, CR-terminated).
//!
//! Every reply is a two-letter topic followed by its detail, e.g. `PWON`,
//! `SIDVD` or `MV45`. The receiver answers one query per heartbeat, so the
//! poll table walks PW -> ZM -> SI -> MV -> MU -> PW.

use crate::codec::{ProtocolCodec, Reply, SessionToken};
use crate::config::DeviceConfig;
use crate::error::{DecodeError, LinkError, Result};
use crate::poll::PollTable;
use crate::state::StateField;
use log::debug;

pub const DEFAULT_PORT: u16 = 23;
pub const DEFAULT_SOURCES: &str = "Off|DVD|VDP|TV|CD|DBS|Tuner|Phono|VCR-1|VCR-2|V.Aux|CDR/Tape|AuxNet|AuxIPod";

const LINE_END: u8 = b'\r';
const MAX_LINE: usize = 256;
/// Selector levels step by ten per source.
const LEVEL_STEP: i64 = 10;
const VOLUME_MAX: u8 = 98;

/// Status topics the receiver reports but that nothing here tracks.
const IGNORED_TOPICS: &[&str] = &["SS", "SV", "SD", "MS", "PS", "CV", "SY", "TP"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvrCommand {
    QueryPower,
    QueryZone,
    QuerySource,
    QueryVolume,
    QueryMute,
    Power(bool),
    MainZone(bool),
    Source(String),
    /// Master volume, 0..=98.
    Volume(u8),
    Mute(bool),
}

pub struct AvrCodec {
    sources: Vec<String>,
}

impl Default for AvrCodec {
    fn default() -> Self {
        Self::with_sources(DEFAULT_SOURCES)
    }
}

impl AvrCodec {
    /// `sources` is the '|' separated list of input names known to the receiver.
    pub fn with_sources(sources: &str) -> Self {
        Self {
            sources: sources.split('|').map(|s| s.trim().to_string()).collect(),
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Maps a selector level (0, 10, 20, ...) to a source command.
    pub fn source_for_level(&self, level: i64) -> Result<AvrCommand> {
        if level < 0 || level % LEVEL_STEP != 0 {
            return Err(LinkError::UnknownCommand(format!("source level {}", level)));
        }
        self.sources
            .get((level / LEVEL_STEP) as usize)
            .map(|name| AvrCommand::Source(name.clone()))
            .ok_or_else(|| LinkError::UnknownCommand(format!("source level {}", level)))
    }

    fn level_of(&self, source: &str) -> Option<i64> {
        self.sources
            .iter()
            .position(|s| s == source)
            .map(|i| i as i64 * LEVEL_STEP)
    }

    fn parse_line(&self, line: &str) -> Reply {
        let line = line.trim();
        let split = if line.len() >= 2 && line.is_char_boundary(2) { 2 } else { line.len() };
        let (action, detail) = line.split_at(split);
        let (topic, fields) = match action {
            "PW" => ("PW", on_off(detail, "ON", "STANDBY").map(|on| StateField::new("power", on))),
            "ZM" => ("ZM", on_off(detail, "ON", "OFF").map(|on| StateField::new("main_zone", on))),
            "SI" => {
                let mut fields = vec![StateField::new("source", detail)];
                if let Some(level) = self.level_of(detail) {
                    fields.push(StateField::new("source_level", level));
                }
                return Reply::Status {
                    topic: Some("SI"),
                    fields,
                };
            }
            "MV" => ("MV", parse_volume(detail).map(|v| StateField::new("volume", v))),
            "MU" => ("MU", on_off(detail, "ON", "OFF").map(|on| StateField::new("muted", on))),
            other => {
                if !IGNORED_TOPICS.contains(&other) {
                    debug!("Unknown AVR message '{}' ignored", line);
                }
                return Reply::status(Vec::new());
            }
        };
        if fields.is_none() {
            debug!("Unknown detail '{}' for AVR topic {} ignored", detail, topic);
        }
        Reply::Status {
            topic: Some(topic),
            fields: fields.into_iter().collect(),
        }
    }
}

fn on_off(detail: &str, on: &str, off: &str) -> Option<bool> {
    if detail == on {
        Some(true)
    } else if detail == off {
        Some(false)
    } else {
        None
    }
}

/// `MV45` is 45, `MV455` is 45.5 rounded down; `MVMAX 98` is not a level.
fn parse_volume(detail: &str) -> Option<i64> {
    if detail.is_empty() || !detail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    detail[..detail.len().min(2)].parse().ok()
}

impl ProtocolCodec for AvrCodec {
    type Command = AvrCommand;

    fn name(&self) -> &'static str {
        "avr"
    }

    fn preset(&self, config: DeviceConfig) -> DeviceConfig {
        let port = if config.port == 0 { DEFAULT_PORT } else { config.port };
        DeviceConfig { port, ..config }
            .with_reconnect_every(3)
            .with_max_outstanding(5)
    }

    fn encode(&mut self, command: &AvrCommand, _token: Option<&SessionToken>) -> Result<Vec<u8>> {
        let line = match command {
            AvrCommand::QueryPower => "PW?".to_string(),
            AvrCommand::QueryZone => "ZM?".to_string(),
            AvrCommand::QuerySource => "SI?".to_string(),
            AvrCommand::QueryVolume => "MV?".to_string(),
            AvrCommand::QueryMute => "MU?".to_string(),
            AvrCommand::Power(true) => "PWON".to_string(),
            AvrCommand::Power(false) => "PWSTANDBY".to_string(),
            AvrCommand::MainZone(true) => "ZMON".to_string(),
            AvrCommand::MainZone(false) => "ZMOFF".to_string(),
            AvrCommand::Source(name) => {
                if !self.sources.contains(name) {
                    return Err(LinkError::UnknownCommand(format!("source '{}'", name)));
                }
                format!("SI{}", name)
            }
            AvrCommand::Volume(level) => format!("MV{:02}", (*level).min(VOLUME_MAX)),
            AvrCommand::Mute(true) => "MUON".to_string(),
            AvrCommand::Mute(false) => "MUOFF".to_string(),
        };
        let mut frame = line.into_bytes();
        frame.push(LINE_END);
        Ok(frame)
    }

    fn poll_table(&self) -> PollTable<AvrCommand> {
        PollTable::chain(
            AvrCommand::QueryPower,
            vec![
                ("PW", AvrCommand::QueryZone),
                ("ZM", AvrCommand::QuerySource),
                ("SI", AvrCommand::QueryVolume),
                ("MV", AvrCommand::QueryMute),
                ("MU", AvrCommand::QueryPower),
            ],
        )
    }

    fn decode(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
        loop {
            let Some(end) = buf.iter().position(|b| *b == LINE_END) else {
                if buf.len() > MAX_LINE {
                    return Err(DecodeError::Malformed(format!("no line end in {} bytes", buf.len())));
                }
                return Ok(None);
            };
            let line: Vec<u8> = buf.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..end]);
            if text.trim().is_empty() {
                continue;
            }
            return Ok(Some(self.parse_line(&text)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FieldValue;

    fn decode_all(codec: &mut AvrCodec, bytes: &[u8]) -> Vec<Reply> {
        let mut buf = bytes.to_vec();
        let mut replies = Vec::new();
        while let Some(reply) = codec.decode(&mut buf).unwrap() {
            replies.push(reply);
        }
        replies
    }

    #[test]
    fn decodes_status_lines() {
        let mut codec = AvrCodec::default();
        let replies = decode_all(&mut codec, b"PWON\rSIDVD\rMV455\rMUOFF\rMSSTEREO\r\nZM");

        assert_eq!(
            replies[0],
            Reply::Status {
                topic: Some("PW"),
                fields: vec![StateField::new("power", true)]
            }
        );
        match &replies[1] {
            Reply::Status { topic, fields } => {
                assert_eq!(*topic, Some("SI"));
                assert_eq!(fields[1].value, FieldValue::Int(10));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(
            replies[2],
            Reply::Status {
                topic: Some("MV"),
                fields: vec![StateField::new("volume", 45i64)]
            }
        );
        assert_eq!(replies[4], Reply::status(Vec::new()));
        assert_eq!(replies.len(), 5);
    }

    #[test]
    fn partial_lines_wait_for_more_bytes() {
        let mut codec = AvrCodec::default();
        let mut buf = b"PWST".to_vec();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ANDBY\r");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Status {
                topic: Some("PW"),
                fields: vec![StateField::new("power", false)]
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_commands() {
        let mut codec = AvrCodec::default();
        assert_eq!(codec.encode(&AvrCommand::QueryPower, None).unwrap(), b"PW?\r");
        assert_eq!(codec.encode(&AvrCommand::Volume(7), None).unwrap(), b"MV07\r");
        assert_eq!(codec.encode(&AvrCommand::Power(false), None).unwrap(), b"PWSTANDBY\r");

        let tuner = codec.source_for_level(60).unwrap();
        assert_eq!(codec.encode(&tuner, None).unwrap(), b"SITuner\r");
        assert!(codec.source_for_level(15).is_err());
        assert!(codec.encode(&AvrCommand::Source("Bluray".into()), None).is_err());
    }

    #[test]
    fn poll_chain_follows_reports() {
        let codec = AvrCodec::default();
        let table = codec.poll_table();
        let mut topic = None;
        let mut order = Vec::new();
        for reported in ["PW", "ZM", "SI", "MV", "MU"] {
            order.push(table.next(topic).cloned().unwrap());
            topic = Some(reported);
        }
        assert_eq!(
            order,
            vec![
                AvrCommand::QueryPower,
                AvrCommand::QueryZone,
                AvrCommand::QuerySource,
                AvrCommand::QueryVolume,
                AvrCommand::QueryMute,
            ]
        );
        assert_eq!(table.next(Some("MU")), Some(&AvrCommand::QueryPower));
    }

    #[test]
    fn runaway_input_is_rejected() {
        let mut codec = AvrCodec::default();
        let mut buf = vec![b'x'; 300];
        assert!(codec.decode(&mut buf).is_err());
    }
}
