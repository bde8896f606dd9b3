//! Hosola / Omnik solar inverter WiFi logger (TCP port 8899).
//!
//! The logger answers an identifier frame derived from its serial number with
//! a binary status frame. Multi-byte values are big-endian; phases that read
//! all zeros are not connected and are left out.

use crate::codec::{ProtocolCodec, Reply, SessionToken};
use crate::config::DeviceConfig;
use crate::error::{DecodeError, LinkError, Result};
use crate::poll::PollTable;
use crate::state::StateField;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8899;

const START: u8 = 0x68;
const END: u8 = 0x16;
const REPLY_CONTROL: u8 = 0x41;
/// Offset the logger adds to the identifier checksum.
const CHECKSUM_SEED: u32 = 115;
/// Status frames carry "OK" at bytes 154..156.
const MIN_REPLY: usize = 156;
const OK_MARK: &[u8] = b"OK";

const TEMPERATURE: usize = 31;
const VDC: [usize; 3] = [33, 35, 37];
const VAC: [usize; 3] = [51, 53, 55];
const PAC: [usize; 3] = [59, 63, 67];
const ENERGY_TOTAL: usize = 71;

const VDC_KEYS: [&str; 3] = ["vdc1", "vdc2", "vdc3"];
const VAC_KEYS: [&str; 3] = ["vac1", "vac2", "vac3"];
const PAC_KEYS: [&str; 3] = ["power1", "power2", "power3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverterCommand {
    ReadStatus,
}

pub struct InverterCodec {
    identifier: Vec<u8>,
}

impl InverterCodec {
    /// `serial` is the decimal serial number printed on the WiFi logger.
    pub fn new(serial: &str) -> Result<Self> {
        let serial: u64 = serial
            .trim()
            .parse()
            .map_err(|_| LinkError::Config(format!("'{}' is not a valid serial number", serial.trim())))?;
        let identifier = identifier_frame(serial);
        debug!("Inverter identifier: {}", hex::encode(&identifier));
        Ok(Self { identifier })
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }
}

fn identifier_frame(serial: u64) -> Vec<u8> {
    let mut le = [0u8; 8];
    LittleEndian::write_u64(&mut le, serial);
    let len = le.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let serial = &le[..len];

    let checksum = serial
        .iter()
        .fold(CHECKSUM_SEED, |acc, b| acc + 2 * u32::from(*b));

    let mut frame = vec![START, 0x02, 0x40, 0x30];
    frame.extend_from_slice(serial);
    frame.extend_from_slice(serial);
    frame.extend_from_slice(&[0x01, 0x00, (checksum & 0xFF) as u8, END]);
    frame
}

fn tenths(frame: &[u8], offset: usize) -> f64 {
    f64::from(BigEndian::read_u16(&frame[offset..offset + 2])) / 10.0
}

fn parse_status(frame: &[u8]) -> Vec<StateField> {
    let mut fields = vec![StateField::new("temperature", tenths(frame, TEMPERATURE))];
    for phase in 0..3 {
        let vdc = tenths(frame, VDC[phase]);
        let vac = tenths(frame, VAC[phase]);
        let pac = i64::from(BigEndian::read_u16(&frame[PAC[phase]..PAC[phase] + 2]));
        if vdc > 0.0 || vac > 0.0 || pac > 0 {
            fields.push(StateField::new(VDC_KEYS[phase], vdc));
            fields.push(StateField::new(VAC_KEYS[phase], vac));
            fields.push(StateField::new(PAC_KEYS[phase], pac));
        }
    }
    // Lifetime yield in units of 0.1 kWh.
    let energy = i64::from(BigEndian::read_u32(&frame[ENERGY_TOTAL..ENERGY_TOTAL + 4])) * 100;
    fields.push(StateField::new("energy_total_wh", energy));
    fields
}

impl ProtocolCodec for InverterCodec {
    type Command = InverterCommand;

    fn name(&self) -> &'static str {
        "inverter"
    }

    fn preset(&self, config: DeviceConfig) -> DeviceConfig {
        let port = if config.port == 0 { DEFAULT_PORT } else { config.port };
        DeviceConfig { port, ..config }
            .with_heartbeat(Duration::from_secs(15))
            .with_max_outstanding(3)
    }

    fn encode(&mut self, _command: &InverterCommand, _token: Option<&SessionToken>) -> Result<Vec<u8>> {
        Ok(self.identifier.clone())
    }

    fn poll_table(&self) -> PollTable<InverterCommand> {
        PollTable::fixed(InverterCommand::ReadStatus)
    }

    /// One status frame per identifier; whatever is buffered belongs to it.
    fn decode(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
        if buf.len() < MIN_REPLY {
            return Ok(None);
        }
        let frame = std::mem::take(buf);
        if frame[0] != START || frame[2] != REPLY_CONTROL {
            return Err(DecodeError::Malformed(format!("unexpected header {}", hex::encode(&frame[..4]))));
        }
        if &frame[MIN_REPLY - 2..MIN_REPLY] != OK_MARK {
            return Err(DecodeError::Malformed(format!("status frame of {} bytes without OK mark", frame.len())));
        }
        Ok(Some(Reply::status(parse_status(&frame))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FieldValue;

    fn status_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 160];
        frame[0] = START;
        frame[1] = 0x7D;
        frame[2] = REPLY_CONTROL;
        BigEndian::write_u16(&mut frame[TEMPERATURE..], 412);
        BigEndian::write_u16(&mut frame[VDC[0]..], 3105);
        BigEndian::write_u16(&mut frame[VAC[0]..], 2298);
        BigEndian::write_u16(&mut frame[PAC[0]..], 1530);
        BigEndian::write_u32(&mut frame[ENERGY_TOTAL..], 12345);
        frame[154] = b'O';
        frame[155] = b'K';
        frame
    }

    fn field<'a>(fields: &'a [StateField], key: &str) -> Option<&'a FieldValue> {
        fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    #[test]
    fn identifier_from_serial() {
        // 1604812345 = 0x5fa77e39
        let codec = InverterCodec::new("1604812345").unwrap();
        let checksum = (115 + 2 * (0x39 + 0x7e + 0xa7 + 0x5f)) & 0xFF;
        assert_eq!(
            codec.identifier(),
            &[
                0x68, 0x02, 0x40, 0x30, 0x39, 0x7e, 0xa7, 0x5f, 0x39, 0x7e, 0xa7, 0x5f, 0x01, 0x00,
                checksum as u8, 0x16
            ]
        );
        assert!(InverterCodec::new("NLDN1234").is_err());
    }

    #[test]
    fn decodes_connected_phases_only() {
        let mut codec = InverterCodec::new("1604812345").unwrap();
        let frame = status_frame();
        let mut buf = frame[..100].to_vec();
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[100..]);

        let Some(Reply::Status { fields, .. }) = codec.decode(&mut buf).unwrap() else {
            panic!("expected a status reply");
        };
        assert_eq!(field(&fields, "temperature"), Some(&FieldValue::Float(41.2)));
        assert_eq!(field(&fields, "vac1"), Some(&FieldValue::Float(229.8)));
        assert_eq!(field(&fields, "power1"), Some(&FieldValue::Int(1530)));
        assert_eq!(field(&fields, "energy_total_wh"), Some(&FieldValue::Int(1_234_500)));
        assert_eq!(field(&fields, "vac2"), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_frames_without_ok_mark() {
        let mut codec = InverterCodec::new("1604812345").unwrap();
        let mut buf = status_frame();
        buf[155] = 0;
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
