//! Hyperion JSON server: one JSON object per line in both directions.

use crate::codec::{DeviceFault, ProtocolCodec, Reply, SessionToken};
use crate::config::DeviceConfig;
use crate::error::{DecodeError, Result};
use crate::poll::PollTable;
use crate::state::StateField;
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

pub const DEFAULT_PORT: u16 = 19444;
pub const DEFAULT_PRIORITY: u32 = 1;

const LINE_END: u8 = b'\n';
const MAX_LINE: usize = 64 * 1024;
/// Selector entries in front of the effect names.
const FIXED_MODES: [&str; 2] = ["Auto", "Fixed"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HyperionCommand {
    ServerInfo,
    Color([u8; 3]),
    Effect(String),
    ClearAll,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default = "succeeded")]
    success: bool,
    error: Option<String>,
    info: Option<ServerInfo>,
}

fn succeeded() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo {
    #[serde(default)]
    effects: Vec<EffectDefinition>,
    active_led_color: Option<OneOrMany<LedColor>>,
    active_effects: Option<OneOrMany<ActiveEffect>>,
}

#[derive(Debug, Deserialize)]
struct EffectDefinition {
    name: String,
    script: String,
}

#[derive(Debug, Deserialize)]
struct LedColor {
    #[serde(rename = "RGB Value", default)]
    rgb: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ActiveEffect {
    script: Option<String>,
}

/// Older servers report a single object where newer ones send a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn first(&self) -> Option<&T> {
        match self {
            OneOrMany::Many(items) => items.first(),
            OneOrMany::One(item) => Some(item),
        }
    }
}

pub struct HyperionCodec {
    priority: u32,
    /// Effect script path -> display name.
    effects: HashMap<String, String>,
    /// "Auto|Fixed|<effects>" as last reported.
    modes: Vec<String>,
}

impl Default for HyperionCodec {
    fn default() -> Self {
        Self::with_priority(DEFAULT_PRIORITY)
    }
}

impl HyperionCodec {
    pub fn with_priority(priority: u32) -> Self {
        Self {
            priority,
            effects: HashMap::new(),
            modes: FIXED_MODES.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Selector names: `Auto`, `Fixed` and then every user effect.
    pub fn modes(&self) -> &[String] {
        &self.modes
    }

    fn server_info(&mut self, info: ServerInfo) -> Vec<StateField> {
        let mut fields = Vec::new();

        if !info.effects.is_empty() {
            let mut modes: Vec<String> = FIXED_MODES.iter().map(|m| m.to_string()).collect();
            self.effects.clear();
            for effect in info.effects {
                let upper = effect.name.to_uppercase();
                // UDP listeners and the shutdown effect are not user selectable.
                if upper.contains("UDP") || upper.contains("SHUTDOWN") {
                    continue;
                }
                modes.push(effect.name.clone());
                self.effects.insert(effect.script, effect.name);
            }
            if modes != self.modes {
                debug!("Hyperion effects changed: {}", modes.join("|"));
                self.modes = modes;
                fields.push(StateField::new("modes", self.modes.join("|")));
            }
        }

        if let Some(color) = info.active_led_color.as_ref().and_then(|c| c.first())
            && color.rgb.len() >= 3
        {
            fields.push(StateField::new("red", color.rgb[0]));
            fields.push(StateField::new("green", color.rgb[1]));
            fields.push(StateField::new("blue", color.rgb[2]));
        }

        let active = info
            .active_effects
            .as_ref()
            .and_then(|e| e.first())
            .and_then(|e| e.script.as_ref())
            .and_then(|script| self.effects.get(script));
        let mode = active.map(String::as_str).unwrap_or(FIXED_MODES[1]);
        if let Some(index) = self.modes.iter().position(|m| m == mode) {
            fields.push(StateField::new("mode", mode));
            fields.push(StateField::new("mode_level", index as i64 * 10));
        }

        fields
    }
}

impl ProtocolCodec for HyperionCodec {
    type Command = HyperionCommand;

    fn name(&self) -> &'static str {
        "hyperion"
    }

    fn preset(&self, config: DeviceConfig) -> DeviceConfig {
        let port = if config.port == 0 { DEFAULT_PORT } else { config.port };
        DeviceConfig { port, ..config }.with_max_outstanding(2)
    }

    fn encode(&mut self, command: &HyperionCommand, _token: Option<&SessionToken>) -> Result<Vec<u8>> {
        let message = match command {
            HyperionCommand::ServerInfo => json!({ "command": "serverinfo" }),
            HyperionCommand::Color(rgb) => json!({
                "command": "color",
                "color": rgb,
                "priority": self.priority,
            }),
            HyperionCommand::Effect(name) => json!({
                "command": "effect",
                "effect": { "name": name },
                "priority": self.priority,
            }),
            HyperionCommand::ClearAll => json!({ "command": "clearall" }),
        };
        let mut frame = serde_json::to_vec(&message)?;
        frame.push(LINE_END);
        Ok(frame)
    }

    fn poll_table(&self) -> PollTable<HyperionCommand> {
        PollTable::fixed(HyperionCommand::ServerInfo)
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
            let text = std::str::from_utf8(&line[..end])?.trim();
            if text.is_empty() {
                continue;
            }

            let response: Response = serde_json::from_str(text)?;
            if !response.success {
                let reason = response.error.unwrap_or_else(|| "request failed".to_string());
                return Ok(Some(Reply::Error(DeviceFault::Rejected(reason))));
            }
            return Ok(Some(match response.info {
                Some(info) => Reply::status(self.server_info(info)),
                None => Reply::ack(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FieldValue;

    const SERVER_INFO: &str = r#"{"command":"serverinfo","success":true,"info":{
        "effects":[
            {"name":"Knight rider","script":"/effects/knight-rider.py","args":{}},
            {"name":"UDP listener","script":"/effects/udp.py","args":{}},
            {"name":"Rainbow swirl","script":"/effects/rainbow-swirl.py","args":{}}
        ],
        "activeLedColor":[{"HEX Value":["0xFF8000"],"RGB Value":[255,128,0]}],
        "activeEffects":[{"name":"Rainbow swirl","script":"/effects/rainbow-swirl.py","priority":1}]
    }}"#;

    fn field<'a>(fields: &'a [StateField], key: &str) -> Option<&'a FieldValue> {
        fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    #[test]
    fn encodes_newline_delimited_json() {
        let mut codec = HyperionCodec::default();
        assert_eq!(
            codec.encode(&HyperionCommand::ServerInfo, None).unwrap(),
            b"{\"command\":\"serverinfo\"}\n"
        );
        assert_eq!(
            codec.encode(&HyperionCommand::Color([255, 0, 10]), None).unwrap(),
            b"{\"color\":[255,0,10],\"command\":\"color\",\"priority\":1}\n"
        );
    }

    #[test]
    fn server_info_reports_color_and_effect() {
        let mut codec = HyperionCodec::default();
        let mut buf = SERVER_INFO.replace('\n', "").into_bytes();
        buf.push(b'\n');

        let Some(Reply::Status { fields, .. }) = codec.decode(&mut buf).unwrap() else {
            panic!("expected a status reply");
        };
        assert_eq!(
            field(&fields, "modes"),
            Some(&FieldValue::Text("Auto|Fixed|Knight rider|Rainbow swirl".into()))
        );
        assert_eq!(field(&fields, "green"), Some(&FieldValue::Int(128)));
        assert_eq!(field(&fields, "mode"), Some(&FieldValue::Text("Rainbow swirl".into())));
        assert_eq!(field(&fields, "mode_level"), Some(&FieldValue::Int(30)));
        assert!(buf.is_empty());

        // The effect list is only reported when it changes.
        let mut buf = SERVER_INFO.replace('\n', "").into_bytes();
        buf.push(b'\n');
        let Some(Reply::Status { fields, .. }) = codec.decode(&mut buf).unwrap() else {
            panic!("expected a status reply");
        };
        assert_eq!(field(&fields, "modes"), None);
    }

    #[test]
    fn command_results() {
        let mut codec = HyperionCodec::default();
        let mut buf = b"{\"success\":true}\n{\"success\":false,\"error\":\"Effect not found\"}\n{\"suc".to_vec();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Reply::ack()));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Error(DeviceFault::Rejected("Effect not found".into())))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf, b"{\"suc");
    }

    #[test]
    fn invalid_json_is_a_decode_error() {
        let mut codec = HyperionCodec::default();
        let mut buf = b"not json\n".to_vec();
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::Json(_))));
    }
}
