//! LG Netcast TV remote control: XML over HTTP on port 8080.
//!
//! The TV answers each POST and closes the connection, so every request
//! travels on its own connection. Pairing is two-stage: `AuthKeyReq` makes
//! the TV display a key, `AuthReq` with that key returns a session id that
//! `HandleKeyInput` commands must carry.

use crate::codec::{Credential, DeviceFault, Exchange, HandshakeReply, ProtocolCodec, Reply, SessionToken};
use crate::config::DeviceConfig;
use crate::error::{DecodeError, LinkError, Result};
use crate::state::StateField;
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
const AUTH_PATH: &str = "/hdcp/api/auth";
const COMMAND_PATH: &str = "/hdcp/api/dtv_wifirc";
const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADER: usize = 8192;

define_key_codes! {
    /// Remote-control keys understood by `HandleKeyInput`.
    pub enum LgKey: u16 {
        StatusBar = ("status_bar", 35),
        QuickMenu = ("quick_menu", 69),
        HomeMenu = ("home_menu", 67),
        PremiumMenu = ("premium_menu", 89),
        InstallationMenu = ("installation_menu", 207),
        FactoryAdvancedMenu1 = ("factory_advanced_menu1", 251),
        FactoryAdvancedMenu2 = ("factory_advanced_menu2", 255),
        PowerOff = ("power_off", 8),
        SleepTimer = ("sleep_timer", 14),
        Left = ("left", 7),
        Right = ("right", 6),
        Up = ("up", 64),
        Down = ("down", 65),
        Select = ("select", 68),
        Back = ("back", 40),
        Exit = ("exit", 91),
        Red = ("red", 114),
        Green = ("green", 113),
        Yellow = ("yellow", 99),
        Blue = ("blue", 97),
        Digit0 = ("0", 16),
        Digit1 = ("1", 17),
        Digit2 = ("2", 18),
        Digit3 = ("3", 19),
        Digit4 = ("4", 20),
        Digit5 = ("5", 21),
        Digit6 = ("6", 22),
        Digit7 = ("7", 23),
        Digit8 = ("8", 24),
        Digit9 = ("9", 25),
        Underscore = ("underscore", 76),
        Play = ("play", 176),
        Pause = ("pause", 186),
        FastForward = ("fast_forward", 142),
        Rewind = ("rewind", 143),
        Stop = ("stop", 177),
        Record = ("record", 189),
        TvRadio = ("tv_radio", 15),
        Simplink = ("simplink", 126),
        Input = ("input", 11),
        ComponentRgbHdmi = ("component_rgb_hdmi", 152),
        Component = ("component", 191),
        Rgb = ("rgb", 213),
        Hdmi = ("hdmi", 198),
        Hdmi1 = ("hdmi1", 206),
        Hdmi2 = ("hdmi2", 204),
        Hdmi3 = ("hdmi3", 233),
        Hdmi4 = ("hdmi4", 218),
        Av1 = ("av1", 90),
        Av2 = ("av2", 208),
        Av3 = ("av3", 209),
        Usb = ("usb", 124),
        SlideshowUsb1 = ("slideshow_usb1", 238),
        SlideshowUsb2 = ("slideshow_usb2", 168),
        ChannelUp = ("channel_up", 0),
        ChannelDown = ("channel_down", 1),
        ChannelBack = ("channel_back", 26),
        Favorites = ("favorites", 30),
        Teletext = ("teletext", 32),
        TOpt = ("t_opt", 33),
        ChannelList = ("channel_list", 83),
        AddButton = ("add_button", 85),
        Guide = ("guide", 169),
        Info = ("info", 170),
        LiveTv = ("live_tv", 158),
        AvMode = ("av_mode", 48),
        PictureMode = ("picture_mode", 77),
        Ratio = ("ratio", 121),
        Ratio4x3 = ("ratio_4_3", 118),
        Ratio16x9 = ("ratio_16_9", 119),
        EnergySaving = ("energy_saving", 149),
        CinemaZoom = ("cinema_zoom", 175),
        ThreeD = ("3d", 220),
        FactoryPictureCheck = ("factory_picture_check", 252),
        VolumeUp = ("volume_up", 2),
        VolumeDown = ("volume_down", 3),
        Mute = ("mute", 9),
        AudioLanguage = ("audio_language", 10),
        SoundMode = ("sound_mode", 82),
        FactorySoundCheck = ("factory_sound_check", 253),
        SubtitleLanguage = ("subtitle_language", 57),
        AudioDescription = ("audio_description", 145),
    }
}

/// What the last request asked for; decides how a 200 is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    PairingKey,
    Session,
    Key(LgKey),
}

pub struct LgTvCodec {
    host: String,
    codes: HashMap<LgKey, u16>,
    pending: Option<Pending>,
}

impl LgTvCodec {
    /// `host` goes into the `Host` header of each request.
    pub fn new<H: Into<String>>(host: H) -> Self {
        Self {
            host: host.into(),
            codes: LgKey::TABLE.iter().map(|(key, _, code)| (*key, *code)).collect(),
            pending: None,
        }
    }

    fn post(&mut self, path: &str, body: String, pending: Pending) -> Vec<u8> {
        self.pending = Some(pending);
        let mut request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/atom+xml; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            path,
            self.host,
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body.as_bytes());
        request
    }

    fn interpret(&mut self, status: u16, body: &str) -> std::result::Result<Reply, DecodeError> {
        let pending = self.pending.take();
        match status {
            200 => {}
            401 => return Ok(Reply::Error(DeviceFault::Unauthorized)),
            other => return Ok(Reply::Error(DeviceFault::Rejected(format!("HTTP {}", other)))),
        }
        match pending {
            Some(Pending::PairingKey) => Ok(Reply::Handshake(HandshakeReply::PairingKeyShown)),
            Some(Pending::Session) => xml_text(body, "session")
                .filter(|s| !s.is_empty())
                .map(|s| Reply::Handshake(HandshakeReply::Token(SessionToken::new(s))))
                .ok_or_else(|| DecodeError::Malformed("auth reply carries no session".into())),
            Some(Pending::Key(LgKey::PowerOff)) => Ok(Reply::CommandAck {
                fields: vec![StateField::new("power", false)],
            }),
            Some(Pending::Key(key)) => Ok(Reply::CommandAck {
                fields: vec![StateField::new("last_key", key.label())],
            }),
            None => Err(DecodeError::Malformed("response without a request".into())),
        }
    }
}

/// Text of the first `<tag>...</tag>` in `xml`.
fn xml_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let len = xml[start..].find(&close)?;
    Some(xml[start..start + len].trim())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct ResponseHead {
    status: u16,
    content_length: Option<usize>,
}

fn parse_head(head: &str) -> std::result::Result<ResponseHead, DecodeError> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .filter(|_| status_line.starts_with("HTTP/"))
        .ok_or_else(|| DecodeError::Malformed(format!("bad status line '{}'", status_line)))?;

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| {
            value
                .trim()
                .parse()
                .map_err(|_| DecodeError::Malformed(format!("bad content length '{}'", value.trim())))
        })
        .transpose()?;
    Ok(ResponseHead {
        status,
        content_length,
    })
}

impl ProtocolCodec for LgTvCodec {
    type Command = LgKey;

    fn name(&self) -> &'static str {
        "lgtv"
    }

    fn preset(&self, config: DeviceConfig) -> DeviceConfig {
        let port = if config.port == 0 { DEFAULT_PORT } else { config.port };
        DeviceConfig { port, ..config }
            .with_keep_warm(false)
            .with_connect_timeout(Duration::from_secs(10))
    }

    fn exchange(&self) -> Exchange {
        Exchange::PerRequest
    }

    fn requires_session(&self) -> bool {
        true
    }

    fn encode_pairing_request(&mut self) -> Result<Vec<u8>> {
        let body = r#"<?xml version="1.0" encoding="utf-8"?><auth><type>AuthKeyReq</type></auth>"#.to_string();
        Ok(self.post(AUTH_PATH, body, Pending::PairingKey))
    }

    fn encode_auth_request(&mut self, credential: &Credential) -> Result<Vec<u8>> {
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><auth><type>AuthReq</type><value>{}</value></auth>"#,
            credential.as_str()
        );
        Ok(self.post(AUTH_PATH, body, Pending::Session))
    }

    fn encode(&mut self, key: &LgKey, token: Option<&SessionToken>) -> Result<Vec<u8>> {
        let token = token.ok_or(LinkError::NotConnected)?;
        let code = self
            .codes
            .get(key)
            .copied()
            .ok_or_else(|| LinkError::UnknownCommand(key.label().to_string()))?;
        let body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><command><session>{}</session><name>HandleKeyInput</name><value>{}</value></command>"#,
            token.as_str(),
            code
        );
        Ok(self.post(COMMAND_PATH, body, Pending::Key(*key)))
    }

    fn decode(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
        let Some(head_end) = find(buf, HEADER_END) else {
            if buf.len() > MAX_HEADER {
                return Err(DecodeError::Malformed("response header too large".into()));
            }
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..head_end])?;
        let head = parse_head(head)?;

        // Without a length the body runs until the TV closes the connection.
        let Some(body_len) = head.content_length else {
            return Ok(None);
        };
        let body_start = head_end + HEADER_END.len();
        if buf.len() < body_start + body_len {
            return Ok(None);
        }
        let frame: Vec<u8> = buf.drain(..body_start + body_len).collect();
        let body = String::from_utf8_lossy(&frame[body_start..]);
        self.interpret(head.status, &body).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut Vec<u8>) -> std::result::Result<Option<Reply>, DecodeError> {
        let Some(head_end) = find(buf, HEADER_END) else {
            return Ok(None);
        };
        let head = parse_head(std::str::from_utf8(&buf[..head_end])?)?;
        if head.content_length.is_some() {
            // Cut short before the announced length.
            return Ok(None);
        }
        let frame = std::mem::take(buf);
        let body = String::from_utf8_lossy(&frame[head_end + HEADER_END.len()..]);
        self.interpret(head.status, &body).map(Some)
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}
