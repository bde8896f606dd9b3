//! Per-device configuration supplied by the host.

use crate::codec::Credential;
use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(20);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_QUEUED: usize = 10;
const DEFAULT_MAX_OUTSTANDING: u32 = 5;

/// What happens to queued commands when the link goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Drop everything; commands are never replayed against stale device state.
    #[default]
    Clear,
    /// Keep the queue for replay on the next connection.
    Preserve,
}

/// Tunables of one managed device.
///
/// Durations are (de)serialized as fractional seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub address: String,
    pub port: u16,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    pub max_queued: usize,
    pub max_outstanding: u32,
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Heartbeat-driven reconnects happen on every n-th tick.
    pub reconnect_every: u32,
    /// Connect on idle heartbeats even when nothing is queued.
    pub keep_warm: bool,
    pub on_disconnect: QueuePolicy,
    pub on_connect_failure: QueuePolicy,
    pub credential: Option<Credential>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            max_queued: DEFAULT_MAX_QUEUED,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            stale_after: DEFAULT_STALE_AFTER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_every: 1,
            keep_warm: true,
            on_disconnect: QueuePolicy::Clear,
            on_connect_failure: QueuePolicy::Clear,
            credential: None,
        }
    }
}

impl DeviceConfig {
    pub fn new<A: Into<String>>(address: A, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    pub fn with_max_outstanding(mut self, max_outstanding: u32) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_every(mut self, ticks: u32) -> Self {
        self.reconnect_every = ticks;
        self
    }

    pub fn with_keep_warm(mut self, keep_warm: bool) -> Self {
        self.keep_warm = keep_warm;
        self
    }

    pub fn with_disconnect_policy(mut self, policy: QueuePolicy) -> Self {
        self.on_disconnect = policy;
        self
    }

    pub fn with_connect_failure_policy(mut self, policy: QueuePolicy) -> Self {
        self.on_connect_failure = policy;
        self
    }

    /// Blank or too-short keys are treated as "not configured".
    pub fn with_credential<S: Into<String>>(mut self, credential: S) -> Self {
        self.credential = Credential::new(credential);
        self
    }

    /// Checks ranges and normalizes the credential.
    pub fn validate(mut self) -> Result<Self> {
        if self.max_queued == 0 {
            return Err(LinkError::Config("max_queued must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(LinkError::Config("heartbeat_interval must be positive".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(LinkError::Config("connect_timeout must be positive".into()));
        }
        if self.reconnect_every == 0 {
            return Err(LinkError::Config("reconnect_every must be at least 1".into()));
        }
        self.credential = self
            .credential
            .take()
            .and_then(|c| Credential::new(c.as_str()));
        Ok(self)
    }

    pub fn socket_addr(&self) -> Result<String> {
        if self.address.is_empty() {
            return Err(LinkError::Config("address is empty".into()));
        }
        if self.port == 0 {
            return Err(LinkError::Config("port is not set".into()));
        }
        Ok(format!("{}:{}", self.address, self.port))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let cfg: DeviceConfig = serde_json::from_str(
            r#"{"address": "192.168.13.15", "port": 8080, "heartbeat_interval": 2.5,
                "on_disconnect": "preserve", "credential": "123456"}"#,
        )
        .unwrap();
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(cfg.on_disconnect, QueuePolicy::Preserve);
        assert_eq!(cfg.on_connect_failure, QueuePolicy::Clear);
        assert_eq!(cfg.max_queued, DEFAULT_MAX_QUEUED);
        assert_eq!(cfg.credential.as_ref().map(|c| c.as_str()), Some("123456"));
        assert_eq!(cfg.socket_addr().unwrap(), "192.168.13.15:8080");
    }

    #[test]
    fn short_credentials_are_ignored() {
        let cfg: DeviceConfig =
            serde_json::from_str(r#"{"address": "tv", "port": 8080, "credential": " 1 "}"#).unwrap();
        assert!(cfg.validate().unwrap().credential.is_none());
        assert!(DeviceConfig::default().with_credential("").credential.is_none());
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(DeviceConfig::default().with_max_queued(0).validate().is_err());
        assert!(DeviceConfig::default().with_reconnect_every(0).validate().is_err());
        assert!(DeviceConfig::default().socket_addr().is_err());
    }
}
