//! Where decoded device state ends up: the host's device registry.

use crate::error::LinkError;
use crate::state::{FieldValue, StateField};
use log::debug;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Receives observable state changes of one device.
///
/// Calls may repeat values; implementations must be idempotent.
pub trait DeviceStateSink: Send + 'static {
    fn update_state(&mut self, field: &StateField);

    /// Device reachable (link up) or shown as unreachable.
    fn set_reachable(&mut self, reachable: bool);

    /// A failure the user may want to see. Called once per failure.
    fn report_fault(&mut self, _fault: &LinkError) {}
}

/// Forwards only values that differ from the last pushed one.
pub struct DedupSink<S> {
    inner: S,
    last: HashMap<&'static str, FieldValue>,
    reachable: Option<bool>,
}

impl<S: DeviceStateSink> DedupSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            last: HashMap::new(),
            reachable: None,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn last_value(&self, key: &str) -> Option<&FieldValue> {
        self.last.get(key)
    }
}

impl<S: DeviceStateSink> DeviceStateSink for DedupSink<S> {
    fn update_state(&mut self, field: &StateField) {
        if self.last.get(field.key) == Some(&field.value) {
            return;
        }
        self.last.insert(field.key, field.value.clone());
        self.inner.update_state(field);
    }

    fn set_reachable(&mut self, reachable: bool) {
        if self.reachable == Some(reachable) {
            return;
        }
        self.reachable = Some(reachable);
        self.inner.set_reachable(reachable);
    }

    fn report_fault(&mut self, fault: &LinkError) {
        self.inner.report_fault(fault);
    }
}

/// Events published by a running device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    State(StateField),
    Reachable(bool),
    Fault { code: u32, message: String },
}

/// Publishes sink calls on a broadcast channel for `Device::stream`.
pub struct BroadcastSink {
    tx: broadcast::Sender<DeviceEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<DeviceEvent>) -> Self {
        Self { tx }
    }

    fn publish(&self, event: DeviceEvent) {
        // No subscribers is fine; nobody is watching yet.
        if self.tx.send(event).is_err() {
            debug!("No subscribers for device event");
        }
    }
}

impl DeviceStateSink for BroadcastSink {
    fn update_state(&mut self, field: &StateField) {
        self.publish(DeviceEvent::State(field.clone()));
    }

    fn set_reachable(&mut self, reachable: bool) {
        self.publish(DeviceEvent::Reachable(reachable));
    }

    fn report_fault(&mut self, fault: &LinkError) {
        self.publish(DeviceEvent::Fault {
            code: fault.code(),
            message: fault.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fields: Vec<StateField>,
        reachable: Vec<bool>,
    }

    impl DeviceStateSink for Recorder {
        fn update_state(&mut self, field: &StateField) {
            self.fields.push(field.clone());
        }

        fn set_reachable(&mut self, reachable: bool) {
            self.reachable.push(reachable);
        }
    }

    #[test]
    fn dedup_drops_repeated_values() {
        let mut sink = DedupSink::new(Recorder::default());
        sink.update_state(&StateField::new("power", true));
        sink.update_state(&StateField::new("power", true));
        sink.update_state(&StateField::new("volume", 30i64));
        sink.update_state(&StateField::new("power", false));
        sink.set_reachable(true);
        sink.set_reachable(true);
        sink.set_reachable(false);

        let inner = sink.into_inner();
        assert_eq!(inner.fields.len(), 3);
        assert_eq!(inner.reachable, vec![true, false]);
    }

    #[tokio::test]
    async fn broadcast_sink_publishes() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut sink = BroadcastSink::new(tx);
        sink.update_state(&StateField::new("source", "TV"));
        sink.report_fault(&LinkError::ConnectTimeout);

        assert_eq!(
            rx.recv().await.unwrap(),
            DeviceEvent::State(StateField::new("source", "TV"))
        );
        match rx.recv().await.unwrap() {
            DeviceEvent::Fault { code, .. } => assert_eq!(code, LinkError::ConnectTimeout.code()),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
