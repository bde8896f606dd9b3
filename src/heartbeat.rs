//! Periodic tick: watchdog, staleness, wedge detection, draining and polling.

use crate::codec::{Exchange, ProtocolCodec};
use crate::connection::Connector;
use crate::core::DeviceCore;
use crate::error::LinkError;
use crate::sink::DeviceStateSink;
use log::{debug, info};
use std::time::{Duration, Instant};

/// Heartbeat bookkeeping of one device.
#[derive(Debug, Clone)]
pub struct HeartbeatClock {
    interval: Duration,
    last: Option<Instant>,
    ticks: u64,
    reconnect_every: u32,
}

impl HeartbeatClock {
    pub fn new(interval: Duration, reconnect_every: u32) -> Self {
        Self {
            interval,
            last: None,
            ticks: 0,
            reconnect_every: reconnect_every.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last(&self) -> Option<Instant> {
        self.last
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self, now: Instant) {
        self.last = Some(now);
        self.ticks += 1;
    }

    /// Whether the current tick may start a connect attempt.
    pub fn reconnect_due(&self) -> bool {
        self.ticks % u64::from(self.reconnect_every) == 0
    }
}

impl<C: ProtocolCodec, K: Connector, S: DeviceStateSink> DeviceCore<C, K, S> {
    pub fn heartbeat(&mut self, now: Instant) {
        self.clock.tick(now);

        if let Some(error) = self.link.check_watchdog(now) {
            self.connect_failed(error);
        }

        let evicted = self.queue.evict_stale(now, self.config.stale_after);
        if evicted > 0 {
            info!("Evicted {} stale commands of device {}", evicted, self.id);
        }

        let one_at_a_time = self.codec.exchange() == Exchange::PerRequest;
        if one_at_a_time && self.link.is_connected() && self.link.outstanding().count() > 0 {
            self.link.waited_for_reply();
        }

        let outstanding = *self.link.outstanding();
        if self.link.is_connected() && outstanding.exceeded() {
            self.force_disconnect(LinkError::Wedged(outstanding.count()), now);
            return;
        }
        // A per-request link answers exactly one request.
        let may_send = !one_at_a_time || outstanding.count() == 0;

        let may_connect = self.clock.reconnect_due();
        if self.queue.has_ready() {
            if self.link.ensure_connected(!may_connect, now) && self.session.is_active() && may_send {
                self.drain_one();
            }
            return;
        }

        let warm = self.config.keep_warm && may_connect;
        let connected = self.link.ensure_connected(!warm, now);
        if self.queue.head_is_barrier() {
            // Released on any tick with nothing in flight, linked or not.
            let in_flight = connected && outstanding.count() > 0;
            if !in_flight && self.queue.pop_barrier() {
                debug!("Barrier of device {} released", self.id);
            }
            return;
        }
        if connected && self.session.is_active() && may_send {
            self.send_poll();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, QueuePolicy};
    use crate::connection::testing::FakeConnector;
    use crate::connection::LinkEvent;
    use crate::core::testing::{LineCodec, RecordingSink, TestCommand};
    use crate::state::ConnectionState;

    type Core = DeviceCore<LineCodec, FakeConnector, RecordingSink>;

    fn core(config: DeviceConfig) -> (Core, FakeConnector) {
        let connector = FakeConnector::default();
        let core = DeviceCore::new("dev", &config, LineCodec::persistent(), connector.clone(), RecordingSink::default());
        (core, connector)
    }

    fn connected(core: &mut Core, now: Instant) {
        core.heartbeat(now);
        let epoch = core.link.epoch();
        core.on_link_event(LinkEvent::Connected { epoch }, now);
    }

    #[test]
    fn reconnects_are_throttled() {
        let mut clock = HeartbeatClock::new(Duration::from_secs(20), 3);
        let due: Vec<bool> = (0..6)
            .map(|_| {
                clock.tick(Instant::now());
                clock.reconnect_due()
            })
            .collect();
        assert_eq!(due, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn wedged_device_is_disconnected_exactly_once() {
        let config = DeviceConfig::default()
            .with_max_outstanding(2)
            .with_reconnect_every(100)
            .with_disconnect_policy(QueuePolicy::Preserve);
        let (mut core, connector) = core(config);
        let mut now = Instant::now();
        core.link.ensure_connected(false, now);
        let epoch = core.link.epoch();
        core.on_link_event(LinkEvent::Connected { epoch }, now);

        // Connect sent one poll; two more ticks push it past the limit.
        for _ in 0..2 {
            now += Duration::from_secs(20);
            core.heartbeat(now);
        }
        assert_eq!(core.link.outstanding().count(), 3);
        core.queue.enqueue(TestCommand::Say(1), now).unwrap();

        for _ in 0..3 {
            now += Duration::from_secs(1);
            core.heartbeat(now);
        }
        assert_eq!(connector.closed(), 1);
        assert_eq!(core.connection_state(), ConnectionState::Disconnected);
        assert_eq!(core.sink().faults, vec![LinkError::Wedged(3)]);
        assert_eq!(core.queue().len(), 1);

        core.link.ensure_connected(false, now);
        let epoch = core.link.epoch();
        core.on_link_event(LinkEvent::Connected { epoch }, now);
        // The preserved command goes out on the fresh link.
        assert_eq!(core.link.outstanding().count(), 1);
        assert!(core.queue().is_empty());
    }

    #[test]
    fn watchdog_failure_counts_as_connect_failure() {
        let config = DeviceConfig::default().with_connect_timeout(Duration::from_secs(60));
        let (mut core, connector) = core(config);
        let start = Instant::now();
        core.submit(TestCommand::Say(1), start).unwrap();

        core.heartbeat(start + Duration::from_secs(61));
        assert_eq!(core.sink().faults, vec![LinkError::ConnectTimeout]);
        assert!(core.queue().is_empty());
        // The same tick opened a fresh socket.
        assert_eq!(connector.opened(), 2);
    }

    #[test]
    fn stale_commands_never_go_out() {
        let (mut core, connector) = core(DeviceConfig::default().with_keep_warm(false));
        let start = Instant::now();
        core.queue.enqueue(TestCommand::Say(1), start).unwrap();
        core.queue.enqueue(TestCommand::Say(2), start + Duration::from_secs(20)).unwrap();

        core.heartbeat(start + Duration::from_secs(40));
        let epoch = core.link.epoch();
        core.on_link_event(LinkEvent::Connected { epoch }, start + Duration::from_secs(40));
        assert_eq!(connector.sent_frames(), vec![b"S2\n".to_vec()]);
    }

    #[test]
    fn idle_ticks_poll_and_release_barriers() {
        let (mut core, connector) = core(DeviceConfig::default());
        let now = Instant::now();
        connected(&mut core, now);
        assert_eq!(connector.sent_frames().len(), 1);

        let epoch = core.link.epoch();
        core.on_link_event(LinkEvent::Received { epoch, bytes: b"on\n".to_vec() }, now);
        core.submit_barrier(now).unwrap();
        core.submit(TestCommand::Say(4), now).unwrap();
        // The barrier holds the command back.
        assert_eq!(connector.sent_frames().len(), 1);

        core.heartbeat(now);
        assert!(!core.queue().head_is_barrier());
        core.heartbeat(now);
        assert_eq!(connector.sent_frames().last(), Some(&b"S4\n".to_vec()));

        core.heartbeat(now);
        assert_eq!(connector.sent_frames().last(), Some(&b"?\n".to_vec()));
    }

    #[test]
    fn cold_devices_stay_disconnected_when_idle() {
        let (mut core, connector) = core(DeviceConfig::default().with_keep_warm(false));
        let now = Instant::now();
        for _ in 0..5 {
            core.heartbeat(now);
        }
        assert_eq!(connector.opened(), 0);
        assert_eq!(core.clock.ticks(), 5);
    }
}
