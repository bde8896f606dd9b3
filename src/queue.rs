//! Bounded FIFO of outbound commands with overflow, staleness and disconnect drops.

use crate::config::QueuePolicy;
use crate::error::{LinkError, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand<C> {
    pub command: C,
    pub enqueued_at: Instant,
}

impl<C> PendingCommand<C> {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry<C> {
    Command(PendingCommand<C>),
    /// Draining stops here until the heartbeat pops it on an idle tick.
    Barrier { enqueued_at: Instant },
}

/// Ordered, bounded queue of pending commands.
///
/// Barriers count toward the capacity. Staleness eviction only applies to
/// commands; a barrier leaves the queue solely through `pop_barrier`.
#[derive(Debug)]
pub struct CommandQueue<C> {
    entries: VecDeque<QueueEntry<C>>,
    capacity: usize,
}

impl<C> CommandQueue<C> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<C>> {
        self.entries.iter()
    }

    /// Appends to the tail. A full queue rejects the newcomer.
    pub fn enqueue(&mut self, command: C, now: Instant) -> Result<()> {
        self.push(QueueEntry::Command(PendingCommand {
            command,
            enqueued_at: now,
        }))
    }

    pub fn enqueue_barrier(&mut self, now: Instant) -> Result<()> {
        self.push(QueueEntry::Barrier { enqueued_at: now })
    }

    fn push(&mut self, entry: QueueEntry<C>) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(LinkError::QueueFull(self.capacity));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn head_is_barrier(&self) -> bool {
        matches!(self.entries.front(), Some(QueueEntry::Barrier { .. }))
    }

    /// True when `dequeue_next` would yield a command.
    pub fn has_ready(&self) -> bool {
        matches!(self.entries.front(), Some(QueueEntry::Command(_)))
    }

    /// Pops the head command. Stops at a barrier.
    pub fn dequeue_next(&mut self) -> Option<PendingCommand<C>> {
        if !self.has_ready() {
            return None;
        }
        match self.entries.pop_front() {
            Some(QueueEntry::Command(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Removes a barrier sitting at the head. Returns whether one was removed.
    pub fn pop_barrier(&mut self) -> bool {
        if self.head_is_barrier() {
            self.entries.pop_front();
            true
        } else {
            false
        }
    }

    /// Drops every command older than `max_age`, keeping survivors in order.
    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| match entry {
            QueueEntry::Command(pending) => pending.age(now) <= max_age,
            QueueEntry::Barrier { .. } => true,
        });
        before - self.entries.len()
    }

    /// Applies `policy` when the link drops. Without a prior session the
    /// queue is kept: those commands never had a chance to go out.
    pub fn on_disconnect(&mut self, policy: QueuePolicy, had_session: bool) -> usize {
        if !had_session {
            return 0;
        }
        match policy {
            QueuePolicy::Clear => self.clear(),
            QueuePolicy::Preserve => 0,
        }
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands<C: Clone>(queue: &CommandQueue<C>) -> Vec<C> {
        queue
            .iter()
            .filter_map(|e| match e {
                QueueEntry::Command(p) => Some(p.command.clone()),
                QueueEntry::Barrier { .. } => None,
            })
            .collect()
    }

    #[test]
    fn capacity_one_rejects_newest() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(1);
        assert!(queue.enqueue("A", now).is_ok());
        assert_eq!(queue.enqueue("B", now), Err(LinkError::QueueFull(1)));
        assert_eq!(commands(&queue), vec!["A"]);
    }

    #[test]
    fn never_grows_past_capacity() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(3);
        for i in 0..10 {
            let _ = if i % 4 == 0 {
                queue.enqueue_barrier(now)
            } else {
                queue.enqueue(i, now)
            };
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn evict_stale_removes_exactly_old_entries_in_order() {
        let start = Instant::now();
        let mut queue = CommandQueue::new(10);
        queue.enqueue(1, start).unwrap();
        queue.enqueue(2, start + Duration::from_secs(10)).unwrap();
        queue.enqueue(3, start + Duration::from_secs(1)).unwrap();
        queue.enqueue(4, start + Duration::from_secs(25)).unwrap();

        let now = start + Duration::from_secs(40);
        let evicted = queue.evict_stale(now, Duration::from_secs(30));
        assert_eq!(evicted, 2);
        assert_eq!(commands(&queue), vec![2, 4]);

        // Exactly max_age old is not stale.
        assert_eq!(queue.evict_stale(start + Duration::from_secs(40), Duration::from_secs(30)), 0);
    }

    #[test]
    fn barrier_blocks_draining_until_popped() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(5);
        queue.enqueue("input", now).unwrap();
        queue.enqueue_barrier(now).unwrap();
        queue.enqueue("hdmi1", now).unwrap();

        assert_eq!(queue.dequeue_next().map(|p| p.command), Some("input"));
        assert!(queue.head_is_barrier());
        assert_eq!(queue.dequeue_next(), None);
        assert!(queue.pop_barrier());
        assert!(!queue.pop_barrier());
        assert_eq!(queue.dequeue_next().map(|p| p.command), Some("hdmi1"));
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_eviction_keeps_barriers() {
        let start = Instant::now();
        let mut queue = CommandQueue::new(5);
        queue.enqueue_barrier(start).unwrap();
        queue.enqueue(1, start).unwrap();
        queue.evict_stale(start + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(queue.len(), 1);
        assert!(queue.head_is_barrier());
    }

    #[test]
    fn disconnect_policy() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(5);
        queue.enqueue(1, now).unwrap();
        queue.enqueue(2, now).unwrap();

        assert_eq!(queue.on_disconnect(QueuePolicy::Clear, false), 0);
        assert_eq!(queue.on_disconnect(QueuePolicy::Preserve, true), 0);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.on_disconnect(QueuePolicy::Clear, true), 2);
        assert!(queue.is_empty());
    }
}
