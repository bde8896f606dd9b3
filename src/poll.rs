//! Status-poll selection keyed by the topic of the last decoded status reply.

/// Chooses the status request for an idle heartbeat.
///
/// Devices like the AVR answer one query per poll, so the table chains them:
/// after a `PW` report the next poll is `ZM?`, after `ZM` it is `SI?` and so on.
/// An unknown or absent topic restarts the chain at `initial`.
#[derive(Debug, Clone)]
pub struct PollTable<C> {
    initial: Option<C>,
    chain: Vec<(&'static str, C)>,
}

impl<C> PollTable<C> {
    /// No polling; the link is only used for commands.
    pub fn none() -> Self {
        Self {
            initial: None,
            chain: Vec::new(),
        }
    }

    /// Always poll with the same command.
    pub fn fixed(command: C) -> Self {
        Self {
            initial: Some(command),
            chain: Vec::new(),
        }
    }

    pub fn chain(initial: C, chain: Vec<(&'static str, C)>) -> Self {
        Self {
            initial: Some(initial),
            chain,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.initial.is_none()
    }

    /// Whether `topic` participates in the chain.
    pub fn tracks(&self, topic: &str) -> bool {
        self.chain.iter().any(|(t, _)| *t == topic)
    }

    pub fn next(&self, last_topic: Option<&str>) -> Option<&C> {
        last_topic
            .and_then(|topic| {
                self.chain
                    .iter()
                    .find(|(t, _)| *t == topic)
                    .map(|(_, command)| command)
            })
            .or(self.initial.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_follows_last_topic() {
        let table = PollTable::chain("PW?", vec![("PW", "ZM?"), ("ZM", "SI?"), ("SI", "PW?")]);
        assert_eq!(table.next(None), Some(&"PW?"));
        assert_eq!(table.next(Some("PW")), Some(&"ZM?"));
        assert_eq!(table.next(Some("ZM")), Some(&"SI?"));
        assert_eq!(table.next(Some("XX")), Some(&"PW?"));
        assert!(table.tracks("SI"));
        assert!(!table.tracks("MS"));
    }

    #[test]
    fn empty_table_never_polls() {
        let table: PollTable<u8> = PollTable::none();
        assert!(table.is_empty());
        assert_eq!(table.next(Some("PW")), None);
        assert_eq!(PollTable::fixed(7u8).next(Some("anything")), Some(&7));
    }
}
