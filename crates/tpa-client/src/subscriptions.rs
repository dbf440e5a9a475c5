use std::collections::BTreeSet;

use glasses_protocol::StreamType;

/// Stream types the app currently wants. Ordering is irrelevant to the cloud;
/// a `BTreeSet` only keeps wire output stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRegistry {
    streams: BTreeSet<StreamType>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the set changed.
    pub fn add(&mut self, stream: StreamType) -> bool {
        self.streams.insert(stream)
    }

    /// Returns `true` if the set changed.
    pub fn remove(&mut self, stream: StreamType) -> bool {
        self.streams.remove(&stream)
    }

    pub fn contains(&self, stream: StreamType) -> bool {
        self.streams.contains(&stream)
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Full list sent in every `subscription_update`.
    pub fn snapshot(&self) -> Vec<StreamType> {
        self.streams.iter().copied().collect()
    }

    /// Compares against the cloud's record, returning `(missing, extra)`:
    /// streams the cloud lacks and streams it holds that we no longer want.
    pub fn diff(&self, remote: &[StreamType]) -> (Vec<StreamType>, Vec<StreamType>) {
        let remote: BTreeSet<StreamType> = remote.iter().copied().collect();
        let missing = self.streams.difference(&remote).copied().collect();
        let extra = remote.difference(&self.streams).copied().collect();
        (missing, extra)
    }
}
