//! Subscription tracking for a streaming session.
//!
//! The set is the source of truth for what the session should be
//! subscribed to. It is replayed in full after every reconnect; runtime
//! subscribe/unsubscribe calls mutate it first and then notify the live
//! connection, so a change made while disconnected is never lost.

use crate::message::Channel;
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;

/// One channel subscription with its symbols (empty for account channels).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    channel: Channel,
    symbols: Vec<String>,
}

impl ChannelSpec {
    pub fn public<I, S>(channel: Channel, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut symbols: Vec<String> = symbols.into_iter().map(Into::into).collect();
        symbols.sort();
        symbols.dedup();
        Self { channel, symbols }
    }

    pub fn private(channel: Channel) -> Self {
        Self {
            channel,
            symbols: Vec::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn requires_token(&self) -> bool {
        self.channel.is_private()
    }
}

#[derive(Debug, Default)]
struct SetInner {
    specs: Vec<ChannelSpec>,
    acked: HashSet<Channel>,
}

#[derive(Debug, Default)]
pub struct SubscriptionSet {
    inner: RwLock<SetInner>,
}

impl SubscriptionSet {
    pub fn new(initial: impl IntoIterator<Item = ChannelSpec>) -> Self {
        let set = Self::default();
        for spec in initial {
            set.insert(spec);
        }
        set
    }

    /// Add a subscription, merging symbols into an existing entry for the
    /// same channel. Returns the part that was not already present.
    pub fn insert(&self, spec: ChannelSpec) -> Option<ChannelSpec> {
        let mut inner = self.inner.write();
        let Some(idx) = inner.specs.iter().position(|s| s.channel == spec.channel) else {
            debug!(channel = %spec.channel, "Subscription added");
            inner.specs.push(spec.clone());
            return Some(spec);
        };

        let existing = &mut inner.specs[idx];
        let added: Vec<String> = spec
            .symbols
            .into_iter()
            .filter(|s| !existing.symbols.contains(s))
            .collect();
        if added.is_empty() {
            return None;
        }
        existing.symbols.extend(added.iter().cloned());
        existing.symbols.sort();
        Some(ChannelSpec::public(spec.channel, added))
    }

    /// Remove the given symbols (or the whole channel when `spec` has
    /// none). Returns what was actually removed.
    pub fn remove(&self, spec: &ChannelSpec) -> Option<ChannelSpec> {
        let mut inner = self.inner.write();
        let idx = inner
            .specs
            .iter()
            .position(|s| s.channel == spec.channel)?;

        if spec.symbols.is_empty() {
            let removed = inner.specs.remove(idx);
            inner.acked.remove(&spec.channel);
            return Some(removed);
        }

        let existing = &mut inner.specs[idx];
        let removed: Vec<String> = existing
            .symbols
            .iter()
            .filter(|s| spec.symbols.contains(s))
            .cloned()
            .collect();
        if removed.is_empty() {
            return None;
        }
        existing.symbols.retain(|s| !removed.contains(s));
        if existing.symbols.is_empty() {
            inner.specs.remove(idx);
            inner.acked.remove(&spec.channel);
        }
        Some(ChannelSpec::public(spec.channel, removed))
    }

    pub fn specs(&self) -> Vec<ChannelSpec> {
        self.inner.read().specs.clone()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.inner.read().specs.iter().any(|s| s.channel == channel)
    }

    pub fn requires_token(&self) -> bool {
        self.inner.read().specs.iter().any(ChannelSpec::requires_token)
    }

    pub fn mark_acked(&self, channel: Channel) {
        self.inner.write().acked.insert(channel);
    }

    pub fn is_acked(&self, channel: Channel) -> bool {
        self.inner.read().acked.contains(&channel)
    }

    /// Forget acknowledgements; called before replaying on a new connection.
    pub fn reset_acks(&self) {
        self.inner.write().acked.clear();
    }

    pub fn all_acked(&self) -> bool {
        let inner = self.inner.read();
        inner.specs.iter().all(|s| inner.acked.contains(&s.channel))
    }

    pub fn len(&self) -> usize {
        self.inner.read().specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().specs.is_empty()
    }
}
