// Peer-side mailbox slots, keyed by (source peer, title).
//
// Two kinds of slot, chosen per record by its `queue` flag:
// - transient: holds the latest value received for the key in the current
//   receive cycle. `begin_cycle` empties every transient slot, so a key with
//   no new record in a cycle reads as empty for that whole cycle. Reading
//   does not consume.
// - queued: an unbounded FIFO. Delivery appends, reading pops the oldest,
//   and nothing is cleared automatically.
//
// When a key holds both, the queued backlog is served first.

use std::collections::{BTreeMap, VecDeque};

use groupnet_protocol::message::MessageRecord;
use serde_json::Value;

type Slots<T> = BTreeMap<String, BTreeMap<String, T>>;

#[derive(Debug, Default)]
pub struct Mailbox {
    transient: Slots<Value>,
    queued: Slots<VecDeque<Value>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a receive cycle: forget every transient value.
    pub fn begin_cycle(&mut self) {
        self.transient.clear();
    }

    /// File an incoming record under its source and title.
    pub fn deliver(&mut self, record: MessageRecord) {
        let MessageRecord {
            source,
            title,
            payload,
            queue,
            ..
        } = record;
        if queue {
            self.queued
                .entry(source)
                .or_default()
                .entry(title)
                .or_default()
                .push_back(payload);
        } else {
            self.transient
                .entry(source)
                .or_default()
                .insert(title, payload);
        }
    }

    /// Oldest queued value (consumed) or else the current transient value
    /// (left in place).
    pub fn take(&mut self, source: &str, title: &str) -> Option<Value> {
        let queued = self
            .queued
            .get_mut(source)
            .and_then(|titles| titles.get_mut(title))
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.transient_value(source, title).cloned())
    }

    /// What `take` would return, without consuming anything.
    pub fn peek(&self, source: &str, title: &str) -> Option<&Value> {
        self.queued_values(source, title)
            .and_then(VecDeque::front)
            .or_else(|| self.transient_value(source, title))
    }

    /// Every readable value for the key: the whole queued backlog (consumed)
    /// followed by the transient value, if any.
    pub fn take_all(&mut self, source: &str, title: &str) -> Vec<Value> {
        let mut values: Vec<Value> = self
            .queued
            .get_mut(source)
            .and_then(|titles| titles.get_mut(title))
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default();
        values.extend(self.transient_value(source, title).cloned());
        values
    }

    /// Number of values `take` could return before running dry, counting a
    /// transient value once.
    pub fn available(&self, source: &str, title: &str) -> usize {
        let queued = self.queued_values(source, title).map_or(0, VecDeque::len);
        let transient = usize::from(self.transient_value(source, title).is_some());
        queued + transient
    }

    pub fn clear(&mut self) {
        self.transient.clear();
        self.queued.clear();
    }

    fn transient_value(&self, source: &str, title: &str) -> Option<&Value> {
        self.transient.get(source).and_then(|titles| titles.get(title))
    }

    fn queued_values(&self, source: &str, title: &str) -> Option<&VecDeque<Value>> {
        self.queued.get(source).and_then(|titles| titles.get(title))
    }
}
