//! Subscription registry and inbound message dispatch
//!
//! The registry is a prepend-only list: entries are never removed, a topic
//! subscribed twice yields two coexisting entries, and dispatch walks the
//! list most-recently-subscribed first. This is a closed design choice
//! carried over from the registry's origins, not an oversight; callers that
//! need unsubscription should gate it inside their callback.
//!
//! Dispatch runs with the link's state lock held. Callbacks must therefore
//! be non-blocking and must not call back into subscribe/publish paths that
//! reacquire that lock.

use crate::client::connection::QosLevel;
use std::fmt;

/// Callback invoked for each matching inbound message. Captures its own
/// context; arguments are the concrete topic and the raw payload.
pub type MessageCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A single topic registration. Immutable once created.
pub struct Subscription {
    topic: String,
    qos: QosLevel,
    callback: MessageCallback,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QosLevel {
        self.qos
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered collection of subscriptions, dispatched
/// most-recently-subscribed first.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a new entry. Duplicate topics coexist.
    pub fn add(&mut self, topic: impl Into<String>, qos: QosLevel, callback: MessageCallback) {
        self.entries.insert(
            0,
            Subscription {
                topic: topic.into(),
                qos,
                callback,
            },
        );
    }

    /// Entries in dispatch order (most recent first).
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Topics in dispatch order.
    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|s| s.topic.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke every entry whose filter matches `topic`, most recent first.
    /// Returns the number of callbacks invoked; zero matches is a no-op.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let mut invoked = 0;
        for sub in &self.entries {
            if topic_matches_filter(topic, &sub.topic) {
                (sub.callback)(topic, payload);
                invoked += 1;
            }
        }
        invoked
    }
}

/// Check if a topic matches a filter pattern.
///
/// A filter without wildcards matches by exact string equality. `+` matches
/// a single level and `#` matches all remaining levels, so entries recorded
/// under the same wildcard filter the broker granted still receive the
/// concrete topics it delivers.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    // Topics starting with $ are not matched by wildcards at the root level
    let topic_starts_with_dollar = topic_levels.first().is_some_and(|l| l.starts_with('$'));
    let filter_starts_with_wildcard = filter_levels
        .first()
        .is_some_and(|l| *l == "#" || *l == "+");
    if topic_starts_with_dollar && filter_starts_with_wildcard {
        return false;
    }

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            return true;
        }
        if ti >= topic_levels.len() {
            return false;
        }
        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn recording_callback(log: &Arc<Mutex<Vec<(String, String)>>>, tag: &str) -> MessageCallback {
        let log = log.clone();
        let tag = tag.to_string();
        Box::new(move |topic, payload| {
            log.lock().unwrap().push((
                tag.clone(),
                format!("{topic}={}", String::from_utf8_lossy(payload)),
            ));
        })
    }

    #[test]
    fn entries_are_prepended() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.add("a", QosLevel::BestEffort, recording_callback(&log, "a"));
        registry.add("b", QosLevel::BestEffort, recording_callback(&log, "b"));
        registry.add("c", QosLevel::BestEffort, recording_callback(&log, "c"));

        assert_eq!(registry.topics(), vec!["c", "b", "a"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn dispatch_matches_exact_topic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.add(
            "sensors/temp",
            QosLevel::Acknowledged,
            recording_callback(&log, "t"),
        );
        registry.add(
            "sensors/humidity",
            QosLevel::Acknowledged,
            recording_callback(&log, "h"),
        );

        assert_eq!(registry.dispatch("sensors/temp", b"21.5"), 1);
        let entries = log.lock().unwrap();
        assert_eq!(
            *entries,
            vec![("t".to_string(), "sensors/temp=21.5".to_string())]
        );
    }

    #[test]
    fn dispatch_with_no_match_is_a_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.add("a/b", QosLevel::BestEffort, recording_callback(&log, "x"));

        assert_eq!(registry.dispatch("c/d", b"payload"), 0);
        assert!(log.lock().unwrap().is_empty());

        // Empty registry too
        let empty = SubscriptionRegistry::new();
        assert_eq!(empty.dispatch("anything", b""), 0);
    }

    #[test]
    fn duplicate_entries_all_fire_most_recent_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.add("dup", QosLevel::BestEffort, recording_callback(&log, "old"));
        registry.add("dup", QosLevel::BestEffort, recording_callback(&log, "new"));

        assert_eq!(registry.dispatch("dup", b"x"), 2);
        let tags: Vec<String> = log.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(tags, vec!["new", "old"]);
    }

    #[test]
    fn delivery_order_is_preserved_per_subscription() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        registry.add("q", QosLevel::BestEffort, recording_callback(&log, "q"));

        for payload in ["1", "2", "3"] {
            registry.dispatch("q", payload.as_bytes());
        }
        let payloads: Vec<String> = log.lock().unwrap().iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads, vec!["q=1", "q=2", "q=3"]);
    }

    #[test]
    fn wildcard_filters_match() {
        assert!(topic_matches_filter("status/42", "status/#"));
        assert!(topic_matches_filter("status/42/detail", "status/#"));
        assert!(topic_matches_filter("status/42", "status/+"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "#"));

        assert!(!topic_matches_filter("status", "status/+"));
        assert!(!topic_matches_filter("status/42/detail", "status/+"));
        assert!(!topic_matches_filter("other/42", "status/#"));
        // System topics are not swept up by root-level wildcards
        assert!(!topic_matches_filter("$SYS/broker/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/broker/uptime", "+/broker/uptime"));
    }

    #[test]
    fn literal_filters_require_exact_equality() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a/b/c", "a/b"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("A/b", "a/b"));
    }

    proptest! {
        // A literal filter (no wildcards) matches exactly itself.
        #[test]
        fn literal_filter_matches_only_itself(
            topic in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            other in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
        ) {
            prop_assert!(topic_matches_filter(&topic, &topic));
            prop_assert_eq!(topic_matches_filter(&other, &topic), topic == other);
        }
    }
}
