//! Per-cluster message bus and ledger.
//!
//! The bus is an append-only, topic-indexed event log. Publishing assigns
//! the next sequence number under the cluster-scoped lock and notifies
//! subscribers synchronously, in subscription order, before `publish`
//! returns. The log is authoritative: consumers that track a cursor can
//! always re-read missed messages with [`MessageBus::query`].

use crate::message::Message;
use crate::topic::{Topic, TopicFilter};
use chrono::Utc;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Handle returned by [`MessageBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: TopicFilter,
    callback: Callback,
}

/// Query filter for reading back the ledger.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Exact topic to match.
    pub topic: Option<String>,
    /// Only messages with `seq > since_seq`.
    pub since_seq: Option<u64>,
    /// Exact publisher to match.
    pub publisher: Option<String>,
}

struct Inner {
    log: Vec<Message>,
    by_topic: HashMap<String, Vec<u64>>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    mirror: Option<std::fs::File>,
}

/// Append-only, topic-indexed message ledger scoped to one cluster.
pub struct MessageBus {
    cluster_id: String,
    inner: Mutex<Inner>,
}

impl MessageBus {
    /// Creates an empty bus for the given cluster.
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            inner: Mutex::new(Inner {
                log: Vec::new(),
                by_topic: HashMap::new(),
                subscribers: Vec::new(),
                next_subscription: 0,
                mirror: None,
            }),
        }
    }

    /// Mirrors every published message to a JSONL file.
    ///
    /// The mirror is observability-only: write failures are logged and
    /// swallowed, and the in-memory ledger remains authoritative.
    pub fn with_mirror(self, path: impl AsRef<Path>) -> Self {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
        {
            Ok(file) => {
                self.inner
                    .lock()
                    .expect("bus lock poisoned")
                    .mirror = Some(file);
            }
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "Could not open ledger mirror, continuing without it"
                );
            }
        }
        self
    }

    /// The cluster this bus belongs to.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Publishes a message and returns its sequence number.
    ///
    /// The sequence number is assigned and the message appended under the
    /// bus lock; subscriber callbacks then run synchronously (in
    /// subscription order) with the lock released, so callbacks may publish
    /// follow-up messages without deadlocking.
    pub fn publish(
        &self,
        topic: impl Into<Topic>,
        publisher: impl Into<String>,
        payload: serde_json::Value,
    ) -> u64 {
        let topic = topic.into();
        let message;
        let matching: Vec<Callback>;
        {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            let seq = inner.log.len() as u64 + 1;
            message = Message {
                seq,
                cluster_id: self.cluster_id.clone(),
                topic: topic.clone(),
                publisher: publisher.into(),
                payload,
                timestamp: Utc::now(),
            };
            inner
                .by_topic
                .entry(topic.as_str().to_string())
                .or_default()
                .push(seq);
            inner.log.push(message.clone());

            if let Some(ref mut file) = inner.mirror {
                if let Ok(line) = serde_json::to_string(&message) {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(error = %e, "Ledger mirror write failed");
                    }
                }
            }

            matching = inner
                .subscribers
                .iter()
                .filter(|s| s.filter.matches(&message.topic))
                .map(|s| Arc::clone(&s.callback))
                .collect();
        }

        debug!(
            cluster = %self.cluster_id,
            seq = message.seq,
            topic = %message.topic,
            publisher = %message.publisher,
            subscribers = matching.len(),
            "Published message"
        );

        for callback in matching {
            callback(&message);
        }

        message.seq
    }

    /// Returns all messages matching the query, in sequence order.
    pub fn query(&self, query: &MessageQuery) -> Vec<Message> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        let since = query.since_seq.unwrap_or(0);

        let candidates: Vec<&Message> = match query.topic {
            Some(ref topic) => inner
                .by_topic
                .get(topic)
                .map(|seqs| {
                    seqs.iter()
                        .filter(|&&s| s > since)
                        .map(|&s| &inner.log[(s - 1) as usize])
                        .collect()
                })
                .unwrap_or_default(),
            None => inner.log.iter().filter(|m| m.seq > since).collect(),
        };

        candidates
            .into_iter()
            .filter(|m| {
                query
                    .publisher
                    .as_ref()
                    .is_none_or(|p| &m.publisher == p)
            })
            .cloned()
            .collect()
    }

    /// Registers a subscriber for every future message matching the filter.
    pub fn subscribe<F>(&self, filter: TopicFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.subscribers.push(Subscriber {
            id,
            filter,
            callback: Arc::new(callback),
        });
        id
    }

    /// Removes a subscriber. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.subscribers.retain(|s| s.id != id);
    }

    /// Number of messages in the ledger.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("bus lock poisoned").log.len()
    }

    /// True if nothing has been published yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The highest assigned sequence number, or 0 when empty.
    pub fn last_seq(&self) -> u64 {
        self.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sequence_numbers_are_gap_free() {
        let bus = MessageBus::new("c1");
        for i in 0..10 {
            let seq = bus.publish("t", "orchestrator", json!({ "i": i }));
            assert_eq!(seq, i + 1);
        }
        let all = bus.query(&MessageQuery::default());
        for (i, m) in all.iter().enumerate() {
            assert_eq!(m.seq, i as u64 + 1);
        }
    }

    #[test]
    fn test_concurrent_publish_linearizes() {
        let bus = Arc::new(MessageBus::new("c1"));
        let mut handles = Vec::new();
        for t in 0..8 {
            let bus = Arc::clone(&bus);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    bus.publish("load", format!("agent-{t}"), json!({ "i": i }));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let all = bus.query(&MessageQuery::default());
        assert_eq!(all.len(), 400);
        for (i, m) in all.iter().enumerate() {
            assert_eq!(m.seq, i as u64 + 1, "ledger must be gap-free");
        }
    }

    #[test]
    fn test_query_by_topic_and_since() {
        let bus = MessageBus::new("c1");
        bus.publish("a", "x", json!({}));
        bus.publish("b", "x", json!({}));
        bus.publish("a", "y", json!({}));

        let only_a = bus.query(&MessageQuery {
            topic: Some("a".into()),
            ..Default::default()
        });
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[0].seq, 1);
        assert_eq!(only_a[1].seq, 3);

        let late = bus.query(&MessageQuery {
            topic: Some("a".into()),
            since_seq: Some(1),
            ..Default::default()
        });
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].publisher, "y");
    }

    #[test]
    fn test_query_by_publisher() {
        let bus = MessageBus::new("c1");
        bus.publish("t", "worker", json!({}));
        bus.publish("t", "reviewer", json!({}));

        let from_worker = bus.query(&MessageQuery {
            publisher: Some("worker".into()),
            ..Default::default()
        });
        assert_eq!(from_worker.len(), 1);
        assert_eq!(from_worker[0].seq, 1);
    }

    #[test]
    fn test_subscribers_notified_in_order() {
        let bus = MessageBus::new("c1");
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(TopicFilter::all(), move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.publish("t", "x", json!({}));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_subscriber_filter_applies() {
        let bus = MessageBus::new("c1");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.subscribe(TopicFilter::new("TASK_COMPLETE"), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("ISSUE_OPENED", "x", json!({}));
        bus.publish("TASK_COMPLETE", "x", json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = MessageBus::new("c1");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = bus.subscribe(TopicFilter::all(), move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("t", "x", json!({}));
        bus.unsubscribe(id);
        bus.publish("t", "x", json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_publish_reentrantly() {
        let bus = Arc::new(MessageBus::new("c1"));
        let bus_clone = Arc::clone(&bus);
        bus.subscribe(TopicFilter::new("ping"), move |m| {
            bus_clone.publish("pong", "responder", m.payload.clone());
        });

        bus.publish("ping", "x", json!({ "n": 1 }));

        let pongs = bus.query(&MessageQuery {
            topic: Some("pong".into()),
            ..Default::default()
        });
        assert_eq!(pongs.len(), 1);
        assert_eq!(pongs[0].seq, 2);
    }

    #[test]
    fn test_mirror_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let bus = MessageBus::new("c1").with_mirror(&path);

        bus.publish("a", "x", json!({ "k": "v" }));
        bus.publish("b", "y", json!(null));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let m: Message = serde_json::from_str(line).unwrap();
            assert_eq!(m.cluster_id, "c1");
        }
    }
}
