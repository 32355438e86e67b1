use realtime_proto::ClientFrame;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub filter: Value,
    /// Confirmed by the broker on the current connection.
    pub acknowledged: bool,
}

/// What the client wants delivered, kept apart from what the broker has
/// confirmed. The desired map is the source of truth for replay; the
/// acknowledged set is bookkeeping for the current connection only.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    desired: BTreeMap<String, Value>,
    acknowledged: BTreeSet<String>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites; returns the previous filter.
    pub fn insert(&mut self, id: String, filter: Value) -> Option<Value> {
        self.desired.insert(id, filter)
    }

    pub fn remove(&mut self, id: &str) -> Option<Value> {
        self.desired.remove(id)
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.desired
            .iter()
            .map(|(id, filter)| Subscription {
                id: id.clone(),
                filter: filter.clone(),
                acknowledged: self.acknowledged.contains(id),
            })
            .collect()
    }

    /// One `subscribe` per desired entry, in id order.
    pub fn replay_frames(&self) -> Vec<ClientFrame> {
        self.desired
            .iter()
            .map(|(id, filter)| ClientFrame::subscribe(id.clone(), filter.clone()))
            .collect()
    }

    pub fn mark_acknowledged(&mut self, id: &str) {
        if self.desired.contains_key(id) {
            self.acknowledged.insert(id.to_string());
        }
    }

    pub fn mark_released(&mut self, id: &str) {
        self.acknowledged.remove(id);
    }

    /// The connection went away; nothing is confirmed anymore.
    pub fn reset_acknowledged(&mut self) {
        self.acknowledged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_reflects_only_the_latest_intent() {
        let mut set = SubscriptionSet::new();
        set.insert("tables_changes".into(), json!({"schema": "public"}));
        set.insert("buckets".into(), json!({}));
        set.insert("functions".into(), json!({"name": "a"}));
        set.remove("buckets");
        set.insert("functions".into(), json!({"name": "b"}));

        assert_eq!(
            set.replay_frames(),
            vec![
                ClientFrame::subscribe("functions", json!({"name": "b"})),
                ClientFrame::subscribe("tables_changes", json!({"schema": "public"})),
            ]
        );
    }

    #[test]
    fn acknowledgements_are_per_connection() {
        let mut set = SubscriptionSet::new();
        set.insert("a".into(), Value::Null);
        set.insert("b".into(), Value::Null);
        set.mark_acknowledged("a");
        set.mark_acknowledged("ghost");
        let confirmed = |set: &SubscriptionSet| {
            set.snapshot()
                .into_iter()
                .map(|sub| (sub.id, sub.acknowledged))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            confirmed(&set),
            vec![("a".to_string(), true), ("b".to_string(), false)]
        );

        set.reset_acknowledged();
        assert_eq!(
            confirmed(&set),
            vec![("a".to_string(), false), ("b".to_string(), false)]
        );
    }
}
