//! Shared in-memory image of queue and topic state.
//!
//! Both backends cache the same structure: per-queue header lists in
//! priority order and a single current entry per topic. The cache is a
//! convenience snapshot; durable storage stays the source of truth.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::broker::headers::{Headers, HeaderValue, H_REDELIVERY};

use super::DLQ;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreIndex {
    pub queues: HashMap<String, Vec<Headers>>,
    pub topics: HashMap<String, Headers>,
}

impl StoreIndex {
    /// Insert before the first entry with strictly lower priority, so
    /// lists stay priority-descending with insertion-order ties.
    pub fn push_queue(&mut self, queue: &str, headers: Headers) {
        let list = self.queues.entry(queue.to_string()).or_default();
        let priority = headers.priority();
        let pos = list
            .iter()
            .position(|h| h.priority() < priority)
            .unwrap_or(list.len());
        list.insert(pos, headers);
    }

    pub fn remove_queue(&mut self, queue: &str, id: &str) -> Option<Headers> {
        let list = self.queues.get_mut(queue)?;
        let pos = list.iter().position(|h| h.id() == Some(id))?;
        let headers = list.remove(pos);
        if list.is_empty() {
            self.queues.remove(queue);
        }
        Some(headers)
    }

    pub fn move_to_dlq(&mut self, queue: &str, id: &str) -> bool {
        match self.remove_queue(queue, id) {
            Some(headers) => {
                self.push_queue(DLQ, headers);
                true
            }
            None => false,
        }
    }

    pub fn bump_redelivery(&mut self, queue: &str, id: &str) -> bool {
        let Some(list) = self.queues.get_mut(queue) else {
            return false;
        };
        match list.iter_mut().find(|h| h.id() == Some(id)) {
            Some(headers) => {
                let next = headers.redelivery() + 1;
                headers.insert(H_REDELIVERY, HeaderValue::Int(next));
                true
            }
            None => false,
        }
    }

    /// Replace a topic slot, returning the previous entry.
    pub fn set_topic(&mut self, topic: &str, headers: Headers) -> Option<Headers> {
        self.topics.insert(topic.to_string(), headers)
    }

    /// Remove a topic slot iff it still holds the given id.
    pub fn take_topic_if(&mut self, topic: &str, id: &str) -> Option<Headers> {
        if self.topics.get(topic)?.id() == Some(id) {
            self.topics.remove(topic)
        } else {
            None
        }
    }

    pub fn headers_of(&self, queue: &str) -> Vec<Headers> {
        self.queues.get(queue).cloned().unwrap_or_default()
    }

    pub fn find<'a>(
        &'a self,
        queue: &str,
        predicate: &dyn Fn(&Headers) -> bool,
    ) -> Option<&'a Headers> {
        self.queues.get(queue)?.iter().find(|h| predicate(h))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::headers::{H_ID, H_PRIORITY};

    fn entry(id: &str, priority: i64) -> Headers {
        let mut headers = Headers::new();
        headers.insert(H_ID, id);
        headers.insert(H_PRIORITY, priority);
        headers
    }

    fn ids(index: &StoreIndex, queue: &str) -> Vec<String> {
        index
            .headers_of(queue)
            .iter()
            .filter_map(|h| h.id().map(str::to_string))
            .collect()
    }

    #[test]
    fn insertion_keeps_priority_descending_with_fifo_ties() {
        let mut index = StoreIndex::default();
        index.push_queue("jobs", entry("a", 1));
        index.push_queue("jobs", entry("b", 3));
        index.push_queue("jobs", entry("c", 2));
        index.push_queue("jobs", entry("d", 2));

        assert_eq!(ids(&index, "jobs"), vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn remove_drops_empty_queues() {
        let mut index = StoreIndex::default();
        index.push_queue("jobs", entry("a", 0));
        assert!(index.remove_queue("jobs", "a").is_some());
        assert!(index.queues.get("jobs").is_none());
        assert!(index.remove_queue("jobs", "a").is_none());
    }

    #[test]
    fn dlq_move_preserves_headers() {
        let mut index = StoreIndex::default();
        index.push_queue("jobs", entry("a", 7));
        assert!(index.move_to_dlq("jobs", "a"));
        let dlq = index.headers_of(DLQ);
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].priority(), 7);
    }

    #[test]
    fn requeue_increments_redelivery() {
        let mut index = StoreIndex::default();
        index.push_queue("jobs", entry("a", 0));
        assert!(index.bump_redelivery("jobs", "a"));
        assert!(index.bump_redelivery("jobs", "a"));
        assert_eq!(index.headers_of("jobs")[0].redelivery(), 2);
    }

    #[test]
    fn topic_take_checks_current_id() {
        let mut index = StoreIndex::default();
        index.set_topic("ticker", entry("m1", 0));
        assert!(index.take_topic_if("ticker", "m2").is_none());
        assert!(index.take_topic_if("ticker", "m1").is_some());
        assert!(index.topics.is_empty());
    }
}
