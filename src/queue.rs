// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric queue
//!
//! FIFO buffer of [`MetricRecord`]s waiting to be flushed. The queue never
//! hands records out destructively: a flush takes a [`Batch`] snapshot and
//! only [`MetricQueue::acknowledge`] removes records, so a failed write
//! leaves them at the front in their original order.

use crate::metric::MetricRecord;
use std::collections::VecDeque;

/// Default maximum number of queued records
pub const DEFAULT_MAX_QUEUED: usize = 500;

#[derive(Debug, Clone)]
struct QueuedRecord {
    seq: u64,
    record: MetricRecord,
}

/// Snapshot of the queue taken by a flush
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<MetricRecord>,
    last_seq: Option<u64>,
}

impl Batch {
    /// Records in enqueue order
    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Ordered buffer of pending metric records
#[derive(Debug)]
pub struct MetricQueue {
    entries: VecDeque<QueuedRecord>,
    next_seq: u64,
    max_len: usize,
    evicted: u64,
}

impl MetricQueue {
    /// Create a queue with the default capacity
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_QUEUED)
    }

    /// Create a queue holding at most `max_len` records
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            max_len: max_len.max(1),
            evicted: 0,
        }
    }

    /// Append a record, evicting the oldest one when full
    ///
    /// Returns the evicted record, if any.
    pub fn push(&mut self, record: MetricRecord) -> Option<MetricRecord> {
        let evicted = if self.entries.len() >= self.max_len {
            self.evicted += 1;
            self.entries.pop_front().map(|e| e.record)
        } else {
            None
        };

        self.entries.push_back(QueuedRecord {
            seq: self.next_seq,
            record,
        });
        self.next_seq += 1;

        evicted
    }

    /// Take a snapshot of every queued record, without removing them
    pub fn snapshot(&self) -> Batch {
        Batch {
            records: self.entries.iter().map(|e| e.record.clone()).collect(),
            last_seq: self.entries.back().map(|e| e.seq),
        }
    }

    /// Remove the records of a batch that was sent successfully
    ///
    /// Records enqueued after the snapshot stay queued. Records of the batch
    /// that were evicted in the meantime are simply gone already.
    /// Returns the number of records removed.
    pub fn acknowledge(&mut self, batch: &Batch) -> usize {
        let Some(last_seq) = batch.last_seq else {
            return 0;
        };

        let mut removed = 0;
        while self.entries.front().is_some_and(|e| e.seq <= last_seq) {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    /// Number of pending records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of records held
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Total records evicted since creation
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Iterate over pending records in enqueue order
    pub fn iter(&self) -> impl Iterator<Item = &MetricRecord> {
        self.entries.iter().map(|e| &e.record)
    }
}

impl Default for MetricQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricContext, MetricObservation};
    use chrono::Utc;

    fn record(id: &str) -> MetricRecord {
        MetricRecord::from_observation(
            MetricObservation::new("LCP", 1200.0, id),
            MetricContext::new("/", "test"),
            Utc::now(),
        )
        .unwrap()
    }

    fn ids(queue: &MetricQueue) -> Vec<String> {
        queue.iter().map(|r| r.id().to_string()).collect()
    }

    #[test]
    fn test_push_preserves_order() {
        let mut queue = MetricQueue::new();
        queue.push(record("a"));
        queue.push(record("b"));
        queue.push(record("c"));

        assert_eq!(queue.len(), 3);
        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_does_not_remove() {
        let mut queue = MetricQueue::new();
        queue.push(record("a"));
        let batch = queue.snapshot();

        assert_eq!(batch.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_acknowledge_keeps_later_records() {
        let mut queue = MetricQueue::new();
        queue.push(record("a"));
        queue.push(record("b"));
        let batch = queue.snapshot();

        queue.push(record("c"));
        let removed = queue.acknowledge(&batch);

        assert_eq!(removed, 2);
        assert_eq!(ids(&queue), vec!["c"]);
    }

    #[test]
    fn test_unacknowledged_batch_stays_in_front() {
        let mut queue = MetricQueue::new();
        queue.push(record("a"));
        queue.push(record("b"));
        let _failed = queue.snapshot();
        queue.push(record("c"));

        assert_eq!(ids(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.snapshot().len(), 3);
    }

    #[test]
    fn test_eviction_oldest_first() {
        let mut queue = MetricQueue::with_max_len(2);
        queue.push(record("a"));
        queue.push(record("b"));
        let evicted = queue.push(record("c"));

        assert_eq!(evicted.map(|r| r.id().to_string()), Some("a".to_string()));
        assert_eq!(ids(&queue), vec!["b", "c"]);
        assert_eq!(queue.evicted(), 1);
    }

    #[test]
    fn test_acknowledge_after_eviction() {
        let mut queue = MetricQueue::with_max_len(2);
        queue.push(record("a"));
        queue.push(record("b"));
        let batch = queue.snapshot();

        // "a" is evicted while the batch is in flight
        queue.push(record("c"));
        let removed = queue.acknowledge(&batch);

        assert_eq!(removed, 1);
        assert_eq!(ids(&queue), vec!["c"]);
    }

    #[test]
    fn test_acknowledge_empty_batch() {
        let mut queue = MetricQueue::new();
        let batch = queue.snapshot();
        queue.push(record("a"));

        assert_eq!(queue.acknowledge(&batch), 0);
        assert_eq!(queue.len(), 1);
    }
}
