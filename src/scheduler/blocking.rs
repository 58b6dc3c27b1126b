//! Scratch structures of a single stuffing pass.

use std::collections::HashSet;
use std::sync::Mutex;

use super::lock;
use crate::models::JobId;

/// A document a stuffing pass saw but could not admit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockedDocument {
    pub job_id: JobId,
    pub doc_hash: String,
}

/// De-duplicating pool of documents deferred by throttling.
///
/// The next reprioritization pass drains this pool first.
#[derive(Debug, Default)]
pub struct BlockingDocuments {
    documents: Mutex<(Vec<BlockedDocument>, HashSet<BlockedDocument>)>,
}

impl BlockingDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document; returns `false` if it was already pooled.
    pub fn add(&self, job_id: JobId, doc_hash: &str) -> bool {
        let document = BlockedDocument {
            job_id,
            doc_hash: doc_hash.to_string(),
        };
        let mut guard = lock(&self.documents);
        let (order, seen) = &mut *guard;
        if seen.insert(document.clone()) {
            order.push(document);
            true
        } else {
            false
        }
    }

    /// Take every pooled document in insertion order.
    pub fn drain(&self) -> Vec<BlockedDocument> {
        let mut guard = lock(&self.documents);
        let (order, seen) = &mut *guard;
        seen.clear();
        std::mem::take(order)
    }

    pub fn len(&self) -> usize {
        lock(&self.documents).0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Priorities observed during one queuing scan.
#[derive(Debug, Default, Clone)]
pub struct DepthStatistics {
    priorities: Vec<f64>,
}

impl DepthStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, priority: f64) {
        self.priorities.push(priority);
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    /// Hand the observations to a consumer and forget them.
    pub fn take(&mut self) -> Vec<f64> {
        std::mem::take(&mut self.priorities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_documents_dedup() {
        let pool = BlockingDocuments::new();
        assert!(pool.add(1, "a"));
        assert!(!pool.add(1, "a"));
        assert!(pool.add(2, "a"));
        assert_eq!(pool.len(), 2);

        let drained = pool.drain();
        assert_eq!(drained[0].job_id, 1);
        assert_eq!(drained[1].job_id, 2);
        assert!(pool.is_empty());

        // Drained documents can be pooled again.
        assert!(pool.add(1, "a"));
    }

    #[test]
    fn test_depth_statistics_consumed_once() {
        let mut stats = DepthStatistics::new();
        stats.add(1.5);
        stats.add(0.5);
        assert_eq!(stats.take(), vec![1.5, 0.5]);
        assert!(stats.is_empty());
        assert!(stats.take().is_empty());
    }
}
