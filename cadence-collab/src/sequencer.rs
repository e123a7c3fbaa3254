//! In-memory ordering authority for one document.
//!
//! Keeps the latest summary and every batch sequenced after it. A summary
//! supplied by a client replaces the stored one and truncates the log.

use cadence_core::Summary;

use crate::protocol::{ClientId, DocumentState, SequencedOpBatch, SubmitOps};

/// Total order of one document: the latest summary plus every batch
/// sequenced after it.
pub struct OrderingService {
    summary: Summary,
    summary_sequence: u64,
    log: Vec<SequencedOpBatch>,
    last_sequence: u64,
    mutations_since_summary: usize,
}

impl OrderingService {
    /// Start a log from `initial` at sequence 0.
    pub fn new(initial: Summary) -> Self {
        Self {
            summary: initial,
            summary_sequence: 0,
            log: Vec::new(),
            last_sequence: 0,
            mutations_since_summary: 0,
        }
    }

    /// Assign the next sequence number to a submitted batch.
    pub fn append_ops(&mut self, client_id: ClientId, submit: SubmitOps) -> SequencedOpBatch {
        self.last_sequence += 1;
        self.mutations_since_summary += submit.ops.len();
        let batch = SequencedOpBatch {
            client_id,
            sequence_number: self.last_sequence.to_string(),
            version: submit.version,
            ops: submit.ops,
        };
        self.log.push(batch.clone());
        batch
    }

    /// Snapshot handed to a joining client.
    pub fn messages_since_last_summary(&self) -> DocumentState {
        DocumentState {
            summary: self.summary.clone(),
            ops: self.log.clone(),
            sequence_number: self.summary_sequence,
        }
    }

    /// Store a summary taken at `sequence_number`. Summaries older than the
    /// stored one or ahead of the log are rejected.
    pub fn append_summary(&mut self, sequence_number: u64, summary: Summary) -> bool {
        if sequence_number < self.summary_sequence || sequence_number > self.last_sequence {
            log::warn!(
                "Rejecting summary at {sequence_number} (stored {}, last {})",
                self.summary_sequence,
                self.last_sequence
            );
            return false;
        }
        self.summary = summary;
        self.summary_sequence = sequence_number;
        self.log
            .retain(|batch| batch.sequence().is_some_and(|seq| seq > sequence_number));
        self.mutations_since_summary = self.log.iter().map(|batch| batch.ops.len()).sum();
        log::info!(
            "Stored summary at sequence {sequence_number}, {} batches remain",
            self.log.len()
        );
        true
    }

    /// Ops sequenced since the stored summary.
    pub fn mutation_count(&self) -> usize {
        self.mutations_since_summary
    }

    /// Whether more than `threshold` ops have piled up since the summary.
    pub fn needs_summary(&self, threshold: usize) -> bool {
        self.mutations_since_summary > threshold
    }

    /// Sequence number of the newest batch.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Sequence number the stored summary was taken at.
    pub fn summary_sequence(&self) -> u64 {
        self.summary_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(version: u64, ops: usize) -> SubmitOps {
        SubmitOps {
            version,
            ops: (0..ops).map(|i| format!(r#"{{"targetId":"a","payload":{{"x":{i}}}}}"#)).collect(),
        }
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut service = OrderingService::new(Summary::empty_list("root"));
        let first = service.append_ops(1, submit(1, 1));
        let second = service.append_ops(2, submit(1, 2));

        assert_eq!(first.sequence(), Some(1));
        assert_eq!(second.sequence(), Some(2));
        assert_eq!(second.client_id, 2);
        assert_eq!(service.mutation_count(), 3);
        assert_eq!(service.messages_since_last_summary().ops, vec![first, second]);
    }

    #[test]
    fn test_summary_truncates_log() {
        let mut service = OrderingService::new(Summary::empty_list("root"));
        for version in 1..=4 {
            service.append_ops(1, submit(version, 1));
        }
        assert!(service.needs_summary(3));

        assert!(service.append_summary(3, Summary::empty_list("root")));
        let state = service.messages_since_last_summary();
        assert_eq!(state.sequence_number, 3);
        assert_eq!(state.ops.len(), 1);
        assert_eq!(state.ops[0].sequence(), Some(4));
        assert_eq!(service.mutation_count(), 1);
        assert!(!service.needs_summary(3));
    }

    #[test]
    fn test_rejects_stale_or_future_summary() {
        let mut service = OrderingService::new(Summary::empty_list("root"));
        service.append_ops(1, submit(1, 1));
        service.append_ops(1, submit(2, 1));
        assert!(service.append_summary(2, Summary::empty_list("root")));

        assert!(!service.append_summary(1, Summary::empty_list("stale")));
        assert!(!service.append_summary(9, Summary::empty_list("future")));
        assert_eq!(service.summary_sequence(), 2);
        assert_eq!(service.last_sequence(), 2);
    }
}
