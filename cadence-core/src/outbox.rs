//! Locally authored mutations waiting for the next flush to the sequencer.

use crate::mutation::{Mutation, MutationPayload};

/// A flushed batch, stamped with the client-local version that acks will
/// carry back.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundBatch {
    pub version: u64,
    pub mutations: Vec<Mutation>,
}

impl OutboundBatch {
    /// Serialize every mutation to its JSON wire string.
    pub fn encode_ops(&self) -> Result<Vec<String>, serde_json::Error> {
        self.mutations.iter().map(Mutation::encode).collect()
    }
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: Vec<Mutation>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a mutation. An object patch squashes into a still-queued patch
    /// for the same target; the merged patch moves to the back.
    pub fn push(&mut self, mutation: Mutation) {
        if let MutationPayload::Object(_) = mutation.payload {
            let queued = self.pending.iter().position(|m| {
                m.target_id == mutation.target_id && matches!(m.payload, MutationPayload::Object(_))
            });
            if let Some(position) = queued {
                let mut earlier = self.pending.remove(position);
                if let (MutationPayload::Object(base), MutationPayload::Object(later)) =
                    (&mut earlier.payload, mutation.payload)
                {
                    base.absorb_later(later);
                }
                self.pending.push(earlier);
                return;
            }
        }
        self.pending.push(mutation);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
