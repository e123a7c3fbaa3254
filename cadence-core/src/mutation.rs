//! Mutation envelopes and the context every dispatch is tagged with.
//!
//! Wire shape (JSON):
//! ```text
//! { "targetId": "…", "payload": { "x": 5, "y": 3 } }                 object patch
//! { "targetId": "…", "payload": { "op": "add", "summary": {…} } }    list insert
//! { "targetId": "…", "payload": { "op": "remove", "id": "…" } }      list removal
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::structure::StructureId;
use crate::summary::Summary;

/// Where a mutation being applied came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationSource {
    /// Authored on this client (edits, undo and redo replays).
    Local,
    /// Sequenced edit from another client.
    Remote,
    /// The sequencer echoing one of our own batches back.
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationContext {
    pub source: MutationSource,
    /// Whether the mutation was authored by this client.
    pub own: bool,
    /// Local: the outbound batch version that will carry the edit.
    /// Ack/Remote: the version stamped on the sequenced batch.
    pub version: u64,
}

impl MutationContext {
    pub fn local(version: u64) -> Self {
        Self {
            source: MutationSource::Local,
            own: true,
            version,
        }
    }

    pub fn remote(version: u64) -> Self {
        Self {
            source: MutationSource::Remote,
            own: false,
            version,
        }
    }

    pub fn ack(version: u64) -> Self {
        Self {
            source: MutationSource::Ack,
            own: true,
            version,
        }
    }
}

/// Field → value patch addressed to a shared object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPatch(pub BTreeMap<String, Value>);

impl ObjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, value: Value) -> Self {
        let mut patch = Self::new();
        patch.insert(field, value);
        patch
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Fold a later patch into this one; fields of `later` overwrite.
    pub fn absorb_later(&mut self, later: ObjectPatch) {
        self.0.extend(later.0);
    }

    /// Fold a later *undo* patch into this one; fields already present keep
    /// their value so the result restores the earliest state.
    pub fn absorb_later_undo(&mut self, later: ObjectPatch) {
        for (field, value) in later.0 {
            self.0.entry(field).or_insert(value);
        }
    }
}

/// Structural edit addressed to a shared list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ListMutation {
    Add {
        summary: Summary,
        /// Position among tracked items; `None` appends.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    Remove { id: StructureId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationPayload {
    List(ListMutation),
    Object(ObjectPatch),
}

impl MutationPayload {
    pub fn as_object(&self) -> Option<&ObjectPatch> {
        match self {
            MutationPayload::Object(patch) => Some(patch),
            MutationPayload::List(_) => None,
        }
    }
}

impl From<ObjectPatch> for MutationPayload {
    fn from(patch: ObjectPatch) -> Self {
        MutationPayload::Object(patch)
    }
}

impl From<ListMutation> for MutationPayload {
    fn from(op: ListMutation) -> Self {
        MutationPayload::List(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub target_id: StructureId,
    pub payload: MutationPayload,
}

impl Mutation {
    pub fn new(target_id: StructureId, payload: impl Into<MutationPayload>) -> Self {
        Self {
            target_id,
            payload: payload.into(),
        }
    }

    /// Serialize to the JSON string carried in op batches.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(op: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(op)
    }
}
