//! Undo units: batches of inverse mutations produced by one user action.

use std::collections::HashSet;
use std::fmt;

use crate::mutation::MutationPayload;
use crate::structure::StructureId;

/// Non-structural side effect to run when a transaction is undone.
pub type UndoAction = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEntry {
    pub target_id: StructureId,
    pub undo: MutationPayload,
    pub merge_key: Option<String>,
}

impl TransactionEntry {
    pub fn new(target_id: StructureId, undo: MutationPayload) -> Self {
        Self {
            target_id,
            undo,
            merge_key: None,
        }
    }

    pub fn with_merge_key(mut self, key: impl Into<String>) -> Self {
        self.merge_key = Some(key.into());
        self
    }

    /// Fold a later entry's undo into this one so the result still restores
    /// the state before this entry.
    fn absorb_later(&mut self, later: MutationPayload) {
        if let (MutationPayload::Object(earliest), MutationPayload::Object(patch)) = (&mut self.undo, later) {
            earliest.absorb_later_undo(patch);
        }
    }
}

#[derive(Default)]
pub struct Transaction {
    entries: Vec<TransactionEntry>,
    undo_actions: Vec<UndoAction>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.undo_actions.is_empty()
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Stage an entry. An entry with a merge key collapses into an earlier
    /// entry with the same key and target; an object patch without a key
    /// collapses into the earlier unkeyed patch for the same target.
    pub fn add_entry(&mut self, entry: TransactionEntry) {
        let existing = match &entry.merge_key {
            Some(key) => self
                .entries
                .iter_mut()
                .find(|e| e.merge_key.as_ref() == Some(key) && e.target_id == entry.target_id),
            None if entry.undo.as_object().is_some() => self.entries.iter_mut().find(|e| {
                e.merge_key.is_none() && e.target_id == entry.target_id && e.undo.as_object().is_some()
            }),
            None => None,
        };
        match existing {
            Some(existing) => existing.absorb_later(entry.undo),
            None => self.entries.push(entry),
        }
    }

    /// Append without any coalescing.
    pub fn push_entry(&mut self, entry: TransactionEntry) {
        self.entries.push(entry);
    }

    pub fn add_undo_action(&mut self, action: UndoAction) {
        self.undo_actions.push(action);
    }

    /// Distinct targets in first-touched order.
    pub fn targets(&self) -> Vec<StructureId> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert(e.target_id.clone()))
            .map(|e| e.target_id.clone())
            .collect()
    }

    pub fn touches(&self, id: &StructureId) -> bool {
        self.entries.iter().any(|e| &e.target_id == id)
    }

    pub(crate) fn retain_targets(&mut self, keep: impl Fn(&StructureId) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keep(&e.target_id));
        before - self.entries.len()
    }

    pub(crate) fn into_parts(self) -> (Vec<TransactionEntry>, Vec<UndoAction>) {
        (self.entries, self.undo_actions)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("entries", &self.entries)
            .field("undo_actions", &self.undo_actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{ListMutation, ObjectPatch};
    use serde_json::json;

    fn undo(field: &str, value: i64) -> MutationPayload {
        MutationPayload::Object(ObjectPatch::single(field, json!(value)))
    }

    fn target(id: &str) -> StructureId {
        StructureId::from(id)
    }

    #[test]
    fn test_merge_key_keeps_first_undo() {
        let mut tx = Transaction::new();
        tx.add_entry(TransactionEntry::new(target("a"), undo("x", 0)).with_merge_key("drag"));
        tx.add_entry(TransactionEntry::new(target("a"), undo("x", 5)).with_merge_key("drag"));
        assert_eq!(tx.len(), 1);
        assert_eq!(tx.entries()[0].undo, undo("x", 0));
    }

    #[test]
    fn test_same_target_patches_coalesce() {
        let mut tx = Transaction::new();
        tx.add_entry(TransactionEntry::new(target("a"), undo("x", 0)));
        tx.add_entry(TransactionEntry::new(target("a"), undo("y", 1)));
        tx.add_entry(TransactionEntry::new(target("a"), undo("x", 3)));
        assert_eq!(tx.len(), 1);

        let patch = tx.entries()[0].undo.as_object().unwrap();
        assert_eq!(patch.get("x"), Some(&json!(0)));
        assert_eq!(patch.get("y"), Some(&json!(1)));
    }

    #[test]
    fn test_list_entries_never_coalesce() {
        let mut tx = Transaction::new();
        let remove = MutationPayload::List(ListMutation::Remove { id: target("b") });
        tx.add_entry(TransactionEntry::new(target("list"), remove.clone()));
        tx.add_entry(TransactionEntry::new(target("list"), remove));
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_different_keys_stay_separate() {
        let mut tx = Transaction::new();
        tx.add_entry(TransactionEntry::new(target("a"), undo("x", 0)).with_merge_key("one"));
        tx.add_entry(TransactionEntry::new(target("a"), undo("x", 1)).with_merge_key("two"));
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_targets_are_distinct() {
        let mut tx = Transaction::new();
        tx.push_entry(TransactionEntry::new(target("a"), undo("x", 0)));
        tx.push_entry(TransactionEntry::new(target("b"), undo("x", 0)));
        tx.push_entry(TransactionEntry::new(target("a"), undo("y", 0)));
        assert_eq!(tx.targets(), vec![target("a"), target("b")]);
    }

    #[test]
    fn test_undo_action_makes_transaction_non_empty() {
        let mut tx = Transaction::new();
        assert!(tx.is_empty());
        tx.add_undo_action(Box::new(|| {}));
        assert!(!tx.is_empty());
    }
}
