//! Per-document update coordinator.
//!
//! ```text
//!  local edit ──► handle(Local) ──► submit ──┬──► current transaction (undo)
//!                                            └──► outbound queue ──► take_outbound()
//!
//!  sequenced op ──► process(Remote | Ack) ──► target.handle()
//! ```
//!
//! Transaction lifecycle:
//! `Empty → Accumulating (submit) → Committed (commit) | Discarded
//! (undo_current_transaction) → Empty`. Committed transactions only move
//! between the undo and redo stacks.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreError;
use crate::list::SharedList;
use crate::mutation::{ListMutation, Mutation, MutationContext, MutationPayload, MutationSource, ObjectPatch};
use crate::object::{PropertyKey, SharedObject};
use crate::outbox::{OutboundBatch, OutboundQueue};
use crate::structure::{ObjectTable, SharedStructure, StructureId};
use crate::summary::Summary;
use crate::transaction::{Transaction, TransactionEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A locally authored mutation was queued for the sequencer.
    MutationSubmitted { target_id: StructureId },
    /// A sequenced edit from another client reached its target.
    RemoteApplied { target_id: StructureId },
    BeforeUndo,
    AfterUndo,
    BeforeRedo,
    AfterRedo,
    HistoryChanged { can_undo: bool, can_redo: bool },
}

pub type Observer = Box<dyn FnMut(&CoordinatorEvent) + Send>;

pub struct UpdateCoordinator {
    table: ObjectTable,
    root: StructureId,
    current: Transaction,
    undo_stack: Vec<Transaction>,
    redo_stack: Vec<Transaction>,
    outbox: OutboundQueue,
    /// Version the next outbound batch will carry.
    version: u64,
    observers: Vec<Observer>,
    can_undo: bool,
    can_redo: bool,
}

impl UpdateCoordinator {
    pub fn new(root: Box<dyn SharedStructure>) -> Self {
        let root_id = root.id().clone();
        let mut table = ObjectTable::new();
        table.attach(root).ok();
        Self {
            table,
            root: root_id,
            current: Transaction::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            outbox: OutboundQueue::new(),
            version: 1,
            observers: Vec::new(),
            can_undo: false,
            can_redo: false,
        }
    }

    pub fn from_summary(summary: &Summary) -> Self {
        Self::new(summary.materialize())
    }

    pub fn root_id(&self) -> &StructureId {
        &self.root
    }

    pub fn table(&self) -> &ObjectTable {
        &self.table
    }

    pub fn is_attached(&self, id: &StructureId) -> bool {
        self.table.contains(id)
    }

    pub fn get<T: SharedStructure>(&self, id: &StructureId) -> Option<&T> {
        self.table.get_as(id)
    }

    pub fn object(&self, id: &StructureId) -> Result<&SharedObject, CoreError> {
        self.typed(id, "shared object")
    }

    pub fn list(&self, id: &StructureId) -> Result<&SharedList, CoreError> {
        self.typed(id, "shared list")
    }

    fn typed<T: SharedStructure>(&self, id: &StructureId, expected: &'static str) -> Result<&T, CoreError> {
        let structure = self
            .table
            .get(id)
            .ok_or_else(|| CoreError::UnknownTarget(id.clone()))?;
        structure
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| CoreError::WrongKind {
                id: id.clone(),
                expected,
            })
    }

    pub fn value<T: DeserializeOwned>(&self, id: &StructureId, key: &PropertyKey<T>) -> Result<T, CoreError> {
        self.object(id)?.get(key)
    }

    pub fn summary(&self) -> Summary {
        self.table
            .summary_of(&self.root)
            .unwrap_or_else(|| Summary::empty_list(self.root.clone()))
    }

    /// Replace the whole document. History and queued outbound mutations
    /// are discarded.
    pub fn restore(&mut self, summary: &Summary) {
        let mut table = ObjectTable::new();
        table.attach(summary.materialize()).ok();
        self.table = table;
        self.root = summary.id().clone();
        self.current = Transaction::new();
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.outbox.clear();
        self.update_history();
    }

    /// Attach a structure (and its subtree) next to the root.
    pub fn attach(&mut self, structure: Box<dyn SharedStructure>) -> bool {
        match self.table.attach(structure) {
            Ok(()) => true,
            Err(rejected) => {
                log::warn!("Structure {} is already attached", rejected.id());
                false
            }
        }
    }

    /// Detach a top-level structure and its subtree. Entries of the current
    /// transaction that target the subtree are dropped. List children are
    /// removed with [`remove_item`](Self::remove_item) instead.
    pub fn detach(&mut self, id: &StructureId) -> Option<Box<dyn SharedStructure>> {
        if *id == self.root {
            log::warn!("Refusing to detach the document root");
            return None;
        }
        let owned_by_list = self
            .table
            .iter()
            .filter_map(|s| s.as_any().downcast_ref::<SharedList>())
            .any(|list| list.contains(id));
        if owned_by_list {
            log::warn!("Refusing to detach {id}: it is a list item");
            return None;
        }
        let structure = self.table.detach(id)?;
        let detached = structure.summary(&self.table).ids();
        let purged = self.current.retain_targets(|target| !detached.contains(target));
        if purged > 0 {
            log::debug!("Dropped {purged} staged entries for detached {id}");
        }
        Some(structure)
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&CoordinatorEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn emit(&mut self, event: CoordinatorEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }

    // ── local edits ────────────────────────────────────────────────

    pub fn set<T: Serialize>(&mut self, target: &StructureId, key: &PropertyKey<T>, value: T) -> Result<bool, CoreError> {
        let patch = ObjectPatch::single(key.name(), serde_json::to_value(value)?);
        self.update(target, patch, None)
    }

    /// Like [`set`](Self::set), collapsing into the staged entry with the
    /// same merge key (continuous drags, slider scrubbing).
    pub fn set_merged<T: Serialize>(
        &mut self,
        target: &StructureId,
        key: &PropertyKey<T>,
        value: T,
        merge_key: &str,
    ) -> Result<bool, CoreError> {
        let patch = ObjectPatch::single(key.name(), serde_json::to_value(value)?);
        self.update(target, patch, Some(merge_key))
    }

    /// Write several fields of one object as a single mutation.
    pub fn update(&mut self, target: &StructureId, patch: ObjectPatch, merge_key: Option<&str>) -> Result<bool, CoreError> {
        let object = self.object(target)?;
        if let Some((name, _)) = patch.iter().find(|(name, _)| !object.has_property(name)) {
            return Err(CoreError::UnknownProperty {
                id: target.clone(),
                property: name.clone(),
            });
        }
        Ok(self.apply_local(target, patch.into(), merge_key.map(str::to_string)))
    }

    pub fn add_item(&mut self, list: &StructureId, item: Box<dyn SharedStructure>) -> Result<bool, CoreError> {
        self.insert_at(list, None, item)
    }

    pub fn insert_item(&mut self, list: &StructureId, index: usize, item: Box<dyn SharedStructure>) -> Result<bool, CoreError> {
        self.insert_at(list, Some(index), item)
    }

    fn insert_at(&mut self, list: &StructureId, index: Option<usize>, item: Box<dyn SharedStructure>) -> Result<bool, CoreError> {
        self.list(list)?;
        let summary = item.summary(&self.table);
        Ok(self.apply_local(list, ListMutation::Add { summary, index }.into(), None))
    }

    pub fn remove_item(&mut self, list: &StructureId, item: &StructureId) -> Result<bool, CoreError> {
        self.list(list)?;
        let op = ListMutation::Remove { id: item.clone() };
        Ok(self.apply_local(list, op.into(), None))
    }

    /// Add a preview item that never reaches the network or the history.
    pub fn add_untracked(&mut self, list: &StructureId, item: Box<dyn SharedStructure>) -> Result<bool, CoreError> {
        Ok(self.list_mut(list)?.add_untracked(item))
    }

    pub fn remove_untracked(
        &mut self,
        list: &StructureId,
        item: &StructureId,
    ) -> Result<Option<Box<dyn SharedStructure>>, CoreError> {
        Ok(self.list_mut(list)?.remove_untracked(item))
    }

    fn list_mut(&mut self, id: &StructureId) -> Result<&mut SharedList, CoreError> {
        self.list(id)?;
        self.table
            .get_mut_as::<SharedList>(id)
            .ok_or_else(|| CoreError::UnknownTarget(id.clone()))
    }

    fn apply_local(&mut self, target: &StructureId, payload: MutationPayload, merge_key: Option<String>) -> bool {
        let ctx = MutationContext::local(self.version);
        match self.table.apply(target, &payload, &ctx) {
            Some(undo) => {
                self.submit(target.clone(), payload, Some(undo), merge_key);
                true
            }
            None => false,
        }
    }

    /// Record a mutation that has already been applied locally: queue it
    /// for the sequencer and stage its inverse in the current transaction.
    pub fn submit(
        &mut self,
        target: StructureId,
        mutation: MutationPayload,
        undo: Option<MutationPayload>,
        merge_key: Option<String>,
    ) {
        self.outbox.push(Mutation::new(target.clone(), mutation));
        if let Some(undo) = undo {
            self.current.add_entry(TransactionEntry {
                target_id: target.clone(),
                undo,
                merge_key,
            });
        }
        self.emit(CoordinatorEvent::MutationSubmitted { target_id: target });
    }

    // ── history ────────────────────────────────────────────────────

    pub fn current_transaction(&self) -> &Transaction {
        &self.current
    }

    pub fn add_undo_action(&mut self, action: impl FnOnce() + Send + 'static) {
        self.current.add_undo_action(Box::new(action));
    }

    pub fn commit(&mut self) -> bool {
        if self.current.is_empty() {
            return false;
        }
        let transaction = std::mem::take(&mut self.current);
        for target in transaction.targets() {
            self.table.notify_commit(&target, &transaction);
        }
        self.redo_stack.clear();
        self.undo_stack.push(transaction);
        self.update_history();
        true
    }

    /// Revert and discard the uncommitted transaction.
    pub fn undo_current_transaction(&mut self) -> bool {
        if self.current.is_empty() {
            return false;
        }
        self.emit(CoordinatorEvent::BeforeUndo);
        let (entries, actions) = std::mem::take(&mut self.current).into_parts();
        self.replay(entries);
        for action in actions {
            action();
        }
        self.update_history();
        self.emit(CoordinatorEvent::AfterUndo);
        true
    }

    pub fn undo(&mut self) -> bool {
        if !self.current.is_empty() {
            return self.undo_current_transaction();
        }
        let Some(transaction) = self.undo_stack.pop() else {
            return false;
        };
        self.emit(CoordinatorEvent::BeforeUndo);
        let (entries, actions) = transaction.into_parts();
        let redo = self.replay(entries);
        for action in actions {
            action();
        }
        if !redo.is_empty() {
            self.redo_stack.push(redo);
        }
        self.update_history();
        self.emit(CoordinatorEvent::AfterUndo);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(transaction) = self.redo_stack.pop() else {
            return false;
        };
        self.emit(CoordinatorEvent::BeforeRedo);
        let (entries, _) = transaction.into_parts();
        let undo = self.replay(entries);
        if !undo.is_empty() {
            self.undo_stack.push(undo);
        }
        self.update_history();
        self.emit(CoordinatorEvent::AfterRedo);
        true
    }

    pub fn can_undo(&self) -> bool {
        self.can_undo
    }

    pub fn can_redo(&self) -> bool {
        self.can_redo
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Apply inverse entries in reverse order as local edits. Returns the
    /// transaction that reverts the replay.
    fn replay(&mut self, entries: Vec<TransactionEntry>) -> Transaction {
        let ctx = MutationContext::local(self.version);
        let mut inverse = Transaction::new();
        for entry in entries.into_iter().rev() {
            let Some(reverted) = self.table.apply(&entry.target_id, &entry.undo, &ctx) else {
                continue;
            };
            self.outbox.push(Mutation::new(entry.target_id.clone(), entry.undo));
            self.emit(CoordinatorEvent::MutationSubmitted {
                target_id: entry.target_id.clone(),
            });
            inverse.push_entry(TransactionEntry::new(entry.target_id, reverted));
        }
        inverse
    }

    fn update_history(&mut self) {
        let can_undo = !self.undo_stack.is_empty();
        let can_redo = !self.redo_stack.is_empty();
        if (can_undo, can_redo) != (self.can_undo, self.can_redo) {
            self.can_undo = can_undo;
            self.can_redo = can_redo;
            self.emit(CoordinatorEvent::HistoryChanged { can_undo, can_redo });
        }
    }

    // ── sequenced stream ───────────────────────────────────────────

    /// Route a sequenced mutation to its target. Returns `false` when the
    /// target is not attached here, which is not an error.
    pub fn process(&mut self, mutation: &Mutation, ctx: MutationContext) -> bool {
        if !self.table.contains(&mutation.target_id) {
            log::debug!("No attached target {} for sequenced op", mutation.target_id);
            return false;
        }
        let changed = self.table.apply(&mutation.target_id, &mutation.payload, &ctx).is_some();
        if changed && ctx.source == MutationSource::Remote {
            self.emit(CoordinatorEvent::RemoteApplied {
                target_id: mutation.target_id.clone(),
            });
        }
        true
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbox.len()
    }

    /// Drain queued mutations into a batch stamped with the current
    /// version, then advance the version.
    pub fn take_outbound(&mut self) -> Option<OutboundBatch> {
        if self.outbox.is_empty() {
            return None;
        }
        let batch = OutboundBatch {
            version: self.version,
            mutations: self.outbox.drain(),
        };
        self.version += 1;
        Some(batch)
    }

    /// Whether any local edit is queued or still awaiting its ack.
    pub fn has_unacknowledged(&self) -> bool {
        !self.outbox.is_empty()
            || self.table.iter().any(|s| {
                let any = s.as_any();
                any.downcast_ref::<SharedObject>().is_some_and(SharedObject::has_pending)
                    || any.downcast_ref::<SharedList>().is_some_and(SharedList::has_pending)
            })
    }
}
