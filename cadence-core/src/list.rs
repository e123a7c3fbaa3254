//! Ordered collection of child structures, addressed by id.
//!
//! While detached the list owns its children. Once attached the children
//! live in the [`ObjectTable`] and the list keeps only their ids in order.
//! Untracked items never enter the table, summaries or the network.
//!
//! Two orders are tracked. The confirmed order holds only sequenced ops, so
//! every client agrees on it. The visible order is the confirmed order with
//! this client's unacknowledged adds and removes replayed on top; each ack
//! moves its op from the pending queue into the confirmed order.

use std::any::Any;
use std::collections::{HashMap, HashSet};

use crate::mutation::{ListMutation, MutationContext, MutationPayload, MutationSource};
use crate::structure::{ObjectTable, SharedStructure, StructureId};
use crate::summary::Summary;

/// A local structural edit still waiting for its sequenced echo.
#[derive(Debug, Clone, PartialEq)]
enum PendingOp {
    Add { id: StructureId, index: Option<usize> },
    Remove { id: StructureId },
}

impl PendingOp {
    fn matches(&self, op: &ListMutation) -> bool {
        match (self, op) {
            (PendingOp::Add { id, .. }, ListMutation::Add { summary, .. }) => id == summary.id(),
            (PendingOp::Remove { id }, ListMutation::Remove { id: other }) => id == other,
            _ => false,
        }
    }

    fn replay(&self, order: &mut Vec<StructureId>) {
        match self {
            PendingOp::Add { id, index } => {
                if !order.contains(id) {
                    let position = index.unwrap_or(order.len()).min(order.len());
                    order.insert(position, id.clone());
                }
            }
            PendingOp::Remove { id } => order.retain(|item| item != id),
        }
    }
}

pub struct SharedList {
    id: StructureId,
    order: Vec<StructureId>,
    confirmed: Vec<StructureId>,
    pending: Vec<PendingOp>,
    index: HashSet<StructureId>,
    detached: HashMap<StructureId, Box<dyn SharedStructure>>,
    untracked: Vec<Box<dyn SharedStructure>>,
}

impl Default for SharedList {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedList {
    pub fn new() -> Self {
        Self::with_id(StructureId::generate())
    }

    pub fn with_id(id: StructureId) -> Self {
        Self {
            id,
            order: Vec::new(),
            confirmed: Vec::new(),
            pending: Vec::new(),
            index: HashSet::new(),
            detached: HashMap::new(),
            untracked: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Tracked item ids in order.
    pub fn ids(&self) -> &[StructureId] {
        &self.order
    }

    /// Item ids in sequenced order, without this client's unacknowledged
    /// edits.
    pub fn confirmed_ids(&self) -> &[StructureId] {
        &self.confirmed
    }

    /// Whether a local add or remove is still awaiting its ack.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn contains(&self, id: &StructureId) -> bool {
        self.index.contains(id)
    }

    pub fn position(&self, id: &StructureId) -> Option<usize> {
        if !self.index.contains(id) {
            return None;
        }
        self.order.iter().position(|item| item == id)
    }

    /// Child owned by this list while it is detached.
    pub fn detached_item(&self, id: &StructureId) -> Option<&dyn SharedStructure> {
        self.detached.get(id).map(|item| item.as_ref())
    }

    /// Append to a detached list. Returns `false` for a duplicate id.
    pub fn add(&mut self, item: Box<dyn SharedStructure>) -> bool {
        self.insert(self.order.len(), item)
    }

    pub fn insert(&mut self, index: usize, item: Box<dyn SharedStructure>) -> bool {
        let id = item.id().clone();
        if !self.index.insert(id.clone()) {
            return false;
        }
        self.order.insert(index.min(self.order.len()), id.clone());
        self.confirmed = self.order.clone();
        self.detached.insert(id, item);
        true
    }

    /// Remove from a detached list. `None` when the id is absent.
    pub fn remove(&mut self, id: &StructureId) -> Option<Box<dyn SharedStructure>> {
        let item = self.detached.remove(id)?;
        self.forget(id);
        self.confirmed = self.order.clone();
        Some(item)
    }

    pub fn add_untracked(&mut self, item: Box<dyn SharedStructure>) -> bool {
        if self.index.contains(item.id()) || self.untracked.iter().any(|u| u.id() == item.id()) {
            return false;
        }
        self.untracked.push(item);
        true
    }

    pub fn remove_untracked(&mut self, id: &StructureId) -> Option<Box<dyn SharedStructure>> {
        let position = self.untracked.iter().position(|item| item.id() == id)?;
        Some(self.untracked.remove(position))
    }

    pub fn untracked_items(&self) -> impl Iterator<Item = &dyn SharedStructure> {
        self.untracked.iter().map(|item| item.as_ref())
    }

    fn forget(&mut self, id: &StructureId) -> Option<usize> {
        if !self.index.remove(id) {
            return None;
        }
        let position = self.order.iter().position(|item| item == id)?;
        self.order.remove(position);
        Some(position)
    }

    fn apply_add(
        &mut self,
        summary: &Summary,
        index: Option<usize>,
        table: &mut ObjectTable,
    ) -> Option<MutationPayload> {
        let id = summary.id().clone();
        if self.index.contains(&id) {
            log::trace!("{} already holds {id}, skipping add", self.id);
            return None;
        }
        if table.contains(&id) {
            log::warn!("Cannot add {id} to {}: attached elsewhere", self.id);
            return None;
        }
        if table.attach(summary.materialize()).is_err() {
            return None;
        }
        let position = index.unwrap_or(self.order.len()).min(self.order.len());
        self.order.insert(position, id.clone());
        self.index.insert(id.clone());
        self.pending.push(PendingOp::Add { id: id.clone(), index });
        Some(ListMutation::Remove { id }.into())
    }

    fn apply_remove(&mut self, id: &StructureId, table: &mut ObjectTable) -> Option<MutationPayload> {
        if !self.index.contains(id) {
            log::trace!("{} does not hold {id}, skipping remove", self.id);
            return None;
        }
        let summary = table.summary_of(id)?;
        let position = self.forget(id)?;
        table.detach(id);
        self.pending.push(PendingOp::Remove { id: id.clone() });
        Some(
            ListMutation::Add {
                summary,
                index: Some(position),
            }
            .into(),
        )
    }

    /// Apply a sequenced op to the confirmed order, retire the matching
    /// pending op when it is our own, then rebuild the visible order.
    fn apply_sequenced(
        &mut self,
        op: &ListMutation,
        acknowledged: bool,
        table: &mut ObjectTable,
    ) -> Option<MutationPayload> {
        if acknowledged {
            match self.pending.iter().position(|pending| pending.matches(op)) {
                Some(position) => {
                    self.pending.remove(position);
                }
                None => log::debug!("Ack on {} matches no pending edit", self.id),
            }
        }
        let inverse = match op {
            ListMutation::Add { summary, index } => {
                let id = summary.id();
                if self.confirmed.contains(id) {
                    log::trace!("{} already confirmed {id}, skipping add", self.id);
                    None
                } else if !self.index.contains(id) && table.contains(id) {
                    log::warn!("Cannot add {id} to {}: attached elsewhere", self.id);
                    None
                } else {
                    let position = index.unwrap_or(self.confirmed.len()).min(self.confirmed.len());
                    self.confirmed.insert(position, id.clone());
                    Some(ListMutation::Remove { id: id.clone() })
                }
            }
            ListMutation::Remove { id } => match self.confirmed.iter().position(|item| item == id) {
                Some(position) => {
                    self.confirmed.remove(position);
                    table.summary_of(id).map(|summary| ListMutation::Add {
                        summary,
                        index: self.position(id),
                    })
                }
                None => {
                    log::trace!("{} never confirmed {id}, skipping remove", self.id);
                    None
                }
            },
        };
        let incoming = match op {
            ListMutation::Add { summary, .. } => Some(summary),
            ListMutation::Remove { .. } => None,
        };
        let reordered = self.rebuild(incoming, table);
        match inverse {
            Some(inverse) if reordered => Some(inverse.into()),
            _ => None,
        }
    }

    /// Recompute the visible order from the confirmed order and the pending
    /// queue, attaching or detaching items that enter or leave it. Returns
    /// whether the visible order changed.
    fn rebuild(&mut self, incoming: Option<&Summary>, table: &mut ObjectTable) -> bool {
        let mut order = self.confirmed.clone();
        for op in &self.pending {
            op.replay(&mut order);
        }
        for id in &self.order {
            if !order.contains(id) {
                table.detach(id);
                self.index.remove(id);
            }
        }
        let list_id = &self.id;
        let index = &mut self.index;
        order.retain(|id| {
            if index.contains(id) {
                return true;
            }
            match incoming.filter(|summary| summary.id() == id) {
                Some(summary) if table.attach(summary.materialize()).is_ok() => {
                    index.insert(id.clone());
                    true
                }
                _ => {
                    log::warn!("No attachable structure for {id} in {list_id}");
                    false
                }
            }
        });
        let changed = order != self.order;
        self.order = order;
        changed
    }
}

impl SharedStructure for SharedList {
    fn id(&self) -> &StructureId {
        &self.id
    }

    fn handle(
        &mut self,
        payload: &MutationPayload,
        ctx: &MutationContext,
        table: &mut ObjectTable,
    ) -> Option<MutationPayload> {
        let MutationPayload::List(op) = payload else {
            log::warn!("Object patch addressed to list {}", self.id);
            return None;
        };
        match (ctx.source, op) {
            (MutationSource::Local, ListMutation::Add { summary, index }) => {
                self.apply_add(summary, *index, table)
            }
            (MutationSource::Local, ListMutation::Remove { id }) => self.apply_remove(id, table),
            (MutationSource::Remote, op) => self.apply_sequenced(op, false, table),
            (MutationSource::Ack, op) => self.apply_sequenced(op, true, table),
        }
    }

    fn summary(&self, table: &ObjectTable) -> Summary {
        let items = self
            .order
            .iter()
            .filter_map(|id| match self.detached.get(id) {
                Some(item) => Some(item.summary(table)),
                None => table.summary_of(id),
            })
            .collect();
        Summary::List {
            id: self.id.clone(),
            items,
        }
    }

    fn children(&self) -> Vec<StructureId> {
        self.order.clone()
    }

    fn take_detached_children(&mut self) -> Vec<Box<dyn SharedStructure>> {
        let detached = &mut self.detached;
        self.order.iter().filter_map(|id| detached.remove(id)).collect()
    }

    fn restore_detached_child(&mut self, child: Box<dyn SharedStructure>) {
        self.detached.insert(child.id().clone(), child);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
