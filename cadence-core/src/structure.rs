//! Identity-bearing nodes of the document graph and the table that owns
//! them once attached.
//!
//! ```text
//!  UpdateCoordinator
//!        │ owns
//!        ▼
//!  ObjectTable  id → Box<dyn SharedStructure>
//!        │
//!        ├── "root"  SharedList   order: [a, b]   (ids, not owners)
//!        ├── "a"     SharedObject
//!        └── "b"     SharedObject
//! ```
//!
//! A structure that is not attached owns its children directly. Attaching
//! moves every child into the table; detaching moves them back, so a
//! detached subtree is always self-contained.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mutation::{MutationContext, MutationPayload};
use crate::summary::Summary;
use crate::transaction::Transaction;

/// Globally unique structure id. Preserved across summary and restore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructureId(String);

impl StructureId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StructureId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StructureId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

pub trait SharedStructure: Any + Send {
    fn id(&self) -> &StructureId;

    /// Absorb a mutation. Returns the inverse payload, or `None` when
    /// nothing changed.
    fn handle(
        &mut self,
        payload: &MutationPayload,
        ctx: &MutationContext,
        table: &mut ObjectTable,
    ) -> Option<MutationPayload>;

    fn summary(&self, table: &ObjectTable) -> Summary;

    /// Ids of tracked child structures, in order.
    fn children(&self) -> Vec<StructureId> {
        Vec::new()
    }

    /// Hand over directly owned children when this structure is attached.
    fn take_detached_children(&mut self) -> Vec<Box<dyn SharedStructure>> {
        Vec::new()
    }

    /// Take back ownership of a child while this structure is detached.
    fn restore_detached_child(&mut self, _child: Box<dyn SharedStructure>) {}

    fn on_transaction_commit(&mut self, _transaction: &Transaction) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Arena of attached structures, keyed by id. The sole authority for
/// mutation routing.
#[derive(Default)]
pub struct ObjectTable {
    objects: HashMap<StructureId, Box<dyn SharedStructure>>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: &StructureId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &StructureId> {
        self.objects.keys()
    }

    pub fn get(&self, id: &StructureId) -> Option<&dyn SharedStructure> {
        self.objects.get(id).map(|s| s.as_ref())
    }

    pub fn get_as<T: SharedStructure>(&self, id: &StructureId) -> Option<&T> {
        self.get(id)?.as_any().downcast_ref::<T>()
    }

    pub(crate) fn get_mut_as<T: SharedStructure>(&mut self, id: &StructureId) -> Option<&mut T> {
        self.objects.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn SharedStructure> {
        self.objects.values().map(|s| s.as_ref())
    }

    /// Attach a structure and, transitively, its children. An id that is
    /// already attached is left untouched and the structure is returned.
    pub fn attach(
        &mut self,
        mut structure: Box<dyn SharedStructure>,
    ) -> Result<(), Box<dyn SharedStructure>> {
        let id = structure.id().clone();
        if self.objects.contains_key(&id) {
            return Err(structure);
        }
        let children = structure.take_detached_children();
        self.objects.insert(id, structure);
        for child in children {
            if let Err(child) = self.attach(child) {
                log::warn!("Child {} already attached, dropping duplicate", child.id());
            }
        }
        Ok(())
    }

    /// Detach a structure and its subtree. The returned structure owns its
    /// children again.
    pub fn detach(&mut self, id: &StructureId) -> Option<Box<dyn SharedStructure>> {
        let mut structure = self.objects.remove(id)?;
        for child_id in structure.children() {
            if let Some(child) = self.detach(&child_id) {
                structure.restore_detached_child(child);
            }
        }
        Some(structure)
    }

    /// Run `f` on a structure while it is temporarily out of the table, so
    /// it can attach or detach children through the same table.
    pub fn with_mut<R>(
        &mut self,
        id: &StructureId,
        f: impl FnOnce(&mut dyn SharedStructure, &mut ObjectTable) -> R,
    ) -> Option<R> {
        let (key, mut structure) = self.objects.remove_entry(id)?;
        let result = f(structure.as_mut(), self);
        self.objects.insert(key, structure);
        Some(result)
    }

    /// Apply a payload to the addressed structure. Unknown ids are a no-op.
    pub fn apply(
        &mut self,
        id: &StructureId,
        payload: &MutationPayload,
        ctx: &MutationContext,
    ) -> Option<MutationPayload> {
        match self.with_mut(id, |target, table| target.handle(payload, ctx, table)) {
            Some(inverse) => inverse,
            None => {
                log::debug!("Ignoring mutation for unknown target {id}");
                None
            }
        }
    }

    pub fn summary_of(&self, id: &StructureId) -> Option<Summary> {
        self.get(id).map(|s| s.summary(self))
    }

    pub(crate) fn notify_commit(&mut self, id: &StructureId, transaction: &Transaction) {
        if let Some(structure) = self.objects.get_mut(id) {
            structure.on_transaction_commit(transaction);
        }
    }
}
