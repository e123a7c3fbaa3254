//! Shared objects: named, versioned property slots with the
//! last-local-write-wins-until-acked conflict policy.
//!
//! Per field:
//!
//! | Source | Effect                                                       |
//! |--------|--------------------------------------------------------------|
//! | Local  | value applied, `pending_version := ctx.version`              |
//! | Ack    | `pending_version` cleared when it equals `ctx.version`       |
//! | Remote | applied only while `pending_version` is unset, else dropped  |

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::mutation::{MutationContext, MutationPayload, MutationSource, ObjectPatch};
use crate::structure::{ObjectTable, SharedStructure, StructureId};
use crate::summary::Summary;

/// A single versioned value slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedProperty {
    value: Value,
    pending_version: Option<u64>,
}

impl SharedProperty {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            pending_version: None,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Version of our own edit that the sequencer has not confirmed yet.
    pub fn pending_version(&self) -> Option<u64> {
        self.pending_version
    }

    /// Returns the previous value when the incoming one was applied.
    ///
    /// A local write of the current value emits no mutation, so it leaves
    /// `pending_version` alone: no ack would ever arrive to clear it and the
    /// field would drop remote edits from then on.
    fn apply(&mut self, value: &Value, ctx: &MutationContext) -> Option<Value> {
        match ctx.source {
            MutationSource::Local => {
                if self.value == *value {
                    return None;
                }
                self.pending_version = Some(ctx.version);
                Some(std::mem::replace(&mut self.value, value.clone()))
            }
            MutationSource::Ack => {
                if self.pending_version == Some(ctx.version) {
                    self.pending_version = None;
                }
                None
            }
            MutationSource::Remote => {
                if self.pending_version.is_some() || self.value == *value {
                    return None;
                }
                Some(std::mem::replace(&mut self.value, value.clone()))
            }
        }
    }
}

/// Typed handle to a property of a shared object.
pub struct PropertyKey<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PropertyKey<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for PropertyKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for PropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PropertyKey").field(&self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub struct SharedObject {
    id: StructureId,
    properties: BTreeMap<String, SharedProperty>,
}

impl Default for SharedObject {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedObject {
    pub fn new() -> Self {
        Self::with_id(StructureId::generate())
    }

    pub fn with_id(id: StructureId) -> Self {
        Self {
            id,
            properties: BTreeMap::new(),
        }
    }

    pub fn restore(id: StructureId, data: &BTreeMap<String, Value>) -> Self {
        let properties = data
            .iter()
            .map(|(name, value)| (name.clone(), SharedProperty::new(value.clone())))
            .collect();
        Self { id, properties }
    }

    /// Register a field. An already registered field keeps its value.
    pub fn property<T: Serialize>(&mut self, name: &str, initial: T) -> PropertyKey<T> {
        if !self.properties.contains_key(name) {
            let value = serde_json::to_value(initial).unwrap_or_else(|e| {
                log::warn!("Property '{name}' on {} has unserializable initial value: {e}", self.id);
                Value::Null
            });
            self.properties.insert(name.to_string(), SharedProperty::new(value));
        }
        PropertyKey::new(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &PropertyKey<T>) -> Result<T, CoreError> {
        let value = self.value(key.name()).ok_or_else(|| CoreError::UnknownProperty {
            id: self.id.clone(),
            property: key.name().to_string(),
        })?;
        Ok(T::deserialize(value)?)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).map(SharedProperty::value)
    }

    pub fn pending_version(&self, name: &str) -> Option<u64> {
        self.properties.get(name).and_then(SharedProperty::pending_version)
    }

    pub fn has_pending(&self) -> bool {
        self.properties.values().any(|p| p.pending_version.is_some())
    }

    /// Write a field of an object that is not attached. No mutation is
    /// emitted. Returns whether the value changed.
    pub fn set<T: Serialize>(&mut self, key: &PropertyKey<T>, value: T) -> Result<bool, CoreError> {
        let value = serde_json::to_value(value)?;
        let id = self.id.clone();
        let property = self
            .properties
            .get_mut(key.name())
            .ok_or_else(|| CoreError::UnknownProperty {
                id,
                property: key.name().to_string(),
            })?;
        if property.value == value {
            return Ok(false);
        }
        property.value = value;
        Ok(true)
    }

    /// Apply a patch field by field. Fields unknown to this object are
    /// ignored. Returns the undo patch for the fields that changed.
    pub fn apply_patch(&mut self, patch: &ObjectPatch, ctx: &MutationContext) -> Option<ObjectPatch> {
        let mut undo = ObjectPatch::new();
        for (name, value) in patch.iter() {
            let Some(property) = self.properties.get_mut(name) else {
                log::trace!("Ignoring unknown field '{name}' on {}", self.id);
                continue;
            };
            if let Some(previous) = property.apply(value, ctx) {
                undo.insert(name.clone(), previous);
            } else if ctx.source == MutationSource::Remote && property.pending_version.is_some() {
                log::debug!(
                    "Dropped remote write to {}.{name}: local edit v{:?} pending",
                    self.id,
                    property.pending_version
                );
            }
        }
        (!undo.is_empty()).then_some(undo)
    }
}

impl SharedStructure for SharedObject {
    fn id(&self) -> &StructureId {
        &self.id
    }

    fn handle(
        &mut self,
        payload: &MutationPayload,
        ctx: &MutationContext,
        _table: &mut ObjectTable,
    ) -> Option<MutationPayload> {
        match payload {
            MutationPayload::Object(patch) => self.apply_patch(patch, ctx).map(MutationPayload::Object),
            MutationPayload::List(_) => {
                log::warn!("List mutation addressed to object {}", self.id);
                None
            }
        }
    }

    fn summary(&self, _table: &ObjectTable) -> Summary {
        Summary::Object {
            id: self.id.clone(),
            data: self
                .properties
                .iter()
                .map(|(name, property)| (name.clone(), property.value.clone()))
                .collect(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
