//! Serializable full-state projections used for bootstrap and persistence.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::list::SharedList;
use crate::object::SharedObject;
use crate::structure::{SharedStructure, StructureId};

/// `{ id, data }` for objects, `{ id, items }` for ordered collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Summary {
    List {
        id: StructureId,
        items: Vec<Summary>,
    },
    Object {
        id: StructureId,
        data: BTreeMap<String, Value>,
    },
}

impl Summary {
    pub fn empty_list(id: impl Into<StructureId>) -> Self {
        Summary::List {
            id: id.into(),
            items: Vec::new(),
        }
    }

    pub fn id(&self) -> &StructureId {
        match self {
            Summary::List { id, .. } | Summary::Object { id, .. } => id,
        }
    }

    /// Every id in this summary, depth first.
    pub fn ids(&self) -> Vec<StructureId> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, ids: &mut Vec<StructureId>) {
        ids.push(self.id().clone());
        if let Summary::List { items, .. } = self {
            for item in items {
                item.collect_ids(ids);
            }
        }
    }

    /// Rebuild a detached structure graph with identical ids.
    pub fn materialize(&self) -> Box<dyn SharedStructure> {
        match self {
            Summary::Object { id, data } => Box::new(SharedObject::restore(id.clone(), data)),
            Summary::List { id, items } => {
                let mut list = SharedList::with_id(id.clone());
                for item in items {
                    list.add(item.materialize());
                }
                Box::new(list)
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
