//! Error type for local document operations.

use thiserror::Error;

use crate::structure::StructureId;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Structure not attached: {0}")]
    UnknownTarget(StructureId),
    #[error("Structure {id} is not a {expected}")]
    WrongKind {
        id: StructureId,
        expected: &'static str,
    },
    #[error("Unknown property '{property}' on {id}")]
    UnknownProperty { id: StructureId, property: String },
    #[error("Value error: {0}")]
    Value(#[from] serde_json::Error),
}
