//! # cadence-core: Shared document model with undo/redo
//!
//! Structures (objects and ordered lists) addressed by stable ids, a
//! coordinator that routes every mutation, and transactional history.
//!
//! ## Architecture
//!
//! ```text
//!              local edit                    sequenced op
//!                  │                              │
//!                  ▼                              ▼
//!  ┌───────────────────────────────────────────────────────┐
//!  │ UpdateCoordinator                                      │
//!  │  ┌─────────────┐  ┌─────────────┐  ┌───────────────┐  │
//!  │  │ ObjectTable │  │ Transaction │  │ OutboundQueue │──┼──► batch
//!  │  │ id → struct │  │ undo / redo │  │ (squashed)    │  │
//!  │  └─────────────┘  └─────────────┘  └───────────────┘  │
//!  └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`mutation`]: Wire payloads and the context they are applied in
//! - [`structure`]: Structure ids, the `SharedStructure` trait, the object table
//! - [`object`]: Keyed properties with pending-local-write suppression
//! - [`list`]: Ordered collection of child structures
//! - [`summary`]: Serializable snapshots and rehydration
//! - [`transaction`]: Undo units with merge rules
//! - [`outbox`]: Outbound mutation queue
//! - [`coordinator`]: Routing, history, versions

pub mod error;
pub mod mutation;
pub mod structure;
pub mod summary;
pub mod object;
pub mod list;
pub mod transaction;
pub mod outbox;
pub mod coordinator;

// Re-exports for convenience
pub use coordinator::{CoordinatorEvent, UpdateCoordinator};
pub use error::CoreError;
pub use list::SharedList;
pub use mutation::{ListMutation, Mutation, MutationContext, MutationPayload, MutationSource, ObjectPatch};
pub use object::{PropertyKey, SharedObject};
pub use outbox::OutboundBatch;
pub use structure::{ObjectTable, SharedStructure, StructureId};
pub use summary::Summary;
pub use transaction::{Transaction, TransactionEntry};
