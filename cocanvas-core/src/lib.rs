//! # cocanvas-core — Composition model and mutation layer
//!
//! The aggregate data model for shared visual compositions and the
//! [`CompositionStore`] contract: atomic, conditional, field-granular
//! mutations against a document store. Conflicting concurrent edits
//! resolve last-write-wins per field; edits are scoped to independent
//! elements or independent fields, so no OT/CRDT machinery is involved.
//!
//! ## Modules
//!
//! - [`model`] — Composition / CompositionElement aggregates and validation
//! - [`store`] — `CompositionStore` trait + in-memory reference store

pub mod model;
pub mod store;

pub use model::{Composition, CompositionElement, ValidationError};
pub use store::{CompositionStore, MemoryCompositionStore, MutationOutcome, StoreError};
