//! chx-core
//!
//! Change-hash engine, pure half:
//! - Hash algorithms and the in-process forms of the attribute, dependency and
//!   composite hashers.
//! - The entity contract (`HashableEntity`) and its config-declared form.
//! - Scope predicates: a small boolean expression tree evaluated in process
//!   and rendered to SQL by chx-db.
//! - The entity registry, keyed by entity type name.
//!
//! Deterministic, pure logic. No IO. No clock.

mod entity;
mod hashing;
mod registry;
mod scope;

pub use entity::{DeclaredEntity, HashableEntity, Relation, RelationLink, TableRef};
pub use hashing::{
    AttributeHasher, CompositeHashCalculator, DependencyHashInput, DependencyHasher,
    HashAlgorithm, HASH_SEPARATOR,
};
pub use registry::{EntityRegistry, RegistryError};
pub use scope::{CompareOp, Scope, ScopeValue};
