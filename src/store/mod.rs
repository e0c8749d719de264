//! Store adapters
//!
//! Thin interfaces over the four persistence concerns:
//! - Relational registry store (system of record)
//! - Vector store (named collections, payload filters)
//! - Versioned key/value cache
//! - Object store
//!
//! The relational store is authoritative; cache and vector writes are
//! best-effort secondaries and never block relational commits.

pub mod cache;
pub mod object;
pub mod relational;
pub mod vector;

pub use cache::{CacheError, LayerCache};
pub use object::{resource_body_key, FsObjectStore, MemoryObjectStore, ObjectError, ObjectStore};
pub use relational::{RegistryStore, StoreError};
pub use vector::{
    MemoryVectorStore, PointFilter, PointPayload, ScoredPoint, VectorError, VectorIndex,
    VectorStore,
};
