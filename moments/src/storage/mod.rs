//! Persistence seams.
//!
//! The relational store and the object store are external collaborators; this
//! module defines the repository traits the core consumes, the record shapes
//! it exchanges, and lightweight local implementations (in-memory rows, a
//! filesystem object store) used by tests and single-node development.

pub mod fs;
pub mod memory;
pub mod models;
pub mod object_store;
pub mod repositories;

pub use models::*;
pub use object_store::{ObjectStore, SignedUrl};
pub use repositories::*;
