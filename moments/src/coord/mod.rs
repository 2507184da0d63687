//! Coordination store access.
//!
//! Everything the engine keeps in Redis goes through [`CoordStore`], and every
//! key it touches is produced by [`keys`] so the layout cannot drift between
//! components.

pub mod client;
pub mod keys;
pub mod memory;

pub use client::{CoordBackend, CoordStore, StreamEntry};
