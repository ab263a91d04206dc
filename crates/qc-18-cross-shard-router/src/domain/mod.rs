//! # Domain Module
//!
//! Core domain types for the Cross-Shard Router subsystem.

pub mod entities;
pub mod invariants;
pub mod value_objects;

pub use entities::*;
pub use invariants::*;
pub use value_objects::*;
