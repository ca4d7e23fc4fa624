//! `stockline-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no IO, no async): identifiers,
//! the domain error model and decimal precision rules shared by every stock
//! document.

pub mod entity;
pub mod error;
pub mod id;
pub mod precision;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{DocumentId, RowId};
pub use precision::{Precision, RoundingMode, is_blank};
pub use value_object::ValueObject;
