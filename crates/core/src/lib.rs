//! `recap-core`: identifiers and the domain error model shared by every crate.
//!
//! Pure types only; no I/O.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TaskId};
