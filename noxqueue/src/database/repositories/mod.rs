//! Repository layer for database access.
//!
//! Repositories hold no business rules: every transition is a single
//! conditional statement and reports whether it matched. Deciding what a
//! non-match means is left to the lifecycle authority.

pub mod artifact;
pub mod job;

pub use artifact::*;
pub use job::*;
