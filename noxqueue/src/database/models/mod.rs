//! Database models.
//!
//! These map directly to the schema in `migrations/`. Enum-valued columns are
//! stored as text and parsed at the repository boundary.

pub mod artifact;
pub mod job;

pub use artifact::*;
pub use job::*;

/// Offset pagination for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_clamps_limit() {
        assert_eq!(Pagination::new(0, 0).limit, 1);
        assert_eq!(Pagination::new(10_000, 5).limit, Pagination::MAX_LIMIT);
        assert_eq!(Pagination::default().limit, Pagination::DEFAULT_LIMIT);
    }
}
