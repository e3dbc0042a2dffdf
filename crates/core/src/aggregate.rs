//! Versioned rows.

/// A row the ledger locks, mutates and writes back.
///
/// Orders, production batches and stock balances carry a version: 0 for a
/// row that was never stored, bumped by one on every committed write. Stores
/// compare the version a row was read at with the current one before a write.
pub trait AggregateRoot {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Version of the row as it was read from the store.
    fn version(&self) -> u64;

    fn is_persisted(&self) -> bool {
        self.version() > 0
    }
}

/// What a write expects the stored version to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check. Used when a balance row is created on first movement.
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    /// Expect the version `row` was read at.
    pub fn read_at<A: AggregateRoot>(row: &A) -> Self {
        ExpectedVersion::Exact(row.version())
    }

    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}
