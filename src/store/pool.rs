//! Connection pool contract consumed by the guarded store access layer

use async_trait::async_trait;

use crate::Result;

/// List and set primitives of a shared key-value store connection.
///
/// Lists are append-at-tail; readers get them oldest first.
#[async_trait]
pub trait ListConnection: Send + Sync + 'static {
    /// Append `values` to the list at `key`, then trim it to the newest
    /// `max_len` entries. Returns the list length after trimming.
    async fn push_trimmed(&self, key: &str, values: Vec<String>, max_len: usize) -> Result<usize>;

    /// Every entry of the list at `key`, oldest first. Missing keys are empty.
    async fn range(&self, key: &str) -> Result<Vec<String>>;

    /// Add `(score, value)` entries to the sorted set at `key`, skipping any
    /// score already present, then keep only the `max_len` highest scores.
    /// Entries that would be trimmed right away are not added. Returns how
    /// many entries were added.
    async fn add_scored(
        &self,
        key: &str,
        entries: Vec<(u64, String)>,
        max_len: usize,
    ) -> Result<usize>;

    /// Every value of the sorted set at `key`, lowest score first
    async fn range_by_score(&self, key: &str) -> Result<Vec<String>>;

    /// Add `member` to the set at `key`. Returns `true` if it was new.
    async fn add_member(&self, key: &str, member: &str) -> Result<bool>;

    /// Every member of the set at `key`
    async fn members(&self, key: &str) -> Result<Vec<String>>;
}

/// Pool handing out store connections.
///
/// Implementations must be `Send + Sync` because one pool is shared by every
/// task of a worker process.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// Connection type handed out by this pool
    type Connection: ListConnection;

    /// Check a connection out of the pool
    async fn acquire(&self) -> Result<Self::Connection>;

    /// Return a connection to the pool
    fn release(&self, conn: Self::Connection);
}
