use std::path::Path;

use bytes::Bytes;

/// Contract between the replication core and the key-value engine.
///
/// The engine owns the dataset; replication only ever asks it to snapshot
/// itself, replace itself from a snapshot, or replay one command. Commands
/// replayed through [`Engine::apply`] come from the primary's stream and
/// must not be propagated back out to this node's own replicas.
#[async_trait::async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Drop every key in every logical database.
    async fn flush_all(&self);

    /// Replace the dataset with the contents of the snapshot at `path`.
    async fn load_snapshot(&self, path: &Path) -> anyhow::Result<()>;

    /// Capture a consistent view of the dataset, synchronously. This is
    /// the fork point a bootstrapping replica's backlog is measured from:
    /// a mutation executes either before the capture (and is in the
    /// snapshot) or after it (and is queued on the backlog), never both.
    /// Writing the view out happens later, off the caller's path.
    fn begin_snapshot(&self) -> anyhow::Result<Box<dyn SnapshotJob>>;

    /// Execute one already-parsed mutating command against database `db`.
    async fn apply(&self, db: u32, argv: Vec<Bytes>) -> anyhow::Result<()>;

    /// Start a background append-journal rewrite, if the engine keeps one.
    async fn rewrite_journal(&self) {}
}

/// A captured dataset view on its way to disk.
#[async_trait::async_trait]
pub trait SnapshotJob: Send + 'static {
    async fn write(self: Box<Self>, path: &Path) -> anyhow::Result<()>;
}
