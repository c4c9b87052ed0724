//! Asynchronous primary/replica replication for the EmberKV in-memory
//! key-value server.
//!
//! A replica bootstraps by downloading a point-in-time snapshot of the
//! primary's dataset, then stays byte-identical by replaying the live
//! stream of mutating commands. The crate owns both sides of that link;
//! the key-value engine, the command dispatcher and the front-end accept
//! loop plug in through the [`Engine`] trait and the [`Primary`] /
//! [`ReplicaHandle`] entry points.

use std::time::Duration;

mod config;
mod engine;
mod error;
pub mod primary;
pub mod protocol;
pub mod replica;
mod snapshot;

pub use config::{PrimaryAddr, ReplicationConfig};
pub use engine::{Engine, SnapshotJob};
pub use error::{Error, Result};
pub use primary::{Primary, ReplicaId, SyncState};
pub use replica::{LinkState, ReplicaHandle, ReplicaWorker};

/// A silent peer is considered dead after this long, on either side of
/// the link.
pub const REPL_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the primary pings its replicas so they can tell an idle link
/// from a dead one.
pub const PING_PERIOD: Duration = Duration::from_secs(10);
