use std::fmt;
use std::path::PathBuf;

/// Address of the primary a replica follows. `REPLICAOF` is the only mutator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryAddr {
    pub host: String,
    pub port: u16,
}

impl PrimaryAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PrimaryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Canonical on-disk snapshot file. The bulk transfer is staged in a
    /// temp file in the same directory so the final rename stays atomic.
    pub dump_path: PathBuf,
    /// Primary to follow at startup, if any.
    pub primary: Option<PrimaryAddr>,
    /// Shared secret sent as `AUTH <secret>` before `SYNC`.
    pub primary_auth: Option<String>,
    /// Kick a background append-journal rewrite once a bootstrap completes.
    pub rewrite_journal_after_sync: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            dump_path: PathBuf::from("dump.rdb"),
            primary: None,
            primary_auth: None,
            rewrite_journal_after_sync: false,
        }
    }
}
