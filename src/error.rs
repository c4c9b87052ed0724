use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad protocol from primary: {0}")]
    BadProtocol(String),
    #[error("primary aborted replication: {0}")]
    PrimaryAborted(String),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("connection with primary lost")]
    LinkClosed,
    #[error("handshake with primary failed: {0}")]
    Handshake(String),
    #[error("Can't SYNC while not connected with my primary")]
    SyncWhileLinkDown,
    #[error("SYNC is invalid with pending output")]
    SyncWithPendingOutput,
    #[error("Unable to perform background save")]
    SaveFailed,
    #[error("background save already in progress")]
    SaveInProgress,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl Error {
    /// Wire reply sent to a client whose `SYNC` request was refused.
    pub fn refusal_line(&self) -> String {
        format!("-ERR {self}\r\n")
    }
}
