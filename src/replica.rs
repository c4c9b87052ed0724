//! Replica side of a replication link.
//!
//! One [`ReplicaWorker`] task owns the whole lifecycle: connect to the
//! primary, handshake, download the snapshot into a staging file, load it
//! into the engine, then replay the live command stream. Any failure tears
//! the cycle down and reconnects after a short delay. [`ReplicaHandle`] is
//! the control surface the command dispatcher uses for `REPLICAOF`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::{PrimaryAddr, ReplicationConfig};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::protocol::{self, Inbound, HANDSHAKE_READ_TIMEOUT, HANDSHAKE_WRITE_TIMEOUT, LINE_MAX};
use crate::snapshot::{TempSnapshotFile, TRANSFER_CHUNK};
use crate::REPL_TIMEOUT;

/// Connect failures retry at the cadence of the periodic replication
/// tick; there is no exponential back-off.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Where the link with the primary currently stands. `None` means this
/// node is not a replica at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    None,
    Connect,
    Transfer,
    Connected,
}

/// Control surface over the worker; cheap to clone.
#[derive(Clone)]
pub struct ReplicaHandle {
    target: Arc<Mutex<Option<PrimaryAddr>>>,
    ctl: mpsc::UnboundedSender<()>,
    state: watch::Receiver<LinkState>,
}

impl ReplicaHandle {
    /// `REPLICAOF <host> <port>`: follow a (new) primary. Any in-flight
    /// transfer is aborted and the cycle restarts against the new target.
    pub async fn replica_of(&self, host: impl Into<String>, port: u16) {
        let addr = PrimaryAddr::new(host, port);
        tracing::info!("REPLICA OF {addr} enabled (user request)");
        *self.target.lock().await = Some(addr);
        let _ = self.ctl.send(());
    }

    /// `REPLICAOF NO ONE`: resume the primary/standalone role. Idempotent;
    /// aborts any in-flight transfer and unlinks its staging file.
    pub async fn promote(&self) {
        let mut target = self.target.lock().await;
        if target.take().is_some() {
            tracing::info!("PRIMARY MODE enabled (user request)");
        }
        drop(target);
        let _ = self.ctl.send(());
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch channel over the link state, for callers that need to wait on
    /// a transition (the primary controller refuses `SYNC` while this is
    /// `Connect` or `Transfer`).
    pub fn link_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

pub struct ReplicaWorker {
    engine: Arc<dyn Engine>,
    dump_path: PathBuf,
    auth: Option<String>,
    rewrite_journal_after_sync: bool,
    target: Arc<Mutex<Option<PrimaryAddr>>>,
    ctl: Option<mpsc::UnboundedReceiver<()>>,
    state: watch::Sender<LinkState>,
    /// Database context of the primary's stream, set by replayed `SELECT`s.
    selected_db: u32,
}

impl ReplicaWorker {
    pub fn new(engine: Arc<dyn Engine>, config: ReplicationConfig) -> (Self, ReplicaHandle) {
        let target = Arc::new(Mutex::new(config.primary));
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::None);
        let handle = ReplicaHandle {
            target: target.clone(),
            ctl: ctl_tx,
            state: state_rx,
        };
        let worker = Self {
            engine,
            dump_path: config.dump_path,
            auth: config.primary_auth,
            rewrite_journal_after_sync: config.rewrite_journal_after_sync,
            target,
            ctl: Some(ctl_rx),
            state: state_tx,
            selected_db: 0,
        };
        (worker, handle)
    }

    /// Drive the link until every [`ReplicaHandle`] is gone. Parks in
    /// [`LinkState::None`] while no primary is configured.
    pub async fn run(mut self) {
        let mut ctl = self.ctl.take().expect("replica worker already running");
        loop {
            let target = self.target.lock().await.clone();
            let Some(addr) = target else {
                let _ = self.state.send_replace(LinkState::None);
                match ctl.recv().await {
                    Some(()) => continue,
                    None => return,
                }
            };
            let _ = self.state.send_replace(LinkState::Connect);
            tokio::select! {
                biased;
                msg = ctl.recv() => {
                    // retarget or promotion: the cycle future is dropped,
                    // which closes the socket and unlinks the staging file
                    if msg.is_none() {
                        return;
                    }
                }
                res = self.run_cycle(&addr) => {
                    match res {
                        Ok(()) => tracing::info!("link with primary {addr} closed"),
                        Err(e) => tracing::warn!("replication cycle with primary {addr} failed: {e}"),
                    }
                    let _ = self.state.send_replace(LinkState::Connect);
                    tokio::select! {
                        biased;
                        msg = ctl.recv() => { if msg.is_none() { return; } }
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    /// One connect → bootstrap → stream cycle.
    async fn run_cycle(&mut self, addr: &PrimaryAddr) -> Result<()> {
        self.selected_db = 0;
        tracing::info!("connecting to primary {addr}");
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        self.handshake(&mut stream).await?;
        tracing::info!("primary <-> replica sync started: SYNC sent");

        let staging_dir = self
            .dump_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut staging = TempSnapshotFile::create(&staging_dir).await?;
        tracing::debug!("staging snapshot into {}", staging.path().display());
        let _ = self.state.send_replace(LinkState::Transfer);

        let size = self.read_transfer_header(&mut stream).await?;
        tracing::info!("primary <-> replica sync: receiving {size} bytes from primary");
        self.receive_payload(&mut stream, &mut staging, size).await?;
        staging.persist(&self.dump_path).await?;

        tracing::info!("primary <-> replica sync: loading dataset in memory");
        self.engine.flush_all().await;
        // The socket is not read again until the load is done, so the
        // engine can pump its own events without re-entering this task.
        self.engine
            .load_snapshot(&self.dump_path)
            .await
            .map_err(Error::Engine)?;
        let _ = self.state.send_replace(LinkState::Connected);
        tracing::info!("primary <-> replica sync: finished with success");
        if self.rewrite_journal_after_sync {
            self.engine.rewrite_journal().await;
        }

        self.stream_from_primary(stream).await
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<()> {
        if let Some(secret) = &self.auth {
            protocol::write_timeout(
                stream,
                format!("AUTH {secret}\r\n").as_bytes(),
                HANDSHAKE_WRITE_TIMEOUT,
            )
            .await?;
            let reply = protocol::read_line_limited(stream, LINE_MAX, HANDSHAKE_READ_TIMEOUT).await?;
            if !reply.starts_with('+') {
                return Err(Error::Handshake(
                    "primary rejected AUTH; is the shared secret correct?".into(),
                ));
            }
        }
        protocol::write_timeout(stream, b"SYNC \r\n", HANDSHAKE_WRITE_TIMEOUT).await
    }

    /// Wait for the `$<size>` bulk header. Empty lines are keep-alives the
    /// primary sends while its background save is still running; an error
    /// line means it gave up on us.
    async fn read_transfer_header<R: AsyncRead + Unpin>(&self, stream: &mut R) -> Result<u64> {
        loop {
            let line = protocol::read_line_limited(stream, LINE_MAX, REPL_TIMEOUT)
                .await
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::Timeout("waiting for the snapshot header"),
                    e => e,
                })?;
            if let Some(msg) = line.strip_prefix('-') {
                return Err(Error::PrimaryAborted(msg.to_owned()));
            }
            if line.is_empty() {
                tracing::debug!("keep-alive from primary while waiting for the snapshot");
                continue;
            }
            let Some(size) = line.strip_prefix('$') else {
                return Err(Error::BadProtocol(
                    "first byte of the snapshot header is not '$'; are the host and port right?"
                        .into(),
                ));
            };
            return size
                .parse()
                .map_err(|_| Error::BadProtocol(format!("bad snapshot size {size:?}")));
        }
    }

    async fn receive_payload<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        staging: &mut TempSnapshotFile,
        size: u64,
    ) -> Result<()> {
        let mut remaining = size;
        let mut chunk = vec![0u8; TRANSFER_CHUNK];
        while remaining > 0 {
            let want = remaining.min(TRANSFER_CHUNK as u64) as usize;
            let n = tokio::time::timeout(REPL_TIMEOUT, stream.read(&mut chunk[..want]))
                .await
                .map_err(|_| Error::Timeout("receiving the snapshot"))??;
            if n == 0 {
                return Err(Error::LinkClosed);
            }
            staging.append(&chunk[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Steady state: replay the primary's live stream into the engine.
    /// Commands replayed here are never fed back to this node's replicas.
    async fn stream_from_primary<S: AsyncRead + Unpin>(&mut self, stream: S) -> Result<()> {
        let mut reader = BufReader::new(stream);
        tracing::info!("processing command stream from primary");
        loop {
            let inbound = tokio::time::timeout(REPL_TIMEOUT, protocol::read_inbound(&mut reader))
                .await
                .map_err(|_| Error::Timeout("waiting for data from primary"))??;
            match inbound {
                Inbound::Eof => return Err(Error::LinkClosed),
                Inbound::Keepalive => continue,
                Inbound::Command(argv) => self.apply_from_primary(argv).await?,
            }
        }
    }

    async fn apply_from_primary(&mut self, argv: Vec<Bytes>) -> Result<()> {
        let Some(name) = argv.first() else {
            return Ok(());
        };
        if name.eq_ignore_ascii_case(b"PING") {
            return Ok(());
        }
        if name.eq_ignore_ascii_case(b"SELECT") && argv.len() == 2 {
            self.selected_db = std::str::from_utf8(&argv[1])
                .ok()
                .and_then(|db| db.parse().ok())
                .ok_or_else(|| Error::BadProtocol("bad SELECT from primary".into()))?;
            return Ok(());
        }
        self.engine
            .apply(self.selected_db, argv)
            .await
            .map_err(Error::Engine)
    }
}
