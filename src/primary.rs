//! Primary side of replication: tracks attached replicas, shares one
//! background save between every replica that arrives while it runs, and
//! fans live writes out to whoever is caught up.
//!
//! A replica moves through [`SyncState`] like this:
//!
//! ```text
//!   SYNC arrives -----------------> WaitSaveEnd --> SendBulk --> Online
//!        |                              ^
//!        | (a save started for other    | (next save completes)
//!        |  reasons is already running) |
//!        +---------> WaitSaveStart -----+
//! ```
//!
//! From the instant a replica enters `WaitSaveEnd`, every mutation is
//! queued on its backlog, so the byte stream it eventually sees is the
//! snapshot followed by exactly the writes the snapshot missed. Replicas
//! promoted out of `WaitSaveStart` inherit nothing from the save they
//! missed; their backlog starts with the save that is started for them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::protocol::{self, CommandArg};
use crate::replica::LinkState;
use crate::snapshot;
use crate::PING_PERIOD;

pub type ReplicaId = u64;

/// Bootstrap progress of one attached replica, as the primary sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Attached while an unrelated save was running; waiting for the next one.
    WaitSaveStart,
    /// A save that will be its baseline is running; backlog is accumulating.
    WaitSaveEnd,
    /// The finished snapshot is being streamed to it.
    SendBulk,
    /// Bootstrapped; receives the live stream.
    Online,
}

struct Replica {
    id: ReplicaId,
    addr: SocketAddr,
    sync_state: SyncState,
    /// Database the replica's stream is positioned on; `SELECT` frames are
    /// injected whenever a command targets a different one.
    selected_db: u32,
    /// Frames queued while the replica is not yet `Online`. Flushed to the
    /// writer the moment the bulk transfer finishes.
    backlog: Vec<Bytes>,
    /// Present while buffering; lent to the bulk sender during `SendBulk`,
    /// handed to the writer task at `Online`.
    stream: Option<TcpStream>,
    /// Writer-task channel; `Some` iff `Online`.
    sender: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Replica {
    /// Queue one frame. Returns `false` when the writer is gone and the
    /// replica must be dropped.
    fn enqueue(&mut self, frame: Bytes) -> bool {
        match &self.sender {
            Some(tx) => tx.send(frame).is_ok(),
            None => {
                self.backlog.push(frame);
                true
            }
        }
    }
}

struct Monitor {
    addr: SocketAddr,
    sender: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct PrimaryState {
    replicas: Vec<Replica>,
    monitors: Vec<Monitor>,
    save_in_progress: bool,
    next_replica_id: ReplicaId,
}

pub struct Primary {
    engine: Arc<dyn Engine>,
    dump_path: PathBuf,
    /// Link state of this node's own replica worker, when it has one.
    /// A replica-of-a-replica may only serve `SYNC` while its upstream
    /// link is healthy.
    link: Option<watch::Receiver<LinkState>>,
    state: Mutex<PrimaryState>,
}

impl Primary {
    pub fn new(
        engine: Arc<dyn Engine>,
        dump_path: impl Into<PathBuf>,
        link: Option<watch::Receiver<LinkState>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            dump_path: dump_path.into(),
            link,
            state: Mutex::new(PrimaryState::default()),
        })
    }

    /// Take over a connection whose client sent `SYNC` (the dispatcher
    /// accepts both `SYNC\r\n` and the historical `SYNC \r\n`, and only
    /// hands the stream off once its reply queue is empty). On refusal the
    /// protocol error is written out and the connection dropped.
    pub async fn handle_sync(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        if let Some(link) = &self.link {
            let link = *link.borrow();
            if matches!(link, LinkState::Connect | LinkState::Transfer) {
                let err = Error::SyncWhileLinkDown;
                let _ = stream.write_all(err.refusal_line().as_bytes()).await;
                return Err(err);
            }
        }
        tracing::info!("replica {addr} asked for synchronization");
        let mut state = self.state.lock().await;
        let (sync_state, backlog) = if state.save_in_progress {
            if let Some(peer) = state
                .replicas
                .iter()
                .find(|r| r.sync_state == SyncState::WaitSaveEnd)
            {
                // The running save already has a cohort registering the
                // changes since it forked; share its snapshot and inherit
                // a copy of its backlog.
                tracing::info!("waiting for end of save for sync (attaching to running save)");
                (SyncState::WaitSaveEnd, peer.backlog.clone())
            } else {
                // The running save predates us and nobody is tracking
                // changes for it; only the next save can be our baseline.
                tracing::info!("waiting for next save for sync");
                (SyncState::WaitSaveStart, Vec::new())
            }
        } else {
            tracing::info!("starting save for sync");
            if let Err(e) = Self::start_save_locked(&self, &mut state) {
                let err = Error::SaveFailed;
                let _ = stream.write_all(err.refusal_line().as_bytes()).await;
                tracing::warn!("replication failed: can't start background save: {e}");
                return Err(err);
            }
            (SyncState::WaitSaveEnd, Vec::new())
        };
        let id = state.next_replica_id;
        state.next_replica_id += 1;
        state.replicas.push(Replica {
            id,
            addr,
            sync_state,
            selected_db: 0,
            backlog,
            stream: Some(stream),
            sender: None,
        });
        Ok(())
    }

    /// Attach a passive observer that receives a human-readable trace of
    /// every command fed through [`Primary::feed_monitors`].
    pub async fn attach_monitor(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .monitors
            .push(Monitor { addr, sender: tx });
        tracing::info!("monitor {addr} attached");
        tokio::spawn(run_monitor_writer(stream, rx));
    }

    /// Fan one executed command out to every replica able to receive it.
    /// The frame is encoded once and shared; a replica positioned on a
    /// different database gets a `SELECT` frame first.
    pub async fn feed_replicas(&self, db: u32, argv: &[CommandArg]) {
        let mut state = self.state.lock().await;
        if state.replicas.is_empty() {
            return;
        }
        let frame = protocol::encode_multibulk(argv);
        let mut dead = Vec::new();
        for replica in state.replicas.iter_mut() {
            // no post-save baseline yet: it inherits a cohort backlog when
            // a save completes for it
            if replica.sync_state == SyncState::WaitSaveStart {
                continue;
            }
            if replica.selected_db != db {
                if !replica.enqueue(protocol::select_frame(db)) {
                    dead.push(replica.id);
                    continue;
                }
                replica.selected_db = db;
            }
            if !replica.enqueue(frame.clone()) {
                dead.push(replica.id);
            }
        }
        state.replicas.retain(|r| !dead.contains(&r.id));
    }

    /// Send the trace line for one executed command to every monitor.
    pub async fn feed_monitors(&self, db: u32, argv: &[CommandArg]) {
        let mut state = self.state.lock().await;
        if state.monitors.is_empty() {
            return;
        }
        let line = protocol::format_trace(db, argv, SystemTime::now());
        state.monitors.retain(|m| {
            if m.sender.send(line.clone()).is_ok() {
                true
            } else {
                tracing::debug!("monitor {} detached", m.addr);
                false
            }
        });
    }

    /// Kick a background save. The embedding's explicit save command goes
    /// through here too, so every completion runs the same promotion loop
    /// and a save started for other reasons still unblocks replicas in
    /// [`SyncState::WaitSaveStart`].
    pub async fn start_background_save(self: Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::start_save_locked(&self, &mut state)
    }

    pub async fn save_in_progress(&self) -> bool {
        self.state.lock().await.save_in_progress
    }

    pub async fn replica_states(&self) -> Vec<(SocketAddr, SyncState)> {
        let state = self.state.lock().await;
        state
            .replicas
            .iter()
            .map(|r| (r.addr, r.sync_state))
            .collect()
    }

    /// Capture the fork point while the controller lock is held, then let
    /// the actual write run in the background. Nothing can execute between
    /// the capture and the moment new backlogs start filling, so a write
    /// lands either in the snapshot or on a backlog, never both.
    fn start_save_locked(this: &Arc<Self>, state: &mut PrimaryState) -> Result<()> {
        if state.save_in_progress {
            return Err(Error::SaveInProgress);
        }
        let job = this.engine.begin_snapshot().map_err(|e| {
            tracing::warn!("can't begin background save: {e}");
            Error::SaveFailed
        })?;
        state.save_in_progress = true;
        let this = this.clone();
        tokio::spawn(async move {
            let ok = match job.write(&this.dump_path).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("background save failed: {e}");
                    false
                }
            };
            this.on_save_finished(ok).await;
        });
        Ok(())
    }

    /// Runs after every background save, successful or not, and moves
    /// every waiting replica one step forward.
    async fn on_save_finished(self: Arc<Self>, ok: bool) {
        let mut state = self.state.lock().await;
        state.save_in_progress = false;
        let mut promoted = Vec::new();
        let mut dropped = Vec::new();
        let mut senders = Vec::new();
        for replica in state.replicas.iter_mut() {
            match replica.sync_state {
                SyncState::WaitSaveStart => {
                    // missed this save; a fresh one is demanded below
                    replica.sync_state = SyncState::WaitSaveEnd;
                    promoted.push(replica.id);
                }
                SyncState::WaitSaveEnd => {
                    if !ok {
                        tracing::warn!(
                            "sync with replica {} failed: background save error",
                            replica.addr
                        );
                        dropped.push(replica.id);
                        continue;
                    }
                    let (file, size) = match open_snapshot(&self.dump_path).await {
                        Ok(opened) => opened,
                        Err(e) => {
                            tracing::warn!(
                                "sync with replica {} failed: can't open snapshot after save: {e}",
                                replica.addr
                            );
                            dropped.push(replica.id);
                            continue;
                        }
                    };
                    let Some(stream) = replica.stream.take() else {
                        dropped.push(replica.id);
                        continue;
                    };
                    replica.sync_state = SyncState::SendBulk;
                    senders.push((replica.id, stream, file, size));
                }
                SyncState::SendBulk | SyncState::Online => {}
            }
        }
        state.replicas.retain(|r| !dropped.contains(&r.id));
        for (id, stream, file, size) in senders {
            tokio::spawn(self.clone().run_bulk_sender(id, stream, file, size));
        }
        if !promoted.is_empty() {
            if let Err(e) = Self::start_save_locked(&self, &mut state) {
                tracing::warn!("sync failed: can't start a new background save: {e}");
                state.replicas.retain(|r| !promoted.contains(&r.id));
            }
        }
    }

    async fn run_bulk_sender(
        self: Arc<Self>,
        id: ReplicaId,
        mut stream: TcpStream,
        file: File,
        size: u64,
    ) {
        match snapshot::send_snapshot(&mut stream, file, size).await {
            Ok(()) => self.finish_bulk_send(id, stream).await,
            Err(e) => {
                tracing::warn!("error sending snapshot to replica: {e}");
                self.drop_replica(id).await;
            }
        }
    }

    async fn finish_bulk_send(self: Arc<Self>, id: ReplicaId, stream: TcpStream) {
        let mut state = self.state.lock().await;
        let Some(replica) = state.replicas.iter_mut().find(|r| r.id == id) else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // everything executed since the save forked is already queued; it
        // starts draining the moment the writer comes up
        for frame in replica.backlog.drain(..) {
            let _ = tx.send(frame);
        }
        replica.sender = Some(tx);
        replica.sync_state = SyncState::Online;
        tracing::info!("synchronization with replica {} succeeded", replica.addr);
        tokio::spawn(self.clone().run_writer(id, stream, rx));
    }

    async fn run_writer(
        self: Arc<Self>,
        id: ReplicaId,
        mut stream: TcpStream,
        mut frames: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = stream.write_all(&frame).await {
                tracing::debug!("write error to replica: {e}");
                break;
            }
        }
        self.drop_replica(id).await;
    }

    /// Periodic liveness, driven by the embedding at [`PING_PERIOD`]:
    /// replicas detect a dead primary by silence, so an idle primary must
    /// keep talking even to peers that are still bootstrapping.
    pub async fn run_pinger(self: Arc<Self>) {
        let mut ticks = tokio::time::interval(PING_PERIOD);
        loop {
            ticks.tick().await;
            self.ping_replicas().await;
        }
    }

    async fn ping_replicas(&self) {
        let mut state = self.state.lock().await;
        let mut dead = Vec::new();
        for replica in state.replicas.iter_mut() {
            match replica.sync_state {
                // mid-transfer sockets carry nothing but the bulk payload
                SyncState::SendBulk => {}
                SyncState::Online => {
                    if !replica.enqueue(Bytes::from_static(b"PING\r\n")) {
                        dead.push(replica.id);
                    }
                }
                SyncState::WaitSaveStart | SyncState::WaitSaveEnd => {
                    // a lone newline refreshes the replica's liveness clock
                    // and, being one byte, cannot short-write
                    if let Some(stream) = replica.stream.as_ref() {
                        let _ = stream.try_write(b"\n");
                    }
                }
            }
        }
        state.replicas.retain(|r| !dead.contains(&r.id));
    }

    async fn drop_replica(&self, id: ReplicaId) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.replicas.iter().position(|r| r.id == id) {
            let replica = state.replicas.remove(pos);
            tracing::debug!("replica {} detached", replica.addr);
        }
    }
}

async fn open_snapshot(path: &std::path::Path) -> Result<(File, u64)> {
    let file = File::open(path).await?;
    let size = file.metadata().await?.len();
    Ok((file, size))
}

async fn run_monitor_writer(mut stream: TcpStream, mut lines: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(line) = lines.recv().await {
        if stream.write_all(&line).await.is_err() {
            break;
        }
    }
}
