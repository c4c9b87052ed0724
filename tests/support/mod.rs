//! Shared fixture for the end-to-end tests: a small in-memory engine and
//! the minimal front-end wiring a real server would provide around the
//! replication controllers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use emberkv_replication::protocol::CommandArg;
use emberkv_replication::{
    Engine, LinkState, Primary, PrimaryAddr, ReplicaHandle, ReplicaWorker, ReplicationConfig,
    SnapshotJob,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub type Dataset = BTreeMap<u32, BTreeMap<Vec<u8>, Vec<u8>>>;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Multi-database key-value store with a serializable snapshot, enough to
/// stand in for the real engine. Saves can be held open or made to fail
/// so tests can observe replicas in the waiting states.
pub struct MemoryEngine {
    dbs: Mutex<Dataset>,
    save_gate: watch::Sender<bool>,
    fail_saves: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        let (save_gate, _) = watch::channel(true);
        Arc::new(Self {
            dbs: Mutex::new(Dataset::new()),
            save_gate,
            fail_saves: AtomicBool::new(false),
        })
    }

    pub fn set(&self, db: u32, key: &[u8], value: &[u8]) {
        self.dbs
            .lock()
            .unwrap()
            .entry(db)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
    }

    pub fn get(&self, db: u32, key: &[u8]) -> Option<Vec<u8>> {
        self.dbs.lock().unwrap().get(&db)?.get(key).cloned()
    }

    pub fn dataset(&self) -> Dataset {
        self.dbs.lock().unwrap().clone()
    }

    /// While held, snapshot jobs capture their view but do not finish.
    pub fn hold_saves(&self, hold: bool) {
        self.save_gate.send_replace(!hold);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

fn serialize(data: &Dataset) -> Vec<u8> {
    let mut out = Vec::new();
    for (db, entries) in data {
        for (key, value) in entries {
            out.extend_from_slice(format!("{db} {} {}\n", key.len(), value.len()).as_bytes());
            out.extend_from_slice(key);
            out.extend_from_slice(value);
        }
    }
    out
}

fn deserialize(bytes: &[u8]) -> anyhow::Result<Dataset> {
    let mut data = Dataset::new();
    let mut at = 0;
    while at < bytes.len() {
        let nl = bytes[at..]
            .iter()
            .position(|&b| b == b'\n')
            .context("truncated entry header")?
            + at;
        let header = std::str::from_utf8(&bytes[at..nl])?;
        let mut parts = header.split(' ');
        let db: u32 = parts.next().context("missing db")?.parse()?;
        let key_len: usize = parts.next().context("missing key len")?.parse()?;
        let value_len: usize = parts.next().context("missing value len")?.parse()?;
        at = nl + 1;
        anyhow::ensure!(at + key_len + value_len <= bytes.len(), "truncated entry");
        let key = bytes[at..at + key_len].to_vec();
        at += key_len;
        let value = bytes[at..at + value_len].to_vec();
        at += value_len;
        data.entry(db).or_default().insert(key, value);
    }
    Ok(data)
}

#[async_trait::async_trait]
impl Engine for MemoryEngine {
    async fn flush_all(&self) {
        self.dbs.lock().unwrap().clear();
    }

    async fn load_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(path).await?;
        *self.dbs.lock().unwrap() = deserialize(&bytes)?;
        Ok(())
    }

    fn begin_snapshot(&self) -> anyhow::Result<Box<dyn SnapshotJob>> {
        Ok(Box::new(MemorySnapshotJob {
            data: self.dbs.lock().unwrap().clone(),
            gate: self.save_gate.subscribe(),
            fail: self.fail_saves.load(Ordering::SeqCst),
        }))
    }

    async fn apply(&self, db: u32, argv: Vec<Bytes>) -> anyhow::Result<()> {
        let name = argv.first().context("empty command")?;
        if name.eq_ignore_ascii_case(b"SET") {
            anyhow::ensure!(argv.len() == 3, "SET arity");
            self.set(db, &argv[1], &argv[2]);
        } else if name.eq_ignore_ascii_case(b"DEL") {
            anyhow::ensure!(argv.len() == 2, "DEL arity");
            if let Some(entries) = self.dbs.lock().unwrap().get_mut(&db) {
                entries.remove(&argv[1][..]);
            }
        } else {
            anyhow::bail!("unexpected command {name:?} in replication stream");
        }
        Ok(())
    }
}

struct MemorySnapshotJob {
    data: Dataset,
    gate: watch::Receiver<bool>,
    fail: bool,
}

#[async_trait::async_trait]
impl SnapshotJob for MemorySnapshotJob {
    async fn write(mut self: Box<Self>, path: &Path) -> anyhow::Result<()> {
        while !*self.gate.borrow() {
            self.gate.changed().await?;
        }
        if self.fail {
            anyhow::bail!("no space left on device");
        }
        tokio::fs::write(path, serialize(&self.data)).await?;
        Ok(())
    }
}

pub struct PrimaryNode {
    pub engine: Arc<MemoryEngine>,
    pub primary: Arc<Primary>,
    pub addr: SocketAddr,
    _dir: tempfile::TempDir,
}

impl PrimaryNode {
    /// Execute a write locally and propagate it, the way the dispatcher
    /// does for every mutating command.
    pub async fn set(&self, db: u32, key: &str, value: &str) {
        self.engine.set(db, key.as_bytes(), value.as_bytes());
        self.primary
            .feed_replicas(
                db,
                &[
                    CommandArg::bulk("SET"),
                    CommandArg::from(key),
                    CommandArg::from(value),
                ],
            )
            .await;
    }

    pub async fn attached_replicas(&self) -> usize {
        self.primary.replica_states().await.len()
    }
}

/// Bind a primary node on a loopback port with a minimal accept loop that
/// hands `SYNC` connections over to the replication controller.
pub async fn start_primary() -> PrimaryNode {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::new();
    let primary = Primary::new(engine.clone(), dir.path().join("dump.rdb"), None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = primary.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_connection(acceptor.clone(), stream, peer));
        }
    });
    PrimaryNode {
        engine,
        primary,
        addr,
        _dir: dir,
    }
}

async fn serve_connection(primary: Arc<Primary>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let Ok(line) = read_request_line(&mut stream).await else {
            return;
        };
        let line = line.trim().to_ascii_uppercase();
        if line.starts_with("AUTH") {
            if stream.write_all(b"+OK\r\n").await.is_err() {
                return;
            }
        } else if line == "SYNC" {
            // the reply queue of this connection is empty by construction
            let _ = primary.clone().handle_sync(stream, peer).await;
            return;
        } else {
            return;
        }
    }
}

/// Read one request line without consuming anything past the newline.
pub async fn read_request_line(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if stream.read(&mut byte).await? == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

pub struct ReplicaNode {
    pub engine: Arc<MemoryEngine>,
    pub handle: ReplicaHandle,
    pub dir: tempfile::TempDir,
}

pub fn start_replica(primary: SocketAddr) -> ReplicaNode {
    start_replica_with_auth(primary, None)
}

pub fn start_replica_with_auth(primary: SocketAddr, auth: Option<&str>) -> ReplicaNode {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = MemoryEngine::new();
    let config = ReplicationConfig {
        dump_path: dir.path().join("dump.rdb"),
        primary: Some(PrimaryAddr::new(primary.ip().to_string(), primary.port())),
        primary_auth: auth.map(str::to_owned),
        ..Default::default()
    };
    let (worker, handle) = ReplicaWorker::new(engine.clone(), config);
    tokio::spawn(worker.run());
    ReplicaNode {
        engine,
        handle,
        dir,
    }
}

pub async fn wait_for_link(handle: &ReplicaHandle, want: LinkState) {
    let mut watch = handle.link_watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        while *watch.borrow_and_update() != want {
            watch.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("link never reached {want:?}"));
}

pub async fn wait_for_value(engine: &MemoryEngine, db: u32, key: &str, want: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if engine.get(db, key.as_bytes()).as_deref() == Some(want.as_bytes()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("db {db} key {key} never became {want}"));
}

pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
