//! Warcry server (spec.md section 4.10): TCP newline-JSON event
//! fan-out with snapshot-on-connect and a replay ring buffer.

use crate::error::WarlinkError;
use crate::health::HealthMessage;
use crate::plc_manager::PlcManager;
use crate::tagpack::{PackValue, TagPackManager};
use crate::tags::ValueChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 256;
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
const DEFAULT_RING_CAPACITY: usize = 10_000;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Config { namespace: String },
    Snapshot { tags: Vec<ValueChange> },
    Tag(ValueChange),
    Health(HealthMessage),
    Tagpack(PackValue),
    TagList { tags: Vec<String> },
    PackList { packs: Vec<String> },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    ListTags,
    ListPacks,
    GetConfig,
    Replay { since: String },
}

fn encode<T: Serialize>(message: &T) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(message).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

struct RingEntry {
    ts_nanos: i64,
    payload: Arc<Vec<u8>>,
}

/// Fixed-capacity circular buffer of raw wire frames. On overwrite the
/// oldest entry is dropped.
struct RingBuffer {
    capacity: usize,
    entries: VecDeque<RingEntry>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingBuffer { capacity, entries: VecDeque::with_capacity(capacity) }
    }

    fn push(&mut self, ts_nanos: i64, payload: Arc<Vec<u8>>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RingEntry { ts_nanos, payload });
    }

    /// Entries strictly newer than `since_nanos`, in age order.
    fn since(&self, since_nanos: i64) -> Vec<Arc<Vec<u8>>> {
        self.entries.iter().filter(|e| e.ts_nanos > since_nanos).map(|e| e.payload.clone()).collect()
    }
}

struct ClientHandle {
    sender: mpsc::Sender<Arc<Vec<u8>>>,
}

struct Inner {
    clients: HashMap<u64, ClientHandle>,
    ring: RingBuffer,
}

pub struct WarcryServer {
    namespace: String,
    plc_manager: PlcManager,
    tagpack_manager: Arc<TagPackManager>,
    inner: Mutex<Inner>,
    next_client_id: AtomicU64,
    has_clients: AtomicBool,
}

impl WarcryServer {
    pub fn new(namespace: impl Into<String>, plc_manager: PlcManager, tagpack_manager: Arc<TagPackManager>, ring_capacity: usize) -> Self {
        let ring_capacity = if ring_capacity == 0 { DEFAULT_RING_CAPACITY } else { ring_capacity };
        WarcryServer {
            namespace: namespace.into(),
            plc_manager,
            tagpack_manager,
            inner: Mutex::new(Inner { clients: HashMap::new(), ring: RingBuffer::new(ring_capacity) }),
            next_client_id: AtomicU64::new(1),
            has_clients: AtomicBool::new(false),
        }
    }

    /// Fast check so a caller can skip serialization entirely when no
    /// client is attached.
    pub fn has_clients(&self) -> bool {
        self.has_clients.load(Ordering::Relaxed)
    }

    pub async fn run(self: Arc<Self>, addr: &str, shutdown: watch::Receiver<bool>) -> Result<(), WarlinkError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| WarlinkError::Protocol(format!("warcry bind {addr}: {e}")))?;
        info!(addr, "warcry server listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            let client_shutdown = shutdown.clone();
                            tokio::spawn(async move { server.handle_client(stream, peer, client_shutdown).await; });
                        }
                        Err(err) => warn!(error = %err, "warcry accept failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn handle_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        {
            let mut inner = self.inner.lock().await;
            inner.clients.insert(id, ClientHandle { sender: tx.clone() });
            self.has_clients.store(true, Ordering::Relaxed);
        }

        let config_msg = encode(&ServerMessage::Config { namespace: self.namespace.clone() });
        let snapshot_msg = encode(&ServerMessage::Snapshot { tags: self.plc_manager.get_all_current_values() });
        if tx.send(Arc::new(config_msg)).await.is_err() || tx.send(Arc::new(snapshot_msg)).await.is_err() {
            self.remove_client(id).await;
            return;
        }

        let writer = tokio::spawn(Self::write_loop(write_half, rx, shutdown.clone()));
        let reader_server = Arc::clone(&self);
        let reader = tokio::spawn(async move { reader_server.read_loop(id, read_half, tx).await; });

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
            _ = shutdown.changed() => {}
        }
        self.remove_client(id).await;
        debug!(client = id, peer = %peer, "warcry client disconnected");
    }

    async fn remove_client(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        inner.clients.remove(&id);
        if inner.clients.is_empty() {
            self.has_clients.store(false, Ordering::Relaxed);
        }
    }

    async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Arc<Vec<u8>>>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe_payload = rx.recv() => {
                    let Some(payload) = maybe_payload else { break };
                    match timeout(WRITE_DEADLINE, write_half.write_all(&payload)).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn read_loop(&self, client_id: u64, read_half: OwnedReadHalf, tx: mpsc::Sender<Arc<Vec<u8>>>) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ClientRequest>(&line) {
                        Ok(request) => self.handle_request(&tx, request).await,
                        Err(err) => debug!(client = client_id, error = %err, "malformed warcry request, skipped"),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(client = client_id, error = %err, "warcry read error");
                    break;
                }
            }
        }
    }

    async fn handle_request(&self, tx: &mpsc::Sender<Arc<Vec<u8>>>, request: ClientRequest) {
        match request {
            ClientRequest::ListTags => {
                let tags = self.plc_manager.get_all_current_values().into_iter().map(|c| format!("{}.{}", c.plc_name, c.tag_name)).collect();
                let _ = tx.send(Arc::new(encode(&ServerMessage::TagList { tags }))).await;
            }
            ClientRequest::ListPacks => {
                let packs = self.tagpack_manager.pack_names();
                let _ = tx.send(Arc::new(encode(&ServerMessage::PackList { packs }))).await;
            }
            ClientRequest::GetConfig => {
                let _ = tx.send(Arc::new(encode(&ServerMessage::Config { namespace: self.namespace.clone() }))).await;
            }
            ClientRequest::Replay { since } => {
                let Ok(since_ts) = DateTime::parse_from_rfc3339(&since) else { return };
                let since_nanos = since_ts.with_timezone(&Utc).timestamp_nanos_opt().unwrap_or(0);
                let entries = {
                    let inner = self.inner.lock().await;
                    inner.ring.since(since_nanos)
                };
                for entry in entries {
                    if tx.send(entry).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn fan_out(&self, payload: Arc<Vec<u8>>) {
        let mut inner = self.inner.lock().await;
        inner.ring.push(now_nanos(), payload.clone());
        for client in inner.clients.values() {
            let _ = client.sender.try_send(payload.clone());
        }
    }

    pub async fn broadcast_tag(&self, change: ValueChange) {
        if !self.has_clients() {
            return;
        }
        self.fan_out(Arc::new(encode(&ServerMessage::Tag(change)))).await;
    }

    pub async fn broadcast_health(&self, health: HealthMessage) {
        if !self.has_clients() {
            return;
        }
        self.fan_out(Arc::new(encode(&ServerMessage::Health(health)))).await;
    }

    pub async fn broadcast_tagpack(&self, pack: PackValue) {
        if !self.has_clients() {
            return;
        }
        self.fan_out(Arc::new(encode(&ServerMessage::Tagpack(pack)))).await;
    }
}
