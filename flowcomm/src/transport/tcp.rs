//! TCP mesh transport.
//!
//! Every pair of workers shares one connection. The worker with the higher
//! id connects and writes its id (`i32` LE) as a handshake. Frames carry
//! `[edge: i32 LE][len: u32 LE][payload]`. Writer and reader tasks run on
//! the tokio runtime; [`Channel::progress`] only polls their results, so the
//! engine above stays single-threaded and non-blocking.
//!
//! Each peer may have at most the queue depth of received frames waiting
//! for `progress`. A reader holding that many stops reading its socket, so
//! TCP flow control pushes back on the sending worker.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use super::{BufferPool, Channel, ChannelListener, ChannelMessage, SendHandle};
use crate::error::{CommError, Result};
use crate::types::{EdgeId, WorkerId};

/// Largest frame a reader accepts before dropping the connection.
const MAX_TCP_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Messages queued per peer before `send_message` rejects, and received
/// frames buffered per peer before its socket stops being read.
pub const DEFAULT_PEER_QUEUE_DEPTH: usize = 64;

type Inbound = Arc<Mutex<HashMap<(WorkerId, EdgeId), VecDeque<Vec<u8>>>>>;
type Fatal = Arc<Mutex<Option<String>>>;

struct Outbound {
    edge: EdgeId,
    frames: Vec<Vec<u8>>,
    handle: SendHandle,
    listener: Arc<dyn ChannelListener>,
}

struct Completion {
    listener: Arc<dyn ChannelListener>,
    edge: EdgeId,
    handle: SendHandle,
}

struct Registration {
    listener: Arc<dyn ChannelListener>,
    pool: Arc<BufferPool>,
}

pub struct TcpChannel {
    worker: WorkerId,
    peers: HashMap<WorkerId, mpsc::Sender<Outbound>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    inbound: Inbound,
    /// Read credits per peer; one is spent per frame buffered in `inbound`.
    credits: HashMap<WorkerId, Arc<Semaphore>>,
    queue_depth: usize,
    receives: Mutex<BTreeMap<(WorkerId, EdgeId), Registration>>,
    released: Mutex<BTreeSet<EdgeId>>,
    fatal: Fatal,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpChannel {
    /// Connect `worker` to every entry of `peers`.
    ///
    /// Dials peers with a lower id and accepts the rest on `listener`.
    /// Must run inside a tokio runtime; the connection tasks stay on it.
    pub async fn establish(
        worker: WorkerId,
        listener: TcpListener,
        peers: HashMap<WorkerId, SocketAddr>,
    ) -> Result<Self> {
        Self::establish_with_queue_depth(worker, listener, peers, DEFAULT_PEER_QUEUE_DEPTH).await
    }

    pub async fn establish_with_queue_depth(
        worker: WorkerId,
        listener: TcpListener,
        peers: HashMap<WorkerId, SocketAddr>,
        queue_depth: usize,
    ) -> Result<Self> {
        let mut streams: HashMap<WorkerId, TcpStream> = HashMap::new();

        for (&peer, addr) in peers.iter().filter(|&(&p, _)| p < worker) {
            let mut stream = TcpStream::connect(addr).await.map_err(|e| {
                CommError::transport_with_source(format!("connect to worker {peer} at {addr}"), e)
            })?;
            stream.set_nodelay(true)?;
            stream.write_all(&worker.to_le_bytes()).await?;
            streams.insert(peer, stream);
        }

        let expected = peers.keys().filter(|&&p| p > worker).count();
        for _ in 0..expected {
            let (mut stream, addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let mut id = [0u8; 4];
            stream.read_exact(&mut id).await?;
            let peer = WorkerId::from_le_bytes(id);
            if !peers.contains_key(&peer) || peer <= worker || streams.contains_key(&peer) {
                return Err(CommError::transport(format!(
                    "unexpected handshake from worker {peer} at {addr}"
                )));
            }
            tracing::debug!(worker, peer, %addr, "accepted peer connection");
            streams.insert(peer, stream);
        }

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let inbound: Inbound = Arc::default();
        let fatal: Fatal = Arc::default();
        let queue_depth = queue_depth.max(1);
        let mut senders = HashMap::new();
        let mut credits = HashMap::new();
        let mut tasks = Vec::new();

        for (peer, stream) in streams {
            let (reader, writer) = stream.into_split();
            let (tx, rx) = mpsc::channel(queue_depth);
            senders.insert(peer, tx);
            let peer_credits = Arc::new(Semaphore::new(queue_depth));
            credits.insert(peer, Arc::clone(&peer_credits));
            tasks.push(tokio::spawn(write_loop(
                writer,
                rx,
                completions_tx.clone(),
                Arc::clone(&fatal),
            )));
            tasks.push(tokio::spawn(recv_loop(
                reader,
                peer,
                Arc::clone(&inbound),
                peer_credits,
                Arc::clone(&fatal),
            )));
        }

        Ok(Self {
            worker,
            peers: senders,
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            inbound,
            credits,
            queue_depth,
            receives: Mutex::new(BTreeMap::new()),
            released: Mutex::new(BTreeSet::new()),
            fatal,
            tasks,
        })
    }

    /// Peers this channel holds a connection to.
    pub fn peers(&self) -> Vec<WorkerId> {
        let mut peers: Vec<_> = self.peers.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// Received frames not yet handed to a listener.
    pub fn buffered_frames(&self) -> usize {
        let inbound = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
        inbound.values().map(VecDeque::len).sum()
    }

    fn pop_frame(&self, from: WorkerId, edge: EdgeId) -> Option<Vec<u8>> {
        let frame = {
            let mut inbound = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
            inbound.get_mut(&(from, edge))?.pop_front()
        };
        if frame.is_some() {
            self.return_credits(from, 1);
        }
        frame
    }

    fn return_credits(&self, from: WorkerId, n: usize) {
        if let Some(credits) = self.credits.get(&from) {
            credits.add_permits(n);
        }
    }

    /// Drop frames that arrived for released edges.
    fn discard_released(&self) {
        let released = self.released.lock().unwrap_or_else(|p| p.into_inner());
        if released.is_empty() {
            return;
        }
        let mut dropped: Vec<(WorkerId, EdgeId, usize)> = Vec::new();
        {
            let mut inbound = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
            for (&(from, edge), frames) in inbound.iter_mut() {
                if released.contains(&edge) && !frames.is_empty() {
                    dropped.push((from, edge, std::mem::take(frames).len()));
                }
            }
        }
        for (from, edge, n) in dropped {
            tracing::warn!(edge, worker = self.worker, from, dropped = n, "dropped frames for released edge");
            self.return_credits(from, n);
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Build a fully connected mesh of `n` workers on loopback.
pub async fn tcp_mesh_local(n: usize) -> Result<Vec<Arc<TcpChannel>>> {
    tcp_mesh_local_with_queue_depth(n, DEFAULT_PEER_QUEUE_DEPTH).await
}

pub async fn tcp_mesh_local_with_queue_depth(
    n: usize,
    queue_depth: usize,
) -> Result<Vec<Arc<TcpChannel>>> {
    let mut listeners = Vec::with_capacity(n);
    let mut addrs = HashMap::new();
    for w in 0..n as WorkerId {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        addrs.insert(w, listener.local_addr()?);
        listeners.push(listener);
    }

    let mut pending = Vec::with_capacity(n);
    for (w, listener) in listeners.into_iter().enumerate() {
        let w = w as WorkerId;
        let mut peers = addrs.clone();
        peers.remove(&w);
        pending.push(tokio::spawn(TcpChannel::establish_with_queue_depth(
            w,
            listener,
            peers,
            queue_depth,
        )));
    }

    let mut channels = Vec::with_capacity(n);
    for handle in pending {
        let channel = handle
            .await
            .map_err(|e| CommError::transport_with_source("mesh setup task failed", e))??;
        channels.push(Arc::new(channel));
    }
    Ok(channels)
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    completions: mpsc::UnboundedSender<Completion>,
    fatal: Fatal,
) {
    while let Some(out) = rx.recv().await {
        for frame in &out.frames {
            if let Err(e) = write_frame(&mut writer, out.edge, frame).await {
                park(&fatal, format!("tcp write on edge {}: {e}", out.edge));
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            park(&fatal, format!("tcp flush: {e}"));
            return;
        }
        let _ = completions.send(Completion {
            listener: out.listener,
            edge: out.edge,
            handle: out.handle,
        });
    }
}

async fn write_frame(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    edge: EdgeId,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&edge.to_le_bytes());
    header[4..].copy_from_slice(&(data.len() as u32).to_le_bytes());
    writer.write_all(&header).await?;
    writer.write_all(data).await
}

async fn recv_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    peer: WorkerId,
    inbound: Inbound,
    credits: Arc<Semaphore>,
    fatal: Fatal,
) {
    let mut header = [0u8; 8];
    loop {
        match credits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }
        if let Err(e) = reader.read_exact(&mut header).await {
            tracing::debug!(peer, "tcp recv loop ended: {e}");
            return;
        }
        let edge = EdgeId::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_TCP_FRAME_SIZE {
            tracing::warn!(peer, len, "tcp frame too large, closing connection");
            park(&fatal, format!("frame of {len} bytes from worker {peer}"));
            return;
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut payload).await {
            park(&fatal, format!("tcp read from worker {peer}: {e}"));
            return;
        }
        inbound
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry((peer, edge))
            .or_default()
            .push_back(payload);
    }
}

fn park(fatal: &Fatal, message: String) {
    tracing::warn!("{message}");
    let mut slot = fatal.lock().unwrap_or_else(|p| p.into_inner());
    slot.get_or_insert(message);
}

impl Channel for TcpChannel {
    fn worker(&self) -> WorkerId {
        self.worker
    }

    fn send_message(
        &self,
        target: WorkerId,
        edge: EdgeId,
        message: &ChannelMessage,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<bool> {
        let frames: Vec<Vec<u8>> = message
            .buffers
            .iter()
            .map(|b| b.as_slice().to_vec())
            .collect();

        if target == self.worker {
            {
                let mut inbound = self.inbound.lock().unwrap_or_else(|p| p.into_inner());
                let queue = inbound.entry((target, edge)).or_default();
                if !queue.is_empty() && queue.len() + frames.len() > self.queue_depth {
                    return Ok(false);
                }
                queue.extend(frames);
            }
            self.completions_tx
                .send(Completion {
                    listener,
                    edge,
                    handle: message.handle,
                })
                .map_err(|_| CommError::transport("completion queue closed"))?;
            return Ok(true);
        }

        let peer = self
            .peers
            .get(&target)
            .ok_or_else(|| CommError::transport(format!("no connection to worker {target}")))?;
        match peer.try_send(Outbound {
            edge,
            frames,
            handle: message.handle,
            listener,
        }) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommError::transport(format!(
                "connection to worker {target} closed"
            ))),
        }
    }

    fn receive_message(
        &self,
        from: WorkerId,
        edge: EdgeId,
        listener: Arc<dyn ChannelListener>,
        pool: Arc<BufferPool>,
    ) -> Result<()> {
        self.released
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&edge);
        self.receives
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((from, edge), Registration { listener, pool });
        Ok(())
    }

    fn release_receive(&self, edge: EdgeId) {
        self.receives
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(_, e), _| *e != edge);
        self.released
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(edge);
        self.discard_released();
    }

    fn progress(&self) -> Result<()> {
        if let Some(message) = self
            .fatal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
        {
            return Err(CommError::transport(message));
        }

        let mut done = Vec::new();
        {
            let mut rx = self.completions_rx.lock().unwrap_or_else(|p| p.into_inner());
            while let Ok(c) = rx.try_recv() {
                done.push(c);
            }
        }
        for c in done {
            c.listener.on_send_complete(c.edge, c.handle);
        }
        self.discard_released();

        let receives: Vec<_> = self
            .receives
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(&(from, edge), r)| (from, edge, r.listener.clone(), r.pool.clone()))
            .collect();

        for (from, edge, listener, pool) in receives {
            while let Some(mut buffer) = pool.acquire() {
                let Some(frame) = self.pop_frame(from, edge) else {
                    pool.release(buffer)?;
                    break;
                };
                if frame.len() > buffer.capacity() {
                    pool.release(buffer)?;
                    return Err(CommError::transport(format!(
                        "frame of {} bytes from worker {from} exceeds receive buffer of {}",
                        frame.len(),
                        pool.buffer_size()
                    )));
                }
                buffer.append(&frame);
                listener.on_receive_complete(from, edge, buffer);
            }
        }
        Ok(())
    }
}
