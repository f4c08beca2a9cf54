//! TCP server for the control plane
//!
//! Owns the listening socket and a slot table of connected clients. A single
//! loop ([`TcpServer::next_event`]) multiplexes accepting, reading and
//! close bookkeeping; per-connection reader tasks only forward bytes into
//! one channel.
//!
//! Closing a client lingers: the write half is shut down and the read half
//! drained until the peer closes too (or a timeout passes), so that data the
//! peer already sent is not answered with a reset.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::addr::{self, SocketFamily};
use super::error::NetworkError;

/// Identifier the owner assigns to an accepted connection
pub type ClientId = i32;

/// How long a lingering close waits for the peer
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Sleep after running out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Free slots tolerated before the table is compacted
const COMPACT_THRESHOLD: usize = 32;

const READ_BUFFER_SIZE: usize = 8192;
/// Reads queued from all connections before readers wait on the server loop
const EVENT_QUEUE_SIZE: usize = 256;
const LISTEN_BACKLOG: i32 = 128;

/// Something that happened on the server
#[derive(Debug)]
pub enum TcpEvent {
    Accepted { id: ClientId, addr: SocketAddr },
    Data { id: ClientId, data: Vec<u8> },
    /// The peer closed the connection or it failed
    Closed { id: ClientId, error: Option<io::Error> },
}

/// What to do about a failed `accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptAction {
    /// Out of resources; wait and try again
    Retry,
    /// Transient, try again right away
    Ignore,
    /// The listening socket is unusable
    Fatal,
}

/// Classify an accept error
pub fn triage_accept_error(e: &io::Error) -> AcceptAction {
    #[cfg(unix)]
    {
        let exhausted = [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM];
        if e.raw_os_error().is_some_and(|code| exhausted.contains(&code)) {
            return AcceptAction::Retry;
        }
    }
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptAction::Ignore,
        io::ErrorKind::OutOfMemory => AcceptAction::Retry,
        _ => AcceptAction::Fatal,
    }
}

enum ReaderEvent {
    Data(Vec<u8>),
    Closed(Option<io::Error>),
}

struct Slot {
    id: ClientId,
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

struct Lingering {
    id: ClientId,
    deadline: Instant,
    reader: JoinHandle<()>,
}

/// Stops a running [`TcpServer`] from any thread
#[derive(Clone)]
pub struct TcpStopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TcpStopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Accept callback: return an id to keep the connection, `None` to reject it
pub type AcceptFn = Box<dyn FnMut(SocketAddr) -> Option<ClientId> + Send>;

pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    accept: AcceptFn,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<ClientId, usize>,
    lingering: Vec<Lingering>,
    events_tx: mpsc::Sender<(ClientId, ReaderEvent)>,
    events_rx: mpsc::Receiver<(ClientId, ReaderEvent)>,
    stop: TcpStopHandle,
}

impl TcpServer {
    /// Listen on `port`
    pub async fn bind(
        port: u16,
        family: SocketFamily,
        accept: impl FnMut(SocketAddr) -> Option<ClientId> + Send + 'static,
    ) -> Result<Self, NetworkError> {
        let std_listener = addr::tcp_listener(port, family, LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        info!("TCP server listening on {}", local_addr);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        Ok(Self {
            listener,
            local_addr,
            accept: Box::new(accept),
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            lingering: Vec::new(),
            events_tx,
            events_rx,
            stop: TcpStopHandle {
                stopped: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_handle(&self) -> TcpStopHandle {
        self.stop.clone()
    }

    pub fn client_count(&self) -> usize {
        self.index.len()
    }

    pub fn client_addr(&self, id: ClientId) -> Option<SocketAddr> {
        self.slot(id).map(|s| s.addr)
    }

    fn slot(&self, id: ClientId) -> Option<&Slot> {
        let index = *self.index.get(&id)?;
        self.slots.get(index)?.as_ref()
    }

    fn slot_mut(&mut self, id: ClientId) -> Option<&mut Slot> {
        let index = *self.index.get(&id)?;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once the server has been stopped and an error if
    /// the listening socket failed.
    pub async fn next_event(&mut self) -> Result<Option<TcpEvent>, NetworkError> {
        loop {
            if self.stop.is_stopped() {
                self.shutdown();
                return Ok(None);
            }
            let linger_deadline = self.lingering.iter().map(|l| l.deadline).min();

            tokio::select! {
                _ = self.stop.notify.notified() => continue,
                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        if let Some(event) = self.on_accept(stream, addr) {
                            return Ok(Some(event));
                        }
                    }
                    Err(e) => match triage_accept_error(&e) {
                        AcceptAction::Retry => {
                            warn!("accept failed ({}), retrying", e);
                            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        }
                        AcceptAction::Ignore => debug!("accept: {}", e),
                        AcceptAction::Fatal => {
                            error!("TCP server on {} failed: {}", self.local_addr, e);
                            self.stop.stop();
                            self.shutdown();
                            return Err(e.into());
                        }
                    },
                },
                Some((id, event)) = self.events_rx.recv() => {
                    if let Some(event) = self.on_reader_event(id, event) {
                        return Ok(Some(event));
                    }
                }
                _ = sleep_until(linger_deadline), if linger_deadline.is_some() => {
                    self.expire_lingering(Instant::now());
                }
            }
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) -> Option<TcpEvent> {
        let Some(id) = (self.accept)(addr) else {
            debug!("Rejected connection from {}", addr);
            return None;
        };
        if self.index.contains_key(&id) {
            warn!("Client id {} already in use, rejecting {}", id, addr);
            return None;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }

        let (mut read_half, writer) = stream.into_split();
        let tx = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx.send((id, ReaderEvent::Closed(None))).await;
                        break;
                    }
                    Ok(n) => {
                        if tx.send((id, ReaderEvent::Data(buf[..n].to_vec()))).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send((id, ReaderEvent::Closed(Some(e)))).await;
                        break;
                    }
                }
            }
        });

        let slot = Slot {
            id,
            addr,
            writer,
            reader,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, index);
        debug!("Accepted client {} from {}", id, addr);
        Some(TcpEvent::Accepted { id, addr })
    }

    fn on_reader_event(&mut self, id: ClientId, event: ReaderEvent) -> Option<TcpEvent> {
        if let Some(pos) = self.lingering.iter().position(|l| l.id == id) {
            if matches!(event, ReaderEvent::Closed(_)) {
                trace!("Lingering client {} closed", id);
                self.lingering.swap_remove(pos);
            }
            return None;
        }
        match event {
            ReaderEvent::Data(data) => self
                .index
                .contains_key(&id)
                .then_some(TcpEvent::Data { id, data }),
            ReaderEvent::Closed(error) => {
                self.remove_slot(id)?;
                match &error {
                    Some(e) => debug!("Client {} connection error: {}", id, e),
                    None => debug!("Client {} closed the connection", id),
                }
                Some(TcpEvent::Closed { id, error })
            }
        }
    }

    fn remove_slot(&mut self, id: ClientId) -> Option<Slot> {
        let index = self.index.remove(&id)?;
        let slot = self.slots.get_mut(index)?.take();
        self.free.push(index);
        if self.free.len() > COMPACT_THRESHOLD && self.free.len() * 2 > self.slots.len() {
            self.compact();
        }
        slot
    }

    /// Drop free slots and renumber the remaining ones
    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.free.clear();
        self.index.clear();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                self.index.insert(slot.id, i);
            }
        }
        trace!("Compacted client table to {} slots", self.slots.len());
    }

    fn expire_lingering(&mut self, now: Instant) {
        self.lingering.retain(|l| {
            if l.deadline <= now {
                debug!("Lingering close of client {} timed out", l.id);
                l.reader.abort();
                false
            } else {
                true
            }
        });
    }

    /// Send bytes to a client
    pub async fn send(&mut self, id: ClientId, data: &[u8]) -> Result<(), NetworkError> {
        let slot = self.slot_mut(id).ok_or(NetworkError::NotConnected)?;
        slot.writer.write_all(data).await?;
        Ok(())
    }

    /// Close a client connection gracefully. No `Closed` event follows.
    pub async fn close(&mut self, id: ClientId) {
        let Some(mut slot) = self.remove_slot(id) else {
            return;
        };
        if let Err(e) = slot.writer.shutdown().await {
            debug!("Shutdown of client {} failed: {}", id, e);
            slot.reader.abort();
            return;
        }
        self.lingering.push(Lingering {
            id,
            deadline: Instant::now() + LINGER_TIMEOUT,
            reader: slot.reader,
        });
    }

    fn shutdown(&mut self) {
        for slot in self.slots.drain(..).flatten() {
            slot.reader.abort();
        }
        for l in self.lingering.drain(..) {
            l.reader.abort();
        }
        self.free.clear();
        self.index.clear();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}
