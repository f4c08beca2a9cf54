//! UDP datagram server for the data plane
//!
//! One socket, one receive loop. In threaded mode the receive task only
//! copies datagrams into a bounded queue and a second task runs the
//! handler, so slow message handling never delays the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use super::addr::{self, IpAddress, SocketFamily};
use super::error::NetworkError;

/// Largest datagram accepted
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Configuration for [`UdpServer`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpServerConfig {
    /// Port to bind (0 picks a free port)
    pub port: u16,
    pub family: SocketFamily,
    /// Decode on a separate task behind a queue
    pub threaded: bool,
    /// Datagrams held in the queue in threaded mode
    pub queue_size: usize,
    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,
}

impl UdpServerConfig {
    pub fn validated(self) -> Self {
        Self {
            queue_size: self.queue_size.max(1),
            recv_buffer_size: self.recv_buffer_size.clamp(512, MAX_DATAGRAM_SIZE),
            ..self
        }
    }
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            family: SocketFamily::DualStack,
            threaded: false,
            queue_size: 1024,
            recv_buffer_size: MAX_DATAGRAM_SIZE,
        }
    }
}

/// Something that came out of the socket
#[derive(Debug)]
pub enum Received<'a> {
    Packet { data: &'a [u8], from: SocketAddr },
    Error(&'a io::Error),
}

/// Receive callback, called on the receiving (or decoding) task
pub type ReceiveHandler = Arc<dyn Fn(Received<'_>) + Send + Sync>;

/// UDP server owning one socket
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: UdpServerConfig,
    stopping: AtomicBool,
    stop: Notify,
    send_wakeup: Arc<Notify>,
}

impl UdpServer {
    /// Bind a new server socket
    pub async fn bind(config: UdpServerConfig) -> Result<Self, NetworkError> {
        let config = config.validated();
        let std_socket = addr::udp_socket(config.port, config.family)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;
        info!("UDP server bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
            send_wakeup: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address family of the bound socket
    pub fn family(&self) -> SocketFamily {
        addr::family_of(self.local_addr)
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Destination address in the form this socket can send to
    fn destination(&self, to: SocketAddr) -> SocketAddr {
        IpAddress::new(to).for_family(self.family())
    }

    /// Send a datagram
    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<usize, NetworkError> {
        let n = self.socket.send_to(data, self.destination(to)).await?;
        trace!("Sent {} bytes to {}", n, to);
        Ok(n)
    }

    /// Send without waiting; fails with `WouldBlock` if the socket is busy
    pub fn try_send_to(&self, data: &[u8], to: SocketAddr) -> Result<usize, NetworkError> {
        Ok(self.socket.try_send_to(data, self.destination(to))?)
    }

    /// Run the receive loop until [`stop`](Self::stop) is called
    pub async fn run(&self, handler: ReceiveHandler) -> Result<(), NetworkError> {
        if self.config.threaded {
            self.run_threaded(handler).await
        } else {
            let mut buf = vec![0u8; self.config.recv_buffer_size];
            loop {
                tokio::select! {
                    _ = self.stop.notified() => break,
                    result = self.socket.recv_from(&mut buf) => {
                        if self.stopping.load(Ordering::Acquire) {
                            break;
                        }
                        match result {
                            Ok((n, from)) => handler(Received::Packet { data: &buf[..n], from }),
                            Err(e) => {
                                debug!("UDP receive error: {}", e);
                                handler(Received::Error(&e));
                            }
                        }
                    }
                }
            }
            debug!("UDP receive loop on {} stopped", self.local_addr);
            Ok(())
        }
    }

    async fn run_threaded(&self, handler: ReceiveHandler) -> Result<(), NetworkError> {
        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(self.config.queue_size);
        let decoder = tokio::spawn(async move {
            while let Some((data, from)) = rx.recv().await {
                handler(Received::Packet { data: &data, from });
            }
        });

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                result = self.socket.recv_from(&mut buf) => {
                    if self.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    match result {
                        Ok((n, from)) => {
                            if tx.try_send((buf[..n].to_vec(), from)).is_err() {
                                warn!("UDP receive queue full, dropping datagram from {}", from);
                            }
                        }
                        Err(e) => debug!("UDP receive error: {}", e),
                    }
                }
            }
        }
        drop(tx);
        let _ = decoder.await;
        debug!("UDP receive loop on {} stopped", self.local_addr);
        Ok(())
    }

    /// Make [`run`](Self::run) return. Safe to call from any thread.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop.notify_one();
        // Wake a receive that is already in progress
        let wakeup = addr::loopback_for(self.local_addr);
        if let Err(e) = self.socket.try_send_to(&[], self.destination(wakeup)) {
            trace!("Wake-up datagram not sent: {}", e);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Wake the send loop because new outgoing data is ready
    pub fn notify(&self) {
        self.send_wakeup.notify_one();
    }

    /// Event the send loop waits on
    pub fn send_wakeup(&self) -> Arc<Notify> {
        self.send_wakeup.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config() -> UdpServerConfig {
        UdpServerConfig {
            family: SocketFamily::Ipv4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bind_and_stop() {
        let server = Arc::new(UdpServer::bind(config()).await.unwrap());
        assert!(server.local_addr().port() > 0);

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.run(Arc::new(|_| {})).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok(), "run loop must return after stop");
    }

    #[tokio::test]
    async fn test_receive_handler() {
        let server = Arc::new(UdpServer::bind(config()).await.unwrap());
        let port = server.local_addr().port();
        let count = Arc::new(AtomicUsize::new(0));

        let runner = server.clone();
        let seen = count.clone();
        let task = tokio::spawn(async move {
            runner
                .run(Arc::new(move |r| {
                    if let Received::Packet { data, .. } = r {
                        if data == b"hello" {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }))
                .await
        });

        let client = UdpServer::bind(config()).await.unwrap();
        let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        for _ in 0..3 {
            client.send_to(b"hello", target).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop();
        task.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_threaded_mode() {
        let server = Arc::new(
            UdpServer::bind(UdpServerConfig {
                threaded: true,
                ..config()
            })
            .await
            .unwrap(),
        );
        let port = server.local_addr().port();
        let count = Arc::new(AtomicUsize::new(0));

        let runner = server.clone();
        let seen = count.clone();
        let task = tokio::spawn(async move {
            runner
                .run(Arc::new(move |r| {
                    if matches!(r, Received::Packet { .. }) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }))
                .await
        });

        let client = UdpServer::bind(config()).await.unwrap();
        let target: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        client.send_to(&[1, 2, 3], target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop();
        task.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
