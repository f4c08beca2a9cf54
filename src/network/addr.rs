//! Socket addresses and socket construction
//!
//! [`IpAddress`] wraps a [`SocketAddr`] with family-aware equality: an
//! IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) compares and hashes equal to
//! the plain IPv4 address, so peers seen through a dual-stack socket match
//! peers announced with IPv4 addresses.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::error::NetworkError;

/// Address family of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketFamily {
    Ipv4,
    Ipv6,
    /// IPv6 socket that also accepts IPv4 traffic via mapped addresses
    DualStack,
}

/// Family-aware socket address
#[derive(Debug, Clone, Copy)]
pub struct IpAddress(SocketAddr);

impl IpAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The address as given
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// The address with IPv4-mapped IPv6 converted to plain IPv4
    pub fn unmapped(&self) -> SocketAddr {
        unmap(self.0)
    }

    /// Address suitable for sending through a socket of the given family
    pub fn for_family(&self, family: SocketFamily) -> SocketAddr {
        match (family, unmap(self.0)) {
            (SocketFamily::DualStack, SocketAddr::V4(v4)) => SocketAddr::V6(SocketAddrV6::new(
                v4.ip().to_ipv6_mapped(),
                v4.port(),
                0,
                0,
            )),
            (_, addr) => addr,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        unmap(self.0).is_ipv4()
    }

    pub fn is_ipv4_mapped(&self) -> bool {
        match self.0 {
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().is_some(),
            SocketAddr::V4(_) => false,
        }
    }

    pub fn is_loopback(&self) -> bool {
        unmap(self.0).ip().is_loopback()
    }

    pub fn ip(&self) -> IpAddr {
        unmap(self.0).ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

impl PartialEq for IpAddress {
    fn eq(&self, other: &Self) -> bool {
        unmap(self.0) == unmap(other.0)
    }
}

impl Eq for IpAddress {}

impl Hash for IpAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        unmap(self.0).hash(state);
    }
}

impl From<SocketAddr> for IpAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", unmap(self.0))
    }
}

/// Resolve a host name to socket addresses matching the socket family
pub async fn resolve(
    host: &str,
    port: u16,
    family: SocketFamily,
) -> Result<Vec<IpAddress>, NetworkError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::ResolveFailed(format!("{}: {}", host, e)))?;

    let result: Vec<IpAddress> = addrs
        .filter(|addr| match family {
            SocketFamily::Ipv4 => addr.is_ipv4(),
            SocketFamily::Ipv6 | SocketFamily::DualStack => true,
        })
        .map(IpAddress::from)
        .collect();

    if result.is_empty() {
        return Err(NetworkError::ResolveFailed(host.to_string()));
    }
    debug!("Resolved {} to {} address(es)", host, result.len());
    Ok(result)
}

static IGNORE_SIGPIPE: Once = Once::new();

/// Writing to a closed TCP peer must surface as an error, not a signal.
pub fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| {
        #[cfg(unix)]
        // SAFETY: installing SIG_IGN for SIGPIPE has no memory safety implications
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    });
}

fn bind_addr(port: u16, family: SocketFamily) -> SocketAddr {
    match family {
        SocketFamily::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        SocketFamily::Ipv6 | SocketFamily::DualStack => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
        }
    }
}

fn new_socket(
    addr: SocketAddr,
    family: SocketFamily,
    ty: Type,
    protocol: Protocol,
) -> Result<Socket, NetworkError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(family == SocketFamily::Ipv6)?;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Create a UDP socket bound to `port` on all interfaces.
///
/// Falls back to IPv4 when a dual-stack socket cannot be created.
pub fn udp_socket(port: u16, family: SocketFamily) -> Result<std::net::UdpSocket, NetworkError> {
    ignore_sigpipe();
    let addr = bind_addr(port, family);
    let socket = match new_socket(addr, family, Type::DGRAM, Protocol::UDP) {
        Ok(socket) => socket,
        Err(e) if family == SocketFamily::DualStack => {
            warn!("Dual-stack UDP socket unavailable ({}), using IPv4", e);
            return udp_socket(port, SocketFamily::Ipv4);
        }
        Err(e) => return Err(e),
    };
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Create a listening TCP socket bound to `port` on all interfaces
pub fn tcp_listener(
    port: u16,
    family: SocketFamily,
    backlog: i32,
) -> Result<std::net::TcpListener, NetworkError> {
    ignore_sigpipe();
    let addr = bind_addr(port, family);
    let socket = match new_socket(addr, family, Type::STREAM, Protocol::TCP) {
        Ok(socket) => socket,
        Err(e) if family == SocketFamily::DualStack => {
            warn!("Dual-stack TCP socket unavailable ({}), using IPv4", e);
            return tcp_listener(port, SocketFamily::Ipv4, backlog);
        }
        Err(e) => return Err(e),
    };
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Family of a bound socket address
pub fn family_of(local: SocketAddr) -> SocketFamily {
    if local.is_ipv4() {
        SocketFamily::Ipv4
    } else {
        SocketFamily::DualStack
    }
}

/// Receive one datagram, waiting at most `timeout` when given.
///
/// Returns `Ok(None)` when the timeout elapses without data.
pub async fn recv_timeout(
    socket: &UdpSocket,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<Option<(usize, SocketAddr)>, NetworkError> {
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, socket.recv_from(buf)).await {
            Ok(result) => Ok(Some(result?)),
            Err(_) => Ok(None),
        },
        None => Ok(Some(socket.recv_from(buf).await?)),
    }
}

/// Non-loopback addresses of the local network interfaces
pub fn local_addresses(port: u16) -> Vec<IpAddress> {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => ifaces
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(|ip| !ip.is_loopback() && !is_link_local(ip))
            .map(|ip| IpAddress::new(SocketAddr::new(ip, port)))
            .collect(),
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            Vec::new()
        }
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Loopback address for reaching a socket bound to `local`
pub fn loopback_for(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_mapped_address_equality() {
        let v4: SocketAddr = "192.168.1.10:9000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:192.168.1.10]:9000".parse().unwrap();
        assert_eq!(IpAddress::from(v4), IpAddress::from(mapped));

        let mut set = HashSet::new();
        set.insert(IpAddress::from(v4));
        assert!(set.contains(&IpAddress::from(mapped)));
    }

    #[test]
    fn test_different_ports_differ() {
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.1:1001".parse().unwrap();
        assert_ne!(IpAddress::from(a), IpAddress::from(b));
    }

    #[test]
    fn test_for_family() {
        let v4: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let addr = IpAddress::from(v4);
        assert!(addr.for_family(SocketFamily::DualStack).is_ipv6());
        assert!(addr.for_family(SocketFamily::Ipv4).is_ipv4());
        assert!(IpAddress::from(addr.for_family(SocketFamily::DualStack)).is_ipv4_mapped());
    }

    #[test]
    fn test_loopback_for_unspecified() {
        let any: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(loopback_for(any), "127.0.0.1:4000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addrs = resolve("127.0.0.1", 5000, SocketFamily::Ipv4).await.unwrap();
        assert_eq!(addrs[0].port(), 5000);
        assert!(addrs[0].is_loopback());
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let std_socket = udp_socket(0, SocketFamily::Ipv4).unwrap();
        let socket = UdpSocket::from_std(std_socket).unwrap();
        let mut buf = [0u8; 16];
        let result = recv_timeout(&socket, &mut buf, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
