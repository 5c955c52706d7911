//! Socket seam for the transport
//!
//! The trunk core never touches sockets directly: it performs nonblocking
//! reads and writes through [`LinkIo`] and obtains fresh links from a
//! [`LinkFactory`] when (re)connecting. The tokio-based worker multiplexes
//! readiness through the `poll_*_ready` hooks. [`UdpLink`] is the stock
//! implementation for connected UDP sockets.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::task::{Context, Poll};
use tokio::net::UdpSocket;

/// Nonblocking I/O over one connected socket
pub trait LinkIo: Send + Sync {
    /// Readiness hook for writing; registers the waker when pending
    fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Readiness hook for reading; registers the waker when pending
    fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Nonblocking send; `WouldBlock` means backpressure, not failure
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Nonblocking receive of one datagram (or stream chunk)
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Stop the receive direction; used in replicate mode where replies
    /// are never read
    fn set_write_only(&mut self) -> io::Result<()>;

    /// Tear the link down; further I/O is a programmer error
    fn shutdown(&mut self);

    /// Remote address, for logging
    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

/// Produces connected links for the trunk's pool
pub trait LinkFactory: Send + Sync {
    /// Open a new nonblocking link. The connect is issued but need not
    /// have completed; the trunk waits for write readiness.
    fn connect(&self) -> io::Result<Box<dyn LinkIo>>;
}

/// Transient send failures that cost one request but leave the connection
/// alone. `WouldBlock` is handled separately as backpressure. `ENOBUFS`
/// has no stable `io::ErrorKind`, so it is matched on the raw errno.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    err.raw_os_error() == Some(libc::ENOBUFS)
}

/// A connected UDP socket
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpLink {
    /// Bind and connect a nonblocking UDP socket.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect(peer: SocketAddr, local: Option<SocketAddr>) -> io::Result<Self> {
        let local = local.unwrap_or_else(|| match peer.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        });

        let socket = std::net::UdpSocket::bind(local)?;
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket)?;

        Ok(UdpLink { socket, peer })
    }
}

impl LinkIo for UdpLink {
    fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_send_ready(cx)
    }

    fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_recv_ready(cx)
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.try_send(buf)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.try_recv(buf)
    }

    fn set_write_only(&mut self) -> io::Result<()> {
        // UDP has no half-close; the trunk simply stops polling reads.
        Ok(())
    }

    fn shutdown(&mut self) {
        // Dropping the socket closes the descriptor.
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Factory for [`UdpLink`]s to a fixed destination
pub struct UdpLinkFactory {
    peer: SocketAddr,
    local: Option<SocketAddr>,
}

impl UdpLinkFactory {
    pub fn new(peer: SocketAddr) -> Self {
        UdpLinkFactory { peer, local: None }
    }

    pub fn with_local(peer: SocketAddr, local: SocketAddr) -> Self {
        UdpLinkFactory {
            peer,
            local: Some(local),
        }
    }
}

impl LinkFactory for UdpLinkFactory {
    fn connect(&self) -> io::Result<Box<dyn LinkIo>> {
        Ok(Box::new(UdpLink::connect(self.peer, self.local)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_link_roundtrip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut link = UdpLink::connect(server_addr, None).unwrap();
        assert_eq!(link.peer(), Some(server_addr));

        let sent = link.try_send(b"ping").unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", from).await.unwrap();
        // Wait until the reply is readable, then read it nonblocking.
        let mut reply = [0u8; 16];
        let n = loop {
            match link.try_recv(&mut reply) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::task::yield_now().await;
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        };
        assert_eq!(&reply[..n], b"pong");
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::OutOfMemory)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_transient(&io::Error::from(
            io::ErrorKind::ConnectionRefused
        )));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EPIPE)));
    }
}
