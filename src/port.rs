use crate::retry::retry;
use crate::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Hands out ports the OS considers free by binding to port 0.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }

    /// Binds a reusable socket to port 0 on the allocator's host.
    ///
    /// The socket stays open until the returned [`BoundPort`] is released or
    /// dropped; release it before another process binds the port. Another
    /// program may grab the port in between, the window is kept as short as
    /// the caller allows.
    pub fn acquire(&self) -> io::Result<BoundPort> {
        let domain = match self.host {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::new(self.host, 0).into())?;

        let addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bound socket has no inet address"))?;

        debug!("reserved port {}", addr.port());
        Ok(BoundPort { socket, addr })
    }

    /// Acquires a port and releases it right away, returning its number.
    pub fn free_port(&self) -> io::Result<u16> {
        Ok(self.acquire()?.release())
    }

    /// Retries a TCP connect to `addr` until something accepts or `timeout` is spent.
    pub async fn wait_for_listener(
        addr: SocketAddr,
        timeout: Duration,
        initial_delay: Duration,
    ) -> Result<()> {
        retry(&format!("listener on {}", addr), timeout, initial_delay, || async move {
            TcpStream::connect(addr).await.map(|_| true)
        })
        .await
    }
}

/// A port held by an open socket until released.
#[derive(Debug)]
pub struct BoundPort {
    socket: Socket,
    addr: SocketAddr,
}

impl BoundPort {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Closes the socket and returns the port number.
    pub fn release(self) -> u16 {
        let port = self.port();
        drop(self.socket);
        port
    }
}

/// Network address handed to example programs: `host:port/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: IpAddr,
    pub port: u16,
    pub path: String,
}

impl BrokerAddress {
    pub fn new(host: IpAddr, port: u16, path: impl Into<String>) -> Self {
        Self {
            host,
            port,
            path: path.into(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `SocketAddr` brackets IPv6 hosts.
        write!(f, "{}/{}", self.socket_addr(), self.path)
    }
}
