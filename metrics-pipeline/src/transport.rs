//! Outbound connections.
use std::{
    fmt,
    io::{self, Write as _},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs as _, UdpSocket},
    time::Duration,
};

#[cfg(target_os = "linux")]
use std::{
    os::unix::net::{UnixDatagram, UnixStream},
    path::PathBuf,
};

/// A live connection to a backend.
pub trait Connection: Send {
    /// Sets the timeout applied to subsequent writes.
    ///
    /// # Errors
    ///
    /// If the timeout cannot be applied, an error is returned.
    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Writes an entire payload.
    ///
    /// # Errors
    ///
    /// If the payload cannot be written in full, an error is returned and the connection is considered broken.
    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// Establishes connections to a backend.
pub trait Dialer: Send + 'static {
    /// Connection type produced by this dialer.
    type Connection: Connection;

    /// Dials the backend.
    ///
    /// # Errors
    ///
    /// If the backend cannot be reached, an error is returned.
    fn dial(&mut self) -> io::Result<Self::Connection>;

    /// Returns a short identifier for the transport, used in logs and errors.
    fn transport_id(&self) -> &'static str {
        "custom"
    }
}

/// Address of a backend reachable over the network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteAddr {
    /// UDP, given as `<host>:<port>`.
    Udp(Vec<SocketAddr>),

    /// TCP, given as `tcp://<host>:<port>`.
    Tcp(Vec<SocketAddr>),

    /// Unix domain socket in `SOCK_DGRAM` mode, given as `unixgram://<path>`.
    #[cfg(target_os = "linux")]
    Unixgram(PathBuf),

    /// Unix domain socket in `SOCK_STREAM` mode, given as `unix://<path>`.
    #[cfg(target_os = "linux")]
    Unix(PathBuf),
}

impl RemoteAddr {
    /// Returns the transport ID for the remote address.
    ///
    /// This is a simple acronym related to the transport that will be used for the remote address, such as `udp` for
    /// UDP, and so on.
    pub const fn transport_id(&self) -> &'static str {
        match self {
            RemoteAddr::Udp(_) => "udp",
            RemoteAddr::Tcp(_) => "tcp",
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => "uds-stream",
            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(_) => "uds",
        }
    }

    /// Returns `true` if the transport preserves message boundaries.
    pub const fn is_datagram(&self) -> bool {
        match self {
            RemoteAddr::Udp(_) => true,
            RemoteAddr::Tcp(_) => false,
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => false,
            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(_) => true,
        }
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        if let Some((scheme, rest)) = addr.split_once("://") {
            return match scheme {
                "udp" => resolve(rest).map(RemoteAddr::Udp),
                "tcp" => resolve(rest).map(RemoteAddr::Tcp),
                #[cfg(target_os = "linux")]
                "unix" => Ok(RemoteAddr::Unix(PathBuf::from(rest))),
                #[cfg(target_os = "linux")]
                "unixgram" => Ok(RemoteAddr::Unixgram(PathBuf::from(rest))),
                _ => Err(format!("invalid scheme '{}'", scheme)),
            };
        }

        resolve(addr).map(RemoteAddr::Udp)
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddr::Udp(addrs) | RemoteAddr::Tcp(addrs) => match addrs.first() {
                Some(addr) => write!(f, "{}://{}", self.transport_id(), addr),
                None => write!(f, "{}://<unresolved>", self.transport_id()),
            },
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(path) => write!(f, "unixgram://{}", path.display()),
        }
    }
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>, String> {
    let addrs = addr.to_socket_addrs().map_err(|e| e.to_string())?.collect::<Vec<_>>();
    if addrs.is_empty() {
        return Err(format!("'{}' did not resolve to any address", addr));
    }
    Ok(addrs)
}

/// Dials a [`RemoteAddr`] using the standard library's sockets.
#[derive(Clone, Debug)]
pub struct NetDialer {
    addr: RemoteAddr,
    connect_timeout: Duration,
}

impl NetDialer {
    /// Creates a new `NetDialer`.
    ///
    /// `connect_timeout` bounds each TCP connection attempt, and is otherwise unused.
    pub fn new(addr: RemoteAddr, connect_timeout: Duration) -> Self {
        Self { addr, connect_timeout }
    }

    /// Returns the address being dialed.
    pub fn remote_addr(&self) -> &RemoteAddr {
        &self.addr
    }
}

impl Dialer for NetDialer {
    type Connection = NetConnection;

    fn dial(&mut self) -> io::Result<NetConnection> {
        match &self.addr {
            RemoteAddr::Udp(addrs) => {
                let local = match addrs.first() {
                    Some(SocketAddr::V6(_)) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
                    _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(&addrs[..])?;
                Ok(NetConnection::Udp(socket))
            }

            RemoteAddr::Tcp(addrs) => {
                let mut last_error = None;
                for addr in addrs {
                    match TcpStream::connect_timeout(addr, self.connect_timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true)?;
                            return Ok(NetConnection::Tcp(stream));
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to dial")))
            }

            #[cfg(target_os = "linux")]
            RemoteAddr::Unixgram(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                Ok(NetConnection::Unixgram(socket))
            }

            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(path) => UnixStream::connect(path).map(NetConnection::Unix),
        }
    }

    fn transport_id(&self) -> &'static str {
        self.addr.transport_id()
    }
}

/// A socket opened by [`NetDialer`].
#[derive(Debug)]
pub enum NetConnection {
    /// Connected UDP socket.
    Udp(UdpSocket),

    /// TCP stream.
    Tcp(TcpStream),

    /// Connected Unix datagram socket.
    #[cfg(target_os = "linux")]
    Unixgram(UnixDatagram),

    /// Unix stream socket.
    #[cfg(target_os = "linux")]
    Unix(UnixStream),
}

fn check_datagram(sent: usize, payload: &[u8]) -> io::Result<()> {
    if sent == payload.len() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("datagram truncated: sent {} of {} bytes", sent, payload.len()),
        ))
    }
}

impl Connection for NetConnection {
    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = Some(timeout).filter(|t| !t.is_zero());
        match self {
            NetConnection::Udp(socket) => socket.set_write_timeout(timeout),
            NetConnection::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(target_os = "linux")]
            NetConnection::Unixgram(socket) => socket.set_write_timeout(timeout),
            #[cfg(target_os = "linux")]
            NetConnection::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            NetConnection::Udp(socket) => socket.send(payload).and_then(|sent| check_datagram(sent, payload)),
            NetConnection::Tcp(stream) => stream.write_all(payload),
            #[cfg(target_os = "linux")]
            NetConnection::Unixgram(socket) => socket.send(payload).and_then(|sent| check_datagram(sent, payload)),
            #[cfg(target_os = "linux")]
            NetConnection::Unix(stream) => stream.write_all(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read as _,
        net::{TcpListener, UdpSocket},
        time::Duration,
    };

    use super::{Connection as _, Dialer as _, NetDialer, RemoteAddr};

    #[test]
    fn parses_remote_addresses() {
        let udp = RemoteAddr::try_from("127.0.0.1:8125").unwrap();
        assert_eq!(udp.transport_id(), "udp");
        assert!(udp.is_datagram());
        assert_eq!(udp.to_string(), "udp://127.0.0.1:8125");

        let tcp = RemoteAddr::try_from("tcp://127.0.0.1:8126").unwrap();
        assert_eq!(tcp.transport_id(), "tcp");
        assert!(!tcp.is_datagram());

        assert!(RemoteAddr::try_from("ftp://example").is_err());
        assert!(RemoteAddr::try_from("not an address").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_unix_addresses() {
        let stream = RemoteAddr::try_from("unix:///var/run/agent.sock").unwrap();
        assert_eq!(stream, RemoteAddr::Unix("/var/run/agent.sock".into()));
        assert_eq!(stream.transport_id(), "uds-stream");

        let dgram = RemoteAddr::try_from("unixgram:///var/run/agent.sock").unwrap();
        assert_eq!(dgram.transport_id(), "uds");
    }

    #[test]
    fn udp_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let addr = RemoteAddr::try_from(server.local_addr().unwrap().to_string().as_str()).unwrap();

        let mut dialer = NetDialer::new(addr, Duration::from_secs(1));
        let mut conn = dialer.dial().unwrap();
        conn.set_write_timeout(Duration::from_secs(1)).unwrap();
        conn.write_payload(b"hits:1|c\n").unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hits:1|c\n");
    }

    #[test]
    fn tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = format!("tcp://{}", listener.local_addr().unwrap());

        let mut dialer = NetDialer::new(RemoteAddr::try_from(addr.as_str()).unwrap(), Duration::from_secs(1));
        let mut conn = dialer.dial().unwrap();
        conn.write_payload(b"a:1|g\n").unwrap();
        drop(conn);

        let (mut stream, _) = listener.accept().unwrap();
        let mut received = String::new();
        stream.read_to_string(&mut received).unwrap();
        assert_eq!(received, "a:1|g\n");
    }
}
