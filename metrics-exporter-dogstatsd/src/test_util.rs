use std::{
    net::UdpSocket,
    time::{Duration, Instant},
};

use metrics_pipeline::{NetDialer, RemoteAddr};

/// A UDP socket standing in for the DogStatsD server.
pub struct UdpServer {
    socket: UdpSocket,
}

impl UdpServer {
    pub fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("failed to bind test server");
        socket.set_read_timeout(Some(Duration::from_millis(100))).expect("failed to set read timeout");
        Self { socket }
    }

    pub fn address(&self) -> String {
        self.socket.local_addr().expect("test server has no address").to_string()
    }

    pub fn dialer(&self) -> NetDialer {
        let addr = RemoteAddr::try_from(self.address().as_str()).expect("test server address should parse");
        NetDialer::new(addr, Duration::from_secs(1))
    }

    /// Receives datagrams until `count` lines have arrived, panicking after a few seconds.
    pub fn receive_lines(&self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = vec![0; 65536];
        let mut lines = Vec::new();

        while lines.len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {count} lines, got {lines:?}");
            if let Ok(len) = self.socket.recv(&mut buf) {
                let payload = std::str::from_utf8(&buf[..len]).expect("payload should be utf-8");
                lines.extend(payload.lines().map(str::to_string));
            }
        }

        assert_eq!(lines.len(), count, "received more lines than expected: {lines:?}");
        lines
    }
}
