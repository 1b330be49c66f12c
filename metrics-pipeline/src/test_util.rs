use std::{
    io::{self, Write as _},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

use crate::{
    error::{EncodeError, Error},
    key::MetricKey,
    protocol::Protocol,
    transport::{Connection, Dialer},
};

#[derive(Default)]
struct MemoryState {
    writes: Vec<Vec<u8>>,
    dials: usize,
    failing_dials: usize,
    failing_writes: usize,
    write_timeouts: Vec<Duration>,
}

/// A dialer whose connections record every write in memory.
#[derive(Clone, Default)]
pub struct MemoryDialer {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .flat_map(|w| String::from_utf8_lossy(w).lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    pub fn write_timeouts(&self) -> Vec<Duration> {
        self.state.lock().write_timeouts.clone()
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.state.lock().failing_dials = count;
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }
}

impl Dialer for MemoryDialer {
    type Connection = MemoryConnection;

    fn dial(&mut self) -> io::Result<MemoryConnection> {
        let mut state = self.state.lock();
        state.dials += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        Ok(MemoryConnection { state: Arc::clone(&self.state) })
    }

    fn transport_id(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl Connection for MemoryConnection {
    fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.state.lock().write_timeouts.push(timeout);
        Ok(())
    }

    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.writes.push(payload.to_vec());
        Ok(())
    }
}

/// Encodes jobs as `op:name:value/unix_seconds\n`.
///
/// Metrics named `panic` make the protocol panic, and metrics named `invalid` fail to encode.
pub struct LineProtocol;

impl LineProtocol {
    fn line(sink: &mut Vec<u8>, op: &str, key: &MetricKey, value: f64, ts: SystemTime) -> Result<(), EncodeError> {
        match key.name() {
            "panic" => panic!("protocol exploded"),
            "invalid" => return Err(EncodeError::new("invalid metric")),
            _ => {}
        }
        let secs = ts.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        writeln!(sink, "{}:{}:{}/{}", op, key.name(), value, secs).map_err(|e| EncodeError::new(e.to_string()))
    }
}

impl Protocol for LineProtocol {
    fn write_set(&mut self, sink: &mut Vec<u8>, key: &MetricKey, value: f64, ts: SystemTime) -> Result<(), EncodeError> {
        Self::line(sink, "set", key, value, ts)
    }

    fn write_add(&mut self, sink: &mut Vec<u8>, key: &MetricKey, value: f64, ts: SystemTime) -> Result<(), EncodeError> {
        Self::line(sink, "add", key, value, ts)
    }

    fn write_observe(
        &mut self,
        sink: &mut Vec<u8>,
        key: &MetricKey,
        value: f64,
        ts: SystemTime,
    ) -> Result<(), EncodeError> {
        Self::line(sink, "observe", key, value, ts)
    }
}

/// A failure callback that records every error it is given.
pub fn recording_callback() -> (impl Fn(&Error) + Send + Sync + 'static, Arc<Mutex<Vec<Error>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let callback = {
        let errors = Arc::clone(&errors);
        move |error: &Error| errors.lock().push(error.clone())
    };
    (callback, errors)
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
