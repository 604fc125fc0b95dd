//! Shared test harness: scripted transport, fake commander and recording
//! observer.

#![allow(dead_code)]

use async_trait::async_trait;
use instrument_bridge::commander::Commander;
use instrument_bridge::config::PortSettings;
use instrument_bridge::error::{Error, Result};
use instrument_bridge::observer::{ControlMeta, DeviceInfo, Observer};
use instrument_bridge::transport::{ByteStream, Transport};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

pub fn port_settings(port: &str) -> PortSettings {
    PortSettings {
        name: "sample".into(),
        port: port.into(),
        protocol: "scpi".into(),
        ..Default::default()
    }
}

/// Device-side stream wrapper supporting error injection and close
/// detection.
struct TestStream {
    inner: DuplexStream,
    closed: Arc<AtomicBool>,
    fail_next: Arc<Mutex<Option<io::Error>>>,
}

impl TestStream {
    fn take_error(&self) -> Option<io::Error> {
        self.fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for TestStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl AsyncRead for TestStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = self.take_error() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.take_error() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Test side of one scripted connection.
pub struct Peer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    closed: Arc<AtomicBool>,
    fail_next: Arc<Mutex<Option<io::Error>>>,
    line_ending: String,
}

impl Peer {
    pub fn set_line_ending(&mut self, ending: &str) {
        self.line_ending = ending.to_string();
    }

    /// True once the commander dropped its side of the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes the commander's next read or write on this connection fail.
    pub fn inject_error(&self, message: &str) {
        let mut slot = self
            .fail_next
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(io::Error::new(io::ErrorKind::Other, message.to_string()));
    }

    /// Reads one command line and asserts it matches `cmd`.
    pub async fn expect_command(&mut self, cmd: &str) {
        let last = *self
            .line_ending
            .as_bytes()
            .last()
            .expect("line ending must not be empty");
        let mut line = Vec::new();
        let read = self.reader.read_until(last, &mut line);
        match tokio::time::timeout(Duration::from_secs(30), read).await {
            Err(_) => panic!("timed out waiting for command {:?}", cmd),
            Ok(Err(err)) => panic!("failed to read the command, expected {:?}: {}", cmd, err),
            Ok(Ok(_)) => {}
        }
        let expected = format!("{}{}", cmd, self.line_ending);
        assert_eq!(
            String::from_utf8_lossy(&line),
            expected,
            "unexpected command on the wire"
        );
    }

    pub async fn write_response(&mut self, response: &str) {
        let data = format!("{}{}", response, self.line_ending);
        self.writer
            .write_all(data.as_bytes())
            .await
            .expect("response write failed");
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer
            .write_all(bytes)
            .await
            .expect("raw write failed");
    }
}

/// Transport whose connections are in-memory pipes handed to the test as
/// [`Peer`]s.
pub struct FakeTransport {
    expected_port: String,
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    peer_tx: mpsc::UnboundedSender<Peer>,
}

impl FakeTransport {
    pub fn new(expected_port: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                expected_port: expected_port.to_string(),
                connects: AtomicUsize::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
                peer_tx,
            }),
            peer_rx,
        )
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Makes subsequent dials take this long (virtual time).
    pub fn set_connect_delay(&self, delay: Duration) {
        *self
            .connect_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn ByteStream>> {
        assert_eq!(address, self.expected_port, "bad connect() port");
        let delay = *self
            .connect_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (device_side, test_side) = tokio::io::duplex(4096);
        let closed = Arc::new(AtomicBool::new(false));
        let fail_next = Arc::new(Mutex::new(None));
        let (read_half, write_half) = tokio::io::split(test_side);
        let peer = Peer {
            reader: BufReader::new(read_half),
            writer: write_half,
            closed: closed.clone(),
            fail_next: fail_next.clone(),
            line_ending: "\r\n".to_string(),
        };
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.peer_tx.send(peer).expect("test dropped the peer receiver");
        Ok(Box::new(TestStream {
            inner: device_side,
            closed,
            fail_next,
        }))
    }
}

/// Runs one command/response exchange against the commander and asserts the
/// result.
pub async fn chat(commander: &Arc<dyn Commander>, peer: &mut Peer, cmd: &str, response: &str) {
    let commander = commander.clone();
    let owned_cmd = cmd.to_string();
    let query = tokio::spawn(async move { commander.query(&owned_cmd).await });
    peer.expect_command(cmd).await;
    peer.write_response(response).await;
    let result = query
        .await
        .expect("query task panicked")
        .expect("query failed");
    assert_eq!(result, response.as_bytes(), "bad response for {:?}", cmd);
}

/// Commander double driven by an expectation queue of (query, response)
/// pairs.
pub struct FakeCommander {
    connected: AtomicBool,
    queue: Mutex<VecDeque<(String, Vec<u8>)>>,
    resets: AtomicUsize,
}

impl FakeCommander {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            resets: AtomicUsize::new(0),
        })
    }

    pub fn enqueue(&self, query: &str, response: impl Into<Vec<u8>>) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back((query.to_string(), response.into()));
    }

    pub fn verify_and_flush(&self) {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        assert!(
            queue.is_empty(),
            "unexpected items left in queue: {:?}",
            queue.iter().map(|(q, _)| q).collect::<Vec<_>>()
        );
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Commander for FakeCommander {
    async fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn wait_ready(&self) {}

    async fn query(&self, command: &str) -> Result<Vec<u8>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let item = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let Some((expected, response)) = item else {
            panic!("fakeCommander: response queue is empty, got {:?}", command);
        };
        assert_eq!(command, expected, "fakeCommander: bad command");
        Ok(response)
    }

    async fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Observer recording every event as a formatted line.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(
            &mut self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Observer for RecordingObserver {
    fn on_new_device(&self, device: &DeviceInfo) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(format!("device {}: {}", device.name, device.title));
    }

    fn on_new_control(&self, device: &str, control: &ControlMeta) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(format!(
                "meta {}/{} type={:?} title={:?} units={:?} value={:?} writable={}",
                device,
                control.name,
                control.control_type,
                control.title,
                control.units,
                control.value,
                control.writability.is_writable()
            ));
    }

    fn on_value(&self, device: &str, control: &str, value: &str) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(format!("value {}/{}={:?}", device, control, value));
    }
}
