//! In-process fake bridge daemon for tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex, split};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{Command, Frame, MAX_PAYLOAD, PROTOCOL_VERSION, read_frame, write_frame};

use super::auth::KeyProvider;
use super::connection::Connection;
use super::options::ClientOptions;

/// Offset added to the client's local id to form the fake peer's id.
pub(crate) const REMOTE_ID_BASE: u32 = 1000;

// ============================================================================
// TestKey
// ============================================================================

#[derive(Clone)]
pub(crate) struct TestKey {
    pub public_key: Vec<u8>,
    fail: bool,
}

impl Default for TestKey {
    fn default() -> Self {
        Self {
            public_key: b"QAAAAFRFU1Q= test@devtools-bridge\0".to_vec(),
            fail: false,
        }
    }
}

impl TestKey {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl KeyProvider for TestKey {
    async fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        if self.fail {
            return Err(Error::config("key store locked"));
        }
        let mut signature = token.to_vec();
        signature.resize(256, 0xab);
        Ok(signature)
    }

    async fn public_key(&self) -> Result<Vec<u8>> {
        Ok(self.public_key.clone())
    }
}

// ============================================================================
// PeerEnd
// ============================================================================

/// Daemon side of a duplex pipe, driven frame by frame.
pub(crate) struct PeerEnd {
    io: DuplexStream,
}

impl PeerEnd {
    pub fn new(io: DuplexStream) -> Self {
        Self { io }
    }

    pub async fn recv(&mut self) -> Frame {
        timeout(Duration::from_secs(5), read_frame(&mut self.io, MAX_PAYLOAD))
            .await
            .expect("peer recv timed out")
            .expect("peer recv")
    }

    /// Returns `None` if nothing arrives within `wait` or the client hung up.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        match timeout(wait, read_frame(&mut self.io, MAX_PAYLOAD)).await {
            Ok(Ok(frame)) => Some(frame),
            _ => None,
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        write_frame(&mut self.io, &frame).await.expect("peer send");
    }

    /// Writes bytes as-is, for corrupted frames.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("peer send");
    }

    async fn accept_connect(&mut self, max_payload: u32) {
        let connect = self.recv().await;
        assert_eq!(connect.command, Command::Connect);
        self.send(Frame::new(
            Command::Connect,
            PROTOCOL_VERSION,
            max_payload,
            "device::test\0",
        ))
        .await;
    }

    fn into_inner(self) -> DuplexStream {
        self.io
    }
}

/// Handshakes a client over a duplex pipe; the peer advertises `max_payload`.
pub(crate) async fn connected_pair(
    options: ClientOptions,
    max_payload: u32,
) -> (Connection, PeerEnd) {
    let (client, server) = duplex(256 * 1024);
    let mut peer = PeerEnd::new(server);
    let key = TestKey::default();

    let (connection, ()) = tokio::join!(
        Connection::handshake(Box::new(client), "127.0.0.1", &key, &options),
        peer.accept_connect(max_payload),
    );

    (connection.expect("handshake"), peer)
}

// ============================================================================
// EchoDaemon
// ============================================================================

/// Fake daemon that accepts every OPEN and echoes stream data back,
/// honouring the single write credit on its own side.
pub(crate) struct EchoDaemon {
    received: Arc<Mutex<Vec<Frame>>>,
    inject: mpsc::UnboundedSender<Frame>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct EchoStream {
    awaiting_ack: bool,
    queue: Vec<Vec<u8>>,
}

impl EchoDaemon {
    pub fn spawn(peer: PeerEnd) -> Self {
        let (read_half, write_half) = split(peer.into_inner());
        let received = Arc::new(Mutex::new(Vec::new()));
        let (inject, inject_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(Self::run(
            read_half,
            write_half,
            Arc::clone(&received),
            inject_rx,
        ));

        Self {
            received,
            inject,
            task,
        }
    }

    /// Sends an arbitrary frame to the client.
    pub fn inject(&self, frame: Frame) {
        let _ = self.inject.send(frame);
    }

    /// Number of frames with `command` received from the client.
    pub fn count(&self, command: Command) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|f| f.command == command)
            .count()
    }

    /// Frames received from the client, in order.
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().clone()
    }

    async fn run(
        mut read_half: ReadHalf<DuplexStream>,
        mut write_half: WriteHalf<DuplexStream>,
        received: Arc<Mutex<Vec<Frame>>>,
        mut inject_rx: mpsc::UnboundedReceiver<Frame>,
    ) {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(frame) = read_frame(&mut read_half, MAX_PAYLOAD).await {
                if frames_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let mut streams: FxHashMap<u32, EchoStream> = FxHashMap::default();

        loop {
            let outbound = tokio::select! {
                frame = frames_rx.recv() => match frame {
                    Some(frame) => {
                        received.lock().push(frame.clone());
                        Self::respond(&mut streams, frame)
                    }
                    None => break,
                },
                frame = inject_rx.recv() => match frame {
                    Some(frame) => vec![frame],
                    None => break,
                },
            };

            for frame in outbound {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    return;
                }
            }
        }
    }

    fn respond(streams: &mut FxHashMap<u32, EchoStream>, frame: Frame) -> Vec<Frame> {
        let client_id = frame.arg0;
        let remote_id = REMOTE_ID_BASE + client_id;

        match frame.command {
            Command::Open => {
                streams.insert(remote_id, EchoStream::default());
                vec![Frame::empty(Command::Ready, remote_id, client_id)]
            }
            Command::Write => {
                let Some(stream) = streams.get_mut(&frame.arg1) else {
                    return vec![Frame::empty(Command::Close, frame.arg1, client_id)];
                };
                let mut out = vec![Frame::empty(Command::Ready, frame.arg1, client_id)];
                if stream.awaiting_ack {
                    stream.queue.push(frame.payload);
                } else {
                    stream.awaiting_ack = true;
                    out.push(Frame::new(Command::Write, frame.arg1, client_id, frame.payload));
                }
                out
            }
            Command::Ready => {
                let Some(stream) = streams.get_mut(&frame.arg1) else {
                    return Vec::new();
                };
                if stream.queue.is_empty() {
                    stream.awaiting_ack = false;
                    Vec::new()
                } else {
                    let payload = stream.queue.remove(0);
                    vec![Frame::new(Command::Write, frame.arg1, client_id, payload)]
                }
            }
            Command::Close => {
                streams.remove(&frame.arg1);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

impl Drop for EchoDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}
