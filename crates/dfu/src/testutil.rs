//! Scriptable mock peer for engine tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use devmgr_protocol::envelope::Envelope;
use devmgr_protocol::messages::{
    ChunkRequest, ChunkResponse, ParamsResponse, PollResponse, ReadRequest, ReadResponse,
};
use devmgr_protocol::types::{CommandGroup, Op, default_cmd, fs_cmd, suit_cmd};
use devmgr_transfer::transport::{Scheme, SendFuture, Transport, TransportError};

/// Scripted reply for one completion poll.
#[derive(Debug, Clone)]
pub(crate) enum PollReply {
    Empty,
    NotSupported,
    Resource { resource: String, session_id: u64 },
    Disconnect,
}

/// Mutable peer scripting and request log.
#[derive(Debug, Default)]
pub(crate) struct PeerState {
    /// Reply to the capability query; `None` answers "not supported".
    pub params: Option<(Option<u64>, Option<u64>)>,
    /// Drop the link on the capability query.
    pub params_disconnect: bool,
    /// Scripted poll replies, consumed front to back; empty forever after.
    pub polls: Vec<PollReply>,
    pub poll_count: u32,
    /// Every accepted upload fragment: (group id, command id, request).
    pub chunks: Vec<(u8, u8, ChunkRequest)>,
    /// Zero-length commit fragments received.
    pub commits: u32,
    /// Fire `InsufficientBuffer { required }` once per entry when a fragment
    /// arrives at the given offset.
    pub insufficient: Vec<(u64, usize)>,
    /// Reject the fragment at the given offset once with this status code.
    pub reject: Option<(u64, u32)>,
    /// File served for downloads, chunked to the given size.
    pub file: Option<(Vec<u8>, usize)>,
    /// Report each download chunk one byte off, to provoke a mismatch.
    pub download_misreport: bool,
    pub mtu_changes: Vec<usize>,
}

/// A request held back in manual mode, for tests that control acknowledgment
/// order and timing.
pub(crate) struct Parked {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<Result<Envelope, TransportError>>,
}

impl Parked {
    pub fn chunk(&self) -> ChunkRequest {
        self.envelope.parse_payload().unwrap().unwrap()
    }

    pub fn read_request(&self) -> ReadRequest {
        self.envelope.parse_payload().unwrap().unwrap()
    }

    /// Acknowledges the fragment at its natural offset.
    pub fn ack(self) {
        let chunk = self.chunk();
        self.ack_at(chunk.off + chunk.data.len() as u64);
    }

    /// Acknowledges with an arbitrary offset.
    pub fn ack_at(self, off: u64) {
        let response = ChunkResponse {
            off: Some(off),
            len: None,
            rc: None,
        };
        let envelope = self.envelope.reply(Some(&response)).unwrap();
        let _ = self.reply.send(Ok(envelope));
    }

    /// Serves a download chunk from `file`.
    pub fn serve(self, file: &[u8], chunk_size: usize) {
        let request = self.read_request();
        let off = request.off as usize;
        let end = (off + chunk_size).min(file.len());
        let response = ReadResponse {
            off: Some(request.off),
            data: file[off..end].to_vec(),
            len: (request.off == 0).then(|| file.len() as u64),
            rc: None,
        };
        let envelope = self.envelope.reply(Some(&response)).unwrap();
        let _ = self.reply.send(Ok(envelope));
    }

    pub fn fail(self, error: TransportError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Mock transport simulating a managed peripheral.
///
/// In auto mode every request is answered synchronously from the scripted
/// state. In manual mode upload fragments and download reads are parked on a
/// channel so the test decides when and how each one completes; capability
/// and poll requests stay automatic.
pub(crate) struct MockPeer {
    mtu: AtomicUsize,
    scheme: Scheme,
    reassembly: AtomicBool,
    manual: Option<mpsc::UnboundedSender<Parked>>,
    pub state: Mutex<PeerState>,
}

impl MockPeer {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu: AtomicUsize::new(mtu),
            scheme: Scheme::Ble,
            reassembly: AtomicBool::new(false),
            manual: None,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn manual(mtu: usize) -> (Self, mpsc::UnboundedReceiver<Parked>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peer = Self::new(mtu);
        peer.manual = Some(tx);
        (peer, rx)
    }

    pub fn mtu_changes(&self) -> Vec<usize> {
        self.state.lock().unwrap().mtu_changes.clone()
    }

    pub fn reassembly_enabled(&self) -> bool {
        self.reassembly.load(Ordering::SeqCst)
    }

    /// Reassembles received fragments into payloads, one per `off == 0`
    /// boundary, for the given group/command pair.
    pub fn assembled(&self, group: u8, command: u8) -> Vec<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<Vec<u8>> = Vec::new();
        for (g, c, request) in &state.chunks {
            if (*g, *c) != (group, command) {
                continue;
            }
            if request.off == 0 {
                out.push(Vec::new());
            }
            let Some(buffer) = out.last_mut() else {
                continue;
            };
            let off = request.off as usize;
            let end = off + request.data.len();
            if buffer.len() < end {
                buffer.resize(end, 0);
            }
            buffer[off..end].copy_from_slice(&request.data);
        }
        out
    }

    fn auto_reply(&self, request: &Envelope) -> Result<Envelope, TransportError> {
        let mut state = self.state.lock().unwrap();
        match (request.group, request.op, request.command) {
            (CommandGroup::Default, Op::Read, default_cmd::PARAMS) if state.params_disconnect => {
                Err(TransportError::Closed)
            }
            (CommandGroup::Default, Op::Read, default_cmd::PARAMS) => match state.params {
                Some((buf_size, buf_count)) => {
                    let response = ParamsResponse {
                        buf_size,
                        buf_count,
                        rc: None,
                    };
                    Ok(request.reply(Some(&response)).unwrap())
                }
                None => Ok(request.reply_error(8, "not supported")),
            },
            (CommandGroup::Suit, Op::Read, suit_cmd::POLL_IMAGE_STATE) => {
                state.poll_count += 1;
                let scripted = if state.polls.is_empty() {
                    PollReply::Empty
                } else {
                    state.polls.remove(0)
                };
                let response = match scripted {
                    PollReply::Empty => PollResponse::default(),
                    PollReply::NotSupported => PollResponse {
                        rc: Some(8),
                        ..Default::default()
                    },
                    PollReply::Resource {
                        resource,
                        session_id,
                    } => PollResponse {
                        rc: None,
                        session_id: Some(session_id),
                        resource_id: Some(resource),
                    },
                    PollReply::Disconnect => return Err(TransportError::Closed),
                };
                Ok(request.reply(Some(&response)).unwrap())
            }
            (CommandGroup::Filesystem, Op::Read, fs_cmd::FILE) => {
                let read: ReadRequest = request.parse_payload().unwrap().unwrap();
                let Some((file, chunk_size)) = state.file.clone() else {
                    return Ok(request.reply_error(3, "no such file"));
                };
                let off = read.off as usize;
                let end = (off + chunk_size).min(file.len());
                let reported = if state.download_misreport {
                    read.off + 1
                } else {
                    read.off
                };
                let response = ReadResponse {
                    off: Some(reported),
                    data: file[off..end].to_vec(),
                    len: (read.off == 0).then(|| file.len() as u64),
                    rc: None,
                };
                Ok(request.reply(Some(&response)).unwrap())
            }
            (_, Op::Write, _) => {
                let chunk: ChunkRequest = request.parse_payload().unwrap().unwrap();
                if let Some(&(at, required)) = state.insufficient.first()
                    && chunk.off == at
                {
                    state.insufficient.remove(0);
                    return Err(TransportError::InsufficientBuffer { required });
                }
                if let Some((at, rc)) = state.reject
                    && chunk.off == at
                {
                    state.reject = None;
                    let response = ChunkResponse {
                        off: None,
                        len: None,
                        rc: Some(rc),
                    };
                    return Ok(request.reply(Some(&response)).unwrap());
                }
                if chunk.off == 0 && chunk.data.is_empty() && chunk.len == Some(0) {
                    state.commits += 1;
                    let response = ChunkResponse {
                        off: Some(0),
                        len: None,
                        rc: None,
                    };
                    return Ok(request.reply(Some(&response)).unwrap());
                }
                let ack = chunk.off + chunk.data.len() as u64;
                state
                    .chunks
                    .push((request.group.id(), request.command, chunk));
                let response = ChunkResponse {
                    off: Some(ack),
                    len: None,
                    rc: None,
                };
                Ok(request.reply(Some(&response)).unwrap())
            }
            _ => Ok(request.reply_error(8, "unhandled")),
        }
    }
}

fn parkable(request: &Envelope) -> bool {
    request.op == Op::Write
        || (request.group == CommandGroup::Filesystem
            && request.op == Op::Read
            && request.command == fs_cmd::FILE)
}

impl Transport for MockPeer {
    fn send(&self, request: Envelope, _timeout: Duration) -> SendFuture<'_> {
        if let Some(parked) = &self.manual
            && parkable(&request)
        {
            // Record upload fragments at send time so `assembled` works in
            // manual mode too.
            if request.op == Op::Write
                && let Ok(Some(chunk)) = request.parse_payload::<ChunkRequest>()
            {
                self.state
                    .lock()
                    .unwrap()
                    .chunks
                    .push((request.group.id(), request.command, chunk));
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = parked.send(Parked {
                envelope: request,
                reply: reply_tx,
            });
            return Box::pin(async move {
                reply_rx.await.unwrap_or(Err(TransportError::Closed))
            });
        }
        let result = self.auto_reply(&request);
        Box::pin(async move { result })
    }

    fn mtu(&self) -> usize {
        self.mtu.load(Ordering::SeqCst)
    }

    fn set_mtu(&self, mtu: usize) -> Result<(), TransportError> {
        self.mtu.store(mtu, Ordering::SeqCst);
        self.state.lock().unwrap().mtu_changes.push(mtu);
        Ok(())
    }

    fn scheme(&self) -> Scheme {
        self.scheme
    }

    fn set_reassembly(&self, enabled: bool) {
        self.reassembly.store(enabled, Ordering::SeqCst);
    }
}

/// Deterministic test payload.
pub(crate) fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Lets the spawned runner make progress on the current-thread runtime.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Collects events until the runner drops its sender.
pub(crate) async fn drain<T>(mut rx: mpsc::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
