use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use devmgr_protocol::envelope::Envelope;

/// Default request timeout. Fragments at offset 0 may trigger a slot erase
/// on the peer before the first acknowledgment comes back, so the default
/// leaves room for it.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(40);

/// Timeout for subsequent fragments of an established transfer.
pub const FAST_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Underlying transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ble,
    Udp,
    Serial,
    Coap,
}

impl Scheme {
    /// CoAP framing adds a fixed surcharge to every packet.
    pub fn is_coap(self) -> bool {
        matches!(self, Scheme::Coap)
    }
}

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The negotiated MTU must grow to `required` bytes before the request
    /// can be delivered. Triggers the window-restart recovery path.
    #[error("peer requires a {required}-byte reassembly buffer")]
    InsufficientBuffer { required: usize },

    #[error("request timed out")]
    Timeout,

    #[error("transport closed")]
    Closed,

    #[error("MTU {0} was rejected by the transport")]
    InvalidMtu(usize),

    #[error("send failed: {0}")]
    Send(String),
}

/// Future returned by [`Transport::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<Envelope, TransportError>> + Send + 'a>>;

/// Abstract connection to a managed peripheral.
///
/// The engine is written against this trait so it stays decoupled from the
/// concrete link (BLE, UDP, serial) and testable with mocks. Implementations
/// own framing, retransmission and request timeouts; the engine treats one
/// `send` as one request/response exchange.
pub trait Transport: Send + Sync {
    /// Sends a request envelope and resolves with the peer's response.
    fn send(&self, request: Envelope, timeout: Duration) -> SendFuture<'_>;

    /// Current MTU in bytes.
    fn mtu(&self) -> usize;

    /// Renegotiates the MTU, typically after an
    /// [`TransportError::InsufficientBuffer`] signal.
    fn set_mtu(&self, mtu: usize) -> Result<(), TransportError>;

    fn scheme(&self) -> Scheme;

    /// Enables splitting of over-MTU packets into link-sized writes, for
    /// peers whose reassembly buffer exceeds the raw MTU. Transports without
    /// the capability may ignore the call.
    fn set_reassembly(&self, _enabled: bool) {}
}
