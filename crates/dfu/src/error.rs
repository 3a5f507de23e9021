//! Engine error taxonomy.

use devmgr_protocol::types::DeviceError;
use devmgr_transfer::planner::PlanError;
use devmgr_transfer::transport::TransportError;
use devmgr_transfer::window::WindowError;

use crate::session::StateError;

/// Errors produced by the transfer engine.
///
/// Configuration errors are rejected synchronously, before any transport
/// activity. Everything else is fatal to the running transfer and reaches the
/// caller through the terminal `Failed` event.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("nothing to transfer")]
    EmptyTransfer,

    #[error("a transfer is already in progress on this channel")]
    AlreadyActive,

    #[error("invalid transfer settings: {0}")]
    InvalidConfig(String),

    #[error("response is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("expected chunk at offset {expected}, peer reported {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A second buffer renegotiation arrived without any bytes confirmed in
    /// between; retrying would loop forever.
    #[error("buffer renegotiation at offset {offset} made no progress")]
    RenegotiationStalled { offset: u64 },

    #[error("peer rejected the request: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    State(#[from] StateError),
}
