//! Wire envelope and payload types for device-management commands.
//!
//! Every exchange with a managed peripheral is one request envelope and one
//! response envelope. The envelope carries a small routing header (operation,
//! command group, command id, sequence number) and a deferred JSON payload;
//! the typed payload structs live in [`messages`]. Peer-reported status codes
//! are mapped to typed errors in [`types`].
//!
//! The actual framing and retransmission below the envelope is owned by the
//! transport implementation — this crate only describes what goes inside one
//! message.

pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use envelope::{Envelope, WireError};
pub use messages::{
    ChunkRequest, ChunkResponse, ParamsResponse, PollResponse, ReadRequest, ReadResponse,
};
pub use types::{CommandGroup, DeviceError, FsError, ImageError, Op, ReturnCode};
