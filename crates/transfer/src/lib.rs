//! Transfer primitives: chunk planning, fragment-window bookkeeping and the
//! transport boundary.
//!
//! This crate holds the pieces of the transfer engine that have no opinion
//! about command flow: [`planner`] decides how many payload bytes fit in the
//! next fragment, [`window`] tracks which fragments are in flight under a
//! bounded pipeline depth, and [`transport`] defines the trait the engine
//! drives to actually move bytes. The engine itself lives in `devmgr-dfu`.

pub mod checksum;
pub mod planner;
pub mod transport;
pub mod window;

// Re-export primary types for convenience.
pub use checksum::{sha256, sha256_hex};
pub use planner::{ByteAlignment, ChunkPlan, PlanError, PlanInput, plan_chunk, probe_overhead};
pub use transport::{
    DEFAULT_SEND_TIMEOUT, FAST_SEND_TIMEOUT, Scheme, SendFuture, Transport, TransportError,
};
pub use window::{FragmentWindow, SentFragment, WindowError};

/// Largest usable peer reassembly buffer.
///
/// Fragment lengths ride in a 16-bit field on the wire, so a larger buffer
/// could never be filled by a single fragment.
pub const MAX_REASSEMBLY_SIZE: u64 = u16::MAX as u64;
