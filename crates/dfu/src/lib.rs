//! Transfer engine for managed peripherals.
//!
//! This crate drives chunked binary transfers — firmware images, filesystem
//! files, SUIT envelopes and their resources — to an embedded peer over an
//! unreliable, MTU-constrained transport. It is a library crate with no
//! transport dependency: callers hand a
//! [`Transport`](devmgr_transfer::transport::Transport) implementation to
//! [`DfuManager`] and receive progress and terminal events over a channel.
//!
//! # Flow
//!
//! 1. **Negotiate** — query peer buffer limits, adjust MTU and pipelining
//! 2. **Upload** — pipelined fragments per target, acknowledged out of order
//! 3. **Advance** — next target only after the previous is fully acknowledged
//! 4. **Complete** — commit + poll for SUIT-style deferred installs
//!
//! Transfers are pausable, resumable and cancellable through
//! [`TransferHandle`]; MTU renegotiation mid-transfer restarts the fragment
//! window at the last confirmed offset.

pub mod error;
pub mod manager;
pub mod session;
pub mod types;

mod downloader;
mod negotiator;
mod uploader;

#[cfg(test)]
mod testutil;

// Re-export primary types for convenience.
pub use devmgr_transfer::planner::ByteAlignment;
pub use error::TransferError;
pub use manager::{DfuManager, TransferHandle};
pub use session::{StateError, TransferPhase};
pub use types::{DownloadEvent, TargetKind, TransferEvent, UploadConfig, UploadTarget};
