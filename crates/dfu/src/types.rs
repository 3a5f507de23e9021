//! Data types for the transfer engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devmgr_protocol::types::{CommandGroup, fs_cmd, image_cmd, suit_cmd};
use devmgr_transfer::planner::ByteAlignment;

use crate::error::TransferError;

/// Kind of payload a target carries. The kind selects the command the
/// fragments are delivered under and which extra fields ride along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Firmware image for a slot.
    Firmware,
    /// File written to the peer's filesystem.
    File,
    /// SUIT manifest envelope. Always uploaded before caches.
    Envelope,
    /// SUIT cache directed at a specific partition.
    Cache,
    /// Out-of-band resource the peer asked for during the completion poll.
    Resource,
}

impl TargetKind {
    pub(crate) fn group(self) -> CommandGroup {
        match self {
            TargetKind::Firmware => CommandGroup::Image,
            TargetKind::File => CommandGroup::Filesystem,
            TargetKind::Envelope | TargetKind::Cache | TargetKind::Resource => CommandGroup::Suit,
        }
    }

    pub(crate) fn command(self) -> u8 {
        match self {
            TargetKind::Firmware => image_cmd::UPLOAD,
            TargetKind::File => fs_cmd::FILE,
            TargetKind::Envelope => suit_cmd::ENVELOPE_UPLOAD,
            TargetKind::Cache => suit_cmd::UPLOAD_CACHE,
            TargetKind::Resource => suit_cmd::UPLOAD_RESOURCE,
        }
    }
}

/// One named unit within a multi-part upload.
///
/// The payload bytes are reference-counted and read-only for the duration of
/// the transfer.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub name: Option<String>,
    /// Target core / partition index.
    pub image: u32,
    /// Slot within the image, folded to 0 (primary) or 1 (secondary).
    pub slot: u32,
    pub kind: TargetKind,
    /// Whole-payload digest sent with the first fragment. Computed on start
    /// when left empty.
    pub hash: Vec<u8>,
    pub data: Arc<[u8]>,
}

impl UploadTarget {
    /// A firmware image destined for `image`/`slot`.
    ///
    /// Newer packaging tools number slots past 1, while firmware commands
    /// only accept 0 and 1, so the slot is folded back into that range.
    pub fn firmware(image: u32, slot: u32, hash: Vec<u8>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: None,
            image,
            slot: slot % 2,
            kind: TargetKind::Firmware,
            hash,
            data: data.into(),
        }
    }

    /// A file written to `name` on the peer's filesystem.
    pub fn file(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: Some(name.into()),
            image: 0,
            slot: 0,
            kind: TargetKind::File,
            hash: Vec::new(),
            data: data.into(),
        }
    }

    /// A SUIT manifest envelope.
    pub fn envelope(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: None,
            image: 0,
            slot: 0,
            kind: TargetKind::Envelope,
            hash: Vec::new(),
            data: data.into(),
        }
    }

    /// A SUIT cache directed at `partition`.
    pub fn cache(partition: u32, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: None,
            image: partition,
            slot: 0,
            kind: TargetKind::Cache,
            hash: Vec::new(),
            data: data.into(),
        }
    }

    pub(crate) fn resource(data: Arc<[u8]>) -> Self {
        Self {
            name: None,
            image: 0,
            slot: 0,
            kind: TargetKind::Resource,
            hash: Vec::new(),
            data,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Human-readable label for logs and events.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.kind {
            TargetKind::Envelope => "SUIT envelope".into(),
            TargetKind::Cache => format!("cache partition {}", self.image),
            TargetKind::Resource => "requested resource".into(),
            TargetKind::Firmware | TargetKind::File => {
                format!("image {} slot {}", self.image, self.slot)
            }
        }
    }
}

/// Settings for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum fragments in flight. 1 disables pipelining.
    pub pipeline_depth: usize,
    /// Fragment sizes are floored to this alignment so offset jumps stay
    /// predictable under pipelining.
    pub byte_alignment: ByteAlignment,
    /// Caller-supplied reassembly budget, used until the peer reports its
    /// own. 0 plans against the MTU alone.
    pub reassembly_buffer: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 1,
            byte_alignment: ByteAlignment::Disabled,
            reassembly_buffer: 0,
        }
    }
}

impl UploadConfig {
    pub fn pipelining_enabled(&self) -> bool {
        self.pipeline_depth > 1
    }
}

/// Events emitted while an upload runs.
///
/// Exactly one of `Finished`, `Cancelled` or `Failed` is emitted per
/// transfer attempt, always as the last event.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A sub-transfer began.
    TargetStarted { index: usize, name: String, size: u64 },
    /// Emitted after every acknowledged fragment of the active sub-transfer.
    Progress {
        bytes: u64,
        total: u64,
        timestamp: DateTime<Utc>,
    },
    /// The peer asked for an out-of-band resource; supply it via
    /// [`TransferHandle::supply_resource`](crate::manager::TransferHandle::supply_resource).
    ResourceRequested { resource: String },
    Finished,
    Cancelled,
    Failed { error: Arc<TransferError> },
}

/// Events emitted while a download runs. Terminal events follow the same
/// exactly-once rule as [`TransferEvent`].
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress {
        bytes: u64,
        total: u64,
        timestamp: DateTime<Utc>,
    },
    Finished { name: String, data: Vec<u8> },
    Cancelled,
    Failed { error: Arc<TransferError> },
}

/// Control messages from a handle to its running transfer.
#[derive(Debug)]
pub(crate) enum Command {
    Pause,
    Resume,
    SupplyResource(Arc<[u8]>),
}

/// Wrapping per-request sequence number.
pub(crate) fn next_seq(seq: &mut u8) -> u8 {
    let value = *seq;
    *seq = seq.wrapping_add(1);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_numbers_fold_into_primary_and_secondary() {
        assert_eq!(UploadTarget::firmware(1, 1, Vec::new(), vec![1u8]).slot, 1);
        assert_eq!(UploadTarget::firmware(1, 3, Vec::new(), vec![1u8]).slot, 1);
        assert_eq!(UploadTarget::firmware(0, 2, Vec::new(), vec![1u8]).slot, 0);
    }

    #[test]
    fn kinds_route_to_their_commands() {
        assert_eq!(TargetKind::Firmware.group(), CommandGroup::Image);
        assert_eq!(TargetKind::Firmware.command(), image_cmd::UPLOAD);
        assert_eq!(TargetKind::File.group(), CommandGroup::Filesystem);
        assert_eq!(TargetKind::Envelope.command(), suit_cmd::ENVELOPE_UPLOAD);
        assert_eq!(TargetKind::Cache.command(), suit_cmd::UPLOAD_CACHE);
        assert_eq!(TargetKind::Resource.command(), suit_cmd::UPLOAD_RESOURCE);
    }

    #[test]
    fn display_name_prefers_explicit_name() {
        let t = UploadTarget::file("/lfs/cfg.bin", vec![0u8]);
        assert_eq!(t.display_name(), "/lfs/cfg.bin");

        let t = UploadTarget::firmware(1, 1, Vec::new(), vec![0u8]);
        assert_eq!(t.display_name(), "image 1 slot 1");

        let t = UploadTarget::cache(2, vec![0u8]);
        assert_eq!(t.display_name(), "cache partition 2");
    }

    #[test]
    fn default_config_is_sequential() {
        let config = UploadConfig::default();
        assert_eq!(config.pipeline_depth, 1);
        assert!(!config.pipelining_enabled());

        let config = UploadConfig {
            pipeline_depth: 4,
            ..Default::default()
        };
        assert!(config.pipelining_enabled());
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut seq = 254u8;
        assert_eq!(next_seq(&mut seq), 254);
        assert_eq!(next_seq(&mut seq), 255);
        assert_eq!(next_seq(&mut seq), 0);
    }
}
