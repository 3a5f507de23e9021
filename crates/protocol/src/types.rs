use serde::{Deserialize, Serialize};

/// Operation kind carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Read,
    Write,
}

/// Command group a request is addressed to.
///
/// Groups partition the command-id space: each group interprets its own
/// command ids (see the `*_cmd` modules below).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandGroup {
    /// Device-level commands (parameters, reset).
    Default,
    /// Firmware image slots.
    Image,
    /// On-device filesystem.
    Filesystem,
    /// SUIT envelope / cache / resource delivery.
    Suit,
}

impl CommandGroup {
    /// Numeric group id on the wire.
    pub const fn id(self) -> u8 {
        match self {
            CommandGroup::Default => 0,
            CommandGroup::Image => 1,
            CommandGroup::Filesystem => 8,
            CommandGroup::Suit => 66,
        }
    }
}

/// Command ids within [`CommandGroup::Default`].
pub mod default_cmd {
    pub const RESET: u8 = 5;
    pub const PARAMS: u8 = 6;
}

/// Command ids within [`CommandGroup::Image`].
pub mod image_cmd {
    pub const STATE: u8 = 0;
    pub const UPLOAD: u8 = 1;
    pub const ERASE: u8 = 5;
}

/// Command ids within [`CommandGroup::Filesystem`].
pub mod fs_cmd {
    pub const FILE: u8 = 0;
    pub const STATUS: u8 = 1;
    pub const HASH: u8 = 2;
}

/// Command ids within [`CommandGroup::Suit`].
pub mod suit_cmd {
    pub const MANIFEST_LIST: u8 = 0;
    pub const MANIFEST_STATE: u8 = 1;
    pub const ENVELOPE_UPLOAD: u8 = 2;
    pub const POLL_IMAGE_STATE: u8 = 3;
    pub const UPLOAD_RESOURCE: u8 = 4;
    pub const UPLOAD_CACHE: u8 = 5;
    pub const CLEANUP: u8 = 6;
}

/// Generic return code reported by the peer's command handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnCode(pub u32);

impl ReturnCode {
    pub const OK: ReturnCode = ReturnCode(0);
    pub const NOT_SUPPORTED: ReturnCode = ReturnCode(8);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// `false` when the peer's firmware does not implement the command.
    pub fn is_supported(self) -> bool {
        self.0 != Self::NOT_SUPPORTED.0
    }
}

/// Image-group status codes reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("unknown error")]
    Unknown,
    #[error("no image in the slot")]
    NoImage,
    #[error("slot image has no hash record")]
    HashNotFound,
    #[error("no free slot for the image")]
    FullSlots,
    #[error("flash area open failed")]
    FlashOpenFailed,
    #[error("flash read failed")]
    FlashReadFailed,
    #[error("flash write failed")]
    FlashWriteFailed,
    #[error("flash erase failed")]
    FlashEraseFailed,
    #[error("slot is not valid")]
    InvalidSlot,
    #[error("required offset parameter missing")]
    MissingOffset,
    #[error("required length parameter missing")]
    MissingLength,
    #[error("image header is invalid")]
    InvalidImageHeader,
    #[error("image is too large for the slot")]
    ImageTooLarge,
    #[error("data sent past the declared image size")]
    DataOverrun,
    #[error("image operation already pending")]
    AlreadyPending,
    #[error("image status {0}")]
    Other(u32),
}

impl ImageError {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ImageError::Unknown,
            3 => ImageError::NoImage,
            8 => ImageError::HashNotFound,
            9 => ImageError::FullSlots,
            10 => ImageError::FlashOpenFailed,
            11 => ImageError::FlashReadFailed,
            12 => ImageError::FlashWriteFailed,
            13 => ImageError::FlashEraseFailed,
            14 => ImageError::InvalidSlot,
            20 => ImageError::MissingOffset,
            21 => ImageError::MissingLength,
            22 => ImageError::InvalidImageHeader,
            30 => ImageError::ImageTooLarge,
            31 => ImageError::DataOverrun,
            28 => ImageError::AlreadyPending,
            other => ImageError::Other(other),
        }
    }
}

/// Filesystem-group status codes reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("unknown error")]
    Unknown,
    #[error("file name is not valid")]
    InvalidName,
    #[error("file does not exist")]
    NotFound,
    #[error("name refers to a directory")]
    IsDirectory,
    #[error("file open failed")]
    OpenFailed,
    #[error("seek within the file failed")]
    SeekFailed,
    #[error("file read failed")]
    ReadFailed,
    #[error("file write failed")]
    WriteFailed,
    #[error("offset within the file is invalid")]
    InvalidOffset,
    #[error("offset is past the end of the file")]
    OffsetPastEnd,
    #[error("requested checksum is not supported")]
    ChecksumNotFound,
    #[error("mount point was not found")]
    MountPointNotFound,
    #[error("filesystem is read-only")]
    ReadOnly,
    #[error("file is empty")]
    EmptyFile,
    #[error("filesystem status {0}")]
    Other(u32),
}

impl FsError {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => FsError::Unknown,
            2 => FsError::InvalidName,
            3 => FsError::NotFound,
            4 => FsError::IsDirectory,
            5 => FsError::OpenFailed,
            6 => FsError::SeekFailed,
            7 => FsError::ReadFailed,
            10 => FsError::WriteFailed,
            11 => FsError::InvalidOffset,
            12 => FsError::OffsetPastEnd,
            13 => FsError::ChecksumNotFound,
            14 => FsError::MountPointNotFound,
            15 => FsError::ReadOnly,
            16 => FsError::EmptyFile,
            other => FsError::Other(other),
        }
    }
}

/// A peer-reported failure, typed by the command group that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("image group: {0}")]
    Image(ImageError),
    #[error("filesystem group: {0}")]
    Filesystem(FsError),
    #[error("group {group:?} reported status {code}")]
    Other { group: CommandGroup, code: u32 },
}

impl DeviceError {
    /// Maps a nonzero status code to the group's typed error.
    pub fn from_group_code(group: CommandGroup, code: u32) -> Self {
        match group {
            CommandGroup::Image => DeviceError::Image(ImageError::from_code(code)),
            CommandGroup::Filesystem => DeviceError::Filesystem(FsError::from_code(code)),
            _ => DeviceError::Other { group, code },
        }
    }
}
