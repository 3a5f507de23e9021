use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Upload payloads
// ---------------------------------------------------------------------------

/// One fragment of a chunked upload.
///
/// The header fields `len`, `image` and `sha` ride only on the fragment at
/// offset 0; `name` is present on every fragment of a filesystem upload, and
/// `session_id`/`target_id` on every fragment of a resource or cache upload.
/// Fragment sizing depends on this: the encoded envelope is measured per
/// offset before the data bytes are filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub off: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Total payload length, first fragment only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
    /// Target image number, first fragment only, omitted when zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<u32>,
    /// Whole-payload digest, first fragment only.
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub sha: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_install: Option<bool>,
}

/// Acknowledgment for one upload fragment.
///
/// `off` is the peer's write pointer after accepting the fragment. A missing
/// `off` is a protocol error on the sender side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<u32>,
}

// ---------------------------------------------------------------------------
// Download payloads
// ---------------------------------------------------------------------------

/// Requests one chunk of a file starting at `off`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub name: String,
    pub off: u64,
}

/// One chunk of downloaded file data.
///
/// The response at offset 0 carries the total file length in `len`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off: Option<u64>,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<u32>,
}

// ---------------------------------------------------------------------------
// Capability and poll payloads
// ---------------------------------------------------------------------------

/// Peer buffering limits, queried once per transfer.
///
/// Both fields absent means the peer does not implement the query — callers
/// proceed with their own defaults, this is not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buf_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buf_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<u32>,
}

/// Response to a completion poll.
///
/// An empty response means "keep waiting". A populated `resource_id` +
/// `session_id` pair means the peer wants an out-of-band resource delivered
/// under that session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Binary fields are base64 strings in the JSON encoding.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        data: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => STANDARD.encode(bytes).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => STANDARD
                .decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
