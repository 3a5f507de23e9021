use serde::{Deserialize, Serialize};

use crate::types::{CommandGroup, Op};

/// Error details attached to a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

/// Envelope for one request or response.
///
/// The `payload` field uses `serde_json::value::RawValue` to defer
/// deserialization until the receiver knows which payload struct applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Wrapping sequence number correlating a response to its request.
    pub seq: u8,
    pub op: Op,
    pub group: CommandGroup,
    pub command: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Envelope {
    /// Creates a request envelope with the given header and payload.
    pub fn request<T: Serialize>(
        seq: u8,
        op: Op,
        group: CommandGroup,
        command: u8,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            seq,
            op,
            group,
            command,
            payload: raw,
            error: None,
        })
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates a response envelope for this request.
    pub fn reply<T: Serialize>(&self, payload: Option<&T>) -> Result<Self, serde_json::Error> {
        Envelope::request(self.seq, self.op, self.group, self.command, payload)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Self {
            seq: self.seq,
            op: self.op,
            group: self.group,
            command: self.command,
            payload: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Size of this envelope once encoded.
    ///
    /// Fragment sizing serializes a representative envelope and measures it,
    /// because the header size depends on which payload fields are present.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        Ok(serde_json::to_vec(self)?.len())
    }
}
