use serde::{Deserialize, Serialize};

use devmgr_protocol::envelope::Envelope;

use crate::transport::Scheme;

/// Fixed per-packet framing surcharge on top of the encoded envelope.
const FRAME_SURCHARGE: usize = 5;

/// Additional per-packet surcharge when tunneled over CoAP.
const COAP_SURCHARGE: usize = 25;

/// Byte alignment applied to fragment payload sizes.
///
/// Pipelining relies on predictable offset jumps: with an alignment set, the
/// peer accepts whole fragments instead of trimming them to its own flash
/// write granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteAlignment {
    #[default]
    Disabled,
    Two,
    Four,
    Eight,
    Sixteen,
}

impl ByteAlignment {
    pub fn value(self) -> u64 {
        match self {
            ByteAlignment::Disabled => 0,
            ByteAlignment::Two => 2,
            ByteAlignment::Four => 4,
            ByteAlignment::Eight => 8,
            ByteAlignment::Sixteen => 16,
        }
    }

    /// Rounds `len` down to the nearest multiple of the alignment.
    pub fn floor(self, len: u64) -> u64 {
        match self.value() {
            0 => len,
            align => len - (len % align),
        }
    }
}

/// Inputs for sizing the next fragment.
///
/// `overhead` is measured per offset via [`probe_overhead`], because the
/// envelope header shrinks once the first-fragment fields drop off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanInput {
    pub total_len: u64,
    pub offset: u64,
    pub overhead: usize,
    pub mtu: usize,
    /// Peer reassembly buffer size; 0 when reassembly is not in play.
    pub reassembly_buffer: u64,
    pub alignment: ByteAlignment,
}

/// Outcome of planning one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlan {
    /// Send `len` payload bytes starting at `offset`.
    Data { offset: u64, len: u64 },
    /// All bytes are already on the peer; send the explicit zero-length
    /// completion fragment required by multi-stage protocols.
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("offset {offset} is past the end of a {total_len}-byte payload")]
    OffsetOutOfRange { offset: u64, total_len: u64 },

    /// The fragment budget cannot hold a single payload byte. This is a
    /// configuration error (pathological overhead versus MTU) and must fail
    /// fast rather than emit an empty fragment.
    #[error("{overhead}-byte overhead exhausts the {budget}-byte fragment budget")]
    FragmentTooSmall { overhead: usize, budget: u64 },
}

/// Measures the per-fragment overhead at one offset.
///
/// `probe` must be the real envelope for that offset with a zero-length data
/// placeholder, so that field presence (total length, digest, target index on
/// the first fragment) is reflected in the measured size.
pub fn probe_overhead(probe: &Envelope, scheme: Scheme) -> Result<usize, serde_json::Error> {
    let mut overhead = probe.encoded_len()? + FRAME_SURCHARGE;
    if scheme.is_coap() {
        overhead += COAP_SURCHARGE;
    }
    Ok(overhead)
}

/// Computes the maximum number of payload bytes for the next fragment.
///
/// The budget is the larger of the peer's reassembly buffer and the MTU,
/// minus the measured overhead, floored to the alignment, and capped by the
/// bytes remaining. Identical inputs always yield identical output.
pub fn plan_chunk(input: &PlanInput) -> Result<ChunkPlan, PlanError> {
    if input.offset > input.total_len {
        return Err(PlanError::OffsetOutOfRange {
            offset: input.offset,
            total_len: input.total_len,
        });
    }
    if input.offset == input.total_len {
        return Ok(ChunkPlan::Commit);
    }

    let budget = input.reassembly_buffer.max(input.mtu as u64);
    if budget <= input.overhead as u64 {
        return Err(PlanError::FragmentTooSmall {
            overhead: input.overhead,
            budget,
        });
    }

    let mut capacity = budget - input.overhead as u64;
    capacity = input.alignment.floor(capacity);
    if capacity == 0 {
        return Err(PlanError::FragmentTooSmall {
            overhead: input.overhead,
            budget,
        });
    }

    let len = capacity.min(input.total_len - input.offset);
    Ok(ChunkPlan::Data {
        offset: input.offset,
        len,
    })
}
