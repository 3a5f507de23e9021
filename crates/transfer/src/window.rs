use std::collections::BTreeMap;

/// One fragment currently awaiting acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentFragment {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// The peer acknowledged an offset no in-flight fragment could produce.
    /// Duplicate, stale (pre-renegotiation) or reordered-beyond-protocol
    /// acknowledgments all land here and are fatal to the transfer.
    #[error("acknowledged offset {offset} does not match any fragment in flight")]
    UnexpectedAck { offset: u64 },

    #[error("fragment at offset {offset} does not continue the send cursor at {cursor}")]
    NonContiguousSend { offset: u64, cursor: u64 },
}

/// Tracks the fragments in flight for one sub-transfer.
///
/// The send cursor (next offset to emit) and the acknowledged prefix diverge
/// while fragments are pipelined; acknowledgments are matched against the
/// outstanding set rather than assumed to arrive in order. Outstanding
/// entries are keyed by the offset the peer will report back, i.e. fragment
/// offset plus length.
#[derive(Debug)]
pub struct FragmentWindow {
    depth: usize,
    total_len: u64,
    cursor: u64,
    acked_bytes: u64,
    outstanding: BTreeMap<u64, SentFragment>,
}

impl FragmentWindow {
    /// Creates a window for a payload of `total_len` bytes.
    ///
    /// A depth of 1 degrades to strict request/acknowledge sequencing.
    pub fn new(depth: usize, total_len: u64) -> Self {
        Self {
            depth: depth.max(1),
            total_len,
            cursor: 0,
            acked_bytes: 0,
            outstanding: BTreeMap::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Next offset to send from.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Cumulative payload bytes acknowledged so far.
    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes
    }

    /// `true` while another fragment may be emitted: the pipeline has a free
    /// slot and payload bytes remain unsent.
    pub fn has_capacity(&self) -> bool {
        self.outstanding.len() < self.depth && self.cursor < self.total_len
    }

    /// Records a fragment as sent and advances the cursor.
    pub fn record_sent(&mut self, offset: u64, len: u64) -> Result<(), WindowError> {
        if offset != self.cursor {
            return Err(WindowError::NonContiguousSend {
                offset,
                cursor: self.cursor,
            });
        }
        self.outstanding
            .insert(offset + len, SentFragment { offset, len });
        self.cursor = offset + len;
        Ok(())
    }

    /// Matches an acknowledgment against the outstanding set.
    pub fn acknowledge(&mut self, offset: u64) -> Result<SentFragment, WindowError> {
        let fragment = self
            .outstanding
            .remove(&offset)
            .ok_or(WindowError::UnexpectedAck { offset })?;
        self.acked_bytes += fragment.len;
        Ok(fragment)
    }

    /// `true` once every emitted fragment has been acknowledged.
    pub fn all_acknowledged(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// `true` once the entire payload is acknowledged.
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty() && self.acked_bytes == self.total_len
    }

    /// Largest offset below which every byte is acknowledged. Fragments are
    /// emitted contiguously, so this is the lowest outstanding fragment's
    /// offset, or the cursor when nothing is in flight.
    pub fn confirmed_offset(&self) -> u64 {
        self.outstanding
            .values()
            .map(|f| f.offset)
            .min()
            .unwrap_or(self.cursor)
    }

    /// Discards all in-flight state and restarts the window at `offset`.
    ///
    /// Used after an MTU renegotiation: fragments sent under the old MTU are
    /// no longer valid and will be resent at the new size.
    pub fn reset_to(&mut self, offset: u64) {
        self.outstanding.clear();
        self.cursor = offset;
        self.acked_bytes = offset;
    }

    /// Shrinks the pipeline depth, keeping in-flight fragments intact.
    ///
    /// When more fragments are outstanding than the new depth allows, no new
    /// fragments are emitted until the excess drains. Growing the depth
    /// mid-transfer is not supported.
    pub fn shrink_depth(&mut self, depth: usize) {
        self.depth = depth.clamp(1, self.depth);
    }
}
