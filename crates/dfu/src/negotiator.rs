//! Capability negotiation and the completion poll loop.

use std::time::Duration;

use tracing::{debug, info, warn};

use devmgr_protocol::envelope::Envelope;
use devmgr_protocol::messages::{ParamsResponse, PollResponse};
use devmgr_protocol::types::{CommandGroup, Op, ReturnCode, default_cmd, suit_cmd};
use devmgr_transfer::MAX_REASSEMBLY_SIZE;
use devmgr_transfer::transport::{DEFAULT_SEND_TIMEOUT, Transport};
use devmgr_transfer::window::FragmentWindow;

use crate::error::TransferError;
use crate::types::{UploadConfig, next_seq};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Poll attempts before absence of a resource request is read as completion:
/// a 5-second window at 150 ms.
pub(crate) const MAX_POLL_ATTEMPTS: u32 = 33;

/// Peer buffering limits reported by the capability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeerCapabilities {
    pub buffer_size: Option<u64>,
    pub buffer_count: Option<u64>,
}

/// Outcome of the initial parameter exchange.
#[derive(Debug)]
pub(crate) struct NegotiatedLimits {
    /// Reassembly budget for fragment planning (0 = plan against MTU alone).
    pub reassembly: u64,
    /// Raw response retained for the one-time correction after the first
    /// fragment acknowledgment.
    pub capabilities: Option<PeerCapabilities>,
}

/// Queries the peer's buffer limits, once per transfer.
///
/// An explicit "unsupported" answer (either form: error envelope, unsupported
/// return code, or a response with neither field) falls back to the caller's
/// configuration and is not an error. The one adjustment applied immediately
/// is the MTU shrink: a fragment sized for an MTU larger than the peer's
/// reassembly buffer could never be acknowledged.
pub(crate) async fn negotiate(
    transport: &dyn Transport,
    config: &UploadConfig,
    seq: &mut u8,
) -> Result<NegotiatedLimits, TransferError> {
    let request = Envelope::request::<()>(
        next_seq(seq),
        Op::Read,
        CommandGroup::Default,
        default_cmd::PARAMS,
        None,
    )?;
    let response = transport.send(request, DEFAULT_SEND_TIMEOUT).await?;

    let fallback = NegotiatedLimits {
        reassembly: config.reassembly_buffer.min(MAX_REASSEMBLY_SIZE),
        capabilities: None,
    };

    if let Some(error) = &response.error {
        debug!(code = error.code, "capability query not supported");
        return Ok(fallback);
    }
    let Some(params) = response.parse_payload::<ParamsResponse>()? else {
        return Ok(fallback);
    };
    if let Some(rc) = params.rc
        && !ReturnCode(rc).is_supported()
    {
        debug!(rc, "capability query not supported");
        return Ok(fallback);
    }
    if params.buf_size.is_none() && params.buf_count.is_none() {
        debug!("capability response carries no limits");
        return Ok(fallback);
    }

    info!(
        buf_count = ?params.buf_count,
        buf_size = ?params.buf_size,
        "peer capabilities received"
    );

    let mut reassembly = fallback.reassembly;
    let buffer_size = params.buf_size.map(|size| size.min(MAX_REASSEMBLY_SIZE));
    if let Some(size) = buffer_size {
        reassembly = size;
        let mtu = transport.mtu() as u64;
        if size < mtu {
            warn!(
                reassembly = size,
                mtu, "shrinking MTU to the peer's reassembly buffer"
            );
            transport.set_mtu(size as usize)?;
        }
    }

    Ok(NegotiatedLimits {
        reassembly,
        capabilities: Some(PeerCapabilities {
            buffer_size,
            buffer_count: params.buf_count,
        }),
    })
}

/// One-time revision applied after the first fragment acknowledgment, once
/// the initial exchange can no longer stall on an undersized buffer.
pub(crate) fn apply_correction(
    capabilities: &PeerCapabilities,
    window: &mut FragmentWindow,
    transport: &dyn Transport,
) {
    if let Some(count) = capabilities.buffer_count {
        let derived = count.saturating_sub(1).max(1) as usize;
        if derived < window.depth() {
            warn!(
                derived,
                configured = window.depth(),
                "peer buffer count shrinks pipeline depth"
            );
            window.shrink_depth(derived);
        }
    }
    if let Some(size) = capabilities.buffer_size
        && size > transport.mtu() as u64
    {
        debug!(reassembly = size, "enabling transport reassembly");
        transport.set_reassembly(true);
    }
}

/// Result of the completion poll phase.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// The peer no longer needs anything; the transfer is complete.
    Ready,
    /// The peer wants `resource` delivered under `session_id`.
    ResourceRequested { resource: String, session_id: u64 },
}

/// Polls the peer after the last byte is delivered.
///
/// The protocol has no server push: the only way to learn that the peer needs
/// an out-of-band resource is to ask repeatedly. Poll errors and exhausted
/// attempts both mean the peer has moved on (likely reset to apply the
/// update) and count as success, not failure.
pub(crate) async fn poll_completion(
    transport: &dyn Transport,
    seq: &mut u8,
) -> Result<PollOutcome, TransferError> {
    for attempt in 0..MAX_POLL_ATTEMPTS {
        let request = Envelope::request::<()>(
            next_seq(seq),
            Op::Read,
            CommandGroup::Suit,
            suit_cmd::POLL_IMAGE_STATE,
            None,
        )?;
        let response = match transport.send(request, DEFAULT_SEND_TIMEOUT).await {
            Ok(response) => response,
            Err(error) => {
                debug!(%error, "poll failed; treating as completion");
                return Ok(PollOutcome::Ready);
            }
        };
        if response.error.is_some() {
            return Ok(PollOutcome::Ready);
        }
        let payload = response.parse_payload::<PollResponse>()?.unwrap_or_default();
        if let Some(rc) = payload.rc
            && !ReturnCode(rc).is_supported()
        {
            return Ok(PollOutcome::Ready);
        }
        if let (Some(resource), Some(session_id)) = (payload.resource_id, payload.session_id) {
            return Ok(PollOutcome::ResourceRequested {
                resource,
                session_id,
            });
        }

        // An empty response means "keep waiting".
        debug!(attempt, "peer not ready; polling again");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(PollOutcome::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockPeer, PollReply};

    #[tokio::test]
    async fn unsupported_query_falls_back_to_config() {
        let peer = MockPeer::new(512);
        let config = UploadConfig {
            reassembly_buffer: 2048,
            ..Default::default()
        };
        let mut seq = 0;
        let limits = negotiate(&peer, &config, &mut seq).await.unwrap();
        assert_eq!(limits.reassembly, 2048);
        assert!(limits.capabilities.is_none());
    }

    #[tokio::test]
    async fn caller_reassembly_is_capped_to_wire_limit() {
        let peer = MockPeer::new(512);
        let config = UploadConfig {
            reassembly_buffer: 1 << 20,
            ..Default::default()
        };
        let mut seq = 0;
        let limits = negotiate(&peer, &config, &mut seq).await.unwrap();
        assert_eq!(limits.reassembly, MAX_REASSEMBLY_SIZE);
    }

    #[tokio::test]
    async fn peer_buffer_size_wins_and_is_capped() {
        let peer = MockPeer::new(512);
        peer.state.lock().unwrap().params = Some((Some(1 << 20), Some(4)));
        let mut seq = 0;
        let limits = negotiate(&peer, &UploadConfig::default(), &mut seq)
            .await
            .unwrap();
        assert_eq!(limits.reassembly, MAX_REASSEMBLY_SIZE);
        let caps = limits.capabilities.unwrap();
        assert_eq!(caps.buffer_size, Some(MAX_REASSEMBLY_SIZE));
        assert_eq!(caps.buffer_count, Some(4));
        // 65535 > 512, no MTU shrink.
        assert!(peer.mtu_changes().is_empty());
    }

    #[tokio::test]
    async fn undersized_buffer_shrinks_mtu() {
        let peer = MockPeer::new(500);
        peer.state.lock().unwrap().params = Some((Some(300), Some(4)));
        let mut seq = 0;
        let limits = negotiate(&peer, &UploadConfig::default(), &mut seq)
            .await
            .unwrap();
        assert_eq!(limits.reassembly, 300);
        assert_eq!(peer.mtu_changes(), vec![300]);
        assert_eq!(peer.mtu(), 300);
    }

    #[tokio::test]
    async fn correction_shrinks_depth_and_enables_reassembly() {
        let peer = MockPeer::new(200);
        let caps = PeerCapabilities {
            buffer_size: Some(4096),
            buffer_count: Some(2),
        };
        let mut window = FragmentWindow::new(4, 10_000);
        apply_correction(&caps, &mut window, &peer);
        assert_eq!(window.depth(), 1);
        assert!(peer.reassembly_enabled());
    }

    #[tokio::test]
    async fn correction_never_grows_depth() {
        let peer = MockPeer::new(200);
        let caps = PeerCapabilities {
            buffer_size: None,
            buffer_count: Some(10),
        };
        let mut window = FragmentWindow::new(2, 10_000);
        apply_correction(&caps, &mut window, &peer);
        assert_eq!(window.depth(), 2);
        assert!(!peer.reassembly_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reports_requested_resource() {
        let peer = MockPeer::new(512);
        peer.state.lock().unwrap().polls = vec![
            PollReply::Empty,
            PollReply::Resource {
                resource: "file://radio.bin".into(),
                session_id: 7,
            },
        ];
        let mut seq = 0;
        let outcome = poll_completion(&peer, &mut seq).await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::ResourceRequested {
                resource: "file://radio.bin".into(),
                session_id: 7,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_unsupported_is_completion() {
        let peer = MockPeer::new(512);
        peer.state.lock().unwrap().polls = vec![PollReply::NotSupported];
        let mut seq = 0;
        assert_eq!(
            poll_completion(&peer, &mut seq).await.unwrap(),
            PollOutcome::Ready
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_transport_error_is_completion() {
        let peer = MockPeer::new(512);
        peer.state.lock().unwrap().polls = vec![PollReply::Disconnect];
        let mut seq = 0;
        assert_eq!(
            poll_completion(&peer, &mut seq).await.unwrap(),
            PollOutcome::Ready
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_exhaustion_is_completion() {
        let peer = MockPeer::new(512);
        // No scripted replies: every poll comes back empty.
        let mut seq = 0;
        assert_eq!(
            poll_completion(&peer, &mut seq).await.unwrap(),
            PollOutcome::Ready
        );
        let polls = peer.state.lock().unwrap().poll_count;
        assert_eq!(polls, MAX_POLL_ATTEMPTS);
    }
}
