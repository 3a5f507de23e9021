//! Pipelined upload driver.
//!
//! One spawned task owns the whole transfer: it negotiates capabilities,
//! pumps fragments through the transport with bounded concurrency, matches
//! acknowledgments out of order, and dispatches exactly one terminal event
//! when it stops.

use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devmgr_protocol::envelope::Envelope;
use devmgr_protocol::messages::{ChunkRequest, ChunkResponse};
use devmgr_protocol::types::{CommandGroup, DeviceError, Op, suit_cmd};
use devmgr_transfer::planner::{ChunkPlan, PlanInput, plan_chunk, probe_overhead};
use devmgr_transfer::transport::{
    DEFAULT_SEND_TIMEOUT, FAST_SEND_TIMEOUT, Transport, TransportError,
};
use devmgr_transfer::window::FragmentWindow;

use crate::error::TransferError;
use crate::manager::ActiveGuard;
use crate::negotiator::{self, PeerCapabilities, PollOutcome};
use crate::session::Session;
use crate::types::{Command, TargetKind, TransferEvent, UploadConfig, UploadTarget, next_seq};

/// How a finished run ends; errors travel separately.
enum Outcome {
    Finished,
    Cancelled,
}

enum TargetOutcome {
    Complete,
    Cancelled,
}

pub(crate) struct UploadRunner {
    pub transport: Arc<dyn Transport>,
    pub session: Arc<Session>,
    pub targets: Vec<UploadTarget>,
    pub config: UploadConfig,
    pub defer_install: bool,
    pub events: mpsc::Sender<TransferEvent>,
    pub commands: mpsc::Receiver<Command>,
    pub cancel: CancellationToken,
    /// Held for its drop: releases the channel's active-transfer slot.
    pub _guard: ActiveGuard,
    pub seq: u8,
    pub session_id: Option<u64>,
}

impl UploadRunner {
    pub(crate) async fn run(mut self) {
        match self.drive().await {
            Ok(Outcome::Finished) => {
                let _ = self.session.finish();
                info!("upload finished");
                self.emit(TransferEvent::Finished).await;
            }
            Ok(Outcome::Cancelled) => {
                self.session.cancel();
                info!("upload cancelled");
                self.emit(TransferEvent::Cancelled).await;
            }
            Err(error) => {
                self.session.fail();
                warn!(%error, "upload failed");
                self.emit(TransferEvent::Failed {
                    error: Arc::new(error),
                })
                .await;
            }
        }
        // Dropping the guard here releases the channel for the next
        // transfer, after the terminal event is already dispatched.
    }

    async fn drive(&mut self) -> Result<Outcome, TransferError> {
        self.session.begin_negotiation()?;
        let limits =
            negotiator::negotiate(&*self.transport, &self.config, &mut self.seq).await?;
        let reassembly = limits.reassembly;
        let mut stored = limits.capabilities;
        let mut first_ack_seen = false;

        let mut index = 0;
        while index < self.targets.len() {
            self.session.activate(index)?;
            let target = self.targets[index].clone();
            info!(
                index,
                name = %target.display_name(),
                size = target.len(),
                "uploading target"
            );
            self.emit(TransferEvent::TargetStarted {
                index,
                name: target.display_name(),
                size: target.len(),
            })
            .await;

            match self
                .run_target(&target, reassembly, &mut stored, &mut first_ack_seen)
                .await?
            {
                TargetOutcome::Complete => index += 1,
                TargetOutcome::Cancelled => return Ok(Outcome::Cancelled),
            }
        }

        if !self.needs_completion() {
            return Ok(Outcome::Finished);
        }

        self.session.begin_completion()?;
        if self.defer_install {
            self.send_commit().await?;
        }
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(Outcome::Cancelled),
                outcome = negotiator::poll_completion(&*self.transport, &mut self.seq) => outcome?,
            };
            match outcome {
                PollOutcome::Ready => return Ok(Outcome::Finished),
                PollOutcome::ResourceRequested {
                    resource,
                    session_id,
                } => {
                    info!(%resource, session_id, "peer requested a resource");
                    self.emit(TransferEvent::ResourceRequested { resource }).await;

                    let Some(data) = self.wait_for_resource().await else {
                        return Ok(Outcome::Cancelled);
                    };
                    self.session_id = Some(session_id);
                    let target = UploadTarget::resource(data);
                    self.targets.push(target.clone());
                    let index = self.targets.len() - 1;
                    self.session.activate(index)?;
                    self.emit(TransferEvent::TargetStarted {
                        index,
                        name: target.display_name(),
                        size: target.len(),
                    })
                    .await;
                    let outcome = self
                        .run_target(&target, reassembly, &mut stored, &mut first_ack_seen)
                        .await?;
                    self.session_id = None;
                    match outcome {
                        TargetOutcome::Complete => self.session.begin_completion()?,
                        TargetOutcome::Cancelled => return Ok(Outcome::Cancelled),
                    }
                }
            }
        }
    }

    /// Uploads one target, keeping up to `pipeline_depth` fragments in
    /// flight. Returns once every byte is acknowledged.
    async fn run_target(
        &mut self,
        target: &UploadTarget,
        reassembly: u64,
        stored: &mut Option<PeerCapabilities>,
        first_ack_seen: &mut bool,
    ) -> Result<TargetOutcome, TransferError> {
        let total = target.len();
        let mut window = FragmentWindow::new(self.config.pipeline_depth, total);
        let mut paused = false;
        let mut renegotiated_at: Option<u64> = None;
        let mut inflight: FuturesUnordered<
            BoxFuture<'static, Result<Envelope, TransportError>>,
        > = FuturesUnordered::new();

        loop {
            // Keep the window full; pausing suppresses emission but leaves
            // the window state intact so resume needs no replanning.
            while !paused && window.has_capacity() {
                let offset = window.cursor();
                let overhead = self.fragment_overhead(target, offset, total)?;
                let plan = plan_chunk(&PlanInput {
                    total_len: total,
                    offset,
                    overhead,
                    mtu: self.transport.mtu(),
                    reassembly_buffer: reassembly,
                    alignment: self.config.byte_alignment,
                })?;
                let ChunkPlan::Data { offset, len } = plan else {
                    break;
                };

                let payload =
                    &target.data[offset as usize..(offset + len) as usize];
                let request = self.build_chunk(target, offset, payload.to_vec(), total);
                let envelope = Envelope::request(
                    next_seq(&mut self.seq),
                    Op::Write,
                    target.kind.group(),
                    target.kind.command(),
                    Some(&request),
                )?;
                let timeout = if offset == 0 {
                    DEFAULT_SEND_TIMEOUT
                } else {
                    FAST_SEND_TIMEOUT
                };
                window.record_sent(offset, len)?;
                debug!(offset, len, in_flight = window.in_flight(), "fragment sent");

                let transport = Arc::clone(&self.transport);
                inflight
                    .push(async move { transport.send(envelope, timeout).await }.boxed());
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // Fragments already sent cannot be recalled; dropping the
                    // in-flight futures discards their acknowledgments.
                    return Ok(TargetOutcome::Cancelled);
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Pause => match self.session.pause() {
                        Ok(()) => {
                            paused = true;
                            info!(offset = window.confirmed_offset(), "upload paused");
                        }
                        Err(error) => warn!(%error, "pause ignored"),
                    },
                    Command::Resume => match self.session.resume() {
                        Ok(()) => {
                            paused = false;
                            info!(offset = window.confirmed_offset(), "upload resumed");
                        }
                        Err(error) => warn!(%error, "resume ignored"),
                    },
                    Command::SupplyResource(_) => {
                        warn!("no resource was requested; ignoring");
                    }
                },
                Some(result) = inflight.next() => match result {
                    Err(TransportError::InsufficientBuffer { required }) => {
                        let confirmed = window.confirmed_offset();
                        if renegotiated_at == Some(confirmed) {
                            return Err(TransferError::RenegotiationStalled {
                                offset: confirmed,
                            });
                        }
                        renegotiated_at = Some(confirmed);
                        self.transport.set_mtu(required)?;
                        // Fragments sent under the old MTU are void; restart
                        // the window at the last confirmed offset.
                        window.reset_to(confirmed);
                        inflight.clear();
                        info!(
                            mtu = required,
                            offset = confirmed,
                            "window restarted after buffer renegotiation"
                        );
                    }
                    Err(error) => return Err(error.into()),
                    Ok(response) => {
                        let off =
                            self.handle_ack(&response, target.kind.group(), &mut window)?;
                        if !*first_ack_seen {
                            *first_ack_seen = true;
                            if let Some(capabilities) = stored.take() {
                                negotiator::apply_correction(
                                    &capabilities,
                                    &mut window,
                                    &*self.transport,
                                );
                            }
                        }
                        self.session.set_offset(window.confirmed_offset());
                        self.emit(TransferEvent::Progress {
                            bytes: window.acked_bytes(),
                            total,
                            timestamp: Utc::now(),
                        })
                        .await;
                        debug!(off, acked = window.acked_bytes(), "fragment acknowledged");
                        if window.is_complete() {
                            info!(total, "target upload complete");
                            return Ok(TargetOutcome::Complete);
                        }
                    }
                },
            }
        }
    }

    /// Validates one acknowledgment and matches it against the window.
    fn handle_ack(
        &self,
        response: &Envelope,
        group: CommandGroup,
        window: &mut FragmentWindow,
    ) -> Result<u64, TransferError> {
        if let Some(error) = &response.error {
            return Err(DeviceError::from_group_code(group, error.code.unsigned_abs()).into());
        }
        let payload: ChunkResponse = response
            .parse_payload()?
            .ok_or(TransferError::MissingField("payload"))?;
        if let Some(rc) = payload.rc.filter(|rc| *rc != 0) {
            return Err(DeviceError::from_group_code(group, rc).into());
        }
        let off = payload.off.ok_or(TransferError::MissingField("off"))?;
        window.acknowledge(off)?;
        Ok(off)
    }

    /// Builds the fragment payload for `offset`, with the first-fragment
    /// header fields when applicable.
    fn build_chunk(
        &self,
        target: &UploadTarget,
        offset: u64,
        data: Vec<u8>,
        total: u64,
    ) -> ChunkRequest {
        let first = offset == 0;
        ChunkRequest {
            name: match target.kind {
                TargetKind::File => target.name.clone(),
                _ => None,
            },
            off: offset,
            data,
            len: first.then_some(total),
            image: (first && target.kind == TargetKind::Firmware && target.image > 0)
                .then_some(target.image),
            sha: (first && target.kind == TargetKind::Firmware)
                .then(|| target.hash.clone())
                .filter(|hash| !hash.is_empty()),
            session_id: match target.kind {
                TargetKind::Resource => self.session_id,
                _ => None,
            },
            target_id: match target.kind {
                TargetKind::Cache => Some(target.image as u64),
                _ => None,
            },
            defer_install: (first && target.kind == TargetKind::Envelope && self.defer_install)
                .then_some(true),
        }
    }

    /// Measures the encoded size of this offset's fragment with a zero-length
    /// data placeholder.
    fn fragment_overhead(
        &self,
        target: &UploadTarget,
        offset: u64,
        total: u64,
    ) -> Result<usize, TransferError> {
        let probe = self.build_chunk(target, offset, Vec::new(), total);
        let envelope = Envelope::request(
            0,
            Op::Write,
            target.kind.group(),
            target.kind.command(),
            Some(&probe),
        )?;
        Ok(probe_overhead(&envelope, self.transport.scheme())?)
    }

    /// Explicit completion signal: zero bytes at offset zero, telling the
    /// peer to process what it has received.
    async fn send_commit(&mut self) -> Result<(), TransferError> {
        let request = ChunkRequest {
            name: None,
            off: 0,
            data: Vec::new(),
            len: Some(0),
            image: None,
            sha: None,
            session_id: None,
            target_id: None,
            defer_install: None,
        };
        let envelope = Envelope::request(
            next_seq(&mut self.seq),
            Op::Write,
            CommandGroup::Suit,
            suit_cmd::ENVELOPE_UPLOAD,
            Some(&request),
        )?;
        info!("sending commit for deferred install");
        let response = self.transport.send(envelope, DEFAULT_SEND_TIMEOUT).await?;
        if let Some(error) = &response.error {
            return Err(DeviceError::from_group_code(
                CommandGroup::Suit,
                error.code.unsigned_abs(),
            )
            .into());
        }
        if let Some(rc) = response
            .parse_payload::<ChunkResponse>()?
            .and_then(|payload| payload.rc)
            .filter(|rc| *rc != 0)
        {
            return Err(DeviceError::from_group_code(CommandGroup::Suit, rc).into());
        }
        Ok(())
    }

    /// Blocks until the caller supplies the requested resource. A dropped
    /// handle means the resource can never arrive, which ends the transfer
    /// as cancelled.
    async fn wait_for_resource(&mut self) -> Option<Arc<[u8]>> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                command = self.commands.recv() => match command {
                    Some(Command::SupplyResource(data)) => return Some(data),
                    Some(Command::Pause) | Some(Command::Resume) => {
                        warn!("pause is not available while waiting for a resource");
                    }
                    None => return None,
                },
            }
        }
    }

    /// SUIT-style targets are followed by the completion poll; plain image
    /// and file uploads finish as soon as the last byte is acknowledged.
    fn needs_completion(&self) -> bool {
        self.targets
            .iter()
            .any(|t| matches!(t.kind, TargetKind::Envelope | TargetKind::Cache))
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event).await;
    }
}
