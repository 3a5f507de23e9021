//! Sequential chunked download driver.
//!
//! Downloads are strictly request/response: the peer sizes each chunk, the
//! first response carries the total length, and the engine asks for the next
//! offset once the previous chunk lands. Pipelining does not apply.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devmgr_protocol::envelope::Envelope;
use devmgr_protocol::messages::{ReadRequest, ReadResponse};
use devmgr_protocol::types::{CommandGroup, DeviceError, Op, fs_cmd};
use devmgr_transfer::transport::{
    DEFAULT_SEND_TIMEOUT, FAST_SEND_TIMEOUT, Transport, TransportError,
};

use crate::error::TransferError;
use crate::manager::ActiveGuard;
use crate::session::Session;
use crate::types::{Command, DownloadEvent, next_seq};

pub(crate) struct DownloadRunner {
    pub transport: Arc<dyn Transport>,
    pub session: Arc<Session>,
    pub name: String,
    pub events: mpsc::Sender<DownloadEvent>,
    pub commands: mpsc::Receiver<Command>,
    pub cancel: CancellationToken,
    /// Held for its drop: releases the channel's active-transfer slot.
    pub _guard: ActiveGuard,
    pub seq: u8,
}

impl DownloadRunner {
    pub(crate) async fn run(mut self) {
        match self.drive().await {
            Ok(Some(data)) => {
                let _ = self.session.finish();
                info!(name = %self.name, size = data.len(), "download finished");
                let name = self.name.clone();
                self.emit(DownloadEvent::Finished { name, data }).await;
            }
            Ok(None) => {
                self.session.cancel();
                info!(name = %self.name, "download cancelled");
                self.emit(DownloadEvent::Cancelled).await;
            }
            Err(error) => {
                self.session.fail();
                warn!(name = %self.name, %error, "download failed");
                self.emit(DownloadEvent::Failed {
                    error: Arc::new(error),
                })
                .await;
            }
        }
    }

    async fn drive(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        self.session.begin_negotiation()?;
        // Downloads carry no capability exchange; the peer sizes each chunk.
        self.session.activate(0)?;

        let mut data: Vec<u8> = Vec::new();
        let mut total: Option<u64> = None;
        let mut paused = false;
        let mut renegotiated_at: Option<u64> = None;

        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.apply_command(command, &mut paused);
            }
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if paused {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(None),
                    command = self.commands.recv() => match command {
                        Some(command) => self.apply_command(command, &mut paused),
                        None => {
                            // Handle dropped while paused; only cancel can
                            // end the transfer now.
                            self.cancel.cancelled().await;
                            return Ok(None);
                        }
                    },
                }
                continue;
            }

            let offset = data.len() as u64;
            let request = ReadRequest {
                name: self.name.clone(),
                off: offset,
            };
            let envelope = Envelope::request(
                next_seq(&mut self.seq),
                Op::Read,
                CommandGroup::Filesystem,
                fs_cmd::FILE,
                Some(&request),
            )?;
            let timeout = if offset == 0 {
                DEFAULT_SEND_TIMEOUT
            } else {
                FAST_SEND_TIMEOUT
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                result = self.transport.send(envelope, timeout) => result,
            };
            let response = match result {
                Err(TransportError::InsufficientBuffer { required }) => {
                    if renegotiated_at == Some(offset) {
                        return Err(TransferError::RenegotiationStalled { offset });
                    }
                    renegotiated_at = Some(offset);
                    self.transport.set_mtu(required)?;
                    info!(mtu = required, offset, "retrying after buffer renegotiation");
                    continue;
                }
                Err(error) => return Err(error.into()),
                Ok(response) => response,
            };

            if let Some(error) = &response.error {
                return Err(DeviceError::from_group_code(
                    CommandGroup::Filesystem,
                    error.code.unsigned_abs(),
                )
                .into());
            }
            let payload: ReadResponse = response
                .parse_payload()?
                .ok_or(TransferError::MissingField("payload"))?;
            if let Some(rc) = payload.rc.filter(|rc| *rc != 0) {
                return Err(DeviceError::from_group_code(CommandGroup::Filesystem, rc).into());
            }
            let off = payload.off.ok_or(TransferError::MissingField("off"))?;
            if off != offset {
                // Non-pipelined exchange: the peer must answer the offset we
                // asked for.
                return Err(TransferError::OffsetMismatch {
                    expected: offset,
                    actual: off,
                });
            }
            if offset == 0 {
                let len = payload.len.ok_or(TransferError::MissingField("len"))?;
                data.reserve(len as usize);
                total = Some(len);
            }
            let Some(total_len) = total else {
                return Err(TransferError::MissingField("len"));
            };
            if payload.data.is_empty() && (data.len() as u64) < total_len {
                return Err(TransferError::MissingField("data"));
            }

            data.extend_from_slice(&payload.data);
            self.session.set_offset(data.len() as u64);
            debug!(offset = data.len(), total = total_len, "chunk received");
            self.emit(DownloadEvent::Progress {
                bytes: data.len() as u64,
                total: total_len,
                timestamp: Utc::now(),
            })
            .await;

            if data.len() as u64 >= total_len {
                data.truncate(total_len as usize);
                return Ok(Some(std::mem::take(&mut data)));
            }
        }
    }

    fn apply_command(&self, command: Command, paused: &mut bool) {
        match command {
            Command::Pause => match self.session.pause() {
                Ok(()) => {
                    *paused = true;
                    info!("download paused");
                }
                Err(error) => warn!(%error, "pause ignored"),
            },
            Command::Resume => match self.session.resume() {
                Ok(()) => {
                    *paused = false;
                    info!("download resumed");
                }
                Err(error) => warn!(%error, "resume ignored"),
            },
            Command::SupplyResource(_) => {
                warn!("resources do not apply to downloads; ignoring");
            }
        }
    }

    async fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event).await;
    }
}
