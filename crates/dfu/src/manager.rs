//! Public entry points: starting transfers and controlling them.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use devmgr_transfer::checksum::sha256;
use devmgr_transfer::planner::ByteAlignment;
use devmgr_transfer::transport::Transport;

use crate::downloader::DownloadRunner;
use crate::error::TransferError;
use crate::session::{Session, TransferPhase};
use crate::types::{Command, DownloadEvent, TargetKind, TransferEvent, UploadConfig, UploadTarget};
use crate::uploader::UploadRunner;

/// Entry point for transfers over one logical channel.
///
/// At most one transfer is active per manager at a time; starting a second
/// one fails synchronously without side effects. Each started transfer runs
/// on its own spawned task, which owns the session for the full asynchronous
/// duration — dropping the returned handle does not tear the transfer down.
pub struct DfuManager {
    transport: Arc<dyn Transport>,
    active: Arc<Mutex<Option<Uuid>>>,
}

impl DfuManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts a multi-target upload.
    ///
    /// Targets are uploaded back to back: no fragment of target `i + 1` is
    /// emitted before every fragment of target `i` is acknowledged. SUIT
    /// envelopes are moved ahead of caches, and firmware targets without a
    /// digest get one computed here.
    ///
    /// Returns the control handle and the event stream. Exactly one terminal
    /// event arrives per attempt.
    pub fn upload(
        &self,
        targets: Vec<UploadTarget>,
        config: UploadConfig,
    ) -> Result<(TransferHandle, mpsc::Receiver<TransferEvent>), TransferError> {
        if targets.is_empty() || targets.iter().any(|t| t.is_empty()) {
            return Err(TransferError::EmptyTransfer);
        }
        if config.pipeline_depth == 0 {
            return Err(TransferError::InvalidConfig(
                "pipeline depth must be at least 1".into(),
            ));
        }
        if targets
            .iter()
            .any(|t| t.kind == TargetKind::File && t.name.is_none())
        {
            return Err(TransferError::InvalidConfig(
                "filesystem targets need a name".into(),
            ));
        }
        if config.pipelining_enabled() && config.byte_alignment == ByteAlignment::Disabled {
            warn!("pipelining without byte alignment; offset jumps may not match the peer");
        }

        let guard = self.claim()?;
        let id = guard.id;

        let mut targets = targets;
        // The envelope describes everything that follows; a SUIT peer needs
        // it before any cache arrives. The sort is stable, so the caller's
        // order is otherwise preserved.
        targets.sort_by_key(|t| match t.kind {
            TargetKind::Envelope => 0,
            _ => 1,
        });
        for target in &mut targets {
            if target.kind == TargetKind::Firmware && target.hash.is_empty() {
                target.hash = sha256(&target.data);
            }
        }
        let defer_install = targets.iter().any(|t| t.kind == TargetKind::Cache);
        debug!(id = %id, targets = targets.len(), defer_install, "starting upload");

        let session = Arc::new(Session::new());
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let runner = UploadRunner {
            transport: Arc::clone(&self.transport),
            session: Arc::clone(&session),
            targets,
            config,
            defer_install,
            events: events_tx,
            commands: commands_rx,
            cancel: cancel.clone(),
            _guard: guard,
            seq: 0,
            session_id: None,
        };
        tokio::spawn(runner.run());

        Ok((
            TransferHandle {
                id,
                session,
                cancel,
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    /// Starts a file download from the peer's filesystem.
    pub fn download(
        &self,
        name: impl Into<String>,
    ) -> Result<(TransferHandle, mpsc::Receiver<DownloadEvent>), TransferError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TransferError::InvalidConfig("file name is empty".into()));
        }

        let guard = self.claim()?;
        let id = guard.id;
        debug!(id = %id, %name, "starting download");

        let session = Arc::new(Session::new());
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let runner = DownloadRunner {
            transport: Arc::clone(&self.transport),
            session: Arc::clone(&session),
            name,
            events: events_tx,
            commands: commands_rx,
            cancel: cancel.clone(),
            _guard: guard,
            seq: 0,
        };
        tokio::spawn(runner.run());

        Ok((
            TransferHandle {
                id,
                session,
                cancel,
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    /// `true` while a transfer owns the channel.
    pub fn is_busy(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    fn claim(&self) -> Result<ActiveGuard, TransferError> {
        let mut slot = self.active.lock().unwrap();
        if slot.is_some() {
            return Err(TransferError::AlreadyActive);
        }
        let id = Uuid::new_v4();
        *slot = Some(id);
        Ok(ActiveGuard {
            slot: Arc::clone(&self.active),
            id,
        })
    }
}

/// Owns the channel's active-transfer slot for the lifetime of one transfer
/// task; releases it on drop, whichever way the task ends.
pub(crate) struct ActiveGuard {
    slot: Arc<Mutex<Option<Uuid>>>,
    pub(crate) id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap();
        if *slot == Some(self.id) {
            *slot = None;
        }
    }
}

/// Control handle for a running transfer.
#[derive(Clone, Debug)]
pub struct TransferHandle {
    id: Uuid,
    session: Arc<Session>,
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
}

impl TransferHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> TransferPhase {
        self.session.phase()
    }

    /// Suppresses further fragment emission. Acknowledgments for fragments
    /// already in flight are still processed, and the window state is kept so
    /// [`resume`](Self::resume) continues from the last confirmed offset.
    pub async fn pause(&self) {
        let _ = self.commands.send(Command::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(Command::Resume).await;
    }

    /// Cooperative cancel: fragments already sent are not recalled, their
    /// acknowledgments are discarded, and no new fragments are emitted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Supplies the resource the peer asked for via
    /// [`TransferEvent::ResourceRequested`]. The bytes are uploaded under the
    /// session id the peer handed out, then polling resumes.
    pub async fn supply_resource(&self, data: impl Into<Arc<[u8]>>) {
        let _ = self
            .commands
            .send(Command::SupplyResource(data.into()))
            .await;
    }
}
