//! SyncHub: authoritative state and the intent pipeline.
//!
//! ```text
//!  panel intent ──► SyncHub ──► camera lane (FIFO, one intent at a time)
//!                     │              │
//!                     │              ├──► DeviceLink ──► camera
//!                     │              └──► PresetStore
//!                     ▼
//!          RwLock<HubState> ──► ConnectionRegistry ──► panels
//!                     ▲
//!  TallyFeed ──► TallySink ──► tally task
//! ```
//!
//! Lock order is always hub state, then registry. Button and tally broadcasts
//! are queued while the state write lock is held, so every session sees state
//! changes in the order they were applied, and a snapshot taken under the read
//! lock is never older than the broadcasts that follow it.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::device::{DeviceError, DeviceLink, FocusValue, PresetSlot};
use crate::protocol::{IntentFailure, PositionRef, PresetRow, ProtocolError, ServerMessage, Snapshot};
use crate::registry::{ConnectionRegistry, Outbound, SessionId};
use crate::storage::{ButtonKey, ButtonValue, PresetRecord, PresetStore, StoreError};
use crate::tally::{TallyStatus, TallyUpdate};

/// Hub errors.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("camera {0} is not configured")]
    UnknownCamera(usize),
    #[error("no preset stored for camera {camera} slot {slot}")]
    PresetNotFound { camera: usize, slot: PresetSlot },
    #[error("camera {camera}: {source}")]
    Device {
        camera: usize,
        #[source]
        source: DeviceError,
    },
    #[error("camera {camera}: focus {focus} stored for slot {slot}, but memory set failed: {source}")]
    CommitFailed {
        camera: usize,
        slot: PresetSlot,
        focus: FocusValue,
        #[source]
        source: DeviceError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("camera {0} lane is closed")]
    LaneClosed(usize),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl HubError {
    /// Short machine-readable category for `error` messages.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::UnknownCamera(_) => "unknown_camera",
            HubError::PresetNotFound { .. } => "not_found",
            HubError::Device { .. } => "device",
            HubError::CommitFailed { .. } => "commit_failed",
            HubError::Store(_) => "store",
            HubError::LaneClosed(_) | HubError::Encode(_) | HubError::Bind { .. } => "unavailable",
        }
    }

    pub fn camera(&self) -> Option<usize> {
        match self {
            HubError::UnknownCamera(camera)
            | HubError::PresetNotFound { camera, .. }
            | HubError::Device { camera, .. }
            | HubError::CommitFailed { camera, .. }
            | HubError::LaneClosed(camera) => Some(*camera),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<PresetSlot> {
        match self {
            HubError::PresetNotFound { slot, .. } | HubError::CommitFailed { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

/// Last confirmed state of a camera switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Switch {
    On,
    Off,
    #[default]
    Unknown,
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraStatus {
    pub power: Switch,
    pub focus_lock: Switch,
}

/// Hub tuning.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HubOptions {
    /// Outbound messages buffered per session before it is evicted
    pub session_buffer: usize,
    /// Persist button state through the preset store and reload it at startup
    pub persist_buttons: bool,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            session_buffer: 256,
            persist_buttons: true,
        }
    }
}

/// One configured camera.
pub struct CameraSpec {
    /// Address shown to panels
    pub address: String,
    pub link: DeviceLink,
}

/// Per-camera outcome of a fleet command.
#[derive(Debug)]
pub struct CameraOutcome {
    pub camera: usize,
    pub result: Result<(), HubError>,
}

/// Result of a command sent to every camera.
#[derive(Debug, Default)]
pub struct FleetReport {
    pub outcomes: Vec<CameraOutcome>,
}

impl FleetReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &HubError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.camera, e)))
    }
}

/// Hand-off for tally callbacks. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct TallySink {
    tx: mpsc::UnboundedSender<TallyUpdate>,
}

impl TallySink {
    pub fn notify(&self, update: TallyUpdate) {
        if self.tx.send(update).is_err() {
            log::debug!("Hub stopped; dropping tally update for camera {}", update.camera);
        }
    }
}

struct HubState {
    tally: Vec<TallyStatus>,
    buttons: BTreeMap<ButtonKey, ButtonValue>,
    cameras: Vec<CameraStatus>,
}

struct HubShared {
    addresses: Vec<String>,
    links: Vec<DeviceLink>,
    state: RwLock<HubState>,
    registry: ConnectionRegistry,
    store: Arc<dyn PresetStore>,
    options: HubOptions,
}

type Reply<T> = oneshot::Sender<Result<T, HubError>>;
type Queued<T> = Result<oneshot::Receiver<Result<T, HubError>>, HubError>;

enum LaneJob {
    Save { slot: PresetSlot, reply: Reply<FocusValue> },
    Recall { slot: PresetSlot, reply: Reply<FocusValue> },
    Power { on: bool, reply: Reply<()> },
    FocusLock { on: bool, reply: Reply<()> },
}

/// The synchronization hub. Clones share the same state.
///
/// Background tasks stop once every clone and every [`TallySink`] is dropped.
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<HubShared>,
    lanes: Arc<[mpsc::UnboundedSender<LaneJob>]>,
    tally_tx: mpsc::UnboundedSender<TallyUpdate>,
}

impl SyncHub {
    /// Build the hub and start its lane and tally tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(cameras: Vec<CameraSpec>, store: Arc<dyn PresetStore>, options: HubOptions) -> Self {
        let count = cameras.len();
        let (addresses, links): (Vec<_>, Vec<_>) =
            cameras.into_iter().map(|c| (c.address, c.link)).unzip();

        let buttons = if options.persist_buttons {
            match store.buttons() {
                Ok(buttons) => buttons.into_iter().collect(),
                Err(e) => {
                    log::warn!("Could not reload button state: {e}");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        let inner = Arc::new(HubShared {
            addresses,
            links,
            state: RwLock::new(HubState {
                tally: vec![TallyStatus::Unknown; count],
                buttons,
                cameras: vec![CameraStatus::default(); count],
            }),
            registry: ConnectionRegistry::new(options.session_buffer),
            store,
            options,
        });

        let lanes: Arc<[_]> = (0..count)
            .map(|camera| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_lane(inner.clone(), camera, rx));
                tx
            })
            .collect();

        let (tally_tx, tally_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_tally_updates(inner.clone(), tally_rx));

        log::info!("Hub started with {count} cameras");
        Self {
            inner,
            lanes,
            tally_tx,
        }
    }

    pub fn camera_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Register a new session; its queue starts with the `init` snapshot.
    pub async fn connect(&self) -> Result<(SessionId, mpsc::Receiver<Outbound>), HubError> {
        let session = Uuid::new_v4();
        let state = self.inner.state.read().await;
        let init = ServerMessage::Init(self.inner.snapshot_locked(&state)?).encode()?;
        let rx = self.inner.registry.add(session).await;
        self.inner.registry.send_to(&session, init).await;
        drop(state);

        log::info!("Session {session} connected");
        Ok((session, rx))
    }

    pub async fn disconnect(&self, session: &SessionId) {
        if self.inner.registry.remove(session).await {
            log::info!("Session {session} disconnected");
        }
    }

    pub async fn snapshot(&self) -> Result<Snapshot, HubError> {
        let state = self.inner.state.read().await;
        self.inner.snapshot_locked(&state)
    }

    pub async fn camera_status(&self, camera: usize) -> Option<CameraStatus> {
        self.inner.state.read().await.cameras.get(camera).copied()
    }

    // ─── Intents ──────────────────────────────────────────────────────

    /// Merge button fields and relay `raw` to every other session.
    ///
    /// `key.camera` is validated at the protocol boundary; snapshots only
    /// list rows for configured cameras.
    pub async fn handle_button_update(
        &self,
        sender: SessionId,
        raw: Outbound,
        key: ButtonKey,
        value: ButtonValue,
    ) {
        let mut state = self.inner.state.write().await;
        let merged = {
            let entry = state.buttons.entry(key).or_default();
            entry.extend(value);
            entry.clone()
        };
        if self.inner.options.persist_buttons {
            if let Err(e) = self.inner.store.set_button(key, &merged) {
                log::warn!("Could not persist button {key:?}: {e}");
            }
        }
        self.inner.registry.broadcast(raw, Some(sender)).await;
    }

    /// Inquire focus, store it, then commit the camera memory slot.
    ///
    /// The intent is queued before this returns; dropping the future does not
    /// cancel it. Resolves to the stored focus.
    pub fn handle_save_position(
        &self,
        position: PositionRef,
    ) -> impl Future<Output = Result<FocusValue, HubError>> + Send + 'static {
        let PositionRef { camera, slot } = position;
        let queued = self.enqueue(camera, |reply| LaneJob::Save { slot, reply });
        settle(camera, queued)
    }

    /// Recall a stored preset. Resolves to the recalled focus.
    pub fn handle_recall_position(
        &self,
        position: PositionRef,
    ) -> impl Future<Output = Result<FocusValue, HubError>> + Send + 'static {
        let PositionRef { camera, slot } = position;
        let queued = self.enqueue(camera, |reply| LaneJob::Recall { slot, reply });
        settle(camera, queued)
    }

    pub fn handle_power(&self, on: bool) -> impl Future<Output = FleetReport> + Send + 'static {
        let queued: Vec<_> = (0..self.camera_count())
            .map(|camera| (camera, self.enqueue(camera, |reply| LaneJob::Power { on, reply })))
            .collect();
        collect_fleet(queued)
    }

    pub fn handle_focus_lock(&self, on: bool) -> impl Future<Output = FleetReport> + Send + 'static {
        let queued: Vec<_> = (0..self.camera_count())
            .map(|camera| (camera, self.enqueue(camera, |reply| LaneJob::FocusLock { on, reply })))
            .collect();
        collect_fleet(queued)
    }

    fn enqueue<T>(&self, camera: usize, job: impl FnOnce(Reply<T>) -> LaneJob) -> Queued<T> {
        let lane = self.lanes.get(camera).ok_or(HubError::UnknownCamera(camera))?;
        let (reply, rx) = oneshot::channel();
        lane.send(job(reply)).map_err(|_| HubError::LaneClosed(camera))?;
        Ok(rx)
    }

    // ─── Tally ────────────────────────────────────────────────────────

    /// Apply a tally change and broadcast the full vector to every session.
    pub async fn on_tally_change(&self, camera: usize, status: TallyStatus) {
        self.inner.apply_tally(TallyUpdate { camera, status }).await;
    }

    pub fn tally_sink(&self) -> TallySink {
        TallySink {
            tx: self.tally_tx.clone(),
        }
    }

    // ─── Failure reporting ────────────────────────────────────────────

    /// Tell `session` that its `event` intent failed.
    pub async fn report_failure(&self, session: &SessionId, event: &str, error: &HubError) {
        let failure = IntentFailure {
            event: event.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            camera: error.camera(),
            slot: error.slot(),
        };
        self.send_failure(session, failure).await;
    }

    /// Tell `session` which cameras a fleet command failed on, if any.
    pub async fn report_fleet(&self, session: &SessionId, event: &str, report: &FleetReport) {
        if report.is_success() {
            return;
        }
        let failed: Vec<String> = report.failures().map(|(camera, e)| format!("{camera}: {e}")).collect();
        let failure = IntentFailure {
            event: event.to_string(),
            kind: "partial".to_string(),
            message: format!(
                "{} of {} cameras failed ({})",
                failed.len(),
                report.outcomes.len(),
                failed.join("; ")
            ),
            camera: None,
            slot: None,
        };
        self.send_failure(session, failure).await;
    }

    async fn send_failure(&self, session: &SessionId, failure: IntentFailure) {
        match ServerMessage::Error(failure).encode() {
            Ok(message) => {
                self.inner.registry.send_to(session, message).await;
            }
            Err(e) => log::error!("Could not encode error reply: {e}"),
        }
    }
}

impl HubShared {
    fn snapshot_locked(&self, state: &HubState) -> Result<Snapshot, HubError> {
        let count = self.addresses.len();
        let mut rows: BTreeMap<(usize, PresetSlot), PresetRow> = BTreeMap::new();
        let empty_row = |camera, slot| PresetRow {
            camera,
            slot,
            focus: None,
            button: ButtonValue::new(),
        };

        for record in self.store.all()? {
            if record.camera < count {
                rows.entry((record.camera, record.slot))
                    .or_insert_with(|| empty_row(record.camera, record.slot))
                    .focus = Some(record.focus);
            }
        }
        for (key, value) in &state.buttons {
            if key.camera < count {
                rows.entry((key.camera, key.slot))
                    .or_insert_with(|| empty_row(key.camera, key.slot))
                    .button = value.clone();
            }
        }

        Ok(Snapshot {
            camera_addresses: self.addresses.clone(),
            all_presets: rows.into_values().collect(),
            tally_states: state.tally.clone(),
        })
    }

    async fn apply_tally(&self, update: TallyUpdate) {
        let mut state = self.state.write().await;
        let Some(entry) = state.tally.get_mut(update.camera) else {
            log::warn!("Ignoring tally update for unknown camera {}", update.camera);
            return;
        };
        *entry = update.status;
        log::debug!("Camera {} tally is now {:?}", update.camera, update.status);

        match ServerMessage::UpdateTally(state.tally.clone()).encode() {
            Ok(message) => {
                self.registry.broadcast(message, None).await;
            }
            Err(e) => log::error!("Could not encode tally update: {e}"),
        }
    }

    async fn save(&self, camera: usize, slot: PresetSlot) -> Result<FocusValue, HubError> {
        let link = &self.links[camera];
        let focus = link
            .inquire_focus()
            .await
            .map_err(|source| HubError::Device { camera, source })?;
        self.store.set(PresetRecord { camera, slot, focus })?;
        link.commit_memory(slot)
            .await
            .map_err(|source| HubError::CommitFailed {
                camera,
                slot,
                focus,
                source,
            })?;
        Ok(focus)
    }

    async fn recall(&self, camera: usize, slot: PresetSlot) -> Result<FocusValue, HubError> {
        let focus = self
            .store
            .get(camera, slot)?
            .ok_or(HubError::PresetNotFound { camera, slot })?;
        self.links[camera]
            .recall(slot, focus)
            .await
            .map_err(|source| HubError::Device { camera, source })?;
        Ok(focus)
    }

    async fn set_power(&self, camera: usize, on: bool) -> Result<(), HubError> {
        self.links[camera]
            .set_power(on)
            .await
            .map_err(|source| HubError::Device { camera, source })?;
        self.state.write().await.cameras[camera].power = on.into();
        Ok(())
    }

    async fn set_focus_lock(&self, camera: usize, on: bool) -> Result<(), HubError> {
        self.links[camera]
            .set_focus_lock(on)
            .await
            .map_err(|source| HubError::Device { camera, source })?;
        self.state.write().await.cameras[camera].focus_lock = on.into();
        Ok(())
    }
}

async fn settle<T>(camera: usize, queued: Queued<T>) -> Result<T, HubError> {
    queued?.await.map_err(|_| HubError::LaneClosed(camera))?
}

async fn collect_fleet(queued: Vec<(usize, Queued<()>)>) -> FleetReport {
    let outcomes = join_all(queued.into_iter().map(|(camera, queued)| async move {
        CameraOutcome {
            camera,
            result: settle(camera, queued).await,
        }
    }))
    .await;
    FleetReport { outcomes }
}

/// Runs one camera's intents strictly in arrival order.
async fn run_lane(shared: Arc<HubShared>, camera: usize, mut jobs: mpsc::UnboundedReceiver<LaneJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            LaneJob::Save { slot, reply } => {
                let result = shared.save(camera, slot).await;
                match &result {
                    Ok(focus) => log::info!("Camera {camera}: saved slot {slot} (focus {focus:#06x})"),
                    Err(e) => log::warn!("Camera {camera}: save of slot {slot} failed: {e}"),
                }
                let _ = reply.send(result);
            }
            LaneJob::Recall { slot, reply } => {
                let result = shared.recall(camera, slot).await;
                match &result {
                    Ok(_) => log::info!("Camera {camera}: recalled slot {slot}"),
                    Err(e) => log::warn!("Camera {camera}: recall of slot {slot} failed: {e}"),
                }
                let _ = reply.send(result);
            }
            LaneJob::Power { on, reply } => {
                let _ = reply.send(shared.set_power(camera, on).await);
            }
            LaneJob::FocusLock { on, reply } => {
                let _ = reply.send(shared.set_focus_lock(camera, on).await);
            }
        }
    }
    log::debug!("Lane for camera {camera} stopped");
}

async fn run_tally_updates(shared: Arc<HubShared>, mut updates: mpsc::UnboundedReceiver<TallyUpdate>) {
    while let Some(update) = updates.recv().await {
        shared.apply_tally(update).await;
    }
}
