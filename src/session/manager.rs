// Copyright 2022, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The session manager and its event loop.
//!
//! [`SessionManager`] is the public handle: every entry point enqueues a
//! typed command onto one serialized actor task that owns all session
//! mutations. Each command handler issues the UCI command and then parks on
//! the session's wait-latch, bounded by the per-operation deadline, until
//! the notification router observed the expected notification. Outcomes are
//! reported exclusively through the [`NotificationSink`]; the handle's
//! methods only fail when the service itself is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::params::fira_app_config_params::{
    DeviceRole, DeviceType, FilterType, StsConfig, DEFAULT_SESSION_PRIORITY,
};
use crate::params::uci_packets::{
    AppConfigTlvType, Controlee, DataTransferPhaseConfigStatusCode, MulticastUpdateStatusCode,
    ProtocolVersion, ReasonCode, SessionHandle, SessionId, SessionState, SessionType, StatusCode,
    UpdateMulticastListAction, UwbAddress,
};
use crate::params::{AppConfigParams, Protocol};
use crate::policy::{AttributionSource, PolicyOracle};
use crate::session::admission::{check_admission, first_non_privileged_link, AdmissionVerdict};
use crate::session::advertise::AdvertiseManager;
use crate::session::app_state::AppStateWatcher;
use crate::session::filtering::{FilterEngineFactory, PoseSource};
use crate::session::priority::compute_stack_priority;
use crate::session::router::NotificationRouter;
use crate::session::session::{
    ControleeEntry, NonPrivilegedClient, OperationType, SendDataInfo, SessionSlot, UwbSession,
};
use crate::session::table::{ClosedSessionInfo, SessionTable};
use crate::sink::{NotificationSink, RangingChangeReason};
use crate::uci::transport::UciTransport;
use crate::utils::{Clock, SystemClock};

const SESSION_OPEN_TIMEOUT: Duration = Duration::from_millis(10_000);
const SESSION_START_TIMEOUT: Duration = Duration::from_millis(3_000);
const SESSION_STOP_TIMEOUT: Duration = Duration::from_millis(3_000);
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_millis(3_000);
const SESSION_RECONFIGURE_TIMEOUT: Duration = SESSION_OPEN_TIMEOUT;
const DT_TAG_ROUNDS_UPDATE_TIMEOUT: Duration = Duration::from_millis(3_000);
const DATA_TRANSFER_PHASE_TIMEOUT: Duration = Duration::from_millis(2_000);

pub(crate) type SharedSessionTable = Arc<Mutex<SessionTable>>;
pub(crate) type SharedSink = Arc<Mutex<Box<dyn NotificationSink>>>;

/// One UWB chip the service drives, with the UCI version its UWBS reported
/// at boot. Chip discovery itself belongs to the embedder.
#[derive(Debug, Clone)]
pub struct ChipInfo {
    pub chip_id: String,
    pub uci_version: ProtocolVersion,
}

/// Construction-time configuration of the session manager.
pub struct SessionManagerConfig {
    pub chips: Vec<ChipInfo>,
    pub filter_engine_factory: Option<FilterEngineFactory>,
    pub default_pose_source: Option<Arc<dyn PoseSource>>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            chips: vec![ChipInfo {
                chip_id: "default".to_owned(),
                uci_version: ProtocolVersion::new(1, 1),
            }],
            filter_engine_factory: None,
            default_pose_source: None,
        }
    }
}

/// An open-ranging request. The handle is minted by the caller and is the
/// identity of the session everywhere upward of UCI.
#[derive(Debug, Clone)]
pub struct OpenSessionRequest {
    pub session_handle: SessionHandle,
    pub session_id: SessionId,
    pub session_type: SessionType,
    pub chip_id: String,
    pub attribution_source: AttributionSource,
    pub params: AppConfigParams,
}

/// CCC/ALIRO parameters that may ride on a start request.
#[derive(Debug, Clone, Default)]
pub struct StartRangingParams {
    pub ran_multiplier: Option<u32>,
    pub sts_index: Option<u32>,
    pub initiation_time_ms: Option<u64>,
    pub absolute_initiation_time_us: Option<u64>,
}

/// A reconfigure request: either replacement parameters or a controlee
/// multicast-list update.
#[derive(Debug, Clone)]
pub enum ReconfigureRequest {
    Params(AppConfigParams),
    MulticastList { action: UpdateMulticastListAction, controlees: Vec<Controlee> },
}

/// One phase entry of a data-transfer phase configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransferPhaseEntry {
    pub mac_address: Vec<u8>,
    pub slot_bitmap: Vec<u8>,
}

/// A data-transfer phase configuration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransferPhaseConfig {
    pub dtpcm_repetition: u8,
    pub data_transfer_control: u8,
    pub phases: Vec<DataTransferPhaseEntry>,
}

impl DataTransferPhaseConfig {
    /// Slot bitmap bytes per phase, encoded in bits 1..4 of the control byte.
    pub fn slot_bitmap_len(&self) -> usize {
        1usize << ((self.data_transfer_control & 0x0F) >> 1)
    }

    /// Address length selected by the low control bit: short or extended.
    pub fn mac_address_len(&self) -> usize {
        if self.data_transfer_control & 0x01 == 0 {
            2
        } else {
            8
        }
    }

    fn is_valid(&self) -> bool {
        let mac_len = self.mac_address_len();
        let bitmap_len = self.slot_bitmap_len();
        !self.phases.is_empty()
            && self.phases.iter().all(|phase| {
                phase.mac_address.len() == mac_len && phase.slot_bitmap.len() == bitmap_len
            })
    }
}

/// Why a stop was requested; internal triggers report `SystemPolicy` and
/// never emit failure callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopTrigger {
    LocalApi,
    ErrorStreak,
    BackgroundPolicy,
}

/// The typed events of the event loop.
pub(crate) enum SessionCommand {
    Open(Box<OpenSessionRequest>),
    Start { session_handle: SessionHandle, start_params: Option<StartRangingParams> },
    Stop { session_handle: SessionHandle, trigger: StopTrigger },
    Reconfigure { session_handle: SessionHandle, request: ReconfigureRequest },
    Deinit { session_handle: SessionHandle, reason: RangingChangeReason },
    OnSessionDeinited { session_handle: SessionHandle },
    SendData { session_handle: SessionHandle, dest_address: UwbAddress, data: Bytes },
    UpdateDtTagRounds { session_handle: SessionHandle, ranging_round_indexes: Vec<u8> },
    SetDataTransferPhaseConfig { session_handle: SessionHandle, config: DataTransferPhaseConfig },
    UidImportanceChanged { uid: i32, foreground: bool },
}

/// Project an internal error onto the (reason, status) pair the sink sees.
fn failure_of(error: &Error) -> (RangingChangeReason, StatusCode) {
    match error {
        Error::PolicyRefused | Error::PermissionDenied => {
            (RangingChangeReason::SystemPolicy, StatusCode::UciStatusRejected)
        }
        Error::DuplicatedSession => {
            (RangingChangeReason::BadParameters, StatusCode::UciStatusSessionDuplicate)
        }
        Error::MaxSessionsExceeded => {
            (RangingChangeReason::MaxSessionsReached, StatusCode::UciStatusMaxSessionsExceeded)
        }
        Error::BadParameters => {
            (RangingChangeReason::BadParameters, StatusCode::UciStatusInvalidParam)
        }
        Error::InvalidState => (RangingChangeReason::LocalApi, StatusCode::UciStatusRejected),
        Error::Transport(status) => (RangingChangeReason::from_status_code(*status), *status),
        Error::Timeout | Error::Closed | Error::Unknown => {
            (RangingChangeReason::Unknown, StatusCode::UciStatusFailed)
        }
    }
}

fn multicast_status_to_status_code(status: MulticastUpdateStatusCode) -> StatusCode {
    match status {
        MulticastUpdateStatusCode::StatusOkMulticastListUpdate => StatusCode::UciStatusOk,
        MulticastUpdateStatusCode::StatusErrorMulticastListFull => {
            StatusCode::UciStatusMulticastListFull
        }
        MulticastUpdateStatusCode::StatusErrorAddressNotFound => {
            StatusCode::UciStatusAddressNotFound
        }
        MulticastUpdateStatusCode::StatusErrorAddressAlreadyPresent => {
            StatusCode::UciStatusAddressAlreadyPresent
        }
        _ => StatusCode::UciStatusFailed,
    }
}

fn set_absolute_initiation_time(params: &mut AppConfigParams, time_us: Option<u64>) {
    match params {
        AppConfigParams::Fira(p) => p.set_absolute_initiation_time_us(time_us),
        AppConfigParams::Ccc(p) => p.set_absolute_initiation_time_us(time_us),
        AppConfigParams::Aliro(p) => p.set_absolute_initiation_time_us(time_us),
        AppConfigParams::Radar(_) => {}
    }
}

/// Relative initiation time still waiting to be anchored, if any.
fn pending_relative_initiation_time_ms(params: &AppConfigParams) -> Option<u64> {
    let (relative_ms, absolute_us) = match params {
        AppConfigParams::Fira(p) => (p.initiation_time_ms(), p.absolute_initiation_time_us()),
        AppConfigParams::Ccc(p) => (p.initiation_time_ms(), p.absolute_initiation_time_us()),
        AppConfigParams::Aliro(p) => (p.initiation_time_ms(), p.absolute_initiation_time_us()),
        AppConfigParams::Radar(_) => (0, None),
    };
    (relative_ms > 0 && absolute_us.is_none()).then_some(relative_ms)
}

/// The public handle of the session service core.
#[derive(Clone)]
pub struct SessionManager {
    cmd_sender: mpsc::UnboundedSender<SessionCommand>,
    table: SharedSessionTable,
    transport: Arc<dyn UciTransport>,
}

impl SessionManager {
    /// Build the manager and spawn its event loop and notification router on
    /// the current runtime.
    pub fn new<T, S, P>(
        mut transport: T,
        sink: S,
        policy: P,
        config: SessionManagerConfig,
    ) -> Self
    where
        T: UciTransport,
        S: NotificationSink,
        P: PolicyOracle,
    {
        let (ntf_sender, ntf_receiver) = mpsc::unbounded_channel();
        transport.set_session_notification_sender(ntf_sender);
        let transport: Arc<dyn UciTransport> = Arc::new(transport);
        let sink: SharedSink = Arc::new(Mutex::new(Box::new(sink)));
        let policy: Arc<dyn PolicyOracle> = Arc::new(policy);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let table: SharedSessionTable = Arc::new(Mutex::new(SessionTable::new(clock.clone())));
        let advertise = Arc::new(Mutex::new(AdvertiseManager::new(clock)));
        let (cmd_sender, cmd_receiver) = mpsc::unbounded_channel();

        let router = NotificationRouter::new(
            ntf_receiver,
            table.clone(),
            sink.clone(),
            policy.clone(),
            advertise.clone(),
            cmd_sender.clone(),
        );
        tokio::spawn(router.run());

        let actor = SessionManagerActor {
            cmd_receiver,
            cmd_sender: cmd_sender.clone(),
            transport: transport.clone(),
            sink,
            policy,
            table: table.clone(),
            advertise,
            app_state: AppStateWatcher::new(),
            chips: config
                .chips
                .into_iter()
                .map(|chip| (chip.chip_id, chip.uci_version))
                .collect(),
            filter_engine_factory: config.filter_engine_factory,
            pose_source: config.default_pose_source,
            pose_user_count: 0,
        };
        tokio::spawn(actor.run());

        Self { cmd_sender, table, transport }
    }

    fn execute(&self, command: SessionCommand) -> Result<()> {
        self.cmd_sender.send(command).map_err(|_| Error::Closed)
    }

    pub fn open_ranging(&self, request: OpenSessionRequest) -> Result<()> {
        self.execute(SessionCommand::Open(Box::new(request)))
    }

    pub fn start_ranging(
        &self,
        session_handle: SessionHandle,
        start_params: Option<StartRangingParams>,
    ) -> Result<()> {
        self.execute(SessionCommand::Start { session_handle, start_params })
    }

    pub fn stop_ranging(&self, session_handle: SessionHandle) -> Result<()> {
        self.execute(SessionCommand::Stop { session_handle, trigger: StopTrigger::LocalApi })
    }

    pub fn reconfigure_ranging(
        &self,
        session_handle: SessionHandle,
        request: ReconfigureRequest,
    ) -> Result<()> {
        self.execute(SessionCommand::Reconfigure { session_handle, request })
    }

    pub fn update_controller_multicast_list(
        &self,
        session_handle: SessionHandle,
        action: UpdateMulticastListAction,
        controlees: Vec<Controlee>,
    ) -> Result<()> {
        self.reconfigure_ranging(
            session_handle,
            ReconfigureRequest::MulticastList { action, controlees },
        )
    }

    pub fn close_ranging(&self, session_handle: SessionHandle) -> Result<()> {
        self.execute(SessionCommand::Deinit {
            session_handle,
            reason: RangingChangeReason::LocalApi,
        })
    }

    /// Binder-style death of the owning client: tear the session down.
    pub fn on_client_death(&self, session_handle: SessionHandle) -> Result<()> {
        self.execute(SessionCommand::Deinit {
            session_handle,
            reason: RangingChangeReason::LocalApi,
        })
    }

    pub fn send_data(
        &self,
        session_handle: SessionHandle,
        dest_address: UwbAddress,
        data: Bytes,
    ) -> Result<()> {
        self.execute(SessionCommand::SendData { session_handle, dest_address, data })
    }

    pub fn update_dt_tag_ranging_rounds(
        &self,
        session_handle: SessionHandle,
        ranging_round_indexes: Vec<u8>,
    ) -> Result<()> {
        self.execute(SessionCommand::UpdateDtTagRounds { session_handle, ranging_round_indexes })
    }

    pub fn set_data_transfer_phase_config(
        &self,
        session_handle: SessionHandle,
        config: DataTransferPhaseConfig,
    ) -> Result<()> {
        self.execute(SessionCommand::SetDataTransferPhaseConfig { session_handle, config })
    }

    /// Feed an app-importance transition of the uid into the service.
    pub fn notify_uid_importance(&self, uid: i32, foreground: bool) -> Result<()> {
        self.execute(SessionCommand::UidImportanceChanged { uid, foreground })
    }

    /// Query the maximum data packet size of the session. Read-only, so it
    /// bypasses the event loop.
    pub async fn query_max_data_size_bytes(&self, session_handle: SessionHandle) -> Result<u32> {
        let slot = self
            .table
            .lock()
            .await
            .get_by_handle(&session_handle)
            .ok_or(Error::BadParameters)?;
        let (session_id, chip_id) = {
            let session = slot.session.lock().await;
            (session.session_id, session.chip_id.clone())
        };
        self.transport.query_max_data_size_bytes(session_id, &chip_id).await
    }

    /// The diagnostics trail of recently closed sessions.
    pub async fn recently_closed(&self) -> Vec<ClosedSessionInfo> {
        self.table.lock().await.recently_closed()
    }

    pub async fn session_id_of(&self, session_handle: SessionHandle) -> Option<SessionId> {
        self.table.lock().await.session_id_of(&session_handle)
    }

    #[cfg(any(test, feature = "mock-util"))]
    pub async fn session_state(&self, session_handle: SessionHandle) -> Option<SessionState> {
        let slot = self.table.lock().await.get_by_handle(&session_handle)?;
        let state = slot.session.lock().await.state;
        Some(state)
    }

    #[cfg(any(test, feature = "mock-util"))]
    pub async fn controlee_addresses(&self, session_handle: SessionHandle) -> Vec<[u8; 2]> {
        match self.table.lock().await.get_by_handle(&session_handle) {
            Some(slot) => {
                let session = slot.session.lock().await;
                session.controlees.iter().map(|entry| entry.short_address).collect()
            }
            None => Vec::new(),
        }
    }
}

struct SessionManagerActor {
    cmd_receiver: mpsc::UnboundedReceiver<SessionCommand>,
    cmd_sender: mpsc::UnboundedSender<SessionCommand>,
    transport: Arc<dyn UciTransport>,
    sink: SharedSink,
    policy: Arc<dyn PolicyOracle>,
    table: SharedSessionTable,
    advertise: Arc<Mutex<AdvertiseManager>>,
    app_state: AppStateWatcher,
    chips: HashMap<String, ProtocolVersion>,
    filter_engine_factory: Option<FilterEngineFactory>,
    pose_source: Option<Arc<dyn PoseSource>>,
    pose_user_count: usize,
}

enum ControleeChange {
    Added([u8; 2]),
    AddFailed([u8; 2], MulticastUpdateStatusCode),
    Removed([u8; 2]),
    RemoveFailed([u8; 2], MulticastUpdateStatusCode),
}

impl SessionManagerActor {
    async fn run(mut self) {
        while let Some(command) = self.cmd_receiver.recv().await {
            self.handle_command(command).await;
        }
        info!("SessionManager event loop exiting");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open(request) => self.handle_open(*request).await,
            SessionCommand::Start { session_handle, start_params } => {
                self.handle_start(session_handle, start_params).await;
            }
            SessionCommand::Stop { session_handle, trigger } => {
                self.handle_stop(session_handle, trigger).await;
            }
            SessionCommand::Reconfigure { session_handle, request } => {
                self.handle_reconfigure(session_handle, request).await;
            }
            SessionCommand::Deinit { session_handle, reason } => {
                self.handle_deinit(session_handle, reason).await;
            }
            SessionCommand::OnSessionDeinited { session_handle } => {
                self.handle_on_session_deinited(session_handle).await;
            }
            SessionCommand::SendData { session_handle, dest_address, data } => {
                self.handle_send_data(session_handle, dest_address, data).await;
            }
            SessionCommand::UpdateDtTagRounds { session_handle, ranging_round_indexes } => {
                self.handle_update_dt_tag_rounds(session_handle, ranging_round_indexes).await;
            }
            SessionCommand::SetDataTransferPhaseConfig { session_handle, config } => {
                self.handle_data_transfer_phase_config(session_handle, config).await;
            }
            SessionCommand::UidImportanceChanged { uid, foreground } => {
                self.handle_uid_importance(uid, foreground).await;
            }
        }
    }

    async fn get_slot(&self, session_handle: &SessionHandle) -> Option<Arc<SessionSlot>> {
        self.table.lock().await.get_by_handle(session_handle)
    }

    async fn emit_open_failed(&self, session_handle: SessionHandle, error: &Error) {
        let (reason, status) = failure_of(error);
        self.sink.lock().await.on_ranging_open_failed(session_handle, reason, status);
    }

    async fn emit_start_failed(&self, session_handle: SessionHandle, error: &Error) {
        let (reason, status) = failure_of(error);
        self.sink.lock().await.on_ranging_start_failed(session_handle, reason, status);
    }

    async fn emit_stop_failed(&self, session_handle: SessionHandle, error: &Error) {
        let (reason, status) = failure_of(error);
        self.sink.lock().await.on_ranging_stop_failed(session_handle, reason, status);
    }

    async fn emit_reconfigure_failed(&self, session_handle: SessionHandle, error: &Error) {
        let (reason, status) = failure_of(error);
        self.sink.lock().await.on_ranging_reconfigure_failed(session_handle, reason, status);
    }

    async fn handle_open(&mut self, request: OpenSessionRequest) {
        let OpenSessionRequest {
            session_handle,
            session_id,
            session_type,
            chip_id,
            attribution_source,
            params,
        } = request;

        let Some(uci_version) = self.chips.get(&chip_id).copied() else {
            warn!("open of {} refused: unknown chip {}", session_handle, chip_id);
            self.emit_open_failed(session_handle, &Error::BadParameters).await;
            return;
        };
        if !params.is_type_matched(session_type) {
            warn!("open of {} refused: params do not match type {:?}", session_handle, session_type);
            self.emit_open_failed(session_handle, &Error::BadParameters).await;
            return;
        }
        let protocol = params.protocol();

        let non_privileged = first_non_privileged_link(&attribution_source, self.policy.as_ref())
            .map(|link| NonPrivilegedClient {
                uid: link.uid,
                package_name: link.package_name.clone(),
            });
        let foreground = non_privileged.as_ref().map(|client| {
            self.policy.is_app_foreground(client.uid, client.package_name.as_deref())
        });

        // A caller-supplied FiRa priority wins and is frozen.
        let (stack_priority, priority_override) = match params.fira() {
            Some(fira) if fira.session_priority() != DEFAULT_SESSION_PRIORITY => {
                (fira.session_priority(), true)
            }
            _ => (
                compute_stack_priority(
                    protocol,
                    non_privileged.is_none(),
                    foreground.unwrap_or(false),
                    self.policy.default_priority_override(),
                ),
                false,
            ),
        };

        let verdict = {
            let table = self.table.lock().await;
            check_admission(
                &table,
                self.policy.as_ref(),
                session_handle,
                session_id,
                protocol,
                &chip_id,
                foreground,
                stack_priority,
            )
            .await
        };
        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(error) => {
                self.emit_open_failed(session_handle, &error).await;
                return;
            }
        };
        if let AdmissionVerdict::AdmitAfterEviction(victim) = verdict {
            self.handle_deinit(victim, RangingChangeReason::MaxSessionsReached).await;
        }

        let mut session = UwbSession::new(
            session_handle,
            session_id,
            session_type,
            chip_id.clone(),
            uci_version,
            attribution_source,
            params,
            stack_priority,
            priority_override,
            non_privileged.clone(),
            foreground.unwrap_or(true),
        );
        session.operation = Some(OperationType::InitSession);

        if let (Some(pose_source), Some(fira)) = (self.pose_source.as_ref(), session.params.fira())
        {
            if fira.filter_type() == FilterType::Default {
                if self.pose_user_count == 0 {
                    pose_source.start();
                }
                self.pose_user_count += 1;
                session.acquired_default_pose = true;
            }
        }

        let slot = Arc::new(SessionSlot::new(session));
        self.table.lock().await.insert(
            session_handle,
            session_id,
            protocol,
            chip_id.clone(),
            slot.clone(),
        );
        if let Some(client) = &non_privileged {
            self.app_state.register(client.uid, session_handle);
        }

        if let Err(error) =
            self.run_open(&slot, session_handle, session_id, &chip_id, uci_version).await
        {
            error!("open of {} failed: {}", session_handle, error);
            // Best effort on the controller; the session never became visible.
            let _ = self.transport.deinit_session(session_id, &chip_id).await;
            let (reason, _) = failure_of(&error);
            self.cleanup_session(session_handle, &slot, reason).await;
            self.emit_open_failed(session_handle, &error).await;
            return;
        }
        self.sink.lock().await.on_ranging_opened(session_handle);
    }

    async fn run_open(
        &self,
        slot: &Arc<SessionSlot>,
        session_handle: SessionHandle,
        session_id: SessionId,
        chip_id: &str,
        uci_version: ProtocolVersion,
    ) -> Result<()> {
        let deadline = Instant::now() + SESSION_OPEN_TIMEOUT;
        let session_type = { slot.session.lock().await.session_type };

        self.transport.init_session(session_id, session_type, chip_id).await?;
        slot.wait_until(deadline, |session| {
            (session.state == SessionState::SessionStateInit).then_some(())
        })
        .await?;

        // Cache the UWBS-assigned token for cross-session references. The
        // session id doubles as the token on controllers that predate them.
        if uci_version.is_at_least(2, 0) {
            match self.transport.get_session_token(session_id, chip_id).await {
                Ok(token) => slot.session.lock().await.session_token = token,
                Err(error) => {
                    warn!("get_session_token of {} failed: {}", session_handle, error)
                }
            }
        }

        self.resolve_session_references(slot).await?;
        self.maybe_compute_absolute_initiation_time(slot, chip_id, uci_version).await?;

        let config_tlvs = { slot.session.lock().await.params.generate_tlvs() };
        self.transport
            .set_app_configurations(session_id, config_tlvs, chip_id, uci_version)
            .await?;
        slot.wait_until(deadline, |session| {
            (session.state == SessionState::SessionStateIdle).then_some(())
        })
        .await?;

        self.apply_hybrid_configuration(slot, session_id, chip_id).await?;

        {
            let mut session = slot.session.lock().await;
            self.populate_initial_controlees(&mut session);
            if session.computed_absolute_initiation_time {
                set_absolute_initiation_time(&mut session.params, None);
                session.computed_absolute_initiation_time = false;
            }
            session.operation = None;
        }
        Ok(())
    }

    /// Replace session-handle references in the params with the referenced
    /// sessions' cached tokens.
    async fn resolve_session_references(&self, slot: &Arc<SessionSlot>) -> Result<()> {
        let references: Vec<SessionHandle> = {
            let session = slot.session.lock().await;
            match session.params.fira() {
                Some(fira) => {
                    let mut handles: Vec<SessionHandle> = fira
                        .hybrid_phase_list()
                        .iter()
                        .map(|phase| phase.session_handle)
                        .collect();
                    if let Some(time_base) = fira.reference_time_base() {
                        handles.push(time_base.reference_session_handle);
                    }
                    handles
                }
                None => Vec::new(),
            }
        };
        if references.is_empty() {
            return Ok(());
        }

        let mut tokens = HashMap::new();
        for reference in references {
            let other = { self.table.lock().await.get_by_handle(&reference) };
            let Some(other) = other else {
                error!("referenced session {} not found", reference);
                return Err(Error::BadParameters);
            };
            let token = other.session.lock().await.session_token;
            tokens.insert(reference, token);
        }

        let mut session = slot.session.lock().await;
        if let Some(fira) = session.params.fira_mut() {
            if let Some(time_base) = fira.reference_time_base_mut() {
                time_base.resolved_session_token =
                    tokens.get(&time_base.reference_session_handle).copied();
            }
            for phase in fira.hybrid_phase_list_mut() {
                phase.resolved_session_token = tokens.get(&phase.session_handle).copied();
            }
        }
        Ok(())
    }

    /// Anchor a relative initiation time to the UWBS clock on UCI >= 2.0.
    /// The computed value is cleared once the command completes, so a later
    /// start recomputes it against the then-current timestamp.
    async fn maybe_compute_absolute_initiation_time(
        &self,
        slot: &Arc<SessionSlot>,
        chip_id: &str,
        uci_version: ProtocolVersion,
    ) -> Result<()> {
        if !uci_version.is_at_least(2, 0) {
            return Ok(());
        }
        let relative_ms = {
            let session = slot.session.lock().await;
            pending_relative_initiation_time_ms(&session.params)
        };
        let Some(relative_ms) = relative_ms else {
            return Ok(());
        };
        let timestamp_us = self.transport.query_uwbs_timestamp_micros(chip_id).await?;
        let mut session = slot.session.lock().await;
        set_absolute_initiation_time(&mut session.params, Some(timestamp_us + relative_ms * 1000));
        session.computed_absolute_initiation_time = true;
        Ok(())
    }

    async fn apply_hybrid_configuration(
        &self,
        slot: &Arc<SessionSlot>,
        session_id: SessionId,
        chip_id: &str,
    ) -> Result<()> {
        let phases: Vec<(u32, u16, u16)> = {
            let session = slot.session.lock().await;
            match session.params.fira() {
                Some(fira) => fira
                    .hybrid_phase_list()
                    .iter()
                    .map(|phase| {
                        phase
                            .resolved_session_token
                            .map(|token| (token, phase.start_slot_index, phase.end_slot_index))
                            .ok_or(Error::BadParameters)
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            }
        };
        if phases.is_empty() {
            return Ok(());
        }
        let mut phase_list = BytesMut::with_capacity(phases.len() * 8);
        for (token, start_slot_index, end_slot_index) in &phases {
            phase_list.put_u32_le(*token);
            phase_list.put_u16_le(*start_slot_index);
            phase_list.put_u16_le(*end_slot_index);
        }
        self.transport
            .set_hybrid_session_configuration(
                session_id,
                phases.len() as u8,
                [0; 8],
                phase_list.freeze(),
                chip_id,
            )
            .await
    }

    /// Seed the controlee list of a FiRa controller from the destination
    /// address list it was opened with.
    fn populate_initial_controlees(&self, session: &mut UwbSession) {
        let Some(fira) = session.params.fira() else {
            return;
        };
        if fira.device_type() != DeviceType::Controller {
            return;
        }
        let addresses: Vec<[u8; 2]> = fira
            .dst_mac_address_list()
            .iter()
            .filter_map(|address| match address {
                UwbAddress::Short(short) => Some(*short),
                UwbAddress::Extended(_) => None,
            })
            .collect();
        for short_address in addresses {
            let filter = self
                .filter_engine_factory
                .as_ref()
                .and_then(|factory| factory(&UwbAddress::Short(short_address)));
            session.controlees.push(ControleeEntry {
                short_address,
                subsession_id: 0,
                filter,
            });
        }
    }

    async fn handle_start(
        &mut self,
        session_handle: SessionHandle,
        start_params: Option<StartRangingParams>,
    ) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            self.emit_start_failed(
                session_handle,
                &Error::Transport(StatusCode::UciStatusSessionNotExist),
            )
            .await;
            return;
        };
        {
            let mut session = slot.session.lock().await;
            if session.state != SessionState::SessionStateIdle {
                drop(session);
                self.emit_start_failed(session_handle, &Error::InvalidState).await;
                return;
            }
            session.operation = Some(OperationType::Start);
        }

        let result = self.run_start(&slot, start_params).await;
        let (session_id, chip_id, uci_version, params, bg_override_tlvs) = {
            let mut session = slot.session.lock().await;
            session.operation = None;
            if session.computed_absolute_initiation_time {
                set_absolute_initiation_time(&mut session.params, None);
                session.computed_absolute_initiation_time = false;
            }
            let bg_override_tlvs = (result.is_ok()
                && session.non_privileged_client.is_some()
                && !session.has_non_privileged_fg_app)
                .then(|| session.params.fira().map(|p| p.range_data_ntf_override_tlvs(false)))
                .flatten();
            (
                session.session_id,
                session.chip_id.clone(),
                session.uci_version,
                session.params.clone(),
                bg_override_tlvs,
            )
        };
        if let Err(error) = result {
            error!("start of {} failed: {}", session_handle, error);
            self.emit_start_failed(session_handle, &error).await;
            return;
        }
        self.sink.lock().await.on_ranging_started(session_handle, &params);

        // Background apps get their notifications muted right after start;
        // the stored params keep the caller's configuration.
        if let Some(tlvs) = bg_override_tlvs {
            if let Err(error) = self
                .transport
                .set_app_configurations(session_id, tlvs, &chip_id, uci_version)
                .await
            {
                warn!("notification mute of background {} failed: {}", session_handle, error);
            }
        }
    }

    async fn run_start(
        &self,
        slot: &Arc<SessionSlot>,
        start_params: Option<StartRangingParams>,
    ) -> Result<()> {
        let (session_id, chip_id, uci_version) = {
            let mut session = slot.session.lock().await;
            let session = &mut *session;

            if let Some(start_params) = &start_params {
                merge_start_params(session, start_params);
            }

            // FiRa sessions reconverge to the current priority band before
            // every start unless the caller locked the priority.
            if session.protocol == Protocol::Fira && !session.priority_override {
                let privileged = session.non_privileged_client.is_none();
                let foreground = session.has_non_privileged_fg_app;
                let priority = compute_stack_priority(
                    Protocol::Fira,
                    privileged,
                    foreground,
                    self.policy.default_priority_override(),
                );
                session.stack_priority = priority;
                if let Some(fira) = session.params.fira_mut() {
                    if fira.session_priority() != priority {
                        fira.set_session_priority(priority);
                        session.needs_app_config_update = true;
                    }
                }
            }
            (session.session_id, session.chip_id.clone(), session.uci_version)
        };

        self.maybe_compute_absolute_initiation_time(slot, &chip_id, uci_version).await?;

        let (needs_update, config_tlvs, ranging_interval_ms) = {
            let mut session = slot.session.lock().await;
            if session.computed_absolute_initiation_time {
                session.needs_app_config_update = true;
            }
            (
                session.needs_app_config_update,
                session.params.generate_tlvs(),
                session.params.fira().map(|p| p.ranging_interval_ms()),
            )
        };
        if needs_update {
            self.transport
                .set_app_configurations(session_id, config_tlvs, &chip_id, uci_version)
                .await?;
            slot.session.lock().await.needs_app_config_update = false;
        }

        self.transport.start_ranging(session_id, &chip_id).await?;

        let timeout = match ranging_interval_ms {
            Some(interval_ms) => {
                SESSION_START_TIMEOUT.max(Duration::from_millis(u64::from(interval_ms) * 4))
            }
            None => SESSION_START_TIMEOUT,
        };
        slot.wait_until(Instant::now() + timeout, |session| {
            (session.state == SessionState::SessionStateActive).then_some(())
        })
        .await
    }

    async fn handle_stop(&mut self, session_handle: SessionHandle, trigger: StopTrigger) {
        let reason = match trigger {
            StopTrigger::LocalApi => RangingChangeReason::LocalApi,
            StopTrigger::ErrorStreak | StopTrigger::BackgroundPolicy => {
                RangingChangeReason::SystemPolicy
            }
        };
        let Some(slot) = self.get_slot(&session_handle).await else {
            if trigger == StopTrigger::LocalApi {
                self.emit_stop_failed(
                    session_handle,
                    &Error::Transport(StatusCode::UciStatusSessionNotExist),
                )
                .await;
            } else {
                debug!("internal stop of unknown session {}", session_handle);
            }
            return;
        };

        enum StopPath {
            Run,
            Idempotent,
            Reject,
        }
        let path = {
            let mut session = slot.session.lock().await;
            match session.state {
                SessionState::SessionStateActive => {
                    session.operation = Some(OperationType::Stop);
                    StopPath::Run
                }
                SessionState::SessionStateIdle
                    if session.last_reason_code
                        == Some(ReasonCode::StateChangeWithSessionManagementCommands) =>
                {
                    StopPath::Idempotent
                }
                _ => StopPath::Reject,
            }
        };
        match path {
            StopPath::Idempotent => {
                // Already stopped for the expected reason; report success.
                self.sink.lock().await.on_ranging_stopped(session_handle, reason, &[]);
            }
            StopPath::Reject => {
                if trigger == StopTrigger::LocalApi {
                    self.emit_stop_failed(session_handle, &Error::InvalidState).await;
                } else {
                    debug!("internal stop of {} skipped: not active", session_handle);
                }
            }
            StopPath::Run => match self.run_stop(&slot).await {
                Ok(stopped_params) => {
                    {
                        let mut session = slot.session.lock().await;
                        session.operation = None;
                        session.cancel_ranging_error_streak_timer();
                    }
                    self.sink
                        .lock()
                        .await
                        .on_ranging_stopped(session_handle, reason, &stopped_params);
                }
                Err(error) => {
                    slot.session.lock().await.operation = None;
                    error!("stop of {} failed: {}", session_handle, error);
                    if trigger == StopTrigger::LocalApi {
                        self.emit_stop_failed(session_handle, &error).await;
                    }
                }
            },
        }
    }

    async fn run_stop(
        &self,
        slot: &Arc<SessionSlot>,
    ) -> Result<Vec<crate::params::uci_packets::AppConfigTlv>> {
        let (session_id, chip_id, protocol, ranging_interval_ms) = {
            let session = slot.session.lock().await;
            (
                session.session_id,
                session.chip_id.clone(),
                session.protocol,
                session.params.fira().map(|p| p.ranging_interval_ms()),
            )
        };
        self.transport.stop_ranging(session_id, &chip_id).await?;
        let timeout = match ranging_interval_ms {
            Some(interval_ms) => {
                SESSION_STOP_TIMEOUT.max(Duration::from_millis(u64::from(interval_ms) * 4))
            }
            None => SESSION_STOP_TIMEOUT,
        };
        slot.wait_until(Instant::now() + timeout, |session| {
            (session.state == SessionState::SessionStateIdle).then_some(())
        })
        .await?;

        let mut stopped_params = Vec::new();
        if self.policy.stopped_params_enabled(protocol) {
            match self
                .transport
                .get_app_configurations(
                    session_id,
                    vec![
                        AppConfigTlvType::StsIndex,
                        AppConfigTlvType::CccRanMultiplier,
                        AppConfigTlvType::CccLastIndexUsed,
                    ],
                    &chip_id,
                )
                .await
            {
                Ok(tlvs) => stopped_params = tlvs,
                Err(error) => warn!("stopped-params fetch failed: {}", error),
            }
        }
        Ok(stopped_params)
    }

    async fn handle_reconfigure(
        &mut self,
        session_handle: SessionHandle,
        request: ReconfigureRequest,
    ) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            self.emit_reconfigure_failed(
                session_handle,
                &Error::Transport(StatusCode::UciStatusSessionNotExist),
            )
            .await;
            return;
        };
        {
            let mut session = slot.session.lock().await;
            if !matches!(
                session.state,
                SessionState::SessionStateIdle | SessionState::SessionStateActive
            ) {
                drop(session);
                self.emit_reconfigure_failed(session_handle, &Error::InvalidState).await;
                return;
            }
            session.operation = Some(OperationType::Reconfigure);
            session.multicast_update_result = None;
        }

        let result = match request {
            ReconfigureRequest::Params(new_params) => {
                self.run_reconfigure_params(&slot, new_params).await.map(|_| Vec::new())
            }
            ReconfigureRequest::MulticastList { action, controlees } => {
                self.run_multicast_update(&slot, action, controlees).await
            }
        };
        slot.session.lock().await.operation = None;

        match result {
            Ok(changes) => {
                let first_failure = changes.iter().find_map(|change| match change {
                    ControleeChange::AddFailed(_, status)
                    | ControleeChange::RemoveFailed(_, status) => Some(*status),
                    _ => None,
                });
                let mut sink = self.sink.lock().await;
                for change in &changes {
                    match change {
                        ControleeChange::Added(address) => {
                            sink.on_controlee_added(session_handle, *address)
                        }
                        ControleeChange::AddFailed(address, status) => {
                            sink.on_controlee_add_failed(session_handle, *address, *status)
                        }
                        ControleeChange::Removed(address) => {
                            sink.on_controlee_removed(session_handle, *address)
                        }
                        ControleeChange::RemoveFailed(address, status) => {
                            sink.on_controlee_remove_failed(session_handle, *address, *status)
                        }
                    }
                }
                match first_failure {
                    None => sink.on_ranging_reconfigured(session_handle),
                    Some(status) => sink.on_ranging_reconfigure_failed(
                        session_handle,
                        RangingChangeReason::BadParameters,
                        multicast_status_to_status_code(status),
                    ),
                }
            }
            Err(error) => {
                error!("reconfigure of {} failed: {}", session_handle, error);
                self.emit_reconfigure_failed(session_handle, &error).await;
            }
        }
    }

    async fn run_reconfigure_params(
        &self,
        slot: &Arc<SessionSlot>,
        new_params: AppConfigParams,
    ) -> Result<()> {
        let (session_id, chip_id, uci_version, config_tlvs) = {
            let session = slot.session.lock().await;
            if new_params.protocol() != session.protocol {
                return Err(Error::BadParameters);
            }
            let config_tlvs = new_params.generate_updated_tlvs(&session.params);
            (session.session_id, session.chip_id.clone(), session.uci_version, config_tlvs)
        };
        if !config_tlvs.is_empty() {
            self.transport
                .set_app_configurations(session_id, config_tlvs, &chip_id, uci_version)
                .await?;
        }
        slot.session.lock().await.params = new_params;
        Ok(())
    }

    async fn run_multicast_update(
        &self,
        slot: &Arc<SessionSlot>,
        action: UpdateMulticastListAction,
        controlees: Vec<Controlee>,
    ) -> Result<Vec<ControleeChange>> {
        let (session_id, chip_id) = {
            let session = slot.session.lock().await;
            let Some(fira) = session.params.fira() else {
                return Err(Error::BadParameters);
            };
            if fira.device_type() != DeviceType::Controller {
                return Err(Error::BadParameters);
            }
            if let Some(expected_key_len) = action.sub_session_key_len() {
                // Keyed adds are only valid for sessions opened with
                // provisioned per-controlee keys.
                if fira.sts_config() != StsConfig::ProvisionedForControleeIndividualKey {
                    return Err(Error::BadParameters);
                }
                let keys_valid = controlees.iter().all(|controlee| {
                    controlee
                        .subsession_key
                        .as_ref()
                        .map_or(false, |key| key.len() == expected_key_len)
                });
                if !keys_valid {
                    return Err(Error::BadParameters);
                }
            }
            if action.is_add()
                && session.controlees.len() + controlees.len() > session.max_controlees()
            {
                return Err(Error::BadParameters);
            }
            (session.session_id, session.chip_id.clone())
        };

        self.transport
            .controller_multicast_list_update(session_id, action, controlees, &chip_id)
            .await?;
        let status_list = slot
            .wait_until(Instant::now() + SESSION_RECONFIGURE_TIMEOUT, |session| {
                session.multicast_update_result.take()
            })
            .await?;

        // The controlee list tracks the UCI-confirmed state, entry by entry.
        let mut changes = Vec::with_capacity(status_list.len());
        let mut session = slot.session.lock().await;
        for entry in status_list {
            match (entry.status, action.is_add()) {
                (MulticastUpdateStatusCode::StatusOkMulticastListUpdate, true) => {
                    let filter = self
                        .filter_engine_factory
                        .as_ref()
                        .and_then(|factory| factory(&UwbAddress::Short(entry.mac_address)));
                    session.controlees.push(ControleeEntry {
                        short_address: entry.mac_address,
                        subsession_id: entry.subsession_id,
                        filter,
                    });
                    changes.push(ControleeChange::Added(entry.mac_address));
                }
                (MulticastUpdateStatusCode::StatusOkMulticastListUpdate, false) => {
                    session.remove_controlee(entry.mac_address);
                    changes.push(ControleeChange::Removed(entry.mac_address));
                }
                (status, true) => changes.push(ControleeChange::AddFailed(entry.mac_address, status)),
                (status, false) => {
                    changes.push(ControleeChange::RemoveFailed(entry.mac_address, status))
                }
            }
        }
        Ok(changes)
    }

    async fn handle_deinit(&mut self, session_handle: SessionHandle, reason: RangingChangeReason) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            debug!("deinit of unknown session {}", session_handle);
            return;
        };
        let (session_id, chip_id) = {
            let mut session = slot.session.lock().await;
            session.operation = Some(OperationType::Deinit);
            session.cancel_timers();
            (session.session_id, session.chip_id.clone())
        };

        let mut status = StatusCode::UciStatusOk;
        match self.transport.deinit_session(session_id, &chip_id).await {
            Ok(()) => {
                let deadline = Instant::now() + SESSION_CLOSE_TIMEOUT;
                if let Err(error) = slot
                    .wait_until(deadline, |session| {
                        (session.state == SessionState::SessionStateDeinit).then_some(())
                    })
                    .await
                {
                    warn!("deinit of {} unconfirmed: {}; removing anyway", session_handle, error);
                    status = error.as_status_code();
                }
            }
            Err(error) => {
                // The session is removed regardless; the UWBS will reconcile
                // on the next reset.
                error!("deinit of {} failed: {}; removing anyway", session_handle, error);
                status = error.as_status_code();
                slot.session.lock().await.set_state(SessionState::SessionStateError, None);
            }
        }

        self.cleanup_session(session_handle, &slot, reason).await;
        self.sink.lock().await.on_ranging_closed(session_handle, reason, status);
    }

    /// Remote-initiated teardown: the UWBS already reported `Deinit`, so only
    /// the host-side cleanup remains.
    async fn handle_on_session_deinited(&mut self, session_handle: SessionHandle) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            debug!("late deinit notification of unknown session {}", session_handle);
            return;
        };
        let reason = {
            let mut session = slot.session.lock().await;
            session.operation = Some(OperationType::OnDeinit);
            session
                .last_reason_code
                .map(RangingChangeReason::from_reason_code)
                .unwrap_or(RangingChangeReason::Unknown)
        };
        self.cleanup_session(session_handle, &slot, reason).await;
        self.sink.lock().await.on_ranging_closed(
            session_handle,
            reason,
            StatusCode::UciStatusOk,
        );
    }

    async fn cleanup_session(
        &mut self,
        session_handle: SessionHandle,
        slot: &Arc<SessionSlot>,
        reason: RangingChangeReason,
    ) {
        let (peers, non_privileged, released_pose) = {
            let mut session = slot.session.lock().await;
            session.cancel_timers();
            session.clear_controlees();
            session.tx_pending.clear();
            let mut peers = session.buffered_peers();
            if let Some(fira) = session.params.fira() {
                peers.extend(fira.dst_mac_address_list().iter().copied());
            }
            let released_pose = session.acquired_default_pose;
            session.acquired_default_pose = false;
            (peers, session.non_privileged_client.clone(), released_pose)
        };

        if released_pose {
            self.pose_user_count = self.pose_user_count.saturating_sub(1);
            if self.pose_user_count == 0 {
                if let Some(pose_source) = self.pose_source.as_ref() {
                    pose_source.stop();
                }
            }
        }
        if let Some(client) = non_privileged {
            self.app_state.unregister(client.uid, &session_handle);
        }
        {
            let mut advertise = self.advertise.lock().await;
            for peer in &peers {
                advertise.remove_advertise_target(peer);
            }
        }
        self.table.lock().await.remove(&session_handle, reason);
        // Late notifications for this id are now logged and discarded by the
        // router, keeping the no-callback-after-closed guarantee.
    }

    async fn handle_send_data(
        &mut self,
        session_handle: SessionHandle,
        dest_address: UwbAddress,
        data: Bytes,
    ) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            self.sink.lock().await.on_data_send_failed(
                session_handle,
                dest_address,
                0,
                StatusCode::UciStatusSessionNotExist,
            );
            return;
        };
        let prepared = {
            let mut session = slot.session.lock().await;
            if session.state != SessionState::SessionStateActive {
                Err(Error::InvalidState)
            } else {
                let sequence_number = session.alloc_tx_sequence_number();
                session.tx_pending.insert(
                    sequence_number,
                    SendDataInfo { dest_address, payload: data.clone() },
                );
                session.operation = Some(OperationType::SendData);
                Ok((session.session_id, session.chip_id.clone(), sequence_number))
            }
        };
        match prepared {
            Err(error) => {
                self.sink.lock().await.on_data_send_failed(
                    session_handle,
                    dest_address,
                    0,
                    error.as_status_code(),
                );
            }
            Ok((session_id, chip_id, sequence_number)) => {
                let result = self
                    .transport
                    .send_data(
                        session_id,
                        dest_address.to_extended(),
                        sequence_number,
                        data,
                        &chip_id,
                    )
                    .await;
                {
                    let mut session = slot.session.lock().await;
                    session.operation = None;
                    if result.is_err() {
                        session.tx_pending.remove(&sequence_number);
                    }
                }
                if let Err(error) = result {
                    error!("send_data of {} failed: {}", session_handle, error);
                    self.sink.lock().await.on_data_send_failed(
                        session_handle,
                        dest_address,
                        sequence_number,
                        error.as_status_code(),
                    );
                }
            }
        }
    }

    async fn handle_update_dt_tag_rounds(
        &mut self,
        session_handle: SessionHandle,
        ranging_round_indexes: Vec<u8>,
    ) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            self.sink.lock().await.on_dt_tag_rounds_update_status(
                session_handle,
                StatusCode::UciStatusSessionNotExist,
                &[],
            );
            return;
        };
        let prepared = {
            let mut session = slot.session.lock().await;
            let is_dt_tag = session
                .params
                .fira()
                .map(|fira| fira.device_role() == DeviceRole::DtTag)
                .unwrap_or(false);
            if !is_dt_tag {
                Err(Error::BadParameters)
            } else {
                session.operation = Some(OperationType::UpdateDtTagRounds);
                Ok((session.session_id, session.chip_id.clone()))
            }
        };
        match prepared {
            Err(error) => {
                self.sink.lock().await.on_dt_tag_rounds_update_status(
                    session_handle,
                    error.as_status_code(),
                    &[],
                );
            }
            Ok((session_id, chip_id)) => {
                let result = tokio::time::timeout(
                    DT_TAG_ROUNDS_UPDATE_TIMEOUT,
                    self.transport.session_update_dt_tag_ranging_rounds(
                        session_id,
                        ranging_round_indexes,
                        &chip_id,
                    ),
                )
                .await
                .unwrap_or(Err(Error::Timeout));
                slot.session.lock().await.operation = None;
                let mut sink = self.sink.lock().await;
                match result {
                    Ok(response) => sink.on_dt_tag_rounds_update_status(
                        session_handle,
                        response.status,
                        &response.ranging_round_indexes,
                    ),
                    Err(error) => sink.on_dt_tag_rounds_update_status(
                        session_handle,
                        error.as_status_code(),
                        &[],
                    ),
                }
            }
        }
    }

    async fn handle_data_transfer_phase_config(
        &mut self,
        session_handle: SessionHandle,
        config: DataTransferPhaseConfig,
    ) {
        let Some(slot) = self.get_slot(&session_handle).await else {
            self.sink.lock().await.on_data_transfer_phase_config_failed(
                session_handle,
                StatusCode::UciStatusSessionNotExist,
            );
            return;
        };
        let prepared = {
            let mut session = slot.session.lock().await;
            if !session.session_type.supports_data_transfer_phase() {
                Err(Error::InvalidState)
            } else if !config.is_valid() {
                Err(Error::BadParameters)
            } else {
                session.operation = Some(OperationType::DataTransferPhaseConfig);
                session.dt_phase_config_status = None;
                Ok((session.session_id, session.chip_id.clone()))
            }
        };
        let (session_id, chip_id) = match prepared {
            Err(error) => {
                self.sink.lock().await.on_data_transfer_phase_config_failed(
                    session_handle,
                    error.as_status_code(),
                );
                return;
            }
            Ok(prepared) => prepared,
        };

        let mut mac_addresses = Vec::with_capacity(config.phases.len() * config.mac_address_len());
        let mut slot_bitmaps = Vec::with_capacity(config.phases.len() * config.slot_bitmap_len());
        for phase in &config.phases {
            mac_addresses.extend_from_slice(&phase.mac_address);
            slot_bitmaps.extend_from_slice(&phase.slot_bitmap);
        }

        let result = self
            .transport
            .set_data_transfer_phase_config(
                session_id,
                config.dtpcm_repetition,
                config.data_transfer_control,
                config.phases.len() as u8,
                mac_addresses,
                slot_bitmaps,
                &chip_id,
            )
            .await;
        let result = match result {
            Ok(()) => {
                slot.wait_until(Instant::now() + DATA_TRANSFER_PHASE_TIMEOUT, |session| {
                    session.dt_phase_config_status.take()
                })
                .await
            }
            Err(error) => Err(error),
        };
        slot.session.lock().await.operation = None;

        let mut sink = self.sink.lock().await;
        match result {
            Ok(DataTransferPhaseConfigStatusCode::UciDtpcmConfigSuccess) => {
                sink.on_data_transfer_phase_configured(session_handle);
            }
            Ok(_) => {
                sink.on_data_transfer_phase_config_failed(
                    session_handle,
                    StatusCode::UciStatusFailed,
                );
            }
            Err(error) => {
                sink.on_data_transfer_phase_config_failed(
                    session_handle,
                    error.as_status_code(),
                );
            }
        }
    }

    async fn handle_uid_importance(&mut self, uid: i32, foreground: bool) {
        if !self.app_state.is_watched(uid) {
            return;
        }
        info!("uid {} importance changed: foreground={}", uid, foreground);
        for session_handle in self.app_state.sessions_of(uid) {
            let Some(slot) = self.get_slot(&session_handle).await else {
                continue;
            };
            let (override_tlvs, arm_background_timer, session_id, chip_id, uci_version) = {
                let mut session = slot.session.lock().await;
                session.has_non_privileged_fg_app = foreground;
                if !session.priority_override {
                    session.stack_priority = compute_stack_priority(
                        session.protocol,
                        false,
                        foreground,
                        self.policy.default_priority_override(),
                    );
                }
                if foreground {
                    session.cancel_background_app_timer();
                }
                let arm_background_timer = !foreground
                    && !self.policy.background_ranging_enabled()
                    && session.background_app_timer.is_none();
                let override_tlvs = matches!(
                    session.state,
                    SessionState::SessionStateIdle | SessionState::SessionStateActive
                )
                .then(|| {
                    session.params.fira().map(|fira| fira.range_data_ntf_override_tlvs(foreground))
                })
                .flatten();
                (
                    override_tlvs,
                    arm_background_timer,
                    session.session_id,
                    session.chip_id.clone(),
                    session.uci_version,
                )
            };

            if let Some(tlvs) = override_tlvs {
                if let Err(error) = self
                    .transport
                    .set_app_configurations(session_id, tlvs, &chip_id, uci_version)
                    .await
                {
                    warn!(
                        "notification-control override of {} failed: {}",
                        session_handle, error
                    );
                }
            }
            if arm_background_timer {
                let cmd_sender = self.cmd_sender.clone();
                let timeout_ms = self.policy.background_app_stop_timeout_ms();
                slot.session.lock().await.background_app_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    let _ = cmd_sender.send(SessionCommand::Stop {
                        session_handle,
                        trigger: StopTrigger::BackgroundPolicy,
                    });
                }));
            }
        }
    }
}

fn merge_start_params(session: &mut UwbSession, start_params: &StartRangingParams) {
    match &mut session.params {
        AppConfigParams::Ccc(params) => {
            if let Some(ran_multiplier) = start_params.ran_multiplier {
                params.set_ran_multiplier(ran_multiplier);
                session.needs_app_config_update = true;
            }
            if let Some(sts_index) = start_params.sts_index {
                params.set_sts_index(sts_index);
                session.needs_app_config_update = true;
            }
            if let Some(time_ms) = start_params.initiation_time_ms {
                params.set_initiation_time_ms(time_ms);
                session.needs_app_config_update = true;
            }
            if let Some(time_us) = start_params.absolute_initiation_time_us {
                params.set_absolute_initiation_time_us(Some(time_us));
                session.needs_app_config_update = true;
            }
        }
        AppConfigParams::Aliro(params) => {
            if let Some(ran_multiplier) = start_params.ran_multiplier {
                params.set_ran_multiplier(ran_multiplier);
                session.needs_app_config_update = true;
            }
            if let Some(sts_index) = start_params.sts_index {
                params.set_sts_index(sts_index);
                session.needs_app_config_update = true;
            }
            if let Some(time_ms) = start_params.initiation_time_ms {
                params.set_initiation_time_ms(time_ms);
                session.needs_app_config_update = true;
            }
            if let Some(time_us) = start_params.absolute_initiation_time_us {
                params.set_absolute_initiation_time_us(Some(time_us));
                session.needs_app_config_update = true;
            }
        }
        _ => {
            debug!("start params ignored for {:?} session", session.protocol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::params::fira_app_config_params::{
        FiraAppConfigParamsBuilder, MacAddressMode, RangeDataNtfConfig, RangingRoundUsage,
        SessionKey,
    };
    use crate::params::uci_packets::{
        ControleeStatus, DataTransferNtfStatusCode, OwrAoaRangingMeasurement,
        RangingMeasurementType, SessionUpdateDtTagRangingRoundsResponse,
        ShortAddressTwoWayRangingMeasurement, SubSessionKey,
    };
    use crate::policy::StaticPolicy;
    use crate::session::filtering::FilterEngine;
    use crate::sink::mock_sink::{MockNotificationSink, SinkEvent};
    use crate::uci::mock_transport::MockUciTransport;
    use crate::uci::notification::{
        DataRcvNotification, RangingMeasurements, SessionNotification, SessionRangeData,
    };

    struct Harness {
        manager: SessionManager,
        transport: MockUciTransport,
        events: mpsc::UnboundedReceiver<SinkEvent>,
    }

    impl Harness {
        fn new(policy: StaticPolicy) -> Self {
            Self::with_config(policy, SessionManagerConfig::default())
        }

        fn with_config(policy: StaticPolicy, config: SessionManagerConfig) -> Self {
            let transport = MockUciTransport::new();
            let (sink, events) = MockNotificationSink::new();
            let manager = SessionManager::new(transport.clone(), sink, policy, config);
            Self { manager, transport, events }
        }

        async fn next_event(&mut self) -> SinkEvent {
            self.events.recv().await.expect("sink channel closed")
        }
    }

    fn fg_policy() -> StaticPolicy {
        StaticPolicy { foreground_uids: HashSet::from([1000]), ..Default::default() }
    }

    fn status_ntf(
        session_id: SessionId,
        session_state: SessionState,
        reason_code: u8,
    ) -> SessionNotification {
        SessionNotification::Status { session_id, session_state, reason_code }
    }

    fn fira_builder() -> FiraAppConfigParamsBuilder {
        FiraAppConfigParamsBuilder::new()
            .device_mac_address(UwbAddress::Short([0x01, 0x02]))
            .dst_mac_address_list(vec![UwbAddress::Short([0xAA, 0x01])])
    }

    fn fira_params() -> AppConfigParams {
        AppConfigParams::Fira(fira_builder().build().unwrap())
    }

    fn peer() -> UwbAddress {
        UwbAddress::Extended([0xBE, 0xEF, 0, 0, 0, 0, 0, 0])
    }

    fn owr_aoa_params() -> AppConfigParams {
        AppConfigParams::Fira(
            FiraAppConfigParamsBuilder::new()
                .ranging_round_usage(RangingRoundUsage::OwrAoaMeasurement)
                .device_role(crate::params::fira_app_config_params::DeviceRole::Observer)
                .mac_address_mode(MacAddressMode::MacAddress8Bytes)
                .device_mac_address(UwbAddress::Extended([1, 2, 3, 4, 5, 6, 7, 8]))
                .dst_mac_address_list(vec![peer()])
                .build()
                .unwrap(),
        )
    }

    fn open_request(
        handle: u64,
        session_id: SessionId,
        uid: i32,
        params: AppConfigParams,
    ) -> OpenSessionRequest {
        OpenSessionRequest {
            session_handle: SessionHandle(handle),
            session_id,
            session_type: SessionType::FiraRangingSession,
            chip_id: "default".to_owned(),
            attribution_source: AttributionSource::new(uid, Some("com.test.ranging".to_owned())),
            params,
        }
    }

    async fn open_fira(
        harness: &mut Harness,
        handle: u64,
        session_id: SessionId,
        uid: i32,
        params: AppConfigParams,
    ) {
        harness.transport.expected_init_session(
            session_id,
            SessionType::FiraRangingSession,
            vec![status_ntf(session_id, SessionState::SessionStateInit, 0)],
            Ok(()),
        );
        harness.transport.expected_set_app_configurations(
            session_id,
            None,
            vec![status_ntf(session_id, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.open_ranging(open_request(handle, session_id, uid, params)).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingOpened(SessionHandle(handle))
        );
    }

    async fn start_session(harness: &mut Harness, handle: u64, session_id: SessionId) {
        harness.transport.expected_start_ranging(
            session_id,
            vec![status_ntf(session_id, SessionState::SessionStateActive, 0)],
            Ok(()),
        );
        harness.manager.start_ranging(SessionHandle(handle), None).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStarted(SessionHandle(handle))
        );
    }

    fn two_way_frame(session_id: SessionId, all_error: bool) -> SessionNotification {
        let status = if all_error {
            StatusCode::UciStatusRangingRxTimeout
        } else {
            StatusCode::UciStatusOk
        };
        SessionNotification::RangeData(SessionRangeData {
            sequence_number: 1,
            session_id,
            current_ranging_interval_ms: 200,
            ranging_measurement_type: RangingMeasurementType::TwoWay,
            ranging_measurements: RangingMeasurements::ShortAddressTwoWay(vec![
                ShortAddressTwoWayRangingMeasurement {
                    mac_address: 0xAA01,
                    status,
                    nlos: 0,
                    distance: 150,
                    aoa_azimuth: 0,
                    aoa_azimuth_fom: 100,
                    aoa_elevation: 0,
                    aoa_elevation_fom: 100,
                    aoa_destination_azimuth: 0,
                    aoa_destination_azimuth_fom: 0,
                    aoa_destination_elevation: 0,
                    aoa_destination_elevation_fom: 0,
                    slot_index: 1,
                    rssi: 60,
                },
            ]),
            rcr_indicator: 0,
        })
    }

    fn owr_frame(session_id: SessionId, address: UwbAddress) -> SessionNotification {
        SessionNotification::RangeData(SessionRangeData {
            sequence_number: 1,
            session_id,
            current_ranging_interval_ms: 200,
            ranging_measurement_type: RangingMeasurementType::OwrAoa,
            ranging_measurements: RangingMeasurements::OwrAoa(OwrAoaRangingMeasurement {
                mac_address: address,
                status: StatusCode::UciStatusOk,
                nlos: 0,
                frame_sequence_number: 1,
                block_index: 0,
                aoa_azimuth: 0,
                aoa_azimuth_fom: 100,
                aoa_elevation: 0,
                aoa_elevation_fom: 100,
            }),
            rcr_indicator: 0,
        })
    }

    fn data_rcv(session_id: SessionId, sequence_num: u16, payload: &[u8]) -> SessionNotification {
        SessionNotification::DataReceived(DataRcvNotification {
            session_id,
            status: StatusCode::UciStatusOk,
            uci_sequence_num: sequence_num,
            source_address: peer(),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    #[tokio::test]
    async fn test_open_start_stop_close_happy_path() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;
        assert_eq!(
            harness.manager.session_state(SessionHandle(1)).await,
            Some(SessionState::SessionStateActive)
        );

        harness.transport.expected_stop_ranging(
            7,
            vec![status_ntf(7, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.stop_ranging(SessionHandle(1)).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStopped(SessionHandle(1), RangingChangeReason::LocalApi, vec![])
        );

        harness.transport.expected_deinit_session(
            7,
            vec![status_ntf(7, SessionState::SessionStateDeinit, 0)],
            Ok(()),
        );
        harness.manager.close_ranging(SessionHandle(1)).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingClosed(
                SessionHandle(1),
                RangingChangeReason::LocalApi,
                StatusCode::UciStatusOk
            )
        );

        assert!(harness.transport.wait_expected_calls_done().await);
        assert_eq!(harness.manager.session_state(SessionHandle(1)).await, None);
        let closed = harness.manager.recently_closed().await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].session_id, 7);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_when_already_stopped() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.expected_stop_ranging(
            7,
            vec![status_ntf(7, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.stop_ranging(SessionHandle(1)).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStopped(SessionHandle(1), RangingChangeReason::LocalApi, vec![])
        );

        // No further UCI traffic; the session is already idle for the
        // expected reason.
        harness.manager.stop_ranging(SessionHandle(1)).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStopped(SessionHandle(1), RangingChangeReason::LocalApi, vec![])
        );
        assert!(harness.transport.wait_expected_calls_done().await);
    }

    #[tokio::test]
    async fn test_open_rejects_duplicate_session_id() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;

        harness.manager.open_ranging(open_request(2, 7, 1000, fira_params())).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingOpenFailed(
                SessionHandle(2),
                RangingChangeReason::BadParameters,
                StatusCode::UciStatusSessionDuplicate
            )
        );
    }

    #[tokio::test]
    async fn test_admission_evicts_lowest_priority_fira_session() {
        let policy = StaticPolicy {
            max_fira_sessions: 2,
            foreground_uids: HashSet::from([2000]),
            privileged_uids: HashSet::from([3000]),
            ..Default::default()
        };
        let mut harness = Harness::new(policy);
        // Background app, priority 40.
        open_fira(&mut harness, 1, 1, 1000, fira_params()).await;
        // Foreground app, priority 60.
        open_fira(&mut harness, 2, 2, 2000, fira_params()).await;

        // A privileged open (priority 70) evicts the priority-40 session.
        harness.transport.expected_deinit_session(
            1,
            vec![status_ntf(1, SessionState::SessionStateDeinit, 0)],
            Ok(()),
        );
        harness.transport.expected_init_session(
            3,
            SessionType::FiraRangingSession,
            vec![status_ntf(3, SessionState::SessionStateInit, 0)],
            Ok(()),
        );
        harness.transport.expected_set_app_configurations(
            3,
            None,
            vec![status_ntf(3, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.open_ranging(open_request(3, 3, 3000, fira_params())).unwrap();

        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingClosed(
                SessionHandle(1),
                RangingChangeReason::MaxSessionsReached,
                StatusCode::UciStatusOk
            )
        );
        assert_eq!(harness.next_event().await, SinkEvent::RangingOpened(SessionHandle(3)));
        assert!(harness.transport.wait_expected_calls_done().await);
        assert_eq!(harness.manager.session_state(SessionHandle(1)).await, None);
    }

    #[tokio::test]
    async fn test_admission_rejects_when_no_eviction_possible() {
        let policy = StaticPolicy { max_fira_sessions: 1, ..Default::default() };
        let mut harness = Harness::new(policy);
        // Both opens are background apps at the same priority band.
        open_fira(&mut harness, 1, 1, 1000, fira_params()).await;
        harness.manager.open_ranging(open_request(2, 2, 2000, fira_params())).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingOpenFailed(
                SessionHandle(2),
                RangingChangeReason::MaxSessionsReached,
                StatusCode::UciStatusMaxSessionsExceeded
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ranging_error_streak_stops_session() {
        let policy = StaticPolicy {
            foreground_uids: HashSet::from([1000]),
            ranging_error_streak_timeout_ms: 5_000,
            ..Default::default()
        };
        let mut harness = Harness::new(policy);
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.expected_stop_ranging(
            7,
            vec![status_ntf(7, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        for _ in 0..5 {
            harness.transport.send_notification(two_way_frame(7, true));
        }
        for _ in 0..5 {
            assert!(matches!(harness.next_event().await, SinkEvent::RangingResult(..)));
        }
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStopped(SessionHandle(1), RangingChangeReason::SystemPolicy, vec![])
        );
        assert!(harness.transport.wait_expected_calls_done().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ranging_error_streak_cleared_by_success() {
        let policy = StaticPolicy {
            foreground_uids: HashSet::from([1000]),
            ranging_error_streak_timeout_ms: 5_000,
            ..Default::default()
        };
        let mut harness = Harness::new(policy);
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.send_notification(two_way_frame(7, true));
        harness.transport.send_notification(two_way_frame(7, true));
        harness.transport.send_notification(two_way_frame(7, false));
        for _ in 0..3 {
            assert!(matches!(harness.next_event().await, SinkEvent::RangingResult(..)));
        }

        // Past the streak deadline and still active: the success frame
        // disarmed the timer.
        tokio::time::sleep(Duration::from_millis(6_000)).await;
        assert_eq!(
            harness.manager.session_state(SessionHandle(1)).await,
            Some(SessionState::SessionStateActive)
        );
    }

    #[tokio::test]
    async fn test_owr_aoa_buffered_delivery_in_sequence_order() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, owr_aoa_params()).await;
        start_session(&mut harness, 1, 7).await;

        for (sequence_num, payload) in [(5u16, b"e"), (3, b"c"), (4, b"d")] {
            harness.transport.send_notification(data_rcv(7, sequence_num, payload));
        }
        // Two on-axis frames make the peer a pointed target.
        harness.transport.send_notification(owr_frame(7, peer()));
        harness.transport.send_notification(owr_frame(7, peer()));

        assert!(matches!(harness.next_event().await, SinkEvent::RangingResult(..)));
        assert!(matches!(harness.next_event().await, SinkEvent::RangingResult(..)));
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataReceived(SessionHandle(1), peer(), 3, b"c".to_vec())
        );
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataReceived(SessionHandle(1), peer(), 4, b"d".to_vec())
        );
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataReceived(SessionHandle(1), peer(), 5, b"e".to_vec())
        );
    }

    #[tokio::test]
    async fn test_non_owr_data_is_delivered_immediately() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.send_notification(data_rcv(7, 9, b"now"));
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataReceived(SessionHandle(1), peer(), 9, b"now".to_vec())
        );
    }

    #[tokio::test]
    async fn test_multicast_add_with_individual_keys() {
        let mut harness = Harness::new(fg_policy());
        let params = AppConfigParams::Fira(
            fira_builder()
                .sts_config(StsConfig::ProvisionedForControleeIndividualKey)
                .session_key(SessionKey::new(vec![0x5A; 16]))
                .build()
                .unwrap(),
        );
        open_fira(&mut harness, 1, 7, 1000, params).await;

        let update_ntf = SessionNotification::UpdateControllerMulticastList {
            session_id: 7,
            remaining_multicast_list_size: 6,
            status_list: vec![
                ControleeStatus {
                    mac_address: [0x11, 0x00],
                    subsession_id: 1,
                    status: MulticastUpdateStatusCode::StatusOkMulticastListUpdate,
                },
                ControleeStatus {
                    mac_address: [0x22, 0x00],
                    subsession_id: 2,
                    status: MulticastUpdateStatusCode::StatusErrorAddressAlreadyPresent,
                },
            ],
        };
        harness.transport.expected_controller_multicast_list_update(
            7,
            UpdateMulticastListAction::AddControleeWithShortSubSessionKey,
            vec![update_ntf],
            Ok(()),
        );
        harness
            .manager
            .update_controller_multicast_list(
                SessionHandle(1),
                UpdateMulticastListAction::AddControleeWithShortSubSessionKey,
                vec![
                    Controlee {
                        short_address: [0x11, 0x00],
                        subsession_id: 1,
                        subsession_key: Some(SubSessionKey::new(vec![1; 16])),
                    },
                    Controlee {
                        short_address: [0x22, 0x00],
                        subsession_id: 2,
                        subsession_key: Some(SubSessionKey::new(vec![2; 16])),
                    },
                ],
            )
            .unwrap();

        assert_eq!(
            harness.next_event().await,
            SinkEvent::ControleeAdded(SessionHandle(1), [0x11, 0x00])
        );
        assert_eq!(
            harness.next_event().await,
            SinkEvent::ControleeAddFailed(
                SessionHandle(1),
                [0x22, 0x00],
                MulticastUpdateStatusCode::StatusErrorAddressAlreadyPresent
            )
        );
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingReconfigureFailed(
                SessionHandle(1),
                RangingChangeReason::BadParameters,
                StatusCode::UciStatusAddressAlreadyPresent
            )
        );

        let controlees = harness.manager.controlee_addresses(SessionHandle(1)).await;
        assert!(controlees.contains(&[0x11, 0x00]));
        assert!(!controlees.contains(&[0x22, 0x00]));
    }

    #[tokio::test]
    async fn test_keyed_multicast_add_requires_provisioned_individual_sts() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;

        // Static STS session: the keyed add variant is rejected before any
        // UCI traffic.
        harness
            .manager
            .update_controller_multicast_list(
                SessionHandle(1),
                UpdateMulticastListAction::AddControleeWithShortSubSessionKey,
                vec![Controlee {
                    short_address: [0x33, 0x00],
                    subsession_id: 3,
                    subsession_key: Some(SubSessionKey::new(vec![3; 16])),
                }],
            )
            .unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingReconfigureFailed(
                SessionHandle(1),
                RangingChangeReason::BadParameters,
                StatusCode::UciStatusInvalidParam
            )
        );
    }

    #[tokio::test]
    async fn test_background_transition_overrides_notification_control() {
        let mut harness = Harness::new(fg_policy());
        let params = AppConfigParams::Fira(
            fira_builder()
                .range_data_ntf_config(RangeDataNtfConfig::EnableProximityLevelTrig)
                .range_data_ntf_proximity_near_cm(50)
                .range_data_ntf_proximity_far_cm(500)
                .build()
                .unwrap(),
        );
        let fira = params.fira().unwrap().clone();
        open_fira(&mut harness, 1, 7, 1000, params).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.expected_set_app_configurations(
            7,
            Some(fira.range_data_ntf_override_tlvs(false)),
            vec![],
            Ok(()),
        );
        harness.manager.notify_uid_importance(1000, false).unwrap();

        harness.transport.expected_set_app_configurations(
            7,
            Some(fira.range_data_ntf_override_tlvs(true)),
            vec![],
            Ok(()),
        );
        harness.manager.notify_uid_importance(1000, true).unwrap();

        assert!(harness.transport.wait_expected_calls_done().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_app_timer_stops_session() {
        let policy = StaticPolicy {
            foreground_uids: HashSet::from([1000]),
            background_ranging_enabled: false,
            background_app_stop_timeout_ms: 1_000,
            ..Default::default()
        };
        let mut harness = Harness::new(policy);
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.expected_set_app_configurations(7, None, vec![], Ok(()));
        harness.transport.expected_stop_ranging(
            7,
            vec![status_ntf(7, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.notify_uid_importance(1000, false).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStopped(SessionHandle(1), RangingChangeReason::SystemPolicy, vec![])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_reports_failure_and_removes_session() {
        let mut harness = Harness::new(fg_policy());
        // Init succeeds but the UWBS never reports the Init state.
        harness.transport.expected_init_session(
            7,
            SessionType::FiraRangingSession,
            vec![],
            Ok(()),
        );
        harness.transport.expected_deinit_session(7, vec![], Ok(()));
        harness.manager.open_ranging(open_request(1, 7, 1000, fira_params())).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingOpenFailed(
                SessionHandle(1),
                RangingChangeReason::Unknown,
                StatusCode::UciStatusFailed
            )
        );
        assert_eq!(harness.manager.session_state(SessionHandle(1)).await, None);
    }

    #[tokio::test]
    async fn test_remote_stop_surfaces_reason() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.send_notification(status_ntf(
            7,
            SessionState::SessionStateIdle,
            ReasonCode::MaxRangingRoundRetryCountReached as u8,
        ));
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingStopped(
                SessionHandle(1),
                RangingChangeReason::MaxRrRetryReached,
                vec![]
            )
        );
        assert_eq!(
            harness.manager.session_state(SessionHandle(1)).await,
            Some(SessionState::SessionStateIdle)
        );
    }

    #[tokio::test]
    async fn test_remote_deinit_closes_session() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.send_notification(status_ntf(
            7,
            SessionState::SessionStateDeinit,
            ReasonCode::MaxRangingRoundRetryCountReached as u8,
        ));
        assert_eq!(
            harness.next_event().await,
            SinkEvent::RangingClosed(
                SessionHandle(1),
                RangingChangeReason::MaxRrRetryReached,
                StatusCode::UciStatusOk
            )
        );
        assert_eq!(harness.manager.session_state(SessionHandle(1)).await, None);
        assert_eq!(harness.manager.recently_closed().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_data_roundtrip() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.expected_send_data(
            7,
            vec![SessionNotification::DataSendStatus {
                session_id: 7,
                status: DataTransferNtfStatusCode::UciDataTransferNtfStatusOk,
                uci_sequence_number: 0,
                tx_count: 1,
            }],
            Ok(()),
        );
        harness
            .manager
            .send_data(
                SessionHandle(1),
                UwbAddress::Short([0xAA, 0x01]),
                Bytes::from_static(b"hello"),
            )
            .unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataSent(SessionHandle(1), UwbAddress::Short([0xAA, 0x01]), 0)
        );
    }

    #[tokio::test]
    async fn test_send_data_requires_active_session() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;

        harness
            .manager
            .send_data(SessionHandle(1), UwbAddress::Short([0xAA, 0x01]), Bytes::from_static(b"x"))
            .unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataSendFailed(
                SessionHandle(1),
                UwbAddress::Short([0xAA, 0x01]),
                0,
                StatusCode::UciStatusRejected
            )
        );
    }

    #[tokio::test]
    async fn test_send_data_transport_failure_discards_tracking() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        start_session(&mut harness, 1, 7).await;

        harness.transport.expected_send_data(
            7,
            vec![],
            Err(Error::Transport(StatusCode::UciStatusFailed)),
        );
        harness
            .manager
            .send_data(SessionHandle(1), UwbAddress::Short([0xAA, 0x01]), Bytes::from_static(b"x"))
            .unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataSendFailed(
                SessionHandle(1),
                UwbAddress::Short([0xAA, 0x01]),
                0,
                StatusCode::UciStatusFailed
            )
        );
    }

    #[tokio::test]
    async fn test_data_transfer_phase_config_roundtrip() {
        let mut harness = Harness::new(fg_policy());
        let mut request = open_request(1, 7, 1000, fira_params());
        request.session_type = SessionType::FiraRangingAndInBandDataSession;
        harness.transport.expected_init_session(
            7,
            SessionType::FiraRangingAndInBandDataSession,
            vec![status_ntf(7, SessionState::SessionStateInit, 0)],
            Ok(()),
        );
        harness.transport.expected_set_app_configurations(
            7,
            None,
            vec![status_ntf(7, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.open_ranging(request).unwrap();
        assert_eq!(harness.next_event().await, SinkEvent::RangingOpened(SessionHandle(1)));

        // Control byte 0x02: short addresses, two-byte slot bitmaps.
        let config = DataTransferPhaseConfig {
            dtpcm_repetition: 0,
            data_transfer_control: 0x02,
            phases: vec![DataTransferPhaseEntry {
                mac_address: vec![0xAA, 0x01],
                slot_bitmap: vec![0xFF, 0x00],
            }],
        };
        harness.transport.expected_set_data_transfer_phase_config(
            7,
            vec![SessionNotification::DataTransferPhaseConfig {
                session_id: 7,
                status: DataTransferPhaseConfigStatusCode::UciDtpcmConfigSuccess,
            }],
            Ok(()),
        );
        harness.manager.set_data_transfer_phase_config(SessionHandle(1), config).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataTransferPhaseConfigured(SessionHandle(1))
        );

        // Mismatched bitmap size: rejected without UCI traffic.
        let bad = DataTransferPhaseConfig {
            dtpcm_repetition: 0,
            data_transfer_control: 0x02,
            phases: vec![DataTransferPhaseEntry {
                mac_address: vec![0xAA, 0x01],
                slot_bitmap: vec![0xFF],
            }],
        };
        harness.manager.set_data_transfer_phase_config(SessionHandle(1), bad).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DataTransferPhaseConfigFailed(
                SessionHandle(1),
                StatusCode::UciStatusInvalidParam
            )
        );
    }

    #[tokio::test]
    async fn test_dt_tag_rounds_update() {
        let mut harness = Harness::new(fg_policy());
        let params = AppConfigParams::Fira(
            fira_builder()
                .device_role(crate::params::fira_app_config_params::DeviceRole::DtTag)
                .ranging_round_usage(RangingRoundUsage::DlTdoa)
                .build()
                .unwrap(),
        );
        open_fira(&mut harness, 1, 7, 1000, params).await;

        harness.transport.expected_session_update_dt_tag_ranging_rounds(
            7,
            Ok(SessionUpdateDtTagRangingRoundsResponse {
                status: StatusCode::UciStatusOk,
                ranging_round_indexes: vec![2],
            }),
        );
        harness
            .manager
            .update_dt_tag_ranging_rounds(SessionHandle(1), vec![1, 2, 3])
            .unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DtTagRoundsUpdateStatus(SessionHandle(1), StatusCode::UciStatusOk, vec![2])
        );

        // A non-DT-Tag session is rejected locally.
        open_fira(&mut harness, 2, 8, 1000, fira_params()).await;
        harness.manager.update_dt_tag_ranging_rounds(SessionHandle(2), vec![1]).unwrap();
        assert_eq!(
            harness.next_event().await,
            SinkEvent::DtTagRoundsUpdateStatus(
                SessionHandle(2),
                StatusCode::UciStatusInvalidParam,
                vec![]
            )
        );
    }

    #[tokio::test]
    async fn test_uci_v2_open_and_start_anchor_initiation_time() {
        let config = SessionManagerConfig {
            chips: vec![ChipInfo {
                chip_id: "default".to_owned(),
                uci_version: ProtocolVersion::new(2, 0),
            }],
            ..Default::default()
        };
        let mut harness = Harness::with_config(fg_policy(), config);
        let params = AppConfigParams::Fira(fira_builder().initiation_time_ms(100).build().unwrap());

        harness.transport.expected_init_session(
            7,
            SessionType::FiraRangingSession,
            vec![status_ntf(7, SessionState::SessionStateInit, 0)],
            Ok(()),
        );
        harness.transport.expected_get_session_token(7, Ok(0x1111));
        harness.transport.expected_query_uwbs_timestamp_micros(Ok(1_000_000));
        harness.transport.expected_set_app_configurations(
            7,
            None,
            vec![status_ntf(7, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.manager.open_ranging(open_request(1, 7, 1000, params)).unwrap();
        assert_eq!(harness.next_event().await, SinkEvent::RangingOpened(SessionHandle(1)));

        let configs = harness.transport.received_app_configs();
        let initiation_tlv = configs[0]
            .1
            .iter()
            .find(|tlv| tlv.cfg_id == AppConfigTlvType::UwbInitiationTime)
            .cloned()
            .unwrap();
        // 1_000_000 us + 100 ms, encoded as the absolute 8-byte form.
        assert_eq!(initiation_tlv.v, 1_100_000u64.to_le_bytes().to_vec());

        // The computed anchor was reset after open, so start recomputes
        // against the fresh timestamp.
        harness.transport.expected_query_uwbs_timestamp_micros(Ok(2_000_000));
        harness.transport.expected_set_app_configurations(7, None, vec![], Ok(()));
        harness.transport.expected_start_ranging(
            7,
            vec![status_ntf(7, SessionState::SessionStateActive, 0)],
            Ok(()),
        );
        harness.manager.start_ranging(SessionHandle(1), None).unwrap();
        assert_eq!(harness.next_event().await, SinkEvent::RangingStarted(SessionHandle(1)));

        let configs = harness.transport.received_app_configs();
        let initiation_tlv = configs
            .last()
            .unwrap()
            .1
            .iter()
            .find(|tlv| tlv.cfg_id == AppConfigTlvType::UwbInitiationTime)
            .cloned()
            .unwrap();
        assert_eq!(initiation_tlv.v, 2_100_000u64.to_le_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_hybrid_phase_list_uses_cached_tokens() {
        let mut harness = Harness::new(fg_policy());
        open_fira(&mut harness, 1, 1, 1000, fira_params()).await;

        let params = AppConfigParams::Fira(
            fira_builder()
                .hybrid_phase_list(vec![crate::params::fira_app_config_params::HybridPhase {
                    session_handle: SessionHandle(1),
                    resolved_session_token: None,
                    start_slot_index: 0,
                    end_slot_index: 5,
                }])
                .build()
                .unwrap(),
        );
        harness.transport.expected_init_session(
            2,
            SessionType::FiraRangingSession,
            vec![status_ntf(2, SessionState::SessionStateInit, 0)],
            Ok(()),
        );
        harness.transport.expected_set_app_configurations(
            2,
            None,
            vec![status_ntf(2, SessionState::SessionStateIdle, 0)],
            Ok(()),
        );
        harness.transport.expected_set_hybrid_session_configuration(2, Ok(()));
        harness.manager.open_ranging(open_request(2, 2, 1000, params)).unwrap();
        assert_eq!(harness.next_event().await, SinkEvent::RangingOpened(SessionHandle(2)));
        assert!(harness.transport.wait_expected_calls_done().await);
    }

    struct CountingFilter {
        closed: Arc<AtomicUsize>,
    }

    impl FilterEngine for CountingFilter {
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingPose {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl PoseSource for CountingPose {
        fn start(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_filter_engines_and_pose_source_lifecycle() {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let pose = Arc::new(CountingPose {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let factory: FilterEngineFactory = {
            let created = created.clone();
            let closed = closed.clone();
            Box::new(move |_address| {
                created.fetch_add(1, Ordering::SeqCst);
                Some(Box::new(CountingFilter { closed: closed.clone() }))
            })
        };
        let config = SessionManagerConfig {
            filter_engine_factory: Some(factory),
            default_pose_source: Some(pose.clone()),
            ..Default::default()
        };
        let mut harness = Harness::with_config(fg_policy(), config);

        open_fira(&mut harness, 1, 7, 1000, fira_params()).await;
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pose.started.load(Ordering::SeqCst), 1);

        harness.transport.expected_deinit_session(
            7,
            vec![status_ntf(7, SessionState::SessionStateDeinit, 0)],
            Ok(()),
        );
        harness.manager.close_ranging(SessionHandle(1)).unwrap();
        assert!(matches!(harness.next_event().await, SinkEvent::RangingClosed(..)));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pose.stopped.load(Ordering::SeqCst), 1);
    }
}
