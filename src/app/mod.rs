//! Process lifecycle: one explicit context, ordered bring-up and teardown.
//!
//! The context replaces the pile of process-wide globals a viewer tends to
//! grow. Exactly one may exist; constructing a second reports an error
//! instead of aborting. Every component that needs shared state receives it
//! from here.

pub mod markers;
pub mod memsim;
pub mod watchdog;

mod fatal;
mod idle;
mod main_loop;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::{self, AppConfig};
use crate::error::LifecycleError;
use crate::frontend::Frontend;
use crate::msg::{AdaptiveThrottle, DrainBudget, MessageChannels, MessageSystem};
use crate::speaker::{SpeakerDelta, SpeakerFeed, SpeakerRegistry};
use crate::telemetry;
use crate::voice::VoiceClient;
use crate::workers::WorkerSet;
use crate::world::WorldModel;
use crate::{AgentId, RegionId, SessionId};

use markers::{LastExecEvent, MarkerFiles};
use memsim::MemLeakSim;
use watchdog::WatchdogTimeout;

/// Exactly one context may exist per process.
static CONTEXT_LIVE: AtomicBool = AtomicBool::new(false);

pub(crate) const AGENT_UPDATES_PER_SECOND: f32 = 10.0;
/// How long to wait for a LogoutReply before quitting anyway.
pub(crate) const LOGOUT_REQUEST_TIME: Duration = Duration::from_secs(6);
/// Grace window for pending asset uploads during shutdown.
pub(crate) const SHUTDOWN_UPLOAD_SAVE_TIME: Duration = Duration::from_secs(5);
pub(crate) const FRAME_STALL_THRESHOLD: Duration = Duration::from_secs(1);
const MEM_SIM_BLOCK_BYTES: usize = 512 * 1024;
const MEM_SIM_MAX_BLOCKS: usize = 64;
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_THROTTLE_BPS: f32 = 1_500_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Uninitialized,
    Initializing,
    Running,
    LogoutPending,
    ShuttingDown,
    Terminated,
}

#[derive(Debug)]
pub(crate) struct AgentState {
    pub(crate) id: AgentId,
    pub(crate) session: SessionId,
    pub(crate) control_flags: u32,
    pub(crate) last_control_flags: u32,
    pub(crate) control_flags_dirty: bool,
    pub(crate) last_agent_update: Option<Instant>,
    pub(crate) avatar_ready: bool,
    pub(crate) mute_list_ready: bool,
    pub(crate) initial_ims_requested: bool,
    pub(crate) region_last_id: Option<RegionId>,
    pub(crate) region_last_alive: bool,
    pub(crate) pending_uploads: usize,
}

impl AgentState {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            session: uuid::Uuid::new_v4(),
            control_flags: 0,
            last_control_flags: 0,
            control_flags_dirty: false,
            last_agent_update: None,
            avatar_ready: false,
            mute_list_ready: false,
            initial_ims_requested: false,
            region_last_id: None,
            region_last_alive: false,
            pending_uploads: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct FrameStats {
    pub(crate) frame_count: u64,
    pub(crate) packets_in: u64,
    pub(crate) frame_stalls: u64,
    pub(crate) last_frame: Option<Instant>,
    pub(crate) dt_clamped: Duration,
    pub(crate) fps_smoothed: f32,
    pub(crate) started_at: Instant,
}

impl FrameStats {
    fn new() -> Self {
        Self {
            frame_count: 0,
            packets_in: 0,
            frame_stalls: 0,
            last_frame: None,
            dt_clamped: Duration::from_millis(16),
            fps_smoothed: 60.0,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LogoutState {
    pub(crate) logout_requested: bool,
    pub(crate) quit_requested: bool,
    pub(crate) requested_at: Option<Instant>,
    pub(crate) request_sent_at: Option<Instant>,
    pub(crate) max_uploads_seen: usize,
}

/// Per-frame speaker registry deltas, pulled by whoever renders lists.
#[derive(Debug, Default, Clone)]
pub struct SpeakerFrameDeltas {
    pub active: SpeakerDelta,
    pub local: SpeakerDelta,
    pub sessions: Vec<(SessionId, SpeakerDelta)>,
}

pub struct AppContext {
    pub config: AppConfig,
    phase: LifecyclePhase,
    data_dir: PathBuf,

    pub(crate) frontend: Box<dyn Frontend>,
    pub(crate) voice: Box<dyn VoiceClient>,
    pub(crate) msg: MessageSystem,
    pub(crate) world: WorldModel,
    pub(crate) workers: Option<WorkerSet>,
    pub(crate) watchdog: Option<WatchdogTimeout>,
    pub(crate) markers: MarkerFiles,
    pub(crate) memsim: Option<MemLeakSim>,

    last_exec: LastExecEvent,

    pub(crate) active_speakers: SpeakerRegistry,
    pub(crate) local_speakers: SpeakerRegistry,
    pub(crate) session_speakers: HashMap<SessionId, SpeakerRegistry>,
    pub(crate) speaker_deltas: SpeakerFrameDeltas,

    pub(crate) agent: AgentState,
    pub(crate) frame: FrameStats,
    pub(crate) drain_budget: DrainBudget,
    pub(crate) throttle: AdaptiveThrottle,
    pub(crate) logout: LogoutState,

    pub(crate) exiting: bool,
    pub(crate) do_disconnect: bool,
    pub(crate) disconnected: bool,
    pub(crate) startup_complete: bool,
    pub(crate) last_disconnect_reason: Option<String>,

    pub(crate) idle_callbacks: Vec<Box<dyn FnMut(Duration) + Send>>,
    pub(crate) quit_signal: Option<Box<dyn Fn() -> bool + Send>>,
}

impl AppContext {
    /// Construct the process's single context. The returned channel bundle
    /// is handed to the transport layer; everything else lives inside.
    pub fn new(
        config: AppConfig,
        frontend: Box<dyn Frontend>,
        voice: Box<dyn VoiceClient>,
    ) -> Result<(Self, MessageChannels), LifecycleError> {
        let data_dir = config::data_dir().unwrap_or_else(std::env::temp_dir);
        Self::with_data_dir(config, frontend, voice, data_dir)
    }

    /// As [`AppContext::new`] with an explicit data directory (marker files,
    /// caches). Used directly by tests.
    pub fn with_data_dir(
        config: AppConfig,
        frontend: Box<dyn Frontend>,
        voice: Box<dyn VoiceClient>,
        data_dir: PathBuf,
    ) -> Result<(Self, MessageChannels), LifecycleError> {
        if CONTEXT_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LifecycleError::DuplicateInitialization);
        }

        let (msg, channels) = MessageSystem::new();
        let chat_radius = config.chat_radius_m;
        let context = Self {
            config,
            phase: LifecyclePhase::Uninitialized,
            markers: MarkerFiles::new(&data_dir),
            data_dir,
            frontend,
            voice,
            msg,
            world: WorldModel::new(),
            workers: None,
            watchdog: None,
            memsim: None,
            last_exec: LastExecEvent::Normal,
            active_speakers: SpeakerRegistry::new(SpeakerFeed::Channel, None),
            local_speakers: SpeakerRegistry::new(
                SpeakerFeed::Proximity {
                    radius_m: chat_radius,
                },
                None,
            ),
            session_speakers: HashMap::new(),
            speaker_deltas: SpeakerFrameDeltas::default(),
            agent: AgentState::new(),
            frame: FrameStats::new(),
            drain_budget: DrainBudget::new(),
            throttle: AdaptiveThrottle::new(DEFAULT_THROTTLE_BPS),
            logout: LogoutState::default(),
            exiting: false,
            do_disconnect: false,
            disconnected: false,
            startup_complete: false,
            last_disconnect_reason: None,
            idle_callbacks: Vec::new(),
            quit_signal: None,
        };
        Ok((context, channels))
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn last_exec(&self) -> LastExecEvent {
        self.last_exec
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn last_disconnect_reason(&self) -> Option<&str> {
        self.last_disconnect_reason.as_deref()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame.frame_count
    }

    pub fn packets_in(&self) -> u64 {
        self.frame.packets_in
    }

    pub fn frame_stalls(&self) -> u64 {
        self.frame.frame_stalls
    }

    pub fn active_speakers(&self) -> &SpeakerRegistry {
        &self.active_speakers
    }

    pub fn local_speakers(&self) -> &SpeakerRegistry {
        &self.local_speakers
    }

    pub fn session_speakers(&self, session: SessionId) -> Option<&SpeakerRegistry> {
        self.session_speakers.get(&session)
    }

    pub fn speaker_deltas(&self) -> &SpeakerFrameDeltas {
        &self.speaker_deltas
    }

    pub fn world_mut(&mut self) -> &mut WorldModel {
        &mut self.world
    }

    /// Startup (login, handshake, first region) finished; the main loop may
    /// now render the world and honor disconnect requests.
    pub fn notify_startup_complete(&mut self) {
        self.startup_complete = true;
    }

    pub fn notify_avatar_ready(&mut self) {
        self.agent.avatar_ready = true;
    }

    pub fn notify_mute_list_ready(&mut self) {
        self.agent.mute_list_ready = true;
    }

    pub fn register_idle_callback(&mut self, callback: Box<dyn FnMut(Duration) + Send>) {
        self.idle_callbacks.push(callback);
    }

    /// External quit condition (signal handler, embedding host) polled once
    /// per frame; returning `true` ends the session like a user quit.
    pub fn set_quit_signal(&mut self, signal: Box<dyn Fn() -> bool + Send>) {
        self.quit_signal = Some(signal);
    }

    /// Bring the process up. Any error means the caller must exit without
    /// entering the main loop.
    pub fn init(&mut self) -> Result<(), LifecycleError> {
        self.phase = LifecyclePhase::Initializing;

        // Directories first; everything else writes into them.
        fs::create_dir_all(&self.data_dir)?;

        // Logging rotates the previous session's file to .old.
        telemetry::init_tracing(&self.config);

        // Settings precedence: built-in defaults are already in the clap
        // schema, file values land only where no explicit CLI flag was
        // given, so the command line always wins.
        let user_settings = config::load_user_settings()?;
        config::apply_user_settings(
            &mut self.config,
            &user_settings,
            &config::detect_explicit_flags(),
        );

        // Instance arbitration and crash taxonomy before anything expensive.
        self.last_exec = self.markers.startup()?;
        if !self.config.allow_multiple_instances {
            if let Some(pid) = self.markers.live_instance_pid() {
                return Err(LifecycleError::SecondInstance { pid });
            }
        }
        if self.last_exec != LastExecEvent::Normal {
            tracing::warn!(event = ?self.last_exec, "previous run did not exit cleanly");
            if !self.frontend.confirm_previous_crash(self.last_exec) {
                return Err(LifecycleError::PreviousCrashDeclined);
            }
        }

        // Transport endpoints already exist (created with the context);
        // worker threads must come up only after that, never before.
        self.workers = Some(WorkerSet::start(&self.config)?);

        // GL crash guard: the flag goes to disk before the attempt and is
        // cleared only after success, so a driver crash is visible on the
        // next launch even without a live crash handler.
        let mut crash_settings = config::load_crash_settings();
        if crash_settings.gl_init_pending {
            tracing::warn!("previous run crashed during window/GL init");
        }
        crash_settings.gl_init_pending = true;
        config::save_crash_settings(&crash_settings);
        self.frontend.init_window()?;
        crash_settings.gl_init_pending = false;
        config::save_crash_settings(&crash_settings);

        // Input devices last; everything they report into now exists.
        self.frontend.init_joystick();

        if self.config.mem_leak_sim {
            self.memsim = Some(MemLeakSim::new(MEM_SIM_BLOCK_BYTES, MEM_SIM_MAX_BLOCKS));
        }

        self.phase = LifecyclePhase::Running;
        Ok(())
    }

    /// Registry for an IM session, created on first use.
    pub fn session_registry_mut(&mut self, session: SessionId) -> &mut SpeakerRegistry {
        self.session_speakers
            .entry(session)
            .or_insert_with(|| SpeakerRegistry::new(SpeakerFeed::Session, Some(session)))
    }

    /// Ask for a logout handshake; `quit_after` ends the process once the
    /// server confirms (or the logout timeout fires).
    pub fn request_logout(&mut self, quit_after: bool, now: Instant) {
        self.logout.logout_requested = true;
        self.logout.quit_requested = quit_after;
        self.logout.requested_at = Some(now);
        self.phase = LifecyclePhase::LogoutPending;
        tracing::info!(quit_after, "logout requested");
    }

    /// Skip the handshake entirely.
    pub(crate) fn force_quit(&mut self) {
        if self.logout.quit_requested || !self.logout.logout_requested {
            tracing::info!("force quit");
            self.exiting = true;
            self.phase = LifecyclePhase::ShuttingDown;
        } else {
            // Logout without quit: back to the login screen.
            self.disconnect_viewer();
            self.logout = LogoutState::default();
            self.phase = LifecyclePhase::Running;
        }
    }

    /// Escalate a dead session: the main loop will disconnect once startup
    /// has completed.
    pub(crate) fn force_disconnect(&mut self, reason: String) {
        if self.do_disconnect {
            // Already on our way out; keep the first reason.
            return;
        }
        tracing::warn!(%reason, "forcing disconnect");
        self.last_disconnect_reason = Some(reason);
        self.do_disconnect = true;
    }

    pub(crate) fn disconnect_viewer(&mut self) {
        if self.disconnected {
            return;
        }
        tracing::info!("disconnecting viewer");
        self.disconnected = true;
        self.do_disconnect = false;
        self.world.clear();
        self.session_speakers.clear();
    }

    /// Strictly ordered teardown; see the comments for why each step sits
    /// where it does.
    pub fn cleanup(&mut self) {
        self.phase = LifecyclePhase::ShuttingDown;

        // World state first: HUD effects and object lists must die while the
        // systems they reference are still alive.
        self.world.clear();
        self.session_speakers.clear();
        self.active_speakers.clear();
        self.local_speakers.clear();

        // Window before workers; render no longer races background decode.
        self.frontend.shutdown_window();

        // Workers drained with a bounded wait-and-warn loop.
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown_all(WORKER_SHUTDOWN_GRACE);
        }

        // Watchdog after the last thing that could stall, before messaging.
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.destroy();
        }

        // Clean exit: every marker disappears. Only a crash or freeze leaves
        // one behind for the next launch to classify.
        self.markers.remove_markers(false);

        self.phase = LifecyclePhase::Terminated;
        tracing::info!("cleanup complete");
    }

    pub(crate) fn ping_watchdog(&self, state: &str) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.ping(state);
        }
    }

    pub(crate) fn pause_watchdog(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.pause();
        }
    }

    pub(crate) fn resume_watchdog(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.resume();
        }
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        if self.phase != LifecyclePhase::Terminated {
            self.cleanup();
        }
        CONTEXT_LIVE.store(false, Ordering::SeqCst);
    }
}
