//! Per-frame update: network drain, agent updates, world order, shutdown
//! gating. Split from the loop driver so each piece stays testable with an
//! injected `now`.

use std::time::{Duration, Instant};

use crate::msg::{InboundMessage, OutboundMessage, MESSAGE_MAX_PER_FRAME};
use crate::speaker::UpdateContext;

use super::{
    AppContext, LifecyclePhase, AGENT_UPDATES_PER_SECOND, LOGOUT_REQUEST_TIME,
    SHUTDOWN_UPLOAD_SAVE_TIME,
};

const MIN_FRAME_RATE: f32 = 1.0;
const MAX_FRAME_RATE: f32 = 200.0;

impl AppContext {
    /// Network + game-state update for one frame.
    pub(crate) fn idle(&mut self, now: Instant) {
        self.ping_watchdog("main:idle");

        // Frame timers. A single anomalous frame (menu open, debugger,
        // swap) must not corrupt the smoothed statistics, so the
        // instantaneous rate is clamped before any dead-reckoning math.
        let dt_raw = self
            .frame
            .last_frame
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::from_millis(16));
        self.frame.last_frame = Some(now);
        self.frame.frame_count += 1;
        let raw_rate = 1.0 / dt_raw.as_secs_f32().max(1e-6);
        let rate_clamped = raw_rate.clamp(MIN_FRAME_RATE, MAX_FRAME_RATE);
        self.frame.dt_clamped = Duration::from_secs_f32(1.0 / rate_clamped);
        self.frame.fps_smoothed = (rate_clamped + 4.0 * self.frame.fps_smoothed) / 5.0;

        if self.config.quit_after_seconds > 0.0
            && self.frame.started_at.elapsed().as_secs_f32() > self.config.quit_after_seconds
        {
            tracing::info!("quit-after-seconds budget elapsed; quitting");
            self.logout.quit_requested = true;
            self.force_quit();
        }

        if !self.exiting && (self.logout.quit_requested || self.logout.logout_requested) {
            self.idle_shutdown(now);
        }

        // One-time queued-IM retrieval; both the avatar object and the mute
        // list must exist first, so poll here.
        if !self.agent.initial_ims_requested && self.agent.avatar_ready && self.agent.mute_list_ready
        {
            let agent = self.agent.id;
            self.msg
                .send_reliable(OutboundMessage::RetrieveInstantMessages { agent }, now);
            self.agent.initial_ims_requested = true;
        }

        if !self.startup_complete {
            return;
        }

        if !self.disconnected {
            // Send avatar/camera state whenever the control flags changed or
            // the update-rate timer elapsed.
            let flags_changed = self.agent.control_flags_dirty
                || self.agent.last_control_flags != self.agent.control_flags;
            let update_due = self
                .agent
                .last_agent_update
                .map(|last| {
                    now.saturating_duration_since(last).as_secs_f32()
                        > 1.0 / AGENT_UPDATES_PER_SECOND
                })
                .unwrap_or(true);
            if flags_changed || update_due {
                self.agent.last_control_flags = self.agent.control_flags;
                self.msg.send(OutboundMessage::AgentUpdate {
                    control_flags: self.agent.control_flags,
                });
                self.agent.last_agent_update = Some(now);
            }

            self.idle_network(now);
        }

        let dt = self.frame.dt_clamped;
        for callback in &mut self.idle_callbacks {
            callback(dt);
        }

        if !self.disconnected {
            // Fixed order: objects settle, dead objects purge, HUD effects
            // recompute against the purged set, effects flush, audio last.
            self.world.begin_frame();
            self.world.update_objects(dt);
            self.world.purge_dead_objects();
            self.world.update_hud_effects();
            self.world.flush_effects(&mut self.msg);
            self.world.update_audio();
        }

        // Speaker registries update at the end of idle so they observe this
        // frame's voice and world state.
        self.update_speaker_registries(now);
    }

    pub(crate) fn update_speaker_registries(&mut self, now: Instant) {
        let ctx = UpdateContext {
            voice: Some(self.voice.as_ref()),
            world: Some(&self.world),
            now,
            disconnected: self.disconnected,
        };
        self.speaker_deltas.active = self.active_speakers.update(&ctx);
        self.speaker_deltas.local = self.local_speakers.update(&ctx);
        self.speaker_deltas.sessions.clear();
        for (session, registry) in self.session_speakers.iter_mut() {
            let delta = registry.update(&ctx);
            if !delta.is_empty() {
                self.speaker_deltas.sessions.push((*session, delta));
            }
        }
    }

    /// Drain queued inbound messages under the per-frame caps, then run the
    /// per-frame message bookkeeping.
    pub(crate) fn idle_network(&mut self, now: Instant) {
        if self.disconnected {
            return;
        }
        self.ping_watchdog("idle_network");

        let drain_start = Instant::now();
        let budget = self.drain_budget.current();
        let mut total_decoded: usize = 0;
        let mut hit_budget = false;
        loop {
            let mut pending = None;
            if !self.msg.check_messages(|message| pending = Some(message)) {
                break;
            }
            if let Some(message) = pending {
                self.dispatch_message(message, now);
            }
            total_decoded += 1;
            self.frame.packets_in += 1;
            if self.do_disconnect {
                // Disconnecting, usually on network corruption or a dying
                // server; the rest of the queue is deliberately dropped.
                break;
            }
            if total_decoded > MESSAGE_MAX_PER_FRAME {
                tracing::info!("maxed out messages per frame at {MESSAGE_MAX_PER_FRAME}");
                break;
            }
            // Clumps of slow packets must not destroy the frame rate.
            if drain_start.elapsed() >= budget {
                hit_budget = true;
                break;
            }
        }
        self.drain_budget.note_frame(hit_budget);

        self.msg.process_acks();
        // Control flags were flushed with the agent updates above.
        self.agent.control_flags_dirty = false;

        if self.disconnected {
            return;
        }

        self.msg.retransmit_unacked(now);
        self.msg.check_transfer_timeouts(now);
        self.throttle.update_dynamic(hit_budget);

        // Dead-region check: alive -> dead with an unchanged region id means
        // the session under us is gone.
        if self.startup_complete {
            if let Some(region) = self.world.region {
                let newly_dead = self.agent.region_last_alive && !region.alive;
                let same_region = self.agent.region_last_id == Some(region.id);
                if newly_dead && same_region {
                    self.force_disconnect(
                        "You have been disconnected from the region you were in.".to_string(),
                    );
                }
                self.agent.region_last_id = Some(region.id);
                self.agent.region_last_alive = region.alive;
            }
        }
    }

    fn dispatch_message(&mut self, message: InboundMessage, now: Instant) {
        match message {
            InboundMessage::SessionSpeakerList { session, payload } => {
                self.session_registry_mut(session)
                    .process_speaker_list(&payload, now);
            }
            InboundMessage::SessionSpeakerMap { session, payload } => {
                self.session_registry_mut(session)
                    .process_speaker_map(&payload, now);
            }
            InboundMessage::SessionSpeakerUpdate { session, payload } => {
                self.session_registry_mut(session)
                    .process_speaker_update(&payload, now);
            }
            InboundMessage::ChatFromAgent { agent } => {
                self.local_speakers.speaker_chatted(agent, now);
            }
            InboundMessage::AgentTyping { agent, typing } => {
                self.local_speakers.set_speaker_typing(agent, typing);
            }
            InboundMessage::LogoutReply { agent } => {
                if agent == self.agent.id {
                    tracing::info!("logout reply received");
                    self.force_quit();
                } else {
                    tracing::debug!(%agent, "ignoring logout reply for a different agent");
                }
            }
        }
    }

    /// The shutdown handshake, safe to call every frame. Each gate returns
    /// early without touching later state until its precondition holds.
    pub(crate) fn idle_shutdown(&mut self, now: Instant) {
        self.phase = LifecyclePhase::LogoutPending;

        // Gate 1: wait for every modal dialog to resolve.
        if self.frontend.modal_dialog_count() > 0 {
            return;
        }

        // Gate 2: close floaters (which may be editing things) and IM
        // sessions, then wait until they are actually gone.
        self.frontend.close_all_floaters();
        self.session_speakers.clear();
        if !self.frontend.all_floaters_closed() {
            return;
        }

        // Gate 3: give pending asset uploads a bounded grace window, with a
        // progress bar so the wait is visible.
        let since_request = self
            .logout
            .requested_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::ZERO);
        if self.agent.pending_uploads > 0
            && since_request < SHUTDOWN_UPLOAD_SAVE_TIME
            && self.logout.request_sent_at.is_none()
        {
            self.logout.max_uploads_seen = self.logout.max_uploads_seen.max(self.agent.pending_uploads);
            let total = self.logout.max_uploads_seen.max(1);
            let finished = total.saturating_sub(self.agent.pending_uploads);
            let percent = 100.0 * finished as f32 / total as f32;
            self.frontend.show_progress(true);
            self.frontend.set_progress(percent, "Saving final data...");
            return;
        }

        // Gate 4: tell the server we want out, exactly once.
        if self.logout.request_sent_at.is_none() {
            let agent = self.agent.id;
            let session = self.agent.session;
            self.msg
                .send_reliable(OutboundMessage::LogoutRequest { agent, session }, now);
            self.markers.create_logout_marker();
            self.logout.request_sent_at = Some(now);
            self.frontend.show_progress(true);
            self.frontend.set_progress(100.0, "Logging out...");
            tracing::info!("logout request sent");
            return;
        }

        // Gate 5: no reply within the logout timeout means quit anyway.
        if let Some(sent_at) = self.logout.request_sent_at {
            if now.saturating_duration_since(sent_at) > LOGOUT_REQUEST_TIME {
                tracing::warn!("no logout reply within the timeout; quitting anyway");
                self.force_quit();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context_lock, SharedFrontend};
    use super::super::{AppContext, LifecyclePhase};
    use super::*;
    use crate::msg::{MessageChannels, WireEnvelope};
    use crate::speaker::SpeakerStatus;
    use crate::voice::NullVoiceClient;
    use crate::world::RegionHandle;
    use clap::Parser;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    static TEST_DIR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    fn test_data_dir(label: &str) -> PathBuf {
        let seq = TEST_DIR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "gridview-idle-{label}-{}-{seq}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    fn build_context(label: &str) -> (AppContext, MessageChannels, SharedFrontend) {
        let config = crate::config::AppConfig::parse_from([
            "gridview",
            "--logs",
            "false",
            "--watchdog",
            "false",
        ]);
        let frontend = SharedFrontend::new();
        let (context, channels) = AppContext::with_data_dir(
            config,
            Box::new(frontend.clone()),
            Box::new(NullVoiceClient),
            test_data_dir(label),
        )
        .expect("construct context");
        (context, channels, frontend)
    }

    fn drain_outbound(channels: &MessageChannels) -> Vec<WireEnvelope> {
        let mut sent = Vec::new();
        while let Ok(envelope) = channels.outbound_rx.try_recv() {
            sent.push(envelope);
        }
        sent
    }

    fn logout_requests(sent: &[WireEnvelope]) -> usize {
        sent.iter()
            .filter(|envelope| matches!(envelope.message, OutboundMessage::LogoutRequest { .. }))
            .count()
    }

    #[test]
    fn session_roster_update_flows_end_to_end() {
        let _guard = context_lock();
        let (mut context, channels, _frontend) = build_context("session-e2e");
        let session = Uuid::new_v4();
        let now = Instant::now();

        let entering = Uuid::new_v4();
        let leaving = Uuid::new_v4();
        let pausing = Uuid::new_v4();
        context.session_registry_mut(session).upsert(
            leaving,
            "Leaver",
            SpeakerStatus::VoiceActive,
            crate::speaker::SpeakerKind::Agent,
            now,
        );

        let payload = json!({
            "updates": {
                (entering.to_string()): "ENTER",
                (leaving.to_string()): "LEAVE",
                (pausing.to_string()): "PAUSE",
            }
        });
        channels
            .inbound_tx
            .send(InboundMessage::SessionSpeakerUpdate { session, payload })
            .expect("queue update");

        context.idle_network(now);

        let registry = context.session_speakers(session).expect("registry exists");
        assert_eq!(
            registry.find_speaker(entering).expect("entered").status,
            SpeakerStatus::TextOnly
        );
        assert_eq!(
            registry.find_speaker(leaving).expect("left").status,
            SpeakerStatus::NotInChannel
        );
        assert!(registry.find_speaker(pausing).is_none());
        assert_eq!(context.packets_in(), 1);
    }

    #[test]
    fn idle_network_is_a_noop_while_disconnected() {
        let _guard = context_lock();
        let (mut context, channels, _frontend) = build_context("disconnected");
        context.disconnected = true;
        channels
            .inbound_tx
            .send(InboundMessage::ChatFromAgent {
                agent: Uuid::new_v4(),
            })
            .expect("queue chat");
        context.idle_network(Instant::now());
        assert_eq!(context.packets_in(), 0);
    }

    #[test]
    fn region_death_with_same_id_forces_disconnect() {
        let _guard = context_lock();
        let (mut context, _channels, _frontend) = build_context("region-death");
        context.notify_startup_complete();
        let region = Uuid::new_v4();
        let now = Instant::now();

        context.world_mut().region = Some(RegionHandle {
            id: region,
            alive: true,
        });
        context.idle_network(now);
        assert!(!context.do_disconnect);

        context.world_mut().region = Some(RegionHandle {
            id: region,
            alive: false,
        });
        context.idle_network(now);
        assert!(context.do_disconnect);
        assert!(context
            .last_disconnect_reason()
            .expect("reason recorded")
            .contains("disconnected"));
    }

    #[test]
    fn region_swap_does_not_disconnect() {
        let _guard = context_lock();
        let (mut context, _channels, _frontend) = build_context("region-swap");
        context.notify_startup_complete();
        let now = Instant::now();

        context.world_mut().region = Some(RegionHandle {
            id: Uuid::new_v4(),
            alive: true,
        });
        context.idle_network(now);

        // A teleport lands us in a different region that starts out dead
        // for a frame; that is not a lost session.
        context.world_mut().region = Some(RegionHandle {
            id: Uuid::new_v4(),
            alive: false,
        });
        context.idle_network(now);
        assert!(!context.do_disconnect);
    }

    #[test]
    fn logout_waits_for_modal_dialogs() {
        let _guard = context_lock();
        let (mut context, channels, frontend) = build_context("logout-modal");
        let now = Instant::now();
        frontend.lock().modal_dialogs = 1;
        context.request_logout(true, now);

        for frame in 0..5u64 {
            context.idle_shutdown(now + Duration::from_millis(16 * frame));
        }
        assert_eq!(
            logout_requests(&drain_outbound(&channels)),
            0,
            "no logout request while a modal dialog is open"
        );

        // Dialog resolves: exactly one request goes out, ever.
        frontend.lock().modal_dialogs = 0;
        for frame in 0..10u64 {
            context.idle_shutdown(now + Duration::from_millis(16 * frame));
        }
        assert_eq!(logout_requests(&drain_outbound(&channels)), 1);
        assert_eq!(context.phase(), LifecyclePhase::LogoutPending);
    }

    #[test]
    fn logout_times_out_into_force_quit() {
        let _guard = context_lock();
        let (mut context, channels, _frontend) = build_context("logout-timeout");
        let now = Instant::now();
        context.request_logout(true, now);
        context.idle_shutdown(now);
        assert_eq!(logout_requests(&drain_outbound(&channels)), 1);
        assert!(!context.is_exiting());

        // Frames keep coming with no reply; only the timeout ends it.
        context.idle_shutdown(now + Duration::from_secs(3));
        assert!(!context.is_exiting());
        context.idle_shutdown(now + LOGOUT_REQUEST_TIME + Duration::from_secs(1));
        assert!(context.is_exiting());
        // Still exactly one request on the wire (ignoring retransmits).
        assert_eq!(logout_requests(&drain_outbound(&channels)), 0);
    }

    #[test]
    fn logout_reply_ends_the_session() {
        let _guard = context_lock();
        let (mut context, channels, _frontend) = build_context("logout-reply");
        let now = Instant::now();
        context.request_logout(true, now);
        context.idle_shutdown(now);

        channels
            .inbound_tx
            .send(InboundMessage::LogoutReply {
                agent: context.agent.id,
            })
            .expect("queue reply");
        context.idle_network(now);
        assert!(context.is_exiting());
    }

    #[test]
    fn pending_uploads_get_a_grace_window() {
        let _guard = context_lock();
        let (mut context, channels, frontend) = build_context("upload-grace");
        let now = Instant::now();
        context.agent.pending_uploads = 4;
        context.request_logout(true, now);

        context.idle_shutdown(now + Duration::from_secs(1));
        assert_eq!(logout_requests(&drain_outbound(&channels)), 0);
        assert!(frontend.lock().progress_shown);

        // Grace expires with uploads still pending: proceed anyway.
        context.idle_shutdown(now + SHUTDOWN_UPLOAD_SAVE_TIME + Duration::from_secs(1));
        assert_eq!(logout_requests(&drain_outbound(&channels)), 1);
    }

    #[test]
    fn initial_im_request_waits_for_avatar_and_mute_list() {
        let _guard = context_lock();
        let (mut context, channels, _frontend) = build_context("initial-ims");
        let now = Instant::now();

        context.idle(now);
        assert!(drain_outbound(&channels).is_empty());

        context.notify_avatar_ready();
        context.idle(now + Duration::from_millis(16));
        assert!(drain_outbound(&channels).is_empty());

        context.notify_mute_list_ready();
        context.idle(now + Duration::from_millis(32));
        let sent = drain_outbound(&channels);
        assert_eq!(
            sent.iter()
                .filter(|envelope| matches!(
                    envelope.message,
                    OutboundMessage::RetrieveInstantMessages { .. }
                ))
                .count(),
            1
        );

        // Never re-requested.
        context.idle(now + Duration::from_millis(48));
        assert!(drain_outbound(&channels).is_empty());
    }

    #[test]
    fn agent_updates_send_on_flag_change_or_timer() {
        let _guard = context_lock();
        let (mut context, channels, _frontend) = build_context("agent-updates");
        context.notify_startup_complete();
        let now = Instant::now();

        context.idle(now);
        let first = drain_outbound(&channels);
        assert_eq!(
            first
                .iter()
                .filter(|e| matches!(e.message, OutboundMessage::AgentUpdate { .. }))
                .count(),
            1,
            "first frame always sends an update"
        );

        // 10 ms later, no flag change: rate limiter holds it back.
        context.idle(now + Duration::from_millis(10));
        let second = drain_outbound(&channels);
        assert_eq!(
            second
                .iter()
                .filter(|e| matches!(e.message, OutboundMessage::AgentUpdate { .. }))
                .count(),
            0
        );

        // Control flags change: sent immediately regardless of the timer.
        context.agent.control_flags = 0x1;
        context.agent.control_flags_dirty = true;
        context.idle(now + Duration::from_millis(20));
        let third = drain_outbound(&channels);
        assert_eq!(
            third
                .iter()
                .filter(|e| matches!(
                    e.message,
                    OutboundMessage::AgentUpdate { control_flags: 0x1 }
                ))
                .count(),
            1
        );
        // The drain cleared the dirty bit.
        assert!(!context.agent.control_flags_dirty);
    }

    #[test]
    fn frame_rate_is_clamped_before_smoothing() {
        let _guard = context_lock();
        let (mut context, _channels, _frontend) = build_context("frame-clamp");
        let now = Instant::now();
        context.idle(now);
        // A 10-second stall clamps to the 1 fps floor instead of poisoning
        // the smoothed rate.
        context.idle(now + Duration::from_secs(10));
        assert!(context.frame.dt_clamped <= Duration::from_secs(1));
        assert!(context.frame.fps_smoothed >= 1.0);
    }
}
