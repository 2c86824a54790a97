//! The owning speaker collection: merge, rank, expire.

use std::collections::HashMap;
use std::time::Instant;

use crate::voice::{VoiceClient, OVERDRIVEN_POWER_LEVEL};
use crate::world::WorldModel;
use crate::{AgentId, ChannelId};

use super::names::{NameLookupRequest, NameResolution};
use super::{
    clamp_rescale, Color, Palette, Speaker, SpeakerFeed, SpeakerKind, SpeakerStatus,
    SPEAKER_TIMEOUT,
};

/// Per-update inputs. A `None` voice client degrades the update to a pure
/// membership sweep with no speaking-state changes.
pub struct UpdateContext<'a> {
    pub voice: Option<&'a dyn VoiceClient>,
    pub world: Option<&'a WorldModel>,
    pub now: Instant,
    pub disconnected: bool,
}

/// What changed since the previous `update()` returned. Callers pull this
/// instead of registering observers, so there are no listener lifetimes to
/// manage. Mutations made between updates (session roster messages) are
/// folded into the next delta.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpeakerDelta {
    pub added: Vec<AgentId>,
    pub removed: Vec<AgentId>,
    pub status_changed: Vec<(AgentId, SpeakerStatus)>,
    pub moderation_changed: Vec<AgentId>,
    /// The whole registry was dropped and rebuilt (channel switch).
    pub cleared: bool,
}

impl SpeakerDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.status_changed.is_empty()
            && self.moderation_changed.is_empty()
            && !self.cleared
    }
}

/// Tracks, ranks, and expires [`Speaker`]s for one scope (channel, local
/// chat, or IM session). At most one record exists per id; the ranked
/// sequence is a permutation of the map, refreshed by every `update()`.
pub struct SpeakerRegistry {
    pub(super) speakers: HashMap<AgentId, Speaker>,
    pub(super) ranked: Vec<AgentId>,
    pub(super) feed: SpeakerFeed,
    /// `None` binds to whichever voice channel is globally current.
    pub(super) bound_channel: Option<ChannelId>,
    /// Registry-wide epoch for last-spoke stamps, so relative order is
    /// consistent across all members.
    pub(super) speech_epoch: Instant,
    pub(super) palette: Palette,
    pub(super) name_requests: Vec<NameLookupRequest>,
    pub(super) next_generation: u64,
    /// Snapshot of (status, moderator-muted) as of the last delta, used to
    /// diff the next one.
    reported_state: HashMap<AgentId, (SpeakerStatus, bool)>,
    pending_cleared: bool,
}

impl SpeakerRegistry {
    pub fn new(feed: SpeakerFeed, bound_channel: Option<ChannelId>) -> Self {
        Self {
            speakers: HashMap::new(),
            ranked: Vec::new(),
            feed,
            bound_channel,
            speech_epoch: Instant::now(),
            palette: Palette::default(),
            name_requests: Vec::new(),
            next_generation: 0,
            reported_state: HashMap::new(),
            pending_cleared: false,
        }
    }

    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = palette;
        self
    }

    pub fn feed(&self) -> &SpeakerFeed {
        &self.feed
    }

    pub fn bound_channel(&self) -> Option<ChannelId> {
        self.bound_channel
    }

    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    /// Idempotent add-or-refresh. Returns `None` only for the nil id.
    ///
    /// An existing record keeps its best (lowest) status and has its expiry
    /// pushed out. IMs from attached objects arrive under an object id that
    /// can later turn out to be a resident; discovering `Agent` for a known
    /// `Object` promotes the kind and re-triggers the name lookup. The
    /// reverse demotion never happens.
    pub fn upsert(
        &mut self,
        id: AgentId,
        display_name: &str,
        status: SpeakerStatus,
        kind: SpeakerKind,
        now: Instant,
    ) -> Option<&mut Speaker> {
        if id.is_nil() {
            return None;
        }
        if !self.speakers.contains_key(&id) {
            let mut speaker = Speaker::new(id, kind, display_name.to_string(), now);
            speaker.status = status;
            self.next_generation += 1;
            speaker.name_generation = self.next_generation;
            if display_name.is_empty() && kind == SpeakerKind::Agent {
                self.name_requests.push(NameLookupRequest {
                    id,
                    generation: speaker.name_generation,
                });
            }
            self.speakers.insert(id, speaker);
            self.ranked.push(id);
        } else {
            let mut promote = false;
            if let Some(speaker) = self.speakers.get_mut(&id) {
                speaker.status = speaker.status.min(status);
                speaker.expires_at = now + SPEAKER_TIMEOUT;
                if speaker.display_name.is_empty() && !display_name.is_empty() {
                    speaker.display_name = display_name.to_string();
                }
                if kind == SpeakerKind::Agent && speaker.kind == SpeakerKind::Object {
                    speaker.kind = SpeakerKind::Agent;
                    promote = true;
                }
            }
            if promote {
                self.next_generation += 1;
                let generation = self.next_generation;
                if let Some(speaker) = self.speakers.get_mut(&id) {
                    speaker.name_generation = generation;
                }
                self.name_requests.push(NameLookupRequest { id, generation });
            }
        }
        self.speakers.get_mut(&id)
    }

    /// O(map lookup); never creates.
    pub fn find_speaker(&self, id: AgentId) -> Option<&Speaker> {
        self.speakers.get(&id)
    }

    /// Filtered copy of the ranked sequence, preserving rank order.
    pub fn speaker_list(&self, include_text_only: bool) -> Vec<Speaker> {
        self.ranked
            .iter()
            .filter_map(|id| self.speakers.get(id))
            .filter(|speaker| include_text_only || speaker.status != SpeakerStatus::TextOnly)
            .cloned()
            .collect()
    }

    /// Ranked ids, for callers that only need order.
    pub fn ranked_ids(&self) -> &[AgentId] {
        &self.ranked
    }

    /// Unknown ids are silently ignored; chat from a not-yet-registered id
    /// must never take the UI down.
    pub fn set_speaker_typing(&mut self, id: AgentId, typing: bool) {
        if let Some(speaker) = self.speakers.get_mut(&id) {
            speaker.typing = typing;
        }
    }

    /// Record text or voice chat for ranking purposes. Unknown ids ignored.
    pub fn speaker_chatted(&mut self, id: AgentId, now: Instant) {
        let stamp = now.saturating_duration_since(self.speech_epoch);
        if let Some(speaker) = self.speakers.get_mut(&id) {
            speaker.last_spoke = stamp;
            speaker.has_spoken = true;
        }
    }

    /// True only if voice is globally enabled and the bound channel (or the
    /// current one, when unbound) is live.
    pub fn is_voice_active(&self, voice: &dyn VoiceClient) -> bool {
        if !voice.voice_enabled() {
            return false;
        }
        match self.bound_channel {
            Some(channel) => voice.channel_active(channel),
            None => voice
                .current_channel()
                .map(|channel| voice.channel_active(channel))
                .unwrap_or(false),
        }
    }

    /// Drain queued display-name lookups for the embedding name service.
    pub fn take_name_requests(&mut self) -> Vec<NameLookupRequest> {
        std::mem::take(&mut self.name_requests)
    }

    /// Apply a completed lookup. Stale generations (speaker destroyed or
    /// lookup re-triggered since the request) are dropped silently.
    pub fn apply_name_resolution(&mut self, resolution: &NameResolution) -> bool {
        match self.speakers.get_mut(&resolution.id) {
            Some(speaker) if speaker.name_generation == resolution.generation => {
                speaker.display_name = resolution.display_name.clone();
                true
            }
            _ => false,
        }
    }

    /// Drop every speaker. Used when the floater backing this registry goes
    /// invisible, and by the channel feed on a channel switch.
    pub fn clear(&mut self) {
        self.speakers.clear();
        self.ranked.clear();
        self.pending_cleared = true;
    }

    /// The per-frame algorithm: refresh membership from the feed, fold in
    /// voice state, re-rank, sweep expired entries, and report what changed.
    pub fn update(&mut self, ctx: &UpdateContext<'_>) -> SpeakerDelta {
        self.refresh_membership(ctx);
        self.update_voice_state(ctx);
        self.sort_and_rank();
        self.sweep_expired(ctx.now);

        let mut delta = SpeakerDelta {
            cleared: std::mem::take(&mut self.pending_cleared),
            ..SpeakerDelta::default()
        };
        for (id, speaker) in &self.speakers {
            match self.reported_state.get(id) {
                None => delta.added.push(*id),
                Some((status, moderator_muted)) => {
                    if *status != speaker.status {
                        delta.status_changed.push((*id, speaker.status));
                    }
                    if *moderator_muted != speaker.moderator_muted_voice {
                        delta.moderation_changed.push(*id);
                    }
                }
            }
        }
        for id in self.reported_state.keys() {
            if !self.speakers.contains_key(id) {
                delta.removed.push(*id);
            }
        }
        self.reported_state = self
            .speakers
            .iter()
            .map(|(id, speaker)| (*id, (speaker.status, speaker.moderator_muted_voice)))
            .collect();
        delta
    }

    fn update_voice_state(&mut self, ctx: &UpdateContext<'_>) {
        let Some(voice) = ctx.voice else {
            return;
        };
        let channel_active = match self.bound_channel {
            Some(channel) => voice.channel_active(channel),
            None => voice.in_proximal_channel(),
        };
        let epoch = self.speech_epoch;
        let palette = self.palette;
        for speaker in self.speakers.values_mut() {
            if channel_active && voice.is_participant(speaker.id) {
                speaker.moderator_muted_voice = voice.moderator_muted_voice(speaker.id);
                if voice.on_mute_list(speaker.id) || speaker.moderator_muted_voice {
                    // Mute wins over any voice activity while the id stays
                    // on the mute list.
                    speaker.mark_muted();
                    speaker.dot_color = Color::WHITE;
                } else if voice.is_speaking(speaker.id) {
                    let power = voice.current_power(speaker.id);
                    let stamp = ctx.now.saturating_duration_since(epoch);
                    speaker.record_speech(stamp, power);
                    speaker.dot_color = if power > OVERDRIVEN_POWER_LEVEL {
                        palette.overdriven
                    } else {
                        palette.speaking
                    };
                } else {
                    speaker.record_silence_in_channel();
                    speaker.dot_color = Color::ACTIVE;
                }
            } else if speaker.has_voice_status() && speaker.status != SpeakerStatus::NotInChannel {
                // Gone from voice: start the expiry countdown. Text-only
                // records are not voice-derived and are left alone; the feed
                // owns their lifecycle.
                speaker.record_left_channel(ctx.now);
            }
        }
    }

    fn sort_and_rank(&mut self) {
        let speakers = &self.speakers;
        self.ranked.retain(|id| speakers.contains_key(id));
        self.ranked.sort_by(|a, b| {
            let sa = &speakers[a];
            let sb = &speakers[b];
            sa.status
                .cmp(&sb.status)
                .then(sb.last_spoke.cmp(&sa.last_spoke))
                .then_with(|| sa.display_name.cmp(&sb.display_name))
                .then(a.cmp(b))
        });

        // Recent-but-silent speakers fade from the speaking color toward the
        // flat active color by recency rank.
        let palette = self.palette;
        let mut recent_count: i32 = 0;
        for index in 0..self.ranked.len() {
            let id = self.ranked[index];
            if let Some(speaker) = self.speakers.get_mut(&id) {
                if speaker.status == SpeakerStatus::HasSpoken {
                    let t = clamp_rescale(recent_count as f32, -2.0, 3.0, 0.0, 1.0);
                    speaker.dot_color = palette.speaking.lerp(Color::ACTIVE, t);
                    recent_count += 1;
                }
                speaker.sort_index = index;
            }
        }
    }

    /// Remove speakers whose departure expiry has fired. Map and ranked
    /// sequence are erased together; no caller observes them out of sync.
    fn sweep_expired(&mut self, now: Instant) {
        let speakers = &self.speakers;
        let mut removed: Vec<AgentId> = Vec::new();
        self.ranked.retain(|id| match speakers.get(id) {
            Some(speaker)
                if speaker.status == SpeakerStatus::NotInChannel && now >= speaker.expires_at =>
            {
                removed.push(*id);
                false
            }
            Some(_) => true,
            None => false,
        });
        if removed.is_empty() {
            return;
        }
        for id in &removed {
            self.speakers.remove(id);
        }
        // Re-pack ranks after removal so sort_index stays dense.
        for (index, id) in self.ranked.clone().into_iter().enumerate() {
            if let Some(speaker) = self.speakers.get_mut(&id) {
                speaker.sort_index = index;
            }
        }
    }
}
