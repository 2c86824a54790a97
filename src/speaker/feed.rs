//! Membership feeds: how a registry discovers which ids are in its scope.

use std::collections::HashSet;

use crate::AgentId;

use super::registry::{SpeakerRegistry, UpdateContext};
use super::{SpeakerKind, SpeakerStatus};

/// Population policy, matched on by `refresh_membership`. One registry,
/// pluggable source; no subclassing involved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeakerFeed {
    /// Follow whichever voice channel is globally current.
    Channel,
    /// Voice-channel membership plus nearby avatars within the chat radius.
    Proximity { radius_m: f32 },
    /// Membership driven entirely by server session messages.
    Session,
}

impl SpeakerRegistry {
    pub(super) fn refresh_membership(&mut self, ctx: &UpdateContext<'_>) {
        match self.feed {
            SpeakerFeed::Channel => self.refresh_channel(ctx),
            SpeakerFeed::Proximity { radius_m } => self.refresh_proximity(ctx, radius_m),
            // The server pushes session rosters; nothing to derive locally.
            SpeakerFeed::Session => {}
        }
    }

    /// Upsert everyone the voice service reports for this registry's scope.
    fn populate_from_voice(&mut self, ctx: &UpdateContext<'_>) {
        let Some(voice) = ctx.voice else {
            return;
        };
        let channel_active = match self.bound_channel {
            Some(channel) => voice.channel_active(channel),
            None => voice.in_proximal_channel(),
        };
        if !channel_active {
            return;
        }
        for participant in voice.participants(self.bound_channel) {
            let kind = if participant.is_avatar {
                SpeakerKind::Agent
            } else {
                SpeakerKind::External
            };
            self.upsert(
                participant.id,
                &participant.display_name,
                SpeakerStatus::VoiceActive,
                kind,
                ctx.now,
            );
        }
    }

    fn refresh_channel(&mut self, ctx: &UpdateContext<'_>) {
        let Some(voice) = ctx.voice else {
            return;
        };
        // A channel switch drops the old roster wholesale; membership is
        // rebuilt from the new channel's participant list below.
        let current = voice.current_channel();
        if current != self.bound_channel {
            self.clear();
            self.bound_channel = current;
        }
        self.populate_from_voice(ctx);

        // This scope has no text chat; stray text-only entries age out.
        let flagged: Vec<AgentId> = self
            .speakers
            .values()
            .filter(|speaker| speaker.status == SpeakerStatus::TextOnly)
            .map(|speaker| speaker.id)
            .collect();
        for id in flagged {
            if let Some(speaker) = self.speakers.get_mut(&id) {
                speaker.record_left_channel(ctx.now);
            }
        }
    }

    fn refresh_proximity(&mut self, ctx: &UpdateContext<'_>, radius_m: f32) {
        self.populate_from_voice(ctx);
        if ctx.disconnected {
            // The world is cleared; keep whatever we have until reconnect.
            return;
        }
        let Some(world) = ctx.world else {
            return;
        };

        let center = world.agent_position();
        let nearby = world.avatars_within(center, radius_m);
        let mut in_range: HashSet<AgentId> = HashSet::with_capacity(nearby.len());
        for avatar in nearby {
            in_range.insert(avatar.id);
            self.upsert(
                avatar.id,
                &avatar.display_name,
                SpeakerStatus::TextOnly,
                SpeakerKind::Agent,
                ctx.now,
            );
        }

        // Text chatters whose avatar is gone, dead, or out of range start
        // their expiry countdown.
        let out_of_range: Vec<AgentId> = self
            .speakers
            .values()
            .filter(|speaker| {
                speaker.status == SpeakerStatus::TextOnly && !in_range.contains(&speaker.id)
            })
            .map(|speaker| speaker.id)
            .collect();
        for id in out_of_range {
            if let Some(speaker) = self.speakers.get_mut(&id) {
                speaker.record_left_channel(ctx.now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::registry::UpdateContext;
    use super::*;
    use crate::voice::test_support::ScriptedVoice;
    use crate::world::{AvatarState, WorldModel};
    use std::time::Instant;
    use uuid::Uuid;

    fn ctx<'a>(
        voice: &'a ScriptedVoice,
        world: Option<&'a WorldModel>,
        now: Instant,
    ) -> UpdateContext<'a> {
        UpdateContext {
            voice: Some(voice),
            world,
            now,
            disconnected: false,
        }
    }

    #[test]
    fn channel_feed_populates_from_current_channel() {
        let channel = Uuid::new_v4();
        let mut voice = ScriptedVoice::new();
        voice.enabled = true;
        voice.current = Some(channel);
        voice.active_channels.insert(channel);
        let alice = Uuid::new_v4();
        let pstn = Uuid::new_v4();
        voice.add_participant(alice, "Alice", true);
        voice.add_participant(pstn, "+1 555", false);

        let mut reg = SpeakerRegistry::new(SpeakerFeed::Channel, None);
        let t = Instant::now();
        reg.update(&ctx(&voice, None, t));

        assert_eq!(reg.bound_channel(), Some(channel));
        assert_eq!(reg.len(), 2);
        assert_eq!(
            reg.find_speaker(pstn).expect("pstn present").kind,
            SpeakerKind::External
        );
    }

    #[test]
    fn channel_switch_clears_and_rebuilds() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut voice = ScriptedVoice::new();
        voice.enabled = true;
        voice.current = Some(first);
        voice.active_channels.insert(first);
        voice.active_channels.insert(second);
        let old_member = Uuid::new_v4();
        voice.add_participant(old_member, "Old", true);

        let mut reg = SpeakerRegistry::new(SpeakerFeed::Channel, None);
        let t = Instant::now();
        reg.update(&ctx(&voice, None, t));
        assert!(reg.find_speaker(old_member).is_some());

        // Switch channels with a fresh roster.
        voice.current = Some(second);
        voice.roster.clear();
        voice.participant_ids.clear();
        let new_member = Uuid::new_v4();
        voice.add_participant(new_member, "New", true);

        let delta = reg.update(&ctx(&voice, None, t));
        assert!(delta.cleared);
        assert!(reg.find_speaker(old_member).is_none());
        assert_eq!(
            reg.find_speaker(new_member).expect("new member").status,
            SpeakerStatus::VoiceActive
        );
        assert_eq!(reg.bound_channel(), Some(second));
    }

    #[test]
    fn proximity_feed_adds_nearby_avatars_as_text_only() {
        let mut world = WorldModel::new();
        world.set_agent_position([0.0; 3]);
        let near = Uuid::new_v4();
        world.upsert_avatar(AvatarState {
            id: near,
            display_name: "Near".to_string(),
            position: [5.0, 0.0, 0.0],
            dead: false,
        });
        let far = Uuid::new_v4();
        world.upsert_avatar(AvatarState {
            id: far,
            display_name: "Far".to_string(),
            position: [500.0, 0.0, 0.0],
            dead: false,
        });

        let voice = ScriptedVoice::new();
        let mut reg = SpeakerRegistry::new(SpeakerFeed::Proximity { radius_m: 20.0 }, None);
        let t = Instant::now();
        reg.update(&ctx(&voice, Some(&world), t));

        assert_eq!(
            reg.find_speaker(near).expect("near present").status,
            SpeakerStatus::TextOnly
        );
        assert!(reg.find_speaker(far).is_none());
    }

    #[test]
    fn proximity_feed_expires_chatters_leaving_the_radius() {
        let mut world = WorldModel::new();
        world.set_agent_position([0.0; 3]);
        let walker = Uuid::new_v4();
        world.upsert_avatar(AvatarState {
            id: walker,
            display_name: "Walker".to_string(),
            position: [5.0, 0.0, 0.0],
            dead: false,
        });

        let voice = ScriptedVoice::new();
        let mut reg = SpeakerRegistry::new(SpeakerFeed::Proximity { radius_m: 20.0 }, None);
        let t = Instant::now();
        reg.update(&ctx(&voice, Some(&world), t));
        assert_eq!(
            reg.find_speaker(walker).expect("present").status,
            SpeakerStatus::TextOnly
        );

        // They wander off; the next update starts the countdown.
        world.upsert_avatar(AvatarState {
            id: walker,
            display_name: "Walker".to_string(),
            position: [300.0, 0.0, 0.0],
            dead: false,
        });
        reg.update(&ctx(&voice, Some(&world), t));
        assert_eq!(
            reg.find_speaker(walker).expect("present").status,
            SpeakerStatus::NotInChannel
        );
    }

    #[test]
    fn proximity_feed_keeps_roster_while_disconnected() {
        let mut world = WorldModel::new();
        let resident = Uuid::new_v4();
        world.upsert_avatar(AvatarState {
            id: resident,
            display_name: "Resident".to_string(),
            position: [1.0, 0.0, 0.0],
            dead: false,
        });

        let voice = ScriptedVoice::new();
        let mut reg = SpeakerRegistry::new(SpeakerFeed::Proximity { radius_m: 20.0 }, None);
        let t = Instant::now();
        reg.update(&UpdateContext {
            voice: Some(&voice),
            world: Some(&world),
            now: t,
            disconnected: false,
        });
        assert_eq!(reg.len(), 1);

        // Disconnected: the scan is skipped entirely, even with the world
        // emptied out underneath us.
        world.clear();
        reg.update(&UpdateContext {
            voice: Some(&voice),
            world: Some(&world),
            now: t,
            disconnected: true,
        });
        assert_eq!(
            reg.find_speaker(resident).expect("present").status,
            SpeakerStatus::TextOnly
        );
    }

    #[test]
    fn session_feed_derives_nothing_locally() {
        let mut voice = ScriptedVoice::new();
        voice.enabled = true;
        voice.proximal = true;
        voice.add_participant(Uuid::new_v4(), "Nearby", true);

        let mut reg = SpeakerRegistry::new(SpeakerFeed::Session, Some(Uuid::new_v4()));
        reg.update(&ctx(&voice, None, Instant::now()));
        assert!(reg.is_empty());
    }
}
