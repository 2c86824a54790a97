//! Voice subsystem interface consumed by the speaker core.
//!
//! The viewer core never talks to the voice service directly; it reads
//! channel and per-participant state through this trait and leaves transport,
//! codecs, and device handling to the implementation behind it.

use crate::{AgentId, ChannelId};

/// Speech power above which a participant is rendered in the overdriven band.
pub const OVERDRIVEN_POWER_LEVEL: f32 = 0.7;

/// One entry of a channel's participant roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: AgentId,
    pub display_name: String,
    /// False for PSTN or other non-avatar callers bridged into the channel.
    pub is_avatar: bool,
}

/// Read-only view of the voice service.
///
/// Every method must be cheap and non-blocking; the main loop calls them once
/// per registered speaker per frame.
pub trait VoiceClient {
    /// Voice enabled at all for this session.
    fn voice_enabled(&self) -> bool;

    /// True while the client sits in the spatial (proximal) channel.
    fn in_proximal_channel(&self) -> bool;

    /// Whichever channel is globally current, if any.
    fn current_channel(&self) -> Option<ChannelId>;

    /// Whether a specific channel is connected and carrying audio.
    fn channel_active(&self, channel: ChannelId) -> bool;

    /// Roster for a channel; `None` means the current channel.
    fn participants(&self, channel: Option<ChannelId>) -> Vec<Participant>;

    /// Whether the service knows this id in the active channel at all.
    fn is_participant(&self, id: AgentId) -> bool;

    fn is_speaking(&self, id: AgentId) -> bool;

    /// Instantaneous speech power in `[0.0, 1.0]`.
    fn current_power(&self, id: AgentId) -> f32;

    fn on_mute_list(&self, id: AgentId) -> bool;

    fn moderator_muted_voice(&self, id: AgentId) -> bool;
}

/// Voice client with the service absent or disabled. Used by the binary when
/// no voice backend is wired up and by tests that only exercise membership.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVoiceClient;

impl VoiceClient for NullVoiceClient {
    fn voice_enabled(&self) -> bool {
        false
    }

    fn in_proximal_channel(&self) -> bool {
        false
    }

    fn current_channel(&self) -> Option<ChannelId> {
        None
    }

    fn channel_active(&self, _channel: ChannelId) -> bool {
        false
    }

    fn participants(&self, _channel: Option<ChannelId>) -> Vec<Participant> {
        Vec::new()
    }

    fn is_participant(&self, _id: AgentId) -> bool {
        false
    }

    fn is_speaking(&self, _id: AgentId) -> bool {
        false
    }

    fn current_power(&self, _id: AgentId) -> f32 {
        0.0
    }

    fn on_mute_list(&self, _id: AgentId) -> bool {
        false
    }

    fn moderator_muted_voice(&self, _id: AgentId) -> bool {
        false
    }
}
