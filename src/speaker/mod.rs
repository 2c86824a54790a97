//! Active-speaker tracking: per-participant activity records, the owning
//! registry, and the membership feeds that populate it.

mod feed;
mod names;
mod registry;
mod session;

pub use feed::SpeakerFeed;
pub use names::{NameLookupRequest, NameResolution};
pub use registry::{SpeakerDelta, SpeakerRegistry, UpdateContext};

use std::time::{Duration, Instant};

use crate::AgentId;

/// How long a departed speaker lingers in the list before removal.
pub const SPEAKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Display status, ordered best-first. Sorting ascending puts live speakers
/// at the top and muted entries at the bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpeakerStatus {
    Speaking,
    HasSpoken,
    VoiceActive,
    TextOnly,
    NotInChannel,
    Muted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerKind {
    Agent,
    Object,
    /// Non-avatar caller bridged in by the voice service (e.g. PSTN).
    External,
}

/// RGBA display color for the speaking-indicator dot. A view concern, but
/// computed here so every panel shows the same state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);
    pub const INACTIVE: Color = Color::new(0.3, 0.3, 0.3, 0.5);
    pub const ACTIVE: Color = Color::new(0.5, 0.5, 0.5, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn lerp(self, other: Color, t: f32) -> Color {
        let t = t.clamp(0.0, 1.0);
        Color::new(
            self.r + (other.r - self.r) * t,
            self.g + (other.g - self.g) * t,
            self.b + (other.b - self.b) * t,
            self.a + (other.a - self.a) * t,
        )
    }
}

/// Configurable colors for live speech rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub speaking: Color,
    pub overdriven: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            speaking: Color::new(0.2, 0.8, 0.2, 1.0),
            overdriven: Color::new(1.0, 0.2, 0.2, 1.0),
        }
    }
}

/// Rescale `value` from `[in_lo, in_hi]` into `[out_lo, out_hi]`, clamped.
pub(crate) fn clamp_rescale(value: f32, in_lo: f32, in_hi: f32, out_lo: f32, out_hi: f32) -> f32 {
    if in_hi <= in_lo {
        return out_lo;
    }
    let t = ((value - in_lo) / (in_hi - in_lo)).clamp(0.0, 1.0);
    out_lo + (out_hi - out_lo) * t
}

/// One participant's transient communication state. No behavior beyond state
/// transition helpers; ownership lives with exactly one [`SpeakerRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub struct Speaker {
    pub id: AgentId,
    pub display_name: String,
    pub status: SpeakerStatus,
    pub kind: SpeakerKind,
    pub has_spoken: bool,
    pub speech_volume: f32,
    /// Offset from the registry's speech epoch; zero means never spoke.
    pub last_spoke: Duration,
    pub typing: bool,
    /// 0-based rank assigned after each registry update, for display sorting.
    pub sort_index: usize,
    pub dot_color: Color,
    pub is_moderator: bool,
    pub moderator_muted_voice: bool,
    pub moderator_muted_text: bool,
    pub(crate) expires_at: Instant,
    pub(crate) name_generation: u64,
}

impl Speaker {
    pub(crate) fn new(id: AgentId, kind: SpeakerKind, display_name: String, now: Instant) -> Self {
        Self {
            id,
            display_name,
            status: SpeakerStatus::TextOnly,
            kind,
            has_spoken: false,
            speech_volume: 0.0,
            last_spoke: Duration::ZERO,
            typing: false,
            sort_index: 0,
            dot_color: Color::WHITE,
            is_moderator: false,
            moderator_muted_voice: false,
            moderator_muted_text: false,
            expires_at: now + SPEAKER_TIMEOUT,
            name_generation: 0,
        }
    }

    /// Force the muted state. The caller re-applies this every update while
    /// the id remains on the mute list, so voice activity cannot override it.
    pub fn mark_muted(&mut self) {
        self.status = SpeakerStatus::Muted;
        self.speech_volume = 0.0;
    }

    /// Record live speech. The last-spoke stamp only moves on the transition
    /// into speaking so a long utterance keeps one consistent rank.
    pub fn record_speech(&mut self, timestamp: Duration, volume: f32) {
        if self.status != SpeakerStatus::Speaking {
            self.last_spoke = timestamp;
            self.has_spoken = true;
        }
        self.status = SpeakerStatus::Speaking;
        self.speech_volume = volume;
    }

    /// In-channel but silent this frame.
    pub fn record_silence_in_channel(&mut self) {
        self.speech_volume = 0.0;
        self.status = if self.has_spoken {
            SpeakerStatus::HasSpoken
        } else {
            SpeakerStatus::VoiceActive
        };
    }

    /// Departed every feed; starts the expiry countdown.
    pub fn record_left_channel(&mut self, now: Instant) {
        self.status = SpeakerStatus::NotInChannel;
        self.speech_volume = 0.0;
        self.dot_color = Color::INACTIVE;
        self.expires_at = now + SPEAKER_TIMEOUT;
    }

    /// Whether this record was derived from live voice-channel state.
    pub(crate) fn has_voice_status(&self) -> bool {
        matches!(
            self.status,
            SpeakerStatus::Speaking
                | SpeakerStatus::HasSpoken
                | SpeakerStatus::VoiceActive
                | SpeakerStatus::Muted
        )
    }
}
