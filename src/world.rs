//! Minimal world model the main loop drives each frame.
//!
//! The per-frame call order is an invariant, not a convenience: object
//! updates land before dead objects are purged, purge runs before HUD
//! effects touch object state, effects flush before audio. A stage tracker
//! enforces the order so a refactor cannot silently reshuffle it.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use crate::msg::{MessageSystem, OutboundMessage};
use crate::{AgentId, RegionId};

/// One nearby avatar entity, as the object list knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarState {
    pub id: AgentId,
    pub display_name: String,
    pub position: [f32; 3],
    pub dead: bool,
}

/// The agent's current simulator region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle {
    pub id: RegionId,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FrameStage {
    Start,
    Objects,
    Purge,
    HudEffects,
    EffectsFlush,
    Audio,
}

#[derive(Debug, Clone, PartialEq)]
struct HudEffect {
    id: Uuid,
    target: Option<AgentId>,
    dirty: bool,
}

pub struct WorldModel {
    avatars: HashMap<AgentId, AvatarState>,
    pub region: Option<RegionHandle>,
    agent_position: [f32; 3],
    hud_effects: Vec<HudEffect>,
    space_time_us: u64,
    audio_frames: u64,
    stage: FrameStage,
}

impl Default for WorldModel {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldModel {
    pub fn new() -> Self {
        Self {
            avatars: HashMap::new(),
            region: None,
            agent_position: [0.0; 3],
            hud_effects: Vec::new(),
            space_time_us: 0,
            audio_frames: 0,
            stage: FrameStage::Start,
        }
    }

    pub fn set_agent_position(&mut self, position: [f32; 3]) {
        self.agent_position = position;
    }

    pub fn agent_position(&self) -> [f32; 3] {
        self.agent_position
    }

    pub fn upsert_avatar(&mut self, avatar: AvatarState) {
        self.avatars.insert(avatar.id, avatar);
    }

    pub fn kill_avatar(&mut self, id: AgentId) {
        if let Some(avatar) = self.avatars.get_mut(&id) {
            avatar.dead = true;
        }
    }

    pub fn avatar(&self, id: AgentId) -> Option<&AvatarState> {
        self.avatars.get(&id)
    }

    /// Live avatars within `radius` meters of `center`.
    pub fn avatars_within(&self, center: [f32; 3], radius: f32) -> Vec<&AvatarState> {
        let radius_sq = radius * radius;
        self.avatars
            .values()
            .filter(|avatar| !avatar.dead && dist_sq(avatar.position, center) <= radius_sq)
            .collect()
    }

    pub fn spawn_hud_effect(&mut self, target: Option<AgentId>) -> Uuid {
        let id = Uuid::new_v4();
        self.hud_effects.push(HudEffect {
            id,
            target,
            dirty: true,
        });
        id
    }

    pub fn cancel_hud_effect(&mut self, id: Uuid) {
        self.hud_effects.retain(|effect| effect.id != id);
    }

    pub fn region_id(&self) -> Option<RegionId> {
        self.region.map(|region| region.id)
    }

    pub fn region_alive(&self) -> bool {
        self.region.map(|region| region.alive).unwrap_or(false)
    }

    /// Reset the stage tracker at the top of a frame.
    pub fn begin_frame(&mut self) {
        self.stage = FrameStage::Start;
    }

    fn advance_stage(&mut self, expected_prev: FrameStage, next: FrameStage) {
        debug_assert!(
            self.stage == expected_prev,
            "world update out of order: {:?} after {:?}",
            next,
            self.stage
        );
        self.stage = next;
    }

    /// Advance simulator-side time and object interpolation.
    pub fn update_objects(&mut self, dt: Duration) {
        self.advance_stage(FrameStage::Start, FrameStage::Objects);
        self.space_time_us = self
            .space_time_us
            .wrapping_add(dt.as_micros().min(u128::from(u64::MAX)) as u64);
    }

    /// Drop entities flagged dead. Must run before effects so nothing
    /// downstream holds a reference to a purged object this frame.
    pub fn purge_dead_objects(&mut self) -> usize {
        self.advance_stage(FrameStage::Objects, FrameStage::Purge);
        let before = self.avatars.len();
        let dead: Vec<AgentId> = self
            .avatars
            .values()
            .filter(|avatar| avatar.dead)
            .map(|avatar| avatar.id)
            .collect();
        for id in &dead {
            self.avatars.remove(id);
            self.hud_effects.retain(|effect| effect.target != Some(*id));
        }
        before - self.avatars.len()
    }

    /// Recompute HUD effect state against the now-purged object set.
    pub fn update_hud_effects(&mut self) {
        self.advance_stage(FrameStage::Purge, FrameStage::HudEffects);
        for effect in &mut self.hud_effects {
            if let Some(target) = effect.target {
                // Purge ran first, so a missing target means the effect ends.
                effect.dirty = self.avatars.contains_key(&target);
            }
        }
        self.hud_effects.retain(|effect| effect.dirty);
    }

    /// Send dirty effects to the simulator.
    pub fn flush_effects(&mut self, msg: &mut MessageSystem) {
        self.advance_stage(FrameStage::HudEffects, FrameStage::EffectsFlush);
        let dirty = self.hud_effects.iter().filter(|effect| effect.dirty).count();
        if dirty > 0 {
            msg.send(OutboundMessage::ViewerEffects { count: dirty });
            for effect in &mut self.hud_effects {
                effect.dirty = false;
            }
        }
    }

    /// Listener/audio update; always last so it sees settled positions.
    pub fn update_audio(&mut self) {
        self.advance_stage(FrameStage::EffectsFlush, FrameStage::Audio);
        self.audio_frames += 1;
    }

    pub fn space_time_us(&self) -> u64 {
        self.space_time_us
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames
    }

    pub fn clear(&mut self) {
        self.avatars.clear();
        self.hud_effects.clear();
        self.region = None;
    }
}

fn dist_sq(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}
