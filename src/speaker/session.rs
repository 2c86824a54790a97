//! Server-driven session rosters.
//!
//! An IM session's membership is never derived locally; the simulator pushes
//! a full roster (array or map form) and incremental ENTER/LEAVE updates.
//! Payloads arrive as JSON maps and are read field-by-field; a malformed
//! entry skips that entry, never the whole message.

use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use super::registry::SpeakerRegistry;
use super::{SpeakerKind, SpeakerStatus};
use crate::AgentId;

impl SpeakerRegistry {
    /// Full roster push, legacy array form: `{"agents": ["<uuid>", ...]}`.
    pub fn process_speaker_list(&mut self, payload: &Value, now: Instant) {
        let Some(agents) = payload.get("agents").and_then(Value::as_array) else {
            return;
        };
        for entry in agents {
            let Some(id) = entry.as_str().and_then(|raw| Uuid::parse_str(raw).ok()) else {
                continue;
            };
            self.upsert(id, "", SpeakerStatus::TextOnly, SpeakerKind::Agent, now);
        }
    }

    /// Full roster push keyed by id:
    /// `{"agent_info": {"<uuid>": {"is_moderator": …, "mutes": {"text": …}}}}`.
    pub fn process_speaker_map(&mut self, payload: &Value, now: Instant) {
        let Some(info) = payload.get("agent_info").and_then(Value::as_object) else {
            return;
        };
        for (key, data) in info {
            let Ok(id) = Uuid::parse_str(key) else {
                continue;
            };
            if self
                .upsert(id, "", SpeakerStatus::TextOnly, SpeakerKind::Agent, now)
                .is_some()
            {
                self.apply_agent_info(id, data);
            }
        }
    }

    /// Incremental membership update. `"ENTER"` upserts, `"LEAVE"` starts the
    /// expiry countdown; any other tag is a protocol-format warning and that
    /// entry is skipped. Accepts the richer `agent_updates` form and the
    /// legacy flat `updates` form.
    pub fn process_speaker_update(&mut self, payload: &Value, now: Instant) {
        if let Some(updates) = payload.get("agent_updates").and_then(Value::as_object) {
            for (key, data) in updates {
                let Ok(id) = Uuid::parse_str(key) else {
                    continue;
                };
                if let Some(transition) = data.get("transition").and_then(Value::as_str) {
                    self.apply_transition(id, transition, now);
                }
                if let Some(info) = data.get("info") {
                    self.apply_agent_info(id, info);
                }
            }
        } else if let Some(updates) = payload.get("updates").and_then(Value::as_object) {
            for (key, value) in updates {
                let Ok(id) = Uuid::parse_str(key) else {
                    continue;
                };
                if let Some(transition) = value.as_str() {
                    self.apply_transition(id, transition, now);
                }
            }
        }
    }

    fn apply_transition(&mut self, id: AgentId, transition: &str, now: Instant) {
        match transition {
            "ENTER" => {
                self.upsert(id, "", SpeakerStatus::TextOnly, SpeakerKind::Agent, now);
            }
            "LEAVE" => {
                if let Some(speaker) = self.speakers.get_mut(&id) {
                    speaker.record_left_channel(now);
                }
            }
            other => {
                tracing::warn!(agent = %id, transition = other, "bad membership list update");
            }
        }
    }

    fn apply_agent_info(&mut self, id: AgentId, info: &Value) {
        let Some(speaker) = self.speakers.get_mut(&id) else {
            return;
        };
        if let Some(is_moderator) = info.get("is_moderator").and_then(Value::as_bool) {
            speaker.is_moderator = is_moderator;
        }
        if let Some(muted_text) = info
            .get("mutes")
            .and_then(|mutes| mutes.get("text"))
            .and_then(Value::as_bool)
        {
            speaker.moderator_muted_text = muted_text;
        }
    }
}
