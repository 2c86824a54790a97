//! Message-system surface the main loop drives once per frame.
//!
//! The wire format lives behind the transport channels; this layer owns the
//! per-frame contract: drain one queued message at a time, track reliable
//! sends until acked, retransmit on deadline, and keep the drain budget
//! self-tuning so a backlog never permanently outruns the client.

use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde_json::Value;
use uuid::Uuid;

use crate::{AgentId, SessionId};

/// Default wall-clock budget for one frame's message drain.
pub const CHECK_MESSAGES_DEFAULT_MAX_TIME: Duration = Duration::from_millis(20);
/// Growth factor applied when a drain hits its budget: roughly x2 in 20
/// frames, x8 in 60, so a backlog is always eventually absorbed.
pub const CHECK_MESSAGES_TIME_GROWTH: f64 = 1.035;
/// Hard cap on messages decoded per frame regardless of time spent.
pub const MESSAGE_MAX_PER_FRAME: usize = 400;

const RELIABLE_RESEND_INTERVAL: Duration = Duration::from_millis(750);
const RELIABLE_MAX_RETRIES: u32 = 3;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound payloads the core reads. Field names mirror the wire schema; the
/// session roster payloads stay as JSON maps exactly as the server sends them.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    SessionSpeakerList { session: SessionId, payload: Value },
    SessionSpeakerMap { session: SessionId, payload: Value },
    SessionSpeakerUpdate { session: SessionId, payload: Value },
    ChatFromAgent { agent: AgentId },
    AgentTyping { agent: AgentId, typing: bool },
    LogoutReply { agent: AgentId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    AgentUpdate { control_flags: u32 },
    RetrieveInstantMessages { agent: AgentId },
    LogoutRequest { agent: AgentId, session: SessionId },
    ViewerEffects { count: usize },
}

/// Outbound message plus its reliable sequence number, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEnvelope {
    pub sequence: Option<u32>,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone)]
struct ReliableEnvelope {
    sequence: u32,
    message: OutboundMessage,
    sent_at: Instant,
    retries: u32,
}

#[derive(Debug, Clone)]
struct AssetTransfer {
    id: Uuid,
    deadline: Instant,
}

/// Transport-side endpoints paired with a [`MessageSystem`].
pub struct MessageChannels {
    pub inbound_tx: Sender<InboundMessage>,
    pub ack_tx: Sender<u32>,
    pub outbound_rx: Receiver<WireEnvelope>,
}

pub struct MessageSystem {
    inbound_rx: Receiver<InboundMessage>,
    ack_rx: Receiver<u32>,
    outbound_tx: Sender<WireEnvelope>,
    unacked: Vec<ReliableEnvelope>,
    transfers: Vec<AssetTransfer>,
    next_sequence: u32,
}

impl MessageSystem {
    pub fn new() -> (Self, MessageChannels) {
        let (inbound_tx, inbound_rx) = unbounded();
        let (ack_tx, ack_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        (
            Self {
                inbound_rx,
                ack_rx,
                outbound_tx,
                unacked: Vec::new(),
                transfers: Vec::new(),
                next_sequence: 1,
            },
            MessageChannels {
                inbound_tx,
                ack_tx,
                outbound_rx,
            },
        )
    }

    /// Pop at most one queued inbound message and hand it to the dispatcher.
    /// Returns whether a message was processed, so drain loops can count.
    pub fn check_messages(&mut self, dispatch: impl FnOnce(InboundMessage)) -> bool {
        match self.inbound_rx.try_recv() {
            Ok(message) => {
                dispatch(message);
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Fire-and-forget send.
    pub fn send(&mut self, message: OutboundMessage) {
        let _ = self.outbound_tx.send(WireEnvelope {
            sequence: None,
            message,
        });
    }

    /// Send with retransmission until acknowledged. Returns the sequence.
    pub fn send_reliable(&mut self, message: OutboundMessage, now: Instant) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let _ = self.outbound_tx.send(WireEnvelope {
            sequence: Some(sequence),
            message: message.clone(),
        });
        self.unacked.push(ReliableEnvelope {
            sequence,
            message,
            sent_at: now,
            retries: 0,
        });
        sequence
    }

    /// Consume acknowledgments received since the last frame.
    pub fn process_acks(&mut self) {
        while let Ok(sequence) = self.ack_rx.try_recv() {
            self.unacked.retain(|envelope| envelope.sequence != sequence);
        }
    }

    /// Re-send reliable envelopes whose ack deadline passed. Envelopes past
    /// the retry cap are dropped with a warning; the session-level timeout
    /// (logout, region death) is responsible for escalating.
    pub fn retransmit_unacked(&mut self, now: Instant) {
        let outbound_tx = &self.outbound_tx;
        self.unacked.retain_mut(|envelope| {
            if now.duration_since(envelope.sent_at) < RELIABLE_RESEND_INTERVAL {
                return true;
            }
            if envelope.retries >= RELIABLE_MAX_RETRIES {
                tracing::warn!(
                    sequence = envelope.sequence,
                    "dropping reliable message after {RELIABLE_MAX_RETRIES} retries"
                );
                return false;
            }
            envelope.retries += 1;
            envelope.sent_at = now;
            let _ = outbound_tx.send(WireEnvelope {
                sequence: Some(envelope.sequence),
                message: envelope.message.clone(),
            });
            true
        });
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn begin_transfer(&mut self, id: Uuid, now: Instant) {
        self.transfers.push(AssetTransfer {
            id,
            deadline: now + TRANSFER_TIMEOUT,
        });
    }

    pub fn complete_transfer(&mut self, id: Uuid) {
        self.transfers.retain(|transfer| transfer.id != id);
    }

    /// Expire stalled asset transfers; returns how many were dropped.
    pub fn check_transfer_timeouts(&mut self, now: Instant) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|transfer| {
            if now < transfer.deadline {
                return true;
            }
            tracing::warn!(id = %transfer.id, "asset transfer timed out");
            false
        });
        before - self.transfers.len()
    }

    pub fn pending_transfers(&self) -> usize {
        self.transfers.len()
    }
}

/// Self-tuning wall-clock budget for the per-frame message drain.
///
/// Hitting the budget means a backlog exists, so the budget grows until the
/// drain stops being time-capped; the first under-budget frame snaps it back
/// to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainBudget {
    current: Duration,
}

impl Default for DrainBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainBudget {
    pub fn new() -> Self {
        Self {
            current: CHECK_MESSAGES_DEFAULT_MAX_TIME,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record whether this frame's drain was cut short by the budget.
    pub fn note_frame(&mut self, hit_budget: bool) {
        if hit_budget {
            self.current =
                Duration::from_secs_f64(self.current.as_secs_f64() * CHECK_MESSAGES_TIME_GROWTH);
        } else {
            self.current = CHECK_MESSAGES_DEFAULT_MAX_TIME;
        }
    }
}

/// Per-frame dynamic bandwidth adjustment. Backs off while the drain is
/// saturated and creeps back toward the configured ceiling otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveThrottle {
    current_bps: f32,
    floor_bps: f32,
    ceiling_bps: f32,
}

impl AdaptiveThrottle {
    pub fn new(ceiling_bps: f32) -> Self {
        let ceiling_bps = ceiling_bps.max(1.0);
        Self {
            current_bps: ceiling_bps,
            floor_bps: ceiling_bps * 0.1,
            ceiling_bps,
        }
    }

    pub fn current_bps(&self) -> f32 {
        self.current_bps
    }

    pub fn update_dynamic(&mut self, drain_saturated: bool) {
        if drain_saturated {
            self.current_bps = (self.current_bps * 0.9).max(self.floor_bps);
        } else {
            self.current_bps = (self.current_bps * 1.02).min(self.ceiling_bps);
        }
    }
}
