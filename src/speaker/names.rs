//! Generation-checked async display-name lookups.
//!
//! A lookup result carries the generation the speaker had when the request
//! was issued. If the speaker has since been destroyed and re-created (or the
//! lookup re-triggered), the generation no longer matches and the stale
//! result is silently dropped instead of writing into the wrong record.

use crate::AgentId;

/// Request for an asynchronous display-name lookup, drained by the caller
/// and handed to whatever name service the embedding application uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameLookupRequest {
    pub id: AgentId,
    pub generation: u64,
}

/// Completed lookup, delivered back to the registry at the caller's leisure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameResolution {
    pub id: AgentId,
    pub generation: u64,
    pub display_name: String,
}
