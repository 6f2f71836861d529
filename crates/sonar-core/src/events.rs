//! Event payloads published by a connection.
//!
//! A connection exposes two independent streams: batched status updates keyed
//! by the identifier the network tracks an action under, and upserts of newly
//! observed actions (including ones this session sent itself).

use serde::{Deserialize, Serialize};

use crate::status::RawStatus;

/// Progress report for one tracked action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Identifier the network tracks the action under.
    pub id: String,
    pub status: RawStatus,
}

impl StatusUpdate {
    pub fn new(id: impl Into<String>, status: impl Into<RawStatus>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
        }
    }
}

/// What kind of action an upsert carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// A revoke/delete of an earlier action.
    Revoke,
    /// Regular content.
    Message,
    Other(String),
}

/// A newly observed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertedAction {
    /// Whether this session originated the action.
    pub self_originated: bool,
    pub kind: ActionKind,
    /// For a revoke, the identifier of the action being revoked.
    pub target_action_id: Option<String>,
    /// Identifier the network assigned to this action.
    pub id: String,
    pub status: Option<RawStatus>,
}

impl UpsertedAction {
    /// True when this is our own revoke of `action_id`.
    pub fn is_own_revoke_of(&self, action_id: &str) -> bool {
        self.self_originated
            && self.kind == ActionKind::Revoke
            && self.target_action_id.as_deref() == Some(action_id)
    }
}
