//! Action domains and action types.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// DOMAIN
// ============================================================================

/// One of the two action families. Each domain has its own queue, lock
/// and sweep cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// user -> video favorites ("likes")
    Favorite,
    /// user -> user follows
    Relation,
}

impl Domain {
    /// Every domain, in a stable order.
    pub const ALL: [Domain; 2] = [Domain::Favorite, Domain::Relation];

    /// Lowercase name used for queues, logs and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Favorite => "favorite",
            Domain::Relation => "relation",
        }
    }

    /// Name of the action queue carrying this domain's events.
    pub fn queue_name(&self) -> &'static str {
        self.as_str()
    }

    /// Name of the coarse domain-wide mutex.
    pub fn lock_name(&self) -> &'static str {
        match self {
            Domain::Favorite => "mutex-favorite",
            Domain::Relation => "mutex-relation",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "favorite" => Ok(Domain::Favorite),
            "relation" => Ok(Domain::Relation),
            other => Err(ValidationError::InvalidValue {
                field: "domain".to_string(),
                reason: format!("unknown domain '{}'", other),
            }),
        }
    }
}

// ============================================================================
// ACTION TYPE
// ============================================================================

/// The intended state transition carried by an event.
///
/// Serialized as its wire integer (`1` / `2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ActionType {
    /// favorite / follow
    Apply = 1,
    /// unfavorite / unfollow
    Revoke = 2,
}

impl ActionType {
    /// Wire value of this action.
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    /// The opposite action.
    pub fn inverse(&self) -> Self {
        match self {
            ActionType::Apply => ActionType::Revoke,
            ActionType::Revoke => ActionType::Apply,
        }
    }
}

impl TryFrom<i64> for ActionType {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ActionType::Apply),
            2 => Ok(ActionType::Revoke),
            other => Err(ValidationError::InvalidActionType { value: other }),
        }
    }
}

impl From<ActionType> for i64 {
    fn from(action: ActionType) -> Self {
        action.as_i64()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}
