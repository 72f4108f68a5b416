//! Action events and the clock that stamps them.

use crate::domain::ActionType;
use crate::error::DecodeError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// An (actor, target) pair within a domain.
///
/// For favorites the actor is the user and the target the video; for
/// relations both are users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub actor_id: i64,
    pub target_id: i64,
}

impl PairKey {
    pub fn new(actor_id: i64, target_id: i64) -> Self {
        Self {
            actor_id,
            target_id,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.actor_id, self.target_id)
    }
}

/// A single user-initiated action, produced once per request and consumed
/// once by the reconciler.
///
/// The JSON field names also accept the legacy per-domain spellings
/// (`user_id`, `video_id`, `to_user_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEvent {
    #[serde(alias = "user_id")]
    pub actor_id: i64,
    #[serde(alias = "video_id", alias = "to_user_id")]
    pub target_id: i64,
    pub action_type: ActionType,
    pub created_at: i64,
}

impl ActionEvent {
    pub fn new(actor_id: i64, target_id: i64, action_type: ActionType, created_at: i64) -> Self {
        Self {
            actor_id,
            target_id,
            action_type,
            created_at,
        }
    }

    /// The pair this event is about.
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.actor_id, self.target_id)
    }

    /// Encode as the JSON message body.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a JSON message body.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Payload {
            reason: e.to_string(),
        })
    }
}

/// Microsecond wall clock that never hands out the same value twice.
///
/// Two events stamped by one clock always compare strictly, so an apply
/// followed by a revoke in the same millisecond still orders correctly.
#[derive(Debug, Default)]
pub struct EventClock {
    last: AtomicI64,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: `max(now_micros, previous + 1)`.
    pub fn now(&self) -> i64 {
        let wall = Utc::now().timestamp_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_roundtrip_shape() {
        let event = ActionEvent::new(1, 42, ActionType::Apply, 1_700_000_000_000_000);
        let json: serde_json::Value = serde_json::from_slice(&event.encode()).unwrap();
        assert_eq!(json["actor_id"], 1);
        assert_eq!(json["target_id"], 42);
        assert_eq!(json["action_type"], 1);
        assert_eq!(json["created_at"], 1_700_000_000_000_000i64);
    }

    #[test]
    fn test_decode_legacy_favorite_payload() {
        let body = br#"{"video_id": 9, "user_id": 3, "action_type": 2, "created_at": 55}"#;
        let event = ActionEvent::decode(body).unwrap();
        assert_eq!(event.pair(), PairKey::new(3, 9));
        assert_eq!(event.action_type, ActionType::Revoke);
    }

    #[test]
    fn test_decode_legacy_relation_payload() {
        let body = br#"{"user_id": 3, "to_user_id": 4, "action_type": 1, "created_at": 1}"#;
        let event = ActionEvent::decode(body).unwrap();
        assert_eq!(event.pair(), PairKey::new(3, 4));
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(ActionEvent::decode(b"not json").is_err());
        assert!(ActionEvent::decode(br#"{"actor_id": 1}"#).is_err());
        let bad_action = br#"{"actor_id": 1, "target_id": 2, "action_type": 7, "created_at": 1}"#;
        assert!(matches!(
            ActionEvent::decode(bad_action),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn test_clock_strictly_increasing() {
        let clock = EventClock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_clock_tracks_wall_time() {
        let clock = EventClock::new();
        let before = Utc::now().timestamp_micros();
        let stamped = clock.now();
        assert!(stamped >= before);
    }
}
