//! Cache key and value codecs.
//!
//! Keys are colon-delimited and domain qualified:
//!
//! ```text
//! favorite:  video::{video_id}::user::{user_id}::{r|w}
//! relation:  user::{actor_id}::to_user::{target_id}::{r|w}
//! ```
//!
//! Values are `"{created_at}::{action_type}"`.

use crate::domain::{ActionType, Domain};
use crate::error::DecodeError;
use crate::event::{ActionEvent, PairKey};
use std::fmt;

const SEP: &str = "::";

/// Which of the two cache representations a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    /// Short-lived view answering live queries.
    Read,
    /// Durable view awaiting reconciliation into the store.
    Write,
}

impl View {
    pub fn suffix(&self) -> &'static str {
        match self {
            View::Read => "r",
            View::Write => "w",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "r" => Some(View::Read),
            "w" => Some(View::Write),
            _ => None,
        }
    }
}

/// A fully qualified cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain: Domain,
    pub pair: PairKey,
    pub view: View,
}

impl CacheKey {
    pub fn new(domain: Domain, pair: PairKey, view: View) -> Self {
        Self { domain, pair, view }
    }

    pub fn read(domain: Domain, pair: PairKey) -> Self {
        Self::new(domain, pair, View::Read)
    }

    pub fn write(domain: Domain, pair: PairKey) -> Self {
        Self::new(domain, pair, View::Write)
    }

    /// The same pair in the other view.
    pub fn with_view(&self, view: View) -> Self {
        Self { view, ..*self }
    }

    /// Glob pattern matching every write-view key of a domain.
    pub fn write_pattern(domain: Domain) -> &'static str {
        match domain {
            Domain::Favorite => "video::*::user::*::w",
            Domain::Relation => "user::*::to_user::*::w",
        }
    }

    /// Parse a key string back into its parts.
    pub fn parse(key: &str) -> Result<Self, DecodeError> {
        let malformed = || DecodeError::CacheKey {
            key: key.to_string(),
        };

        let parts: Vec<&str> = key.split(SEP).collect();
        if parts.len() != 5 {
            return Err(malformed());
        }
        let view = View::from_suffix(parts[4]).ok_or_else(malformed)?;
        let first: i64 = parts[1].parse().map_err(|_| malformed())?;
        let second: i64 = parts[3].parse().map_err(|_| malformed())?;

        match (parts[0], parts[2]) {
            // video id comes first in favorite keys
            ("video", "user") => Ok(Self::new(
                Domain::Favorite,
                PairKey::new(second, first),
                view,
            )),
            ("user", "to_user") => Ok(Self::new(
                Domain::Relation,
                PairKey::new(first, second),
                view,
            )),
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain {
            Domain::Favorite => write!(
                f,
                "video::{}::user::{}::{}",
                self.pair.target_id,
                self.pair.actor_id,
                self.view.suffix()
            ),
            Domain::Relation => write!(
                f,
                "user::{}::to_user::{}::{}",
                self.pair.actor_id,
                self.pair.target_id,
                self.view.suffix()
            ),
        }
    }
}

/// The latest known intended action for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheValue {
    pub created_at: i64,
    pub action_type: ActionType,
}

impl CacheValue {
    pub fn new(created_at: i64, action_type: ActionType) -> Self {
        Self {
            created_at,
            action_type,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.created_at, SEP, self.action_type.as_i64())
    }

    pub fn decode(value: &str) -> Result<Self, DecodeError> {
        let malformed = || DecodeError::CacheValue {
            value: value.to_string(),
        };
        let (created_at, action) = value.split_once(SEP).ok_or_else(malformed)?;
        let created_at: i64 = created_at.parse().map_err(|_| malformed())?;
        let action: i64 = action.parse().map_err(|_| malformed())?;
        let action_type = ActionType::try_from(action).map_err(|_| malformed())?;
        Ok(Self::new(created_at, action_type))
    }
}

impl From<&ActionEvent> for CacheValue {
    fn from(event: &ActionEvent) -> Self {
        Self::new(event.created_at, event.action_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_favorite_key_format() {
        let pair = PairKey::new(3, 100);
        assert_eq!(
            CacheKey::read(Domain::Favorite, pair).to_string(),
            "video::100::user::3::r"
        );
        assert_eq!(
            CacheKey::write(Domain::Favorite, pair).to_string(),
            "video::100::user::3::w"
        );
    }

    #[test]
    fn test_relation_key_format() {
        let pair = PairKey::new(3, 4);
        assert_eq!(
            CacheKey::write(Domain::Relation, pair).to_string(),
            "user::3::to_user::4::w"
        );
    }

    #[test]
    fn test_parse_inverts_format() {
        for domain in Domain::ALL {
            for view in [View::Read, View::Write] {
                let key = CacheKey::new(domain, PairKey::new(-5, 812), view);
                assert_eq!(CacheKey::parse(&key.to_string()).unwrap(), key);
            }
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "video::1::user::2",
            "video::1::user::2::x",
            "video::a::user::2::w",
            "comment::1::user::2::w",
            "user::1::user::2::w",
            "video::1::user::2::w::extra",
        ] {
            assert!(CacheKey::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_write_patterns() {
        assert_eq!(CacheKey::write_pattern(Domain::Favorite), "video::*::user::*::w");
        assert_eq!(CacheKey::write_pattern(Domain::Relation), "user::*::to_user::*::w");
    }

    #[test]
    fn test_value_codec() {
        let value = CacheValue::new(1_700_000_000_123, ActionType::Revoke);
        assert_eq!(value.encode(), "1700000000123::2");
        assert_eq!(CacheValue::decode("1700000000123::2").unwrap(), value);
    }

    #[test]
    fn test_value_decode_rejects_malformed() {
        for bad in ["", "12", "12::", "::1", "x::1", "12::3", "12::1::1"] {
            assert!(CacheValue::decode(bad).is_err(), "accepted {:?}", bad);
        }
    }
}
