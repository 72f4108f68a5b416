//! Tally Test Utilities
//!
//! Shared test infrastructure for the Tally workspace:
//! - Proptest generators for events and event histories
//! - Seeded relation-store fixtures
//! - In-memory backend bundles and a fault-injecting cache store

pub mod backends;

pub use backends::{FlakyCacheStore, InMemoryBackends};

// Re-export core types for convenience
pub use tally_core::{
    ActionEvent, ActionType, CacheValue, Domain, PairKey, TallyError, TallyResult,
};

use proptest::prelude::*;
use std::collections::BTreeMap;
use tally_storage::InMemoryRelationStore;

// ============================================================================
// GENERATORS
// ============================================================================

pub fn arb_domain() -> impl Strategy<Value = Domain> {
    prop_oneof![Just(Domain::Favorite), Just(Domain::Relation)]
}

pub fn arb_action_type() -> impl Strategy<Value = ActionType> {
    prop_oneof![Just(ActionType::Apply), Just(ActionType::Revoke)]
}

/// Pairs drawn from the ids seeded by [`seed_world`].
pub fn arb_pair(domain: Domain) -> impl Strategy<Value = PairKey> {
    let targets = match domain {
        Domain::Favorite => VIDEO_IDS,
        Domain::Relation => USER_IDS,
    };
    (USER_IDS, targets).prop_map(|(actor, target)| PairKey::new(actor, target))
}

pub fn arb_action_event(domain: Domain) -> impl Strategy<Value = ActionEvent> {
    (arb_pair(domain), arb_action_type(), 1i64..1_000_000).prop_map(|(pair, action, at)| {
        ActionEvent::new(pair.actor_id, pair.target_id, action, at)
    })
}

/// A history of up to `max_len` events over a handful of pairs, with
/// distinct timestamps increasing in generation order.
///
/// Shuffle the result to model out-of-order delivery.
pub fn arb_event_history(domain: Domain, max_len: usize) -> impl Strategy<Value = Vec<ActionEvent>> {
    let pairs = proptest::collection::vec(arb_pair(domain), 1..=4);
    pairs.prop_flat_map(move |pairs| {
        let n = pairs.len();
        proptest::collection::vec((0..n, arb_action_type(), 1i64..50), 1..=max_len).prop_map(
            move |steps| {
                let mut at = 0i64;
                steps
                    .into_iter()
                    .map(|(idx, action, gap)| {
                        at += gap;
                        let pair = pairs[idx];
                        ActionEvent::new(pair.actor_id, pair.target_id, action, at)
                    })
                    .collect()
            },
        )
    })
}

// ============================================================================
// FIXTURES
// ============================================================================

/// User ids seeded by [`seed_world`].
pub const USER_IDS: std::ops::RangeInclusive<i64> = 1..=5;

/// Video ids seeded by [`seed_world`]; video `100 + n` is authored by user
/// `n + 1`.
pub const VIDEO_IDS: std::ops::RangeInclusive<i64> = 100..=104;

/// Seed users 1..=5 and videos 100..=104.
pub fn seed_world(store: &InMemoryRelationStore) -> TallyResult<()> {
    for id in USER_IDS {
        store.insert_user(id)?;
    }
    for id in VIDEO_IDS {
        store.insert_video(id, id - 100 + 1)?;
    }
    Ok(())
}

/// A fresh store seeded by [`seed_world`].
pub fn seeded_store() -> InMemoryRelationStore {
    let store = InMemoryRelationStore::new();
    // seeding a fresh in-memory store cannot fail
    let _ = seed_world(&store);
    store
}

/// Terminal action per pair under last-writer-wins: the action of the
/// newest event, whatever order the events were delivered in.
pub fn expected_terminal(events: &[ActionEvent]) -> BTreeMap<PairKey, ActionType> {
    let mut newest: BTreeMap<PairKey, ActionEvent> = BTreeMap::new();
    for event in events {
        newest
            .entry(event.pair())
            .and_modify(|current| {
                if event.created_at > current.created_at {
                    *current = *event;
                }
            })
            .or_insert(*event);
    }
    newest
        .into_iter()
        .map(|(pair, event)| (pair, event.action_type))
        .collect()
}

/// Relation rows expected after every terminal action is migrated.
pub fn expected_rows(events: &[ActionEvent]) -> Vec<PairKey> {
    expected_terminal(events)
        .into_iter()
        .filter(|(_, action)| *action == ActionType::Apply)
        .map(|(pair, _)| pair)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
