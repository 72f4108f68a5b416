//! Pure decision functions shared by the reconciler and the sweeper.
//!
//! Keeping these free of I/O lets the conflict rules be tested exhaustively
//! without a cache or a database.

use crate::cache_key::CacheValue;
use crate::domain::ActionType;

/// Outcome of folding one event into the current write view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileDecision {
    /// No write view exists yet; write both views.
    Insert,
    /// The event flips the action and is strictly newer; overwrite both views.
    Replace,
    /// Same action as recorded but strictly newer; advance the timestamp.
    Refresh,
    /// Same action as recorded and not newer; nothing to do.
    Unchanged,
    /// Different action but not newer than the recorded one; discard.
    Stale,
}

impl ReconcileDecision {
    /// Whether the cache must be written.
    pub fn writes(&self) -> bool {
        matches!(
            self,
            ReconcileDecision::Insert | ReconcileDecision::Replace | ReconcileDecision::Refresh
        )
    }
}

/// Last-writer-wins for one key.
///
/// The recorded value always carries the greatest timestamp seen for the
/// key, so the outcome does not depend on delivery order. Re-delivering the
/// recorded event is a no-op.
pub fn reconcile(existing: Option<CacheValue>, incoming: CacheValue) -> ReconcileDecision {
    let Some(current) = existing else {
        return ReconcileDecision::Insert;
    };
    let same_action = current.action_type == incoming.action_type;
    match (incoming.created_at > current.created_at, same_action) {
        (true, false) => ReconcileDecision::Replace,
        (true, true) => ReconcileDecision::Refresh,
        (false, true) => ReconcileDecision::Unchanged,
        (false, false) => ReconcileDecision::Stale,
    }
}

/// What the sweeper does with one pending key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Insert the relation row and increment counters.
    Apply,
    /// Delete the relation row and decrement counters.
    Revoke,
    /// Actor or target no longer exists; drop the key without mutation.
    Discard,
    /// The store already reflects the intended state.
    NoChange,
}

impl SweepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepAction::Apply => "apply",
            SweepAction::Revoke => "revoke",
            SweepAction::Discard => "discard",
            SweepAction::NoChange => "no_change",
        }
    }
}

/// Decide the store mutation for a terminal action given actual store state.
pub fn sweep_decision(row_exists: bool, entities_exist: bool, action: ActionType) -> SweepAction {
    if !entities_exist {
        return SweepAction::Discard;
    }
    match (row_exists, action) {
        (false, ActionType::Apply) => SweepAction::Apply,
        (true, ActionType::Revoke) => SweepAction::Revoke,
        _ => SweepAction::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn value(created_at: i64, action: ActionType) -> CacheValue {
        CacheValue::new(created_at, action)
    }

    #[test]
    fn test_insert_when_absent() {
        assert_eq!(
            reconcile(None, value(1, ActionType::Apply)),
            ReconcileDecision::Insert
        );
    }

    #[test]
    fn test_same_action_refreshes_only_when_newer() {
        let current = value(10, ActionType::Apply);
        assert_eq!(
            reconcile(Some(current), value(20, ActionType::Apply)),
            ReconcileDecision::Refresh
        );
        assert_eq!(
            reconcile(Some(current), value(10, ActionType::Apply)),
            ReconcileDecision::Unchanged
        );
        assert_eq!(
            reconcile(Some(current), value(3, ActionType::Apply)),
            ReconcileDecision::Unchanged
        );
    }

    #[test]
    fn test_refresh_blocks_older_flip() {
        // apply@1, apply@5, revoke@3 must end on apply
        let mut state = None;
        for ev in [
            value(1, ActionType::Apply),
            value(5, ActionType::Apply),
            value(3, ActionType::Revoke),
        ] {
            if reconcile(state, ev).writes() {
                state = Some(ev);
            }
        }
        assert_eq!(state, Some(value(5, ActionType::Apply)));
    }

    #[test]
    fn test_strictly_newer_flip_replaces() {
        let current = value(10, ActionType::Apply);
        assert_eq!(
            reconcile(Some(current), value(11, ActionType::Revoke)),
            ReconcileDecision::Replace
        );
    }

    #[test]
    fn test_equal_or_older_flip_is_stale() {
        let current = value(10, ActionType::Apply);
        assert_eq!(
            reconcile(Some(current), value(10, ActionType::Revoke)),
            ReconcileDecision::Stale
        );
        assert_eq!(
            reconcile(Some(current), value(9, ActionType::Revoke)),
            ReconcileDecision::Stale
        );
    }

    #[test]
    fn test_sweep_decision_table() {
        use ActionType::*;
        assert_eq!(sweep_decision(false, true, Apply), SweepAction::Apply);
        assert_eq!(sweep_decision(true, true, Revoke), SweepAction::Revoke);
        assert_eq!(sweep_decision(true, true, Apply), SweepAction::NoChange);
        assert_eq!(sweep_decision(false, true, Revoke), SweepAction::NoChange);
        assert_eq!(sweep_decision(true, false, Revoke), SweepAction::Discard);
        assert_eq!(sweep_decision(false, false, Apply), SweepAction::Discard);
    }

    fn action_strategy() -> impl Strategy<Value = ActionType> {
        prop_oneof![Just(ActionType::Apply), Just(ActionType::Revoke)]
    }

    proptest! {
        /// Folding two flipping events in either order ends on the newer one.
        #[test]
        fn prop_two_events_converge_on_newer(
            t1 in 0i64..1_000_000,
            gap in 1i64..1_000,
            first in action_strategy(),
        ) {
            let older = value(t1, first);
            let newer = value(t1 + gap, first.inverse());

            let fold = |a: CacheValue, b: CacheValue| {
                let mut state = None;
                for ev in [a, b] {
                    if reconcile(state, ev).writes() {
                        state = Some(ev);
                    }
                }
                state
            };

            prop_assert_eq!(fold(older, newer), Some(newer));
            prop_assert_eq!(fold(newer, older), Some(newer));
        }

        /// Any delivery order of events with distinct timestamps ends on the
        /// newest event.
        #[test]
        fn prop_any_order_converges_on_newest(
            (actions, order) in proptest::collection::vec(action_strategy(), 1..20)
                .prop_flat_map(|actions| {
                    let indices: Vec<usize> = (0..actions.len()).collect();
                    (Just(actions), Just(indices).prop_shuffle())
                }),
        ) {
            let events: Vec<CacheValue> = actions
                .iter()
                .enumerate()
                .map(|(i, action)| value(i as i64 + 1, *action))
                .collect();

            let mut state = None;
            for &i in &order {
                if reconcile(state, events[i]).writes() {
                    state = Some(events[i]);
                }
            }
            prop_assert_eq!(state, events.last().copied());
        }

        /// Re-applying the recorded value never writes.
        #[test]
        fn prop_reapply_is_idempotent(t in any::<i64>(), action in action_strategy()) {
            let v = value(t, action);
            prop_assert!(!reconcile(Some(v), v).writes());
        }
    }
}
