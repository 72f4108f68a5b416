//! Source-of-truth relation store trait.

use async_trait::async_trait;
use tally_core::{Domain, PairKey, TallyResult};

/// Durable relation rows plus the denormalized counters they drive.
///
/// `apply_relation` and `revoke_relation` are the only writers of the
/// counters. Each runs as one transaction that mutates the row and both
/// sides' counters, and fails as a whole if any step affects a number of
/// rows other than one.
///
/// | domain   | row                        | counters                                                              |
/// |----------|----------------------------|-----------------------------------------------------------------------|
/// | favorite | user -> video              | video `favorite_count`, actor `favorite_count`, author `total_favorited` |
/// | relation | user -> user (follow)      | actor `following_count`, target `follower_count`                      |
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Whether every entity the relation's counters touch still exists:
    /// actor and target, plus the video's author for favorites.
    async fn entities_exist(&self, domain: Domain, pair: PairKey) -> TallyResult<bool>;

    /// Whether the relation row exists.
    async fn relation_exists(&self, domain: Domain, pair: PairKey) -> TallyResult<bool>;

    /// Insert the row and increment counters in one transaction.
    async fn apply_relation(&self, domain: Domain, pair: PairKey, created_at: i64)
        -> TallyResult<()>;

    /// Delete the row and decrement counters in one transaction.
    async fn revoke_relation(&self, domain: Domain, pair: PairKey) -> TallyResult<()>;

    /// Targets of an actor: favorited videos, or followed users. Newest first.
    async fn list_targets(&self, domain: Domain, actor_id: i64) -> TallyResult<Vec<i64>>;

    /// Actors of a target: users who favorited a video, or followers. Newest
    /// first.
    async fn list_actors(&self, domain: Domain, target_id: i64) -> TallyResult<Vec<i64>>;

    /// Users that `user_id` follows and who follow back.
    async fn list_friends(&self, user_id: i64) -> TallyResult<Vec<i64>>;

    async fn ping(&self) -> TallyResult<()>;

    fn backend_name(&self) -> &'static str;
}
