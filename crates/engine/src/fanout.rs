//! Annunciation fan-out: tag-broadcast counter maintenance.
//!
//! A broadcast reaches receivers through one or more user tags. A user who
//! belongs to several contributing tags would otherwise have their counters
//! bumped once per membership, so the deduplicator computes the set of users
//! appearing in more than one contributing tag and those users are skipped
//! when the per-tag counters are adjusted.
//!
//! Fan-out counters are maintained incrementally and never recounted, so a
//! publish or retract applies its annunciate rows and every bucket update in
//! one store transaction: it lands completely or not at all.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use notice_common::error::AppError;
use notice_common::types::{
    ANNUNCIATION_KIND, Annunciate, BUCKET_OFFICIAL, BUCKET_TOTAL, DbId, UserTagged,
};

use crate::store::{CounterDelta, FanoutTx, TagStore};

/// Buckets adjusted on every receiver reached by a broadcast.
pub const FANOUT_BUCKETS: [&str; 3] = [BUCKET_TOTAL, BUCKET_OFFICIAL, ANNUNCIATION_KIND];

/// Users that belong to more than one of the given tags.
///
/// Memberships of tags not listed in `tag_ids` are ignored, and repeated
/// membership rows within a single tag count once.
pub fn duplicate_members(memberships: &[UserTagged], tag_ids: &[DbId]) -> HashSet<DbId> {
    let wanted: HashSet<DbId> = tag_ids.iter().copied().collect();
    let mut tags_per_user: HashMap<DbId, HashSet<DbId>> = HashMap::new();

    for membership in memberships {
        if wanted.contains(&membership.user_tag_id) {
            tags_per_user
                .entry(membership.user_id)
                .or_default()
                .insert(membership.user_tag_id);
        }
    }

    tags_per_user
        .into_iter()
        .filter(|(_, tags)| tags.len() > 1)
        .map(|(user_id, _)| user_id)
        .collect()
}

/// Computes the exclusion set for one annunciation.
pub struct FanoutDeduplicator {
    tags: Arc<dyn TagStore>,
}

impl FanoutDeduplicator {
    pub fn new(tags: Arc<dyn TagStore>) -> Self {
        Self { tags }
    }

    /// Users reached through more than one tag of `annunciation_id`.
    ///
    /// An annunciation with no contributing tags yields an empty set.
    pub async fn exclusions(&self, annunciation_id: DbId) -> Result<HashSet<DbId>, AppError> {
        let annunciates = self.tags.annunciates(annunciation_id).await?;
        let tag_ids: Vec<DbId> = annunciates.iter().filter_map(|a| a.user_tag_id).collect();
        self.exclusions_for_tags(&tag_ids).await
    }

    /// Users belonging to more than one of `tag_ids`.
    pub async fn exclusions_for_tags(&self, tag_ids: &[DbId]) -> Result<HashSet<DbId>, AppError> {
        if tag_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let memberships = self.tags.tag_members(tag_ids).await?;
        Ok(duplicate_members(&memberships, tag_ids))
    }
}

/// Capability shared by rows that fan a broadcast out through a user tag.
///
/// Implementors only describe which tag and receiver type they reach; the
/// counter adjustment itself is provided.
#[async_trait]
pub trait AnnunciateCapability: Send + Sync {
    fn annunciation_id(&self) -> DbId;

    fn user_tag_id(&self) -> Option<DbId>;

    fn receiver_type(&self) -> &str;

    /// Increment every fan-out bucket for this row's tag members, skipping
    /// `excluded`. Returns the number of setting rows touched.
    async fn increment_unread(
        &self,
        tx: &mut dyn FanoutTx,
        excluded: &HashSet<DbId>,
    ) -> Result<u64, AppError> {
        adjust(self, tx, excluded, CounterDelta::Increment).await
    }

    async fn decrement_unread(
        &self,
        tx: &mut dyn FanoutTx,
        excluded: &HashSet<DbId>,
    ) -> Result<u64, AppError> {
        adjust(self, tx, excluded, CounterDelta::Decrement).await
    }
}

async fn adjust<A>(
    row: &A,
    tx: &mut dyn FanoutTx,
    excluded: &HashSet<DbId>,
    delta: CounterDelta,
) -> Result<u64, AppError>
where
    A: AnnunciateCapability + ?Sized,
{
    let Some(tag_id) = row.user_tag_id() else {
        return Ok(0);
    };

    let mut touched = 0;
    for bucket in FANOUT_BUCKETS {
        touched += tx
            .adjust_tag_counter(tag_id, row.receiver_type(), excluded, bucket, delta)
            .await?;
    }
    Ok(touched)
}

impl AnnunciateCapability for Annunciate {
    fn annunciation_id(&self) -> DbId {
        self.annunciation_id
    }

    fn user_tag_id(&self) -> Option<DbId> {
        self.user_tag_id
    }

    fn receiver_type(&self) -> &str {
        &self.receiver_type
    }
}

/// Outcome of publishing or retracting a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FanoutReport {
    pub annunciation_id: DbId,
    pub tags: usize,
    pub excluded: Vec<DbId>,
    pub rows_adjusted: u64,
}

/// Publishes and retracts annunciations, keeping fan-out counters in step.
pub struct AnnunciationFanout {
    tags: Arc<dyn TagStore>,
    deduplicator: FanoutDeduplicator,
}

impl AnnunciationFanout {
    pub fn new(tags: Arc<dyn TagStore>) -> Self {
        Self {
            deduplicator: FanoutDeduplicator::new(tags.clone()),
            tags,
        }
    }

    /// Fan an annunciation out to `user_tag_ids`.
    ///
    /// The exclusion set is computed once over the whole broadcast, then the
    /// annunciate rows and each tag's increments are written in one
    /// transaction.
    pub async fn publish(
        &self,
        annunciation_id: DbId,
        receiver_type: &str,
        user_tag_ids: &[DbId],
    ) -> Result<FanoutReport, AppError> {
        let mut unique_tags: Vec<DbId> = user_tag_ids.to_vec();
        unique_tags.sort_unstable();
        unique_tags.dedup();
        if unique_tags.is_empty() {
            return Err(AppError::Validation(
                "an annunciation needs at least one user tag".to_string(),
            ));
        }
        if !self.tags.annunciates(annunciation_id).await?.is_empty() {
            return Err(AppError::Validation(format!(
                "Annunciation {} is already published",
                annunciation_id
            )));
        }

        let excluded = self.deduplicator.exclusions_for_tags(&unique_tags).await?;

        let mut tx = self.tags.begin_fanout().await?;
        let rows = tx
            .insert_annunciates(annunciation_id, receiver_type, &unique_tags)
            .await?;
        let mut rows_adjusted = 0;
        for row in &rows {
            rows_adjusted += row.increment_unread(tx.as_mut(), &excluded).await?;
        }
        tx.commit().await?;

        tracing::info!(
            annunciation_id,
            tags = rows.len(),
            excluded = excluded.len(),
            rows_adjusted,
            "Annunciation published"
        );

        Ok(report(annunciation_id, rows.len(), excluded, rows_adjusted))
    }

    /// Retract an annunciation, undoing exactly what [`publish`](Self::publish)
    /// applied: the exclusion set is computed before any row is removed, and
    /// the decrements and deletion share one transaction.
    pub async fn retract(&self, annunciation_id: DbId) -> Result<FanoutReport, AppError> {
        let rows = self.tags.annunciates(annunciation_id).await?;
        if rows.is_empty() {
            return Err(AppError::NotFound(format!(
                "Annunciation {} has no annunciates",
                annunciation_id
            )));
        }

        let excluded = self.deduplicator.exclusions(annunciation_id).await?;

        let mut tx = self.tags.begin_fanout().await?;
        let mut rows_adjusted = 0;
        for row in &rows {
            rows_adjusted += row.decrement_unread(tx.as_mut(), &excluded).await?;
        }
        tx.delete_annunciates(annunciation_id).await?;
        tx.commit().await?;

        tracing::info!(
            annunciation_id,
            tags = rows.len(),
            excluded = excluded.len(),
            rows_adjusted,
            "Annunciation retracted"
        );

        Ok(report(annunciation_id, rows.len(), excluded, rows_adjusted))
    }
}

fn report(
    annunciation_id: DbId,
    tags: usize,
    excluded: HashSet<DbId>,
    rows_adjusted: u64,
) -> FanoutReport {
    let mut excluded: Vec<DbId> = excluded.into_iter().collect();
    excluded.sort_unstable();
    FanoutReport {
        annunciation_id,
        tags,
        excluded,
        rows_adjusted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use notice_common::types::EntityRef;

    fn membership(user_tag_id: DbId, user_id: DbId) -> UserTagged {
        UserTagged {
            user_tag_id,
            user_id,
        }
    }

    fn user(id: DbId) -> EntityRef {
        EntityRef::new("User", id)
    }

    #[test]
    fn test_overlapping_tags_exclude_shared_user() {
        let memberships = vec![
            membership(1, 1),
            membership(1, 2),
            membership(2, 2),
            membership(2, 3),
        ];
        let excluded = duplicate_members(&memberships, &[1, 2]);
        assert_eq!(excluded, HashSet::from([2]));
    }

    #[test]
    fn test_single_tag_never_excludes() {
        let memberships = vec![membership(1, 1), membership(1, 2), membership(1, 1)];
        assert!(duplicate_members(&memberships, &[1]).is_empty());
    }

    #[test]
    fn test_non_contributing_tags_are_ignored() {
        // User 5 is in tags 1 and 9, but only tag 1 contributes
        let memberships = vec![membership(1, 5), membership(9, 5)];
        assert!(duplicate_members(&memberships, &[1]).is_empty());
    }

    #[tokio::test]
    async fn test_exclusions_empty_without_tags() {
        let store = Arc::new(MemoryStore::new());
        let deduplicator = FanoutDeduplicator::new(store);
        assert!(deduplicator.exclusions(404).await.unwrap().is_empty());
    }

    async fn overlapping_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        // T1 = {u1, u2}, T2 = {u2, u3}
        store.tag_user(1, 1).await;
        store.tag_user(1, 2).await;
        store.tag_user(2, 2).await;
        store.tag_user(2, 3).await;
        store
    }

    #[tokio::test]
    async fn test_publish_skips_users_in_several_tags() {
        let store = overlapping_store().await;
        let fanout = AnnunciationFanout::new(store.clone());

        let report = fanout.publish(100, "User", &[1, 2]).await.unwrap();
        assert_eq!(report.tags, 2);
        assert_eq!(report.excluded, vec![2]);

        for bucket in FANOUT_BUCKETS {
            assert_eq!(store.setting_counter(&user(1), bucket).await, 1);
            assert_eq!(store.setting_counter(&user(2), bucket).await, 0);
            assert_eq!(store.setting_counter(&user(3), bucket).await, 1);
        }
    }

    #[tokio::test]
    async fn test_retract_restores_counters() {
        let store = overlapping_store().await;
        let fanout = AnnunciationFanout::new(store.clone());

        fanout.publish(100, "User", &[1, 2]).await.unwrap();
        fanout.publish(101, "User", &[1]).await.unwrap();
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 2);

        fanout.retract(100).await.unwrap();
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 1);
        assert_eq!(store.setting_counter(&user(2), BUCKET_TOTAL).await, 1);
        assert_eq!(store.setting_counter(&user(3), BUCKET_TOTAL).await, 0);
        assert!(store.annunciates(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retract_unknown_annunciation_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let fanout = AnnunciationFanout::new(store);
        assert!(matches!(
            fanout.retract(7).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_tag_ids_fan_out_once() {
        let store = overlapping_store().await;
        let fanout = AnnunciationFanout::new(store.clone());

        let report = fanout.publish(100, "User", &[1, 1]).await.unwrap();
        assert_eq!(report.tags, 1);
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 1);
    }

    #[tokio::test]
    async fn test_republish_is_rejected() {
        let store = overlapping_store().await;
        let fanout = AnnunciationFanout::new(store.clone());

        fanout.publish(100, "User", &[1]).await.unwrap();
        assert!(matches!(
            fanout.publish(100, "User", &[2]).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            fanout.publish(101, "User", &[]).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 1);
    }

    /// Tag store whose transactions fail when adjusting `failing_tag`.
    struct FailingTags {
        inner: Arc<MemoryStore>,
        failing_tag: DbId,
    }

    struct FailingTx {
        inner: Box<dyn FanoutTx>,
        failing_tag: DbId,
    }

    #[async_trait]
    impl TagStore for FailingTags {
        async fn annunciates(&self, annunciation_id: DbId) -> Result<Vec<Annunciate>, AppError> {
            self.inner.annunciates(annunciation_id).await
        }

        async fn tag_members(&self, user_tag_ids: &[DbId]) -> Result<Vec<UserTagged>, AppError> {
            self.inner.tag_members(user_tag_ids).await
        }

        async fn begin_fanout(&self) -> Result<Box<dyn FanoutTx>, AppError> {
            Ok(Box::new(FailingTx {
                inner: self.inner.begin_fanout().await?,
                failing_tag: self.failing_tag,
            }))
        }
    }

    #[async_trait]
    impl FanoutTx for FailingTx {
        async fn insert_annunciates(
            &mut self,
            annunciation_id: DbId,
            receiver_type: &str,
            user_tag_ids: &[DbId],
        ) -> Result<Vec<Annunciate>, AppError> {
            self.inner
                .insert_annunciates(annunciation_id, receiver_type, user_tag_ids)
                .await
        }

        async fn delete_annunciates(&mut self, annunciation_id: DbId) -> Result<u64, AppError> {
            self.inner.delete_annunciates(annunciation_id).await
        }

        async fn adjust_tag_counter(
            &mut self,
            user_tag_id: DbId,
            receiver_type: &str,
            excluded: &HashSet<DbId>,
            bucket: &str,
            delta: CounterDelta,
        ) -> Result<u64, AppError> {
            if user_tag_id == self.failing_tag {
                return Err(AppError::Queue("connection reset".to_string()));
            }
            self.inner
                .adjust_tag_counter(user_tag_id, receiver_type, excluded, bucket, delta)
                .await
        }

        async fn commit(self: Box<Self>) -> Result<(), AppError> {
            self.inner.commit().await
        }
    }

    fn failing_on(store: &Arc<MemoryStore>, failing_tag: DbId) -> AnnunciationFanout {
        AnnunciationFanout::new(Arc::new(FailingTags {
            inner: store.clone(),
            failing_tag,
        }))
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_nothing_behind() {
        let store = overlapping_store().await;
        let fanout = AnnunciationFanout::new(store.clone());
        fanout.publish(50, "User", &[2]).await.unwrap();
        assert_eq!(store.setting_counter(&user(3), BUCKET_TOTAL).await, 1);

        let result = failing_on(&store, 2).publish(100, "User", &[1, 2]).await;
        assert!(matches!(result, Err(AppError::Queue(_))));
        assert!(store.annunciates(100).await.unwrap().is_empty());
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 0);
        assert_eq!(store.setting_counter(&user(3), BUCKET_TOTAL).await, 1);

        fanout.publish(100, "User", &[1, 2]).await.unwrap();
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 1);
        assert_eq!(store.setting_counter(&user(3), BUCKET_TOTAL).await, 2);

        fanout.retract(100).await.unwrap();
        assert_eq!(store.setting_counter(&user(1), BUCKET_TOTAL).await, 0);
        assert_eq!(store.setting_counter(&user(3), BUCKET_TOTAL).await, 1);
    }

    #[tokio::test]
    async fn test_failed_retract_keeps_broadcast_intact() {
        let store = overlapping_store().await;
        AnnunciationFanout::new(store.clone())
            .publish(100, "User", &[1, 2])
            .await
            .unwrap();

        let result = failing_on(&store, 2).retract(100).await;
        assert!(matches!(result, Err(AppError::Queue(_))));
        assert_eq!(store.annunciates(100).await.unwrap().len(), 2);
        for bucket in FANOUT_BUCKETS {
            assert_eq!(store.setting_counter(&user(1), bucket).await, 1);
            assert_eq!(store.setting_counter(&user(3), bucket).await, 1);
        }
    }
}
