//! In-process implementation of the store seams.
//!
//! Mirrors the conditional-update semantics of [`super::PgStore`] so the
//! lifecycle and fan-out logic can be exercised without a database.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use notice_common::error::AppError;
use notice_common::types::{
    Annunciate, DEFAULT_CODE, DbId, EntityRef, NewNotification, Notification,
    NotificationSetting, SortOrder, UserTagged,
};

use super::{CounterDelta, FanoutTx, ListQuery, NotificationStore, SettingsStore, TagStore};

#[derive(Default, Clone)]
struct Tables {
    next_id: DbId,
    notifications: BTreeMap<DbId, Notification>,
    settings: Vec<NotificationSetting>,
    memberships: Vec<UserTagged>,
    annunciates: Vec<Annunciate>,
}

impl Tables {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user_id` to tag `user_tag_id`.
    pub async fn tag_user(&self, user_tag_id: DbId, user_id: DbId) {
        self.tables.lock().await.memberships.push(UserTagged {
            user_tag_id,
            user_id,
        });
    }

    /// Insert or replace a receiver's setting row for `code`.
    pub async fn put_setting(
        &self,
        receiver: &EntityRef,
        code: &str,
        accept_email: Option<bool>,
        showtime: Option<bool>,
    ) {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .settings
            .iter_mut()
            .find(|s| s.receiver_type == receiver.kind && s.receiver_id == receiver.id && s.code == code)
        {
            existing.accept_email = accept_email;
            existing.showtime = showtime;
            return;
        }
        let id = tables.next_id();
        tables.settings.push(NotificationSetting {
            id,
            receiver_type: receiver.kind.clone(),
            receiver_id: receiver.id,
            code: code.to_string(),
            accept_email,
            showtime,
            counters: sqlx::types::Json(BTreeMap::new()),
            updated_at: Utc::now(),
        });
    }

    /// Current value of a fan-out bucket on the receiver's default row.
    pub async fn setting_counter(&self, receiver: &EntityRef, bucket: &str) -> i64 {
        self.tables
            .lock()
            .await
            .settings
            .iter()
            .find(|s| {
                s.receiver_type == receiver.kind
                    && s.receiver_id == receiver.id
                    && s.code == DEFAULT_CODE
            })
            .and_then(|s| s.counters.0.get(bucket).copied())
            .unwrap_or(0)
    }

    /// Overwrite `read_at` directly, bypassing the lifecycle.
    pub async fn force_read_at(&self, id: DbId, read_at: Option<DateTime<Utc>>) {
        if let Some(row) = self.tables.lock().await.notifications.get_mut(&id) {
            row.read_at = read_at;
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let mut tables = self.tables.lock().await;
        let id = tables.next_id();
        let notification = Notification {
            id,
            receiver_type: new.receiver.kind.clone(),
            receiver_id: new.receiver.id,
            sender_type: new.sender.as_ref().map(|s| s.kind.clone()),
            sender_id: new.sender.as_ref().map(|s| s.id),
            notifiable_type: new.notifiable.as_ref().map(|n| n.kind.clone()),
            notifiable_id: new.notifiable.as_ref().map(|n| n.id),
            code: new.code().to_string(),
            title: new.title.clone(),
            body: new.body.clone(),
            link: new.link.clone(),
            cc_emails: new.cc_emails.clone(),
            read_at: None,
            sent_at: None,
            sending_at: new.sending_at,
            created_at: Utc::now(),
        };
        tables.notifications.insert(id, notification.clone());
        Ok(notification)
    }

    async fn find(&self, id: DbId) -> Result<Option<Notification>, AppError> {
        Ok(self.tables.lock().await.notifications.get(&id).cloned())
    }

    async fn delete(&self, id: DbId) -> Result<Option<Notification>, AppError> {
        Ok(self.tables.lock().await.notifications.remove(&id))
    }

    async fn mark_read(&self, id: DbId, at: DateTime<Utc>) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        match tables.notifications.get_mut(&id) {
            Some(row) if row.read_at.is_none() => {
                row.read_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_unread(&self, id: DbId) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        match tables.notifications.get_mut(&id) {
            Some(row) if row.read_at.is_some() => {
                row.read_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_all_read(
        &self,
        receiver: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError> {
        let mut tables = self.tables.lock().await;
        let mut codes = Vec::new();
        for row in tables.notifications.values_mut() {
            if row.receiver() == *receiver && row.read_at.is_none() {
                row.read_at = Some(at);
                codes.push(row.code.clone());
            }
        }
        Ok(codes)
    }

    async fn mark_sent(&self, id: DbId, at: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(row) = self.tables.lock().await.notifications.get_mut(&id) {
            row.sent_at = Some(at);
        }
        Ok(())
    }

    async fn count_unread(
        &self,
        receiver: &EntityRef,
        code: Option<&str>,
    ) -> Result<i64, AppError> {
        let tables = self.tables.lock().await;
        let count = tables
            .notifications
            .values()
            .filter(|row| row.receiver() == *receiver && row.is_unread())
            .filter(|row| code.is_none_or(|c| row.code == c))
            .count();
        Ok(count as i64)
    }

    async fn list(
        &self,
        receiver: &EntityRef,
        query: &ListQuery,
    ) -> Result<Vec<Notification>, AppError> {
        let tables = self.tables.lock().await;
        let matching = tables
            .notifications
            .values()
            .filter(|row| row.receiver() == *receiver)
            .filter(|row| query.status.matches(row))
            .filter(|row| query.code.as_deref().is_none_or(|c| row.code == c));

        let ordered: Vec<&Notification> = match query.sort {
            SortOrder::Newest => matching.rev().collect(),
            SortOrder::Oldest => matching.collect(),
        };

        Ok(ordered
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn receivers(&self) -> Result<Vec<EntityRef>, AppError> {
        let tables = self.tables.lock().await;
        let mut receivers: Vec<EntityRef> =
            tables.notifications.values().map(|row| row.receiver()).collect();
        receivers.sort();
        receivers.dedup();
        Ok(receivers)
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn find_setting(
        &self,
        receiver: &EntityRef,
        code: &str,
    ) -> Result<Option<NotificationSetting>, AppError> {
        let tables = self.tables.lock().await;
        let for_receiver = |wanted: &str| {
            tables
                .settings
                .iter()
                .find(|s| {
                    s.receiver_type == receiver.kind
                        && s.receiver_id == receiver.id
                        && s.code == wanted
                })
                .cloned()
        };
        Ok(for_receiver(code).or_else(|| for_receiver(DEFAULT_CODE)))
    }
}

#[async_trait]
impl TagStore for MemoryStore {
    async fn annunciates(&self, annunciation_id: DbId) -> Result<Vec<Annunciate>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .annunciates
            .iter()
            .filter(|a| a.annunciation_id == annunciation_id)
            .cloned()
            .collect())
    }

    async fn tag_members(&self, user_tag_ids: &[DbId]) -> Result<Vec<UserTagged>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .memberships
            .iter()
            .filter(|m| user_tag_ids.contains(&m.user_tag_id))
            .cloned()
            .collect())
    }

    async fn begin_fanout(&self) -> Result<Box<dyn FanoutTx>, AppError> {
        let tables = self.tables.clone().lock_owned().await;
        let snapshot = tables.clone();
        Ok(Box::new(MemoryFanoutTx {
            tables,
            snapshot: Some(snapshot),
        }))
    }
}

/// Holds the store lock for the whole transaction; restores the snapshot
/// taken at begin unless committed.
pub struct MemoryFanoutTx {
    tables: OwnedMutexGuard<Tables>,
    snapshot: Option<Tables>,
}

impl Drop for MemoryFanoutTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.tables = snapshot;
        }
    }
}

#[async_trait]
impl FanoutTx for MemoryFanoutTx {
    async fn insert_annunciates(
        &mut self,
        annunciation_id: DbId,
        receiver_type: &str,
        user_tag_ids: &[DbId],
    ) -> Result<Vec<Annunciate>, AppError> {
        let tables = &mut *self.tables;
        let mut inserted = Vec::with_capacity(user_tag_ids.len());
        for tag_id in user_tag_ids {
            let id = tables.next_id();
            let row = Annunciate {
                id,
                annunciation_id,
                user_tag_id: Some(*tag_id),
                receiver_type: receiver_type.to_string(),
                created_at: Utc::now(),
            };
            tables.annunciates.push(row.clone());
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn delete_annunciates(&mut self, annunciation_id: DbId) -> Result<u64, AppError> {
        let tables = &mut *self.tables;
        let before = tables.annunciates.len();
        tables
            .annunciates
            .retain(|a| a.annunciation_id != annunciation_id);
        Ok((before - tables.annunciates.len()) as u64)
    }

    async fn adjust_tag_counter(
        &mut self,
        user_tag_id: DbId,
        receiver_type: &str,
        excluded: &HashSet<DbId>,
        bucket: &str,
        delta: CounterDelta,
    ) -> Result<u64, AppError> {
        let tables = &mut *self.tables;

        let members: HashSet<DbId> = tables
            .memberships
            .iter()
            .filter(|m| m.user_tag_id == user_tag_id && !excluded.contains(&m.user_id))
            .map(|m| m.user_id)
            .collect();

        let mut adjusted = 0;
        for user_id in members {
            let position = tables.settings.iter().position(|s| {
                s.receiver_type == receiver_type && s.receiver_id == user_id && s.code == DEFAULT_CODE
            });

            match (position, delta) {
                (Some(index), CounterDelta::Increment) => {
                    *tables.settings[index].counters.0.entry(bucket.to_string()).or_insert(0) += 1;
                    adjusted += 1;
                }
                (None, CounterDelta::Increment) => {
                    let id = tables.next_id();
                    tables.settings.push(NotificationSetting {
                        id,
                        receiver_type: receiver_type.to_string(),
                        receiver_id: user_id,
                        code: DEFAULT_CODE.to_string(),
                        accept_email: None,
                        showtime: None,
                        counters: sqlx::types::Json(BTreeMap::from([(bucket.to_string(), 1)])),
                        updated_at: Utc::now(),
                    });
                    adjusted += 1;
                }
                (Some(index), CounterDelta::Decrement) => {
                    if let Some(value) = tables.settings[index].counters.0.get_mut(bucket)
                        && *value > 0
                    {
                        *value -= 1;
                        adjusted += 1;
                    }
                }
                (None, CounterDelta::Decrement) => {}
            }
        }

        Ok(adjusted)
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notice_common::types::ReadFilter;

    fn user(id: DbId) -> EntityRef {
        EntityRef::new("User", id)
    }

    #[tokio::test]
    async fn test_conditional_read_transitions() {
        let store = MemoryStore::new();
        let n = store.insert(&NewNotification::to(user(1))).await.unwrap();

        assert!(store.mark_read(n.id, Utc::now()).await.unwrap());
        assert!(!store.mark_read(n.id, Utc::now()).await.unwrap());
        assert!(store.mark_unread(n.id).await.unwrap());
        assert!(!store.mark_unread(n.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_setting_falls_back_to_default_code() {
        let store = MemoryStore::new();
        store.put_setting(&user(1), DEFAULT_CODE, Some(false), Some(true)).await;

        let found = store.find_setting(&user(1), "order_paid").await.unwrap().unwrap();
        assert_eq!(found.code, DEFAULT_CODE);

        store.put_setting(&user(1), "order_paid", Some(true), None).await;
        let found = store.find_setting(&user(1), "order_paid").await.unwrap().unwrap();
        assert_eq!(found.code, "order_paid");
        assert_eq!(found.accept_email, Some(true));
    }

    #[tokio::test]
    async fn test_list_sort_order_and_filters() {
        let store = MemoryStore::new();
        let first = store.insert(&NewNotification::to(user(1))).await.unwrap();
        let second = store.insert(&NewNotification::to(user(1))).await.unwrap();
        store.insert(&NewNotification::to(user(2))).await.unwrap();
        store.mark_read(first.id, Utc::now()).await.unwrap();

        let newest = store.list(&user(1), &ListQuery::default()).await.unwrap();
        assert_eq!(
            newest.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );

        let oldest_unread = store
            .list(
                &user(1),
                &ListQuery {
                    status: ReadFilter::Unread,
                    sort: SortOrder::Oldest,
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(oldest_unread.len(), 1);
        assert_eq!(oldest_unread[0].id, second.id);

        let read = store
            .list(
                &user(1),
                &ListQuery {
                    status: ReadFilter::Read,
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(read.iter().map(|n| n.id).collect::<Vec<_>>(), vec![first.id]);
    }

    #[tokio::test]
    async fn test_decrement_on_missing_bucket_is_noop() {
        let store = MemoryStore::new();
        store.tag_user(1, 10).await;
        store.put_setting(&user(10), DEFAULT_CODE, None, None).await;

        let mut tx = store.begin_fanout().await.unwrap();
        let adjusted = tx
            .adjust_tag_counter(1, "User", &HashSet::new(), "official", CounterDelta::Decrement)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(adjusted, 0);
        assert_eq!(store.setting_counter(&user(10), "official").await, 0);
    }

    #[tokio::test]
    async fn test_uncommitted_fanout_is_discarded() {
        let store = MemoryStore::new();
        store.tag_user(1, 10).await;

        let mut tx = store.begin_fanout().await.unwrap();
        tx.insert_annunciates(5, "User", &[1]).await.unwrap();
        tx.adjust_tag_counter(1, "User", &HashSet::new(), "total", CounterDelta::Increment)
            .await
            .unwrap();
        drop(tx);

        assert!(store.annunciates(5).await.unwrap().is_empty());
        assert_eq!(store.setting_counter(&user(10), "total").await, 0);

        let mut tx = store.begin_fanout().await.unwrap();
        tx.insert_annunciates(5, "User", &[1]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.annunciates(5).await.unwrap().len(), 1);
    }
}
