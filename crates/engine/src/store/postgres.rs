//! PostgreSQL implementation of the store seams.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use notice_common::error::AppError;
use notice_common::types::{
    Annunciate, DEFAULT_CODE, DbId, EntityRef, NewNotification, Notification,
    NotificationSetting, UserTagged,
};

use super::{CounterDelta, FanoutTx, ListQuery, NotificationStore, SettingsStore, TagStore};

/// Column list for `notifications` queries.
const NOTIFICATION_COLUMNS: &str = "id, receiver_type, receiver_id, sender_type, sender_id, \
    notifiable_type, notifiable_id, code, title, body, link, cc_emails, \
    read_at, sent_at, sending_at, created_at";

/// Column list for `notification_settings` queries.
const SETTING_COLUMNS: &str =
    "id, receiver_type, receiver_id, code, accept_email, showtime, counters, updated_at";

/// Postgres-backed store shared by the lifecycle, resolver and fan-out.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let query = format!(
            "INSERT INTO notifications \
                (receiver_type, receiver_id, sender_type, sender_id, notifiable_type, \
                 notifiable_id, code, title, body, link, cc_emails, sending_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(&new.receiver.kind)
            .bind(new.receiver.id)
            .bind(new.sender.as_ref().map(|s| s.kind.as_str()))
            .bind(new.sender.as_ref().map(|s| s.id))
            .bind(new.notifiable.as_ref().map(|n| n.kind.as_str()))
            .bind(new.notifiable.as_ref().map(|n| n.id))
            .bind(new.code())
            .bind(&new.title)
            .bind(&new.body)
            .bind(&new.link)
            .bind(&new.cc_emails)
            .bind(new.sending_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(notification)
    }

    async fn find(&self, id: DbId) -> Result<Option<Notification>, AppError> {
        let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1");
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(notification)
    }

    async fn delete(&self, id: DbId) -> Result<Option<Notification>, AppError> {
        let query =
            format!("DELETE FROM notifications WHERE id = $1 RETURNING {NOTIFICATION_COLUMNS}");
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(notification)
    }

    async fn mark_read(&self, id: DbId, at: DateTime<Utc>) -> Result<bool, AppError> {
        let result =
            sqlx::query("UPDATE notifications SET read_at = $2 WHERE id = $1 AND read_at IS NULL")
                .bind(id)
                .bind(at)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_unread(&self, id: DbId) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE notifications SET read_at = NULL WHERE id = $1 AND read_at IS NOT NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(
        &self,
        receiver: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, AppError> {
        let codes: Vec<String> = sqlx::query_scalar(
            "UPDATE notifications SET read_at = $3 \
             WHERE receiver_type = $1 AND receiver_id = $2 AND read_at IS NULL \
             RETURNING code",
        )
        .bind(&receiver.kind)
        .bind(receiver.id)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(codes)
    }

    async fn mark_sent(&self, id: DbId, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE notifications SET sent_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_unread(
        &self,
        receiver: &EntityRef,
        code: Option<&str>,
    ) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications \
             WHERE receiver_type = $1 AND receiver_id = $2 AND read_at IS NULL \
               AND ($3::text IS NULL OR code = $3)",
        )
        .bind(&receiver.kind)
        .bind(receiver.id)
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list(
        &self,
        receiver: &EntityRef,
        query: &ListQuery,
    ) -> Result<Vec<Notification>, AppError> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
             WHERE receiver_type = $1 AND receiver_id = $2 {} \
               AND ($3::text IS NULL OR code = $3) \
             ORDER BY {} \
             LIMIT $4 OFFSET $5",
            query.status.as_sql(),
            query.sort.as_sql()
        );
        let rows = sqlx::query_as::<_, Notification>(&sql)
            .bind(&receiver.kind)
            .bind(receiver.id)
            .bind(query.code.as_deref())
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn receivers(&self) -> Result<Vec<EntityRef>, AppError> {
        let rows: Vec<(String, DbId)> = sqlx::query_as(
            "SELECT DISTINCT receiver_type, receiver_id FROM notifications \
             ORDER BY receiver_type, receiver_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(kind, id)| EntityRef::new(kind, id))
            .collect())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn find_setting(
        &self,
        receiver: &EntityRef,
        code: &str,
    ) -> Result<Option<NotificationSetting>, AppError> {
        let query = format!(
            "SELECT {SETTING_COLUMNS} FROM notification_settings \
             WHERE receiver_type = $1 AND receiver_id = $2 AND code IN ($3, $4) \
             ORDER BY (code = $3) DESC, id ASC \
             LIMIT 1"
        );
        let setting = sqlx::query_as::<_, NotificationSetting>(&query)
            .bind(&receiver.kind)
            .bind(receiver.id)
            .bind(code)
            .bind(DEFAULT_CODE)
            .fetch_optional(&self.pool)
            .await?;
        Ok(setting)
    }
}

#[async_trait]
impl TagStore for PgStore {
    async fn annunciates(&self, annunciation_id: DbId) -> Result<Vec<Annunciate>, AppError> {
        let rows = sqlx::query_as::<_, Annunciate>(
            "SELECT id, annunciation_id, user_tag_id, receiver_type, created_at \
             FROM annunciates WHERE annunciation_id = $1 ORDER BY id",
        )
        .bind(annunciation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn tag_members(&self, user_tag_ids: &[DbId]) -> Result<Vec<UserTagged>, AppError> {
        if user_tag_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, UserTagged>(
            "SELECT user_tag_id, user_id FROM user_taggeds WHERE user_tag_id = ANY($1)",
        )
        .bind(user_tag_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn begin_fanout(&self) -> Result<Box<dyn FanoutTx>, AppError> {
        Ok(Box::new(PgFanoutTx {
            tx: self.pool.begin().await?,
        }))
    }
}

/// A publish or retract running in one database transaction.
pub struct PgFanoutTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl FanoutTx for PgFanoutTx {
    async fn insert_annunciates(
        &mut self,
        annunciation_id: DbId,
        receiver_type: &str,
        user_tag_ids: &[DbId],
    ) -> Result<Vec<Annunciate>, AppError> {
        let rows = sqlx::query_as::<_, Annunciate>(
            "INSERT INTO annunciates (annunciation_id, user_tag_id, receiver_type) \
             SELECT $1, tag_id, $2 FROM UNNEST($3::bigint[]) AS tag_id \
             RETURNING id, annunciation_id, user_tag_id, receiver_type, created_at",
        )
        .bind(annunciation_id)
        .bind(receiver_type)
        .bind(user_tag_ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn delete_annunciates(&mut self, annunciation_id: DbId) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM annunciates WHERE annunciation_id = $1")
            .bind(annunciation_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn adjust_tag_counter(
        &mut self,
        user_tag_id: DbId,
        receiver_type: &str,
        excluded: &HashSet<DbId>,
        bucket: &str,
        delta: CounterDelta,
    ) -> Result<u64, AppError> {
        let excluded: Vec<DbId> = excluded.iter().copied().collect();

        let result = match delta {
            CounterDelta::Increment => {
                sqlx::query(
                    r#"
                    INSERT INTO notification_settings (receiver_type, receiver_id, code, counters)
                    SELECT $1, members.user_id, $5, jsonb_build_object($3::text, 1)
                    FROM (
                        SELECT DISTINCT user_id FROM user_taggeds
                        WHERE user_tag_id = $2 AND NOT (user_id = ANY($4))
                    ) AS members
                    ON CONFLICT (receiver_type, receiver_id, code) DO UPDATE
                    SET counters = jsonb_set(
                            notification_settings.counters,
                            ARRAY[$3::text],
                            to_jsonb(COALESCE((notification_settings.counters ->> $3::text)::bigint, 0) + 1)
                        ),
                        updated_at = NOW()
                    "#,
                )
                .bind(receiver_type)
                .bind(user_tag_id)
                .bind(bucket)
                .bind(&excluded)
                .bind(DEFAULT_CODE)
                .execute(&mut *self.tx)
                .await?
            }
            CounterDelta::Decrement => {
                sqlx::query(
                    r#"
                    UPDATE notification_settings
                    SET counters = jsonb_set(
                            counters,
                            ARRAY[$3::text],
                            to_jsonb(GREATEST(COALESCE((counters ->> $3::text)::bigint, 0) - 1, 0))
                        ),
                        updated_at = NOW()
                    WHERE receiver_type = $1
                      AND code = $5
                      AND receiver_id IN (SELECT user_id FROM user_taggeds WHERE user_tag_id = $2)
                      AND NOT (receiver_id = ANY($4))
                      AND COALESCE((counters ->> $3::text)::bigint, 0) > 0
                    "#,
                )
                .bind(receiver_type)
                .bind(user_tag_id)
                .bind(bucket)
                .bind(&excluded)
                .bind(DEFAULT_CODE)
                .execute(&mut *self.tx)
                .await?
            }
        };

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx.commit().await?;
        Ok(())
    }
}
