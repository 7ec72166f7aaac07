use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Primary key type shared by every table.
pub type DbId = i64;

/// Category code used when a notification does not name one.
pub const DEFAULT_CODE: &str = "default";

/// Counter bucket holding a receiver's total unread count.
pub const BUCKET_TOTAL: &str = "total";

/// Counter bucket for official (broadcast) notices.
pub const BUCKET_OFFICIAL: &str = "official";

/// Notifiable type recorded for annunciation broadcasts.
pub const ANNUNCIATION_KIND: &str = "Annunciation";

/// Polymorphic `{kind, id}` reference to a receiver, sender or notifiable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: DbId,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: DbId) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }

    /// Socket channel addressing this receiver, e.g. `"User:42"`.
    pub fn channel(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A receiver's email opt-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptEmail {
    Accept,
    Decline,
    /// No explicit choice; the process-wide default applies.
    #[default]
    Unset,
}

impl From<Option<bool>> for AcceptEmail {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => AcceptEmail::Accept,
            Some(false) => AcceptEmail::Decline,
            None => AcceptEmail::Unset,
        }
    }
}

impl AcceptEmail {
    /// Resolve against the process default.
    pub fn resolve(self, default_send_email: bool) -> bool {
        match self {
            AcceptEmail::Accept => true,
            AcceptEmail::Decline => false,
            AcceptEmail::Unset => default_send_email,
        }
    }
}

/// Read state of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadState {
    Unread,
    Read,
}

/// A notification addressed to one receiver.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: DbId,
    pub receiver_type: String,
    pub receiver_id: DbId,
    pub sender_type: Option<String>,
    pub sender_id: Option<DbId>,
    pub notifiable_type: Option<String>,
    pub notifiable_id: Option<DbId>,
    pub code: String,
    pub title: Option<String>,
    pub body: Option<String>,
    pub link: Option<String>,
    pub cc_emails: Vec<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub sending_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn receiver(&self) -> EntityRef {
        EntityRef::new(self.receiver_type.clone(), self.receiver_id)
    }

    pub fn sender(&self) -> Option<EntityRef> {
        match (&self.sender_type, self.sender_id) {
            (Some(kind), Some(id)) => Some(EntityRef::new(kind.clone(), id)),
            _ => None,
        }
    }

    pub fn notifiable(&self) -> Option<EntityRef> {
        match (&self.notifiable_type, self.notifiable_id) {
            (Some(kind), Some(id)) => Some(EntityRef::new(kind.clone(), id)),
            _ => None,
        }
    }

    pub fn state(&self) -> ReadState {
        if self.read_at.is_none() {
            ReadState::Unread
        } else {
            ReadState::Read
        }
    }

    pub fn is_unread(&self) -> bool {
        self.state() == ReadState::Unread
    }

    /// The instant delivery is deferred to, if it lies after `now`.
    pub fn deferred_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.sending_at.filter(|at| *at > now)
    }
}

/// Fields supplied by the caller creating a notification.
///
/// Title, body and link arrive already rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub receiver: EntityRef,
    #[serde(default)]
    pub sender: Option<EntityRef>,
    #[serde(default)]
    pub notifiable: Option<EntityRef>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub cc_emails: Vec<String>,
    #[serde(default)]
    pub sending_at: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub fn to(receiver: EntityRef) -> Self {
        Self {
            receiver,
            sender: None,
            notifiable: None,
            code: None,
            title: None,
            body: None,
            link: None,
            cc_emails: Vec::new(),
            sending_at: None,
        }
    }

    pub fn code(&self) -> &str {
        self.code
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CODE)
    }
}

/// A receiver's notification-setting row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationSetting {
    pub id: DbId,
    pub receiver_type: String,
    pub receiver_id: DbId,
    pub code: String,
    pub accept_email: Option<bool>,
    pub showtime: Option<bool>,
    pub counters: sqlx::types::Json<BTreeMap<String, i64>>,
    pub updated_at: DateTime<Utc>,
}

/// Settings as seen by the dispatcher: a resolved row or system defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveSettings {
    pub accept_email: AcceptEmail,
    pub showtime: Option<bool>,
    pub counters: BTreeMap<String, i64>,
}

impl From<NotificationSetting> for EffectiveSettings {
    fn from(row: NotificationSetting) -> Self {
        Self {
            accept_email: AcceptEmail::from(row.accept_email),
            showtime: row.showtime,
            counters: row.counters.0,
        }
    }
}

impl EffectiveSettings {
    pub fn counter(&self, bucket: &str) -> i64 {
        self.counters.get(bucket).copied().unwrap_or(0)
    }
}

/// Membership of one user in one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserTagged {
    pub user_tag_id: DbId,
    pub user_id: DbId,
}

/// One broadcast reaching one receiver type through one tag.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Annunciate {
    pub id: DbId,
    pub annunciation_id: DbId,
    pub user_tag_id: Option<DbId>,
    pub receiver_type: String,
    pub created_at: DateTime<Utc>,
}

/// Listing order for notification queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Newest => "id DESC",
            SortOrder::Oldest => "id ASC",
        }
    }
}

/// Read-state filter for notification queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFilter {
    #[default]
    All,
    Unread,
    Read,
}

impl ReadFilter {
    /// Extra `WHERE` clause narrowing rows by `read_at`.
    pub fn as_sql(self) -> &'static str {
        match self {
            ReadFilter::All => "",
            ReadFilter::Unread => "AND read_at IS NULL",
            ReadFilter::Read => "AND read_at IS NOT NULL",
        }
    }

    pub fn matches(self, notification: &Notification) -> bool {
        match self {
            ReadFilter::All => true,
            ReadFilter::Unread => notification.is_unread(),
            ReadFilter::Read => !notification.is_unread(),
        }
    }
}

/// Payload pushed on a receiver's socket channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketPayload {
    pub id: DbId,
    pub body: String,
    pub count: i64,
    pub link: String,
    pub showtime: Option<bool>,
}
