//! Lookup registries keyed by polymorphic kind.
//!
//! - [`ReceiverRegistry`] resolves a `{kind, id}` receiver reference to a
//!   live recipient through a lookup registered for that kind.
//! - [`NotifyRegistry`] holds per-notifiable-type, per-code delivery
//!   overrides (custom mailer entry point, static CC addresses).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;

use notice_common::error::AppError;
use notice_common::types::{DbId, EntityRef};

/// A resolved receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub entity: EntityRef,
    pub email: Option<String>,
}

/// Resolves ids of one receiver kind.
#[async_trait]
pub trait ReceiverLookup: Send + Sync {
    async fn find(&self, id: DbId) -> Result<Option<Recipient>, AppError>;
}

/// Looks receivers up in a table with `id` and `email` columns.
pub struct TableLookup {
    pool: PgPool,
    kind: String,
    query: String,
}

impl TableLookup {
    pub fn new(pool: PgPool, kind: impl Into<String>, table: &str) -> Result<Self, AppError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(AppError::Config(format!("Invalid receiver table name '{}'", table)));
        }
        Ok(Self {
            pool,
            kind: kind.into(),
            query: format!("SELECT id, email FROM {} WHERE id = $1", table),
        })
    }
}

#[async_trait]
impl ReceiverLookup for TableLookup {
    async fn find(&self, id: DbId) -> Result<Option<Recipient>, AppError> {
        let row: Option<(DbId, Option<String>)> = sqlx::query_as(&self.query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id, email)| Recipient {
            entity: EntityRef::new(self.kind.clone(), id),
            email,
        }))
    }
}

/// Fixed set of receivers, for tests and tooling.
#[derive(Default)]
pub struct StaticLookup {
    kind: String,
    emails: HashMap<DbId, Option<String>>,
}

impl StaticLookup {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            emails: HashMap::new(),
        }
    }

    pub fn with(mut self, id: DbId, email: Option<&str>) -> Self {
        self.emails.insert(id, email.map(str::to_string));
        self
    }
}

#[async_trait]
impl ReceiverLookup for StaticLookup {
    async fn find(&self, id: DbId) -> Result<Option<Recipient>, AppError> {
        Ok(self.emails.get(&id).map(|email| Recipient {
            entity: EntityRef::new(self.kind.clone(), id),
            email: email.clone(),
        }))
    }
}

/// Per-kind receiver lookups.
#[derive(Default, Clone)]
pub struct ReceiverRegistry {
    lookups: HashMap<String, Arc<dyn ReceiverLookup>>,
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: impl Into<String>, lookup: Arc<dyn ReceiverLookup>) -> Self {
        self.lookups.insert(kind.into(), lookup);
        self
    }

    /// `None` when the kind has no registered lookup or the id does not exist.
    pub async fn resolve(&self, receiver: &EntityRef) -> Result<Option<Recipient>, AppError> {
        let Some(lookup) = self.lookups.get(&receiver.kind) else {
            tracing::debug!(receiver = %receiver, "No lookup registered for receiver kind");
            return Ok(None);
        };
        lookup.find(receiver.id).await
    }
}

/// Delivery override for one notifiable type and code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotifySetting {
    /// Name of a registered mail handler replacing the generic notifier.
    #[serde(default)]
    pub mailer: Option<String>,
    /// Entry point on that handler (default: `"notify"`).
    #[serde(default)]
    pub mailer_method: Option<String>,
    /// Addresses copied on every email of this kind.
    #[serde(default)]
    pub cc_emails: Vec<String>,
}

/// Overrides keyed by notifiable type, then code.
///
/// Loaded from JSON shaped like
/// `{"Order": {"paid": {"mailer": "order_mailer", "cc_emails": ["ops@example.com"]}}}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct NotifyRegistry {
    entries: HashMap<String, HashMap<String, NotifySetting>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        notifiable_type: impl Into<String>,
        code: impl Into<String>,
        setting: NotifySetting,
    ) -> Self {
        self.entries
            .entry(notifiable_type.into())
            .or_default()
            .insert(code.into(), setting);
        self
    }

    pub fn get(&self, notifiable_type: Option<&str>, code: &str) -> Option<&NotifySetting> {
        self.entries.get(notifiable_type?)?.get(code)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let registry: Self = serde_json::from_str(&raw)?;
        tracing::info!(
            path = %path.as_ref().display(),
            types = registry.entries.len(),
            "Notify registry loaded"
        );
        Ok(registry)
    }
}
