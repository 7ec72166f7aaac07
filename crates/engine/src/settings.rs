//! Notification settings resolver.

use std::sync::Arc;

use notice_common::error::AppError;
use notice_common::types::{EffectiveSettings, EntityRef};

use crate::store::SettingsStore;

/// Resolves the settings that apply to a receiver for one category.
#[derive(Clone)]
pub struct SettingsResolver {
    store: Arc<dyn SettingsStore>,
}

impl SettingsResolver {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Category-specific row, else the receiver's default row, else system
    /// defaults. A missing row is never an error.
    pub async fn resolve(
        &self,
        receiver: &EntityRef,
        code: &str,
    ) -> Result<EffectiveSettings, AppError> {
        let setting = self.store.find_setting(receiver, code).await?;
        Ok(setting.map(EffectiveSettings::from).unwrap_or_default())
    }
}
