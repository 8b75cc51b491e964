//! Keys shared by the floatone windows.

use floatone_ipc::{ConfigPatch, FloatOneConfig, RotateInterval, Theme};

use crate::error::{SchemaError, StoreError};
use crate::schema::{Key, Schema, StoreValue};
use crate::store::Store;

impl StoreValue for FloatOneConfig {
    fn validate(&self) -> Result<(), String> {
        FloatOneConfig::validate(self)
    }
}

impl StoreValue for RotateInterval {
    fn validate(&self) -> Result<(), String> {
        RotateInterval::validate(*self)
    }
}

impl StoreValue for Theme {}

/// Settings edited in the settings window, read by the tip bar
pub const CONFIG: Key<FloatOneConfig> = Key::persisted("config", FloatOneConfig::default);

/// Set once an update has been downloaded; forgotten on restart
pub const NEW_VERSION_DOWNLOADED: Key<bool> = Key::memory("newVersionDownloaded", bool::default);

pub fn app_schema() -> Result<Schema, SchemaError> {
    Schema::builder()
        .key(CONFIG)
        .key(NEW_VERSION_DOWNLOADED)
        .build()
}

/// Merge `patch` over the current config and store the result
pub async fn update_config(
    store: &Store,
    patch: &ConfigPatch,
) -> Result<FloatOneConfig, StoreError> {
    let current = store.get(&CONFIG)?;
    let updated = patch.apply(&current);
    store.set(&CONFIG, updated.clone()).await?;
    Ok(updated)
}
