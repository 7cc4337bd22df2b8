//! Persisted `Setting` rows: feature toggles and the tunable constants of the
//! quality gate and sync simulation.

use std::time::Duration;

use r2d2_sqlite::rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{IntakeError, Result};
use crate::gate::GateConfig;
use crate::logging::{self, LogAction};
use crate::session::Session;
use crate::store::{Record, Store, Tx};

pub const ADMIN_PIN_DIGEST: &str = "admin.pin_digest";
pub const QUALITY_CHECK: &str = "gate.quality_check";
pub const MIN_LONG_EDGE: &str = "gate.min_long_edge";
pub const MAX_LONG_EDGE: &str = "gate.max_long_edge";
pub const SCORE_LONG_EDGE: &str = "gate.score_long_edge";
pub const BLUR_THRESHOLD: &str = "gate.blur_threshold";
pub const JPEG_QUALITY: &str = "gate.jpeg_quality";
pub const ROTATE_QUALITY: &str = "gate.rotate_quality";
/// Wait paid once per sync pass by the simulated uploader, not per page.
pub const SYNC_DELAY_MS: &str = "sync.simulated_delay_ms";

pub const DEFAULT_SYNC_DELAY_MS: u64 = 800;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: Value,
}

impl Setting {
    pub fn new(key: &str, value: Value) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}

impl Record for Setting {
    const COLLECTION: &'static str = "settings";

    fn key(&self) -> &str {
        &self.key
    }
}

fn defaults() -> Vec<(&'static str, Value)> {
    let gate = GateConfig::default();
    vec![
        (QUALITY_CHECK, json!(gate.quality_check)),
        (MIN_LONG_EDGE, json!(gate.min_long_edge)),
        (MAX_LONG_EDGE, json!(gate.max_long_edge)),
        (SCORE_LONG_EDGE, json!(gate.score_long_edge)),
        (BLUR_THRESHOLD, json!(gate.blur_threshold)),
        (JPEG_QUALITY, json!(gate.jpeg_quality)),
        (ROTATE_QUALITY, json!(gate.rotate_quality)),
        (SYNC_DELAY_MS, json!(DEFAULT_SYNC_DELAY_MS)),
    ]
}

/// Insert defaults for missing keys; existing values are left alone.
pub fn seed_defaults(conn: &Connection) -> anyhow::Result<()> {
    let tx = Tx::new(conn);
    for (key, value) in defaults() {
        if !tx.exists::<Setting>(key)? {
            tx.add(&Setting::new(key, value))?;
        }
    }
    Ok(())
}

/// Typed read with a fallback for missing or malformed values.
pub fn read_or<T: DeserializeOwned>(tx: &Tx<'_>, key: &str, default: T) -> Result<T> {
    let Some(setting) = tx.get::<Setting>(key)? else {
        return Ok(default);
    };
    match serde_json::from_value(setting.value) {
        Ok(value) => Ok(value),
        Err(err) => {
            log::warn!("setting {key} is malformed ({err}), using default");
            Ok(default)
        }
    }
}

pub fn gate_config(tx: &Tx<'_>) -> Result<GateConfig> {
    let d = GateConfig::default();
    Ok(GateConfig {
        quality_check: read_or(tx, QUALITY_CHECK, d.quality_check)?,
        min_long_edge: read_or(tx, MIN_LONG_EDGE, d.min_long_edge)?,
        max_long_edge: read_or(tx, MAX_LONG_EDGE, d.max_long_edge)?,
        score_long_edge: read_or(tx, SCORE_LONG_EDGE, d.score_long_edge)?,
        blur_threshold: read_or(tx, BLUR_THRESHOLD, d.blur_threshold)?,
        jpeg_quality: read_or(tx, JPEG_QUALITY, d.jpeg_quality)?,
        rotate_quality: read_or(tx, ROTATE_QUALITY, d.rotate_quality)?,
    })
}

pub fn sync_delay(tx: &Tx<'_>) -> Result<Duration> {
    Ok(Duration::from_millis(read_or(
        tx,
        SYNC_DELAY_MS,
        DEFAULT_SYNC_DELAY_MS,
    )?))
}

pub async fn load_gate_config(store: &Store) -> Result<GateConfig> {
    store.read(|tx| gate_config(tx)).await
}

pub async fn get(store: &Store, key: &str) -> Result<Option<Value>> {
    if key == ADMIN_PIN_DIGEST {
        return Ok(None);
    }
    Ok(store.get::<Setting>(key).await?.map(|s| s.value))
}

/// All settings except the admin verifier.
pub async fn list(store: &Store) -> Result<Vec<Setting>> {
    let mut all: Vec<Setting> = store.all().await?;
    all.retain(|s| s.key != ADMIN_PIN_DIGEST);
    all.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(all)
}

pub async fn set(store: &Store, session: &Session, key: &str, value: Value) -> Result<Setting> {
    let actor = session.require_elevated()?.clone();
    if key == ADMIN_PIN_DIGEST {
        return Err(IntakeError::InvalidInput(
            "the admin PIN is changed through the admin gate".into(),
        ));
    }
    validate(key, &value)?;
    let setting = Setting::new(key, value);
    let stored = setting.clone();
    store
        .write(move |tx| {
            tx.put(&stored)?;
            logging::append(tx, LogAction::SettingChange, None, None, &actor)?;
            Ok(())
        })
        .await?;
    log::info!("setting {} changed to {}", setting.key, setting.value);
    Ok(setting)
}

fn validate(key: &str, value: &Value) -> Result<()> {
    let ok = match key {
        QUALITY_CHECK => value.is_boolean(),
        MIN_LONG_EDGE | MAX_LONG_EDGE => {
            value.as_u64().is_some_and(|v| v > 0 && v <= u32::MAX as u64)
        }
        // 0 scores at stored resolution.
        SCORE_LONG_EDGE => value.as_u64().is_some_and(|v| v <= u32::MAX as u64),
        BLUR_THRESHOLD => value.as_f64().is_some_and(|v| v >= 0.0),
        JPEG_QUALITY | ROTATE_QUALITY => value.as_u64().is_some_and(|v| (1..=100).contains(&v)),
        SYNC_DELAY_MS => value.is_u64(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(IntakeError::InvalidInput(format!(
            "invalid value {value} for setting {key}"
        )))
    }
}
