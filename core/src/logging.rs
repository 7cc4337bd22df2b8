//! Audit trail of user actions, stored as append-only `log` records.
//!
//! Diagnostics go through the `log` facade; this module records who changed
//! what, and commits with the change itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::now_millis;
use crate::session::Identity;
use crate::store::{Index, KeyRange, Record, Store, Tx};

/// Audited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    CreateInbound,
    UpdateInbound,
    StatusChange,
    AddImage,
    DeleteImage,
    ReorderImage,
    RotateImage,
    PruneImages,
    ItemPlace,
    ItemMove,
    ItemUpdate,
    ItemDelete,
    CartAdd,
    CartUpdate,
    CartRemove,
    CartClear,
    Sync,
    SettingChange,
    AdminUnlock,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub action: LogAction,
    pub inbound_id: Option<String>,
    pub image_id: Option<String>,
    pub user: String,
    pub ts: i64,
}

impl Record for LogEntry {
    const COLLECTION: &'static str = "log";

    fn key(&self) -> &str {
        &self.id
    }
}

/// Record `action` inside the caller's transaction so the audit trail commits
/// or rolls back together with the change it describes.
pub fn append(
    tx: &Tx<'_>,
    action: LogAction,
    inbound_id: Option<&str>,
    image_id: Option<&str>,
    actor: &Identity,
) -> Result<LogEntry> {
    let entry = LogEntry {
        id: Uuid::new_v4().to_string(),
        action,
        inbound_id: inbound_id.map(str::to_string),
        image_id: image_id.map(str::to_string),
        user: actor.user().to_string(),
        ts: now_millis(),
    };
    tx.add(&entry)?;
    log::debug!(
        "audit {:?} by {} (inbound={:?}, image={:?})",
        entry.action,
        entry.user,
        entry.inbound_id,
        entry.image_id
    );
    Ok(entry)
}

/// Most recent entries first.
pub async fn recent(store: &Store, limit: usize) -> Result<Vec<LogEntry>> {
    let mut entries: Vec<LogEntry> = store.all().await?;
    entries.reverse();
    entries.sort_by(|a, b| b.ts.cmp(&a.ts));
    entries.truncate(limit);
    Ok(entries)
}

/// Entries touching one delivery document, oldest first.
pub async fn for_inbound(store: &Store, inbound_id: &str) -> Result<Vec<LogEntry>> {
    store
        .query(Index::LogInbound, KeyRange::only(inbound_id))
        .await
}
