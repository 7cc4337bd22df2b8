//! Zone board: stock counts per physical area of the workshop.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{IntakeError, Result};
use crate::logging::{self, LogAction};
use crate::session::{Identity, Session};
use crate::store::{Index, KeyRange, Record, Store, Tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Receiving,
    Storage,
    Workshop,
    Dispatch,
}

impl Zone {
    pub const ALL: [Zone; 4] = [Zone::Receiving, Zone::Storage, Zone::Workshop, Zone::Dispatch];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receiving => "receiving",
            Self::Storage => "storage",
            Self::Workshop => "workshop",
            Self::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Zone {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|z| z.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| IntakeError::InvalidInput(format!("unknown zone {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    pub zone: Zone,
    pub qty: u32,
    pub note: String,
}

impl Record for InventoryItem {
    const COLLECTION: &'static str = "items";

    fn key(&self) -> &str {
        &self.id
    }
}

fn clean_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(IntakeError::InvalidInput("item name must not be empty".into()));
    }
    Ok(name.to_string())
}

fn positive(qty: u32) -> Result<u32> {
    if qty == 0 {
        return Err(IntakeError::InvalidInput("quantity must be positive".into()));
    }
    Ok(qty)
}

/// Add `qty` to the `(zone, name, note)` item, creating it if needed.
fn merge_into(tx: &Tx<'_>, zone: Zone, name: &str, note: &str, qty: u32) -> Result<InventoryItem> {
    let existing = tx
        .query::<InventoryItem>(Index::ItemZone, &KeyRange::only(zone.as_str()))?
        .into_iter()
        .find(|item| item.name == name && item.note == note);
    let item = match existing {
        Some(mut item) => {
            item.qty = item.qty.checked_add(qty).ok_or_else(|| {
                IntakeError::InvalidInput(format!("quantity overflow for {}", item.name))
            })?;
            item
        }
        None => InventoryItem {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            zone,
            qty,
            note: note.to_string(),
        },
    };
    tx.put(&item)?;
    Ok(item)
}

#[derive(Clone)]
pub struct InventoryBoard {
    store: Store,
}

impl InventoryBoard {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn place(
        &self,
        actor: &Identity,
        zone: Zone,
        name: &str,
        qty: u32,
        note: &str,
    ) -> Result<InventoryItem> {
        let name = clean_name(name)?;
        let qty = positive(qty)?;
        let note = note.trim().to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let item = merge_into(tx, zone, &name, &note, qty)?;
                logging::append(tx, LogAction::ItemPlace, None, None, &actor)?;
                Ok(item)
            })
            .await
    }

    /// Move part or all of an item to another zone. Returns the target item.
    pub async fn move_qty(
        &self,
        actor: &Identity,
        item_id: &str,
        to: Zone,
        qty: u32,
    ) -> Result<InventoryItem> {
        let qty = positive(qty)?;
        let item_id = item_id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let mut source: InventoryItem = tx.require(&item_id)?;
                if source.zone == to {
                    return Ok(source);
                }
                if qty > source.qty {
                    return Err(IntakeError::InvalidInput(format!(
                        "cannot move {qty} of {}, only {} in {}",
                        source.name, source.qty, source.zone
                    )));
                }
                source.qty -= qty;
                if source.qty == 0 {
                    tx.delete::<InventoryItem>(&source.id)?;
                } else {
                    tx.put(&source)?;
                }
                let target = merge_into(tx, to, &source.name, &source.note, qty)?;
                logging::append(tx, LogAction::ItemMove, None, None, &actor)?;
                Ok(target)
            })
            .await
    }

    /// Correct a count. Zero removes the item; returns `None` in that case.
    pub async fn set_qty(
        &self,
        actor: &Identity,
        item_id: &str,
        qty: u32,
    ) -> Result<Option<InventoryItem>> {
        let item_id = item_id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let mut item: InventoryItem = tx.require(&item_id)?;
                let out = if qty == 0 {
                    tx.delete::<InventoryItem>(&item.id)?;
                    logging::append(tx, LogAction::ItemDelete, None, None, &actor)?;
                    None
                } else {
                    item.qty = qty;
                    tx.put(&item)?;
                    logging::append(tx, LogAction::ItemUpdate, None, None, &actor)?;
                    Some(item)
                };
                Ok(out)
            })
            .await
    }

    pub async fn remove(&self, session: &Session, item_id: &str) -> Result<()> {
        let actor = session.require_elevated()?.clone();
        let item_id = item_id.to_string();
        self.store
            .write(move |tx| {
                if !tx.delete::<InventoryItem>(&item_id)? {
                    return Err(IntakeError::not_found(InventoryItem::COLLECTION, item_id.as_str()));
                }
                logging::append(tx, LogAction::ItemDelete, None, None, &actor)?;
                Ok(())
            })
            .await
    }

    /// Items of one zone, or the whole board, sorted by name.
    pub async fn list(&self, zone: Option<Zone>) -> Result<Vec<InventoryItem>> {
        let mut items: Vec<InventoryItem> = match zone {
            Some(zone) => {
                self.store
                    .query(Index::ItemZone, KeyRange::only(zone.as_str()))
                    .await?
            }
            None => self.store.all().await?,
        };
        items.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.note.cmp(&b.note)));
        Ok(items)
    }
}
