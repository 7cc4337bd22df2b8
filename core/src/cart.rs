//! Shopping cart for material to reorder. Independent of delivery documents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{IntakeError, Result};
use crate::logging::{self, LogAction};
use crate::session::Identity;
use crate::store::{Record, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: String,
    pub name: String,
    pub qty: u32,
    pub note: String,
}

impl Record for CartLine {
    const COLLECTION: &'static str = "cart";

    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Clone)]
pub struct Cart {
    store: Store,
}

impl Cart {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Add a line, or raise the quantity of an existing `(name, note)` line.
    pub async fn add(&self, actor: &Identity, name: &str, qty: u32, note: &str) -> Result<CartLine> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(IntakeError::InvalidInput("cart line needs a name".into()));
        }
        if qty == 0 {
            return Err(IntakeError::InvalidInput("quantity must be positive".into()));
        }
        let note = note.trim().to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let existing = tx
                    .all::<CartLine>()?
                    .into_iter()
                    .find(|line| line.name == name && line.note == note);
                let line = match existing {
                    Some(mut line) => {
                        line.qty = line.qty.checked_add(qty).ok_or_else(|| {
                            IntakeError::InvalidInput(format!("quantity overflow for {}", line.name))
                        })?;
                        line
                    }
                    None => CartLine {
                        id: Uuid::new_v4().to_string(),
                        name,
                        qty,
                        note,
                    },
                };
                tx.put(&line)?;
                logging::append(tx, LogAction::CartAdd, None, None, &actor)?;
                Ok(line)
            })
            .await
    }

    /// Zero removes the line and returns `None`.
    pub async fn set_qty(&self, actor: &Identity, id: &str, qty: u32) -> Result<Option<CartLine>> {
        let id = id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let mut line: CartLine = tx.require(&id)?;
                if qty == 0 {
                    tx.delete::<CartLine>(&id)?;
                    logging::append(tx, LogAction::CartRemove, None, None, &actor)?;
                    return Ok(None);
                }
                line.qty = qty;
                tx.put(&line)?;
                logging::append(tx, LogAction::CartUpdate, None, None, &actor)?;
                Ok(Some(line))
            })
            .await
    }

    pub async fn remove(&self, actor: &Identity, id: &str) -> Result<()> {
        let id = id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                if !tx.delete::<CartLine>(&id)? {
                    return Err(IntakeError::not_found(CartLine::COLLECTION, id.as_str()));
                }
                logging::append(tx, LogAction::CartRemove, None, None, &actor)?;
                Ok(())
            })
            .await
    }

    /// Empty the cart; returns how many lines were dropped.
    pub async fn clear(&self, actor: &Identity) -> Result<usize> {
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let lines = tx.all::<CartLine>()?;
                for line in &lines {
                    tx.delete::<CartLine>(&line.id)?;
                }
                logging::append(tx, LogAction::CartClear, None, None, &actor)?;
                Ok(lines.len())
            })
            .await
    }

    /// Lines in the order they were first added.
    pub async fn lines(&self) -> Result<Vec<CartLine>> {
        self.store.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_pool;

    fn cart() -> (tempfile::TempDir, Cart, Identity) {
        let (dir, pool) = temp_pool();
        (dir, Cart::new(Store::new(pool)), Identity::new("office").unwrap())
    }

    #[tokio::test]
    async fn same_name_and_note_merge() {
        let (_dir, cart, me) = cart();
        let first = cart.add(&me, "Screws", 2, "4x40").await.unwrap();
        let again = cart.add(&me, "Screws ", 3, "4x40").await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.qty, 5);
        cart.add(&me, "Screws", 1, "5x60").await.unwrap();
        assert_eq!(cart.lines().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lines_keep_insertion_order_across_updates() {
        let (_dir, cart, me) = cart();
        let a = cart.add(&me, "Glue", 1, "").await.unwrap();
        cart.add(&me, "Tape", 1, "").await.unwrap();
        cart.set_qty(&me, &a.id, 9).await.unwrap();
        let names: Vec<String> = cart.lines().await.unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["Glue", "Tape"]);
    }

    #[tokio::test]
    async fn zero_quantity_removes_and_clear_empties() {
        let (_dir, cart, me) = cart();
        let a = cart.add(&me, "Glue", 1, "").await.unwrap();
        cart.add(&me, "Tape", 1, "").await.unwrap();
        assert!(cart.set_qty(&me, &a.id, 0).await.unwrap().is_none());
        assert_eq!(cart.lines().await.unwrap().len(), 1);
        assert_eq!(cart.clear(&me).await.unwrap(), 1);
        assert!(cart.lines().await.unwrap().is_empty());
        assert!(matches!(
            cart.remove(&me, &a.id).await,
            Err(IntakeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn merge_overflow_is_refused_and_leaves_the_line() {
        let (_dir, cart, me) = cart();
        let full = cart.add(&me, "Rivets", u32::MAX, "").await.unwrap();
        assert!(matches!(
            cart.add(&me, "Rivets", 1, "").await,
            Err(IntakeError::InvalidInput(_))
        ));
        let lines = cart.lines().await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].id, full.id);
        assert_eq!(lines[0].qty, u32::MAX);
    }

    #[tokio::test]
    async fn invalid_lines_are_refused() {
        let (_dir, cart, me) = cart();
        assert!(cart.add(&me, " ", 1, "").await.is_err());
        assert!(cart.add(&me, "Glue", 0, "").await.is_err());
    }
}
