//! Delivery documents and their ordered page images.
//!
//! Every operation that reads before it writes (duplicate detection, page
//! numbering, renumbering after a delete, swaps, status changes) runs inside
//! a single [`Store::write`] unit, so two calls against the same document can
//! never interleave and the `1..N` page sequence is never observed with a gap.
//! Rotation is the exception: the image work runs outside the write unit and
//! the commit is refused if the page content changed in between.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::Date;
use uuid::Uuid;

use crate::errors::{IntakeError, Result};
use crate::gate::{AcceptedImage, ImageQualityGate};
use crate::hasher;
use crate::logging::{self, LogAction};
use crate::now_millis;
use crate::session::{Identity, Session};
use crate::store::{Index, KeyRange, Record, Store, Tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundStatus {
    AwaitingDrawing,
    DrawingAttached,
}

impl InboundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingDrawing => "awaiting_drawing",
            Self::DrawingAttached => "drawing_attached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundDocument {
    pub id: String,
    pub ls_nr: String,
    pub ls_nr_normalized: String,
    pub supplier: String,
    pub date_doc: Date,
    pub status: InboundStatus,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: Option<i64>,
    pub updated_by: Option<String>,
}

impl Record for InboundDocument {
    const COLLECTION: &'static str = "inbound";

    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePage {
    pub id: String,
    pub inbound_id: String,
    pub page_no: u32,
    pub mime_type: String,
    pub width_px: u32,
    pub height_px: u32,
    pub size_bytes: u64,
    pub content_hash: String,
    pub storage_uri: String,
    pub created_at: i64,
    pub created_by: String,
    pub synced: bool,
}

impl Record for ImagePage {
    const COLLECTION: &'static str = "images";

    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInbound {
    pub ls_nr: String,
    pub supplier: String,
    pub date_doc: Date,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundUpdate {
    pub ls_nr: Option<String>,
    pub supplier: Option<String>,
    pub date_doc: Option<Date>,
}

/// Advisory: documents with the same normalized number, supplier and date
/// already exist. Creating anyway requires an explicit override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateWarning {
    pub ls_nr_normalized: String,
    pub matches: Vec<InboundDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created(InboundDocument),
    Duplicate(DuplicateWarning),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

/// Canonical comparable form of a delivery note number: uppercase, without
/// `-`, `_`, `.` and whitespace.
pub fn normalize(ls_nr: &str) -> String {
    ls_nr
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | '.') && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn date_key(date: Date) -> Result<String> {
    date.format(&format_description!("[year]-[month]-[day]"))
        .map_err(|err| IntakeError::InvalidInput(format!("unformattable date {date}: {err}")))
}

fn blob_uri(page_id: &str) -> String {
    format!("blob://images/{page_id}")
}

fn log_misuse(err: IntakeError) -> IntakeError {
    if matches!(
        err,
        IntakeError::InvalidTransition(_)
            | IntakeError::ConstraintViolation(_)
            | IntakeError::Stale(_)
    ) {
        log::warn!("inbound registry refused operation: {err}");
    }
    err
}

#[derive(Clone)]
pub struct InboundRegistry {
    store: Store,
}

impl InboundRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a document, or report likely duplicates unless `force` is set.
    pub async fn create(
        &self,
        actor: &Identity,
        input: NewInbound,
        force: bool,
    ) -> Result<CreateOutcome> {
        let ls_nr = input.ls_nr.trim().to_string();
        let normalized = normalize(&ls_nr);
        if normalized.is_empty() {
            return Err(IntakeError::InvalidInput(
                "delivery note number must not be empty".into(),
            ));
        }
        let supplier = input.supplier.trim().to_string();
        let date_doc = input.date_doc;
        let actor = actor.clone();

        self.store
            .write(move |tx| {
                let matches: Vec<InboundDocument> = tx
                    .query::<InboundDocument>(
                        Index::InboundNormalizedNumber,
                        &KeyRange::only(normalized.as_str()),
                    )?
                    .into_iter()
                    .filter(|doc| doc.supplier == supplier && doc.date_doc == date_doc)
                    .collect();
                if !matches.is_empty() {
                    if !force {
                        return Ok(CreateOutcome::Duplicate(DuplicateWarning {
                            ls_nr_normalized: normalized,
                            matches,
                        }));
                    }
                    log::info!(
                        "{} forced creation of duplicate delivery note {normalized}",
                        actor.user()
                    );
                }

                let doc = InboundDocument {
                    id: Uuid::new_v4().to_string(),
                    ls_nr,
                    ls_nr_normalized: normalized,
                    supplier,
                    date_doc,
                    status: InboundStatus::AwaitingDrawing,
                    created_at: now_millis(),
                    created_by: actor.user().to_string(),
                    updated_at: None,
                    updated_by: None,
                };
                tx.add(&doc)?;
                logging::append(tx, LogAction::CreateInbound, Some(&doc.id), None, &actor)?;
                Ok(CreateOutcome::Created(doc))
            })
            .await
    }

    /// Edit header fields; the normalized number follows `ls_nr`.
    pub async fn update(
        &self,
        actor: &Identity,
        id: &str,
        changes: InboundUpdate,
    ) -> Result<InboundDocument> {
        let id = id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let mut doc: InboundDocument = tx.require(&id)?;
                if let Some(ls_nr) = changes.ls_nr {
                    let ls_nr = ls_nr.trim().to_string();
                    let normalized = normalize(&ls_nr);
                    if normalized.is_empty() {
                        return Err(IntakeError::InvalidInput(
                            "delivery note number must not be empty".into(),
                        ));
                    }
                    doc.ls_nr = ls_nr;
                    doc.ls_nr_normalized = normalized;
                }
                if let Some(supplier) = changes.supplier {
                    doc.supplier = supplier.trim().to_string();
                }
                if let Some(date_doc) = changes.date_doc {
                    doc.date_doc = date_doc;
                }
                doc.updated_at = Some(now_millis());
                doc.updated_by = Some(actor.user().to_string());
                tx.put(&doc)?;
                logging::append(tx, LogAction::UpdateInbound, Some(&doc.id), None, &actor)?;
                Ok(doc)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<InboundDocument>> {
        self.store.get(id).await
    }

    /// Append an admitted image as the next page of the document.
    pub async fn attach_page(
        &self,
        actor: &Identity,
        inbound_id: &str,
        image: AcceptedImage,
    ) -> Result<ImagePage> {
        let inbound_id = inbound_id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                tx.require::<InboundDocument>(&inbound_id)?;
                let existing = pages_of(tx, &inbound_id)?;
                let page_no = existing.last().map_or(0, |p| p.page_no) + 1;

                let content_hash = hasher::digest(&image.bytes);
                let same_content = tx.count::<ImagePage>(
                    Index::ImageContentHash,
                    &KeyRange::only(content_hash.as_str()),
                )?;
                if same_content > 0 {
                    log::warn!(
                        "page for {inbound_id} has the same content as {same_content} stored page(s)"
                    );
                }

                let id = Uuid::new_v4().to_string();
                let page = ImagePage {
                    storage_uri: blob_uri(&id),
                    id,
                    inbound_id: inbound_id.clone(),
                    page_no,
                    mime_type: image.mime_type.clone(),
                    width_px: image.width,
                    height_px: image.height,
                    size_bytes: image.size_bytes(),
                    content_hash,
                    created_at: now_millis(),
                    created_by: actor.user().to_string(),
                    synced: false,
                };
                tx.put_blob(&page.storage_uri, &image.bytes)?;
                tx.add(&page)?;
                logging::append(tx, LogAction::AddImage, Some(&inbound_id), Some(&page.id), &actor)?;
                Ok(page)
            })
            .await
            .map_err(log_misuse)
    }

    /// Mark the document's pages as printed and filed. Only valid once, and
    /// only when at least one page exists.
    pub async fn confirm_drawing_attached(
        &self,
        actor: &Identity,
        inbound_id: &str,
    ) -> Result<InboundDocument> {
        let inbound_id = inbound_id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let mut doc: InboundDocument = tx.require(&inbound_id)?;
                if doc.status != InboundStatus::AwaitingDrawing {
                    return Err(IntakeError::InvalidTransition(format!(
                        "document {inbound_id} is already {}",
                        doc.status.as_str()
                    )));
                }
                let pages =
                    tx.count::<ImagePage>(Index::ImageInbound, &KeyRange::only(inbound_id.as_str()))?;
                if pages == 0 {
                    return Err(IntakeError::InvalidTransition(format!(
                        "document {inbound_id} has no pages"
                    )));
                }
                doc.status = InboundStatus::DrawingAttached;
                doc.updated_at = Some(now_millis());
                doc.updated_by = Some(actor.user().to_string());
                tx.put(&doc)?;
                logging::append(tx, LogAction::StatusChange, Some(&doc.id), None, &actor)?;
                Ok(doc)
            })
            .await
            .map_err(log_misuse)
    }

    /// Remove one page and close the gap it leaves.
    pub async fn delete_page(
        &self,
        actor: &Identity,
        inbound_id: &str,
        page_id: &str,
    ) -> Result<Vec<ImagePage>> {
        let inbound_id = inbound_id.to_string();
        let page_id = page_id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let page = page_in(tx, &inbound_id, &page_id)?;
                tx.delete::<ImagePage>(&page.id)?;
                tx.delete_blob(&page.storage_uri)?;
                let pages = renumber(tx, &inbound_id)?;
                logging::append(tx, LogAction::DeleteImage, Some(&inbound_id), Some(&page.id), &actor)?;
                Ok(pages)
            })
            .await
            .map_err(log_misuse)
    }

    /// Exchange the positions of two pages of the same document.
    pub async fn swap_pages(
        &self,
        actor: &Identity,
        inbound_id: &str,
        first: &str,
        second: &str,
    ) -> Result<Vec<ImagePage>> {
        let inbound_id = inbound_id.to_string();
        let (first, second) = (first.to_string(), second.to_string());
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let a = page_in(tx, &inbound_id, &first)?;
                let b = page_in(tx, &inbound_id, &second)?;
                if a.id != b.id {
                    swap_in(tx, a, b)?;
                    logging::append(tx, LogAction::ReorderImage, Some(&inbound_id), Some(&first), &actor)?;
                }
                pages_of(tx, &inbound_id)
            })
            .await
            .map_err(log_misuse)
    }

    /// Move a page one position towards the front or back. Moving past
    /// either end leaves the order untouched.
    pub async fn move_page(
        &self,
        actor: &Identity,
        inbound_id: &str,
        page_id: &str,
        direction: MoveDirection,
    ) -> Result<Vec<ImagePage>> {
        let inbound_id = inbound_id.to_string();
        let page_id = page_id.to_string();
        let actor = actor.clone();
        self.store
            .write(move |tx| {
                let mut pages = pages_of(tx, &inbound_id)?;
                let pos = pages
                    .iter()
                    .position(|p| p.id == page_id)
                    .ok_or_else(|| IntakeError::not_found(ImagePage::COLLECTION, page_id.as_str()))?;
                let neighbour = match direction {
                    MoveDirection::Up => pos.checked_sub(1),
                    MoveDirection::Down => Some(pos + 1).filter(|&n| n < pages.len()),
                };
                let Some(neighbour) = neighbour else {
                    return Ok(pages);
                };
                let b = pages.swap_remove(neighbour.max(pos));
                let a = pages.swap_remove(neighbour.min(pos));
                swap_in(tx, a, b)?;
                logging::append(tx, LogAction::ReorderImage, Some(&inbound_id), Some(&page_id), &actor)?;
                pages_of(tx, &inbound_id)
            })
            .await
            .map_err(log_misuse)
    }

    /// Rotate a stored page clockwise. The page counts as new content, so it
    /// becomes pending upload again.
    pub async fn rotate_page(
        &self,
        actor: &Identity,
        page_id: &str,
        degrees: f64,
        gate: &ImageQualityGate,
    ) -> Result<ImagePage> {
        let page_id = page_id.to_string();
        let (original, bytes) = self
            .store
            .read(move |tx| {
                let page: ImagePage = tx.require(&page_id)?;
                let bytes = stored_bytes(tx, &page)?;
                Ok((page, bytes))
            })
            .await?;
        let rotated = gate.rotate(bytes, degrees).await?;
        let actor = actor.clone();
        self.store
            .write(move |tx| commit_rotation(tx, &original, &rotated, &actor))
            .await
            .map_err(log_misuse)
    }

    /// Delete every page of a document. Admin only.
    pub async fn prune_pages(&self, session: &Session, inbound_id: &str) -> Result<usize> {
        let actor = session.require_elevated()?.clone();
        let inbound_id = inbound_id.to_string();
        self.store
            .write(move |tx| {
                tx.require::<InboundDocument>(&inbound_id)?;
                let pages = pages_of(tx, &inbound_id)?;
                for page in &pages {
                    tx.delete::<ImagePage>(&page.id)?;
                    tx.delete_blob(&page.storage_uri)?;
                }
                logging::append(tx, LogAction::PruneImages, Some(&inbound_id), None, &actor)?;
                log::info!("pruned {} page(s) of {inbound_id}", pages.len());
                Ok(pages.len())
            })
            .await
    }

    pub async fn find_by_normalized_number(&self, ls_nr: &str) -> Result<Vec<InboundDocument>> {
        self.store
            .query(Index::InboundNormalizedNumber, KeyRange::only(normalize(ls_nr)))
            .await
    }

    /// Documents in `status`, oldest first.
    pub async fn find_by_status(&self, status: InboundStatus) -> Result<Vec<InboundDocument>> {
        let mut docs: Vec<InboundDocument> = self
            .store
            .query(Index::InboundStatus, KeyRange::only(status.as_str()))
            .await?;
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    /// Documents dated `date`, ordered by delivery note number.
    pub async fn find_by_date(&self, date: Date) -> Result<Vec<InboundDocument>> {
        let mut docs: Vec<InboundDocument> = self
            .store
            .query(Index::InboundDate, KeyRange::only(date_key(date)?))
            .await?;
        docs.sort_by(|a, b| a.ls_nr.cmp(&b.ls_nr));
        Ok(docs)
    }

    /// Documents dated within `from..=to`, by date then number.
    pub async fn find_between(&self, from: Date, to: Date) -> Result<Vec<InboundDocument>> {
        let mut docs: Vec<InboundDocument> = self
            .store
            .query(
                Index::InboundDate,
                KeyRange::between(date_key(from)?, date_key(to)?),
            )
            .await?;
        docs.sort_by(|a, b| a.date_doc.cmp(&b.date_doc).then_with(|| a.ls_nr.cmp(&b.ls_nr)));
        Ok(docs)
    }

    pub async fn find_by_supplier(&self, supplier: &str) -> Result<Vec<InboundDocument>> {
        self.store
            .query(Index::InboundSupplier, KeyRange::only(supplier.trim()))
            .await
    }

    /// Pages of a document ordered by `page_no`.
    pub async fn pages(&self, inbound_id: &str) -> Result<Vec<ImagePage>> {
        let inbound_id = inbound_id.to_string();
        self.store.read(move |tx| pages_of(tx, &inbound_id)).await
    }

    pub async fn page_bytes(&self, page_id: &str) -> Result<Vec<u8>> {
        let page_id = page_id.to_string();
        self.store
            .read(move |tx| {
                let page: ImagePage = tx.require(&page_id)?;
                stored_bytes(tx, &page)
            })
            .await
    }

    pub async fn find_pages_by_hash(&self, content_hash: &str) -> Result<Vec<ImagePage>> {
        self.store
            .query(Index::ImageContentHash, KeyRange::only(content_hash))
            .await
    }

    /// Recompute the digest of the stored bytes and compare.
    pub async fn verify_page(&self, page_id: &str) -> Result<bool> {
        let page_id = page_id.to_string();
        self.store
            .read(move |tx| {
                let page: ImagePage = tx.require(&page_id)?;
                let ok = tx
                    .get_blob(&page.storage_uri)?
                    .is_some_and(|bytes| hasher::digest(&bytes) == page.content_hash);
                if !ok {
                    log::error!("integrity check failed for page {page_id}");
                }
                Ok(ok)
            })
            .await
    }
}

fn pages_of(tx: &Tx<'_>, inbound_id: &str) -> Result<Vec<ImagePage>> {
    let mut pages: Vec<ImagePage> = tx.query(Index::ImageInbound, &KeyRange::only(inbound_id))?;
    pages.sort_by_key(|p| p.page_no);
    Ok(pages)
}

fn page_in(tx: &Tx<'_>, inbound_id: &str, page_id: &str) -> Result<ImagePage> {
    let page: ImagePage = tx.require(page_id)?;
    if page.inbound_id != inbound_id {
        return Err(IntakeError::InvalidInput(format!(
            "page {page_id} does not belong to document {inbound_id}"
        )));
    }
    Ok(page)
}

/// Restore the dense `1..N` numbering. Survivors are visited in order, so each
/// target slot is already free when it is written.
fn renumber(tx: &Tx<'_>, inbound_id: &str) -> Result<Vec<ImagePage>> {
    let mut pages = pages_of(tx, inbound_id)?;
    for (idx, page) in pages.iter_mut().enumerate() {
        let expected = idx as u32 + 1;
        if page.page_no != expected {
            page.page_no = expected;
            tx.put(page)?;
        }
    }
    Ok(pages)
}

fn swap_in(tx: &Tx<'_>, mut a: ImagePage, mut b: ImagePage) -> Result<()> {
    let (a_no, b_no) = (a.page_no, b.page_no);
    // Park `a` on 0, outside the dense range, while its slot changes hands.
    a.page_no = 0;
    tx.put(&a)?;
    b.page_no = a_no;
    tx.put(&b)?;
    a.page_no = b_no;
    tx.put(&a)?;
    Ok(())
}

fn stored_bytes(tx: &Tx<'_>, page: &ImagePage) -> Result<Vec<u8>> {
    tx.get_blob(&page.storage_uri)?
        .ok_or_else(|| IntakeError::Storage(format!("blob {} is missing", page.storage_uri)))
}

/// Store `rotated` over `original`, provided the page still holds the content
/// it had when it was read. Position and owner are taken from the current row.
fn commit_rotation(
    tx: &Tx<'_>,
    original: &ImagePage,
    rotated: &AcceptedImage,
    actor: &Identity,
) -> Result<ImagePage> {
    let mut page: ImagePage = tx.require(&original.id)?;
    if page.content_hash != original.content_hash {
        return Err(IntakeError::Stale(format!(
            "page {} changed while it was being rotated",
            page.id
        )));
    }
    tx.put_blob(&page.storage_uri, &rotated.bytes)?;
    page.mime_type = rotated.mime_type.clone();
    page.width_px = rotated.width;
    page.height_px = rotated.height;
    page.size_bytes = rotated.size_bytes();
    page.content_hash = hasher::digest(&rotated.bytes);
    page.synced = false;
    tx.put(&page)?;
    logging::append(
        tx,
        LogAction::RotateImage,
        Some(&page.inbound_id),
        Some(&page.id),
        actor,
    )?;
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_pool;
    use crate::gate::{encode_jpeg, JPEG_MIME};
    use crate::session::AdminGate;
    use image::{DynamicImage, Rgb, RgbImage};
    use time::macros::date;

    fn fixture() -> (tempfile::TempDir, Store, InboundRegistry, Identity) {
        let (dir, pool) = temp_pool();
        let store = Store::new(pool);
        let registry = InboundRegistry::new(store.clone());
        (dir, store, registry, Identity::new("scanner-1").unwrap())
    }

    fn image(tag: &str) -> AcceptedImage {
        AcceptedImage {
            bytes: tag.as_bytes().to_vec(),
            mime_type: JPEG_MIME.into(),
            width: 2000,
            height: 1500,
            sharpness: Some(120.0),
        }
    }

    fn new_inbound(ls_nr: &str, supplier: &str, date_doc: Date) -> NewInbound {
        NewInbound {
            ls_nr: ls_nr.into(),
            supplier: supplier.into(),
            date_doc,
        }
    }

    async fn created(registry: &InboundRegistry, me: &Identity, ls_nr: &str) -> InboundDocument {
        match registry
            .create(me, new_inbound(ls_nr, "X", date!(2024 - 01 - 01)), false)
            .await
            .unwrap()
        {
            CreateOutcome::Created(doc) => doc,
            other => panic!("expected a new document, got {other:?}"),
        }
    }

    fn numbers(pages: &[ImagePage]) -> Vec<u32> {
        pages.iter().map(|p| p.page_no).collect()
    }

    #[test]
    fn normalize_folds_case_and_punctuation() {
        assert_eq!(normalize("a-100"), "A100");
        assert_eq!(normalize(" Ls_12.3 4 "), "LS1234");
        for raw in ["A-100", "a 100", "x_y.z", "ß-1", "\t9 9\n"] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once);
        }
    }

    #[tokio::test]
    async fn duplicate_needs_an_override() {
        let (_dir, _store, registry, me) = fixture();
        let first = created(&registry, &me, "A-100").await;

        let again = registry
            .create(&me, new_inbound("a 100", "X", date!(2024 - 01 - 01)), false)
            .await
            .unwrap();
        let CreateOutcome::Duplicate(warning) = again else {
            panic!("expected a duplicate warning");
        };
        assert_eq!(warning.ls_nr_normalized, "A100");
        assert_eq!(warning.matches, vec![first.clone()]);

        let forced = registry
            .create(&me, new_inbound("a 100", "X", date!(2024 - 01 - 01)), true)
            .await
            .unwrap();
        assert!(matches!(forced, CreateOutcome::Created(_)));
        assert_eq!(registry.find_by_normalized_number("A100").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn same_number_other_supplier_or_date_is_not_a_duplicate() {
        let (_dir, _store, registry, me) = fixture();
        created(&registry, &me, "A-100").await;
        let other_supplier = registry
            .create(&me, new_inbound("A100", "Y", date!(2024 - 01 - 01)), false)
            .await
            .unwrap();
        assert!(matches!(other_supplier, CreateOutcome::Created(_)));
        let other_date = registry
            .create(&me, new_inbound("A100", "X", date!(2024 - 01 - 02)), false)
            .await
            .unwrap();
        assert!(matches!(other_date, CreateOutcome::Created(_)));
    }

    #[tokio::test]
    async fn blank_number_is_rejected() {
        let (_dir, _store, registry, me) = fixture();
        let err = registry
            .create(&me, new_inbound(" - . ", "X", date!(2024 - 01 - 01)), false)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn update_recomputes_the_normalized_number() {
        let (_dir, _store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let updated = registry
            .update(
                &me,
                &doc.id,
                InboundUpdate {
                    ls_nr: Some("b.200".into()),
                    ..InboundUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.ls_nr_normalized, "B200");
        assert_eq!(updated.updated_by.as_deref(), Some("scanner-1"));
        assert!(registry.find_by_normalized_number("A100").await.unwrap().is_empty());
        assert_eq!(registry.find_by_normalized_number("b 200").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pages_stay_dense_after_delete() {
        let (_dir, store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let mut ids = Vec::new();
        for tag in ["one", "two", "three"] {
            ids.push(registry.attach_page(&me, &doc.id, image(tag)).await.unwrap().id);
        }
        assert_eq!(numbers(&registry.pages(&doc.id).await.unwrap()), vec![1, 2, 3]);

        let remaining = registry.delete_page(&me, &doc.id, &ids[1]).await.unwrap();
        assert_eq!(numbers(&remaining), vec![1, 2]);
        assert_eq!(remaining[0].id, ids[0]);
        assert_eq!(remaining[1].id, ids[2]);

        // The blob went with the page.
        let uri = blob_uri(&ids[1]);
        assert!(store.read(move |tx| tx.get_blob(&uri)).await.unwrap().is_none());

        let next = registry.attach_page(&me, &doc.id, image("four")).await.unwrap();
        assert_eq!(next.page_no, 3);
        assert!(!next.synced);
    }

    #[tokio::test]
    async fn attaching_to_unknown_document_fails() {
        let (_dir, _store, registry, me) = fixture();
        let err = registry.attach_page(&me, "missing", image("x")).await.unwrap_err();
        assert!(matches!(err, IntakeError::NotFound { collection: "inbound", .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attaches_never_collide() {
        let (_dir, _store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let me = me.clone();
            let id = doc.id.clone();
            tasks.push(tokio::spawn(async move {
                registry.attach_page(&me, &id, image(&format!("page-{i}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(
            numbers(&registry.pages(&doc.id).await.unwrap()),
            (1..=8).collect::<Vec<u32>>()
        );
    }

    #[tokio::test]
    async fn confirm_needs_pages_and_happens_once() {
        let (_dir, _store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;

        let err = registry.confirm_drawing_attached(&me, &doc.id).await.unwrap_err();
        assert!(matches!(err, IntakeError::InvalidTransition(_)));

        registry.attach_page(&me, &doc.id, image("one")).await.unwrap();
        let done = registry.confirm_drawing_attached(&me, &doc.id).await.unwrap();
        assert_eq!(done.status, InboundStatus::DrawingAttached);
        assert!(done.updated_at.is_some());

        let err = registry.confirm_drawing_attached(&me, &doc.id).await.unwrap_err();
        assert!(matches!(err, IntakeError::InvalidTransition(_)));

        let awaiting = registry.find_by_status(InboundStatus::AwaitingDrawing).await.unwrap();
        assert!(awaiting.is_empty());
        let attached = registry.find_by_status(InboundStatus::DrawingAttached).await.unwrap();
        assert_eq!(attached[0].id, doc.id);
    }

    #[tokio::test]
    async fn swap_and_move_reorder_pages() {
        let (_dir, _store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let mut ids = Vec::new();
        for tag in ["one", "two", "three"] {
            ids.push(registry.attach_page(&me, &doc.id, image(tag)).await.unwrap().id);
        }

        let order = registry.swap_pages(&me, &doc.id, &ids[0], &ids[2]).await.unwrap();
        let by_no: Vec<&str> = order.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(by_no, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);
        assert_eq!(numbers(&order), vec![1, 2, 3]);

        let order = registry
            .move_page(&me, &doc.id, &ids[0], MoveDirection::Up)
            .await
            .unwrap();
        assert_eq!(order[1].id, ids[0]);

        // Already first: nothing changes.
        let order = registry
            .move_page(&me, &doc.id, &ids[2], MoveDirection::Up)
            .await
            .unwrap();
        assert_eq!(order[0].id, ids[2]);
        assert_eq!(numbers(&order), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pages_of_other_documents_cannot_be_touched() {
        let (_dir, _store, registry, me) = fixture();
        let a = created(&registry, &me, "A-100").await;
        let b = created(&registry, &me, "B-200").await;
        let page = registry.attach_page(&me, &a.id, image("one")).await.unwrap();
        let err = registry.delete_page(&me, &b.id, &page.id).await.unwrap_err();
        assert!(matches!(err, IntakeError::InvalidInput(_)));
        assert_eq!(registry.pages(&a.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_is_admin_only() {
        let (_dir, store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        registry.attach_page(&me, &doc.id, image("one")).await.unwrap();
        registry.attach_page(&me, &doc.id, image("two")).await.unwrap();

        let plain = Session::new(me.clone());
        assert!(matches!(
            registry.prune_pages(&plain, &doc.id).await,
            Err(IntakeError::Unauthorized)
        ));

        AdminGate::provision(&store, &me, "1234").await.unwrap();
        let admin = AdminGate::unlock(&store, &me, "1234").await.unwrap();
        assert_eq!(registry.prune_pages(&admin, &doc.id).await.unwrap(), 2);
        assert!(registry.pages(&doc.id).await.unwrap().is_empty());
        assert!(registry.get(&doc.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn listings_are_deterministic() {
        let (_dir, _store, registry, me) = fixture();
        for (nr, day) in [("C-3", 2), ("A-1", 2), ("B-2", 1)] {
            let date_doc = Date::from_calendar_date(2024, time::Month::March, day).unwrap();
            registry
                .create(&me, new_inbound(nr, "X", date_doc), false)
                .await
                .unwrap();
        }
        let day_two = registry
            .find_by_date(date!(2024 - 03 - 02))
            .await
            .unwrap();
        let nrs: Vec<&str> = day_two.iter().map(|d| d.ls_nr.as_str()).collect();
        assert_eq!(nrs, vec!["A-1", "C-3"]);

        let awaiting = registry.find_by_status(InboundStatus::AwaitingDrawing).await.unwrap();
        let nrs: Vec<&str> = awaiting.iter().map(|d| d.ls_nr.as_str()).collect();
        assert_eq!(nrs, vec!["C-3", "A-1", "B-2"]);

        let march = registry
            .find_between(date!(2024 - 03 - 01), date!(2024 - 03 - 31))
            .await
            .unwrap();
        let nrs: Vec<&str> = march.iter().map(|d| d.ls_nr.as_str()).collect();
        assert_eq!(nrs, vec!["B-2", "A-1", "C-3"]);
        assert_eq!(registry.find_by_supplier("X").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hashes_track_content() {
        let (_dir, _store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let first = registry.attach_page(&me, &doc.id, image("same")).await.unwrap();
        let second = registry.attach_page(&me, &doc.id, image("same")).await.unwrap();
        assert_eq!(first.content_hash, hasher::digest(b"same"));
        assert_eq!(second.page_no, 2);
        assert_eq!(registry.find_pages_by_hash(&first.content_hash).await.unwrap().len(), 2);
        assert!(registry.verify_page(&first.id).await.unwrap());
        assert_eq!(registry.page_bytes(&first.id).await.unwrap(), b"same".to_vec());
    }

    #[tokio::test]
    async fn rotating_a_page_resets_sync_state() {
        let (_dir, store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let raw = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, Rgb([10, 20, 30])));
        let accepted = AcceptedImage {
            bytes: encode_jpeg(&raw, 85).unwrap(),
            mime_type: JPEG_MIME.into(),
            width: 60,
            height: 40,
            sharpness: None,
        };
        let page = registry.attach_page(&me, &doc.id, accepted).await.unwrap();
        let mut synced = page.clone();
        synced.synced = true;
        store.put(synced).await.unwrap();

        let gate = ImageQualityGate::default();
        let rotated = registry.rotate_page(&me, &page.id, 90.0, &gate).await.unwrap();
        assert_eq!((rotated.width_px, rotated.height_px), (40, 60));
        assert!(!rotated.synced);
        assert_ne!(rotated.content_hash, page.content_hash);
        assert!(registry.verify_page(&page.id).await.unwrap());
    }

    #[tokio::test]
    async fn rotation_of_a_page_changed_meanwhile_is_refused() {
        let (_dir, store, registry, me) = fixture();
        let doc = created(&registry, &me, "A-100").await;
        let raw = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, Rgb([10, 20, 30])));
        let accepted = AcceptedImage {
            bytes: encode_jpeg(&raw, 85).unwrap(),
            mime_type: JPEG_MIME.into(),
            width: 60,
            height: 40,
            sharpness: None,
        };
        let read_before = registry.attach_page(&me, &doc.id, accepted).await.unwrap();

        // Another rotation lands between the read and the commit.
        let gate = ImageQualityGate::default();
        let winner = registry
            .rotate_page(&me, &read_before.id, 90.0, &gate)
            .await
            .unwrap();
        let late = gate
            .rotate(registry.page_bytes(&read_before.id).await.unwrap(), 180.0)
            .await
            .unwrap();
        let actor = me.clone();
        let outcome = store
            .write(move |tx| commit_rotation(tx, &read_before, &late, &actor))
            .await;
        assert!(matches!(outcome, Err(IntakeError::Stale(_))));

        let pages = registry.pages(&doc.id).await.unwrap();
        assert_eq!(pages, vec![winner.clone()]);
        let bytes = registry.page_bytes(&winner.id).await.unwrap();
        assert_eq!(hasher::digest(&bytes), winner.content_hash);
        assert!(registry.verify_page(&winner.id).await.unwrap());
    }
}
