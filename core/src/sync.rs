//! Upload bookkeeping for captured pages.
//!
//! A page is pending until an uploader has confirmed it. There is no real
//! backend yet; [`SimulatedUploader`] stands in for the transfer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::Result;
use crate::inbound::ImagePage;
use crate::logging::{self, LogAction};
use crate::session::Identity;
use crate::settings;
use crate::store::{Index, KeyRange, Store};

/// Destination for page uploads.
#[async_trait]
pub trait PageUploader: Send + Sync {
    /// Called once before the first upload of a pass. An error fails every
    /// page of that pass.
    async fn begin_pass(&self, _pending: usize) -> Result<()> {
        Ok(())
    }

    async fn upload(&self, page: &ImagePage, bytes: &[u8]) -> Result<()>;
}

/// Pretends to reach a backend by waiting a fixed delay once per pass; the
/// page transfers themselves are immediate.
#[derive(Debug, Clone)]
pub struct SimulatedUploader {
    delay: Duration,
}

impl SimulatedUploader {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay taken from `sync.simulated_delay_ms`.
    pub async fn from_store(store: &Store) -> Result<Self> {
        Ok(Self::new(store.read(|tx| settings::sync_delay(tx)).await?))
    }
}

impl Default for SimulatedUploader {
    fn default() -> Self {
        Self::new(Duration::from_millis(settings::DEFAULT_SYNC_DELAY_MS))
    }
}

#[async_trait]
impl PageUploader for SimulatedUploader {
    async fn begin_pass(&self, pending: usize) -> Result<()> {
        log::debug!("simulating a {:?} transfer of {pending} pages", self.delay);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn upload(&self, page: &ImagePage, bytes: &[u8]) -> Result<()> {
        log::debug!("simulated upload of page {} ({} bytes)", page.id, bytes.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    /// Uploaded, but the page was deleted or changed before it could be marked.
    pub stale: usize,
}

#[derive(Clone)]
pub struct SyncTracker {
    store: Store,
    uploader: Arc<dyn PageUploader>,
}

impl SyncTracker {
    pub fn new(store: Store, uploader: Arc<dyn PageUploader>) -> Self {
        Self { store, uploader }
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.store
            .read(|tx| tx.count::<ImagePage>(Index::ImageSynced, &KeyRange::only(false)))
            .await
    }

    /// Unsynced pages, oldest first.
    pub async fn pending(&self) -> Result<Vec<ImagePage>> {
        let mut pages: Vec<ImagePage> = self
            .store
            .query(Index::ImageSynced, KeyRange::only(false))
            .await?;
        pages.sort_by_key(|p| p.created_at);
        Ok(pages)
    }

    /// Upload every pending page and mark the confirmed ones synced. Offline,
    /// this is a no-op.
    pub async fn acknowledge_all(
        &self,
        actor: &Identity,
        connectivity: Connectivity,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if connectivity == Connectivity::Offline {
            log::info!("offline, leaving pages pending");
            return Ok(report);
        }

        let pending = self.pending().await?;
        if !pending.is_empty() {
            match self.uploader.begin_pass(pending.len()).await {
                Ok(()) => self.upload_each(pending, &mut report).await?,
                Err(err) => {
                    log::warn!("upload backend unavailable: {err}");
                    report.attempted = pending.len();
                    report.failed = pending.len();
                }
            }
        }

        let actor = actor.clone();
        self.store
            .write(move |tx| {
                logging::append(tx, LogAction::Sync, None, None, &actor)?;
                Ok(())
            })
            .await?;
        log::info!(
            "sync pass: {} attempted, {} acknowledged, {} failed, {} stale",
            report.attempted,
            report.acknowledged,
            report.failed,
            report.stale
        );
        Ok(report)
    }

    async fn upload_each(&self, pending: Vec<ImagePage>, report: &mut SyncReport) -> Result<()> {
        for page in pending {
            report.attempted += 1;
            let uri = page.storage_uri.clone();
            let Some(bytes) = self.store.read(move |tx| tx.get_blob(&uri)).await? else {
                log::warn!("page {} has no stored bytes, skipping", page.id);
                report.failed += 1;
                continue;
            };
            if let Err(err) = self.uploader.upload(&page, &bytes).await {
                log::warn!("upload of page {} failed: {err}", page.id);
                report.failed += 1;
                continue;
            }
            if self.mark_synced(page).await? {
                report.acknowledged += 1;
            } else {
                report.stale += 1;
            }
        }
        Ok(())
    }

    /// Flag the page only if it still holds the content that was uploaded.
    async fn mark_synced(&self, uploaded: ImagePage) -> Result<bool> {
        self.store
            .write(move |tx| {
                let Some(mut current) = tx.get::<ImagePage>(&uploaded.id)? else {
                    return Ok(false);
                };
                if current.content_hash != uploaded.content_hash {
                    return Ok(false);
                }
                current.synced = true;
                tx.put(&current)?;
                Ok(true)
            })
            .await
    }
}
