//! Version 1 of the request/response API used by the UI shell.
//!
//! Commands are thin wrappers that parse UI input, call into the core
//! components, and return JSON-friendly payloads. Failures come back as an
//! [`ApiError`] carrying the catalogue code and explanation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::cart::{Cart, CartLine};
use crate::db;
use crate::errors::IntakeError;
use crate::export;
use crate::gate::ImageQualityGate;
use crate::inbound::{
    CreateOutcome, ImagePage, InboundDocument, InboundRegistry, InboundStatus, MoveDirection,
    NewInbound,
};
use crate::inventory::{InventoryBoard, InventoryItem, Zone};
use crate::logging::{self, LogEntry};
use crate::session::{AdminGate, Identity, Session};
use crate::settings::{self, Setting};
use crate::store::Store;
use crate::sync::{Connectivity, PageUploader, SimulatedUploader, SyncReport, SyncTracker};

/// Shared state handed to every command.
#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub identity: Identity,
    pub registry: InboundRegistry,
    pub sync: SyncTracker,
    pub board: InventoryBoard,
    pub cart: Cart,
}

impl ApiState {
    /// Open (or create) the workspace database and wire the components with
    /// the simulated uploader.
    pub async fn open(workspace_dir: PathBuf, identity: Identity) -> anyhow::Result<Self> {
        let pool = db::init_db(workspace_dir).context("initialising the intake database")?;
        let store = Store::new(pool);
        let uploader = SimulatedUploader::from_store(&store)
            .await
            .context("reading sync settings")?;
        Ok(Self::with_uploader(store, identity, Arc::new(uploader)))
    }

    pub fn with_uploader(
        store: Store,
        identity: Identity,
        uploader: Arc<dyn PageUploader>,
    ) -> Self {
        Self {
            registry: InboundRegistry::new(store.clone()),
            sync: SyncTracker::new(store.clone(), uploader),
            board: InventoryBoard::new(store.clone()),
            cart: Cart::new(store.clone()),
            store,
            identity,
        }
    }
}

/// Error payload returned to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub explain: &'static str,
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        if !err.is_expected() {
            log::error!("[{}] {err}", err.code());
        }
        Self {
            code: err.code(),
            message: err.to_string(),
            explain: err.explain(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn parse_date(value: &str) -> ApiResult<Date> {
    Date::parse(value.trim(), &format_description!("[year]-[month]-[day]")).map_err(|e| {
        IntakeError::InvalidInput(format!("date {value:?} is not YYYY-MM-DD: {e}")).into()
    })
}

/// Health check for UI components.
pub fn ping() -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateInboundInput {
    pub ls_nr: String,
    pub supplier: String,
    pub date_doc: String,
    #[serde(default)]
    pub force: bool,
}

/// Register a delivery document; a likely duplicate comes back as a warning
/// until the user confirms with `force`.
pub async fn create_inbound(state: &ApiState, input: CreateInboundInput) -> ApiResult<CreateOutcome> {
    let new = NewInbound {
        ls_nr: input.ls_nr,
        supplier: input.supplier,
        date_doc: parse_date(&input.date_doc)?,
    };
    Ok(state.registry.create(&state.identity, new, input.force).await?)
}

#[derive(Debug, Deserialize)]
pub struct CapturePageInput {
    pub inbound_id: String,
    pub bytes: Vec<u8>,
}

/// Run a capture through the quality gate and attach it as the next page.
pub async fn capture_page(state: &ApiState, input: CapturePageInput) -> ApiResult<ImagePage> {
    // Settings may change between captures.
    let gate = ImageQualityGate::from_store(&state.store).await?;
    let accepted = gate.admit(input.bytes).await?;
    Ok(state
        .registry
        .attach_page(&state.identity, &input.inbound_id, accepted)
        .await?)
}

#[derive(Debug, Serialize)]
pub struct CaptureHint {
    pub sharpness: f64,
    pub threshold: f64,
    pub sharp_enough: bool,
}

/// Score a preview frame without admitting it, for live focus feedback.
pub async fn score_capture(state: &ApiState, bytes: Vec<u8>) -> ApiResult<CaptureHint> {
    let config = settings::load_gate_config(&state.store).await?;
    let threshold = config.blur_threshold;
    let gate = ImageQualityGate::new(config);
    let sharpness = tokio::task::spawn_blocking(move || gate.score(&bytes))
        .await
        .map_err(IntakeError::from)??;
    Ok(CaptureHint {
        sharpness,
        threshold,
        sharp_enough: sharpness >= threshold,
    })
}

pub async fn confirm_drawing(state: &ApiState, inbound_id: &str) -> ApiResult<InboundDocument> {
    Ok(state
        .registry
        .confirm_drawing_attached(&state.identity, inbound_id)
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct PageRef {
    pub inbound_id: String,
    pub page_id: String,
}

pub async fn delete_page(state: &ApiState, input: PageRef) -> ApiResult<Vec<ImagePage>> {
    Ok(state
        .registry
        .delete_page(&state.identity, &input.inbound_id, &input.page_id)
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct MovePageInput {
    pub inbound_id: String,
    pub page_id: String,
    pub direction: MoveDirection,
}

pub async fn move_page(state: &ApiState, input: MovePageInput) -> ApiResult<Vec<ImagePage>> {
    Ok(state
        .registry
        .move_page(&state.identity, &input.inbound_id, &input.page_id, input.direction)
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct RotatePageInput {
    pub page_id: String,
    pub degrees: f64,
}

pub async fn rotate_page(state: &ApiState, input: RotatePageInput) -> ApiResult<ImagePage> {
    let gate = ImageQualityGate::from_store(&state.store).await?;
    Ok(state
        .registry
        .rotate_page(&state.identity, &input.page_id, input.degrees, &gate)
        .await?)
}

pub async fn list_by_status(
    state: &ApiState,
    status: InboundStatus,
) -> ApiResult<Vec<InboundDocument>> {
    Ok(state.registry.find_by_status(status).await?)
}

#[derive(Debug, Serialize)]
pub struct PendingUploads {
    pub count: usize,
    pub pages: Vec<ImagePage>,
}

pub async fn pending_uploads(state: &ApiState) -> ApiResult<PendingUploads> {
    let pages = state.sync.pending().await?;
    Ok(PendingUploads {
        count: pages.len(),
        pages,
    })
}

pub async fn sync_now(state: &ApiState, online: bool) -> ApiResult<SyncReport> {
    let connectivity = if online {
        Connectivity::Online
    } else {
        Connectivity::Offline
    };
    Ok(state.sync.acknowledge_all(&state.identity, connectivity).await?)
}

#[derive(Debug, Deserialize)]
pub struct CartLineInput {
    pub name: String,
    pub qty: u32,
    #[serde(default)]
    pub note: String,
}

pub async fn add_cart_line(state: &ApiState, input: CartLineInput) -> ApiResult<CartLine> {
    Ok(state
        .cart
        .add(&state.identity, &input.name, input.qty, &input.note)
        .await?)
}

/// Cart as `Qty;Name;Note` CSV.
pub async fn export_cart(state: &ApiState) -> ApiResult<String> {
    let lines = state.cart.lines().await?;
    Ok(export::cart_csv(&lines))
}

#[derive(Debug, Deserialize)]
pub struct PlaceItemInput {
    pub zone: Zone,
    pub name: String,
    pub qty: u32,
    #[serde(default)]
    pub note: String,
}

pub async fn place_item(state: &ApiState, input: PlaceItemInput) -> ApiResult<InventoryItem> {
    Ok(state
        .board
        .place(&state.identity, input.zone, &input.name, input.qty, &input.note)
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct MoveItemInput {
    pub item_id: String,
    pub to: Zone,
    pub qty: u32,
}

pub async fn move_item(state: &ApiState, input: MoveItemInput) -> ApiResult<InventoryItem> {
    Ok(state
        .board
        .move_qty(&state.identity, &input.item_id, input.to, input.qty)
        .await?)
}

/// Audit trail of one document, oldest first.
pub async fn inbound_history(state: &ApiState, inbound_id: &str) -> ApiResult<Vec<LogEntry>> {
    Ok(logging::for_inbound(&state.store, inbound_id).await?)
}

/// Latest actions across the whole workspace.
pub async fn recent_activity(state: &ApiState, limit: usize) -> ApiResult<Vec<LogEntry>> {
    Ok(logging::recent(&state.store, limit).await?)
}

/// Every setting except the admin verifier, sorted by key.
pub async fn list_settings(state: &ApiState) -> ApiResult<Vec<Setting>> {
    Ok(settings::list(&state.store).await?)
}

pub async fn get_setting(state: &ApiState, key: &str) -> ApiResult<Option<serde_json::Value>> {
    Ok(settings::get(&state.store, key).await?)
}

pub async fn update_setting(
    state: &ApiState,
    session: &Session,
    key: &str,
    value: serde_json::Value,
) -> ApiResult<Setting> {
    Ok(settings::set(&state.store, session, key, value).await?)
}

/// Exchange the PIN for an elevated session. The shell keeps the session
/// for as long as the admin panel stays open.
pub async fn unlock_admin(state: &ApiState, pin: &str) -> ApiResult<Session> {
    Ok(AdminGate::unlock(&state.store, &state.identity, pin).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::encode_jpeg;
    use image::{DynamicImage, Rgb, RgbImage};

    async fn state() -> (tempfile::TempDir, ApiState) {
        let dir = tempfile::tempdir().unwrap();
        let state = ApiState::open(dir.path().to_path_buf(), Identity::new("ui").unwrap())
            .await
            .unwrap();
        (dir, state)
    }

    async fn inbound(state: &ApiState) -> InboundDocument {
        let input = CreateInboundInput {
            ls_nr: "LS-1".into(),
            supplier: "Acme".into(),
            date_doc: "2024-05-02".into(),
            force: false,
        };
        match create_inbound(state, input).await.unwrap() {
            CreateOutcome::Created(doc) => doc,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn settings_hide_the_pin_and_feed_the_gate() {
        let (_dir, state) = state().await;
        AdminGate::provision(&state.store, &state.identity, "1357")
            .await
            .unwrap();
        assert!(get_setting(&state, settings::ADMIN_PIN_DIGEST)
            .await
            .unwrap()
            .is_none());
        assert!(list_settings(&state)
            .await
            .unwrap()
            .iter()
            .all(|s| s.key != settings::ADMIN_PIN_DIGEST));

        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([128, 128, 128])));
        let preview = encode_jpeg(&flat, 90).unwrap();
        let hint = score_capture(&state, preview.clone()).await.unwrap();
        assert!(!hint.sharp_enough);
        assert_eq!(hint.threshold, 60.0);

        let admin = unlock_admin(&state, "1357").await.unwrap();
        update_setting(&state, &admin, settings::BLUR_THRESHOLD, serde_json::json!(0.0))
            .await
            .unwrap();
        let hint = score_capture(&state, preview).await.unwrap();
        assert!(hint.sharp_enough);
        assert_eq!(
            get_setting(&state, settings::BLUR_THRESHOLD).await.unwrap(),
            Some(serde_json::json!(0.0))
        );
    }

    #[test]
    fn ping_reports_ok() {
        assert_eq!(ping()["ok"], true);
    }

    #[tokio::test]
    async fn bad_dates_are_invalid_input() {
        let (_dir, state) = state().await;
        let input = CreateInboundInput {
            ls_nr: "LS-1".into(),
            supplier: "Acme".into(),
            date_doc: "02.05.2024".into(),
            force: false,
        };
        let err = create_inbound(&state, input).await.unwrap_err();
        assert_eq!(err.code, "GEN-1000");
    }

    #[tokio::test]
    async fn errors_carry_catalogue_codes() {
        let (_dir, state) = state().await;
        let doc = inbound(&state).await;
        assert_eq!(doc.date_doc.to_string(), "2024-05-02");

        let err = confirm_drawing(&state, &doc.id).await.unwrap_err();
        assert_eq!(err.code, "INB-1001");
        assert!(!err.explain.is_empty());

        let small = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([90, 90, 90])));
        let capture = CapturePageInput {
            inbound_id: doc.id.clone(),
            bytes: encode_jpeg(&small, 90).unwrap(),
        };
        let err = capture_page(&state, capture).await.unwrap_err();
        assert_eq!(err.code, "IMG-1001");
        assert_eq!(pending_uploads(&state).await.unwrap().count, 0);

        let err = unlock_admin(&state, "0000").await.unwrap_err();
        assert_eq!(err.code, "ADM-1001");

        let history = inbound_history(&state, &doc.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, crate::logging::LogAction::CreateInbound);
        assert_eq!(recent_activity(&state, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cart_round_trip_through_export() {
        let (_dir, state) = state().await;
        for (name, qty) in [("Glue", 2), ("Tape; wide", 1)] {
            let input = CartLineInput {
                name: name.into(),
                qty,
                note: String::new(),
            };
            add_cart_line(&state, input).await.unwrap();
        }
        let csv = export_cart(&state).await.unwrap();
        assert_eq!(csv, "Qty;Name;Note\n2;Glue;\n1;\"Tape; wide\";\n");
    }

    #[tokio::test]
    async fn board_commands_parse_zones() {
        let (_dir, state) = state().await;
        let place: PlaceItemInput = serde_json::from_value(serde_json::json!({
            "zone": "receiving",
            "name": "Beam",
            "qty": 4
        }))
        .unwrap();
        let item = place_item(&state, place).await.unwrap();
        let moved = move_item(
            &state,
            MoveItemInput {
                item_id: item.id,
                to: Zone::Workshop,
                qty: 4,
            },
        )
        .await
        .unwrap();
        assert_eq!(moved.zone, Zone::Workshop);
    }
}
