//! Core library for offline capture of inbound delivery documents.
//!
//! Each module keeps one responsibility so the boundaries stay obvious:
//! - [`api`] exposes the request/response surface the UI shell invokes.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`store`] is the generic, transactional, indexed record store.
//! - [`errors`] keeps the central error catalogue with human friendly metadata.
//! - [`gate`] admits, normalises and rotates captured page images.
//! - [`hasher`] computes content digests.
//! - [`inbound`] manages delivery documents and their ordered pages.
//! - [`sync`] tracks which pages still await upload.
//! - [`inventory`] and [`cart`] hold the zone board and the reorder cart.
//! - [`export`] renders the cart as CSV.
//! - [`logging`] writes the audit trail; [`settings`] and [`session`] hold
//!   persisted configuration and the admin gate.

pub mod api;
pub mod cart;
pub mod db;
pub mod errors;
pub mod export;
pub mod gate;
pub mod hasher;
pub mod inbound;
pub mod inventory;
pub mod logging;
pub mod session;
pub mod settings;
pub mod store;
pub mod sync;

use time::OffsetDateTime;

/// Current wall-clock time as Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
