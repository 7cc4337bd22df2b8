//! Request/response surface exposed to the UI shell.
//!
//! Versioned modules (currently `v1`) group related commands to keep the
//! interface stable while the implementation evolves.

pub mod v1;
