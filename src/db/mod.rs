//! Database module: insert payloads and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed insert payloads accepted by repositories.
//! - `repo`: SQL-only functions that map rows into `crate::model` entities.
//!
//! External modules should import from `tutorbench::db`, which re-exports the
//! repository API and the insert payloads.

pub mod model;
pub mod repo;

// Re-export the repository API at `crate::db::*`.
pub use repo::*;

// Surface insert payloads used by callers (handlers, batch orchestrator).
pub use model::{NewBatch, NewConversation, NewEvaluation};
