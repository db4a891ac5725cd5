//! Durable storage for the narrative generation engine.
//!
//! Backed by SQLite through `sqlx`, using runtime-checked queries throughout
//! (no `query!`/`query_as!` macros) since the schema is brought up at runtime
//! by [`db::connect`] rather than known to the build environment.

pub mod db;
pub mod domain;
pub mod error;
pub mod repository;

pub use db::{connect, Database};
pub use error::{Result, StorageError};

pub use domain::{
    Chapter, Character, CostLedgerDay, CostLedgerEntry, Importance, PlotArc, PlotArcStatus,
    Project, ProjectStage, RewriteHistoryEntry, StyleProfile, Volume, WorldItem, WorldItemKind,
};
