//! # Tick-Driven Vault Aggregation
//!
//! On every admitted clock tick this pipeline revalues running vaults, the
//! investor positions inside them, the investors themselves and the protocol,
//! then writes time-bucketed snapshots of the results.
//!
//! ## Architecture
//!
//! ```text
//! clock tick
//!     ↓
//! clock::observe (hour bucket new? → day bucket new?)
//!     ↓
//! source::VaultDataSource (latest balances + prices per running vault)
//!     ↓
//! valuation (vault → position → investor → protocol)
//!     ↓
//! daily_avg (rolling 30-day time-weighted averages)
//!     ↓
//! snapshots (one row per entity, period and bucket)
//! ```
//!
//! ## Schema Reference
//!
//! All entities match the SQL schema in `/sql/`, applied by
//! `db::run_schema_migrations`.
//!
//! ## Module Organization
//!
//! - `types` - Entities and the data source payload
//! - `clock` - Periods, bucket math, tick observation
//! - `daily_avg` - Rolling average state and calculation
//! - `valuation` - Per-tick valuation and rollups
//! - `snapshots` - Snapshot records and upserts
//! - `db` - SQLite schema and entity repository
//! - `source` - Vault data source trait and HTTP client
//! - `engine` - Tick cascade orchestration
//! - `config` - Environment configuration

pub mod types;
pub mod clock;
pub mod daily_avg;
pub mod valuation;
pub mod snapshots;
pub mod db;
pub mod source;
pub mod engine;
pub mod config;

// Re-export commonly used types
pub use types::{EntityId, Investor, Position, Protocol, Token, Vault, VaultLatestData, VaultLifecycle};
pub use daily_avg::{DailyAvgCalc, DailyAvgState};
pub use source::{HttpVaultDataSource, VaultDataSource};
pub use engine::{ClockEngine, TickOutcome, TickSummary};
pub use config::EngineConfig;
