//! Clock engine - per-tick aggregation cascade
//!
//! ## Flow
//!
//! ```text
//! on_tick(timestamp)
//!     ↓
//! hour bucket already observed? → AlreadyProcessed
//!     ↓
//! fetch latest data for every running vault (async, outside any transaction)
//!     ↓
//! BEGIN
//!   observe hour + day ticks
//!   vaults → positions → investors → protocol (+ snapshots)
//! COMMIT
//! ```
//!
//! Everything a tick writes lands in one transaction, so a failure part way
//! leaves no finalized days behind and the next tick in the same hour retries
//! from clean state.

use super::clock::{
    self, DAY, HOUR, INVESTOR_SNAPSHOT_PERIODS, PROTOCOL_SNAPSHOT_PERIODS, VAULT_SNAPSHOT_PERIODS,
};
use super::daily_avg::{DailyAvgError, DailyAvgState};
use super::db::{self, DbError};
use super::snapshots::{
    upsert_investor_snapshot, upsert_position_snapshot, upsert_protocol_snapshot,
    upsert_vault_snapshot, InvestorSnapshot, PositionSnapshot, ProtocolSnapshot, VaultSnapshot,
};
use super::source::VaultDataSource;
use super::types::{Vault, VaultLatestData};
use super::valuation::{apply_vault_data, revalue_position, InvestorTotals, ProtocolTotals};
use bigdecimal::BigDecimal;
use log::{debug, info, warn};
use rusqlite::Connection;
use std::sync::Arc;

#[derive(Debug)]
pub enum EngineError {
    Db(DbError),
    /// A stored average state could not be decoded or advanced
    State(DailyAvgError),
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        EngineError::Db(err)
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Db(DbError::Sqlite(err))
    }
}

impl From<DailyAvgError> for EngineError {
    fn from(err: DailyAvgError) -> Self {
        EngineError::State(err)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Db(e) => write!(f, "Database error: {}", e),
            EngineError::State(e) => write!(f, "Average state error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// What one tick changed
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub timestamp: i64,
    pub is_new_day: bool,
    pub vaults_processed: usize,
    /// Running vaults left out (tokens missing or fetch failed)
    pub vaults_skipped: usize,
    pub positions_updated: usize,
    pub investors_updated: usize,
    pub total_value_locked_usd: BigDecimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The hour bucket was already processed; nothing was written
    AlreadyProcessed,
    Processed(TickSummary),
}

pub struct ClockEngine {
    conn: Connection,
    source: Arc<dyn VaultDataSource>,
}

impl ClockEngine {
    /// `conn` must already carry the schema (see `db::open`)
    pub fn new(conn: Connection, source: Arc<dyn VaultDataSource>) -> Self {
        Self { conn, source }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn on_tick(&mut self, timestamp: i64) -> Result<TickOutcome, EngineError> {
        if clock::tick_exists(&self.conn, timestamp, HOUR)? {
            debug!("⏭️  Hour bucket for {} already processed", timestamp);
            return Ok(TickOutcome::AlreadyProcessed);
        }

        let (fetched, vaults_skipped) = self.fetch_running_vaults().await?;

        let tx = self.conn.transaction()?;

        let hour = clock::observe(&tx, timestamp, HOUR)?;
        if !hour.is_new {
            return Ok(TickOutcome::AlreadyProcessed);
        }
        let day = clock::observe(&tx, timestamp, DAY)?;

        let summary = run_cascade(&tx, timestamp, day.is_new, fetched, vaults_skipped)?;
        tx.commit()?;

        info!(
            "✅ Tick {} processed{}",
            timestamp,
            if summary.is_new_day { " (new day)" } else { "" }
        );
        info!(
            "   ├─ Vaults: {} processed, {} skipped",
            summary.vaults_processed, summary.vaults_skipped
        );
        info!(
            "   ├─ Positions: {}, Investors: {}",
            summary.positions_updated, summary.investors_updated
        );
        info!("   └─ TVL: ${}", summary.total_value_locked_usd);

        Ok(TickOutcome::Processed(summary))
    }

    /// Latest data for every running vault, in vault order
    ///
    /// A vault whose tokens are missing or whose fetch fails is skipped for
    /// this tick. The connection is only read before the first fetch, so no
    /// borrow of it lives across an await.
    async fn fetch_running_vaults(
        &mut self,
    ) -> Result<(Vec<(Vault, VaultLatestData)>, usize), EngineError> {
        let mut candidates = Vec::new();
        let mut skipped = 0;

        for vault in db::load_vaults(&self.conn)?.into_iter().filter(Vault::is_running) {
            match db::load_vault_tokens(&self.conn, &vault)? {
                Some(tokens) => candidates.push((vault, tokens)),
                None => {
                    warn!("⚠️  Vault {} references unknown tokens, skipping", vault.id);
                    skipped += 1;
                }
            }
        }

        let source = Arc::clone(&self.source);
        let mut fetched = Vec::with_capacity(candidates.len());
        for (vault, tokens) in candidates {
            match source.fetch_vault_latest_data(&vault, &tokens).await {
                Ok(data) => fetched.push((vault, data)),
                Err(e) => {
                    warn!("⚠️  Failed to fetch data for vault {}: {}", vault.id, e);
                    skipped += 1;
                }
            }
        }

        Ok((fetched, skipped))
    }
}

/// Vault → position → investor → protocol, with snapshots at each level
fn run_cascade(
    conn: &Connection,
    timestamp: i64,
    is_new_day: bool,
    fetched: Vec<(Vault, VaultLatestData)>,
    vaults_skipped: usize,
) -> Result<TickSummary, EngineError> {
    let mut protocol_totals = ProtocolTotals::new();
    let mut investor_totals = InvestorTotals::new();
    let mut positions_updated = 0;

    for (mut vault, data) in fetched {
        let prices = apply_vault_data(&mut vault, &data);
        db::save_vault(conn, &vault)?;
        for period in VAULT_SNAPSHOT_PERIODS {
            upsert_vault_snapshot(conn, &VaultSnapshot::from_vault(&vault, period, timestamp))?;
        }
        protocol_totals.add_vault(&vault);

        for mut position in db::load_positions_for_vault(conn, &vault.id)? {
            if !position.is_active() {
                continue;
            }
            if db::load_investor(conn, &position.investor)?.is_none() {
                debug!(
                    "Position {} has no investor {}, skipping",
                    position.id, position.investor
                );
                continue;
            }

            revalue_position(&mut position, &prices);

            let mut state =
                DailyAvgState::deserialize(&position.average_daily_position_value_usd_state)?;
            position.average_daily_position_value_usd_30d =
                state.advance(position.position_value_usd.clone(), timestamp, is_new_day)?;
            position.average_daily_position_value_usd_state = state.serialize()?;

            db::save_position(conn, &position)?;
            for period in INVESTOR_SNAPSHOT_PERIODS {
                upsert_position_snapshot(
                    conn,
                    &PositionSnapshot::from_position(&position, period, timestamp),
                )?;
            }

            investor_totals.add(&position.investor, &position.position_value_usd);
            positions_updated += 1;
        }
    }

    let mut investors_updated = 0;
    for (investor_id, total) in investor_totals.iter() {
        let Some(mut investor) = db::load_investor(conn, investor_id)? else {
            continue;
        };

        investor.total_position_value_usd = total.clone();

        let mut state =
            DailyAvgState::deserialize(&investor.average_daily_total_position_value_usd_state)?;
        investor.average_daily_total_position_value_usd_30d =
            state.advance(total.clone(), timestamp, is_new_day)?;
        investor.average_daily_total_position_value_usd_state = state.serialize()?;

        db::save_investor(conn, &investor)?;
        for period in INVESTOR_SNAPSHOT_PERIODS {
            upsert_investor_snapshot(
                conn,
                &InvestorSnapshot::from_investor(&investor, period, timestamp),
            )?;
        }

        protocol_totals.add_investor();
        investors_updated += 1;
    }

    let mut protocol = db::load_protocol(conn)?;
    protocol.total_value_locked_usd = protocol_totals.total_value_locked_usd.clone();
    protocol.active_vault_count = protocol_totals.active_vault_count;
    protocol.active_investor_count = protocol_totals.active_investor_count;
    db::save_protocol(conn, &protocol)?;
    for period in PROTOCOL_SNAPSHOT_PERIODS {
        upsert_protocol_snapshot(
            conn,
            &ProtocolSnapshot::from_protocol(&protocol, period, timestamp),
        )?;
    }

    Ok(TickSummary {
        timestamp,
        is_new_day,
        vaults_processed: protocol_totals.active_vault_count as usize,
        vaults_skipped,
        positions_updated,
        investors_updated,
        total_value_locked_usd: protocol_totals.total_value_locked_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::SourceError;
    use crate::pipeline::types::{EntityId, VaultTokens};
    use async_trait::async_trait;

    struct FailingSource;

    #[async_trait]
    impl VaultDataSource for FailingSource {
        async fn fetch_vault_latest_data(
            &self,
            vault: &Vault,
            _tokens: &VaultTokens,
        ) -> Result<VaultLatestData, SourceError> {
            Err(SourceError::Status { vault: vault.id.to_hex(), status: 503 })
        }
    }

    #[tokio::test]
    async fn test_empty_store_tick() {
        let conn = db::open_in_memory().unwrap();
        let mut engine = ClockEngine::new(conn, Arc::new(FailingSource));

        let outcome = engine.on_tick(0).await.unwrap();
        let TickOutcome::Processed(summary) = outcome else {
            panic!("expected a processed tick");
        };
        assert!(summary.is_new_day);
        assert_eq!(summary.vaults_processed, 0);

        // Protocol row and its snapshots exist even with no vaults
        let protocol = db::load_protocol(engine.connection()).unwrap();
        assert_eq!(protocol.active_vault_count, 0);

        assert_eq!(engine.on_tick(1_800).await.unwrap(), TickOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_vault() {
        let conn = db::open_in_memory().unwrap();
        let id = |b: u8| EntityId::new(vec![b]);
        for byte in 2..=5 {
            db::save_token(
                &conn,
                &crate::pipeline::types::Token { id: id(byte), symbol: "T".to_string(), decimals: 18 },
            )
            .unwrap();
        }
        let mut vault = Vault::new(id(1), id(9), id(2), id(3), id(4), id(5));
        vault.lifecycle = crate::pipeline::types::VaultLifecycle::Running;
        db::save_vault(&conn, &vault).unwrap();

        let mut engine = ClockEngine::new(conn, Arc::new(FailingSource));
        let TickOutcome::Processed(summary) = engine.on_tick(0).await.unwrap() else {
            panic!("expected a processed tick");
        };
        assert_eq!(summary.vaults_processed, 0);
        assert_eq!(summary.vaults_skipped, 1);
    }
}
