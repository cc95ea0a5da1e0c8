//! Time-bucketed snapshots
//!
//! One row per (owner, period, bucket). The first write in a bucket fixes
//! `timestamp`; later writes in the same bucket overwrite the metrics only.

use super::clock::{interval_start, period_bucket_bytes};
use super::db::{decimal_at, id_at, DbError};
use super::types::{EntityId, Investor, Position, Protocol, Vault};
use bigdecimal::BigDecimal;
use rusqlite::{params, Connection, OptionalExtension};

/// `owner ++ period (8 B BE) ++ bucket (8 B BE)`
pub fn snapshot_id(owner: &EntityId, period: i64, timestamp: i64) -> EntityId {
    let bucket = interval_start(timestamp, period);
    owner.concat(&EntityId::new(period_bucket_bytes(period, bucket)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct VaultSnapshot {
    pub id: EntityId,
    pub vault: EntityId,
    pub period: i64,
    pub timestamp: i64,
    pub rounded_timestamp: i64,
    pub current_price_of_token0_in_token1: BigDecimal,
    pub current_price_of_token0_in_usd: BigDecimal,
    pub price_range_min_usd: BigDecimal,
    pub price_range_max_usd: BigDecimal,
    pub underlying_amount0: BigDecimal,
    pub underlying_amount1: BigDecimal,
    pub underlying_amount0_usd: BigDecimal,
    pub underlying_amount1_usd: BigDecimal,
    pub total_value_locked_usd: BigDecimal,
}

impl VaultSnapshot {
    pub fn from_vault(vault: &Vault, period: i64, timestamp: i64) -> Self {
        Self {
            id: snapshot_id(&vault.id, period, timestamp),
            vault: vault.id.clone(),
            period,
            timestamp,
            rounded_timestamp: interval_start(timestamp, period),
            current_price_of_token0_in_token1: vault.current_price_of_token0_in_token1.clone(),
            current_price_of_token0_in_usd: vault.current_price_of_token0_in_usd.clone(),
            price_range_min_usd: vault.price_range_min_usd.clone(),
            price_range_max_usd: vault.price_range_max_usd.clone(),
            underlying_amount0: vault.underlying_amount0.clone(),
            underlying_amount1: vault.underlying_amount1.clone(),
            underlying_amount0_usd: vault.underlying_amount0_usd.clone(),
            underlying_amount1_usd: vault.underlying_amount1_usd.clone(),
            total_value_locked_usd: vault.total_value_locked_usd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub id: EntityId,
    pub investor_position: EntityId,
    pub period: i64,
    pub timestamp: i64,
    pub rounded_timestamp: i64,
    pub shares_balance: BigDecimal,
    pub underlying_balance0: BigDecimal,
    pub underlying_balance1: BigDecimal,
    pub underlying_balance0_usd: BigDecimal,
    pub underlying_balance1_usd: BigDecimal,
    pub position_value_usd: BigDecimal,
}

impl PositionSnapshot {
    pub fn from_position(position: &Position, period: i64, timestamp: i64) -> Self {
        Self {
            id: snapshot_id(&position.id, period, timestamp),
            investor_position: position.id.clone(),
            period,
            timestamp,
            rounded_timestamp: interval_start(timestamp, period),
            shares_balance: position.shares_balance.clone(),
            underlying_balance0: position.underlying_balance0.clone(),
            underlying_balance1: position.underlying_balance1.clone(),
            underlying_balance0_usd: position.underlying_balance0_usd.clone(),
            underlying_balance1_usd: position.underlying_balance1_usd.clone(),
            position_value_usd: position.position_value_usd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvestorSnapshot {
    pub id: EntityId,
    pub investor: EntityId,
    pub period: i64,
    pub timestamp: i64,
    pub rounded_timestamp: i64,
    pub total_position_value_usd: BigDecimal,
}

impl InvestorSnapshot {
    pub fn from_investor(investor: &Investor, period: i64, timestamp: i64) -> Self {
        Self {
            id: snapshot_id(&investor.id, period, timestamp),
            investor: investor.id.clone(),
            period,
            timestamp,
            rounded_timestamp: interval_start(timestamp, period),
            total_position_value_usd: investor.total_position_value_usd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSnapshot {
    pub id: EntityId,
    pub protocol: EntityId,
    pub period: i64,
    pub timestamp: i64,
    pub rounded_timestamp: i64,
    pub total_value_locked_usd: BigDecimal,
    pub active_vault_count: i64,
    pub active_investor_count: i64,
}

impl ProtocolSnapshot {
    pub fn from_protocol(protocol: &Protocol, period: i64, timestamp: i64) -> Self {
        Self {
            id: snapshot_id(&protocol.id, period, timestamp),
            protocol: protocol.id.clone(),
            period,
            timestamp,
            rounded_timestamp: interval_start(timestamp, period),
            total_value_locked_usd: protocol.total_value_locked_usd.clone(),
            active_vault_count: protocol.active_vault_count,
            active_investor_count: protocol.active_investor_count,
        }
    }
}

pub fn upsert_vault_snapshot(conn: &Connection, snapshot: &VaultSnapshot) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO vault_snapshots (
            id, vault, period, timestamp, rounded_timestamp,
            current_price_of_token0_in_token1, current_price_of_token0_in_usd,
            price_range_min_usd, price_range_max_usd,
            underlying_amount0, underlying_amount1,
            underlying_amount0_usd, underlying_amount1_usd, total_value_locked_usd
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(id) DO UPDATE SET
            current_price_of_token0_in_token1 = excluded.current_price_of_token0_in_token1,
            current_price_of_token0_in_usd = excluded.current_price_of_token0_in_usd,
            price_range_min_usd = excluded.price_range_min_usd,
            price_range_max_usd = excluded.price_range_max_usd,
            underlying_amount0 = excluded.underlying_amount0,
            underlying_amount1 = excluded.underlying_amount1,
            underlying_amount0_usd = excluded.underlying_amount0_usd,
            underlying_amount1_usd = excluded.underlying_amount1_usd,
            total_value_locked_usd = excluded.total_value_locked_usd
        "#,
        params![
            snapshot.id.as_bytes(),
            snapshot.vault.as_bytes(),
            snapshot.period,
            snapshot.timestamp,
            snapshot.rounded_timestamp,
            snapshot.current_price_of_token0_in_token1.to_string(),
            snapshot.current_price_of_token0_in_usd.to_string(),
            snapshot.price_range_min_usd.to_string(),
            snapshot.price_range_max_usd.to_string(),
            snapshot.underlying_amount0.to_string(),
            snapshot.underlying_amount1.to_string(),
            snapshot.underlying_amount0_usd.to_string(),
            snapshot.underlying_amount1_usd.to_string(),
            snapshot.total_value_locked_usd.to_string(),
        ],
    )?;
    Ok(())
}

pub fn upsert_position_snapshot(
    conn: &Connection,
    snapshot: &PositionSnapshot,
) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO investor_position_snapshots (
            id, investor_position, period, timestamp, rounded_timestamp,
            shares_balance, underlying_balance0, underlying_balance1,
            underlying_balance0_usd, underlying_balance1_usd, position_value_usd
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            shares_balance = excluded.shares_balance,
            underlying_balance0 = excluded.underlying_balance0,
            underlying_balance1 = excluded.underlying_balance1,
            underlying_balance0_usd = excluded.underlying_balance0_usd,
            underlying_balance1_usd = excluded.underlying_balance1_usd,
            position_value_usd = excluded.position_value_usd
        "#,
        params![
            snapshot.id.as_bytes(),
            snapshot.investor_position.as_bytes(),
            snapshot.period,
            snapshot.timestamp,
            snapshot.rounded_timestamp,
            snapshot.shares_balance.to_string(),
            snapshot.underlying_balance0.to_string(),
            snapshot.underlying_balance1.to_string(),
            snapshot.underlying_balance0_usd.to_string(),
            snapshot.underlying_balance1_usd.to_string(),
            snapshot.position_value_usd.to_string(),
        ],
    )?;
    Ok(())
}

pub fn upsert_investor_snapshot(
    conn: &Connection,
    snapshot: &InvestorSnapshot,
) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO investor_snapshots (
            id, investor, period, timestamp, rounded_timestamp, total_position_value_usd
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
            total_position_value_usd = excluded.total_position_value_usd
        "#,
        params![
            snapshot.id.as_bytes(),
            snapshot.investor.as_bytes(),
            snapshot.period,
            snapshot.timestamp,
            snapshot.rounded_timestamp,
            snapshot.total_position_value_usd.to_string(),
        ],
    )?;
    Ok(())
}

pub fn upsert_protocol_snapshot(
    conn: &Connection,
    snapshot: &ProtocolSnapshot,
) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO protocol_snapshots (
            id, protocol, period, timestamp, rounded_timestamp,
            total_value_locked_usd, active_vault_count, active_investor_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            total_value_locked_usd = excluded.total_value_locked_usd,
            active_vault_count = excluded.active_vault_count,
            active_investor_count = excluded.active_investor_count
        "#,
        params![
            snapshot.id.as_bytes(),
            snapshot.protocol.as_bytes(),
            snapshot.period,
            snapshot.timestamp,
            snapshot.rounded_timestamp,
            snapshot.total_value_locked_usd.to_string(),
            snapshot.active_vault_count,
            snapshot.active_investor_count,
        ],
    )?;
    Ok(())
}

/// Latest vault snapshot for a period, newest bucket first
pub fn latest_vault_snapshot(
    conn: &Connection,
    vault: &EntityId,
    period: i64,
) -> Result<Option<VaultSnapshot>, DbError> {
    let snapshot = conn
        .query_row(
            r#"
            SELECT id, vault, period, timestamp, rounded_timestamp,
                   current_price_of_token0_in_token1, current_price_of_token0_in_usd,
                   price_range_min_usd, price_range_max_usd,
                   underlying_amount0, underlying_amount1,
                   underlying_amount0_usd, underlying_amount1_usd, total_value_locked_usd
            FROM vault_snapshots
            WHERE vault = ?1 AND period = ?2
            ORDER BY rounded_timestamp DESC
            LIMIT 1
            "#,
            params![vault.as_bytes(), period],
            |row| {
                Ok(VaultSnapshot {
                    id: id_at(row, 0)?,
                    vault: id_at(row, 1)?,
                    period: row.get(2)?,
                    timestamp: row.get(3)?,
                    rounded_timestamp: row.get(4)?,
                    current_price_of_token0_in_token1: decimal_at(row, 5)?,
                    current_price_of_token0_in_usd: decimal_at(row, 6)?,
                    price_range_min_usd: decimal_at(row, 7)?,
                    price_range_max_usd: decimal_at(row, 8)?,
                    underlying_amount0: decimal_at(row, 9)?,
                    underlying_amount1: decimal_at(row, 10)?,
                    underlying_amount0_usd: decimal_at(row, 11)?,
                    underlying_amount1_usd: decimal_at(row, 12)?,
                    total_value_locked_usd: decimal_at(row, 13)?,
                })
            },
        )
        .optional()?;
    Ok(snapshot)
}

/// Protocol snapshot series for a period, oldest bucket first
pub fn protocol_snapshots(conn: &Connection, period: i64) -> Result<Vec<ProtocolSnapshot>, DbError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, protocol, period, timestamp, rounded_timestamp,
               total_value_locked_usd, active_vault_count, active_investor_count
        FROM protocol_snapshots
        WHERE period = ?1
        ORDER BY rounded_timestamp ASC
        "#,
    )?;
    let snapshots = stmt
        .query_map(params![period], |row| {
            Ok(ProtocolSnapshot {
                id: id_at(row, 0)?,
                protocol: id_at(row, 1)?,
                period: row.get(2)?,
                timestamp: row.get(3)?,
                rounded_timestamp: row.get(4)?,
                total_value_locked_usd: decimal_at(row, 5)?,
                active_vault_count: row.get(6)?,
                active_investor_count: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::{DAY, HOUR};
    use crate::pipeline::db::open_in_memory;

    fn vault_with_tvl(tvl: i64) -> Vault {
        let id = |b: u8| EntityId::new(vec![b; 4]);
        let mut vault = Vault::new(id(1), id(2), id(3), id(4), id(5), id(6));
        vault.total_value_locked_usd = BigDecimal::from(tvl);
        vault
    }

    #[test]
    fn test_snapshot_id_layout() {
        let owner = EntityId::new(vec![0xab, 0xcd]);
        let id = snapshot_id(&owner, HOUR, 7_300);
        let bytes = id.as_bytes();

        assert_eq!(bytes.len(), 2 + 16);
        assert_eq!(&bytes[..2], &[0xab, 0xcd]);
        assert_eq!(&bytes[2..10], &HOUR.to_be_bytes());
        assert_eq!(&bytes[10..], &7_200i64.to_be_bytes());

        // Same bucket, same id
        assert_eq!(snapshot_id(&owner, HOUR, 7_200), id);
        assert_ne!(snapshot_id(&owner, DAY, 7_300), id);
    }

    #[test]
    fn test_last_write_wins_within_bucket() {
        let conn = open_in_memory().unwrap();

        let first = VaultSnapshot::from_vault(&vault_with_tvl(100), HOUR, 3_700);
        upsert_vault_snapshot(&conn, &first).unwrap();

        let second = VaultSnapshot::from_vault(&vault_with_tvl(250), HOUR, 5_000);
        upsert_vault_snapshot(&conn, &second).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM vault_snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let stored = latest_vault_snapshot(&conn, &first.vault, HOUR).unwrap().unwrap();
        // Metrics overwritten, first timestamp kept
        assert_eq!(stored.total_value_locked_usd, BigDecimal::from(250));
        assert_eq!(stored.timestamp, 3_700);
        assert_eq!(stored.rounded_timestamp, 3_600);
    }

    #[test]
    fn test_new_bucket_adds_row() {
        let conn = open_in_memory().unwrap();

        upsert_vault_snapshot(&conn, &VaultSnapshot::from_vault(&vault_with_tvl(1), HOUR, 0)).unwrap();
        upsert_vault_snapshot(&conn, &VaultSnapshot::from_vault(&vault_with_tvl(2), HOUR, HOUR)).unwrap();

        let latest = latest_vault_snapshot(&conn, &EntityId::new(vec![1; 4]), HOUR)
            .unwrap()
            .unwrap();
        assert_eq!(latest.rounded_timestamp, HOUR);
        assert_eq!(latest.total_value_locked_usd, BigDecimal::from(2));
    }

    #[test]
    fn test_protocol_snapshot_carries_investor_count() {
        let conn = open_in_memory().unwrap();

        let mut protocol = Protocol::new();
        protocol.total_value_locked_usd = BigDecimal::from(1000);
        protocol.active_vault_count = 1;
        protocol.active_investor_count = 3;
        upsert_protocol_snapshot(&conn, &ProtocolSnapshot::from_protocol(&protocol, DAY, 10)).unwrap();

        let series = protocol_snapshots(&conn, DAY).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].active_investor_count, 3);
        assert_eq!(series[0].active_vault_count, 1);
        assert!(protocol_snapshots(&conn, HOUR).unwrap().is_empty());
    }

    #[test]
    fn test_position_and_investor_snapshots() {
        let conn = open_in_memory().unwrap();

        let mut position = Position::new(EntityId::new(vec![1]), EntityId::new(vec![2]));
        position.position_value_usd = BigDecimal::from(70);
        upsert_position_snapshot(&conn, &PositionSnapshot::from_position(&position, DAY, 100)).unwrap();
        position.position_value_usd = BigDecimal::from(75);
        upsert_position_snapshot(&conn, &PositionSnapshot::from_position(&position, DAY, 200)).unwrap();

        let value: String = conn
            .query_row(
                "SELECT position_value_usd FROM investor_position_snapshots",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "75");

        let investor = Investor::new(EntityId::new(vec![2]));
        upsert_investor_snapshot(&conn, &InvestorSnapshot::from_investor(&investor, DAY, 100)).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM investor_snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
