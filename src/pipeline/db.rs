//! SQLite persistence for entities
//!
//! Tables (see `/sql/`):
//! - `clock_ticks` - observed buckets (written by `clock`)
//! - `tokens`, `vaults`, `investor_positions`, `investors`, `protocol` - live entities
//! - `*_snapshots` - time-bucketed copies (written by `snapshots`)
//!
//! All functions take `&Connection`, so they work the same on a plain
//! connection and inside a `Transaction`.

use super::types::{
    EntityId, Investor, Position, Protocol, Token, Vault, VaultLifecycle, VaultTokens,
};
use bigdecimal::BigDecimal;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;

/// Schema files, applied in order
const MIGRATIONS: [(&str, &str); 3] = [
    ("00_clock_ticks.sql", include_str!("../../sql/00_clock_ticks.sql")),
    ("01_entities.sql", include_str!("../../sql/01_entities.sql")),
    ("02_snapshots.sql", include_str!("../../sql/02_snapshots.sql")),
];

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Sqlite(err)
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(err)
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            DbError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for DbError {}

/// Run schema migrations
///
/// Every statement uses `IF NOT EXISTS`, so this is safe on every start.
pub fn run_schema_migrations(conn: &Connection) -> Result<(), DbError> {
    log::info!("🔧 Running schema migrations");

    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// Open (or create) the database file, enable WAL and apply the schema
pub fn open(db_path: impl AsRef<Path>) -> Result<Connection, DbError> {
    if let Some(parent) = db_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::info!("📊 SQLite journal mode: {}", mode);

    run_schema_migrations(&conn)?;
    Ok(conn)
}

/// In-memory database with the schema applied
pub fn open_in_memory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    run_schema_migrations(&conn)?;
    Ok(conn)
}

pub(crate) fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<BigDecimal> {
    let text: String = row.get(idx)?;
    BigDecimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn id_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<EntityId> {
    let bytes: Vec<u8> = row.get(idx)?;
    Ok(EntityId::new(bytes))
}

fn lifecycle_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<VaultLifecycle> {
    let text: String = row.get(idx)?;
    VaultLifecycle::from_str(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("Unknown vault lifecycle: {}", text).into(),
        )
    })
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

pub fn save_token(conn: &Connection, token: &Token) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO tokens (id, symbol, decimals) VALUES (?1, ?2, ?3)
        ON CONFLICT(id) DO UPDATE SET
            symbol = excluded.symbol,
            decimals = excluded.decimals
        "#,
        params![token.id.as_bytes(), token.symbol, token.decimals],
    )?;
    Ok(())
}

pub fn load_token(conn: &Connection, id: &EntityId) -> Result<Option<Token>, DbError> {
    let token = conn
        .query_row(
            "SELECT id, symbol, decimals FROM tokens WHERE id = ?1",
            params![id.as_bytes()],
            |row| {
                Ok(Token {
                    id: id_at(row, 0)?,
                    symbol: row.get(1)?,
                    decimals: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(token)
}

/// Resolve all four tokens a vault references; `None` if any is missing
pub fn load_vault_tokens(conn: &Connection, vault: &Vault) -> Result<Option<VaultTokens>, DbError> {
    let shares = load_token(conn, &vault.shares_token)?;
    let underlying0 = load_token(conn, &vault.underlying_token0)?;
    let underlying1 = load_token(conn, &vault.underlying_token1)?;
    let earned = load_token(conn, &vault.earned_token)?;

    Ok(match (shares, underlying0, underlying1, earned) {
        (Some(shares), Some(underlying0), Some(underlying1), Some(earned)) => Some(VaultTokens {
            shares,
            underlying0,
            underlying1,
            earned,
        }),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Vaults
// ---------------------------------------------------------------------------

const VAULT_COLUMNS: &str = "id, strategy, shares_token, underlying_token0, underlying_token1, \
     earned_token, lifecycle, price_range_min1, price_range_max1, \
     current_price_of_token0_in_token1, current_price_of_token0_in_usd, \
     price_range_min_usd, price_range_max_usd, underlying_amount0, underlying_amount1, \
     underlying_amount0_usd, underlying_amount1_usd, total_value_locked_usd";

fn vault_from_row(row: &Row<'_>) -> rusqlite::Result<Vault> {
    Ok(Vault {
        id: id_at(row, 0)?,
        strategy: id_at(row, 1)?,
        shares_token: id_at(row, 2)?,
        underlying_token0: id_at(row, 3)?,
        underlying_token1: id_at(row, 4)?,
        earned_token: id_at(row, 5)?,
        lifecycle: lifecycle_at(row, 6)?,
        price_range_min1: decimal_at(row, 7)?,
        price_range_max1: decimal_at(row, 8)?,
        current_price_of_token0_in_token1: decimal_at(row, 9)?,
        current_price_of_token0_in_usd: decimal_at(row, 10)?,
        price_range_min_usd: decimal_at(row, 11)?,
        price_range_max_usd: decimal_at(row, 12)?,
        underlying_amount0: decimal_at(row, 13)?,
        underlying_amount1: decimal_at(row, 14)?,
        underlying_amount0_usd: decimal_at(row, 15)?,
        underlying_amount1_usd: decimal_at(row, 16)?,
        total_value_locked_usd: decimal_at(row, 17)?,
    })
}

/// Insert or update a vault (UPSERT on id, insertion order is preserved)
pub fn save_vault(conn: &Connection, vault: &Vault) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO vaults (
            id, strategy, shares_token, underlying_token0, underlying_token1,
            earned_token, lifecycle, price_range_min1, price_range_max1,
            current_price_of_token0_in_token1, current_price_of_token0_in_usd,
            price_range_min_usd, price_range_max_usd, underlying_amount0, underlying_amount1,
            underlying_amount0_usd, underlying_amount1_usd, total_value_locked_usd
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        ON CONFLICT(id) DO UPDATE SET
            strategy = excluded.strategy,
            shares_token = excluded.shares_token,
            underlying_token0 = excluded.underlying_token0,
            underlying_token1 = excluded.underlying_token1,
            earned_token = excluded.earned_token,
            lifecycle = excluded.lifecycle,
            price_range_min1 = excluded.price_range_min1,
            price_range_max1 = excluded.price_range_max1,
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
            vault.id.as_bytes(),
            vault.strategy.as_bytes(),
            vault.shares_token.as_bytes(),
            vault.underlying_token0.as_bytes(),
            vault.underlying_token1.as_bytes(),
            vault.earned_token.as_bytes(),
            vault.lifecycle.as_str(),
            vault.price_range_min1.to_string(),
            vault.price_range_max1.to_string(),
            vault.current_price_of_token0_in_token1.to_string(),
            vault.current_price_of_token0_in_usd.to_string(),
            vault.price_range_min_usd.to_string(),
            vault.price_range_max_usd.to_string(),
            vault.underlying_amount0.to_string(),
            vault.underlying_amount1.to_string(),
            vault.underlying_amount0_usd.to_string(),
            vault.underlying_amount1_usd.to_string(),
            vault.total_value_locked_usd.to_string(),
        ],
    )?;
    Ok(())
}

/// All vaults of the protocol, in insertion order
pub fn load_vaults(conn: &Connection) -> Result<Vec<Vault>, DbError> {
    let sql = format!("SELECT {} FROM vaults ORDER BY rowid", VAULT_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let vaults = stmt
        .query_map([], vault_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(vaults)
}

pub fn load_vault(conn: &Connection, id: &EntityId) -> Result<Option<Vault>, DbError> {
    let sql = format!("SELECT {} FROM vaults WHERE id = ?1", VAULT_COLUMNS);
    let vault = conn
        .query_row(&sql, params![id.as_bytes()], vault_from_row)
        .optional()?;
    Ok(vault)
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

const POSITION_COLUMNS: &str = "id, vault, investor, shares_balance, underlying_balance0, \
     underlying_balance1, underlying_balance0_usd, underlying_balance1_usd, position_value_usd, \
     average_daily_position_value_usd_30d, average_daily_position_value_usd_state";

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: id_at(row, 0)?,
        vault: id_at(row, 1)?,
        investor: id_at(row, 2)?,
        shares_balance: decimal_at(row, 3)?,
        underlying_balance0: decimal_at(row, 4)?,
        underlying_balance1: decimal_at(row, 5)?,
        underlying_balance0_usd: decimal_at(row, 6)?,
        underlying_balance1_usd: decimal_at(row, 7)?,
        position_value_usd: decimal_at(row, 8)?,
        average_daily_position_value_usd_30d: decimal_at(row, 9)?,
        average_daily_position_value_usd_state: row.get(10)?,
    })
}

pub fn save_position(conn: &Connection, position: &Position) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO investor_positions (
            id, vault, investor, shares_balance, underlying_balance0, underlying_balance1,
            underlying_balance0_usd, underlying_balance1_usd, position_value_usd,
            average_daily_position_value_usd_30d, average_daily_position_value_usd_state
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(id) DO UPDATE SET
            shares_balance = excluded.shares_balance,
            underlying_balance0 = excluded.underlying_balance0,
            underlying_balance1 = excluded.underlying_balance1,
            underlying_balance0_usd = excluded.underlying_balance0_usd,
            underlying_balance1_usd = excluded.underlying_balance1_usd,
            position_value_usd = excluded.position_value_usd,
            average_daily_position_value_usd_30d = excluded.average_daily_position_value_usd_30d,
            average_daily_position_value_usd_state = excluded.average_daily_position_value_usd_state
        "#,
        params![
            position.id.as_bytes(),
            position.vault.as_bytes(),
            position.investor.as_bytes(),
            position.shares_balance.to_string(),
            position.underlying_balance0.to_string(),
            position.underlying_balance1.to_string(),
            position.underlying_balance0_usd.to_string(),
            position.underlying_balance1_usd.to_string(),
            position.position_value_usd.to_string(),
            position.average_daily_position_value_usd_30d.to_string(),
            position.average_daily_position_value_usd_state,
        ],
    )?;
    Ok(())
}

/// Positions of one vault, in insertion order
pub fn load_positions_for_vault(conn: &Connection, vault: &EntityId) -> Result<Vec<Position>, DbError> {
    let sql = format!(
        "SELECT {} FROM investor_positions WHERE vault = ?1 ORDER BY rowid",
        POSITION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let positions = stmt
        .query_map(params![vault.as_bytes()], position_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(positions)
}

pub fn load_position(conn: &Connection, id: &EntityId) -> Result<Option<Position>, DbError> {
    let sql = format!("SELECT {} FROM investor_positions WHERE id = ?1", POSITION_COLUMNS);
    let position = conn
        .query_row(&sql, params![id.as_bytes()], position_from_row)
        .optional()?;
    Ok(position)
}

// ---------------------------------------------------------------------------
// Investors
// ---------------------------------------------------------------------------

pub fn save_investor(conn: &Connection, investor: &Investor) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO investors (
            id, total_position_value_usd,
            average_daily_total_position_value_usd_30d,
            average_daily_total_position_value_usd_state
        ) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            total_position_value_usd = excluded.total_position_value_usd,
            average_daily_total_position_value_usd_30d = excluded.average_daily_total_position_value_usd_30d,
            average_daily_total_position_value_usd_state = excluded.average_daily_total_position_value_usd_state
        "#,
        params![
            investor.id.as_bytes(),
            investor.total_position_value_usd.to_string(),
            investor.average_daily_total_position_value_usd_30d.to_string(),
            investor.average_daily_total_position_value_usd_state,
        ],
    )?;
    Ok(())
}

pub fn load_investor(conn: &Connection, id: &EntityId) -> Result<Option<Investor>, DbError> {
    let investor = conn
        .query_row(
            r#"
            SELECT id, total_position_value_usd,
                   average_daily_total_position_value_usd_30d,
                   average_daily_total_position_value_usd_state
            FROM investors WHERE id = ?1
            "#,
            params![id.as_bytes()],
            |row| {
                Ok(Investor {
                    id: id_at(row, 0)?,
                    total_position_value_usd: decimal_at(row, 1)?,
                    average_daily_total_position_value_usd_30d: decimal_at(row, 2)?,
                    average_daily_total_position_value_usd_state: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(investor)
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// The singleton protocol row, zeroed if it was never written
pub fn load_protocol(conn: &Connection) -> Result<Protocol, DbError> {
    let protocol = conn
        .query_row(
            r#"
            SELECT id, total_value_locked_usd, active_vault_count, active_investor_count
            FROM protocol WHERE id = ?1
            "#,
            params![Protocol::singleton_id().as_bytes()],
            |row| {
                Ok(Protocol {
                    id: id_at(row, 0)?,
                    total_value_locked_usd: decimal_at(row, 1)?,
                    active_vault_count: row.get(2)?,
                    active_investor_count: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(protocol.unwrap_or_default())
}

pub fn save_protocol(conn: &Connection, protocol: &Protocol) -> Result<(), DbError> {
    conn.execute(
        r#"
        INSERT INTO protocol (id, total_value_locked_usd, active_vault_count, active_investor_count)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            total_value_locked_usd = excluded.total_value_locked_usd,
            active_vault_count = excluded.active_vault_count,
            active_investor_count = excluded.active_investor_count
        "#,
        params![
            protocol.id.as_bytes(),
            protocol.total_value_locked_usd.to_string(),
            protocol.active_vault_count,
            protocol.active_investor_count,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::Zero;

    fn id(byte: u8) -> EntityId {
        EntityId::new(vec![byte; 20])
    }

    fn make_vault(byte: u8) -> Vault {
        Vault::new(id(byte), id(0xa0), id(0xa1), id(0xa2), id(0xa3), id(0xa4))
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = open_in_memory().unwrap();
        run_schema_migrations(&conn).unwrap();
        run_schema_migrations(&conn).unwrap();
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vaultflow.db");

        let conn = open(&path).unwrap();
        save_protocol(&conn, &Protocol::new()).unwrap();
        drop(conn);

        // Reopening keeps data and re-applies the schema harmlessly
        let conn = open(&path).unwrap();
        assert_eq!(load_protocol(&conn).unwrap(), Protocol::new());
    }

    #[test]
    fn test_vault_upsert_preserves_insertion_order() {
        let conn = open_in_memory().unwrap();

        for byte in [3u8, 1, 2] {
            save_vault(&conn, &make_vault(byte)).unwrap();
        }

        // Update the first vault; it must stay first
        let mut first = make_vault(3);
        first.lifecycle = VaultLifecycle::Running;
        first.total_value_locked_usd = BigDecimal::from_str("1234.000000000000000001").unwrap();
        save_vault(&conn, &first).unwrap();

        let vaults = load_vaults(&conn).unwrap();
        let order: Vec<u8> = vaults.iter().map(|v| v.id.as_bytes()[0]).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(vaults[0], first);
        assert_eq!(load_vault(&conn, &id(3)).unwrap(), Some(first));
    }

    #[test]
    fn test_position_roundtrip_keeps_full_precision() {
        let conn = open_in_memory().unwrap();

        let mut position = Position::new(id(1), id(2));
        position.shares_balance = BigDecimal::from_str("0.000000000000000001").unwrap();
        position.underlying_balance0 = BigDecimal::from_str("98765432109876543210.123456789").unwrap();
        position.average_daily_position_value_usd_state = r#"{"version":1}"#.to_string();
        save_position(&conn, &position).unwrap();

        let loaded = load_position(&conn, &position.id).unwrap().unwrap();
        assert_eq!(loaded, position);

        let by_vault = load_positions_for_vault(&conn, &id(1)).unwrap();
        assert_eq!(by_vault.len(), 1);
        assert!(load_positions_for_vault(&conn, &id(2)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_investor_is_none() {
        let conn = open_in_memory().unwrap();
        assert!(load_investor(&conn, &id(9)).unwrap().is_none());

        let investor = Investor::new(id(9));
        save_investor(&conn, &investor).unwrap();
        assert_eq!(load_investor(&conn, &id(9)).unwrap(), Some(investor));
    }

    #[test]
    fn test_protocol_defaults_when_absent() {
        let conn = open_in_memory().unwrap();
        let protocol = load_protocol(&conn).unwrap();
        assert!(protocol.total_value_locked_usd.is_zero());
        assert_eq!(protocol.active_vault_count, 0);
    }

    #[test]
    fn test_vault_tokens_require_all_four() {
        let conn = open_in_memory().unwrap();
        let vault = make_vault(1);

        for (byte, symbol) in [(0xa1u8, "mooCL"), (0xa2, "WETH"), (0xa3, "USDC")] {
            save_token(
                &conn,
                &Token { id: id(byte), symbol: symbol.to_string(), decimals: 18 },
            )
            .unwrap();
        }
        assert!(load_vault_tokens(&conn, &vault).unwrap().is_none());

        save_token(&conn, &Token { id: id(0xa4), symbol: "ARB".to_string(), decimals: 18 }).unwrap();
        let tokens = load_vault_tokens(&conn, &vault).unwrap().unwrap();
        assert_eq!(tokens.underlying1.symbol, "USDC");
    }

    #[test]
    fn test_corrupt_decimal_is_an_error() {
        let conn = open_in_memory().unwrap();
        conn.execute(
            "INSERT INTO protocol VALUES (?1, 'not-a-number', 0, 0)",
            params![Protocol::singleton_id().as_bytes()],
        )
        .unwrap();
        assert!(matches!(load_protocol(&conn), Err(DbError::Sqlite(_))));
    }
}
