//! Clock ticks and time buckets
//!
//! Every invocation timestamp maps to one bucket per period. A `clock_ticks`
//! row records that a bucket has been observed; the first observation wins and
//! later ones in the same bucket report `is_new == false`.

use super::db::DbError;
use super::types::EntityId;
use rusqlite::{params, Connection, OptionalExtension};

pub const MINUTES_15: i64 = 15 * 60;
pub const HOUR: i64 = 60 * 60;
pub const DAY: i64 = 24 * HOUR;
pub const WEEK: i64 = 7 * DAY;

/// Trailing window for the daily averages, in days
pub const AVERAGE_WINDOW_DAYS: u32 = 30;

pub const VAULT_SNAPSHOT_PERIODS: [i64; 3] = [HOUR, DAY, WEEK];
/// Used for both investor positions and investors
pub const INVESTOR_SNAPSHOT_PERIODS: [i64; 2] = [DAY, WEEK];
pub const PROTOCOL_SNAPSHOT_PERIODS: [i64; 3] = [HOUR, DAY, WEEK];

/// Start of the bucket containing `timestamp` (floor division)
pub fn interval_start(timestamp: i64, period: i64) -> i64 {
    timestamp.div_euclid(period) * period
}

/// Fixed-width key for a (period, bucket) pair
pub fn period_bucket_bytes(period: i64, rounded_timestamp: i64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&period.to_be_bytes());
    bytes.extend_from_slice(&rounded_timestamp.to_be_bytes());
    bytes
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockTick {
    pub id: EntityId,
    pub period: i64,
    /// First observed timestamp inside the bucket
    pub timestamp: i64,
    pub rounded_timestamp: i64,
}

impl ClockTick {
    pub fn new(timestamp: i64, period: i64) -> Self {
        let rounded_timestamp = interval_start(timestamp, period);
        Self {
            id: EntityId::new(period_bucket_bytes(period, rounded_timestamp)),
            period,
            timestamp,
            rounded_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockTickResult {
    pub tick: ClockTick,
    pub is_new: bool,
}

/// Check whether the bucket for `timestamp` was already observed
///
/// Read-only; used to short-circuit a tick before any external fetch.
pub fn tick_exists(conn: &Connection, timestamp: i64, period: i64) -> Result<bool, DbError> {
    let tick = ClockTick::new(timestamp, period);
    let mut stmt = conn.prepare_cached("SELECT 1 FROM clock_ticks WHERE id = ?1")?;
    Ok(stmt.exists(params![tick.id.as_bytes()])?)
}

/// Observe `timestamp` for `period`, persisting the tick if its bucket is new
pub fn observe(conn: &Connection, timestamp: i64, period: i64) -> Result<ClockTickResult, DbError> {
    let candidate = ClockTick::new(timestamp, period);

    let existing = conn
        .query_row(
            "SELECT timestamp FROM clock_ticks WHERE id = ?1",
            params![candidate.id.as_bytes()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    if let Some(first_seen) = existing {
        return Ok(ClockTickResult {
            tick: ClockTick {
                timestamp: first_seen,
                ..candidate
            },
            is_new: false,
        });
    }

    conn.execute(
        "INSERT INTO clock_ticks (id, period, timestamp, rounded_timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![
            candidate.id.as_bytes(),
            candidate.period,
            candidate.timestamp,
            candidate.rounded_timestamp,
        ],
    )?;

    Ok(ClockTickResult {
        tick: candidate,
        is_new: true,
    })
}
