//! Rolling daily average over irregular samples
//!
//! Keeps a bounded history of finalized daily values plus the latest
//! observation of the still-open day, and computes a time-weighted mean over a
//! trailing window from them. The state is persisted per entity as a versioned
//! JSON blob.
//!
//! Lifecycle per entity and tick:
//! 1. `DailyAvgState::deserialize` the stored blob (empty blob → empty state)
//! 2. On the first tick of a new day, `close_pending_day` finalizes yesterday
//! 3. `set_pending_value` records the current observation
//! 4. `DailyAvgCalc::avg` computes the trailing average
//! 5. `evict_old_entries` bounds the history, then `serialize` back
//!
//! `advance` runs steps 2–5 in order.

use super::clock::{interval_start, AVERAGE_WINDOW_DAYS, DAY};
use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Current encoding version written by `serialize`
pub const DAILY_AVG_STATE_VERSION: u32 = 1;

/// Maximum number of finalized days kept in a state
pub const MAX_CLOSED_DAYS: usize = AVERAGE_WINDOW_DAYS as usize;

/// Decimal places kept on computed averages
pub const AVERAGE_SCALE: i64 = 18;

#[derive(Debug)]
pub enum DailyAvgError {
    Malformed(serde_json::Error),
    UnsupportedVersion(u32),
    OutOfOrderDay { day: i64, newest: i64 },
    TooManyEntries(usize),
}

impl From<serde_json::Error> for DailyAvgError {
    fn from(err: serde_json::Error) -> Self {
        DailyAvgError::Malformed(err)
    }
}

impl std::fmt::Display for DailyAvgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DailyAvgError::Malformed(e) => write!(f, "Malformed average state: {}", e),
            DailyAvgError::UnsupportedVersion(v) => {
                write!(f, "Unsupported average state version: {}", v)
            }
            DailyAvgError::OutOfOrderDay { day, newest } => write!(
                f,
                "Daily entry for day {} is older than newest entry {}",
                day, newest
            ),
            DailyAvgError::TooManyEntries(n) => {
                write!(f, "Average state holds {} entries (max {})", n, MAX_CLOSED_DAYS)
            }
        }
    }
}

impl std::error::Error for DailyAvgError {}

/// Finalized value for one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyEntry {
    /// Day start (unix seconds, multiple of `DAY`)
    pub day: i64,
    pub value: BigDecimal,
}

/// Latest observation inside the still-open day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSample {
    pub value: BigDecimal,
    pub timestamp: i64,
}

/// Persisted working set of the rolling average
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DailyAvgState {
    closed: VecDeque<DailyEntry>,
    pending: Option<PendingSample>,
}

/// On-disk envelope
#[derive(Serialize, Deserialize)]
struct EncodedState {
    version: u32,
    closed: Vec<DailyEntry>,
    pending: Option<PendingSample>,
}

impl DailyAvgState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed(&self) -> impl Iterator<Item = &DailyEntry> {
        self.closed.iter()
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    pub fn pending(&self) -> Option<&PendingSample> {
        self.pending.as_ref()
    }

    /// Append the finalized value of `day`
    ///
    /// `day` may be any timestamp inside the day. A value for the newest day
    /// overwrites it; an older day is rejected. The oldest entry is dropped
    /// once more than `MAX_CLOSED_DAYS` are held.
    pub fn add_value(&mut self, value: BigDecimal, day: i64) -> Result<(), DailyAvgError> {
        let day = interval_start(day, DAY);

        if let Some(newest) = self.closed.back_mut() {
            if newest.day == day {
                newest.value = value;
                return Ok(());
            }
            if newest.day > day {
                return Err(DailyAvgError::OutOfOrderDay {
                    day,
                    newest: newest.day,
                });
            }
        }

        self.closed.push_back(DailyEntry { day, value });
        while self.closed.len() > MAX_CLOSED_DAYS {
            self.closed.pop_front();
        }
        Ok(())
    }

    /// Finalize the pending sample as the closing value of its own day
    ///
    /// No-op when nothing is pending (first observation ever).
    pub fn close_pending_day(&mut self) -> Result<(), DailyAvgError> {
        match self.pending.take() {
            Some(pending) => self.add_value(pending.value, pending.timestamp),
            None => Ok(()),
        }
    }

    pub fn set_pending_value(&mut self, value: BigDecimal, timestamp: i64) {
        self.pending = Some(PendingSample { value, timestamp });
    }

    /// Drop finalized entries more than `days - 1` days older than the newest one
    pub fn evict_old_entries(&mut self, days: u32) {
        let Some(newest) = self.closed.back().map(|e| e.day) else {
            return;
        };
        let cutoff = newest - (days as i64 - 1) * DAY;
        self.closed.retain(|e| e.day >= cutoff);
    }

    /// Record one tick's observation and return the trailing window average
    ///
    /// The previous day is finalized when the tick opened a new day, or when
    /// the pending sample is from an earlier day (entity skipped ticks while
    /// inactive).
    pub fn advance(
        &mut self,
        value: BigDecimal,
        timestamp: i64,
        is_new_day: bool,
    ) -> Result<BigDecimal, DailyAvgError> {
        let pending_is_stale = self
            .pending
            .as_ref()
            .map_or(false, |p| interval_start(p.timestamp, DAY) < interval_start(timestamp, DAY));

        if is_new_day || pending_is_stale {
            self.close_pending_day()?;
        }
        self.set_pending_value(value, timestamp);

        let average = DailyAvgCalc::avg(AVERAGE_WINDOW_DAYS as i64 * DAY, self);
        self.evict_old_entries(AVERAGE_WINDOW_DAYS);
        Ok(average)
    }

    pub fn serialize(&self) -> Result<String, DailyAvgError> {
        let encoded = EncodedState {
            version: DAILY_AVG_STATE_VERSION,
            closed: self.closed.iter().cloned().collect(),
            pending: self.pending.clone(),
        };
        Ok(serde_json::to_string(&encoded)?)
    }

    /// Decode a stored blob; an empty blob is the empty state
    pub fn deserialize(blob: &str) -> Result<Self, DailyAvgError> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }

        let encoded: EncodedState = serde_json::from_str(blob)?;
        if encoded.version != DAILY_AVG_STATE_VERSION {
            return Err(DailyAvgError::UnsupportedVersion(encoded.version));
        }
        if encoded.closed.len() > MAX_CLOSED_DAYS {
            return Err(DailyAvgError::TooManyEntries(encoded.closed.len()));
        }
        for pair in encoded.closed.windows(2) {
            if pair[1].day <= pair[0].day {
                return Err(DailyAvgError::OutOfOrderDay {
                    day: pair[1].day,
                    newest: pair[0].day,
                });
            }
        }

        Ok(Self {
            closed: encoded.closed.into(),
            pending: encoded.pending,
        })
    }
}

/// Stateless calculations over a `DailyAvgState`
pub struct DailyAvgCalc;

impl DailyAvgCalc {
    /// Time-weighted mean over the trailing `period` seconds
    ///
    /// The window ends at the pending sample. The pending value weighs the
    /// time elapsed since its day started; each finalized day weighs one day,
    /// clipped to the window. Missing history is not padded.
    pub fn avg(period: i64, state: &DailyAvgState) -> BigDecimal {
        let end = match (&state.pending, state.closed.back()) {
            (Some(pending), _) => pending.timestamp,
            (None, Some(newest)) => newest.day + DAY,
            (None, None) => return BigDecimal::zero(),
        };
        let start = end - period;

        let mut weighted_sum = BigDecimal::zero();
        let mut total_weight: i64 = 0;

        // Finalized days never overlap the open day
        let closed_end = match &state.pending {
            Some(pending) => interval_start(pending.timestamp, DAY),
            None => end,
        };

        if let Some(pending) = &state.pending {
            let from = closed_end.max(start);
            let weight = (pending.timestamp - from).max(0);
            if weight > 0 {
                weighted_sum += &pending.value * BigDecimal::from(weight);
                total_weight += weight;
            }
        }

        for entry in state.closed.iter().rev() {
            let day_end = entry.day + DAY;
            if day_end <= start {
                break;
            }
            let from = entry.day.max(start);
            let to = day_end.min(closed_end);
            if to <= from {
                continue;
            }
            let weight = to - from;
            weighted_sum += &entry.value * BigDecimal::from(weight);
            total_weight += weight;
        }

        if total_weight == 0 {
            return match (&state.pending, state.closed.back()) {
                (Some(pending), _) => pending.value.clone(),
                (None, Some(newest)) => newest.value.clone(),
                (None, None) => BigDecimal::zero(),
            };
        }

        (weighted_sum / BigDecimal::from(total_weight)).round(AVERAGE_SCALE)
    }

    pub fn evict_old_entries(days: u32, mut state: DailyAvgState) -> DailyAvgState {
        state.evict_old_entries(days);
        state
    }
}
