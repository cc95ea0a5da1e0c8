//! Core entity types for the vault indexer
//!
//! Entities mirror the persisted schema in `/sql/`:
//! - `tokens` → `Token`
//! - `vaults` → `Vault`
//! - `investor_positions` → `Position`
//! - `investors` → `Investor`
//! - `protocol` → `Protocol`
//!
//! All monetary fields are `BigDecimal` so repeated accumulation never drifts.

use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Byte identity of an entity (on-chain address or derived key)
///
/// Displayed and parsed as `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(Vec<u8>);

impl EntityId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Concatenate two identities (position ids are `vault ++ investor`)
    pub fn concat(&self, other: &EntityId) -> EntityId {
        let mut bytes = Vec::with_capacity(self.0.len() + other.0.len());
        bytes.extend_from_slice(&self.0);
        bytes.extend_from_slice(&other.0);
        EntityId(bytes)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for EntityId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        Ok(EntityId(hex::decode(trimmed)?))
    }
}

impl From<&[u8]> for EntityId {
    fn from(bytes: &[u8]) -> Self {
        EntityId(bytes.to_vec())
    }
}

/// Token metadata (resolved upstream, read-only here)
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: EntityId,
    pub symbol: String,
    pub decimals: u8,
}

/// Vault lifecycle as maintained by the event handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultLifecycle {
    Initializing,
    Running,
    Paused,
}

impl VaultLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultLifecycle::Initializing => "INITIALIZING",
            VaultLifecycle::Running => "RUNNING",
            VaultLifecycle::Paused => "PAUSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INITIALIZING" => Some(VaultLifecycle::Initializing),
            "RUNNING" => Some(VaultLifecycle::Running),
            "PAUSED" => Some(VaultLifecycle::Paused),
            _ => None,
        }
    }
}

/// Concentrated-liquidity vault with its latest valuation
#[derive(Debug, Clone, PartialEq)]
pub struct Vault {
    pub id: EntityId,
    pub strategy: EntityId,
    pub shares_token: EntityId,
    pub underlying_token0: EntityId,
    pub underlying_token1: EntityId,
    pub earned_token: EntityId,
    pub lifecycle: VaultLifecycle,

    // Configured price range, expressed in token1
    pub price_range_min1: BigDecimal,
    pub price_range_max1: BigDecimal,

    // Recomputed every tick
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

impl Vault {
    /// New vault with all valuation fields zeroed
    pub fn new(
        id: EntityId,
        strategy: EntityId,
        shares_token: EntityId,
        underlying_token0: EntityId,
        underlying_token1: EntityId,
        earned_token: EntityId,
    ) -> Self {
        Self {
            id,
            strategy,
            shares_token,
            underlying_token0,
            underlying_token1,
            earned_token,
            lifecycle: VaultLifecycle::Initializing,
            price_range_min1: BigDecimal::zero(),
            price_range_max1: BigDecimal::zero(),
            current_price_of_token0_in_token1: BigDecimal::zero(),
            current_price_of_token0_in_usd: BigDecimal::zero(),
            price_range_min_usd: BigDecimal::zero(),
            price_range_max_usd: BigDecimal::zero(),
            underlying_amount0: BigDecimal::zero(),
            underlying_amount1: BigDecimal::zero(),
            underlying_amount0_usd: BigDecimal::zero(),
            underlying_amount1_usd: BigDecimal::zero(),
            total_value_locked_usd: BigDecimal::zero(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == VaultLifecycle::Running
    }
}

/// Tokens referenced by a vault, resolved for the data source
#[derive(Debug, Clone, PartialEq)]
pub struct VaultTokens {
    pub shares: Token,
    pub underlying0: Token,
    pub underlying1: Token,
    pub earned: Token,
}

/// One investor's holding in one vault
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: EntityId,
    pub vault: EntityId,
    pub investor: EntityId,
    pub shares_balance: BigDecimal,
    pub underlying_balance0: BigDecimal,
    pub underlying_balance1: BigDecimal,
    pub underlying_balance0_usd: BigDecimal,
    pub underlying_balance1_usd: BigDecimal,
    pub position_value_usd: BigDecimal,
    pub average_daily_position_value_usd_30d: BigDecimal,
    /// Serialized `DailyAvgState`
    pub average_daily_position_value_usd_state: String,
}

impl Position {
    pub fn new(vault: EntityId, investor: EntityId) -> Self {
        Self {
            id: vault.concat(&investor),
            vault,
            investor,
            shares_balance: BigDecimal::zero(),
            underlying_balance0: BigDecimal::zero(),
            underlying_balance1: BigDecimal::zero(),
            underlying_balance0_usd: BigDecimal::zero(),
            underlying_balance1_usd: BigDecimal::zero(),
            position_value_usd: BigDecimal::zero(),
            average_daily_position_value_usd_30d: BigDecimal::zero(),
            average_daily_position_value_usd_state: String::new(),
        }
    }

    /// Zero-share positions are skipped by the tick cascade
    pub fn is_active(&self) -> bool {
        !self.shares_balance.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Investor {
    pub id: EntityId,
    pub total_position_value_usd: BigDecimal,
    pub average_daily_total_position_value_usd_30d: BigDecimal,
    /// Serialized `DailyAvgState`
    pub average_daily_total_position_value_usd_state: String,
}

impl Investor {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            total_position_value_usd: BigDecimal::zero(),
            average_daily_total_position_value_usd_30d: BigDecimal::zero(),
            average_daily_total_position_value_usd_state: String::new(),
        }
    }
}

/// Protocol-wide aggregates (singleton row)
#[derive(Debug, Clone, PartialEq)]
pub struct Protocol {
    pub id: EntityId,
    pub total_value_locked_usd: BigDecimal,
    pub active_vault_count: i64,
    pub active_investor_count: i64,
}

impl Protocol {
    pub fn singleton_id() -> EntityId {
        EntityId::new(vec![0x01])
    }

    pub fn new() -> Self {
        Self {
            id: Self::singleton_id(),
            total_value_locked_usd: BigDecimal::zero(),
            active_vault_count: 0,
            active_investor_count: 0,
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest on-chain data for one vault, as returned by the data source
///
/// Decimals travel as strings on the wire so no precision is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultLatestData {
    pub token0_balance: BigDecimal,
    pub token1_balance: BigDecimal,
    pub current_price_in_token1: BigDecimal,
    pub token0_to_native: BigDecimal,
    pub token1_to_native: BigDecimal,
    pub native_to_usd: BigDecimal,
}

/// Per-token USD prices derived for one vault in one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPricesUsd {
    pub token0: BigDecimal,
    pub token1: BigDecimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_hex_roundtrip() {
        let id: EntityId = "0xdeadbeef".parse().unwrap();
        assert_eq!(id.as_bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.to_string(), "0xdeadbeef");

        let bare: EntityId = "0102".parse().unwrap();
        assert_eq!(bare.as_bytes(), &[1, 2]);
    }

    #[test]
    fn test_position_id_is_vault_then_investor() {
        let vault = EntityId::new(vec![0xaa]);
        let investor = EntityId::new(vec![0xbb, 0xcc]);
        let position = Position::new(vault, investor);
        assert_eq!(position.id.as_bytes(), &[0xaa, 0xbb, 0xcc]);
        assert!(!position.is_active());
    }

    #[test]
    fn test_lifecycle_strings() {
        for lifecycle in [
            VaultLifecycle::Initializing,
            VaultLifecycle::Running,
            VaultLifecycle::Paused,
        ] {
            assert_eq!(VaultLifecycle::from_str(lifecycle.as_str()), Some(lifecycle));
        }
        assert_eq!(VaultLifecycle::from_str("running"), None);
    }

    #[test]
    fn test_vault_latest_data_wire_format() {
        let json = r#"{
            "token0Balance": "10.5",
            "token1Balance": "20",
            "currentPriceInToken1": "1.25",
            "token0ToNative": "0.001",
            "token1ToNative": "0.0005",
            "nativeToUsd": "3000"
        }"#;
        let data: VaultLatestData = serde_json::from_str(json).unwrap();
        assert_eq!(data.token0_balance, BigDecimal::from_str("10.5").unwrap());
        assert_eq!(data.native_to_usd, BigDecimal::from(3000));
    }
}
