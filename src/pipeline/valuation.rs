//! Per-tick valuation and rollups
//!
//! Pure functions over entities; the engine decides what to load and persist.

use super::types::{EntityId, Position, TokenPricesUsd, Vault, VaultLatestData};
use bigdecimal::{BigDecimal, Zero};
use std::collections::HashMap;

/// Refresh a vault's price and TVL fields from the latest on-chain data
///
/// Returns the per-token USD prices so positions can be revalued with them.
pub fn apply_vault_data(vault: &mut Vault, data: &VaultLatestData) -> TokenPricesUsd {
    let prices = TokenPricesUsd {
        token0: &data.token0_to_native * &data.native_to_usd,
        token1: &data.token1_to_native * &data.native_to_usd,
    };

    vault.current_price_of_token0_in_token1 = data.current_price_in_token1.clone();
    vault.current_price_of_token0_in_usd = prices.token0.clone();
    vault.price_range_min_usd = &vault.price_range_min1 * &prices.token1;
    vault.price_range_max_usd = &vault.price_range_max1 * &prices.token1;
    vault.underlying_amount0 = data.token0_balance.clone();
    vault.underlying_amount1 = data.token1_balance.clone();
    vault.underlying_amount0_usd = &data.token0_balance * &prices.token0;
    vault.underlying_amount1_usd = &data.token1_balance * &prices.token1;
    vault.total_value_locked_usd = &vault.underlying_amount0_usd + &vault.underlying_amount1_usd;

    prices
}

/// Recompute a position's USD values from its known underlying balances
pub fn revalue_position(position: &mut Position, prices: &TokenPricesUsd) {
    position.underlying_balance0_usd = &position.underlying_balance0 * &prices.token0;
    position.underlying_balance1_usd = &position.underlying_balance1 * &prices.token1;
    position.position_value_usd =
        &position.underlying_balance0_usd + &position.underlying_balance1_usd;
}

/// Per-investor running totals for one tick
///
/// Iterates in first-seen order so the rollup is deterministic.
#[derive(Debug, Default)]
pub struct InvestorTotals {
    order: Vec<EntityId>,
    totals: HashMap<EntityId, BigDecimal>,
}

impl InvestorTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, investor: &EntityId, value: &BigDecimal) {
        match self.totals.get_mut(investor) {
            Some(total) => *total += value,
            None => {
                self.order.push(investor.clone());
                self.totals.insert(investor.clone(), value.clone());
            }
        }
    }

    pub fn get(&self, investor: &EntityId) -> Option<&BigDecimal> {
        self.totals.get(investor)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &BigDecimal)> {
        self.order
            .iter()
            .filter_map(move |id| self.totals.get(id).map(|total| (id, total)))
    }
}

/// Protocol-wide sums for one tick
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolTotals {
    pub total_value_locked_usd: BigDecimal,
    pub active_vault_count: i64,
    pub active_investor_count: i64,
}

impl ProtocolTotals {
    pub fn new() -> Self {
        Self {
            total_value_locked_usd: BigDecimal::zero(),
            active_vault_count: 0,
            active_investor_count: 0,
        }
    }

    pub fn add_vault(&mut self, vault: &Vault) {
        self.total_value_locked_usd += &vault.total_value_locked_usd;
        self.active_vault_count += 1;
    }

    pub fn add_investor(&mut self) {
        self.active_investor_count += 1;
    }
}

impl Default for ProtocolTotals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn id(byte: u8) -> EntityId {
        EntityId::new(vec![byte])
    }

    fn latest(balance0: &str, balance1: &str) -> VaultLatestData {
        VaultLatestData {
            token0_balance: dec(balance0),
            token1_balance: dec(balance1),
            current_price_in_token1: dec("2000"),
            token0_to_native: dec("1"),
            token1_to_native: dec("0.0005"),
            native_to_usd: dec("2000"),
        }
    }

    #[test]
    fn test_apply_vault_data() {
        let mut vault = Vault::new(id(1), id(2), id(3), id(4), id(5), id(6));
        vault.price_range_min1 = dec("1500");
        vault.price_range_max1 = dec("2500");

        let prices = apply_vault_data(&mut vault, &latest("0.25", "500"));

        assert_eq!(prices.token0, dec("2000"));
        assert_eq!(prices.token1, dec("1"));
        assert_eq!(vault.current_price_of_token0_in_token1, dec("2000"));
        assert_eq!(vault.current_price_of_token0_in_usd, dec("2000"));
        assert_eq!(vault.price_range_min_usd, dec("1500"));
        assert_eq!(vault.price_range_max_usd, dec("2500"));
        assert_eq!(vault.underlying_amount0_usd, dec("500"));
        assert_eq!(vault.underlying_amount1_usd, dec("500"));
        assert_eq!(vault.total_value_locked_usd, dec("1000"));
    }

    #[test]
    fn test_revalue_position() {
        let mut position = Position::new(id(1), id(9));
        position.underlying_balance0 = dec("0.01");
        position.underlying_balance1 = dec("30");

        let prices = TokenPricesUsd { token0: dec("2000"), token1: dec("1") };
        revalue_position(&mut position, &prices);

        assert_eq!(position.underlying_balance0_usd, dec("20"));
        assert_eq!(position.underlying_balance1_usd, dec("30"));
        assert_eq!(position.position_value_usd, dec("50"));
    }

    #[test]
    fn test_investor_totals_sum_once() {
        let mut totals = InvestorTotals::new();
        totals.add(&id(7), &dec("50"));
        totals.add(&id(8), &dec("5"));
        totals.add(&id(7), &dec("70"));

        assert_eq!(totals.len(), 2);
        assert_eq!(totals.get(&id(7)), Some(&dec("120")));

        let order: Vec<_> = totals.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(order, vec![id(7), id(8)]);
    }

    #[test]
    fn test_investor_totals_order_independent_sum() {
        let mut forward = InvestorTotals::new();
        forward.add(&id(1), &dec("50"));
        forward.add(&id(1), &dec("70"));

        let mut backward = InvestorTotals::new();
        backward.add(&id(1), &dec("70"));
        backward.add(&id(1), &dec("50"));

        assert_eq!(forward.get(&id(1)), backward.get(&id(1)));
    }

    #[test]
    fn test_protocol_totals() {
        let mut totals = ProtocolTotals::new();
        let mut vault = Vault::new(id(1), id(2), id(3), id(4), id(5), id(6));
        vault.total_value_locked_usd = dec("1000");

        totals.add_vault(&vault);
        totals.add_investor();
        totals.add_investor();

        assert_eq!(totals.total_value_locked_usd, dec("1000"));
        assert_eq!(totals.active_vault_count, 1);
        assert_eq!(totals.active_investor_count, 2);
    }
}
