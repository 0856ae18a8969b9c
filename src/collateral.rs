//! collateral.rs – Borrowable-amount math and token base-unit conversion.
//!
//! For a stake of `amount` tokens priced at `price` with collateralization
//! ratio `r` (1.4 = 140 %):
//!
//!   borrowable = (amount / r) × price
//!
//! Every function here is pure. Anything that cannot be computed renders as
//! zero so the display layer always has a concrete value to show.
use alloy_primitives::{Address, U256};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::{AssetConfig, Settings};
use crate::errors::OpError;
use crate::models::PriceQuote;

/// SCOS is a standard 18-decimal ERC-20.
pub const SCOS_DECIMALS: u32 = 18;

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Maximum stable balance borrowable against `amount` tokens at `price`.
pub fn borrowable(amount: Decimal, price: Decimal, ratio: Decimal) -> Decimal {
    if ratio <= Decimal::ZERO || amount <= Decimal::ZERO || price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    amount
        .checked_div(ratio)
        .and_then(|collateral| collateral.checked_mul(price))
        .unwrap_or(Decimal::ZERO)
}

/// Same as [`borrowable`] for raw form input and a cache lookup.
pub fn borrowable_from_input(amount: &str, price: PriceQuote, ratio: Decimal) -> Decimal {
    borrowable(parse_lenient(amount), price.value_or_zero(), ratio)
}

/// Parse a number the way a form field would: anything unusable is zero.
pub fn parse_lenient(input: &str) -> Decimal {
    let trimmed = input.trim().replace(',', "");
    Decimal::from_str(&trimmed)
        .or_else(|_| Decimal::from_scientific(&trimmed))
        .unwrap_or(Decimal::ZERO)
}

/// Render with exactly `places` decimals, e.g. `0.00`.
pub fn display(value: Decimal, places: u32) -> String {
    let mut rounded = value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(places);
    rounded.to_string()
}

/// True when the price has fallen more than `threshold` (a fraction) below
/// the price the stake was opened at.
pub fn liquidation_risk(stake_price: Decimal, current_price: Decimal, threshold: Decimal) -> bool {
    if stake_price <= Decimal::ZERO {
        return false;
    }
    let drop = (stake_price - current_price)
        .checked_div(stake_price)
        .unwrap_or(Decimal::ZERO);
    drop > threshold
}

/// Price per token at which `staked` tokens were valued when `borrowed` was
/// drawn against them, i.e. `borrowable` solved for price.
pub fn implied_stake_price(staked: Decimal, borrowed: Decimal, ratio: Decimal) -> Option<Decimal> {
    if staked <= Decimal::ZERO || borrowed <= Decimal::ZERO || ratio <= Decimal::ZERO {
        return None;
    }
    borrowed.checked_mul(ratio)?.checked_div(staked)
}

// ---------------------------------------------------------------------------
// Base units
// ---------------------------------------------------------------------------

/// Convert a token quantity into its integer on-chain representation.
///
/// The conversion is exact: a quantity with more fractional digits than the
/// token supports is rejected rather than silently truncated.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<U256, OpError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(OpError::Validation(format!("amount {amount} is negative")));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals {
        return Err(OpError::Validation(format!(
            "amount {amount} has more than {decimals} decimal places"
        )));
    }
    let factor = U256::from(10u64)
        .checked_pow(U256::from(decimals - scale))
        .ok_or_else(|| OpError::Validation(format!("{decimals} decimals is out of range")))?;
    U256::from(normalized.mantissa().unsigned_abs())
        .checked_mul(factor)
        .ok_or_else(|| OpError::Validation(format!("amount {amount} overflows uint256")))
}

/// Inverse of [`to_base_units`] for display. `None` when the value does not
/// fit a `Decimal`.
pub fn from_base_units(units: U256, decimals: u32) -> Option<Decimal> {
    if units > U256::from(i128::MAX as u128) {
        return None;
    }
    let raw = units.to::<u128>() as i128;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .ok()
        .map(|d| d.normalize())
}

// ---------------------------------------------------------------------------
// Asset table
// ---------------------------------------------------------------------------

/// Per-asset precision and collateral parameters, keyed by token address.
#[derive(Debug, Clone)]
pub struct AssetTable {
    by_token: HashMap<Address, AssetConfig>,
    default_decimals: u32,
    default_ratio: Decimal,
}

impl AssetTable {
    pub fn new(assets: &[AssetConfig], default_decimals: u32, default_ratio: Decimal) -> Self {
        Self {
            by_token: assets
                .iter()
                .map(|a| (a.token_address, a.clone()))
                .collect(),
            default_decimals,
            default_ratio,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.assets,
            settings.collateral.default_decimals,
            settings.collateral.ratio,
        )
    }

    pub fn get(&self, token: &Address) -> Option<&AssetConfig> {
        self.by_token.get(token)
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&AssetConfig> {
        self.by_token
            .values()
            .find(|a| a.symbol.eq_ignore_ascii_case(symbol))
    }

    pub fn decimals_for(&self, token: &Address) -> u32 {
        self.get(token)
            .map(|a| a.decimals)
            .unwrap_or(self.default_decimals)
    }

    pub fn ratio_for(&self, token: &Address) -> Decimal {
        self.get(token)
            .and_then(|a| a.collateral_ratio)
            .unwrap_or(self.default_ratio)
    }

    pub fn symbol_for(&self, token: &Address) -> Option<&str> {
        self.get(token).map(|a| a.symbol.as_str())
    }

    pub fn default_ratio(&self) -> Decimal {
        self.default_ratio
    }
}
