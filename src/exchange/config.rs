//! Exchange configuration, deserializable from the host's loader.

use crate::exchange::fees::{FeePolicy, FeePolicyError, Tier};
use crate::types::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One fee tier as configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub volume_required: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
}

/// Fee schedule configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePolicyConfig {
    pub history_slots: usize,
    pub slot_period: Timestamp,
    pub tiers: Vec<TierConfig>,
}

impl FeePolicyConfig {
    /// A single zero-fee tier, for tests and minimal setups.
    #[must_use]
    pub fn zero_fee() -> Self {
        Self {
            history_slots: 2,
            slot_period: 1_000,
            tiers: vec![TierConfig {
                volume_required: Decimal::ZERO,
                maker_fee: Decimal::ZERO,
                taker_fee: Decimal::ZERO,
            }],
        }
    }

    pub fn build(&self) -> Result<FeePolicy, FeePolicyError> {
        FeePolicy::new(
            self.history_slots,
            self.slot_period,
            self.tiers
                .iter()
                .map(|tier| Tier {
                    volume_required: tier.volume_required,
                    maker_rate: tier.maker_fee,
                    taker_rate: tier.taker_fee,
                })
                .collect(),
        )
    }
}

/// Full configuration of a multi-book exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub price_decimals: u32,
    pub volume_decimals: u32,
    pub base_decimals: u32,
    pub quote_decimals: u32,
    pub initial_price: Decimal,
    pub maintenance_margin: Decimal,
    pub max_leverage: Decimal,
    pub max_loan: Decimal,
    #[serde(default)]
    pub min_order_size: Option<Decimal>,
    #[serde(default)]
    pub max_open_orders: Option<usize>,
    pub books: u32,
    pub initial_base: Decimal,
    pub initial_quote: Decimal,
    pub fee_policy: FeePolicyConfig,
}

/// Configuration rejection reasons; a CLI harness maps these to exit code 1.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} must be at least 2, was {1}")]
    DecimalsTooSmall(&'static str, u32),
    #[error("initial price must be positive, was {0}")]
    NonPositiveInitialPrice(Decimal),
    #[error("maintenance margin must lie in (0, 1), was {0}")]
    MaintenanceMarginOutOfRange(Decimal),
    #[error("max leverage must be non-negative, was {0}")]
    NegativeMaxLeverage(Decimal),
    #[error("max loan must be non-negative, was {0}")]
    NegativeMaxLoan(Decimal),
    #[error("an exchange needs at least one book")]
    NoBooks,
    #[error("initial balances must be non-negative")]
    NegativeInitialBalance,
    #[error(transparent)]
    FeePolicy(#[from] FeePolicyError),
}

impl ExchangeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("price_decimals", self.price_decimals),
            ("volume_decimals", self.volume_decimals),
            ("base_decimals", self.base_decimals),
            ("quote_decimals", self.quote_decimals),
        ] {
            if value < 2 {
                return Err(ConfigError::DecimalsTooSmall(name, value));
            }
        }
        if self.initial_price <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveInitialPrice(self.initial_price));
        }
        if self.maintenance_margin <= Decimal::ZERO || self.maintenance_margin >= Decimal::ONE {
            return Err(ConfigError::MaintenanceMarginOutOfRange(self.maintenance_margin));
        }
        if self.max_leverage < Decimal::ZERO {
            return Err(ConfigError::NegativeMaxLeverage(self.max_leverage));
        }
        if self.max_loan < Decimal::ZERO {
            return Err(ConfigError::NegativeMaxLoan(self.max_loan));
        }
        if self.books == 0 {
            return Err(ConfigError::NoBooks);
        }
        if self.initial_base < Decimal::ZERO || self.initial_quote < Decimal::ZERO {
            return Err(ConfigError::NegativeInitialBalance);
        }
        self.fee_policy.build()?;
        Ok(())
    }
}
