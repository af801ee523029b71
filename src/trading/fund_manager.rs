//! Fund and risk manager: account balance, leverage and position sizing.
//!
//! After every realised profit or loss a fixed rule table adjusts leverage
//! and the suggested position size:
//!
//! | condition (vs. balance before the update) | effect                                   |
//! |-------------------------------------------|------------------------------------------|
//! | profit > 0 and profit >= 50% of balance   | leverage + 1, size = 5% risk             |
//! | profit <= 0                               | leverage = 1                             |
//! | profit <= 0 and new balance <= 30%        | size = whole balance                     |
//! | new balance <= 10%                        | leverage = 1, size = 2% risk (overrides) |

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::Direction;

/// Default parameter file name.
pub const DEFAULT_PARAMS_FILE: &str = "strategy_params.json";

const SCALE_UP_PROFIT_RATIO: Decimal = dec!(0.5);
const FULL_MARGIN_RATIO: Decimal = dec!(0.3);
const RESET_RATIO: Decimal = dec!(0.1);
const SCALE_UP_RISK_PERCENT: Decimal = dec!(5);
const RESET_RISK_PERCENT: Decimal = dec!(2);
const LIQUIDATION_BAND: Decimal = dec!(0.02);

/// Risk percent written to the parameter file regardless of actual usage.
const PERSISTED_RISK_PERCENT: u32 = 5;

/// Read-only sizing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeParams {
    pub position_size: Decimal,
    pub current_balance: Decimal,
    pub leverage: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedParams {
    #[serde(with = "rust_decimal::serde::float")]
    initial_balance: Decimal,
    leverage: u32,
    risk_percent: u32,
}

/// Owner of the account state.
#[derive(Debug, Clone)]
pub struct FundManager {
    balance: Decimal,
    leverage: u32,
    position_size: Decimal,
}

impl FundManager {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            balance: initial_balance,
            leverage: 1,
            position_size: Decimal::ZERO,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn leverage(&self) -> u32 {
        self.leverage
    }

    /// Size suggested by the last balance update.
    pub fn position_size(&self) -> Decimal {
        self.position_size
    }

    /// Overwrite the balance, e.g. from a user-entered starting amount.
    pub fn set_balance(&mut self, balance: Decimal) {
        debug!(old = %self.balance, new = %balance, "Balance overridden");
        self.balance = balance;
    }

    /// `balance * risk_percent / 100 * leverage`. The risk percent is not
    /// validated; negative or >100 values pass straight through. Errors only
    /// when the result leaves the `Decimal` range.
    pub fn calculate_position(&self, risk_percent: Decimal) -> Result<Decimal> {
        self.balance
            .checked_mul(risk_percent)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .and_then(|v| v.checked_mul(Decimal::from(self.leverage)))
            .with_context(|| {
                format!(
                    "Position size out of range for balance {} at {}% risk and {}x leverage",
                    self.balance, risk_percent, self.leverage
                )
            })
    }

    /// Apply a realised profit (positive) or loss (negative).
    ///
    /// On overflow the error is returned and the state is left unchanged.
    pub fn update_balance(&mut self, profit: Decimal) -> Result<()> {
        let initial_balance = self.balance;
        let mut next = self.clone();
        next.balance = initial_balance
            .checked_add(profit)
            .with_context(|| format!("Balance out of range: {} + {}", initial_balance, profit))?;

        if profit > Decimal::ZERO {
            // Undefined ratio on a zero starting balance: no scale-up
            let scale_up = profit
                .checked_div(initial_balance)
                .is_some_and(|ratio| ratio >= SCALE_UP_PROFIT_RATIO);
            if scale_up {
                next.leverage = next.leverage.saturating_add(1);
                next.position_size = next.calculate_position(SCALE_UP_RISK_PERCENT)?;
                info!(
                    leverage = next.leverage,
                    position_size = %next.position_size,
                    "Profit target reached, leverage increased"
                );
            }
        } else {
            next.leverage = 1;
            if next.balance <= initial_balance * FULL_MARGIN_RATIO {
                next.position_size = next.balance;
                warn!(balance = %next.balance, "Balance below 30% of previous, full-margin sizing");
            }
        }

        // Applies after either branch above; last write wins
        if next.balance <= initial_balance * RESET_RATIO {
            next.leverage = 1;
            next.position_size = next.calculate_position(RESET_RISK_PERCENT)?;
            warn!(
                balance = %next.balance,
                position_size = %next.position_size,
                "Balance below 10% of previous, sizing reset"
            );
        }

        *self = next;
        debug!(
            profit = %profit,
            balance = %self.balance,
            leverage = self.leverage,
            position_size = %self.position_size,
            "Balance updated"
        );
        Ok(())
    }

    /// Price at which a position opened at `entry_price` is liquidated
    /// (fixed 2% band).
    pub fn get_liquidation_price(&self, entry_price: Decimal, side: Direction) -> Decimal {
        match side {
            Direction::Long => entry_price * (Decimal::ONE - LIQUIDATION_BAND),
            Direction::Short => entry_price * (Decimal::ONE + LIQUIDATION_BAND),
        }
    }

    pub fn get_trade_params(&self, risk_percent: Decimal) -> Result<TradeParams> {
        Ok(TradeParams {
            position_size: self.calculate_position(risk_percent)?,
            current_balance: self.balance,
            leverage: self.leverage,
        })
    }

    /// Persist balance and leverage as JSON.
    pub fn save_params(&self, path: &Path) -> Result<()> {
        let params = PersistedParams {
            initial_balance: self.balance,
            leverage: self.leverage,
            risk_percent: PERSISTED_RISK_PERCENT,
        };
        let json = serde_json::to_string(&params).context("Failed to serialize parameters")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write parameter file {}", path.display()))?;

        info!(path = %path.display(), balance = %self.balance, leverage = self.leverage, "Parameters saved");
        Ok(())
    }

    /// Restore balance and leverage.
    ///
    /// Returns `Ok(false)` and keeps the current state when the file does
    /// not exist. A malformed file is an error and also leaves state as is.
    pub fn load_params(&mut self, path: &Path) -> Result<bool> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Parameter file not found, using current configuration");
                return Ok(false);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read parameter file {}", path.display()))
            }
        };

        let params: PersistedParams = serde_json::from_str(&contents)
            .with_context(|| format!("Malformed parameter file {}", path.display()))?;

        if params.leverage < 1 {
            anyhow::bail!("Invalid leverage {} in {}", params.leverage, path.display());
        }

        self.balance = params.initial_balance;
        self.leverage = params.leverage;

        info!(path = %path.display(), balance = %self.balance, leverage = self.leverage, "Parameters loaded");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(balance: Decimal, leverage: u32) -> FundManager {
        let mut fm = FundManager::new(balance);
        fm.leverage = leverage;
        fm
    }

    #[test]
    fn test_calculate_position_is_linear() {
        for (balance, risk, leverage) in [
            (dec!(0), dec!(5), 1),
            (dec!(100), dec!(2), 1),
            (dec!(250.5), dec!(7.5), 3),
            (dec!(1000), dec!(0), 10),
            (dec!(42), dec!(150), 2),
        ] {
            let fm = manager(balance, leverage);
            let expected = balance * risk * Decimal::from(leverage) / dec!(100);
            assert_eq!(fm.calculate_position(risk).unwrap(), expected);
        }
    }

    #[test]
    fn test_calculate_position_accepts_out_of_range_risk() {
        let fm = manager(dec!(100), 1);
        assert_eq!(fm.calculate_position(dec!(-10)).unwrap(), dec!(-10));
        assert_eq!(fm.calculate_position(dec!(200)).unwrap(), dec!(200));
    }

    #[test]
    fn test_large_profit_increments_leverage() {
        let mut fm = FundManager::new(dec!(100));
        fm.update_balance(dec!(60)).unwrap();

        assert_eq!(fm.balance(), dec!(160));
        assert_eq!(fm.leverage(), 2);
        // 5% risk on the updated balance and leverage: 160 * 0.05 * 2
        assert_eq!(fm.position_size(), dec!(16));
    }

    #[test]
    fn test_small_profit_keeps_state() {
        let mut fm = FundManager::new(dec!(100));
        fm.update_balance(dec!(49.99)).unwrap();

        assert_eq!(fm.leverage(), 1);
        assert_eq!(fm.position_size(), Decimal::ZERO);
    }

    #[test]
    fn test_loss_below_30_percent_uses_full_balance() {
        let mut fm = manager(dec!(100), 3);
        fm.update_balance(dec!(-75)).unwrap();

        assert_eq!(fm.balance(), dec!(25));
        assert_eq!(fm.leverage(), 1);
        // 25 > 10, so the 10% reset does not apply
        assert_eq!(fm.position_size(), dec!(25));
    }

    #[test]
    fn test_loss_below_10_percent_resets_sizing() {
        let mut fm = manager(dec!(100), 4);
        fm.update_balance(dec!(-95)).unwrap();

        assert_eq!(fm.balance(), dec!(5));
        assert_eq!(fm.leverage(), 1);
        // Overrides the full-balance size from the loss branch: 5 * 0.02 * 1
        assert_eq!(fm.position_size(), dec!(0.1));
    }

    #[test]
    fn test_small_loss_only_resets_leverage() {
        let mut fm = manager(dec!(100), 3);
        fm.update_balance(dec!(-10)).unwrap();

        assert_eq!(fm.leverage(), 1);
        assert_eq!(fm.position_size(), Decimal::ZERO);
    }

    #[test]
    fn test_balance_is_not_clamped() {
        let mut fm = FundManager::new(dec!(100));
        fm.update_balance(dec!(-150)).unwrap();

        assert_eq!(fm.balance(), dec!(-50));
        assert_eq!(fm.leverage(), 1);
    }

    #[test]
    fn test_profit_on_zero_balance_does_not_panic() {
        let mut fm = FundManager::new(Decimal::ZERO);
        fm.update_balance(dec!(10)).unwrap();

        assert_eq!(fm.balance(), dec!(10));
        assert_eq!(fm.leverage(), 1);
    }

    #[test]
    fn test_overflowing_profit_is_rejected() {
        let mut fm = manager(Decimal::MAX, 2);

        assert!(fm.update_balance(Decimal::MAX).is_err());
        assert_eq!(fm.balance(), Decimal::MAX);
        assert_eq!(fm.leverage(), 2);
        assert_eq!(fm.position_size(), Decimal::ZERO);
    }

    #[test]
    fn test_overflowing_position_size_is_an_error() {
        let fm = manager(Decimal::MAX, 3);
        assert!(fm.calculate_position(dec!(100)).is_err());
        assert!(fm.get_trade_params(dec!(100)).is_err());
    }

    #[test]
    fn test_overflow_during_scale_up_keeps_state() {
        // Sum fits but balance * 5 overflows before the divide
        let quarter = Decimal::MAX / dec!(4);
        let mut fm = manager(quarter, 40);

        assert!(fm.update_balance(quarter).is_err());
        assert_eq!(fm.balance(), quarter);
        assert_eq!(fm.leverage(), 40);
    }

    #[test]
    fn test_liquidation_price() {
        let fm = FundManager::new(dec!(100));
        assert_eq!(fm.get_liquidation_price(dec!(100), Direction::Long), dec!(98));
        assert_eq!(fm.get_liquidation_price(dec!(100), Direction::Short), dec!(102));
    }

    #[test]
    fn test_trade_params_snapshot() {
        let fm = manager(dec!(200), 2);
        let params = fm.get_trade_params(dec!(2)).unwrap();

        assert_eq!(params.position_size, dec!(8));
        assert_eq!(params.current_balance, dec!(200));
        assert_eq!(params.leverage, 2);
    }

    #[test]
    fn test_load_missing_file_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut fm = manager(dec!(123.45), 3);

        let loaded = fm.load_params(&dir.path().join("missing.json")).unwrap();

        assert!(!loaded);
        assert_eq!(fm.balance(), dec!(123.45));
        assert_eq!(fm.leverage(), 3);
    }

    #[test]
    fn test_save_and_load_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_PARAMS_FILE);

        manager(dec!(160.5), 2).save_params(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["risk_percent"], 5);
        assert_eq!(raw["leverage"], 2);
        assert_eq!(raw["initial_balance"].as_f64(), Some(160.5));

        let mut fm = FundManager::new(dec!(1));
        assert!(fm.load_params(&path).unwrap());
        assert_eq!(fm.balance(), dec!(160.5));
        assert_eq!(fm.leverage(), 2);
    }

    #[test]
    fn test_load_rejects_zero_leverage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"initial_balance": 50.0, "leverage": 0, "risk_percent": 5}"#).unwrap();

        let mut fm = FundManager::new(dec!(100));
        assert!(fm.load_params(&path).is_err());
        assert_eq!(fm.balance(), dec!(100));
        assert_eq!(fm.leverage(), 1);
    }
}
