//! Stop-loss / take-profit exit rules.
//!
//! A position exits when its mark crosses the protective stop or the
//! profit target. Levels carried by the position (set by the strategy on
//! its signal) take precedence; otherwise the configured percentages
//! around the entry price apply. The stop wins when both would trigger.

use rust_decimal::Decimal;
use sentinel_core::{OrderSide, Position, Price};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Account balance fell below the configured minimum.
    LowBalance,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::LowBalance => "low_balance",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallback exit distances, in percent of the entry price.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRules {
    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,
    #[serde(default)]
    pub take_profit_pct: Option<Decimal>,
}

impl ExitRules {
    /// Effective stop level for `position`.
    pub fn stop_level(&self, position: &Position) -> Option<Price> {
        position.stop_loss.or_else(|| {
            let pct = self.stop_loss_pct?;
            Some(offset(position.entry_price, position.side, -pct))
        })
    }

    /// Effective profit target for `position`.
    pub fn target_level(&self, position: &Position) -> Option<Price> {
        position.take_profit.or_else(|| {
            let pct = self.take_profit_pct?;
            Some(offset(position.entry_price, position.side, pct))
        })
    }

    /// Check `position` against `mark`.
    pub fn evaluate(&self, position: &Position, mark: Price) -> Option<ExitReason> {
        if !mark.is_positive() {
            return None;
        }
        let long = position.side == OrderSide::Buy;

        if let Some(stop) = self.stop_level(position) {
            let hit = if long { mark <= stop } else { mark >= stop };
            if hit {
                return Some(ExitReason::StopLoss);
            }
        }
        if let Some(target) = self.target_level(position) {
            let hit = if long { mark >= target } else { mark <= target };
            if hit {
                return Some(ExitReason::TakeProfit);
            }
        }
        None
    }
}

/// Move `entry` by `pct` percent in the position's favourable direction
/// (negative `pct` moves against it).
fn offset(entry: Price, side: OrderSide, pct: Decimal) -> Price {
    let signed = pct * Decimal::from(side.sign());
    Price::new(entry.inner() * (Decimal::ONE_HUNDRED + signed) / Decimal::ONE_HUNDRED)
}

/// Realised return of exiting `position` at `exit`, in percent.
pub fn pnl_pct(position: &Position, exit: Price) -> Decimal {
    if !position.entry_price.is_positive() {
        return Decimal::ZERO;
    }
    (exit.inner() - position.entry_price.inner()) / position.entry_price.inner()
        * Decimal::ONE_HUNDRED
        * Decimal::from(position.side.sign())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sentinel_core::{InstrumentId, PositionId, ReservationId, Size};

    fn position(side: OrderSide, stop: Option<Price>, target: Option<Price>) -> Position {
        Position {
            id: PositionId::new(),
            instrument: InstrumentId::new("XLM/USD"),
            side,
            quantity: Size::new(dec!(40)),
            entry_price: Price::new(dec!(0.40)),
            reservation: ReservationId::new(),
            stop_loss: stop,
            take_profit: target,
            strategy_id: "test".to_string(),
            opened_at: Utc::now(),
        }
    }

    fn px(v: Decimal) -> Price {
        Price::new(v)
    }

    #[test]
    fn test_long_explicit_levels() {
        let rules = ExitRules::default();
        let pos = position(OrderSide::Buy, Some(px(dec!(0.35))), Some(px(dec!(0.41))));

        assert_eq!(rules.evaluate(&pos, px(dec!(0.34))), Some(ExitReason::StopLoss));
        assert_eq!(rules.evaluate(&pos, px(dec!(0.35))), Some(ExitReason::StopLoss));
        assert_eq!(rules.evaluate(&pos, px(dec!(0.41))), Some(ExitReason::TakeProfit));
        assert_eq!(rules.evaluate(&pos, px(dec!(0.38))), None);
    }

    #[test]
    fn test_short_levels_are_mirrored() {
        let rules = ExitRules::default();
        let pos = position(OrderSide::Sell, Some(px(dec!(0.45))), Some(px(dec!(0.36))));

        assert_eq!(rules.evaluate(&pos, px(dec!(0.46))), Some(ExitReason::StopLoss));
        assert_eq!(rules.evaluate(&pos, px(dec!(0.35))), Some(ExitReason::TakeProfit));
        assert_eq!(rules.evaluate(&pos, px(dec!(0.40))), None);
    }

    #[test]
    fn test_percentage_fallback() {
        let rules = ExitRules {
            stop_loss_pct: Some(dec!(1.5)),
            take_profit_pct: Some(dec!(2.5)),
        };
        let long = position(OrderSide::Buy, None, None);
        assert_eq!(rules.stop_level(&long), Some(px(dec!(0.394))));
        assert_eq!(rules.target_level(&long), Some(px(dec!(0.41))));

        let short = position(OrderSide::Sell, None, None);
        assert_eq!(rules.stop_level(&short), Some(px(dec!(0.406))));
        assert_eq!(rules.target_level(&short), Some(px(dec!(0.39))));
        assert_eq!(rules.evaluate(&short, px(dec!(0.407))), Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_explicit_level_overrides_percentage() {
        let rules = ExitRules {
            stop_loss_pct: Some(dec!(50)),
            take_profit_pct: None,
        };
        let pos = position(OrderSide::Buy, Some(px(dec!(0.39))), None);
        assert_eq!(rules.stop_level(&pos), Some(px(dec!(0.39))));
        assert_eq!(rules.target_level(&pos), None);
    }

    #[test]
    fn test_no_levels_never_exits() {
        let rules = ExitRules::default();
        let pos = position(OrderSide::Buy, None, None);
        assert_eq!(rules.evaluate(&pos, px(dec!(0.01))), None);
        assert_eq!(rules.evaluate(&pos, Price::ZERO), None);
    }

    #[test]
    fn test_pnl_pct_sign_follows_side() {
        let long = position(OrderSide::Buy, None, None);
        let short = position(OrderSide::Sell, None, None);
        assert_eq!(pnl_pct(&long, px(dec!(0.42))), dec!(5));
        assert_eq!(pnl_pct(&short, px(dec!(0.42))), dec!(-5));
    }
}
