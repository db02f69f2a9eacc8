use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for Long, -1 for Short; used in exact PnL math.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// A ticker identified from a news article. At most one per article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerEvent {
    pub symbol: Symbol,
    pub article_id: String,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Entry signal produced by the detection stage. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeSignal {
    pub symbol: Symbol,
    pub direction: Direction,
    pub signal_price: Price,
    pub stop_price: Price,
    pub created_at: DateTime<Utc>,
    pub origin_article_id: String,
}

/// Position lifecycle. `Open -> Closing -> Closed` is the only forward path;
/// `StuckClosing` is terminal and requires operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    StuckClosing,
}

/// Why the supervisor closed (or tried to close) a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TimeStop,
    StopLoss,
    TakeProfit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TimeStop => write!(f, "time-stop"),
            ExitReason::StopLoss => write!(f, "stop-loss"),
            ExitReason::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// An open (or closed) trade. Created by the execution stage on fill; mutable
/// state is owned by the position supervisor from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub symbol: Symbol,
    pub direction: Direction,
    pub qty: i64,
    pub entry_price: Price,
    pub entry_at: DateTime<Utc>,
    pub stop_price: Price,
    pub take_profit_price: Price,
    pub max_hold_until: DateTime<Utc>,
    pub status: PositionStatus,
    /// Back-reference to the originating news article.
    pub origin_article_id: String,
    pub exit_price: Option<Price>,
    pub exit_at: Option<DateTime<Utc>>,
    pub pnl: Option<Decimal>,
}

impl Position {
    /// Exact realized PnL at the given exit price:
    /// `sign(direction) * (exit - entry) * qty`, in decimal.
    pub fn realized_pnl(&self, exit_price: Price) -> Decimal {
        self.direction.sign()
            * (exit_price.value() - self.entry_price.value())
            * Decimal::from(self.qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(direction: Direction, qty: i64, entry: &str) -> Position {
        Position {
            id: 1,
            symbol: Symbol::parse("KITT").unwrap(),
            direction,
            qty,
            entry_price: Price::from_str(entry).unwrap(),
            entry_at: Utc::now(),
            stop_price: Price::from_str("9.90").unwrap(),
            take_profit_price: Price::from_str("10.61").unwrap(),
            max_hold_until: Utc::now(),
            status: PositionStatus::Open,
            origin_article_id: "a-1".to_string(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        }
    }

    #[test]
    fn test_long_pnl_is_exact() {
        let position = sample_position(Direction::Long, 2000, "10.40");
        let pnl = position.realized_pnl(Price::from_str("10.65").unwrap());
        assert_eq!(pnl, Decimal::new(500, 0)); // 0.25 * 2000 = 500 exactly
    }

    #[test]
    fn test_short_pnl_sign() {
        let position = sample_position(Direction::Short, 100, "10.00");
        let pnl = position.realized_pnl(Price::from_str("9.50").unwrap());
        assert_eq!(pnl, Decimal::new(50, 0)); // -1 * (9.50 - 10.00) * 100

        let loss = position.realized_pnl(Price::from_str("10.25").unwrap());
        assert_eq!(loss, Decimal::new(-25, 0));
    }

    #[test]
    fn test_flat_exit_pnl_is_zero() {
        let position = sample_position(Direction::Long, 100, "10.40");
        assert_eq!(
            position.realized_pnl(Price::from_str("10.40").unwrap()),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_direction_sign_and_opposite() {
        assert_eq!(Direction::Long.sign(), Decimal::ONE);
        assert_eq!(Direction::Short.sign(), Decimal::NEGATIVE_ONE);
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Short.opposite(), Direction::Long);
    }
}
