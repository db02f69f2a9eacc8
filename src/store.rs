use crate::error::EngineError;
use crate::model::{Position, PositionStatus};
use crate::types::Price;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Durable trade records. Opaque to the core; required to be
/// crash-consistent at the statement level. Accessed serially from the
/// execution stage and the position supervisor.
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Record a freshly opened position. Must be durable before the position
    /// becomes visible to the supervisor.
    async fn open_position(&self, position: &Position) -> Result<(), EngineError>;

    /// Mark a position closed with its exit fill and exact PnL.
    async fn close_position(
        &self,
        id: u64,
        exit_price: Price,
        exit_at: DateTime<Utc>,
        pnl: Decimal,
    ) -> Result<(), EngineError>;

    /// Positions currently recorded as open.
    async fn list_open(&self) -> Result<Vec<Position>, EngineError>;
}

/// In-memory trade store used by the paper session and the scenario tests.
/// `fail_writes` simulates a store outage for failure-path coverage.
pub struct MemoryTradeStore {
    positions: Mutex<HashMap<u64, Position>>,
    fail_writes: AtomicBool,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Toggle write failures.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a record directly (test setup for reconciliation scenarios).
    pub fn seed(&self, position: Position) {
        self.positions
            .lock()
            .expect("trade store poisoned")
            .insert(position.id, position);
    }

    /// Every record, open and closed.
    pub fn all(&self) -> Vec<Position> {
        self.positions
            .lock()
            .expect("trade store poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn check_writable(&self) -> Result<(), EngineError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(EngineError::Store("simulated write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryTradeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn open_position(&self, position: &Position) -> Result<(), EngineError> {
        self.check_writable()?;
        let mut positions = self.positions.lock().expect("trade store poisoned");
        if positions.contains_key(&position.id) {
            return Err(EngineError::Invariant(format!(
                "duplicate position id {}",
                position.id
            )));
        }
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn close_position(
        &self,
        id: u64,
        exit_price: Price,
        exit_at: DateTime<Utc>,
        pnl: Decimal,
    ) -> Result<(), EngineError> {
        self.check_writable()?;
        let mut positions = self.positions.lock().expect("trade store poisoned");
        match positions.get_mut(&id) {
            Some(position) => {
                position.status = PositionStatus::Closed;
                position.exit_price = Some(exit_price);
                position.exit_at = Some(exit_at);
                position.pnl = Some(pnl);
                Ok(())
            }
            None => Err(EngineError::Store(format!("unknown position id {}", id))),
        }
    }

    async fn list_open(&self) -> Result<Vec<Position>, EngineError> {
        let positions = self.positions.lock().expect("trade store poisoned");
        Ok(positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use crate::types::Symbol;

    fn position(id: u64) -> Position {
        Position {
            id,
            symbol: Symbol::parse("TSLA").unwrap(),
            direction: Direction::Long,
            qty: 100,
            entry_price: Price::from_str("250.00").unwrap(),
            entry_at: Utc::now(),
            stop_price: Price::from_str("248.00").unwrap(),
            take_profit_price: Price::from_str("255.00").unwrap(),
            max_hold_until: Utc::now(),
            status: PositionStatus::Open,
            origin_article_id: "a-1".to_string(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        }
    }

    #[tokio::test]
    async fn test_open_then_close_round_trip() {
        let store = MemoryTradeStore::new();
        store.open_position(&position(1)).await.unwrap();
        assert_eq!(store.list_open().await.unwrap().len(), 1);

        let exit = Price::from_str("252.50").unwrap();
        store
            .close_position(1, exit, Utc::now(), Decimal::new(250, 0))
            .await
            .unwrap();
        assert!(store.list_open().await.unwrap().is_empty());

        let all = store.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, PositionStatus::Closed);
        assert_eq!(all[0].exit_price, Some(exit));
        assert_eq!(all[0].pnl, Some(Decimal::new(250, 0)));
    }

    #[tokio::test]
    async fn test_duplicate_open_is_invariant_violation() {
        let store = MemoryTradeStore::new();
        store.open_position(&position(1)).await.unwrap();
        let err = store.open_position(&position(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[tokio::test]
    async fn test_write_failure_injection() {
        let store = MemoryTradeStore::new();
        store.set_fail_writes(true);
        let err = store.open_position(&position(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(err.exit_code(), 3);

        store.set_fail_writes(false);
        store.open_position(&position(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unknown_id_is_store_error() {
        let store = MemoryTradeStore::new();
        let err = store
            .close_position(99, Price::from_str("1.00").unwrap(), Utc::now(), Decimal::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
