use crate::alerts::{AlertLevel, AlertManager};
use crate::broker::{BrokerBridge, OrderOutcome, OrderSide, OrderTicket};
use crate::config::RiskConfig;
use crate::connection::{ExecutionGate, SupervisorCommand};
use crate::error::EngineError;
use crate::model::{Direction, ExitReason, Position, PositionStatus, TradeSignal};
use crate::shutdown::Shutdown;
use crate::stages::position::PositionCommand;
use crate::stages::DRAIN_DEADLINE;
use crate::store::TradeStore;
use crate::types::Symbol;
use chrono::Utc;
use log::{debug, info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Account summary staleness tolerance before a refresh.
const ACCOUNT_STALE_TOLERANCE: Duration = Duration::from_secs(30);

/// Window in which a second signal for the same article is rejected.
const ARTICLE_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(600);

/// Work items for the serial execution worker. Entries come from detection,
/// exits from the position supervisor; one queue keeps submissions strictly
/// ordered.
#[derive(Debug)]
pub enum ExecCommand {
    Entry(TradeSignal),
    Exit(ExitRequest),
}

/// A close request from the position supervisor, routed through the
/// execution stage so exits share its gating and ordering.
#[derive(Debug)]
pub struct ExitRequest {
    pub position_id: u64,
    pub symbol: Symbol,
    pub direction: Direction,
    pub qty: i64,
    pub reason: ExitReason,
    pub respond_to: oneshot::Sender<Result<OrderOutcome, EngineError>>,
}

/// Serial order path: one worker, strict submission ordering. Gates on the
/// connection supervisor, sizes entries off the account value, and hands
/// filled positions to the supervisor only after the durable open record.
pub struct ExecutionStage {
    bridge: Arc<BrokerBridge>,
    store: Arc<dyn TradeStore>,
    alerts: Arc<AlertManager>,
    gate: Arc<ExecutionGate>,
    config: RiskConfig,
    position_tx: mpsc::UnboundedSender<PositionCommand>,
    supervisor_tx: mpsc::UnboundedSender<SupervisorCommand>,
    open_symbols: Arc<Mutex<HashSet<Symbol>>>,
    account: Option<(Decimal, Instant)>,
    recent_articles: HashMap<String, Instant>,
    next_position_id: u64,
}

impl ExecutionStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<BrokerBridge>,
        store: Arc<dyn TradeStore>,
        alerts: Arc<AlertManager>,
        gate: Arc<ExecutionGate>,
        config: RiskConfig,
        position_tx: mpsc::UnboundedSender<PositionCommand>,
        supervisor_tx: mpsc::UnboundedSender<SupervisorCommand>,
        open_symbols: Arc<Mutex<HashSet<Symbol>>>,
        next_position_id: u64,
    ) -> Self {
        Self {
            bridge,
            store,
            alerts,
            gate,
            config,
            position_tx,
            supervisor_tx,
            open_symbols,
            account: None,
            recent_articles: HashMap::new(),
            next_position_id,
        }
    }

    /// Runs the serial order path. Only an invariant violation ends the loop
    /// early; the error surfaces as a fatal engine exit.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ExecCommand>,
        mut shutdown: Shutdown,
    ) -> Result<(), EngineError> {
        info!("execution stage started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await?;
                }
                _ = shutdown.cancelled() => {
                    let deadline = Instant::now() + DRAIN_DEADLINE;
                    while Instant::now() < deadline {
                        match commands.try_recv() {
                            Ok(command) => self.handle(command).await?,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
        info!("execution stage stopped");
        Ok(())
    }

    async fn handle(&mut self, command: ExecCommand) -> Result<(), EngineError> {
        match command {
            ExecCommand::Entry(signal) => {
                if let Err(err) = self.handle_entry(signal).await {
                    match err {
                        EngineError::Store(_) => {
                            // The order may be live with no durable record;
                            // force reconciliation before trading resumes.
                            self.alerts.emit(
                                AlertLevel::Critical,
                                "execution",
                                format!("open-position record lost: {}", err),
                            );
                            let _ = self.supervisor_tx.send(SupervisorCommand::Demote {
                                reason: format!("trade store failure: {}", err),
                            });
                        }
                        EngineError::Invariant(_) => return Err(err),
                        other => warn!("entry failed: {}", other),
                    }
                }
            }
            ExecCommand::Exit(request) => self.handle_exit(request).await,
        }
        Ok(())
    }

    async fn handle_entry(&mut self, signal: TradeSignal) -> Result<(), EngineError> {
        let symbol = signal.symbol.clone();

        if self.is_recent_article(&signal.origin_article_id) {
            info!(
                "{}: rejecting repeat signal for article {}",
                symbol, signal.origin_article_id
            );
            return Ok(());
        }

        // Signals are dropped, never queued, while the gate is closed.
        if !self.gate.is_open() {
            info!(
                "{}: gate closed, dropping signal from article {}",
                symbol, signal.origin_article_id
            );
            return Ok(());
        }

        if signal.direction == Direction::Short && !self.config.allow_short {
            warn!(
                "{}: short signal rejected, shorting disabled (no locate support)",
                symbol
            );
            return Ok(());
        }

        if self.has_open_position(&symbol) {
            info!("{}: open position exists, dropping signal", symbol);
            return Ok(());
        }

        let account_value = match self.account_value().await {
            Ok(value) => value,
            Err(err) => {
                warn!("{}: cannot size order, account value unavailable: {}", symbol, err);
                return Ok(());
            }
        };

        let qty = position_size(
            account_value,
            self.config.per_trade_fraction,
            signal.signal_price.value(),
            signal.stop_price.value(),
        );
        if qty < 1 {
            info!(
                "{}: sized to zero shares (account {}, risk {}), dropping",
                symbol, account_value, self.config.per_trade_fraction
            );
            return Ok(());
        }

        let side = match signal.direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };
        let ticket = OrderTicket {
            symbol: symbol.clone(),
            side,
            qty,
        };

        // Final gate read immediately before submission.
        if !self.gate.is_open() {
            info!("{}: gate closed at submission, dropping signal", symbol);
            return Ok(());
        }
        let pending = self.bridge.place_order(&ticket)?;
        let order_req_id = pending.req_id;
        let outcome = match pending.outcome().await {
            Ok(outcome) => outcome,
            Err(err) => {
                if matches!(err, EngineError::Timeout(_)) {
                    self.bridge.cancel_order(order_req_id);
                }
                warn!("{}: entry order did not complete: {}", symbol, err);
                return Ok(());
            }
        };

        if outcome.filled < 1 {
            warn!(
                "{}: entry order ended {:?} with no fill, recording nothing",
                symbol, outcome.state
            );
            return Ok(());
        }
        if outcome.filled < qty {
            warn!(
                "{}: partial fill {}/{}, booking filled quantity",
                symbol, outcome.filled, qty
            );
        }

        let entry_price = outcome.avg_fill_price.unwrap_or(signal.signal_price);
        let take_profit_price = take_profit(entry_price.value(), signal.direction, self.config.take_profit_pct);
        let now = Utc::now();
        let position = Position {
            id: self.next_position_id,
            symbol: symbol.clone(),
            direction: signal.direction,
            qty: outcome.filled,
            entry_price,
            entry_at: now,
            stop_price: signal.stop_price,
            take_profit_price,
            max_hold_until: now + chrono::Duration::seconds(self.config.max_hold_secs as i64),
            status: PositionStatus::Open,
            origin_article_id: signal.origin_article_id.clone(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        };
        self.next_position_id += 1;

        // Durable record first; the supervisor must never see a position the
        // store does not.
        self.store.open_position(&position).await?;
        self.open_symbols
            .lock()
            .expect("open symbol set poisoned")
            .insert(symbol.clone());
        info!(
            "{}: opened {} x{} @ {} (stop {}, target {}, article {})",
            symbol,
            position.direction,
            position.qty,
            position.entry_price,
            position.stop_price,
            position.take_profit_price,
            position.origin_article_id
        );
        let _ = self.position_tx.send(PositionCommand::Track(position));
        Ok(())
    }

    async fn handle_exit(&mut self, request: ExitRequest) {
        if !self.gate.is_open() {
            let _ = request.respond_to.send(Err(EngineError::Transport(
                "execution gate closed".to_string(),
            )));
            return;
        }
        let side = match request.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };
        let ticket = OrderTicket {
            symbol: request.symbol.clone(),
            side,
            qty: request.qty,
        };
        info!(
            "{}: submitting {} close x{} for position {}",
            request.symbol, request.reason, request.qty, request.position_id
        );
        let result = match self.bridge.place_order(&ticket) {
            Ok(pending) => {
                let order_req_id = pending.req_id;
                let result = pending.outcome().await;
                if matches!(result, Err(EngineError::Timeout(_))) {
                    self.bridge.cancel_order(order_req_id);
                }
                result
            }
            Err(err) => Err(err),
        };
        let _ = request.respond_to.send(result);
    }

    async fn account_value(&mut self) -> Result<Decimal, EngineError> {
        if let Some((value, fetched_at)) = self.account {
            if fetched_at.elapsed() < ACCOUNT_STALE_TOLERANCE {
                return Ok(value);
            }
            debug!("account value stale ({:?} old), refreshing", fetched_at.elapsed());
        }
        let summary = self
            .bridge
            .account_summary(&self.config.account_value_tag)
            .await?;
        self.account = Some((summary.value, Instant::now()));
        Ok(summary.value)
    }

    fn is_recent_article(&mut self, article_id: &str) -> bool {
        let now = Instant::now();
        self.recent_articles
            .retain(|_, seen| now.duration_since(*seen) < ARTICLE_IDEMPOTENCY_WINDOW);
        if self.recent_articles.contains_key(article_id) {
            return true;
        }
        self.recent_articles.insert(article_id.to_string(), now);
        false
    }

    fn has_open_position(&self, symbol: &Symbol) -> bool {
        self.open_symbols
            .lock()
            .expect("open symbol set poisoned")
            .contains(symbol)
    }
}

/// Shares to buy: `floor(accountValue * riskPerTrade / |entry - stop|)`.
/// Zero when the per-share risk exceeds the risk budget.
pub fn position_size(
    account_value: Decimal,
    per_trade_fraction: Decimal,
    entry: Decimal,
    stop: Decimal,
) -> i64 {
    let per_share_risk = (entry - stop).abs();
    if per_share_risk.is_zero() {
        return 0;
    }
    let budget = account_value * per_trade_fraction;
    (budget / per_share_risk).floor().to_i64().unwrap_or(0).max(0)
}

/// Take-profit level: `entry * (1 ± takeProfitPct)`.
fn take_profit(entry: Decimal, direction: Direction, pct: Decimal) -> crate::types::Price {
    let level = match direction {
        Direction::Long => entry * (Decimal::ONE + pct),
        Direction::Short => entry * (Decimal::ONE - pct),
    };
    crate::types::Price::new(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Price;

    #[test]
    fn test_position_size_happy_path() {
        // account 100_000, risk 0.01 -> budget 1000; |10.40 - 9.90| = 0.50
        let qty = position_size(
            Decimal::new(100_000, 0),
            Decimal::new(1, 2),
            Decimal::new(1040, 2),
            Decimal::new(990, 2),
        );
        assert_eq!(qty, 2000);
    }

    #[test]
    fn test_position_size_floors() {
        // budget 1000 / 0.30 = 3333.33 -> 3333
        let qty = position_size(
            Decimal::new(100_000, 0),
            Decimal::new(1, 2),
            Decimal::new(1030, 2),
            Decimal::new(1000, 2),
        );
        assert_eq!(qty, 3333);
    }

    #[test]
    fn test_position_size_zero_when_risk_exceeds_budget() {
        // budget = 0.50, per-share risk 2.00 -> 0 shares, no order
        let qty = position_size(
            Decimal::new(50, 0),
            Decimal::new(1, 2),
            Decimal::new(1200, 2),
            Decimal::new(1000, 2),
        );
        assert_eq!(qty, 0);
    }

    #[test]
    fn test_position_size_degenerate_stop() {
        let qty = position_size(
            Decimal::new(100_000, 0),
            Decimal::new(1, 2),
            Decimal::new(1000, 2),
            Decimal::new(1000, 2),
        );
        assert_eq!(qty, 0);
    }

    #[test]
    fn test_take_profit_levels() {
        let pct = Decimal::new(2, 2); // 0.02
        assert_eq!(
            take_profit(Decimal::new(1040, 2), Direction::Long, pct),
            Price::from_str("10.608").unwrap()
        );
        assert_eq!(
            take_profit(Decimal::new(1000, 2), Direction::Short, pct),
            Price::from_str("9.80").unwrap()
        );
    }
}
