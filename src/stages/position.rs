use crate::alerts::{AlertLevel, AlertManager};
use crate::broker::{BrokerBridge, OrderOutcome};
use crate::model::{ExitReason, Position, PositionStatus};
use crate::shutdown::Shutdown;
use crate::stages::{ExecCommand, ExitRequest};
use crate::store::TradeStore;
use crate::types::{Price, Symbol};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Close attempts before a position is declared stuck.
const CLOSE_RETRIES: u32 = 3;
const CLOSE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Safety bound on waiting for the execution stage to answer an exit.
const CLOSE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time stops must fire even when the market is silent, so open positions
/// are also scanned on a timer.
const TIME_STOP_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Commands accepted by the position supervisor.
#[derive(Debug)]
pub enum PositionCommand {
    /// Begin supervising a position (from execution on fill, or from the
    /// connection supervisor after reconciliation).
    Track(Position),
    /// Re-open quote streams after a reconnect.
    ResumeStreams,
}

enum CloseResult {
    Filled {
        id: u64,
        outcome: OrderOutcome,
        reason: ExitReason,
    },
    Stuck {
        id: u64,
        reason: ExitReason,
    },
}

struct Tracked {
    position: Position,
    stream_task: Option<tokio::task::JoinHandle<()>>,
}

/// Supervises every open position: streams its quotes, evaluates exit rules
/// in priority order, and routes close orders back through the execution
/// stage so gating and submission ordering are preserved.
pub struct PositionSupervisor {
    bridge: Arc<BrokerBridge>,
    store: Arc<dyn TradeStore>,
    alerts: Arc<AlertManager>,
    exec_tx: mpsc::Sender<ExecCommand>,
    open_symbols: Arc<Mutex<HashSet<Symbol>>>,
}

impl PositionSupervisor {
    pub fn new(
        bridge: Arc<BrokerBridge>,
        store: Arc<dyn TradeStore>,
        alerts: Arc<AlertManager>,
        exec_tx: mpsc::Sender<ExecCommand>,
        open_symbols: Arc<Mutex<HashSet<Symbol>>>,
    ) -> Self {
        Self {
            bridge,
            store,
            alerts,
            exec_tx,
            open_symbols,
        }
    }

    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<PositionCommand>,
        mut shutdown: Shutdown,
    ) {
        info!("position supervisor started");
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<(u64, Price)>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CloseResult>();
        let mut tracked: HashMap<u64, Tracked> = HashMap::new();
        let mut scan = tokio::time::interval(TIME_STOP_SCAN_INTERVAL);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        PositionCommand::Track(position) => {
                            self.track(&mut tracked, &tick_tx, position);
                        }
                        PositionCommand::ResumeStreams => {
                            for entry in tracked.values_mut() {
                                if entry.position.status == PositionStatus::Open {
                                    self.open_stream(entry, &tick_tx);
                                }
                            }
                        }
                    }
                }
                tick = tick_rx.recv() => {
                    let Some((id, price)) = tick else { break };
                    if let Some(entry) = tracked.get_mut(&id) {
                        if entry.position.status == PositionStatus::Open {
                            if let Some(reason) =
                                exit_trigger(&entry.position, price, Utc::now())
                            {
                                self.initiate_close(entry, reason, &done_tx);
                            }
                        }
                    }
                }
                _ = scan.tick() => {
                    let now = Utc::now();
                    for entry in tracked.values_mut() {
                        if entry.position.status == PositionStatus::Open
                            && now >= entry.position.max_hold_until
                        {
                            self.initiate_close(entry, ExitReason::TimeStop, &done_tx);
                        }
                    }
                }
                result = done_rx.recv() => {
                    let Some(result) = result else { break };
                    self.finalize(&mut tracked, result).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        for entry in tracked.values_mut() {
            if let Some(task) = entry.stream_task.take() {
                task.abort();
            }
        }
        info!("position supervisor stopped");
    }

    fn track(
        &self,
        tracked: &mut HashMap<u64, Tracked>,
        tick_tx: &mpsc::UnboundedSender<(u64, Price)>,
        position: Position,
    ) {
        if tracked.contains_key(&position.id) {
            debug!("position {} already tracked", position.id);
            return;
        }
        // Reconciled positions arrive without having passed through the
        // execution stage's bookkeeping.
        self.open_symbols
            .lock()
            .expect("open symbol set poisoned")
            .insert(position.symbol.clone());
        info!(
            "supervising position {} ({} {} x{})",
            position.id, position.symbol, position.direction, position.qty
        );
        let mut entry = Tracked {
            position,
            stream_task: None,
        };
        self.open_stream(&mut entry, tick_tx);
        tracked.insert(entry.position.id, entry);
    }

    fn open_stream(&self, entry: &mut Tracked, tick_tx: &mpsc::UnboundedSender<(u64, Price)>) {
        if let Some(task) = entry.stream_task.take() {
            task.abort();
        }
        let id = entry.position.id;
        let symbol = entry.position.symbol.clone();
        match self.bridge.stream_quotes(&symbol) {
            Ok(mut stream) => {
                let tick_tx = tick_tx.clone();
                entry.stream_task = Some(tokio::spawn(async move {
                    while let Some(tick) = stream.next().await {
                        if tick_tx.send((id, tick.price)).is_err() {
                            break;
                        }
                    }
                    debug!("quote stream for position {} ended", id);
                }));
            }
            Err(err) => {
                warn!(
                    "{}: cannot open quote stream for position {}: {}",
                    symbol, id, err
                );
            }
        }
    }

    fn initiate_close(
        &self,
        entry: &mut Tracked,
        reason: ExitReason,
        done_tx: &mpsc::UnboundedSender<CloseResult>,
    ) {
        entry.position.status = PositionStatus::Closing;
        info!(
            "{}: {} triggered for position {}, closing",
            entry.position.symbol, reason, entry.position.id
        );
        let exec_tx = self.exec_tx.clone();
        let done_tx = done_tx.clone();
        let position = entry.position.clone();
        tokio::spawn(async move {
            for attempt in 1..=CLOSE_RETRIES {
                let (respond_to, response) = oneshot::channel();
                let request = ExitRequest {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    direction: position.direction,
                    qty: position.qty,
                    reason,
                    respond_to,
                };
                if exec_tx.send(ExecCommand::Exit(request)).await.is_err() {
                    warn!("execution stage gone, close attempt {} aborted", attempt);
                } else {
                    match tokio::time::timeout(CLOSE_RESPONSE_TIMEOUT, response).await {
                        Ok(Ok(Ok(outcome))) if outcome.filled > 0 => {
                            let _ = done_tx.send(CloseResult::Filled {
                                id: position.id,
                                outcome,
                                reason,
                            });
                            return;
                        }
                        Ok(Ok(Ok(outcome))) => {
                            warn!(
                                "close attempt {} for position {} ended {:?} unfilled",
                                attempt, position.id, outcome.state
                            );
                        }
                        Ok(Ok(Err(err))) => {
                            warn!(
                                "close attempt {} for position {} failed: {}",
                                attempt, position.id, err
                            );
                        }
                        Ok(Err(_)) | Err(_) => {
                            warn!(
                                "close attempt {} for position {} got no response",
                                attempt, position.id
                            );
                        }
                    }
                }
                if attempt < CLOSE_RETRIES {
                    tokio::time::sleep(CLOSE_RETRY_DELAY).await;
                }
            }
            let _ = done_tx.send(CloseResult::Stuck {
                id: position.id,
                reason,
            });
        });
    }

    async fn finalize(&self, tracked: &mut HashMap<u64, Tracked>, result: CloseResult) {
        match result {
            CloseResult::Filled { id, outcome, reason } => {
                let Some(mut entry) = tracked.remove(&id) else {
                    return;
                };
                if let Some(task) = entry.stream_task.take() {
                    task.abort();
                }
                let exit_price = outcome
                    .avg_fill_price
                    .unwrap_or(entry.position.entry_price);
                let exit_at = Utc::now();
                let pnl = entry.position.realized_pnl(exit_price);
                entry.position.status = PositionStatus::Closed;
                entry.position.exit_price = Some(exit_price);
                entry.position.exit_at = Some(exit_at);
                entry.position.pnl = Some(pnl);
                info!(
                    "{}: position {} closed ({}) @ {} pnl {}",
                    entry.position.symbol, id, reason, exit_price, pnl
                );
                if let Err(err) = self
                    .store
                    .close_position(id, exit_price, exit_at, pnl)
                    .await
                {
                    self.alerts.emit(
                        AlertLevel::Critical,
                        "positions",
                        format!("close record for position {} failed: {}", id, err),
                    );
                }
                self.open_symbols
                    .lock()
                    .expect("open symbol set poisoned")
                    .remove(&entry.position.symbol);
            }
            CloseResult::Stuck { id, reason } => {
                let Some(entry) = tracked.get_mut(&id) else {
                    return;
                };
                entry.position.status = PositionStatus::StuckClosing;
                if let Some(task) = entry.stream_task.take() {
                    task.abort();
                }
                // No further automated action; the broker-side position is
                // still live and needs an operator.
                self.alerts.emit(
                    AlertLevel::Critical,
                    "positions",
                    format!(
                        "position {} ({} x{}) stuck closing after {} attempts ({} exit)",
                        id, entry.position.symbol, entry.position.qty, CLOSE_RETRIES, reason
                    ),
                );
            }
        }
    }
}

/// Exit rules in priority order: time stop, then stop loss, then take
/// profit. Called on every tick and on the periodic scan.
pub fn exit_trigger(position: &Position, price: Price, now: DateTime<Utc>) -> Option<ExitReason> {
    use crate::model::Direction;

    if now >= position.max_hold_until {
        return Some(ExitReason::TimeStop);
    }
    let stop_hit = match position.direction {
        Direction::Long => price <= position.stop_price,
        Direction::Short => price >= position.stop_price,
    };
    if stop_hit {
        return Some(ExitReason::StopLoss);
    }
    let target_hit = match position.direction {
        Direction::Long => price >= position.take_profit_price,
        Direction::Short => price <= position.take_profit_price,
    };
    if target_hit {
        return Some(ExitReason::TakeProfit);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;
    use chrono::Duration as ChronoDuration;

    fn position(direction: Direction) -> Position {
        let now = Utc::now();
        Position {
            id: 1,
            symbol: Symbol::parse("KITT").unwrap(),
            direction,
            qty: 100,
            entry_price: Price::from_str("10.40").unwrap(),
            entry_at: now,
            stop_price: Price::from_str("9.90").unwrap(),
            take_profit_price: Price::from_str("10.61").unwrap(),
            max_hold_until: now + ChronoDuration::seconds(600),
            status: PositionStatus::Open,
            origin_article_id: "a-1".to_string(),
            exit_price: None,
            exit_at: None,
            pnl: None,
        }
    }

    #[test]
    fn test_long_stop_loss() {
        let p = position(Direction::Long);
        let now = Utc::now();
        assert_eq!(
            exit_trigger(&p, Price::from_str("9.90").unwrap(), now),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            exit_trigger(&p, Price::from_str("9.80").unwrap(), now),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(exit_trigger(&p, Price::from_str("10.00").unwrap(), now), None);
    }

    #[test]
    fn test_long_take_profit() {
        let p = position(Direction::Long);
        let now = Utc::now();
        assert_eq!(
            exit_trigger(&p, Price::from_str("10.61").unwrap(), now),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(exit_trigger(&p, Price::from_str("10.60").unwrap(), now), None);
    }

    #[test]
    fn test_short_triggers_mirror() {
        let mut p = position(Direction::Short);
        p.stop_price = Price::from_str("10.90").unwrap();
        p.take_profit_price = Price::from_str("10.19").unwrap();
        let now = Utc::now();
        assert_eq!(
            exit_trigger(&p, Price::from_str("10.90").unwrap(), now),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            exit_trigger(&p, Price::from_str("10.10").unwrap(), now),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(exit_trigger(&p, Price::from_str("10.50").unwrap(), now), None);
    }

    #[test]
    fn test_time_stop_takes_priority() {
        let mut p = position(Direction::Long);
        p.max_hold_until = Utc::now() - ChronoDuration::seconds(1);
        // Price would also hit the stop, but the time rule is evaluated first.
        assert_eq!(
            exit_trigger(&p, Price::from_str("9.80").unwrap(), Utc::now()),
            Some(ExitReason::TimeStop)
        );
    }
}
