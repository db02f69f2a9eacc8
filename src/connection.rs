use crate::alerts::{AlertLevel, AlertManager};
use crate::broker::{BrokerBridge, SessionEvent};
use crate::config::{BrokerConfig, NewsConfig, RiskConfig};
use crate::error::EngineError;
use crate::model::Direction;
use crate::shutdown::Shutdown;
use crate::stages::position::PositionCommand;
use crate::store::TradeStore;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive failed connect/sync cycles tolerated before the process gives
/// up with an unrecoverable-broker exit.
const MAX_CONNECT_CYCLES: u32 = 8;

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 60;

/// The single boolean guarding all order submissions. True only while the
/// supervisor is `Operational`; the execution stage reads it immediately
/// before every submission.
pub struct ExecutionGate(AtomicBool);

impl ExecutionGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(false)))
    }

    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Connection supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Syncing,
    Operational,
    Degraded,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Syncing => "SYNCING",
            ConnState::Operational => "OPERATIONAL",
            ConnState::Degraded => "DEGRADED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnState,
    pub since: DateTime<Utc>,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

impl ConnectionStatus {
    fn new() -> Self {
        Self {
            state: ConnState::Disconnected,
            since: Utc::now(),
            last_error: None,
            reconnect_attempt: 0,
        }
    }
}

/// Requests other components can make of the supervisor.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Demote to `Degraded` (e.g., a store failure left an order without a
    /// durable record; positions must be reconciled on recovery).
    Demote { reason: String },
}

/// Drives the session state machine:
/// `Disconnected -> Connecting -> Syncing -> Operational -> Degraded`,
/// with jittered exponential backoff between failed cycles and a sync
/// checklist before the execution gate opens.
pub struct ConnectionSupervisor {
    bridge: Arc<BrokerBridge>,
    store: Arc<dyn TradeStore>,
    alerts: Arc<AlertManager>,
    gate: Arc<ExecutionGate>,
    status: Arc<RwLock<ConnectionStatus>>,
    broker: BrokerConfig,
    news: NewsConfig,
    risk: RiskConfig,
    position_tx: mpsc::UnboundedSender<PositionCommand>,
}

impl ConnectionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: Arc<BrokerBridge>,
        store: Arc<dyn TradeStore>,
        alerts: Arc<AlertManager>,
        gate: Arc<ExecutionGate>,
        broker: BrokerConfig,
        news: NewsConfig,
        risk: RiskConfig,
        position_tx: mpsc::UnboundedSender<PositionCommand>,
    ) -> Self {
        Self {
            bridge,
            store,
            alerts,
            gate,
            status: Arc::new(RwLock::new(ConnectionStatus::new())),
            broker,
            news,
            risk,
            position_tx,
        }
    }

    /// Shared view of the current connection status.
    pub fn status_handle(&self) -> Arc<RwLock<ConnectionStatus>> {
        Arc::clone(&self.status)
    }

    pub async fn run(
        self,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        mut shutdown: Shutdown,
    ) -> Result<(), EngineError> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            self.set_state(ConnState::Connecting, attempt, None);
            if let Err(err) = self
                .bridge
                .connect(&self.broker.host, self.broker.port, self.broker.client_id)
                .await
            {
                attempt += 1;
                self.set_state(ConnState::Disconnected, attempt, Some(err.to_string()));
                warn!("connect attempt {} failed: {}", attempt, err);
                if attempt >= MAX_CONNECT_CYCLES {
                    error!("broker unreachable after {} attempts, giving up", attempt);
                    return Err(EngineError::Transport(format!(
                        "broker unreachable after {} attempts: {}",
                        attempt, err
                    )));
                }
                if self.sleep_or_shutdown(backoff_delay(attempt), &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
            // Stale session events from before this connect are meaningless.
            while session_events.try_recv().is_ok() {}

            self.set_state(ConnState::Syncing, attempt, None);
            if let Err(err) = self.sync_checklist().await {
                self.gate.close();
                attempt += 1;
                self.set_state(ConnState::Disconnected, attempt, Some(err.to_string()));
                warn!("sync checklist failed on attempt {}: {}", attempt, err);
                if attempt >= MAX_CONNECT_CYCLES {
                    return Err(EngineError::Transport(format!(
                        "sync checklist failed after {} attempts: {}",
                        attempt, err
                    )));
                }
                if self.sleep_or_shutdown(backoff_delay(attempt), &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }

            attempt = 0;
            self.set_state(ConnState::Operational, 0, None);
            self.gate.open();
            info!("execution gate open, engine is OPERATIONAL");

            // Hold here until the session degrades or we shut down.
            let demote_reason = loop {
                tokio::select! {
                    event = session_events.recv() => match event {
                        Some(SessionEvent::Closed) => break "vendor connection closed".to_string(),
                        Some(SessionEvent::Connected) => continue,
                        None => return Ok(()),
                    },
                    command = commands.recv() => match command {
                        Some(SupervisorCommand::Demote { reason }) => break reason,
                        None => return Ok(()),
                    },
                    _ = shutdown.cancelled() => {
                        self.gate.close();
                        return Ok(());
                    }
                }
            };

            self.gate.close();
            self.bridge.fail_pending_transient(&demote_reason);
            self.alerts.emit(
                AlertLevel::Warning,
                "connection",
                format!("degraded: {}", demote_reason),
            );
            attempt = 1;
            self.set_state(ConnState::Degraded, attempt, Some(demote_reason));
            if self.sleep_or_shutdown(backoff_delay(attempt), &mut shutdown).await {
                return Ok(());
            }
        }
    }

    /// Post-connect checklist; the gate stays closed until every step
    /// succeeds:
    /// 1. reconcile durable open positions against broker-reported positions,
    /// 2. re-subscribe the news tape,
    /// 3. re-request the account summary,
    /// 4. resume quote streams for surviving positions.
    async fn sync_checklist(&self) -> Result<(), EngineError> {
        let stored = self.store.list_open().await?;
        let broker_positions = self.bridge.positions().await?;

        let mut confirmed = Vec::new();
        for position in stored {
            let expected_qty = match position.direction {
                Direction::Long => position.qty,
                Direction::Short => -position.qty,
            };
            match broker_positions
                .iter()
                .find(|bp| bp.symbol == position.symbol)
            {
                Some(bp) if bp.qty == expected_qty => {
                    info!(
                        "reconciled open position {} {} x{}",
                        position.symbol, position.direction, position.qty
                    );
                    confirmed.push(position);
                }
                Some(bp) => {
                    self.alerts.emit(
                        AlertLevel::Critical,
                        "connection",
                        format!(
                            "position mismatch for {}: store has {} x{}, broker reports {}",
                            position.symbol, position.direction, position.qty, bp.qty
                        ),
                    );
                }
                None => {
                    self.alerts.emit(
                        AlertLevel::Critical,
                        "connection",
                        format!(
                            "store shows open {} x{} but broker reports no position",
                            position.symbol, position.qty
                        ),
                    );
                }
            }
        }
        for bp in &broker_positions {
            let tracked = confirmed.iter().any(|p| p.symbol == bp.symbol);
            if !tracked && bp.qty != 0 {
                self.alerts.emit(
                    AlertLevel::Warning,
                    "connection",
                    format!(
                        "broker reports untracked position {} qty {}",
                        bp.symbol, bp.qty
                    ),
                );
            }
        }

        self.bridge.subscribe_news(&self.news.provider_code)?;

        let summary = self
            .bridge
            .account_summary(&self.risk.account_value_tag)
            .await?;
        info!(
            "account summary {} = {} {}",
            summary.tag, summary.value, summary.currency
        );

        for position in confirmed {
            let _ = self.position_tx.send(PositionCommand::Track(position));
        }
        let _ = self.position_tx.send(PositionCommand::ResumeStreams);
        Ok(())
    }

    fn set_state(&self, state: ConnState, reconnect_attempt: u32, last_error: Option<String>) {
        let mut status = self.status.write().expect("connection status poisoned");
        if status.state != state {
            info!("connection state {} -> {}", status.state, state);
        }
        status.state = state;
        status.since = Utc::now();
        status.reconnect_attempt = reconnect_attempt;
        if last_error.is_some() {
            status.last_error = last_error;
        }
    }

    /// Returns true when shutdown fired during the sleep.
    async fn sleep_or_shutdown(&self, delay: Duration, shutdown: &mut Shutdown) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.cancelled() => true,
        }
    }
}

/// Jittered exponential backoff: base 1 s doubling per attempt, capped at
/// 60 s, scaled by a uniform factor in [0.5, 1.5).
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS.saturating_mul(1u64 << attempt.saturating_sub(1).min(6));
    let capped = exp.min(BACKOFF_CAP_SECS);
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(capped as f64 * factor)
}
