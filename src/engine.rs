use crate::alerts::AlertManager;
use crate::broker::{BrokerBridge, VendorClient};
use crate::config::AppConfig;
use crate::connection::{ConnectionSupervisor, ExecutionGate};
use crate::error::EngineError;
use crate::extractor::TickerExtractor;
use crate::shutdown::ShutdownController;
use crate::stages::{
    DetectionStage, ExecutionStage, NewsStage, PositionSupervisor, STAGE_QUEUE_CAPACITY,
};
use crate::store::TradeStore;
use log::{info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const STAGE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Wires the staged pipeline around the broker bridge and runs it to
/// completion. Returns when shutdown is triggered or the connection
/// supervisor gives up; fatal errors map to process exit codes.
pub struct Engine {
    config: AppConfig,
}

impl Engine {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        self,
        client: Box<dyn VendorClient>,
        store: Arc<dyn TradeStore>,
        extractor: Arc<dyn TickerExtractor>,
        controller: ShutdownController,
    ) -> Result<(), EngineError> {
        let shutdown = controller.subscribe();
        let alerts = AlertManager::new(256);
        let gate = ExecutionGate::new();
        let open_symbols = Arc::new(Mutex::new(HashSet::new()));

        // Position IDs continue from the durable store across restarts.
        let existing = store.list_open().await?;
        let next_position_id = existing.iter().map(|p| p.id).max().unwrap_or(0) + 1;
        if !existing.is_empty() {
            info!(
                "found {} open positions in the trade store, awaiting reconciliation",
                existing.len()
            );
        }

        let (bridge, raw_news_rx, session_rx) =
            BrokerBridge::new(client, &self.config.broker.primary_exchange);
        let dispatcher = bridge.spawn_dispatcher(shutdown.clone());

        let (ticker_tx, ticker_rx) = mpsc::channel(STAGE_QUEUE_CAPACITY);
        let (exec_tx, exec_rx) = mpsc::channel(STAGE_QUEUE_CAPACITY);
        let (position_tx, position_rx) = mpsc::unbounded_channel();
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();

        let news_task = tokio::spawn(
            NewsStage::new(extractor).run(raw_news_rx, ticker_tx, shutdown.clone()),
        );

        let detection = DetectionStage::new(Arc::clone(&bridge), self.config.detection.clone());
        let detection_tasks = DetectionStage::spawn_workers(
            detection,
            ticker_rx,
            exec_tx.clone(),
            shutdown.clone(),
        );

        let mut execution_task = tokio::spawn(
            ExecutionStage::new(
                Arc::clone(&bridge),
                Arc::clone(&store),
                Arc::clone(&alerts),
                Arc::clone(&gate),
                self.config.risk.clone(),
                position_tx.clone(),
                supervisor_tx,
                Arc::clone(&open_symbols),
                next_position_id,
            )
            .run(exec_rx, shutdown.clone()),
        );

        let position_task = tokio::spawn(
            PositionSupervisor::new(
                Arc::clone(&bridge),
                Arc::clone(&store),
                Arc::clone(&alerts),
                exec_tx,
                Arc::clone(&open_symbols),
            )
            .run(position_rx, shutdown.clone()),
        );

        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&bridge),
            Arc::clone(&store),
            Arc::clone(&alerts),
            Arc::clone(&gate),
            self.config.broker.clone(),
            self.config.news.clone(),
            self.config.risk.clone(),
            position_tx,
        );
        let mut supervisor_task =
            tokio::spawn(supervisor.run(session_rx, supervisor_rx, shutdown.clone()));

        // Run until shutdown fires, the connection supervisor gives up, or
        // the execution stage hits an invariant violation.
        let mut shutdown_wait = shutdown.clone();
        let exit = tokio::select! {
            result = &mut supervisor_task => {
                Exit::Supervisor(flatten(result, "connection supervisor"))
            }
            result = &mut execution_task => {
                Exit::Execution(flatten(result, "execution stage"))
            }
            _ = shutdown_wait.cancelled() => Exit::Shutdown,
        };
        controller.trigger();

        // Stages drain their queues, then the bridge is stopped last.
        join_stage(news_task, "news stage").await;
        for task in detection_tasks {
            join_stage(task, "detection worker").await;
        }
        join_stage(position_task, "position supervisor").await;

        let outcome = match exit {
            Exit::Supervisor(result) => {
                let _ = join_fallible(execution_task, "execution stage").await;
                result
            }
            Exit::Execution(result) => {
                let _ = join_fallible(supervisor_task, "connection supervisor").await;
                result
            }
            Exit::Shutdown => {
                let execution = join_fallible(execution_task, "execution stage").await;
                let supervisor = join_fallible(supervisor_task, "connection supervisor").await;
                execution.and(supervisor)
            }
        };

        join_stage(dispatcher, "dispatcher").await;
        bridge.disconnect();
        info!("engine stopped");
        outcome
    }
}

enum Exit {
    Shutdown,
    Supervisor(Result<(), EngineError>),
    Execution(Result<(), EngineError>),
}

fn flatten(
    result: Result<Result<(), EngineError>, tokio::task::JoinError>,
    name: &str,
) -> Result<(), EngineError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(EngineError::Transport(format!("{} panicked", name))),
    }
}

async fn join_fallible(
    mut task: tokio::task::JoinHandle<Result<(), EngineError>>,
    name: &str,
) -> Result<(), EngineError> {
    match tokio::time::timeout(STAGE_JOIN_TIMEOUT, &mut task).await {
        Ok(result) => flatten(result, name),
        Err(_) => {
            warn!("{} did not stop within {:?}", name, STAGE_JOIN_TIMEOUT);
            task.abort();
            Ok(())
        }
    }
}

async fn join_stage(task: tokio::task::JoinHandle<()>, name: &str) {
    match tokio::time::timeout(STAGE_JOIN_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_cancelled() => {}
        Ok(Err(_)) => warn!("{} panicked during shutdown", name),
        Err(_) => warn!("{} did not stop within {:?}", name, STAGE_JOIN_TIMEOUT),
    }
}
