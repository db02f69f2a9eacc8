use crate::broker::events::{
    classify_error, BrokerEvent, Contract, ErrorClass, NewsArticle, OrderStatusEvent, OrderTicket,
    QuoteTick, ReqId, TickKind,
};
use crate::broker::queue::{EventQueue, INBOUND_QUEUE_CAPACITY};
use crate::broker::registry::{
    Completion, OrderOutcome, RequestKind, RequestRegistry, ResponsePayload, ACCOUNT_SUMMARY_REQ_ID,
    CONNECT_REQ_ID, POSITIONS_REQ_ID,
};
use crate::broker::session::{spawn_session, SessionHandle, VendorClient, VendorCommand};
use crate::error::EngineError;
use crate::shutdown::Shutdown;
use crate::types::Symbol;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Generic tick list requesting broad-tape news on a market-data line.
pub const NEWS_GENERIC_TICK_LIST: &str = "292";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HIST_BARS_TIMEOUT: Duration = Duration::from_secs(5);
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(5);
pub const GLOBAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the raw news queue feeding the news stage.
pub const RAW_NEWS_QUEUE_CAPACITY: usize = 1024;

const REAPER_INTERVAL: Duration = Duration::from_millis(200);

/// Session-level notifications the connection supervisor consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Closed,
}

struct QuoteStreamEntry {
    symbol: Symbol,
    tx: mpsc::UnboundedSender<QuoteTick>,
}

type QuoteStreamTable = Arc<Mutex<HashMap<ReqId, QuoteStreamEntry>>>;

/// Owns the vendor session worker and multiplexes its single event stream
/// into request completions (via the registry) and subscription streams
/// (news, quotes). All broker operations the stages use go through here.
pub struct BrokerBridge {
    registry: Arc<RequestRegistry>,
    session: Mutex<SessionHandle>,
    events: Arc<EventQueue>,
    news_tx: mpsc::Sender<NewsArticle>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    quote_streams: QuoteStreamTable,
    primary_exchange: String,
}

impl BrokerBridge {
    /// Build the bridge and spawn the vendor session worker. Returns the
    /// bridge alongside the raw news stream and the session event stream.
    pub fn new(
        client: Box<dyn VendorClient>,
        primary_exchange: &str,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<NewsArticle>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let events = Arc::new(EventQueue::new(INBOUND_QUEUE_CAPACITY));
        let session = spawn_session(client, events.clone());
        let (news_tx, news_rx) = mpsc::channel(RAW_NEWS_QUEUE_CAPACITY);
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            registry: Arc::new(RequestRegistry::new()),
            session: Mutex::new(session),
            events,
            news_tx,
            session_tx,
            quote_streams: Arc::new(Mutex::new(HashMap::new())),
            primary_exchange: primary_exchange.to_string(),
        });
        (bridge, news_rx, session_rx)
    }

    /// Drain the inbound queue: correlate responses through the registry,
    /// fan unclaimed events out to subscription streams, reap expired
    /// awaiters. Runs until shutdown or queue closure.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let mut reaper = tokio::time::interval(REAPER_INTERVAL);
            reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = bridge.events.pop() => {
                        let Some(event) = event else {
                            debug!("inbound event queue closed, dispatcher exiting");
                            break;
                        };
                        if let Some(unclaimed) = bridge.registry.deliver(event) {
                            bridge.route(unclaimed).await;
                        }
                    }
                    _ = reaper.tick() => {
                        let reaped = bridge.registry.reap_expired();
                        if reaped > 0 {
                            debug!("reaped {} expired broker requests", reaped);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("dispatcher shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Route an event no awaiter claimed.
    async fn route(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::NewsArticle { article, .. } => {
                // News must not be shed; backpressure blocks the dispatcher.
                if self.news_tx.send(article).await.is_err() {
                    debug!("news stage gone, dropping article");
                }
            }
            BrokerEvent::Tick { req_id, kind } => match kind {
                TickKind::Price(price) => {
                    let target = {
                        let streams = self.quote_streams.lock().expect("stream table poisoned");
                        streams
                            .get(&req_id)
                            .map(|entry| (entry.symbol.clone(), entry.tx.clone()))
                    };
                    match target {
                        Some((symbol, tx)) => {
                            let tick = QuoteTick {
                                price,
                                ts: Utc::now(),
                            };
                            if tx.send(tick).is_err() {
                                debug!("quote stream for {} closed", symbol);
                            }
                        }
                        None => debug!("price tick for unknown subscription {}", req_id),
                    }
                }
                TickKind::Size(_) => {
                    // Cumulative volume ticks only matter to snapshot
                    // awaiters; streamed exits key off price alone.
                }
                TickKind::News(payload) => match NewsArticle::from_tick_payload(&payload) {
                    Some(article) => {
                        if self.news_tx.send(article).await.is_err() {
                            debug!("news stage gone, dropping article");
                        }
                    }
                    None => warn!("malformed news tick payload on req {}", req_id),
                },
            },
            BrokerEvent::ConnectionAck => {
                let _ = self.session_tx.send(SessionEvent::Connected);
            }
            BrokerEvent::ConnectionClosed => {
                info!("vendor session reported connection closed");
                let _ = self.session_tx.send(SessionEvent::Closed);
            }
            BrokerEvent::Error {
                req_id,
                code,
                message,
            } => match classify_error(code) {
                ErrorClass::Informational => {
                    info!("broker info {} (req {}): {}", code, req_id, message)
                }
                ErrorClass::Warning => {
                    warn!("broker warning {} (req {}): {}", code, req_id, message)
                }
                ErrorClass::Transient => {
                    // Connectivity-loss codes can arrive without an explicit
                    // ConnectionClosed callback.
                    warn!("broker transient error {} (req {}): {}", code, req_id, message);
                    if matches!(code, 1100 | 1300) {
                        let _ = self.session_tx.send(SessionEvent::Closed);
                    }
                }
                ErrorClass::Fatal => {
                    error!(
                        "broker fatal error {} with no pending request {}: {}",
                        code, req_id, message
                    );
                }
            },
            other => {
                warn!("dropping unroutable broker event: {:?}", other);
            }
        }
    }

    /// Establish the vendor session. Resolves once `ConnectionAck` arrives.
    pub async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<(), EngineError> {
        let completion =
            self.registry
                .register_fixed(CONNECT_REQ_ID, RequestKind::Connect, CONNECT_TIMEOUT)?;
        self.send(VendorCommand::Connect {
            host: host.to_string(),
            port,
            client_id,
        })?;
        match await_payload(completion).await? {
            ResponsePayload::Ack => Ok(()),
            other => Err(EngineError::Invariant(format!(
                "connect resolved with unexpected payload: {:?}",
                other
            ))),
        }
    }

    /// Stop the vendor session worker. Called last during shutdown, after
    /// the stages have drained. The queue closes first so a producer blocked
    /// on a full queue cannot stall the worker join.
    pub fn disconnect(&self) {
        self.registry.cancel_all();
        self.events.close();
        self.session.lock().expect("session poisoned").shutdown();
    }

    /// Subscribe to the provider's broad tape. News articles are delivered on
    /// the raw news stream returned by [`BrokerBridge::new`].
    pub fn subscribe_news(&self, provider_code: &str) -> Result<ReqId, EngineError> {
        let req_id = self.registry.allocate_id(RequestKind::SubscribeNews);
        self.send(VendorCommand::ReqMktData {
            req_id,
            contract: Contract::news_tape(provider_code),
            generic_ticks: NEWS_GENERIC_TICK_LIST.to_string(),
            snapshot: false,
        })?;
        info!(
            "subscribed to news provider {} on req {}",
            provider_code, req_id
        );
        Ok(req_id)
    }

    /// Fetch `count` most-recent bars; resolves on the terminal
    /// `HistoricalBarsEnd`, in ascending timestamp order.
    pub async fn fetch_historical_bars(
        &self,
        symbol: &Symbol,
        bar_size: &str,
        count: u32,
    ) -> Result<Vec<crate::broker::events::Bar>, EngineError> {
        let (req_id, completion) = self
            .registry
            .register(RequestKind::HistBars, HIST_BARS_TIMEOUT);
        self.send(VendorCommand::ReqHistoricalBars {
            req_id,
            contract: Contract::equity(symbol, &self.primary_exchange),
            bar_size: bar_size.to_string(),
            count,
        })?;
        match await_payload(completion).await? {
            ResponsePayload::Bars(mut bars) => {
                bars.sort_by_key(|bar| bar.ts);
                Ok(bars)
            }
            other => Err(EngineError::Invariant(format!(
                "bars request resolved with unexpected payload: {:?}",
                other
            ))),
        }
    }

    /// Next coherent price + cumulative-volume pair for the symbol.
    pub async fn snapshot_quote(
        &self,
        symbol: &Symbol,
    ) -> Result<crate::broker::events::QuoteSnapshot, EngineError> {
        let (req_id, completion) = self
            .registry
            .register(RequestKind::MktSnapshot, SNAPSHOT_TIMEOUT);
        self.send(VendorCommand::ReqMktData {
            req_id,
            contract: Contract::equity(symbol, &self.primary_exchange),
            generic_ticks: String::new(),
            snapshot: true,
        })?;
        match await_payload(completion).await? {
            ResponsePayload::Snapshot(snapshot) => Ok(snapshot),
            other => Err(EngineError::Invariant(format!(
                "snapshot resolved with unexpected payload: {:?}",
                other
            ))),
        }
    }

    /// Open a cancellable stream of price ticks. The subscription is torn
    /// down when the returned stream is dropped.
    pub fn stream_quotes(&self, symbol: &Symbol) -> Result<QuoteStream, EngineError> {
        let req_id = self.registry.allocate_id(RequestKind::StreamQuote);
        let (tx, rx) = mpsc::unbounded_channel();
        self.quote_streams
            .lock()
            .expect("stream table poisoned")
            .insert(
                req_id,
                QuoteStreamEntry {
                    symbol: symbol.clone(),
                    tx,
                },
            );
        let cancel_tx = self.session.lock().expect("session poisoned").sender();
        self.send(VendorCommand::ReqMktData {
            req_id,
            contract: Contract::equity(symbol, &self.primary_exchange),
            generic_ticks: String::new(),
            snapshot: false,
        })?;
        Ok(QuoteStream {
            symbol: symbol.clone(),
            req_id,
            rx,
            streams: Arc::clone(&self.quote_streams),
            cancel_tx,
        })
    }

    /// Submit a market order. The returned handle resolves on a terminal
    /// order status; intermediate statuses surface on its progress channel.
    pub fn place_order(&self, ticket: &OrderTicket) -> Result<PendingOrder, EngineError> {
        let (req_id, completion, progress) = self.registry.register_order(ORDER_TIMEOUT);
        self.send(VendorCommand::PlaceOrder {
            req_id,
            contract: Contract::equity(&ticket.symbol, &self.primary_exchange),
            side: ticket.side,
            qty: ticket.qty,
        })?;
        info!(
            "submitted {:?} {} x{} as order {}",
            ticket.side, ticket.symbol, ticket.qty, req_id
        );
        Ok(PendingOrder {
            req_id,
            completion,
            progress,
        })
    }

    /// Latest account summary value for the configured tag.
    pub async fn account_summary(
        &self,
        tag: &str,
    ) -> Result<crate::broker::events::AccountSummary, EngineError> {
        let completion = self.registry.register_fixed(
            ACCOUNT_SUMMARY_REQ_ID,
            RequestKind::AccountSummary,
            GLOBAL_REQUEST_TIMEOUT,
        )?;
        self.send(VendorCommand::ReqAccountSummary {
            req_id: ACCOUNT_SUMMARY_REQ_ID,
            tag: tag.to_string(),
        })?;
        match await_payload(completion).await? {
            ResponsePayload::Account(summary) => Ok(summary),
            other => Err(EngineError::Invariant(format!(
                "account summary resolved with unexpected payload: {:?}",
                other
            ))),
        }
    }

    /// Broker-reported open positions, for reconciliation after reconnect.
    pub async fn positions(
        &self,
    ) -> Result<Vec<crate::broker::events::BrokerPosition>, EngineError> {
        let completion = self.registry.register_fixed(
            POSITIONS_REQ_ID,
            RequestKind::Positions,
            GLOBAL_REQUEST_TIMEOUT,
        )?;
        self.send(VendorCommand::ReqPositions {
            req_id: POSITIONS_REQ_ID,
        })?;
        match await_payload(completion).await? {
            ResponsePayload::Positions(positions) => Ok(positions),
            other => Err(EngineError::Invariant(format!(
                "positions request resolved with unexpected payload: {:?}",
                other
            ))),
        }
    }

    /// Ask the vendor to cancel a working order whose awaiter already
    /// resolved (timeout path). Any late status lands as an unclaimed event.
    pub fn cancel_order(&self, req_id: ReqId) {
        if let Err(err) = self.send(VendorCommand::CancelOrder { req_id }) {
            warn!("could not request cancel for order {}: {}", req_id, err);
        }
    }

    /// Fail every in-flight request with a transport error. Invoked by the
    /// connection supervisor on demotion to `Degraded`.
    pub fn fail_pending_transient(&self, reason: &str) {
        self.registry.fail_all_transient(reason);
    }

    /// Ticks shed by the inbound queue's overflow policy.
    pub fn dropped_ticks(&self) -> u64 {
        self.events.dropped_ticks()
    }

    fn send(&self, command: VendorCommand) -> Result<(), EngineError> {
        self.session.lock().expect("session poisoned").send(command)
    }
}

/// In-flight order handle.
pub struct PendingOrder {
    pub req_id: ReqId,
    completion: Completion,
    progress: mpsc::UnboundedReceiver<OrderStatusEvent>,
}

impl PendingOrder {
    /// Wait for the terminal order status, logging intermediate statuses as
    /// they arrive.
    pub async fn outcome(mut self) -> Result<OrderOutcome, EngineError> {
        let mut progress_open = true;
        loop {
            tokio::select! {
                status = self.progress.recv(), if progress_open => {
                    match status {
                        Some(status) => debug!(
                            "order {} progress: {:?} filled {}/{}",
                            self.req_id,
                            status.state,
                            status.filled,
                            status.filled + status.remaining
                        ),
                        None => progress_open = false,
                    }
                }
                result = &mut self.completion => {
                    return match result {
                        Ok(Ok(ResponsePayload::Order(outcome))) => Ok(outcome),
                        Ok(Ok(other)) => Err(EngineError::Invariant(format!(
                            "order resolved with unexpected payload: {:?}",
                            other
                        ))),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(EngineError::Transport(
                            "request registry dropped order completion".to_string(),
                        )),
                    };
                }
            }
        }
    }
}

/// Cancellable stream of price ticks for one symbol.
pub struct QuoteStream {
    pub symbol: Symbol,
    req_id: ReqId,
    rx: mpsc::UnboundedReceiver<QuoteTick>,
    streams: QuoteStreamTable,
    cancel_tx: std::sync::mpsc::Sender<VendorCommand>,
}

impl QuoteStream {
    pub async fn next(&mut self) -> Option<QuoteTick> {
        self.rx.recv().await
    }
}

impl Drop for QuoteStream {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&self.req_id);
        }
        let _ = self.cancel_tx.send(VendorCommand::CancelMktData {
            req_id: self.req_id,
        });
    }
}

async fn await_payload(completion: Completion) -> Result<ResponsePayload, EngineError> {
    match completion.await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Transport(
            "request registry dropped completion".to_string(),
        )),
    }
}
