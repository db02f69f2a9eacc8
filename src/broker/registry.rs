use crate::broker::events::{
    classify_error, AccountSummary, Bar, BrokerEvent, BrokerPosition, ErrorClass, OrderState,
    OrderStatusEvent, QuoteSnapshot, ReqId, TickKind,
};
use crate::error::EngineError;
use crate::types::Price;
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Fixed request IDs for rarely-issued global requests.
pub const CONNECT_REQ_ID: ReqId = 1;
pub const ACCOUNT_SUMMARY_REQ_ID: ReqId = 10;
pub const POSITIONS_REQ_ID: ReqId = 11;

/// First ID handed out by the dynamic allocator; `[1..99]` stays reserved.
pub const FIRST_DYNAMIC_REQ_ID: ReqId = 100;

/// What an outstanding request is waiting for. Determines which events are
/// partials and which are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Connect,
    HistBars,
    MktSnapshot,
    StreamQuote,
    PlaceOrder,
    CancelOrder,
    SubscribeNews,
    AccountSummary,
    Positions,
}

/// Terminal payload delivered to a request's completion.
#[derive(Debug, Clone)]
pub enum ResponsePayload {
    Ack,
    Bars(Vec<Bar>),
    Snapshot(QuoteSnapshot),
    Order(OrderOutcome),
    Account(AccountSummary),
    Positions(Vec<BrokerPosition>),
}

/// Terminal order outcome. A timeout after partial fills resolves
/// successfully as `PartiallyFilled` so the filled quantity can be booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderOutcome {
    pub state: OrderState,
    pub filled: i64,
    pub avg_fill_price: Option<Price>,
}

/// One-shot completion handle held by the caller of a broker operation.
pub type Completion = oneshot::Receiver<Result<ResponsePayload, EngineError>>;

struct Awaiter {
    kind: RequestKind,
    tx: oneshot::Sender<Result<ResponsePayload, EngineError>>,
    bars: Vec<Bar>,
    positions: Vec<BrokerPosition>,
    snap_price: Option<Price>,
    snap_size: Option<u64>,
    order_filled: i64,
    order_avg_price: Option<Price>,
    progress: Option<mpsc::UnboundedSender<OrderStatusEvent>>,
    timeout_at: Instant,
}

impl Awaiter {
    fn new(
        kind: RequestKind,
        tx: oneshot::Sender<Result<ResponsePayload, EngineError>>,
        deadline: Duration,
    ) -> Self {
        Self {
            kind,
            tx,
            bars: Vec::new(),
            positions: Vec::new(),
            snap_price: None,
            snap_size: None,
            order_filled: 0,
            order_avg_price: None,
            progress: None,
            timeout_at: Instant::now() + deadline,
        }
    }

    fn complete(self, result: Result<ResponsePayload, EngineError>) {
        // The receiver may already be gone (caller dropped); either way the
        // awaiter resolves exactly once.
        let _ = self.tx.send(result);
    }
}

/// Correlates outbound request IDs to pending response awaiters.
///
/// The single mutex guards ID allocation and awaiter table edits only; no
/// I/O happens under the lock.
pub struct RequestRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: ReqId,
    awaiters: HashMap<ReqId, Awaiter>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: FIRST_DYNAMIC_REQ_ID,
                awaiters: HashMap::new(),
            }),
        }
    }

    /// Allocate a correlation ID without an awaiter (subscription streams).
    pub fn allocate_id(&self, kind: RequestKind) -> ReqId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        trace!("allocated req_id {} for {:?}", id, kind);
        id
    }

    /// Register an awaiter under a fresh dynamic ID.
    pub fn register(&self, kind: RequestKind, deadline: Duration) -> (ReqId, Completion) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.awaiters.insert(id, Awaiter::new(kind, tx, deadline));
        (id, rx)
    }

    /// Register an awaiter under a reserved fixed ID (`[1..99]`). Fails if a
    /// request with that ID is already outstanding.
    pub fn register_fixed(
        &self,
        req_id: ReqId,
        kind: RequestKind,
        deadline: Duration,
    ) -> Result<Completion, EngineError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if inner.awaiters.contains_key(&req_id) {
            return Err(EngineError::Invariant(format!(
                "fixed request id {} already pending",
                req_id
            )));
        }
        inner
            .awaiters
            .insert(req_id, Awaiter::new(kind, tx, deadline));
        Ok(rx)
    }

    /// Register an order awaiter; intermediate statuses flow through the
    /// returned progress channel, terminal status through the completion.
    pub fn register_order(
        &self,
        deadline: Duration,
    ) -> (ReqId, Completion, mpsc::UnboundedReceiver<OrderStatusEvent>) {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let mut awaiter = Awaiter::new(RequestKind::PlaceOrder, tx, deadline);
        awaiter.progress = Some(progress_tx);
        inner.awaiters.insert(id, awaiter);
        (id, rx, progress_rx)
    }

    /// Deliver an event to the awaiter table. Returns the event back if no
    /// awaiter claimed it, so the dispatcher can route it to a subscription
    /// stream (or drop it with a warning).
    pub fn deliver(&self, event: BrokerEvent) -> Option<BrokerEvent> {
        let mut inner = self.lock();
        match event {
            BrokerEvent::HistoricalBar { req_id, bar } => {
                match inner.awaiters.get_mut(&req_id) {
                    Some(awaiter) if awaiter.kind == RequestKind::HistBars => {
                        awaiter.bars.push(bar);
                        None
                    }
                    _ => Some(BrokerEvent::HistoricalBar { req_id, bar }),
                }
            }
            BrokerEvent::HistoricalBarsEnd { req_id } => {
                match inner.awaiters.remove(&req_id) {
                    Some(mut awaiter) if awaiter.kind == RequestKind::HistBars => {
                        let bars = std::mem::take(&mut awaiter.bars);
                        awaiter.complete(Ok(ResponsePayload::Bars(bars)));
                        None
                    }
                    Some(awaiter) => {
                        // Kind mismatch: keep the awaiter untouched.
                        inner.awaiters.insert(req_id, awaiter);
                        Some(BrokerEvent::HistoricalBarsEnd { req_id })
                    }
                    None => Some(BrokerEvent::HistoricalBarsEnd { req_id }),
                }
            }
            BrokerEvent::Tick { req_id, kind } => {
                match inner.awaiters.get_mut(&req_id) {
                    Some(awaiter) if awaiter.kind == RequestKind::MktSnapshot => {
                        match kind {
                            TickKind::Price(price) => awaiter.snap_price = Some(price),
                            TickKind::Size(size) => awaiter.snap_size = Some(size),
                            // News payloads never answer a snapshot.
                            TickKind::News(payload) => {
                                return Some(BrokerEvent::Tick {
                                    req_id,
                                    kind: TickKind::News(payload),
                                })
                            }
                        }
                        let pair = (awaiter.snap_price, awaiter.snap_size);
                        if let (Some(price), Some(cum_volume)) = pair {
                            if let Some(awaiter) = inner.awaiters.remove(&req_id) {
                                awaiter.complete(Ok(ResponsePayload::Snapshot(QuoteSnapshot {
                                    price,
                                    cum_volume,
                                })));
                            }
                        }
                        None
                    }
                    _ => Some(BrokerEvent::Tick { req_id, kind }),
                }
            }
            BrokerEvent::OrderStatus(status) => {
                let req_id = status.req_id;
                match inner.awaiters.get_mut(&req_id) {
                    Some(awaiter) if awaiter.kind == RequestKind::PlaceOrder => {
                        awaiter.order_filled = status.filled;
                        if status.filled > 0 {
                            awaiter.order_avg_price = Some(status.avg_fill_price);
                        }
                        if status.state.is_terminal() {
                            let awaiter = inner.awaiters.remove(&req_id).expect("present");
                            let outcome = OrderOutcome {
                                state: status.state,
                                filled: awaiter.order_filled,
                                avg_fill_price: awaiter.order_avg_price,
                            };
                            awaiter.complete(Ok(ResponsePayload::Order(outcome)));
                        } else if let Some(progress) = &awaiter.progress {
                            let _ = progress.send(status);
                        }
                        None
                    }
                    _ => Some(BrokerEvent::OrderStatus(status)),
                }
            }
            BrokerEvent::ExecutionReport {
                req_id,
                shares,
                price,
            } => {
                // Fill details ride on OrderStatus; execution reports are
                // consumed when an order awaiter exists, else passed back.
                match inner.awaiters.get(&req_id) {
                    Some(awaiter) if awaiter.kind == RequestKind::PlaceOrder => {
                        trace!("execution report for {}: {} @ {}", req_id, shares, price);
                        None
                    }
                    _ => Some(BrokerEvent::ExecutionReport {
                        req_id,
                        shares,
                        price,
                    }),
                }
            }
            BrokerEvent::AccountValue { req_id, summary } => {
                match inner.awaiters.remove(&req_id) {
                    Some(awaiter) if awaiter.kind == RequestKind::AccountSummary => {
                        awaiter.complete(Ok(ResponsePayload::Account(summary)));
                        None
                    }
                    Some(awaiter) => {
                        inner.awaiters.insert(req_id, awaiter);
                        Some(BrokerEvent::AccountValue { req_id, summary })
                    }
                    None => Some(BrokerEvent::AccountValue { req_id, summary }),
                }
            }
            BrokerEvent::PositionReport { req_id, position } => {
                match inner.awaiters.get_mut(&req_id) {
                    Some(awaiter) if awaiter.kind == RequestKind::Positions => {
                        awaiter.positions.push(position);
                        None
                    }
                    _ => Some(BrokerEvent::PositionReport { req_id, position }),
                }
            }
            BrokerEvent::PositionsEnd { req_id } => match inner.awaiters.remove(&req_id) {
                Some(mut awaiter) if awaiter.kind == RequestKind::Positions => {
                    let positions = std::mem::take(&mut awaiter.positions);
                    awaiter.complete(Ok(ResponsePayload::Positions(positions)));
                    None
                }
                Some(awaiter) => {
                    inner.awaiters.insert(req_id, awaiter);
                    Some(BrokerEvent::PositionsEnd { req_id })
                }
                None => Some(BrokerEvent::PositionsEnd { req_id }),
            },
            BrokerEvent::Error {
                req_id,
                code,
                message,
            } => {
                let class = classify_error(code);
                let failing = matches!(class, ErrorClass::Transient | ErrorClass::Fatal);
                if failing && inner.awaiters.contains_key(&req_id) {
                    let awaiter = inner.awaiters.remove(&req_id).expect("present");
                    let err = match class {
                        ErrorClass::Transient => EngineError::Transport(message),
                        _ => EngineError::BrokerRejected {
                            req_id,
                            code,
                            message,
                        },
                    };
                    awaiter.complete(Err(err));
                    None
                } else {
                    Some(BrokerEvent::Error {
                        req_id,
                        code,
                        message,
                    })
                }
            }
            BrokerEvent::ConnectionAck => {
                if let Some(awaiter) = inner.awaiters.remove(&CONNECT_REQ_ID) {
                    if awaiter.kind == RequestKind::Connect {
                        awaiter.complete(Ok(ResponsePayload::Ack));
                    } else {
                        inner.awaiters.insert(CONNECT_REQ_ID, awaiter);
                    }
                }
                // Also forwarded so the connection supervisor observes it.
                Some(BrokerEvent::ConnectionAck)
            }
            other => Some(other),
        }
    }

    /// Cancel an outstanding request from the caller side.
    pub fn cancel(&self, req_id: ReqId) -> bool {
        let awaiter = self.lock().awaiters.remove(&req_id);
        match awaiter {
            Some(awaiter) => {
                awaiter.complete(Err(EngineError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding awaiter with a transport error. Used when the
    /// connection drops: in-flight requests cannot complete and their callers
    /// must observe the failure promptly.
    pub fn fail_all_transient(&self, reason: &str) {
        let awaiters: Vec<Awaiter> = {
            let mut inner = self.lock();
            inner.awaiters.drain().map(|(_, a)| a).collect()
        };
        if !awaiters.is_empty() {
            warn!(
                "failing {} in-flight requests: {}",
                awaiters.len(),
                reason
            );
        }
        for awaiter in awaiters {
            awaiter.complete(Err(EngineError::Transport(reason.to_string())));
        }
    }

    /// Cancel every outstanding awaiter (shutdown path).
    pub fn cancel_all(&self) {
        let awaiters: Vec<Awaiter> = {
            let mut inner = self.lock();
            inner.awaiters.drain().map(|(_, a)| a).collect()
        };
        for awaiter in awaiters {
            awaiter.complete(Err(EngineError::Cancelled));
        }
    }

    /// Complete awaiters whose deadline has passed. An order awaiter that saw
    /// partial fills resolves successfully with the filled quantity; anything
    /// else times out. Returns the number of awaiters reaped.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(ReqId, Awaiter)> = {
            let mut inner = self.lock();
            let ids: Vec<ReqId> = inner
                .awaiters
                .iter()
                .filter(|(_, a)| now > a.timeout_at)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.awaiters.remove(&id).map(|a| (id, a)))
                .collect()
        };
        let count = expired.len();
        for (req_id, awaiter) in expired {
            if awaiter.kind == RequestKind::PlaceOrder && awaiter.order_filled > 0 {
                let outcome = OrderOutcome {
                    state: OrderState::PartiallyFilled,
                    filled: awaiter.order_filled,
                    avg_fill_price: awaiter.order_avg_price,
                };
                warn!(
                    "order request {} timed out after partial fill of {}",
                    req_id, outcome.filled
                );
                awaiter.complete(Ok(ResponsePayload::Order(outcome)));
            } else {
                awaiter.complete(Err(EngineError::Timeout(req_id)));
            }
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.lock().awaiters.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("request registry poisoned")
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
