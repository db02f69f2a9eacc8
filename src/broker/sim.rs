use crate::broker::events::{
    AccountSummary, Bar, BrokerEvent, BrokerPosition, NewsArticle, OrderSide, OrderState,
    OrderStatusEvent, QuoteSnapshot, ReqId, TickKind,
};
use crate::broker::queue::EventQueue;
use crate::broker::session::{VendorClient, VendorCommand};
use crate::types::Price;
use log::debug;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Scripted market and account state backing the simulated vendor session.
/// Used by the paper-trading binary and the end-to-end scenario tests.
#[derive(Debug, Clone)]
pub struct SimScript {
    /// Historical 1-minute bars per symbol, ascending.
    pub bars: HashMap<String, Vec<Bar>>,
    /// Current-bar snapshot per symbol.
    pub snapshots: HashMap<String, QuoteSnapshot>,
    /// Price ticks replayed when a quote stream is opened.
    pub quote_ticks: HashMap<String, Vec<Price>>,
    /// Fill price overrides; orders otherwise fill at the snapshot price.
    pub fills: HashMap<String, Price>,
    /// Articles published as soon as a news subscription is made.
    pub news_on_subscribe: Vec<NewsArticle>,
    /// Account summary value reported for any requested tag.
    pub account_value: Decimal,
    pub account_currency: String,
    /// Broker-side open positions reported for reconciliation.
    pub positions: Vec<BrokerPosition>,
    /// When set, every order is rejected with this vendor error code.
    pub reject_orders_with: Option<i32>,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            bars: HashMap::new(),
            snapshots: HashMap::new(),
            quote_ticks: HashMap::new(),
            fills: HashMap::new(),
            news_on_subscribe: Vec::new(),
            account_value: Decimal::new(100_000, 0),
            account_currency: "USD".to_string(),
            positions: Vec::new(),
            reject_orders_with: None,
        }
    }
}

/// An order the simulator accepted, recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOrder {
    pub req_id: ReqId,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
}

struct SimShared {
    script: Mutex<SimScript>,
    events: Mutex<Option<Arc<EventQueue>>>,
    orders: Mutex<Vec<SimOrder>>,
    news_req: Mutex<Option<ReqId>>,
    /// Latest streaming market-data subscription per symbol.
    quote_subs: Mutex<HashMap<String, ReqId>>,
}

/// Control handle for a running simulated session: publish news mid-run,
/// sever the connection, rewrite the script, inspect accepted orders.
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<SimShared>,
}

impl SimHandle {
    /// Publish a news article on the active news subscription.
    pub fn publish_news(&self, article: NewsArticle) {
        let req_id = self
            .shared
            .news_req
            .lock()
            .expect("sim poisoned")
            .unwrap_or(0);
        self.inject(BrokerEvent::NewsArticle { req_id, article });
    }

    /// Simulate a vendor-side connection loss. The worker stays alive so a
    /// later `Connect` command can re-establish the session.
    pub fn drop_connection(&self) {
        self.inject(BrokerEvent::ConnectionClosed);
    }

    /// Push a live price tick on the symbol's most recent quote stream.
    /// Returns false when no stream subscription exists for the symbol.
    pub fn push_tick(&self, symbol: &str, price: Price) -> bool {
        let req_id = {
            let subs = self.shared.quote_subs.lock().expect("sim poisoned");
            subs.get(symbol).copied()
        };
        match req_id {
            Some(req_id) => {
                self.inject(BrokerEvent::Tick {
                    req_id,
                    kind: TickKind::Price(price),
                });
                true
            }
            None => false,
        }
    }

    /// Push an arbitrary event, as the vendor callback thread would.
    pub fn inject(&self, event: BrokerEvent) {
        let queue = self
            .shared
            .events
            .lock()
            .expect("sim poisoned")
            .clone();
        match queue {
            Some(queue) => queue.push(event),
            None => debug!("sim session not running, dropping injected event"),
        }
    }

    /// Orders accepted so far, in submission order.
    pub fn placed_orders(&self) -> Vec<SimOrder> {
        self.shared.orders.lock().expect("sim poisoned").clone()
    }

    /// Mutate the script (e.g., change a snapshot between scenarios).
    pub fn update_script(&self, f: impl FnOnce(&mut SimScript)) {
        let mut script = self.shared.script.lock().expect("sim poisoned");
        f(&mut script);
    }
}

/// Deterministic vendor session driven entirely by its script. Commands are
/// answered synchronously on the session thread, mimicking a vendor client
/// whose callbacks fire from its own message loop.
pub struct SimVendorClient {
    shared: Arc<SimShared>,
}

impl SimVendorClient {
    pub fn new(script: SimScript) -> (Self, SimHandle) {
        let shared = Arc::new(SimShared {
            script: Mutex::new(script),
            events: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
            news_req: Mutex::new(None),
            quote_subs: Mutex::new(HashMap::new()),
        });
        let handle = SimHandle {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, handle)
    }

    /// Empty-script session for the paper-trading binary: connects, accepts
    /// subscriptions, and idles until news is injected.
    pub fn paper_session() -> (Self, SimHandle) {
        Self::new(SimScript::default())
    }

    fn script(&self) -> SimScript {
        self.shared.script.lock().expect("sim poisoned").clone()
    }
}

impl VendorClient for SimVendorClient {
    fn run(&mut self, commands: mpsc::Receiver<VendorCommand>, events: Arc<EventQueue>) {
        *self.shared.events.lock().expect("sim poisoned") = Some(events.clone());

        while let Ok(command) = commands.recv() {
            match command {
                VendorCommand::Connect { .. } => {
                    events.push(BrokerEvent::ConnectionAck);
                }
                VendorCommand::Disconnect => break,
                VendorCommand::ReqHistoricalBars {
                    req_id, contract, ..
                } => {
                    let script = self.script();
                    match script.bars.get(&contract.symbol) {
                        Some(bars) => {
                            for bar in bars {
                                events.push(BrokerEvent::HistoricalBar {
                                    req_id,
                                    bar: bar.clone(),
                                });
                            }
                            events.push(BrokerEvent::HistoricalBarsEnd { req_id });
                        }
                        None => events.push(no_security(req_id, &contract.symbol)),
                    }
                }
                VendorCommand::ReqMktData {
                    req_id,
                    contract,
                    snapshot,
                    ..
                } => {
                    if contract.sec_type == "NEWS" {
                        *self.shared.news_req.lock().expect("sim poisoned") = Some(req_id);
                        let script = self.script();
                        for article in script.news_on_subscribe {
                            events.push(BrokerEvent::NewsArticle { req_id, article });
                        }
                    } else if snapshot {
                        let script = self.script();
                        match script.snapshots.get(&contract.symbol) {
                            Some(snap) => {
                                events.push(BrokerEvent::Tick {
                                    req_id,
                                    kind: TickKind::Price(snap.price),
                                });
                                events.push(BrokerEvent::Tick {
                                    req_id,
                                    kind: TickKind::Size(snap.cum_volume),
                                });
                            }
                            None => events.push(no_security(req_id, &contract.symbol)),
                        }
                    } else {
                        self.shared
                            .quote_subs
                            .lock()
                            .expect("sim poisoned")
                            .insert(contract.symbol.clone(), req_id);
                        let script = self.script();
                        for price in script
                            .quote_ticks
                            .get(&contract.symbol)
                            .cloned()
                            .unwrap_or_default()
                        {
                            events.push(BrokerEvent::Tick {
                                req_id,
                                kind: TickKind::Price(price),
                            });
                        }
                    }
                }
                VendorCommand::CancelMktData { req_id } => {
                    let mut news_req = self.shared.news_req.lock().expect("sim poisoned");
                    if *news_req == Some(req_id) {
                        *news_req = None;
                    }
                    drop(news_req);
                    self.shared
                        .quote_subs
                        .lock()
                        .expect("sim poisoned")
                        .retain(|_, id| *id != req_id);
                }
                VendorCommand::PlaceOrder {
                    req_id,
                    contract,
                    side,
                    qty,
                } => {
                    let script = self.script();
                    if let Some(code) = script.reject_orders_with {
                        events.push(BrokerEvent::Error {
                            req_id,
                            code,
                            message: "order rejected by simulator".to_string(),
                        });
                        continue;
                    }
                    let fill_price = script
                        .fills
                        .get(&contract.symbol)
                        .copied()
                        .or_else(|| script.snapshots.get(&contract.symbol).map(|s| s.price));
                    let Some(fill_price) = fill_price else {
                        events.push(no_security(req_id, &contract.symbol));
                        continue;
                    };
                    self.shared.orders.lock().expect("sim poisoned").push(SimOrder {
                        req_id,
                        symbol: contract.symbol.clone(),
                        side,
                        qty,
                    });
                    events.push(BrokerEvent::OrderStatus(OrderStatusEvent {
                        req_id,
                        state: OrderState::Submitted,
                        filled: 0,
                        remaining: qty,
                        avg_fill_price: Price::ZERO,
                    }));
                    events.push(BrokerEvent::OrderStatus(OrderStatusEvent {
                        req_id,
                        state: OrderState::Filled,
                        filled: qty,
                        remaining: 0,
                        avg_fill_price: fill_price,
                    }));
                }
                VendorCommand::CancelOrder { req_id } => {
                    events.push(BrokerEvent::OrderStatus(OrderStatusEvent {
                        req_id,
                        state: OrderState::Cancelled,
                        filled: 0,
                        remaining: 0,
                        avg_fill_price: Price::ZERO,
                    }));
                }
                VendorCommand::ReqAccountSummary { req_id, tag } => {
                    let script = self.script();
                    events.push(BrokerEvent::AccountValue {
                        req_id,
                        summary: AccountSummary {
                            tag,
                            value: script.account_value,
                            currency: script.account_currency.clone(),
                        },
                    });
                }
                VendorCommand::ReqPositions { req_id } => {
                    let script = self.script();
                    for position in script.positions {
                        events.push(BrokerEvent::PositionReport { req_id, position });
                    }
                    events.push(BrokerEvent::PositionsEnd { req_id });
                }
            }
        }
        *self.shared.events.lock().expect("sim poisoned") = None;
        events.close();
    }
}

fn no_security(req_id: ReqId, symbol: &str) -> BrokerEvent {
    BrokerEvent::Error {
        req_id,
        code: 200,
        message: format!("No security definition found for {}", symbol),
    }
}
