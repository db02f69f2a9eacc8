use crate::types::{Price, Symbol};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Correlation ID for broker requests. `0` marks unsolicited events.
pub type ReqId = u64;

pub const UNSOLICITED: ReqId = 0;

/// Order side on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Vendor order lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    PreSubmitted,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled)
    }
}

/// Market order ticket. The engine submits market orders only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTicket {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub qty: i64,
}

/// Vendor contract description, built per the provider's conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub primary_exchange: String,
}

impl Contract {
    /// US equity contract routed through SMART.
    pub fn equity(symbol: &Symbol, primary_exchange: &str) -> Self {
        Self {
            symbol: symbol.as_str().to_string(),
            sec_type: "STK".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            primary_exchange: primary_exchange.to_string(),
        }
    }

    /// Broad-tape news contract for a provider code `P`:
    /// symbol `"{P}:{P}_ALL"`, exchange `P`.
    pub fn news_tape(provider_code: &str) -> Self {
        Self {
            symbol: format!("{p}:{p}_ALL", p = provider_code),
            sec_type: "NEWS".to_string(),
            exchange: provider_code.to_string(),
            currency: String::new(),
            primary_exchange: String::new(),
        }
    }
}

/// One 1-minute bar. `cum_volume` is the day-cumulative volume at bar close,
/// which the current-bar volume computation needs
/// (`snapshot.cum_volume - last_closed.cum_volume`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: u64,
    pub cum_volume: u64,
}

/// Coherent price + day-cumulative-volume pair for the current bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteSnapshot {
    pub price: Price,
    pub cum_volume: u64,
}

/// A single streamed price tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteTick {
    pub price: Price,
    pub ts: DateTime<Utc>,
}

/// A broad-tape news article as delivered by the vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsArticle {
    pub article_id: String,
    pub provider: String,
    pub headline: String,
    pub body: String,
    /// Symbols the provider tagged on the article; may be empty or noisy.
    pub symbols_hint: Vec<String>,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl NewsArticle {
    /// Parse a broad-tape news tick payload of the form
    /// `articleId;provider;publishedMs;headline[;SYM1,SYM2,...]`.
    pub fn from_tick_payload(payload: &str) -> Option<Self> {
        let mut parts = payload.splitn(5, ';');
        let article_id = parts.next()?.trim();
        let provider = parts.next()?.trim();
        let published_ms: i64 = parts.next()?.trim().parse().ok()?;
        let headline = parts.next()?.trim();
        if article_id.is_empty() || provider.is_empty() || headline.is_empty() {
            return None;
        }
        let symbols_hint = parts
            .next()
            .map(|s| {
                s.split(',')
                    .map(|sym| sym.trim().to_string())
                    .filter(|sym| !sym.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let published_at = Utc.timestamp_millis_opt(published_ms).single()?;
        Some(Self {
            article_id: article_id.to_string(),
            provider: provider.to_string(),
            headline: headline.to_string(),
            body: headline.to_string(),
            symbols_hint,
            published_at,
            received_at: Utc::now(),
        })
    }
}

/// Account summary value for a single tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub tag: String,
    pub value: Decimal,
    pub currency: String,
}

/// A position as reported by the broker, used for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    /// Signed share count: negative for short.
    pub qty: i64,
    pub avg_cost: Price,
}

/// Order status update carried on the order's request ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusEvent {
    pub req_id: ReqId,
    pub state: OrderState,
    pub filled: i64,
    pub remaining: i64,
    pub avg_fill_price: Price,
}

/// Tick payload kinds on a market-data subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickKind {
    Price(Price),
    /// Day-cumulative traded volume.
    Size(u64),
    /// Raw broad-tape news payload; see [`NewsArticle::from_tick_payload`].
    News(String),
}

/// Everything the vendor session can deliver, copied out of the callback
/// thread into one queue. Each variant carries the request ID it answers,
/// or `0` when unsolicited.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    NewsArticle {
        req_id: ReqId,
        article: NewsArticle,
    },
    Tick {
        req_id: ReqId,
        kind: TickKind,
    },
    HistoricalBar {
        req_id: ReqId,
        bar: Bar,
    },
    HistoricalBarsEnd {
        req_id: ReqId,
    },
    OrderStatus(OrderStatusEvent),
    ExecutionReport {
        req_id: ReqId,
        shares: i64,
        price: Price,
    },
    AccountValue {
        req_id: ReqId,
        summary: AccountSummary,
    },
    PositionReport {
        req_id: ReqId,
        position: BrokerPosition,
    },
    PositionsEnd {
        req_id: ReqId,
    },
    Error {
        req_id: ReqId,
        code: i32,
        message: String,
    },
    ConnectionAck,
    ConnectionClosed,
}

impl BrokerEvent {
    pub fn req_id(&self) -> ReqId {
        match self {
            BrokerEvent::NewsArticle { req_id, .. }
            | BrokerEvent::Tick { req_id, .. }
            | BrokerEvent::HistoricalBar { req_id, .. }
            | BrokerEvent::HistoricalBarsEnd { req_id }
            | BrokerEvent::ExecutionReport { req_id, .. }
            | BrokerEvent::AccountValue { req_id, .. }
            | BrokerEvent::PositionReport { req_id, .. }
            | BrokerEvent::PositionsEnd { req_id }
            | BrokerEvent::Error { req_id, .. } => *req_id,
            BrokerEvent::OrderStatus(status) => status.req_id,
            BrokerEvent::ConnectionAck | BrokerEvent::ConnectionClosed => UNSOLICITED,
        }
    }

    /// Ticks are the only events the inbound queue may shed under overflow.
    pub fn is_tick(&self) -> bool {
        matches!(self, BrokerEvent::Tick { .. })
    }
}

/// Severity classes for the vendor's error channel, which doubles as an
/// information channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Informational,
    Warning,
    Transient,
    Fatal,
}

/// Fixed classification table for vendor error codes. Only `Transient` and
/// `Fatal` resolve awaiters as failures.
pub fn classify_error(code: i32) -> ErrorClass {
    match code {
        2104 | 2106 | 2108 | 2158 => ErrorClass::Informational,
        1100 | 1102 | 1300 => ErrorClass::Transient,
        200 | 321 | 354 | 504 => ErrorClass::Fatal,
        _ => ErrorClass::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_table() {
        assert_eq!(classify_error(2104), ErrorClass::Informational);
        assert_eq!(classify_error(2106), ErrorClass::Informational);
        assert_eq!(classify_error(2108), ErrorClass::Informational);
        assert_eq!(classify_error(2158), ErrorClass::Informational);
        assert_eq!(classify_error(1100), ErrorClass::Transient);
        assert_eq!(classify_error(1102), ErrorClass::Transient);
        assert_eq!(classify_error(1300), ErrorClass::Transient);
        assert_eq!(classify_error(200), ErrorClass::Fatal);
        assert_eq!(classify_error(321), ErrorClass::Fatal);
        assert_eq!(classify_error(354), ErrorClass::Fatal);
        assert_eq!(classify_error(504), ErrorClass::Fatal);
        assert_eq!(classify_error(9999), ErrorClass::Warning);
    }

    #[test]
    fn test_news_tape_contract() {
        let contract = Contract::news_tape("BZ");
        assert_eq!(contract.symbol, "BZ:BZ_ALL");
        assert_eq!(contract.sec_type, "NEWS");
        assert_eq!(contract.exchange, "BZ");
    }

    #[test]
    fn test_equity_contract() {
        let symbol = Symbol::parse("AAPL").unwrap();
        let contract = Contract::equity(&symbol, "NASDAQ");
        assert_eq!(contract.symbol, "AAPL");
        assert_eq!(contract.sec_type, "STK");
        assert_eq!(contract.exchange, "SMART");
        assert_eq!(contract.currency, "USD");
        assert_eq!(contract.primary_exchange, "NASDAQ");
    }

    #[test]
    fn test_news_payload_parse() {
        let article =
            NewsArticle::from_tick_payload("bz-123;BZ;1700000000000;Acme beats estimates;ACME")
                .unwrap();
        assert_eq!(article.article_id, "bz-123");
        assert_eq!(article.provider, "BZ");
        assert_eq!(article.headline, "Acme beats estimates");
        assert_eq!(article.symbols_hint, vec!["ACME".to_string()]);
        assert_eq!(article.published_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_news_payload_parse_without_hint() {
        let article =
            NewsArticle::from_tick_payload("bz-9;BZ;1700000000000;Markets quiet").unwrap();
        assert!(article.symbols_hint.is_empty());
    }

    #[test]
    fn test_news_payload_parse_multiple_hints() {
        let article =
            NewsArticle::from_tick_payload("bz-2;BZ;1700000000000;Sector roundup;AAPL,MSFT")
                .unwrap();
        assert_eq!(
            article.symbols_hint,
            vec!["AAPL".to_string(), "MSFT".to_string()]
        );
    }

    #[test]
    fn test_news_payload_parse_rejects_garbage() {
        assert!(NewsArticle::from_tick_payload("no-separators").is_none());
        assert!(NewsArticle::from_tick_payload("id;BZ;not-a-ts;headline").is_none());
        assert!(NewsArticle::from_tick_payload(";BZ;1700000000000;headline").is_none());
        assert!(NewsArticle::from_tick_payload("id;;1700000000000;headline").is_none());
        // Old provider-less layout must not parse as a valid article.
        assert!(NewsArticle::from_tick_payload("id;1700000000000;headline").is_none());
    }

    #[test]
    fn test_event_req_id_extraction() {
        let event = BrokerEvent::HistoricalBarsEnd { req_id: 42 };
        assert_eq!(event.req_id(), 42);
        assert_eq!(BrokerEvent::ConnectionAck.req_id(), UNSOLICITED);

        let tick = BrokerEvent::Tick {
            req_id: 7,
            kind: TickKind::Size(100),
        };
        assert!(tick.is_tick());
        assert!(!BrokerEvent::ConnectionClosed.is_tick());
    }

    #[test]
    fn test_order_state_terminal() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(!OrderState::Submitted.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
    }
}
