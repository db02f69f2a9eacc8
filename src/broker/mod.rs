pub mod bridge;
pub mod events;
pub mod queue;
pub mod registry;
pub mod session;
pub mod sim;

pub use bridge::{BrokerBridge, PendingOrder, QuoteStream, SessionEvent};
pub use events::{
    classify_error, AccountSummary, Bar, BrokerEvent, BrokerPosition, Contract, ErrorClass,
    NewsArticle, OrderSide, OrderState, OrderStatusEvent, OrderTicket, QuoteSnapshot, QuoteTick,
    ReqId, TickKind,
};
pub use queue::EventQueue;
pub use registry::{OrderOutcome, RequestKind, RequestRegistry, ResponsePayload};
pub use session::{spawn_session, SessionHandle, VendorClient, VendorCommand};
pub use sim::{SimHandle, SimOrder, SimScript, SimVendorClient};
