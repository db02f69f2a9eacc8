use crate::broker::events::{Contract, OrderSide, ReqId};
use crate::broker::queue::EventQueue;
use crate::error::EngineError;
use log::{info, warn};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Commands accepted by the vendor session worker. Mirrors the subset of the
/// vendor client surface the engine uses.
#[derive(Debug, Clone)]
pub enum VendorCommand {
    Connect {
        host: String,
        port: u16,
        client_id: i32,
    },
    Disconnect,
    ReqHistoricalBars {
        req_id: ReqId,
        contract: Contract,
        bar_size: String,
        count: u32,
    },
    ReqMktData {
        req_id: ReqId,
        contract: Contract,
        generic_ticks: String,
        snapshot: bool,
    },
    CancelMktData {
        req_id: ReqId,
    },
    PlaceOrder {
        req_id: ReqId,
        contract: Contract,
        side: OrderSide,
        qty: i64,
    },
    CancelOrder {
        req_id: ReqId,
    },
    ReqAccountSummary {
        req_id: ReqId,
        tag: String,
    },
    ReqPositions {
        req_id: ReqId,
    },
}

/// The blocking vendor client seam. Implementations own the vendor's wire
/// client and run its message loop; every callback payload is copied into a
/// `BrokerEvent` and published on the event queue.
///
/// `run` executes on a dedicated OS thread; the vendor library must never be
/// driven from the cooperative scheduler.
pub trait VendorClient: Send + 'static {
    fn run(&mut self, commands: mpsc::Receiver<VendorCommand>, events: Arc<EventQueue>);
}

/// Handle to the dedicated vendor session thread.
pub struct SessionHandle {
    tx: mpsc::Sender<VendorCommand>,
    join: Option<JoinHandle<()>>,
}

/// Start the vendor session on its own worker thread.
pub fn spawn_session(mut client: Box<dyn VendorClient>, events: Arc<EventQueue>) -> SessionHandle {
    let (tx, rx) = mpsc::channel();
    let join = std::thread::Builder::new()
        .name("vendor-session".to_string())
        .spawn(move || {
            info!("vendor session thread started");
            client.run(rx, events);
            info!("vendor session thread exited");
        })
        .expect("failed to spawn vendor session thread");
    SessionHandle {
        tx,
        join: Some(join),
    }
}

impl SessionHandle {
    pub fn send(&self, command: VendorCommand) -> Result<(), EngineError> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::Transport("vendor session worker is gone".to_string()))
    }

    /// Clone of the command sender, used by stream handles to issue
    /// cancellations on drop.
    pub fn sender(&self) -> mpsc::Sender<VendorCommand> {
        self.tx.clone()
    }

    /// Ask the worker to disconnect and wait for the thread to finish.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(VendorCommand::Disconnect);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("vendor session thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.shutdown();
        }
    }
}
