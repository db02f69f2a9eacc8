pub mod detection;
pub mod execution;
pub mod news;
pub mod position;

use std::time::Duration;

/// Bound on every stage-to-stage queue. Senders suspend when full.
pub const STAGE_QUEUE_CAPACITY: usize = 1024;

/// How long a stage keeps draining its input queue after shutdown fires.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

pub use detection::DetectionStage;
pub use execution::{ExecCommand, ExecutionStage, ExitRequest};
pub use news::NewsStage;
pub use position::{PositionCommand, PositionSupervisor};
