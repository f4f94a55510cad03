//! Persistence models.

pub mod comment;
pub mod escalation;
pub mod flow;
pub mod instance;

pub use comment::{CommentStatus, InstanceComment};
pub use escalation::{EscalationMarker, ScanCursor};
pub use flow::InstanceFlow;
pub use instance::{Instance, InstanceState, InstanceStatus, Priority};
