//! The work-order engine.
//!
//! - [`evaluator`]: condition evaluation and connection selection
//! - [`assignment`]: assignment strategies
//! - [`machine`]: instance lifecycle and transitions
//! - [`comments`]: comment threads
//! - [`escalation`]: the time-limit scheduler

pub mod assignment;
pub mod comments;
pub mod escalation;
pub mod evaluator;
pub mod machine;

pub use assignment::AssignmentResolver;
pub use comments::{CommentNode, CommentService};
pub use escalation::{EscalationScheduler, TickReport};
pub use evaluator::{evaluate, select_connection};
pub use machine::{ActionRequest, WorkOrderEngine, MAX_AUTO_ADVANCE};
