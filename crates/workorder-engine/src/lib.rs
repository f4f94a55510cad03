//! Work-order process engine.
//!
//! A declarative step graph ([`definition::ProcessDefinition`]) drives
//! long-lived work-order instances through approval and task steps:
//!
//! - **Definitions**: parsed from YAML/JSON, validated as a graph before
//!   publish, immutable and versioned afterwards
//! - **State machine**: applies actor actions under optimistic versioning,
//!   one audit flow row per accepted action
//! - **Assignment**: manual, role, department, load-balanced and
//!   rule-based strategies over an external directory
//! - **Escalation**: a scheduler that acts on steps outliving their time
//!   limit, at most once per step entry
//! - **Comments**: per-instance threads with soft delete
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use workorder_engine::{
//!     config::EngineConfig, db::MemoryStore, definition::parse_definition,
//!     directory::StaticDirectory, notify::TracingNotifier, WorkOrderEngine,
//! };
//!
//! let engine = WorkOrderEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(StaticDirectory::new().with_role("manager", &["bob"])),
//!     Arc::new(TracingNotifier),
//!     &EngineConfig::default(),
//! );
//! let published = engine.publish_definition(parse_definition(yaml)?).await?;
//! ```

pub mod config;
pub mod db;
pub mod definition;
pub mod directory;
pub mod engine;
pub mod error;
pub mod nats;
pub mod notify;
pub mod result_ext;

pub use engine::{ActionRequest, EscalationScheduler, TickReport, WorkOrderEngine};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use result_ext::ResultExt;
