//! Persistence.
//!
//! [`Store`] is the seam the engine depends on. [`MemoryStore`] keeps
//! everything in process; [`PgStore`] persists to PostgreSQL using SQLx.

pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod queries;
pub mod store;

pub use memory::MemoryStore;
pub use pool::{create_pool, DbPool};
pub use postgres::PgStore;
pub use store::Store;
