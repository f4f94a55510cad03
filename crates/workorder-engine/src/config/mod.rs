//! Configuration loaded from environment variables with `envy`.

mod database;
mod engine;

pub use database::DatabaseConfig;
pub use engine::EngineConfig;
