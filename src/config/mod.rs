//! Configuration
//!
//! `AppConfig` is persisted as JSON in the SQLite `config` table and cached
//! in memory by [`ConfigStore`].

mod schema;
mod store;

pub use schema::{AppConfig, CallConfig, IceConfig, TurnServer, DEFAULT_STUN_SERVERS};
pub use store::{ConfigChange, ConfigStore};
