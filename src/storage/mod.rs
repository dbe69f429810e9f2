//! Persistence (§4.6): a single sqlite file for decisions/rewards/bandit log/event
//! cache, plus atomic JSON snapshots for bandit posterior state.

mod sqlite;
pub mod snapshot;

pub use sqlite::{ArmAggregate, BanditLogRow, EventCacheRow, Store};
