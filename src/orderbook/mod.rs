//! Real-time order-book intelligence: L2 book synchronization, persistent
//! wall detection, order-flow imbalance scoring, feed collection, and
//! durable storage.

pub mod book_state;
pub mod collector;
pub mod ofi_engine;
pub mod persistence;
pub mod types;
pub mod wall_tracker;

pub use book_state::BookState;
pub use collector::{Collector, CollectorConfig, Subscriber};
pub use ofi_engine::OfiEngine;
pub use persistence::{Persistence, PersistenceConfig};
pub use types::{OrderBook, UpdateRecord, Wall};
pub use wall_tracker::WallTracker;
