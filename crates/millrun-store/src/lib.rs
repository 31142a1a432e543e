//! # millrun-store
//!
//! Transactional persistence for the millrun workflow engine.
//!
//! Every engine state transition is composed of reads and writes inside a
//! single [`StoreTx`]; `commit` publishes all of them atomically or none.
//! The [`Store`] trait additionally offers read-only queries used outside
//! transactions (scheduler scans, recovery sweeps, UI listings).
//!
//! Implementations:
//! - [`PostgresStore`] — production, one `sqlx` transaction per [`StoreTx`].
//! - [`MemoryStore`] — tests, snapshot-isolation transactions over an
//!   in-memory state so aborted transactions really do leave no trace.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{Store, StoreError, StoreTx};
