//! # millrun-engine
//!
//! The execution engine for millrun workflows.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (picks a workflow + trigger; single session per workflow)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SessionRunner                            │
//! │  (producer fan-out, bounded consumer drain loop)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HandlerMachine                            │
//! │  (phase driver; re-reads the canonical run row every step)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Emm                                 │
//! │  (the only writer: one transaction per state transition)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sandbox evaluation and connector tools hang off the handler machine via
//! the contracts in `millrun-core`; events published during evaluation go
//! through the [`Ledger`] and flip in-memory dirty flags on the
//! [`SchedulerState`].

pub mod activate;
pub mod emm;
pub mod engine;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod reconcile;
pub mod recovery;
pub mod sched;
pub mod session;
pub mod testing;
pub mod tools;

pub use activate::ActivateScript;
pub use emm::{Emm, MutationResolution};
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use handler::{HandlerMachine, HandlerResult};
pub use ledger::{Ledger, PublishOutcome};
pub use reconcile::{ReconcileVerdict, Reconciler, ReconciliationRegistry};
pub use recovery::Recovery;
pub use sched::{Scheduler, SchedulerConfig, SchedulerState};
pub use session::{SessionOutcome, SessionRunner};
pub use tools::{ToolRegistry, builtins};
