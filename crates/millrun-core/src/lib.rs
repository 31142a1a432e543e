//! # millrun-core
//!
//! Domain model for the millrun workflow execution engine.
//!
//! A *workflow* is a user-authored automation: a script declaring
//! **producers** (scheduled pullers of external facts), **topics**
//! (internal pub/sub streams) and **consumers** (handlers that process
//! events and perform side effects through connector tools). This crate
//! defines the entities that make such a declaration durable and
//! executable:
//!
//! - [`model`] — workflows, scripts, sessions, handler runs, mutations,
//!   events, input records, producer schedules, handler state.
//! - [`config`] — the `WorkflowConfig` shape stored on a workflow plus its
//!   static validator.
//! - [`error`] — domain error classification (`auth`, `network`, `logic`,
//!   ...) and its mapping onto run statuses.
//! - [`prepare`] — the `PrepareResult` contract returned by a consumer's
//!   prepare phase, including wake-at clamping.
//! - [`sandbox`] — the evaluator contract the engine drives user code
//!   through.
//! - [`tool`] — the connector tool contract and phase tagging.
//! - [`schedule`] — interval/cron schedule parsing and next-fire math.

pub mod config;
pub mod error;
pub mod model;
pub mod prepare;
pub mod sandbox;
pub mod schedule;
pub mod tool;

pub use config::{ConfigError, ConsumerConfig, ProducerConfig, WorkflowConfig};
pub use error::{ClassifiedError, ErrorKind};
pub use model::{
    Event, EventStatus, HandlerKind, HandlerRun, HandlerState, InputRecord, LogLevel, LogLine,
    Mutation, MutationStatus, ProducerSchedule, ResolvedBy, RunPhase, RunStatus, Script,
    ScriptKind, ScriptRun, SessionResult, Trigger, Workflow, WorkflowStatus,
};
pub use prepare::{clamp_wake_at, PrepareResult, PrepareUi, Reservation};
pub use sandbox::{EvalOutcome, EvalRequest, Evaluator};
pub use schedule::{parse_interval, ScheduleError, ScheduleSpec};
pub use tool::{PhaseTag, Tool, ToolCallError, ToolDispatcher};
