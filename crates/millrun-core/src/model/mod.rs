//! Persisted entities and their lifecycle enums

mod event;
mod mutation;
mod run;
mod script;
mod state;
mod workflow;

pub use event::{Event, EventStatus, InputRecord};
pub use mutation::{Mutation, MutationStatus, ResolvedBy};
pub use run::{
    HandlerKind, HandlerRun, LogLevel, LogLine, RunPhase, RunStatus, ScriptRun, SessionResult,
    Trigger,
};
pub use script::{Script, ScriptKind};
pub use state::{HandlerState, ProducerSchedule};
pub use workflow::{Workflow, WorkflowStatus};
