//! # Flow Execution Engine
//!
//! An event-sourced flow orchestration kernel for running directed acyclic
//! graphs of steps toward user-declared goals.
//!
//! ## Features
//!
//! - **Attribute dataflow scheduling**: steps become ready as the attributes
//!   they depend on are produced, derived by backward reachability from goals
//! - **Event-sourced flows**: every state change is an appended event,
//!   enabling replay and crash recovery
//! - **Work-item lifecycle**: retries with configurable backoff, per-item
//!   fan-out (`ForEach`), memoization, and optional-input timeout fallbacks
//! - **Wall-clock task scheduler**: a single keyed min-heap drives every
//!   retry and timeout in the system
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FlowOrchestrator                        │
//! │  (drives each flow's state machine, handles event replay)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!        TaskScheduler    WorkExecutor    EventQueue
//!        (retries/        (dispatch to    (partition
//!         timeouts)        step clients)   index updates)
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EventStore                            │
//! │        (catalog, partition and per-flow aggregates)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowctl_engine::prelude::*;
//!
//! let store = flowctl_engine::store::memory::InMemoryEventStore::new();
//! let engine = Engine::new(store, EngineConfig::default());
//! engine.register_step(producer_step).await?;
//! engine.register_step(consumer_step).await?;
//! let flow_id = engine.start_flow(plan, FlowOptions::default()).await?;
//! ```

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_queue;
pub mod events;
pub mod executor;
pub mod memo;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod reliability;
pub mod scheduler;
pub mod script;
pub mod store;
pub mod work_executor;

/// Common imports for consumers of the engine.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Engine, FlowOptions, QueryFlowsRequest};
    pub use crate::error::{EngineError, ErrorKind};
    pub use crate::model::{
        AttributeSpec, AttributeType, ExecutionPlan, ExecutionState, FlowId, FlowState,
        FlowStatus, HealthState, Name, Step, StepId, StepStatus, StepType, Token, WorkConfig,
        WorkState, WorkStatus,
    };
    pub use crate::store::{EventStore, StoreError};
    pub use crate::work_executor::{StepClient, StepInvocation, StepOutcome};
}

pub use engine::Engine;
pub use error::{EngineError, ErrorKind};
