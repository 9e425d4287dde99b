//! robotbench -- cross-platform robot test orchestration.
//!
//! This crate dispatches one logical test run to a selectable set of
//! robot-control platforms (a physical robot and one or more
//! simulators) in parallel, collects each platform's result
//! independently, and produces a unified comparison. It supervises a
//! single reconnecting channel to the orchestration backend and keeps
//! all run/platform state behind one single-writer event loop.

pub mod aggregate;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod logbuf;
pub mod orchestrator;
pub mod registry;

pub use aggregate::{ComparisonSummary, ExportDocument, PlatformResult};
pub use channel::{ChannelError, ChannelState, ChannelSupervisor};
pub use config::Config;
pub use coordinator::{RunState, TestRun};
pub use orchestrator::{Orchestrator, OrchestratorHandle, StateChange};
pub use registry::{HttpCommander, PlatformRegistry, PlatformState};
