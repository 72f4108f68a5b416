//! Tally Engine - Write-Behind Reconciliation
//!
//! Per domain, a [`Reconciler`] folds queued action events into a two-view
//! cache under last-writer-wins, and a [`Sweeper`] periodically migrates the
//! durable write view into the relation store, keeping counters consistent.
//! [`ActionService`] is the producing boundary and the live-read path;
//! [`Engine`] wires the tasks to concrete backends.

pub mod constants;
pub mod engine;
pub mod metrics;
pub mod reconciler;
pub mod service;
pub mod sweeper;
pub mod telemetry;

pub use engine::{Engine, EngineParts, EngineReport};
pub use metrics::{
    ReconcilerMetrics, ReconcilerSnapshot, SweepReport, SweeperMetrics, SweeperSnapshot,
};
pub use reconciler::{DeliveryOutcome, Reconciler};
pub use service::ActionService;
pub use sweeper::Sweeper;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
