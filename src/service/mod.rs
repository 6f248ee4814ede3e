//! Background service: polling, digest and cleanup timers.

pub mod orchestrator;
pub mod schedule;

pub use orchestrator::{
    CycleStats, IngestReport, Notification, Orchestrator, RunOptions, ServiceStatus, Snapshot,
};
pub use schedule::{DailySchedule, TimeOfDay};
