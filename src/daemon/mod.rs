//! Daemon Module
//!
//! One application instance: HTTP API in front, index lifecycle manager
//! behind, and an ingest queue drained by the log processor in between.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       logfed serve                          │
//! │                                                             │
//! │  POST /log/ingest ──▶ Queue ──▶ LogProcessor ──┐            │
//! │                                                ▼            │
//! │                          ┌────────────────────────────────┐ │
//! │                          │    IndexLifecycleManager       │ │
//! │                          │  active shard  ◀── rollover    │ │
//! │                          │  federation    ◀── retention   │ │
//! │                          └────────────────────────────────┘ │
//! │                                                ▲            │
//! │  POST /log/search ──▶ SearchFederation ────────┘            │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod http;
pub mod lifecycle;
pub mod processor;
pub mod scheduler;

pub use lifecycle::Daemon;
pub use processor::{LogProcessor, ProcessorStats};
pub use scheduler::{CronScheduler, Scheduler, SchedulerError};
