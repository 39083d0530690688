//! Network traffic filter: rule storage, block decisions, event recording,
//! and windowed statistics for a forwarding proxy.
//!
//! Feature flags:
//! - `metrics`: counters/histograms via `netwatch-metrics`
//! - `service`: JSON management layer for the web/API collaborator

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod logging;
pub mod recorder;
pub mod rules;
pub mod stats;
pub mod store;
pub mod types;

#[cfg(feature = "service")]
pub mod service;

pub use {
    config::{FilterConfig, LoggingConfig},
    controller::{
        BLOCK_STATUS, BlockResponse, FilterController, FilterEvent, FilterStatus, RequestVerdict,
    },
    engine::{Decision, FilterRequest, decide},
    error::{Error, Result},
    recorder::EventRecorder,
    rules::RuleStore,
    stats::{DashboardStats, StatsAggregator},
    store::{EventStore, SqliteEventStore, WindowStats},
    types::*,
};
