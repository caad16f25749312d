//! The trace collector.
//!
//! The service side of the agent's buffer protocol: it carves buffers out
//! of shared slabs, drains exchanged segments into per-process trace files,
//! and is configured by a small tree-shaped config file.

pub mod config;
pub mod service;

pub use config::{expand_template, CollectorConfig, ConfigValue};
pub use service::CollectorService;
