#![doc = include_str!("../README.md")]

pub mod config;
pub mod engine;
pub mod loopback;
pub mod metrics;
mod stages;

pub use config::{CONFIG_SCHEMA_VERSION, EngineConfig};
pub use engine::{Collaborators, Engine, ItemHandle};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
