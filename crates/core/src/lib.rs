//! Core types and configuration for the swapshard system.
//!
//! This crate provides shared types used across all other crates:
//! - Swap payloads as delivered by the subgraph and stored per shard
//! - Normalized trades and derived price points
//! - Configuration structures
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, PairConfig, SeriesConfig, ShardConfig, SubgraphConfig};
pub use error::{Error, Result};
pub use types::*;
