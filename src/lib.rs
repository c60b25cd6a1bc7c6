//! Task Broker Library
//!
//! Multi-tenant work distribution: projects submit tasks, workers pull them
//! under access control and rate limits and report results back.

pub mod broker;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod rate;
pub mod scheduler;
pub mod types;

pub use broker::Broker;
pub use error::{BrokerError, BrokerResult, ErrorCode};
