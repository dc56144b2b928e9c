//! Machine health operator
//!
//! Watches MachineHealthChecks of Cluster API clusters and detects the
//! machines whose nodes fail to start or stay unhealthy for too long.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;

pub use config::OperatorConfig;
pub use error::{Error, Result};
