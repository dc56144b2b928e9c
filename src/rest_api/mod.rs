//! HTTP endpoints of the operator
//!
//! Serves Prometheus metrics and the liveness and readiness probes.

mod server;

pub use server::{router, run_server};
