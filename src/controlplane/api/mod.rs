//! API Module
//!
//! REST API over discovery state and orchestrator metrics.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
