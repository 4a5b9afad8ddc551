//! Domain layer - Core types and port definitions
//!
//! This module defines the backend identities and the port traits that
//! store implementations provide, following hexagonal architecture
//! principles.

pub mod backend;
pub mod ports;

pub use backend::*;
pub use ports::*;
