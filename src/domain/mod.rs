//! Domain layer - Core value types and port definitions
//!
//! This module defines the traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
