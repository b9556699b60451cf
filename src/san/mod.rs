//! SAN Access
//!
//! Everything that talks to the storage array through the SMcli tool:
//! process execution, statement grammar, vendor error classification,
//! LUN allocation and the [`SmcliClient`] backend that ties them together.

pub mod classifier;
pub mod client;
pub mod executor;
pub mod lun;
pub mod statement;

#[cfg(test)]
pub(crate) mod testing;

pub use classifier::{CommandOutcome, VendorErrorClassifier, VendorErrorKind, VendorErrorPattern};
pub use client::{RollbackPolicy, SanConnection, SmcliClient};
pub use executor::{ProcessExecutor, DEFAULT_COMMAND_TIMEOUT};
pub use lun::{next_available_lun, LunExhausted, LunTable, LUN_RANGE, RESERVED_LUN};
pub use statement::{Statement, StatementKind};
