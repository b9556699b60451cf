//! Provisioner
//!
//! The contract boundary towards Kubernetes: the iSCSI provisioner that
//! turns volume requests into array disks, and the controller that feeds it
//! claims and released volumes.

pub mod controller;
pub mod iscsi;
pub mod quantity;

pub use controller::{ClaimController, ControllerConfig};
pub use iscsi::{IscsiParameters, IscsiProvisioner, VolumeOptions, ANN_IDENTITY, ANN_PROVISIONED_BY};
pub use quantity::parse_quantity;
