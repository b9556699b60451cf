//! SMcli Provisioner
//!
//! A Kubernetes dynamic provisioner for iSCSI SAN arrays managed with the
//! SMcli command-line client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Claim Controller                                   │
//! │            (watches PersistentVolumeClaims / PersistentVolumes)             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐        ┌─────────────────────────────────┐ │
//! │  │     iSCSI Provisioner       │        │        Defrag Scheduler         │ │
//! │  │  (access modes, PV source)  │        │   (periodic, best-effort)       │ │
//! │  └──────────────┬──────────────┘        └────────────────┬────────────────┘ │
//! │                 └──────────────────┬─────────────────────┘                  │
//! │                       ┌────────────┴────────────┐                           │
//! │                       │       SAN Client        │                           │
//! │                       │ create → LUN → bind     │                           │
//! │                       │ rollback, idempotency   │                           │
//! │                       └────────────┬────────────┘                           │
//! │          ┌─────────────────────────┼─────────────────────────┐              │
//! │  ┌───────┴───────┐      ┌──────────┴─────────┐      ┌────────┴────────┐     │
//! │  │ LUN Allocator │      │ Vendor Classifier  │      │ Command Executor│     │
//! │  └───────────────┘      └────────────────────┘      └─────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`san`]: SMcli execution, statements, error classification, LUN allocation
//! - [`provisioner`]: iSCSI provisioner and claim controller
//! - [`maintenance`]: disk group defragmentation
//! - [`config`]: startup configuration
//! - [`metrics`]: Prometheus metrics
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod provisioner;
pub mod san;

// Re-export commonly used types
pub use config::ProvisionerConfig;

pub use domain::ports::{
    AccessMode, CommandExecutor, CommandExecutorRef, CommandOutput, CreatedVolume, DiskLabel,
    RollbackOutcome, SanBackend, SanBackendRef, DISK_LABEL_MAX_LENGTH,
};

pub use error::{Error, ErrorAction, Result};

pub use maintenance::{DefragOutcome, DefragReport, DefragScheduler};

pub use metrics::ProvisionerMetrics;

pub use provisioner::{
    ClaimController, ControllerConfig, IscsiParameters, IscsiProvisioner, VolumeOptions,
};

pub use san::{
    next_available_lun, LunTable, ProcessExecutor, RollbackPolicy, SanConnection, SmcliClient,
    VendorErrorClassifier,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
