//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the volume lifecycle logic and
//! external systems (the SMcli process, the SAN array). Adapters implement
//! them; tests substitute fakes.

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

// =============================================================================
// Disk Labels
// =============================================================================

/// Longest user label the array accepts for a virtual disk
pub const DISK_LABEL_MAX_LENGTH: usize = 30;

/// A virtual disk label, truncated to what the array accepts.
///
/// Truncation keeps the first [`DISK_LABEL_MAX_LENGTH`] characters, so the
/// same long name always maps to the same disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskLabel(String);

impl DiskLabel {
    pub fn new(name: &str) -> Self {
        Self(name.chars().take(DISK_LABEL_MAX_LENGTH).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DiskLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Access Modes
// =============================================================================

/// Volume access modes understood by the provisioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl AccessMode {
    /// Modes an iSCSI LUN can honour
    pub const SUPPORTED: [AccessMode; 2] = [AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadOnlyMany => "ReadOnlyMany",
            AccessMode::ReadWriteMany => "ReadWriteMany",
            AccessMode::ReadWriteOncePod => "ReadWriteOncePod",
        }
    }

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Ok(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
            "ReadWriteOncePod" => Ok(AccessMode::ReadWriteOncePod),
            other => Err(format!("unknown access mode {}", other)),
        }
    }
}

// =============================================================================
// Command Execution
// =============================================================================

/// Captured result of one external process run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (-1 when killed by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Exit code 0 is the only success signal
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Port for running external commands
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A process that cannot be started is an error; a process that exits
    /// non-zero is not.
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput>;
}

// =============================================================================
// SAN Backend
// =============================================================================

/// A virtual disk that is present on the array and mapped to a LUN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVolume {
    pub disk: DiskLabel,
    pub lun: u8,
    /// The array already had a disk with this label
    pub already_existed: bool,
}

/// Result of the compensating delete issued when no LUN could be allocated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The disk was removed again
    Deleted { attempts: u32 },
    /// Every attempt failed; the disk stays on the array without a LUN
    Orphaned { attempts: u32, message: String },
}

impl RollbackOutcome {
    pub fn is_orphaned(&self) -> bool {
        matches!(self, RollbackOutcome::Orphaned { .. })
    }
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::Deleted { attempts } => {
                write!(f, "disk rolled back after {} attempt(s)", attempts)
            }
            RollbackOutcome::Orphaned { attempts, message } => write!(
                f,
                "disk left orphaned after {} failed delete attempt(s): {}",
                attempts, message
            ),
        }
    }
}

/// Port for virtual disk management on the SAN array
#[async_trait]
pub trait SanBackend: Send + Sync {
    /// Create a virtual disk and map it to the lowest free LUN
    async fn create_volume(&self, name: &str, capacity_bytes: u64) -> Result<CreatedVolume>;

    /// Delete a virtual disk; a disk that is already gone is not an error
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Start a defragmentation of the storage group
    async fn defrag(&self) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandExecutorRef = Arc<dyn CommandExecutor>;
pub type SanBackendRef = Arc<dyn SanBackend>;
