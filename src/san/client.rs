//! SMcli SAN Client
//!
//! Drives virtual disk management on the array through SMcli statements:
//! create (disk → LUN allocation → LUN binding, with rollback), idempotent
//! delete, and disk group defragmentation.

use super::classifier::{CommandOutcome, VendorErrorClassifier, VendorErrorKind};
use super::lun::{next_available_lun, LunTable};
use super::statement::{redacted_args, smcli_args, Statement};
use crate::domain::ports::{
    CommandExecutorRef, CommandOutput, CreatedVolume, DiskLabel, RollbackOutcome, SanBackend,
};
use crate::error::{Error, Result};
use crate::metrics::ProvisionerMetrics;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// =============================================================================
// Connection
// =============================================================================

/// Immutable connection settings for one array and storage group
#[derive(Clone)]
pub struct SanConnection {
    /// Array management address
    pub address: String,
    /// Disk group new virtual disks are created in
    pub disk_group: String,
    /// Host group LUNs are mapped to; defaults to the disk group name
    pub host_group: Option<String>,
    /// Array password, if one is set
    pub password: Option<String>,
    /// Path to the SMcli binary
    pub smcli_path: PathBuf,
}

impl SanConnection {
    pub fn new(
        address: impl Into<String>,
        disk_group: impl Into<String>,
        smcli_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            address: address.into(),
            disk_group: disk_group.into(),
            host_group: None,
            password: None,
            smcli_path: smcli_path.into(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into()).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn with_host_group(mut self, host_group: impl Into<String>) -> Self {
        self.host_group = Some(host_group.into()).filter(|g: &String| !g.is_empty());
        self
    }

    pub fn host_group(&self) -> &str {
        self.host_group.as_deref().unwrap_or(&self.disk_group)
    }
}

impl std::fmt::Debug for SanConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SanConnection")
            .field("address", &self.address)
            .field("disk_group", &self.disk_group)
            .field("host_group", &self.host_group())
            .field("password", &self.password.as_ref().map(|_| "******"))
            .field("smcli_path", &self.smcli_path)
            .finish()
    }
}

// =============================================================================
// Rollback Policy
// =============================================================================

/// How hard to try removing a disk that could not get a LUN
#[derive(Debug, Clone, Copy)]
pub struct RollbackPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// SMcli Client
// =============================================================================

/// [`SanBackend`] that talks to the array through SMcli
pub struct SmcliClient {
    connection: SanConnection,
    executor: CommandExecutorRef,
    classifier: VendorErrorClassifier,
    rollback: RollbackPolicy,
    /// Serializes LUN table query → allocation → bind for the host group
    lun_lock: Mutex<()>,
    metrics: Option<Arc<ProvisionerMetrics>>,
}

impl SmcliClient {
    /// Create a client for one array connection
    pub fn new(connection: SanConnection, executor: CommandExecutorRef) -> Self {
        Self {
            connection,
            executor,
            classifier: VendorErrorClassifier::new(),
            rollback: RollbackPolicy::default(),
            lun_lock: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_classifier(mut self, classifier: VendorErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_rollback_policy(mut self, rollback: RollbackPolicy) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ProvisionerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn connection(&self) -> &SanConnection {
        &self.connection
    }

    /// Current LUN mappings of the host group
    pub async fn lun_table(&self) -> Result<LunTable> {
        let statement = Statement::ShowLunMappings {
            host_group: self.connection.host_group(),
        };
        let output = self.execute(&statement).await?;
        self.check(&statement, &output)?;
        Ok(LunTable::parse(&output.stdout))
    }

    /// Run one statement through SMcli
    async fn execute(&self, statement: &Statement<'_>) -> Result<CommandOutput> {
        let args = smcli_args(
            &self.connection.address,
            self.connection.password.as_deref(),
            statement,
        );
        debug!(args = %redacted_args(&args), "Executing SMcli");

        let started = Instant::now();
        let result = self.executor.run(&self.connection.smcli_path, &args).await;

        if let Some(metrics) = &self.metrics {
            metrics.observe_command(statement.kind().as_str(), started.elapsed().as_secs_f64());
        }

        result
    }

    /// Classify a result, turning unrecognized failures into errors
    fn check(&self, statement: &Statement<'_>, output: &CommandOutput) -> Result<Option<VendorErrorKind>> {
        match self.classifier.classify(statement.kind(), output) {
            CommandOutcome::Success => Ok(None),
            CommandOutcome::Recognized(kind) => Ok(Some(kind)),
            CommandOutcome::Failed { exit_code, message } => Err(Error::VendorFailure {
                statement: statement.to_string(),
                exit_code,
                message,
            }),
        }
    }

    async fn run_checked(&self, statement: &Statement<'_>) -> Result<Option<VendorErrorKind>> {
        let output = self.execute(statement).await?;
        self.check(statement, &output)
    }

    async fn delete_disk(&self, disk: &DiskLabel) -> Result<()> {
        let statement = Statement::DeleteDisk { disk };
        if let Some(VendorErrorKind::DiskNotFound) = self.run_checked(&statement).await? {
            info!(disk = %disk, "Virtual disk does not exist, nothing to delete");
        }
        Ok(())
    }

    /// Remove a disk that could not be given a LUN
    async fn roll_back(&self, disk: &DiskLabel) -> RollbackOutcome {
        let mut last_error = String::new();

        for attempt in 1..=self.rollback.attempts {
            if attempt > 1 {
                tokio::time::sleep(self.rollback.delay).await;
            }
            match self.delete_disk(disk).await {
                Ok(()) => {
                    info!(disk = %disk, attempt, "Rolled back virtual disk");
                    return RollbackOutcome::Deleted { attempts: attempt };
                }
                Err(e) => {
                    warn!(disk = %disk, attempt, "Rollback delete failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        error!(
            disk = %disk,
            group = %self.connection.disk_group,
            "Virtual disk left on the array without a LUN: {}",
            last_error
        );
        RollbackOutcome::Orphaned {
            attempts: self.rollback.attempts,
            message: last_error,
        }
    }
}

#[async_trait]
impl SanBackend for SmcliClient {
    async fn create_volume(&self, name: &str, capacity_bytes: u64) -> Result<CreatedVolume> {
        let disk = DiskLabel::new(name);

        if capacity_bytes == 0 {
            return Err(Error::Validation(format!(
                "capacity of volume {} must be greater than zero",
                name
            )));
        }

        info!(
            disk = %disk,
            group = %self.connection.disk_group,
            capacity_bytes,
            "Creating virtual disk"
        );
        let create = Statement::CreateDisk {
            disk_group: &self.connection.disk_group,
            disk: &disk,
            capacity_bytes,
        };
        let already_existed = matches!(
            self.run_checked(&create).await?,
            Some(VendorErrorKind::DiskAlreadyExists)
        );
        if already_existed {
            info!(disk = %disk, "Virtual disk already exists, reusing it");
        }

        let guard = self.lun_lock.lock().await;

        let table = self.lun_table().await?;
        if let Some(lun) = table.lun_of(disk.as_str()).and_then(|lun| u8::try_from(lun).ok()) {
            info!(disk = %disk, lun, "Virtual disk is already mapped");
            return Ok(CreatedVolume {
                disk,
                lun,
                already_existed,
            });
        }

        let lun = match next_available_lun(&table) {
            Ok(lun) => lun,
            Err(exhausted) => {
                drop(guard);
                warn!(disk = %disk, "Cannot allocate LUN ({}), deleting virtual disk", exhausted);
                let rollback = self.roll_back(&disk).await;
                return Err(Error::AllocationExhausted {
                    group: self.connection.host_group().to_string(),
                    rollback,
                });
            }
        };

        info!(disk = %disk, lun, host_group = %self.connection.host_group(), "Binding virtual disk to LUN");
        let bind = Statement::BindLun {
            disk: &disk,
            lun,
            host_group: self.connection.host_group(),
        };
        self.run_checked(&bind).await?;
        drop(guard);

        Ok(CreatedVolume {
            disk,
            lun,
            already_existed,
        })
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let disk = DiskLabel::new(name);
        info!(disk = %disk, "Deleting virtual disk");
        self.delete_disk(&disk).await
    }

    async fn defrag(&self) -> Result<()> {
        info!(group = %self.connection.disk_group, "Starting disk group defragmentation");
        let statement = Statement::Defragment {
            disk_group: &self.connection.disk_group,
        };
        self.run_checked(&statement).await.map(|_| ())
    }
}
