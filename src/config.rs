//! Provisioner Configuration
//!
//! Settings for the array connection and the provisioner instance, read
//! from flags or the environment and checked once at startup.

use crate::error::{Error, Result};
use crate::san::{RollbackPolicy, SanConnection};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Install location of the SMcli client
pub const DEFAULT_SMCLI_COMMAND: &str = "/opt/dell/mdstoragemanager/client/SMcli";

pub const DEFAULT_PROVISIONER_NAME: &str = "smcli.storage/iscsi";

/// Provisioner and array settings
#[derive(clap::Args, Debug, Clone)]
pub struct ProvisionerConfig {
    /// Identity of this provisioner instance, recorded on every volume
    #[arg(long, env = "IDENTIFIER", default_value = "")]
    pub identifier: String,

    /// Provisioner name storage classes refer to
    #[arg(long, env = "PROVISIONER_NAME", default_value = DEFAULT_PROVISIONER_NAME)]
    pub provisioner_name: String,

    /// Array management address
    #[arg(long, env = "SAN_ADDRESS", default_value = "")]
    pub san_address: String,

    /// Array password; empty means none
    #[arg(long, env = "SAN_PASSWORD", default_value = "", hide_env_values = true)]
    pub san_password: String,

    /// Disk group virtual disks are created in
    #[arg(long, env = "SAN_GROUP_NAME", default_value = "")]
    pub san_group_name: String,

    /// Host group LUNs are mapped to (defaults to the disk group)
    #[arg(long, env = "SAN_HOST_GROUP")]
    pub san_host_group: Option<String>,

    /// Path to the SMcli binary
    #[arg(long, env = "SMCLI_COMMAND", default_value = DEFAULT_SMCLI_COMMAND)]
    pub smcli_command: PathBuf,

    /// Seconds an SMcli run may take before it is killed
    #[arg(long, env = "COMMAND_TIMEOUT_SECS", default_value = "120")]
    pub command_timeout_secs: u64,

    /// Seconds between disk group defragmentations (0 disables them)
    #[arg(long, env = "DEFRAG_INTERVAL_SECS", default_value = "21600")]
    pub defrag_interval_secs: u64,

    /// Attempts to delete a disk that could not get a LUN
    #[arg(long, env = "ROLLBACK_ATTEMPTS", default_value = "3")]
    pub rollback_attempts: u32,
}

impl ProvisionerConfig {
    /// Check every setting and report all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for (name, value) in [
            ("identifier", &self.identifier),
            ("provisioner name", &self.provisioner_name),
            ("SAN address", &self.san_address),
            ("SAN group name", &self.san_group_name),
        ] {
            if value.trim().is_empty() {
                problems.push(format!("{} is empty", name));
            }
        }

        if self.smcli_command.as_os_str().is_empty() {
            problems.push("SMcli command is empty".to_string());
        } else if let Err(problem) = check_executable(&self.smcli_command) {
            problems.push(problem);
        }

        if self.command_timeout_secs == 0 {
            problems.push("command timeout must be greater than zero".to_string());
        }
        if self.rollback_attempts == 0 {
            problems.push("rollback attempts must be greater than zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(problems.join("; ")))
        }
    }

    /// Connection settings handed to the SAN client
    pub fn san_connection(&self) -> SanConnection {
        let connection = SanConnection::new(
            self.san_address.clone(),
            self.san_group_name.clone(),
            self.smcli_command.clone(),
        )
        .with_password(self.san_password.clone());

        match &self.san_host_group {
            Some(host_group) => connection.with_host_group(host_group.clone()),
            None => connection,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Interval of the defrag scheduler, `None` when disabled
    pub fn defrag_interval(&self) -> Option<Duration> {
        (self.defrag_interval_secs > 0).then(|| Duration::from_secs(self.defrag_interval_secs))
    }

    pub fn rollback_policy(&self) -> RollbackPolicy {
        RollbackPolicy {
            attempts: self.rollback_attempts,
            ..Default::default()
        }
    }
}

fn check_executable(path: &Path) -> std::result::Result<(), String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| format!("SMcli command {} is not accessible: {}", path.display(), e))?;
    if !metadata.is_file() {
        return Err(format!("SMcli command {} is not a file", path.display()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(format!("SMcli command {} is not executable", path.display()));
        }
    }

    Ok(())
}
