//! SMcli Script Statements
//!
//! Builds the script statements passed to SMcli with `-c` and the argument
//! vector around them. Capacities use the array's `Bytes` suffix.

use crate::domain::ports::DiskLabel;

/// Placeholder used instead of the password when logging argv
const REDACTED: &str = "******";

/// Category of a statement, used to classify vendor errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    CreateDisk,
    BindLun,
    DeleteDisk,
    ShowLunMappings,
    Defragment,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::CreateDisk => "create_disk",
            StatementKind::BindLun => "bind_lun",
            StatementKind::DeleteDisk => "delete_disk",
            StatementKind::ShowLunMappings => "show_lun_mappings",
            StatementKind::Defragment => "defragment",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One SMcli script statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement<'a> {
    CreateDisk {
        disk_group: &'a str,
        disk: &'a DiskLabel,
        capacity_bytes: u64,
    },
    BindLun {
        disk: &'a DiskLabel,
        lun: u8,
        host_group: &'a str,
    },
    DeleteDisk {
        disk: &'a DiskLabel,
    },
    ShowLunMappings {
        host_group: &'a str,
    },
    Defragment {
        disk_group: &'a str,
    },
}

impl Statement<'_> {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::CreateDisk { .. } => StatementKind::CreateDisk,
            Statement::BindLun { .. } => StatementKind::BindLun,
            Statement::DeleteDisk { .. } => StatementKind::DeleteDisk,
            Statement::ShowLunMappings { .. } => StatementKind::ShowLunMappings,
            Statement::Defragment { .. } => StatementKind::Defragment,
        }
    }
}

impl std::fmt::Display for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Statement::CreateDisk {
                disk_group,
                disk,
                capacity_bytes,
            } => write!(
                f,
                "create virtualDisk diskGroup=\"{}\" userLabel=\"{}\" capacity={}Bytes",
                disk_group, disk, capacity_bytes
            ),
            Statement::BindLun {
                disk,
                lun,
                host_group,
            } => write!(
                f,
                "set virtualDisk [\"{}\"] logicalUnitNumber={} hostGroup=\"{}\"",
                disk, lun, host_group
            ),
            Statement::DeleteDisk { disk } => write!(f, "delete virtualdisk [\"{}\"]", disk),
            Statement::ShowLunMappings { host_group } => write!(
                f,
                "show storageArray lunMappings hostGroup [\"{}\"]",
                host_group
            ),
            Statement::Defragment { disk_group } => {
                write!(f, "start diskGroup [\"{}\"] defragment", disk_group)
            }
        }
    }
}

/// Build the SMcli argument vector for one statement:
/// `<address> [-p <password>] -c "<statement>;"`
pub fn smcli_args(address: &str, password: Option<&str>, statement: &Statement<'_>) -> Vec<String> {
    let mut args = vec![address.to_string()];
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        args.push("-p".to_string());
        args.push(password.to_string());
    }
    args.push("-c".to_string());
    args.push(format!("{};", statement));
    args
}

/// Render argv for logging with the password masked
pub fn redacted_args(args: &[String]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            out.push(REDACTED.to_string());
            mask_next = false;
            continue;
        }
        mask_next = arg == "-p";
        out.push(arg.clone());
    }
    out.join(" ")
}
