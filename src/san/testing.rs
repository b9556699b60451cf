//! In-memory SMcli stand-ins for tests

use crate::domain::ports::{CommandExecutor, CommandOutput};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

pub(crate) const ALREADY_USED: &str = "Error 44 - The name you have provided cannot be used. \
    The most likely cause is that the name is already used by another virtual disk. \
    Please provide another name.";

pub(crate) const NOT_FOUND: &str = "Error 4 - The operation cannot complete. \
    Probable cause = incorrect virtual disk name entered.";

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Text between `marker` and the next double quote
fn quoted_after(statement: &str, marker: &str) -> Option<String> {
    let start = statement.find(marker)? + marker.len();
    let rest = &statement[start..];
    rest.find('"').map(|end| rest[..end].to_string())
}

/// Simulated array: keeps virtual disks and their LUNs, answers statements
/// the way SMcli does, and records every statement it receives.
#[derive(Default)]
pub(crate) struct FakeArray {
    disks: Mutex<BTreeMap<String, Option<u16>>>,
    statements: Mutex<Vec<String>>,
    args: Mutex<Vec<Vec<String>>>,
    injected: Mutex<VecDeque<(String, CommandOutput)>>,
}

impl FakeArray {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a disk that is already mapped to `lun`
    pub(crate) fn with_disk(self, label: &str, lun: Option<u16>) -> Self {
        self.disks.lock().unwrap().insert(label.to_string(), lun);
        self
    }

    /// Occupy every given LUN with a filler disk
    pub(crate) fn with_luns(self, luns: impl IntoIterator<Item = u16>) -> Self {
        {
            let mut disks = self.disks.lock().unwrap();
            for lun in luns {
                disks.insert(format!("filler-{:03}", lun), Some(lun));
            }
        }
        self
    }

    /// Answer the next statement starting with `prefix` with `output`
    pub(crate) fn fail_next(&self, prefix: &str, output: CommandOutput) {
        self.injected
            .lock()
            .unwrap()
            .push_back((prefix.to_string(), output));
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub(crate) fn args(&self) -> Vec<Vec<String>> {
        self.args.lock().unwrap().clone()
    }

    pub(crate) fn lun_of(&self, label: &str) -> Option<u16> {
        self.disks.lock().unwrap().get(label).copied().flatten()
    }

    pub(crate) fn has_disk(&self, label: &str) -> bool {
        self.disks.lock().unwrap().contains_key(label)
    }

    fn take_injected(&self, statement: &str) -> Option<CommandOutput> {
        let mut injected = self.injected.lock().unwrap();
        let pos = injected.iter().position(|(prefix, _)| statement.starts_with(prefix))?;
        injected.remove(pos).map(|(_, output)| output)
    }

    fn render_mappings(&self) -> String {
        let disks = self.disks.lock().unwrap();
        let mut report = String::from(
            "Executing script...\n\n   Virtual Disk Name               LUN  RAID Controller Module  Accessible by   Virtual Disk status\n",
        );
        report.push_str("   Access Virtual Disk             31   0,1                     Host Group k8s  Optimal\n");
        for (label, lun) in disks.iter() {
            if let Some(lun) = lun {
                report.push_str(&format!(
                    "   {:<30}  {:<4} 0                       Host Group k8s  Optimal\n",
                    label, lun
                ));
            }
        }
        report.push_str("\nScript execution complete.\n");
        report
    }

    fn answer(&self, statement: &str) -> CommandOutput {
        if let Some(output) = self.take_injected(statement) {
            return output;
        }

        if statement.starts_with("create virtualDisk") {
            let label = quoted_after(statement, "userLabel=\"").unwrap_or_default();
            let mut disks = self.disks.lock().unwrap();
            if disks.contains_key(&label) {
                return failed(44, ALREADY_USED);
            }
            disks.insert(label, None);
            ok("Script execution complete.")
        } else if statement.starts_with("set virtualDisk") {
            let label = quoted_after(statement, "[\"").unwrap_or_default();
            let lun = statement
                .split("logicalUnitNumber=")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|lun| lun.parse::<u16>().ok());
            let mut disks = self.disks.lock().unwrap();
            match disks.get_mut(&label) {
                Some(slot) => {
                    *slot = lun;
                    ok("Script execution complete.")
                }
                None => failed(4, NOT_FOUND),
            }
        } else if statement.starts_with("delete virtualdisk") {
            let label = quoted_after(statement, "[\"").unwrap_or_default();
            match self.disks.lock().unwrap().remove(&label) {
                Some(_) => ok("Script execution complete."),
                None => failed(4, NOT_FOUND),
            }
        } else if statement.starts_with("show storageArray lunMappings") {
            ok(&self.render_mappings())
        } else if statement.starts_with("start diskGroup") {
            ok("Script execution complete.")
        } else {
            failed(2, "Syntax error")
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeArray {
    async fn run(&self, _program: &Path, args: &[String]) -> Result<CommandOutput> {
        let statement = args
            .last()
            .map(|s| s.trim_end_matches(';').to_string())
            .unwrap_or_default();

        self.args.lock().unwrap().push(args.to_vec());
        self.statements.lock().unwrap().push(statement.clone());

        // Let concurrent callers interleave between statements
        tokio::task::yield_now().await;

        Ok(self.answer(&statement))
    }
}
