//! Vendor Error Classifier
//!
//! SMcli reports failures on stdout with a non-zero exit code. A few of those
//! failures are business errors that mean the requested state already holds;
//! this module recognizes them from a fixed table of message fragments.
//!
//! The fragments are tied to the wording of the SMcli release in use and are
//! not localized; a tool upgrade can change them.

use super::statement::StatementKind;
use crate::domain::ports::CommandOutput;
use tracing::debug;

// =============================================================================
// Known Vendor Errors
// =============================================================================

/// Business errors that are treated as success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorErrorKind {
    /// Create failed because a virtual disk with that label exists
    DiskAlreadyExists,
    /// Delete failed because no virtual disk has that label
    DiskNotFound,
}

/// One row of the classification table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorErrorPattern {
    /// Statement the pattern applies to
    pub statement: StatementKind,
    /// Fragment searched for in the tool output
    pub fragment: String,
    pub kind: VendorErrorKind,
}

impl VendorErrorPattern {
    pub fn new(statement: StatementKind, fragment: impl Into<String>, kind: VendorErrorKind) -> Self {
        Self {
            statement,
            fragment: fragment.into(),
            kind,
        }
    }
}

/// Message fragments of the business errors SMcli reports.
///
/// | Statement | Fragment | Meaning |
/// |---|---|---|
/// | create disk | `already used by another virtual disk` | Error 44, label in use |
/// | delete disk | `incorrect virtual disk name entered` | no disk with that label |
pub const KNOWN_VENDOR_ERRORS: &[(StatementKind, &str, VendorErrorKind)] = &[
    (
        StatementKind::CreateDisk,
        "already used by another virtual disk",
        VendorErrorKind::DiskAlreadyExists,
    ),
    (
        StatementKind::DeleteDisk,
        "incorrect virtual disk name entered",
        VendorErrorKind::DiskNotFound,
    ),
];

// =============================================================================
// Classification Result
// =============================================================================

/// Outcome of one SMcli run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exit code 0
    Success,
    /// Non-zero exit with a recognized business error
    Recognized(VendorErrorKind),
    /// Any other non-zero exit, with the tool's message
    Failed { exit_code: i32, message: String },
}

// =============================================================================
// Classifier
// =============================================================================

/// Table-driven classifier for SMcli results
#[derive(Debug, Clone)]
pub struct VendorErrorClassifier {
    patterns: Vec<VendorErrorPattern>,
}

impl VendorErrorClassifier {
    /// Create a classifier with the known SMcli patterns
    pub fn new() -> Self {
        Self::with_patterns(
            KNOWN_VENDOR_ERRORS
                .iter()
                .map(|(statement, fragment, kind)| VendorErrorPattern::new(*statement, *fragment, *kind))
                .collect(),
        )
    }

    /// Create a classifier with a custom table
    pub fn with_patterns(patterns: Vec<VendorErrorPattern>) -> Self {
        Self { patterns }
    }

    /// Add a pattern on top of the current table
    pub fn add_pattern(&mut self, pattern: VendorErrorPattern) {
        self.patterns.push(pattern);
    }

    pub fn patterns(&self) -> &[VendorErrorPattern] {
        &self.patterns
    }

    /// Classify the result of a statement of the given kind
    pub fn classify(&self, statement: StatementKind, output: &CommandOutput) -> CommandOutcome {
        if output.success() {
            return CommandOutcome::Success;
        }

        let matched = self
            .patterns
            .iter()
            .filter(|p| p.statement == statement)
            .find(|p| output.stdout.contains(&p.fragment) || output.stderr.contains(&p.fragment));

        if let Some(pattern) = matched {
            debug!(%statement, kind = ?pattern.kind, "Recognized vendor business error");
            return CommandOutcome::Recognized(pattern.kind);
        }

        CommandOutcome::Failed {
            exit_code: output.exit_code,
            message: failure_message(output),
        }
    }
}

impl Default for VendorErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// SMcli prints its errors on stdout; stderr is only a fallback
fn failure_message(output: &CommandOutput) -> String {
    let stdout = output.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    format!("exit code {} without output", output.exit_code)
}
