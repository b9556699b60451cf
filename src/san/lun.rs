//! LUN Allocation
//!
//! Parses the `show storageArray lunMappings` report and picks the lowest
//! LUN that no virtual disk in the host group uses.
//!
//! Report rows of interest look like this (three leading spaces, a
//! 30-character disk name column, two spaces, the LUN):
//!
//! ```text
//!    Virtual Disk Name               LUN  RAID Controller Module  Accessible by   ...
//!    Access Virtual Disk             31   0,1                     Host Group k8s  ...
//!    pvc-9e22c1f7-0beb-11e8-b445-18  0    0                       Host Group k8s  ...
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// LUNs a host group can expose
pub const LUN_RANGE: RangeInclusive<u8> = 0..=254;

/// LUN held by the array's access virtual disk
pub const RESERVED_LUN: u8 = 31;

/// Name column is matched by width only; labels may hold any character
static MAPPING_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^ {3}(.{30}) {2}([0-9]{1,3})(?:\s|$)")
        .expect("mapping row pattern is valid")
});

// =============================================================================
// LUN Table
// =============================================================================

/// LUN → disk names, as reported by the array at query time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LunTable {
    mappings: BTreeMap<u16, BTreeSet<String>>,
}

impl LunTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a lunMappings report. Rows that do not have the mapping shape
    /// are ignored.
    pub fn parse(report: &str) -> Self {
        let mut table = Self::new();
        for caps in MAPPING_ROW.captures_iter(report) {
            // At most three digits, always fits
            if let Ok(lun) = caps[2].parse::<u16>() {
                table.insert(lun, caps[1].trim_end());
            }
        }
        table
    }

    /// Record a disk mapped to `lun`
    pub fn insert(&mut self, lun: u16, disk: &str) {
        self.mappings.entry(lun).or_default().insert(disk.to_string());
    }

    /// LUNs in use, each listed once
    pub fn occupied(&self) -> impl Iterator<Item = u16> + '_ {
        self.mappings.keys().copied()
    }

    /// Disks mapped to `lun`
    pub fn disks(&self, lun: u16) -> impl Iterator<Item = &str> {
        self.mappings
            .get(&lun)
            .into_iter()
            .flat_map(|disks| disks.iter().map(String::as_str))
    }

    /// LUN of the given disk, if mapped
    pub fn lun_of(&self, disk: &str) -> Option<u16> {
        self.mappings
            .iter()
            .find(|(_, disks)| disks.contains(disk))
            .map(|(lun, _)| *lun)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// Every LUN of the host group is in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all LUNs in 0..=254 are in use")]
pub struct LunExhausted;

/// Lowest LUN in [`LUN_RANGE`] that is neither mapped nor [`RESERVED_LUN`]
pub fn next_available_lun(table: &LunTable) -> Result<u8, LunExhausted> {
    let occupied: BTreeSet<u16> = table
        .occupied()
        .chain(std::iter::once(u16::from(RESERVED_LUN)))
        .collect();

    LUN_RANGE
        .into_iter()
        .find(|lun| !occupied.contains(&u16::from(*lun)))
        .ok_or(LunExhausted)
}
