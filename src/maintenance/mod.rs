//! Background maintenance of the storage group

pub mod defrag;

pub use defrag::{DefragOutcome, DefragReport, DefragScheduler, DEFAULT_DEFRAG_INTERVAL};
