//! This module provides deterministic record/replay: the on-disk log of non-deterministic
//! events, replay-side consumption with divergence detection, the micro-replay rollback
//! controller, and the interrupt-eip blacklist.

pub mod blacklist;
pub mod log;
pub mod micro;
pub mod replay;

pub use blacklist::Blacklist;
pub use log::{LogTag, RrLog, RECORD_FRAME};
pub use micro::{MicroReplay, RollbackMode};
pub use replay::{RrMode, RrState, RunOutcome};
