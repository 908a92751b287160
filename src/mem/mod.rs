//! This module provides the guest memory system: physical RAM, the guest page-table walker,
//! the shadow-paging engine with its swap pool, the memory-trace engine, and the faulting
//! instruction simulator.

pub mod mtrace;
pub mod paging;
pub mod phys;
pub mod shadow;
pub mod simulate;

pub use mtrace::{MtraceClient, MtraceEngine, MtraceHandle};
pub use paging::{access_flags, pt_walk, PtwalkFlags, WalkError, WalkResult};
pub use phys::GuestRam;
pub use shadow::{SwapHandle, SwapPageType, SwapPool};
