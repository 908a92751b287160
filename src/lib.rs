//! The vmon crate implements a whole-system virtual machine monitor for 32-bit x86 guests
//! based on dynamic binary translation: guest basic blocks are rewritten into a translation
//! cache through a peephole table, privileged operations re-enter the monitor through
//! callouts, guest paging is virtualized with shadow page tables, and every source of
//! non-determinism can be recorded to a log and replayed deterministically, including
//! micro-replay, a bounded rollback mode that localizes non-deterministic failures by
//! re-running short intervals with interrupt injection suppressed at blacklisted addresses.
//!
//! The entry point is [`Monitor`], built through [`MonitorBuilder`]; [`exec::dispatch::run`]
//! drives the guest.

pub mod arch;
pub mod config;
pub mod error;
pub mod exec;
pub mod insn;
pub mod mem;
pub mod monitor;
pub mod peep;
pub mod pic;
pub mod rr;
pub mod tb;
pub mod vcpu;

pub use config::{MonitorBuilder, MonitorConfig};
pub use error::{Error, GuestExc};
pub use monitor::{Monitor, PortDevice};
pub use rr::replay::RunOutcome;
pub use vcpu::{ExitReason, Vcpu};
