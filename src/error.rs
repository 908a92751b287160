//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The translation cache pool is exhausted and no translation block could be evicted.
    #[error("out of translation cache memory")]
    OutOfTranslationCache,
    /// The swap pool is exhausted and no shadow page could be evicted.
    #[error("out of swap pages")]
    OutOfSwapPages,
    /// The guest physical address lies outside the configured RAM.
    #[error("invalid guest physical address {0:#x}")]
    InvalidGuestAddress(u32),
    /// The instruction bytes at the given guest address could not be decoded.
    #[error("undecodable instruction at {0:#x}")]
    UndecodableInstruction(u32),
    /// The emitted translation overflowed the per-block code buffer.
    #[error("translation buffer overflow")]
    TranslationOverflow,
    /// A record or replay log was expected but none is attached.
    #[error("no record/replay log attached")]
    NoLog,
    /// The replay log produced a record that does not match guest execution.
    #[error("replay divergence: {0}")]
    ReplayDivergence(&'static str),
    /// The replay log ended in the middle of a record.
    #[error("truncated replay log")]
    TruncatedLog,
    /// A guest-architectural exception bubbling up to the dispatcher, which resolves it by
    /// entering the guest's handler.
    #[error("guest exception {0:?}")]
    Guest(GuestExc),
    /// The host architecture cannot enter translated code (guest ISA must equal host ISA).
    #[error("host cannot execute translated guest code")]
    UnsupportedHost,
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps [`mmap_rs::Error`].
    #[error(transparent)]
    Mmap(#[from] mmap_rs::Error),
}

/// A guest-architectural exception to be reflected into the guest. Helper code deep in
/// segment loads and page walks raises it through [`Error::Guest`]; the dispatcher catches
/// that variant and resolves it by entering the guest's IDT handler; it never propagates to
/// the embedder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GuestExc {
    /// The exception vector.
    pub vector: u8,
    /// The error code pushed on the guest stack, or `None` for exceptions without one.
    pub error_code: Option<u32>,
    /// The faulting linear address for page faults.
    pub cr2: Option<u32>,
}

impl From<GuestExc> for Error {
    fn from(exc: GuestExc) -> Self {
        Error::Guest(exc)
    }
}

impl GuestExc {
    /// A general-protection fault with the given error code.
    pub fn gp(error_code: u32) -> Self {
        Self {
            vector: crate::arch::x86::EXCP_GP,
            error_code: Some(error_code),
            cr2: None,
        }
    }

    /// A page fault at the given linear address.
    pub fn pf(error_code: u32, cr2: u32) -> Self {
        Self {
            vector: crate::arch::x86::EXCP_PF,
            error_code: Some(error_code),
            cr2: Some(cr2),
        }
    }

    /// A segment-not-present fault for the given selector.
    pub fn np(selector: u32) -> Self {
        Self {
            vector: crate::arch::x86::EXCP_NP,
            error_code: Some(selector & 0xfffc),
            cr2: None,
        }
    }

    /// A stack fault for the given selector.
    pub fn ss(selector: u32) -> Self {
        Self {
            vector: crate::arch::x86::EXCP_SS,
            error_code: Some(selector & 0xfffc),
            cr2: None,
        }
    }

    /// An invalid-opcode fault.
    pub fn ud() -> Self {
        Self {
            vector: crate::arch::x86::EXCP_UD,
            error_code: None,
            cr2: None,
        }
    }
}
