//! This module provides code specific to the x86 architecture as seen by a 32-bit guest:
//! register files, segmentation, paging entries and the exception model.

use bitflags::bitflags;
use num_derive::FromPrimitive;

/// Represents the general-purpose registers of the x86 architecture, in the encoding order used
/// by instruction operands and by the guest register file (`a`, `c`, `d`, `b`, `sp`, `bp`, `si`,
/// `di`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Register {
    /// The accumulator register.
    Eax,
    /// The counter register.
    Ecx,
    /// The data register.
    Edx,
    /// The base register.
    Ebx,
    /// The stack pointer register.
    Esp,
    /// The base pointer register.
    Ebp,
    /// The source index register.
    Esi,
    /// The destination index register.
    Edi,
}

/// The number of general-purpose registers.
pub const NUM_REGS: usize = 8;

pub const R_EAX: usize = 0;
pub const R_ECX: usize = 1;
pub const R_EDX: usize = 2;
pub const R_EBX: usize = 3;
pub const R_ESP: usize = 4;
pub const R_EBP: usize = 5;
pub const R_ESI: usize = 6;
pub const R_EDI: usize = 7;

/// Represents the segment registers of the x86 architecture, in operand encoding order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum SegmentRegister {
    /// The ES segment register.
    Es,
    /// The code segment register.
    Cs,
    /// The stack segment register.
    Ss,
    /// The data segment register.
    Ds,
    /// The FS segment register.
    Fs,
    /// The GS segment register.
    Gs,
}

/// The number of segment registers.
pub const NUM_SEGS: usize = 6;

pub const R_ES: usize = 0;
pub const R_CS: usize = 1;
pub const R_SS: usize = 2;
pub const R_DS: usize = 3;
pub const R_FS: usize = 4;
pub const R_GS: usize = 5;

bitflags! {
    /// The EFLAGS register.
    pub struct Eflags: u32 {
        /// Carry flag.
        const CF   = 1 << 0;
        /// Reserved, must be set.
        const MBS  = 1 << 1;
        /// Parity flag.
        const PF   = 1 << 2;
        /// Auxiliary carry flag.
        const AF   = 1 << 4;
        /// Zero flag.
        const ZF   = 1 << 6;
        /// Sign flag.
        const SF   = 1 << 7;
        /// Trap flag.
        const TF   = 1 << 8;
        /// Interrupt enable flag.
        const IF   = 1 << 9;
        /// Direction flag.
        const DF   = 1 << 10;
        /// Overflow flag.
        const OF   = 1 << 11;
        /// I/O privilege level.
        const IOPL = 3 << 12;
        /// Nested task flag.
        const NT   = 1 << 14;
        /// Resume flag.
        const RF   = 1 << 16;
        /// Virtual 8086 mode flag.
        const VM   = 1 << 17;
        /// Alignment check flag.
        const AC   = 1 << 18;
    }
}

/// Protected Mode Enable.
pub const CR0_PE: u32 = 1 << 0;
/// Monitor Co-Processor.
pub const CR0_MP: u32 = 1 << 1;
/// Emulation.
pub const CR0_EM: u32 = 1 << 2;
/// Task Switched.
pub const CR0_TS: u32 = 1 << 3;
/// Extension Type.
pub const CR0_ET: u32 = 1 << 4;
/// Write Protect.
pub const CR0_WP: u32 = 1 << 16;
/// Paging.
pub const CR0_PG: u32 = 1 << 31;

/// The number of control registers kept in the virtual CPU.
pub const NUM_CRS: usize = 5;

/// The value stored in CR3 while the guest has not yet loaded a page directory.
pub const CR3_INVALID: u32 = 0xffff_ffff;

bitflags! {
    /// The flag bits of a 32-bit page-directory or page-table entry.
    pub struct PteFlags: u32 {
        /// The entry is present.
        const P   = 1 << 0;
        /// The mapping is writable.
        const W   = 1 << 1;
        /// The mapping is accessible from user mode.
        const U   = 1 << 2;
        /// Write-through caching.
        const PWT = 1 << 3;
        /// Caching disabled.
        const PCD = 1 << 4;
        /// The entry has been used for a translation.
        const A   = 1 << 5;
        /// The page has been written to.
        const D   = 1 << 6;
        /// The entry maps a 4 MiB page (page-directory entries only).
        const PS  = 1 << 7;
        /// The mapping is global.
        const G   = 1 << 8;
    }
}

/// The mask selecting the frame address of a page-table entry.
pub const PTE_ADDR_MASK: u32 = 0xffff_f000;

/// The page size of the 32-bit x86 architecture.
pub const PAGE_SIZE: u32 = 4096;
/// The mask selecting the offset within a page.
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;
/// The number of bits covered by a page-directory entry (4 MiB).
pub const LPAGE_SHIFT: u32 = 22;

/// Returns the page that `addr` lies on.
#[inline]
pub fn page_of(addr: u32) -> u32 {
    addr & !PAGE_MASK
}

/// Exception vectors raised by the guest or reflected into it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    FpuError = 16,
    AlignmentCheck = 17,
}

pub const EXCP_GP: u8 = 13;
pub const EXCP_PF: u8 = 14;
pub const EXCP_NP: u8 = 11;
pub const EXCP_SS: u8 = 12;
pub const EXCP_UD: u8 = 6;

/// Page-fault error code: the fault was caused by a protection violation rather than a
/// non-present page.
pub const PF_ERR_P: u32 = 1 << 0;
/// Page-fault error code: the access was a write.
pub const PF_ERR_W: u32 = 1 << 1;
/// Page-fault error code: the access originated from user mode.
pub const PF_ERR_U: u32 = 1 << 2;

/// Represents a segment-cache entry: the hidden portion of a segment register plus the selector
/// that loaded it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    /// The visible segment selector.
    pub selector: u32,
    /// The base address of the segment.
    pub base: u32,
    /// The limit of the segment, in bytes.
    pub limit: u32,
    /// The raw access flags from the second descriptor word.
    pub flags: u32,
}

impl Segment {
    /// Builds the segment cache entry a real-mode selector load produces.
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector: selector as u32,
            base: (selector as u32) << 4,
            limit: 0xffff,
            flags: 0,
        }
    }
}

/// Represents a descriptor-table pseudo register (GDTR or IDTR).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DescriptorTable {
    /// The linear base address of the table.
    pub base: u32,
    /// The limit of the table, in bytes.
    pub limit: u32,
}

/// Descriptor word 2: default operation size (32-bit segment).
pub const DESC_B_MASK: u32 = 1 << 22;
/// Descriptor word 2: granularity (limit in 4 kiB units).
pub const DESC_G_MASK: u32 = 1 << 23;
/// Descriptor word 2: present.
pub const DESC_P_MASK: u32 = 1 << 15;
/// Descriptor word 2: non-system segment.
pub const DESC_S_MASK: u32 = 1 << 12;
/// Descriptor word 2: code segment (with [`DESC_S_MASK`]).
pub const DESC_CS_MASK: u32 = 1 << 11;
/// Descriptor word 2: conforming code segment.
pub const DESC_C_MASK: u32 = 1 << 10;
/// Descriptor word 2: writable data / readable code.
pub const DESC_W_MASK: u32 = 1 << 9;
pub const DESC_R_MASK: u32 = 1 << 9;
/// Descriptor word 2: accessed.
pub const DESC_A_MASK: u32 = 1 << 8;

/// Extracts the segment base from a decoded descriptor pair.
#[inline]
pub fn seg_base(e1: u32, e2: u32) -> u32 {
    (e1 >> 16) | ((e2 & 0xff) << 16) | (e2 & 0xff00_0000)
}

/// Extracts the byte-granular segment limit from a decoded descriptor pair.
#[inline]
pub fn seg_limit(e1: u32, e2: u32) -> u32 {
    let limit = (e1 & 0xffff) | (e2 & 0x000f_0000);
    if e2 & DESC_G_MASK != 0 {
        (limit << 12) | 0xfff
    } else {
        limit
    }
}

/// Extracts the descriptor privilege level.
#[inline]
pub fn seg_dpl(e2: u32) -> u32 {
    (e2 >> 13) & 3
}

/// The stack-pointer mask implied by a stack-segment descriptor: 32-bit segments use the full
/// esp, 16-bit segments wrap at 64 kiB.
#[inline]
pub fn sp_mask(e2: u32) -> u32 {
    if e2 & DESC_B_MASK != 0 {
        0xffff_ffff
    } else {
        0xffff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_base_and_limit() {
        // Flat 4 GiB data segment: base 0, limit 0xfffff pages, granular.
        let e1 = 0x0000_ffff;
        let e2 = 0x00cf_9300;
        assert_eq!(seg_base(e1, e2), 0);
        assert_eq!(seg_limit(e1, e2), 0xffff_ffff);
        assert_eq!(seg_dpl(e2), 0);
        assert_eq!(sp_mask(e2), 0xffff_ffff);
    }

    #[test]
    fn descriptor_byte_granular() {
        // base 0x0010_0000, limit 0xffff bytes, 16-bit.
        let e1 = 0x0000_ffff | (0x0000 << 16);
        let e2 = 0x0000_9300 | 0x10;
        assert_eq!(seg_base(e1, e2), 0x0010_0000);
        assert_eq!(seg_limit(e1, e2), 0xffff);
        assert_eq!(sp_mask(e2), 0xffff);
    }

    #[test]
    fn real_mode_segment_cache() {
        let seg = Segment::real_mode(0x7c0);
        assert_eq!(seg.base, 0x7c00);
        assert_eq!(seg.limit, 0xffff);
    }
}
