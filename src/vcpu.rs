//! This module provides the [`Vcpu`] struct which holds the architectural and
//! translation-private state of the single guest virtual CPU.

use crate::arch::x86::{
    DescriptorTable, Eflags, Segment, CR0_PE, CR3_INVALID, DESC_B_MASK, NUM_CRS, NUM_REGS,
    NUM_SEGS, R_CS,
};
use crate::exec::callout::Callout;

/// The number of temporary-register spill slots reachable from translated code.
pub const MAX_TEMPORARIES: usize = 8;

/// The reason translated code handed control back to the monitor. This replaces the original
/// `longjmp` unwind: the driver loop dispatches on the variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// A host interrupt arrived while the guest was running; the vector is the guest-visible one.
    Interrupt(u8),
    /// Translated code hit an `int FORCED_CALLOUT` patch.
    ForcedCallout,
    /// The record/replay layer asked for a micro-replay rollback.
    MicroReplayTrigger,
    /// The block ran to completion (callout or natural terminator).
    Normal,
}

/// A pending guest exception, set by the fault path before the driver loop re-enters
/// `do_interrupt`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PendingException {
    pub vector: i32,
    pub error_code: i32,
    pub is_int_insn: bool,
    pub next_eip: u32,
    pub cr2: u32,
}

/// The guest virtual CPU.
///
/// All DBT-private fields (`n_exec`, scratch slots, callout scratch) live here too, because
/// translated code addresses them with fixed displacements into this one struct.
#[derive(Clone)]
pub struct Vcpu {
    /// The instruction pointer, CS-relative.
    pub eip: u32,
    /// The eip of the translation currently executing; differs from `eip` while a callout runs.
    pub eip_executing: u32,
    /// The general registers in operand-encoding order (a, c, d, b, sp, bp, si, di).
    pub regs: [u32; NUM_REGS],
    /// The EFLAGS register, excluding IF which is virtualized separately.
    pub eflags: u32,

    /// The segment caches (es, cs, ss, ds, fs, gs).
    pub segs: [Segment; NUM_SEGS],
    /// The last raw selector loaded into each segment register. Used when the cached selector
    /// has been redirected to a monitor selector.
    pub orig_segs: [u32; NUM_SEGS],
    /// The local descriptor table cache.
    pub ldt: Segment,
    /// The task register cache.
    pub tr: Segment,
    /// The global descriptor table pseudo register.
    pub gdt: DescriptorTable,
    /// The interrupt descriptor table pseudo register.
    pub idt: DescriptorTable,
    /// The control registers. CR3 may hold [`CR3_INVALID`].
    pub cr: [u32; NUM_CRS],

    /// The virtualized interrupt flag: 0 = off, 1 = on, 2 = enable after the next instruction
    /// (the sti shadow).
    pub intr_flag: u16,
    /// The virtualized I/O privilege level.
    pub iopl: u16,
    /// The virtualized alignment-check flag.
    pub ac: u16,
    /// The A20 gate mask composed into every guest physical address.
    pub a20_mask: u32,
    /// Set while the guest sits in `hlt`.
    pub halted: bool,

    /// The FPU/SSE save area (`fxsave` layout).
    pub fxstate: [u8; 512],

    /// Swap-pool handles of the two shadow page directories: index 0 is the supervisor view,
    /// index 1 the user view.
    pub shadow_page_dir: [Option<crate::mem::shadow::SwapHandle>; 2],
    /// The mtrace generation the installed shadow directories were last synced against.
    pub cur_mtraces_version: u64,

    /// Direct jump chaining: the translation-cache offset of the block that just exited, and
    /// which of its edges was taken (0, 1, or [`EDGE_NONE`]).
    pub prev_tb_tc: u32,
    pub edge: u32,

    /// The dynamic guest instruction count; the logical clock of record/replay.
    pub n_exec: u64,
    /// Spill slots for the temporary host registers a peephole rule allocates.
    pub temporaries: [u32; MAX_TEMPORARIES],
    /// Scratch slots used by rewritten memory operands.
    pub scratch: [u32; 8],
    /// Target of an indirect jump, kept apart from `scratch` so interrupt handling cannot
    /// clobber it.
    pub jtarget: u32,
    /// Replay only: the `n_exec` of the last consumed log entry.
    pub replay_last_entry_n_exec: u64,

    /// The pending callout requested by translated code, with its arguments.
    pub callout: Option<Callout>,
    pub callout_n_args: u32,
    pub callout_args: [u32; 8],
    /// The translation-cache offset the current block was entered at, for rollback lookup.
    pub callout_cur: Option<u32>,
    /// The translation-cache offset execution resumes at after the callout, if any.
    pub callout_next: Option<u32>,
    /// Set by callout glue once the next guest eip has been stored into `eip`.
    pub next_eip_is_set: bool,

    /// Hardware-interrupt request bits ([`CPU_INTERRUPT_HARD`]).
    pub interrupt_request: u32,

    /// The pending exception for the fault path.
    pub exception: PendingException,
}

/// Hardware interrupt request bit.
pub const CPU_INTERRUPT_HARD: u32 = 0x02;

/// The `edge` value meaning "no chainable edge was taken".
pub const EDGE_NONE: u32 = 2;

impl Default for Vcpu {
    fn default() -> Self {
        Self {
            eip: 0,
            eip_executing: 0,
            regs: [0; NUM_REGS],
            eflags: 0,
            segs: [Segment::default(); NUM_SEGS],
            orig_segs: [0; NUM_SEGS],
            ldt: Segment::default(),
            tr: Segment::default(),
            gdt: DescriptorTable::default(),
            idt: DescriptorTable::default(),
            cr: [0; NUM_CRS],
            intr_flag: 0,
            iopl: 0,
            ac: 0,
            a20_mask: 0xffff_ffff,
            halted: false,
            fxstate: [0; 512],
            shadow_page_dir: [None, None],
            cur_mtraces_version: 0,
            prev_tb_tc: 0,
            edge: EDGE_NONE,
            n_exec: 0,
            temporaries: [0; MAX_TEMPORARIES],
            scratch: [0; 8],
            jtarget: 0,
            replay_last_entry_n_exec: 0,
            callout: None,
            callout_n_args: 0,
            callout_args: [0; 8],
            callout_cur: None,
            callout_next: None,
            next_eip_is_set: false,
            interrupt_request: 0,
            exception: PendingException::default(),
        }
    }
}

impl Vcpu {
    /// Resets the virtual CPU to the architectural power-on state the boot loader expects:
    /// real mode, executing the boot sector at `0:0x7c00`.
    pub fn reset(&mut self) {
        *self = Self::default();
        self.cr[0] = 0x6000_0010;
        self.cr[3] = CR3_INVALID;
        self.eip = 0x7c00;
        self.eflags = (Eflags::MBS | Eflags::IF | Eflags::IOPL).bits();
        self.idt = DescriptorTable {
            base: 0,
            limit: 0xffff,
        };
        for seg in self.segs.iter_mut() {
            *seg = Segment {
                selector: 0,
                base: 0,
                limit: 0xffff,
                flags: 0,
            };
        }
        self.ldt.limit = 0xffff;
        self.tr.limit = 0xffff;
    }

    /// The linear instruction address: CS base plus eip.
    pub fn eip_virt(&self) -> u32 {
        self.segs[R_CS].base.wrapping_add(self.eip)
    }

    /// Whether the guest runs in protected mode.
    pub fn protected_mode(&self) -> bool {
        self.cr[0] & CR0_PE != 0
    }

    /// The operand-size hint handed to the decoder: 4 for a 32-bit code segment, 2 otherwise.
    pub fn operand_size(&self) -> u8 {
        if self.segs[R_CS].flags & DESC_B_MASK != 0 {
            4
        } else {
            2
        }
    }

    /// The current guest privilege level (0..=3).
    pub fn privilege_level(&self) -> u32 {
        if !self.protected_mode() {
            0
        } else {
            self.segs[R_CS].selector & 3
        }
    }

    /// Whether the guest walks its own page tables, i.e. paging is on and CR3 has been loaded.
    pub fn using_cr3_page_table(&self) -> bool {
        self.protected_mode() && self.cr[3] != CR3_INVALID
    }

    /// Reloads the real-mode segment caches whose selectors were changed behind the cache, the
    /// way a real CPU recomputes base = selector << 4 on every load.
    pub fn segcache_sync(&mut self, seg: usize) {
        if !self.protected_mode() {
            self.segs[seg] = Segment::real_mode(self.segs[seg].selector as u16);
        }
    }
}

/// A full snapshot of the architectural CPU state, as serialized into `MS` records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcpuSnapshot {
    pub eip: u32,
    pub regs: [u32; NUM_REGS],
    pub eflags: u32,
    pub segs: [Segment; NUM_SEGS],
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr: [u32; NUM_CRS],
    pub intr_flag: u16,
    pub n_exec: u64,
}

impl VcpuSnapshot {
    /// Captures the architectural state of `vcpu`.
    pub fn capture(vcpu: &Vcpu) -> Self {
        Self {
            eip: vcpu.eip,
            regs: vcpu.regs,
            eflags: vcpu.eflags,
            segs: vcpu.segs,
            gdt: vcpu.gdt,
            idt: vcpu.idt,
            cr: vcpu.cr,
            intr_flag: vcpu.intr_flag,
            n_exec: vcpu.n_exec,
        }
    }

    /// Restores the architectural state into `vcpu`.
    pub fn restore(&self, vcpu: &mut Vcpu) {
        vcpu.eip = self.eip;
        vcpu.regs = self.regs;
        vcpu.eflags = self.eflags;
        vcpu.segs = self.segs;
        vcpu.gdt = self.gdt;
        vcpu.idt = self.idt;
        vcpu.cr = self.cr;
        vcpu.intr_flag = self.intr_flag;
        vcpu.n_exec = self.n_exec;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::R_CS;

    #[test]
    fn reset_state_matches_boot_contract() {
        let mut vcpu = Vcpu::default();
        vcpu.reset();
        assert_eq!(vcpu.eip, 0x7c00);
        assert_eq!(vcpu.cr[0], 0x6000_0010);
        assert_eq!(vcpu.cr[3], CR3_INVALID);
        assert!(!vcpu.protected_mode());
        assert_eq!(vcpu.operand_size(), 2);
        assert_eq!(vcpu.privilege_level(), 0);
    }

    #[test]
    fn eip_virt_composes_cs_base() {
        let mut vcpu = Vcpu::default();
        vcpu.reset();
        vcpu.segs[R_CS] = Segment::real_mode(0x1000);
        vcpu.eip = 0x42;
        assert_eq!(vcpu.eip_virt(), 0x10042);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut vcpu = Vcpu::default();
        vcpu.reset();
        vcpu.regs[0] = 0xdead_beef;
        vcpu.n_exec = 1234;
        let snap = VcpuSnapshot::capture(&vcpu);
        let mut other = Vcpu::default();
        snap.restore(&mut other);
        assert_eq!(other.regs[0], 0xdead_beef);
        assert_eq!(other.n_exec, 1234);
        assert_eq!(VcpuSnapshot::capture(&other), snap);
    }
}
