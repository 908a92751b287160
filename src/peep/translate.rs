//! The translator: turns a guest byte sequence at a given eip into the body of a translation
//! block, one instruction at a time, by peephole match or by the mode-translate fallback.

use log::trace;

use super::emit::{Emitter, RollbackSet};
use super::table::{CpuConstraints, PeepTable};
use crate::arch::x86::{R_CS, R_GS};
use crate::error::Error;
use crate::exec::layout::{GS_MONITOR_EIP, GS_SEG_BASES};
use crate::insn::decode::DecodeCtx;
use crate::insn::encode;
use crate::insn::opcodes::Op;
use crate::insn::{Insn, MemOperand, Operand, Prefixes, SegType, Tag};

/// Max number of instructions in a translation unit.
pub const MAX_TU_SIZE: usize = 12;

/// The output of translating one guest basic block.
#[derive(Debug)]
pub struct TranslationOut {
    /// The emitted host bytes.
    pub code: Vec<u8>,
    /// The number of guest instructions consumed.
    pub num_insns: usize,
    /// The number of guest bytes consumed.
    pub tb_len: usize,
    /// Guest byte offset after each instruction.
    pub eip_boundaries: Vec<u8>,
    /// Host byte offset before each instruction, plus the total size.
    pub tc_boundaries: Vec<u16>,
    /// Where each chainable edge's unchained target lives.
    pub edge_offsets: [Option<u16>; 2],
    /// Where each chainable edge's rel32 slot lives.
    pub jmp_offsets: [Option<u16>; 2],
    /// The per-instruction rollback buffers.
    pub rollbacks: Vec<RollbackSet>,
    /// Offsets of the `prev_tb` immediates exit stubs leave for installation-time patching.
    pub prev_tb_sites: Vec<u16>,
}

/// The translator. Owns the decoder, the peephole table and the sti-fallthrough marker.
pub struct Translator {
    pub decoder: DecodeCtx,
    pub table: PeepTable,
    max_tu_size: usize,
    /// The guest linear address of the instruction following the last translated `sti`, so the
    /// next translation starting there re-enables IF and polls for interrupts.
    sti_fallthrough: Option<u32>,
}

impl Translator {
    pub fn new() -> Self {
        Self {
            decoder: DecodeCtx::new(),
            table: PeepTable::new(),
            max_tu_size: MAX_TU_SIZE,
            sti_fallthrough: None,
        }
    }

    pub fn set_max_tu_size(&mut self, size: usize) {
        assert!(size > 0 && size <= MAX_TU_SIZE);
        self.max_tu_size = size;
    }

    pub fn add_sti_fallthrough(&mut self, addr: u32) {
        self.sti_fallthrough = Some(addr);
    }

    fn take_sti_fallthrough(&mut self, addr: u32) -> bool {
        if self.sti_fallthrough == Some(addr) {
            self.sti_fallthrough = None;
            true
        } else {
            false
        }
    }

    /// Translates the guest bytes in `code` starting at linear address `eip_virt`. The block
    /// ends at a terminating instruction, at `max_tu_size` instructions, or when the fetch
    /// window runs out. `if_shadow` is set when the guest sits in the sti shadow (IF == 2) so
    /// the block must re-enable interrupts after its first instruction.
    pub fn translate(
        &mut self,
        code: &[u8],
        eip_virt: u32,
        sizehint: u8,
        constraints: CpuConstraints,
        with_rr: bool,
        if_shadow: bool,
    ) -> Result<TranslationOut, Error> {
        let mut e = Emitter::new();
        e.emit_header(with_rr);

        let mut pos = 0usize;
        let mut n_in = 0usize;
        let mut eip_boundaries = Vec::new();
        let mut tc_boundaries = Vec::new();
        let mut rollbacks = Vec::new();
        let mut last_terminating = false;

        loop {
            let cur_addr = eip_virt.wrapping_add(pos as u32);
            let is_sti_fallthrough = (n_in == 0 && if_shadow) || self.take_sti_fallthrough(cur_addr);

            tc_boundaries.push(e.off() as u16);
            e.begin_insn();
            let insn = match self.decoder.decode(&code[pos..], cur_addr, sizehint) {
                Ok(insn) => insn,
                Err(err) => {
                    if n_in == 0 {
                        return Err(err);
                    }
                    // The fetch window ended mid-instruction; close the block here.
                    tc_boundaries.pop();
                    break;
                }
            };
            let fallthrough_addr = cur_addr.wrapping_add(insn.len as u32);
            let is_terminating = insn.is_terminating() || n_in == self.max_tu_size - 1;

            if is_sti_fallthrough {
                e.emit_if_reenable();
            }

            let insn_start = e.off();
            self.emit_one(
                &mut e,
                &insn,
                &code[pos..pos + insn.len as usize],
                cur_addr,
                fallthrough_addr,
                constraints,
            )?;
            rollbacks.push(e.take_rollback());

            if is_sti_fallthrough && !contains_jump_to_monitor(&e.out[insn_start..]) {
                e.emit_irq_poll(fallthrough_addr);
            }

            pos += insn.len as usize;
            eip_boundaries.push(pos as u8);
            n_in += 1;
            if insn.opc == Op::Sti {
                self.add_sti_fallthrough(fallthrough_addr);
            }
            last_terminating = insn.is_terminating();
            if is_terminating {
                break;
            }
            if pos >= code.len() {
                break;
            }
        }

        if !last_terminating {
            // The block fell off its end; emit a chainable edge to the fall-through address.
            let fallthrough_addr = eip_virt.wrapping_add(pos as u32);
            e.emit_edge(fallthrough_addr);
        }

        e.patch_header(n_in as u8);
        tc_boundaries.push(e.off() as u16);
        trace!(
            "translated {} insns at {:#x}: {} host bytes",
            n_in,
            eip_virt,
            e.off()
        );

        Ok(TranslationOut {
            num_insns: n_in,
            tb_len: pos,
            eip_boundaries,
            tc_boundaries,
            edge_offsets: e.edge_offset,
            jmp_offsets: e.jmp_offset,
            rollbacks,
            prev_tb_sites: e.prev_tb_sites,
            code: e.out,
        })
    }

    /// Emits one instruction: peephole match first, mode-translate fallback second.
    fn emit_one(
        &mut self,
        e: &mut Emitter,
        insn: &Insn,
        raw: &[u8],
        cur_addr: u32,
        fallthrough_addr: u32,
        constraints: CpuConstraints,
    ) -> Result<(), Error> {
        if let Some(mut m) = self.table.lookup(&[*insn], constraints) {
            m.ctx.cur_addr = cur_addr;
            m.ctx.fallthrough_addr = fallthrough_addr;
            trace!("{:#x}: peep rule {}", cur_addr, m.entry.name);
            (m.entry.emit)(e, &m.ctx);
            return Ok(());
        }
        mode_translate(e, insn, raw, constraints)
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

/// The byte pattern of an exit to the monitor (`jmp *gs:[monitor_eip]`).
fn monitor_jump_pattern() -> [u8; 7] {
    let d = GS_MONITOR_EIP.to_le_bytes();
    [0x65, 0xff, 0x25, d[0], d[1], d[2], d[3]]
}

/// Whether the emitted bytes contain a jump back to the monitor.
pub fn contains_jump_to_monitor(bytes: &[u8]) -> bool {
    let pat = monitor_jump_pattern();
    bytes.windows(pat.len()).any(|w| w == pat)
}

/// The mode-translate fallback: instructions with no peephole row are copied with minimal
/// prefix adjustment. In real mode, a 16-bit memory access through CS or GS is lowered to an
/// explicit scratch-register address computation, because those segments do not mirror into
/// host descriptors.
fn mode_translate(
    e: &mut Emitter,
    insn: &Insn,
    raw: &[u8],
    constraints: CpuConstraints,
) -> Result<(), Error> {
    if constraints.contains(CpuConstraints::PROTECTED) {
        e.bytes(raw);
        return Ok(());
    }

    if let Some(mem) = insn.mem16_operand() {
        if mem.segtype == SegType::Sel
            && (mem.seg == R_CS as u32 || mem.seg == R_GS as u32)
            && !insn.opc.is_string_op()
        {
            return lower_mem16(e, insn, *mem);
        }
    }
    // Plain real-mode instruction: re-emit with the 16-bit toggles re-derived.
    e.bytes(raw);
    Ok(())
}

/// Lowers a 16-bit memory access from a non-default segment: compute
/// `(base + index + disp) & 0xffff + segbase` into a scratch register and rewrite the operand
/// to a flat `[scratch]` access.
fn lower_mem16(e: &mut Emitter, insn: &Insn, mem: MemOperand) -> Result<(), Error> {
    let temp = encode::find_unused_reg(insn);
    e.save_temp(6, temp);
    match mem.base {
        Some(base) => {
            // movzx temp, base16
            e.bytes(&[0x0f, 0xb7, 0xc0 | (temp << 3) | base]);
        }
        None => {
            // xor temp, temp
            e.bytes(&[0x31, 0xc0 | (temp << 3) | temp]);
        }
    }
    if let Some(index) = mem.index {
        // add temp, index (both already 16-bit values in 32-bit registers)
        e.bytes(&[0x01, 0xc0 | (index << 3) | temp]);
    }
    if mem.disp != 0 {
        e.bytes(&[0x81, 0xc0 | temp]);
        e.imm32(mem.disp);
    }
    // and temp, 0xffff
    e.bytes(&[0x81, 0xe0 | temp]);
    e.imm32(0xffff);
    // add temp, gs:[seg_bases + 4*seg]
    e.bytes(&[0x65, 0x03, 0x05 | (temp << 3)]);
    e.imm32(GS_SEG_BASES + 4 * mem.seg);

    // Re-emit the instruction against the flat scratch address.
    let mut rewritten = *insn;
    for op in rewritten.op.iter_mut() {
        if matches!(op, Operand::Mem(_)) {
            *op = Operand::Mem(MemOperand {
                addrsize: 4,
                segtype: SegType::Sel,
                seg: crate::arch::x86::R_DS as u32,
                seg_tag: Tag::Const,
                base: Some(temp),
                base_tag: Tag::Const,
                index: None,
                index_tag: Tag::Const,
                scale: 1,
                disp: 0,
                disp_tag: Tag::Const,
            });
            break;
        }
    }
    rewritten.addrsize = 4;
    rewritten.prefixes &= !(Prefixes::CS
        | Prefixes::SS
        | Prefixes::DS
        | Prefixes::ES
        | Prefixes::FS
        | Prefixes::GS
        | Prefixes::ADDR);
    let body = encode::encode(&rewritten, 0)?;
    e.bytes(&body);
    e.load_temp(6, temp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real() -> CpuConstraints {
        CpuConstraints::REAL | CpuConstraints::NO_EXCP
    }

    fn prot() -> CpuConstraints {
        CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP
    }

    #[test]
    fn straight_line_block_gets_fallthrough_edge() {
        let mut t = Translator::new();
        // mov eax, 1 ; mov ebx, 2 ; then window ends
        let code = [0xb8, 1, 0, 0, 0, 0xbb, 2, 0, 0, 0];
        let out = t.translate(&code, 0x1000, 4, prot(), false, false).unwrap();
        assert_eq!(out.num_insns, 2);
        assert_eq!(out.tb_len, 10);
        assert!(out.jmp_offsets[0].is_some());
        assert_eq!(out.eip_boundaries, vec![5, 10]);
        // tc_boundaries is strictly increasing with a final total-size entry.
        for w in out.tc_boundaries.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert_eq!(out.tc_boundaries.len(), out.num_insns + 1);
        assert_eq!(*out.tc_boundaries.last().unwrap() as usize, out.code.len());
    }

    #[test]
    fn block_ends_at_terminator() {
        let mut t = Translator::new();
        // mov eax,1 ; jmp +0 ; mov ebx,2 (never reached)
        let code = [0xb8, 1, 0, 0, 0, 0xe9, 0, 0, 0, 0, 0xbb, 2, 0, 0, 0];
        let out = t.translate(&code, 0x1000, 4, prot(), false, false).unwrap();
        assert_eq!(out.num_insns, 2);
        assert_eq!(out.tb_len, 10);
    }

    #[test]
    fn max_tu_size_bounds_block() {
        let mut t = Translator::new();
        t.set_max_tu_size(3);
        let code = [0x90; 32];
        let out = t.translate(&code, 0, 4, prot(), false, false).unwrap();
        assert_eq!(out.num_insns, 3);
    }

    #[test]
    fn rr_header_counts_insns() {
        let mut t = Translator::new();
        let code = [0x90, 0x90, 0xf4]; // nop ; nop ; hlt
        let out = t.translate(&code, 0, 2, real(), true, false).unwrap();
        assert_eq!(out.num_insns, 3);
        // addl $3, gs:[n_exec]
        assert_eq!(out.code[0..3], [0x65, 0x83, 0x05]);
        assert_eq!(out.code[7], 3);
    }

    #[test]
    fn sti_marks_fallthrough_and_next_block_reenables() {
        let mut t = Translator::new();
        // sti ; (block ends via max_tu) -- then translating the fallthrough re-enables IF.
        t.set_max_tu_size(1);
        let code = [0xfb, 0x90];
        let out1 = t.translate(&code, 0x100, 2, real(), false, false).unwrap();
        assert_eq!(out1.tb_len, 1);
        let out2 = t.translate(&code[1..], 0x101, 2, real(), false, false).unwrap();
        // The follow-on block begins with `mov word gs:[IF], 1`.
        assert_eq!(out2.code[0..4], [0x65, 0x66, 0xc7, 0x05]);
    }

    #[test]
    fn conditional_branch_emits_two_edges() {
        let mut t = Translator::new();
        let code = [0x75, 0x10]; // jne
        let out = t.translate(&code, 0x1000, 4, prot(), false, false).unwrap();
        assert!(out.jmp_offsets[0].is_some());
        assert!(out.jmp_offsets[1].is_some());
        assert!(out.edge_offsets[0].is_some());
        assert!(out.edge_offsets[1].is_some());
    }

    #[test]
    fn call_has_rollback_buffer() {
        let mut t = Translator::new();
        let code = [0xe8, 0x10, 0x00, 0x00, 0x00]; // call rel32
        let out = t.translate(&code, 0x1000, 4, prot(), false, false).unwrap();
        assert_eq!(out.rollbacks.len(), 1);
        assert!(!out.rollbacks[0].is_empty());
    }

    #[test]
    fn real_mode_cs_mem16_is_lowered() {
        let mut t = Translator::new();
        // mov ax, cs:[bx+2]
        let code = [0x2e, 0x8b, 0x47, 0x02];
        let out = t.translate(&code, 0x7c00, 2, real(), false, false).unwrap();
        // No cs override byte may survive in the emitted code.
        assert!(!out.code.contains(&0x2e));
        // The scratch is saved to a temporary slot first.
        assert_eq!(out.code[0], 0x65);
    }

    #[test]
    fn undecodable_first_insn_is_an_error() {
        let mut t = Translator::new();
        let code = [0xff, 0xff];
        assert!(t.translate(&code, 0, 4, prot(), false, false).is_err());
    }
}
