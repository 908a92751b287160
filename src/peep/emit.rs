//! The snippet emitter: turns matched peephole rules into host bytes inside a translation
//! block, producing the direct-jump edge metadata and per-instruction rollback buffers as it
//! goes. This is the code-generation half of the peephole engine.

use crate::exec::layout::{
    GS_CALLOUT, GS_CALLOUT_ARGS, GS_CALLOUT_N_ARGS, GS_EIP, GS_EXIT_EDGE, GS_IF, GS_JTARGET,
    GS_JUMPTABLE1, GS_MONITOR_EIP, GS_NEXT_EIP_IS_SET, GS_N_EXEC, GS_PENDING_IRQ, GS_PREV_TB,
    GS_TEMPORARIES, JUMPTABLE1_MASK,
};

/// A per-instruction rollback buffer: alternate code that undoes the partial architectural
/// effects of the emitted instruction, indexed by points inside the main code.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollbackSet {
    /// The rollback code bytes.
    pub buf: Vec<u8>,
    /// Pairs of (offset in the emitted main code, offset into `buf`): when a fault hits at or
    /// after a code offset, rollback execution starts at the paired buffer offset.
    pub points: Vec<(u16, u16)>,
}

impl RollbackSet {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// The ecx-driven branch kinds lowered by [`Emitter::emit_loop_edges`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopKind {
    Loop,
    Loopz,
    Loopnz,
    Jcxz,
}

/// Where an exit stub finds the next guest eip.
#[derive(Clone, Copy, Debug)]
pub enum EipSource {
    /// A known guest address.
    Imm(u32),
    /// The `gs:jtarget` slot, filled by indirect-jump code.
    Jtarget,
}

/// The callout argument sources a rule can pass.
#[derive(Clone, Copy, Debug)]
pub enum CalloutArg {
    /// A literal value known at translation time.
    Imm(u32),
    /// The live value of a guest register.
    Reg(u8),
}

/// The byte emitter for one translation block. Offsets are relative to the block start, which
/// is also how the edge and jump slots are recorded.
pub struct Emitter {
    pub out: Vec<u8>,
    /// Offsets of the 32-bit displacement slots of the (up to two) chainable edges.
    pub jmp_offset: [Option<u16>; 2],
    /// Offsets of the unchained targets (the in-block fall-through stubs).
    pub edge_offset: [Option<u16>; 2],
    /// The rollback set of the instruction currently being emitted.
    pub rollback: RollbackSet,
    /// Offset of the `n_exec` header addend immediate, patched once the block is complete.
    header_imm: Option<usize>,
    /// Offsets of `prev_tb` store immediates in edge stubs; the block's cache offset is not
    /// known until installation, so they are patched in then.
    pub prev_tb_sites: Vec<u16>,
    /// Where the current guest instruction's emission began; rollback points are recorded
    /// relative to it.
    insn_start: usize,
    next_edge: usize,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            out: Vec::with_capacity(256),
            jmp_offset: [None, None],
            edge_offset: [None, None],
            rollback: RollbackSet::default(),
            header_imm: None,
            prev_tb_sites: Vec::new(),
            insn_start: 0,
            next_edge: 0,
        }
    }

    /// Marks the start of a guest instruction's emission.
    pub fn begin_insn(&mut self) {
        self.insn_start = self.off();
    }

    #[inline]
    pub fn off(&self) -> usize {
        self.out.len()
    }

    pub fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    pub fn bytes(&mut self, bs: &[u8]) {
        self.out.extend_from_slice(bs);
    }

    pub fn imm32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn imm16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    /// `mov dword gs:[disp], imm32`
    pub fn gs_store_imm(&mut self, disp: u32, imm: u32) {
        self.bytes(&[0x65, 0xc7, 0x05]);
        self.imm32(disp);
        self.imm32(imm);
    }

    /// `mov word gs:[disp], imm16`
    pub fn gs_store_imm16(&mut self, disp: u32, imm: u16) {
        self.bytes(&[0x65, 0x66, 0xc7, 0x05]);
        self.imm32(disp);
        self.imm16(imm);
    }

    /// `mov gs:[disp], reg`
    pub fn gs_store_reg(&mut self, disp: u32, reg: u8) {
        self.bytes(&[0x65, 0x89, 0x05 | (reg << 3)]);
        self.imm32(disp);
    }

    /// `mov reg, gs:[disp]`
    pub fn gs_load_reg(&mut self, reg: u8, disp: u32) {
        self.bytes(&[0x65, 0x8b, 0x05 | (reg << 3)]);
        self.imm32(disp);
    }

    /// `jmp *gs:[disp]`
    pub fn gs_jmp_indirect(&mut self, disp: u32) {
        self.bytes(&[0x65, 0xff, 0x25]);
        self.imm32(disp);
    }

    /// Spills a host register to its temporary slot.
    pub fn save_temp(&mut self, slot: u8, reg: u8) {
        self.gs_store_reg(GS_TEMPORARIES + 4 * slot as u32, reg);
    }

    /// Restores a host register from its temporary slot.
    pub fn load_temp(&mut self, slot: u8, reg: u8) {
        self.gs_load_reg(reg, GS_TEMPORARIES + 4 * slot as u32);
    }

    /// Emits the block header. When a record or replay log is attached the header bumps
    /// `n_exec` by the number of guest instructions in the block; the addend is patched in by
    /// [`Emitter::patch_header`] once translation has counted them.
    pub fn emit_header(&mut self, with_rr: bool) {
        if !with_rr {
            return;
        }
        // addl $imm8, gs:[n_exec] ; adcl $0, gs:[n_exec+4]
        self.bytes(&[0x65, 0x83, 0x05]);
        self.imm32(GS_N_EXEC);
        self.header_imm = Some(self.off());
        self.byte(0);
        self.bytes(&[0x65, 0x83, 0x15]);
        self.imm32(GS_N_EXEC + 4);
        self.byte(0);
    }

    /// Patches the instruction count into the header emitted by [`Emitter::emit_header`].
    pub fn patch_header(&mut self, num_insns: u8) {
        if let Some(off) = self.header_imm {
            self.out[off] = num_insns;
        }
    }

    /// Emits the sti-fallthrough prologue: re-enable IF (2 -> 1) so the shadow ends with this
    /// instruction.
    pub fn emit_if_reenable(&mut self) {
        self.gs_store_imm16(GS_IF, 1);
    }

    /// The common tail of every exit stub: store the next eip, mark it valid, record the taken
    /// edge and the exiting block's identity, and jump back to the monitor.
    pub fn exit_to_monitor(&mut self, eip: EipSource, edge: u32) {
        match eip {
            EipSource::Imm(addr) => self.gs_store_imm(GS_EIP, addr),
            EipSource::Jtarget => {
                // jtarget already holds the target; the dispatcher reads it when
                // next_eip_is_set is 2.
            }
        }
        let valid = match eip {
            EipSource::Imm(_) => 1,
            EipSource::Jtarget => 2,
        };
        self.gs_store_imm(GS_NEXT_EIP_IS_SET, valid);
        self.gs_store_imm(GS_EXIT_EDGE, edge);
        // The block's own cache offset is patched in at installation time.
        self.gs_store_imm(GS_PREV_TB, 0);
        self.prev_tb_sites.push((self.off() - 4) as u16);
        self.gs_jmp_indirect(GS_MONITOR_EIP);
    }

    /// Emits a chainable direct edge to the guest address `target_eip`. The 32-bit jump
    /// displacement slot initially points at the in-block stub that exits to the monitor; the
    /// TB cache later rewrites it to chain straight into the successor block.
    pub fn emit_edge(&mut self, target_eip: u32) -> usize {
        let edge = self.next_edge;
        debug_assert!(edge < 2);
        self.byte(0xe9);
        let slot = self.off();
        self.imm32(0); // resolves to the stub that follows
        self.jmp_offset[edge] = Some(slot as u16);
        self.edge_offset[edge] = Some(self.off() as u16);
        self.exit_to_monitor(EipSource::Imm(target_eip), edge as u32);
        self.next_edge += 1;
        edge
    }

    /// Emits the taken/not-taken edge pair of a conditional branch.
    pub fn emit_cond_edges(&mut self, cond: u8, taken_eip: u32, fallthrough_eip: u32) {
        debug_assert_eq!(self.next_edge, 0);
        // jcc rel32 over the fall-through jump, into the taken stub.
        self.byte(0x0f);
        self.byte(0x80 + (cond & 0xf));
        let taken_slot = self.off();
        self.imm32(0);
        // jmp rel32 to the not-taken stub.
        self.byte(0xe9);
        let fall_slot = self.off();
        self.imm32(0);

        self.jmp_offset[0] = Some(taken_slot as u16);
        // The jcc displacement must skip the jmp that follows it when unchained.
        let taken_stub_pending = self.off();
        // not-taken stub comes second; first patch the jcc to land after it.
        self.jmp_offset[1] = Some(fall_slot as u16);
        self.edge_offset[1] = Some(self.off() as u16);
        self.exit_to_monitor(EipSource::Imm(fallthrough_eip), 1);
        let taken_stub = self.off();
        self.edge_offset[0] = Some(taken_stub as u16);
        self.exit_to_monitor(EipSource::Imm(taken_eip), 0);
        // Resolve the two unchained displacements now that both stubs exist.
        let _ = taken_stub_pending;
        self.patch_rel32(taken_slot, taken_stub as u32);
        self.patch_rel32(fall_slot, self.edge_offset[1].unwrap() as u32);
        self.next_edge = 2;
    }

    /// Writes `target - (slot + 4)` into the rel32 at `slot` (offsets are block-relative, so
    /// the arithmetic matches the address-space displacement).
    pub fn patch_rel32(&mut self, slot: usize, target: u32) {
        let rel = target.wrapping_sub(slot as u32 + 4);
        self.out[slot..slot + 4].copy_from_slice(&rel.to_le_bytes());
    }

    /// Emits a callout: the translated code stores the handler id, its arguments and the next
    /// guest eip, then exits. `fallthrough` of `None` means the handler itself sets the eip.
    pub fn emit_callout(&mut self, callout_id: u32, args: &[CalloutArg], fallthrough: Option<u32>) {
        self.gs_store_imm(GS_CALLOUT, callout_id + 1);
        self.gs_store_imm(GS_CALLOUT_N_ARGS, args.len() as u32);
        for (i, arg) in args.iter().enumerate() {
            let disp = GS_CALLOUT_ARGS + 4 * i as u32;
            match arg {
                CalloutArg::Imm(v) => self.gs_store_imm(disp, *v),
                CalloutArg::Reg(r) => self.gs_store_reg(disp, *r),
            }
        }
        if let Some(eip) = fallthrough {
            self.gs_store_imm(GS_EIP, eip);
        }
        self.gs_store_imm(GS_NEXT_EIP_IS_SET, if fallthrough.is_some() { 1 } else { 0 });
        self.gs_store_imm(GS_EXIT_EDGE, crate::vcpu::EDGE_NONE);
        self.gs_jmp_indirect(GS_MONITOR_EIP);
    }

    /// Emits the indirect-branch epilogue: the target guest eip is live in `reg`, which is a
    /// live guest register the probe must not clobber. An inline probe of the L1 jump table
    /// either jumps straight into the cached translation or exits to the monitor with the
    /// target in `gs:jtarget`.
    ///
    /// `temp` must differ from `reg` and from esp.
    pub fn emit_indirect_exit(&mut self, reg: u8, temp: u8) {
        self.gs_store_reg(GS_JTARGET, reg);
        self.save_temp(7, temp);
        self.emit_indirect_exit_restoring(reg, temp, None, Some(7));
    }

    /// The general indirect-branch epilogue. `gs:jtarget` already holds the guest target, also
    /// live in `reg`. `reg_slot`/`temp_slot` name temporary slots whose saved values are
    /// restored into `reg`/`temp` on both the hit and the miss path (`None` leaves the
    /// register alone).
    pub fn emit_indirect_exit_restoring(
        &mut self,
        reg: u8,
        temp: u8,
        reg_slot: Option<u8>,
        temp_slot: Option<u8>,
    ) {
        debug_assert_ne!(reg, temp);
        // mov temp, reg
        self.bytes(&[0x89, 0xc0 | (reg << 3) | temp]);
        // and temp, JUMPTABLE1_MASK
        self.bytes(&[0x81, 0xe0 | temp]);
        self.imm32(JUMPTABLE1_MASK);
        // cmp gs:[JUMPTABLE1 + temp], reg (modrm mod=10 rm=100, sib base=temp no-index)
        self.bytes(&[0x65, 0x39, 0x84 | (reg << 3), 0x20 | temp]);
        self.imm32(GS_JUMPTABLE1);
        // jne miss
        self.bytes(&[0x75, 0x00]);
        let miss_patch = self.off() - 1;
        // mov temp, gs:[JUMPTABLE1 + 4 + temp]  (the cached tc target)
        self.bytes(&[0x65, 0x8b, 0x84 | (temp << 3), 0x20 | temp]);
        self.imm32(GS_JUMPTABLE1 + 4);
        // stash the tc target and restore the scratch registers before jumping into it
        self.gs_store_reg(GS_JTARGET, temp);
        if let Some(slot) = temp_slot {
            self.load_temp(slot, temp);
        }
        if let Some(slot) = reg_slot {
            self.load_temp(slot, reg);
        }
        self.gs_jmp_indirect(GS_JTARGET);
        // miss: restore and exit to the monitor for a hash lookup.
        let miss = self.off();
        self.out[miss_patch] = (miss - (miss_patch + 1)) as u8;
        if let Some(slot) = temp_slot {
            self.load_temp(slot, temp);
        }
        if let Some(slot) = reg_slot {
            self.load_temp(slot, reg);
        }
        self.exit_to_monitor(EipSource::Jtarget, crate::vcpu::EDGE_NONE);
    }

    /// The kinds of ecx-driven branches [`Emitter::emit_loop_edges`] can lower.
    ///
    /// `loop` decrements ecx without touching flags, so the lowering uses `lea` for the
    /// decrement and `jecxz` for the zero test.
    pub fn emit_loop_edges(&mut self, kind: LoopKind, addr16: bool, taken: u32, fallthrough: u32) {
        debug_assert_eq!(self.next_edge, 0);
        if kind != LoopKind::Jcxz {
            // lea ecx, [ecx-1]
            self.bytes(&[0x8d, 0x49, 0xff]);
        }
        if addr16 {
            // Make jecxz test cx rather than ecx.
            self.byte(0x67);
        }
        // jecxz: skip the taken branch when the count (or the tested register) is zero.
        let invert = kind == LoopKind::Jcxz;
        self.byte(0xe3);
        let jecxz_patch = self.off();
        self.byte(0);
        let mut extra_patch = None;
        match kind {
            LoopKind::Loopz => {
                // Additionally fall through when ZF is clear.
                self.bytes(&[0x75, 0x00]);
                extra_patch = Some(self.off() - 1);
            }
            LoopKind::Loopnz => {
                self.bytes(&[0x74, 0x00]);
                extra_patch = Some(self.off() - 1);
            }
            _ => {}
        }
        // jmp rel32 to the first stub emitted below.
        self.byte(0xe9);
        let first_slot = self.off();
        self.imm32(0);
        let after_jmp = self.off();
        // jecxz (and the ZF test) land here, on the second jmp.
        self.out[jecxz_patch] = (after_jmp - (jecxz_patch + 1)) as u8;
        if let Some(p) = extra_patch {
            self.out[p] = (after_jmp - (p + 1)) as u8;
        }
        self.byte(0xe9);
        let second_slot = self.off();
        self.imm32(0);
        // For loop-class branches ecx != 0 takes the branch; for jcxz ecx == 0 does.
        let (taken_slot, fall_slot) = if invert {
            (second_slot, first_slot)
        } else {
            (first_slot, second_slot)
        };
        self.jmp_offset[0] = Some(taken_slot as u16);
        self.jmp_offset[1] = Some(fall_slot as u16);
        let first_stub = self.off();
        let first_is_taken = taken_slot == first_slot;
        if first_is_taken {
            self.edge_offset[0] = Some(first_stub as u16);
            self.exit_to_monitor(EipSource::Imm(taken), 0);
            self.edge_offset[1] = Some(self.off() as u16);
            self.exit_to_monitor(EipSource::Imm(fallthrough), 1);
        } else {
            self.edge_offset[1] = Some(first_stub as u16);
            self.exit_to_monitor(EipSource::Imm(fallthrough), 1);
            self.edge_offset[0] = Some(self.off() as u16);
            self.exit_to_monitor(EipSource::Imm(taken), 0);
        }
        let e0 = self.edge_offset[0].unwrap() as u32;
        let e1 = self.edge_offset[1].unwrap() as u32;
        self.patch_rel32(taken_slot, e0);
        self.patch_rel32(fall_slot, e1);
        self.next_edge = 2;
    }

    /// Records a rollback point at the current code offset: a fault on the host instruction
    /// emitted here is undone by executing `undo` (and whatever rollback code follows it).
    pub fn add_rollback_point(&mut self, undo: &[u8]) {
        let code_offset = (self.off() - self.insn_start) as u16;
        let rb_offset = self.rollback.buf.len() as u16;
        self.rollback.buf.extend_from_slice(undo);
        self.rollback.points.push((code_offset, rb_offset));
    }

    /// Takes the rollback set accumulated for the current instruction.
    pub fn take_rollback(&mut self) -> RollbackSet {
        std::mem::take(&mut self.rollback)
    }

    /// Emits the IRQ-poll epilogue placed after an sti fall-through instruction: if an
    /// interrupt became pending while the shadow was open, exit to the monitor instead of
    /// running on.
    pub fn emit_irq_poll(&mut self, resume_eip: u32) {
        // cmp dword gs:[pending_irq], 0
        self.bytes(&[0x65, 0x83, 0x3d]);
        self.imm32(GS_PENDING_IRQ);
        self.byte(0);
        // je over the exit stub
        self.bytes(&[0x74, 0x00]);
        let patch = self.off() - 1;
        self.exit_to_monitor(EipSource::Imm(resume_eip), crate::vcpu::EDGE_NONE);
        let end = self.off();
        self.out[patch] = (end - (patch + 1)) as u8;
    }

}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_slot_points_at_stub_when_unchained() {
        let mut e = Emitter::new();
        e.emit_edge(0x1234);
        let slot = e.jmp_offset[0].unwrap() as usize;
        let stub = e.edge_offset[0].unwrap() as u32;
        let rel = u32::from_le_bytes([e.out[slot], e.out[slot + 1], e.out[slot + 2], e.out[slot + 3]]);
        assert_eq!(rel.wrapping_add(slot as u32 + 4), stub);
        // The stub records the fall-through eip.
        assert_eq!(&e.out[stub as usize..stub as usize + 3], &[0x65, 0xc7, 0x05]);
    }

    #[test]
    fn cond_edges_produce_two_slots() {
        let mut e = Emitter::new();
        e.emit_cond_edges(5, 0x2000, 0x2002);
        assert!(e.jmp_offset[0].is_some());
        assert!(e.jmp_offset[1].is_some());
        assert!(e.edge_offset[0].is_some());
        assert!(e.edge_offset[1].is_some());
        // Unchained: each slot resolves to its own stub.
        for k in 0..2 {
            let slot = e.jmp_offset[k].unwrap() as usize;
            let stub = e.edge_offset[k].unwrap() as u32;
            let rel =
                u32::from_le_bytes([e.out[slot], e.out[slot + 1], e.out[slot + 2], e.out[slot + 3]]);
            assert_eq!(rel.wrapping_add(slot as u32 + 4), stub, "edge {}", k);
        }
    }

    #[test]
    fn rechaining_is_lossless() {
        let mut e = Emitter::new();
        e.emit_edge(0x1234);
        let slot = e.jmp_offset[0].unwrap() as usize;
        let stub = e.edge_offset[0].unwrap() as u32;
        let original = e.out.clone();
        // Chain to a fake successor, then revoke by rewriting with the edge offset.
        e.patch_rel32(slot, 0xdead_0000);
        assert_ne!(e.out, original);
        e.patch_rel32(slot, stub);
        assert_eq!(e.out, original);
    }

    #[test]
    fn header_patching() {
        let mut e = Emitter::new();
        e.emit_header(true);
        e.patch_header(7);
        // addl $7, gs:[n_exec]
        assert_eq!(e.out[0..3], [0x65, 0x83, 0x05]);
        assert_eq!(e.out[7], 7);
    }

    #[test]
    fn callout_stores_id_args_and_exit() {
        let mut e = Emitter::new();
        e.emit_callout(3, &[CalloutArg::Imm(0x60), CalloutArg::Reg(2)], Some(0x7c05));
        let out = e.out;
        // ends with jmp *gs:[monitor_eip]
        assert_eq!(&out[out.len() - 7..out.len() - 4], &[0x65, 0xff, 0x25]);
    }

    #[test]
    fn rollback_points_accumulate() {
        let mut e = Emitter::new();
        e.begin_insn();
        e.bytes(&[0x83, 0xec, 0x04]); // sub esp, 4
        e.add_rollback_point(&[0x83, 0xc4, 0x04]); // add esp, 4
        e.bytes(&[0x89, 0x04, 0x24]); // mov [esp], eax
        let rb = e.take_rollback();
        assert_eq!(rb.points.len(), 1);
        assert_eq!(rb.points[0].0, 3);
        assert_eq!(rb.buf, vec![0x83, 0xc4, 0x04]);
        assert!(e.rollback.is_empty());
    }
}
