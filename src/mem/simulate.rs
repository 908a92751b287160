//! The faulting-instruction simulator. When a traced store takes a write fault, the monitor
//! must retire exactly one guest store without faulting again: the instruction's memory
//! operands are rewritten into scratch form, the operation runs against copies of the memory
//! bytes, and changed bytes are written back through the guest page tables.

use log::trace;

use crate::arch::x86::{Eflags, CR0_PG, R_SS};
use crate::error::Error;
use crate::insn::decode::DecodeCtx;
use crate::insn::encode;
use crate::insn::opcodes::Op;
use crate::insn::{Insn, MemOperand, Operand, Prefixes, SegType};
use crate::vcpu::Vcpu;

use super::paging::{access_flags, pt_walk};
use super::phys::GuestRam;

/// Why a simulation could not complete.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimFault {
    /// A nested guest fault at the given linear address; the caller reflects it.
    Nested(u32),
    /// The instruction form is outside what the simulator retires.
    Unsupported,
}

/// The outcome of a completed simulation.
#[derive(Clone, Copy, Debug)]
pub struct SimResult {
    /// The linear address of the (first) memory write.
    pub fault_addr: u32,
    /// The store size in bytes, reported to mtrace clients.
    pub access_size: u32,
}

/// Evaluates a memory operand against the current guest register file, yielding a linear
/// address.
pub fn operand_evaluate(vcpu: &Vcpu, mem: &MemOperand) -> u32 {
    let mut addr: u32 = 0;
    if let Some(base) = mem.base {
        addr = addr.wrapping_add(vcpu.regs[base as usize]);
    }
    if let Some(index) = mem.index {
        addr = addr.wrapping_add(vcpu.regs[index as usize].wrapping_mul(mem.scale as u32));
    }
    addr = addr.wrapping_add(mem.disp);
    if mem.addrsize == 2 {
        addr &= 0xffff;
    }
    let seg_base = match mem.segtype {
        SegType::Sel => vcpu.segs[mem.seg as usize].base,
        SegType::Desc => mem.seg,
    };
    seg_base.wrapping_add(addr)
}

fn paging_on(vcpu: &Vcpu) -> bool {
    vcpu.cr[0] & CR0_PG != 0 && vcpu.using_cr3_page_table()
}

fn virt_to_phys(
    ram: &mut GuestRam,
    vcpu: &Vcpu,
    vaddr: u32,
    write: bool,
) -> Result<u32, SimFault> {
    if !paging_on(vcpu) {
        return Ok(vaddr);
    }
    let flags = access_flags(write, vcpu.privilege_level() == 3, vcpu.cr[0]);
    pt_walk(ram, vcpu.cr[3], vaddr, flags)
        .map(|r| r.paddr)
        .map_err(|_| SimFault::Nested(vaddr))
}

fn ldub_simulate(ram: &mut GuestRam, vcpu: &Vcpu, vaddr: u32) -> Result<u8, SimFault> {
    let paddr = virt_to_phys(ram, vcpu, vaddr, false)?;
    ram.ldub(paddr).map_err(|_| SimFault::Nested(vaddr))
}

fn stb_simulate(ram: &mut GuestRam, vcpu: &Vcpu, vaddr: u32, val: u8) -> Result<(), SimFault> {
    let paddr = virt_to_phys(ram, vcpu, vaddr, true)?;
    ram.stb(paddr, val).map_err(|_| SimFault::Nested(vaddr))
}

fn load_val(bytes: &[u8], size: u32) -> u32 {
    let mut v: u32 = 0;
    for i in 0..size as usize {
        v |= (bytes[i] as u32) << (8 * i);
    }
    v
}

fn store_val(bytes: &mut [u8], size: u32, val: u32) {
    for i in 0..size as usize {
        bytes[i] = (val >> (8 * i)) as u8;
    }
}

fn reg_read(vcpu: &Vcpu, id: u8, size: u8) -> u32 {
    if size == 1 && id >= 4 {
        // ah/ch/dh/bh
        (vcpu.regs[(id - 4) as usize] >> 8) & 0xff
    } else {
        let mask = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };
        vcpu.regs[id as usize] & mask
    }
}

fn reg_write(vcpu: &mut Vcpu, id: u8, size: u8, val: u32) {
    match size {
        1 if id >= 4 => {
            let r = &mut vcpu.regs[(id - 4) as usize];
            *r = (*r & !0xff00) | ((val & 0xff) << 8);
        }
        1 => {
            let r = &mut vcpu.regs[id as usize];
            *r = (*r & !0xff) | (val & 0xff);
        }
        2 => {
            let r = &mut vcpu.regs[id as usize];
            *r = (*r & !0xffff) | (val & 0xffff);
        }
        _ => vcpu.regs[id as usize] = val,
    }
}

fn set_zsp_flags(vcpu: &mut Vcpu, result: u32, size: u32) {
    let masked = result & size_mask(size);
    let sign_bit = 1u32 << (size * 8 - 1);
    let mut fl = vcpu.eflags;
    fl &= !(Eflags::ZF | Eflags::SF | Eflags::PF).bits();
    if masked == 0 {
        fl |= Eflags::ZF.bits();
    }
    if masked & sign_bit != 0 {
        fl |= Eflags::SF.bits();
    }
    if (masked as u8).count_ones() % 2 == 0 {
        fl |= Eflags::PF.bits();
    }
    vcpu.eflags = fl;
}

fn size_mask(size: u32) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

fn set_addsub_flags(vcpu: &mut Vcpu, a: u32, b: u32, result64: u64, size: u32, sub: bool) {
    let mask = size_mask(size);
    let result = (result64 as u32) & mask;
    set_zsp_flags(vcpu, result, size);
    let sign = 1u32 << (size * 8 - 1);
    let carry = result64 > mask as u64;
    let overflow = if sub {
        ((a ^ b) & (a ^ result)) & sign != 0
    } else {
        (!(a ^ b) & (a ^ result)) & sign != 0
    };
    let mut fl = vcpu.eflags & !(Eflags::CF | Eflags::OF | Eflags::AF).bits();
    if carry {
        fl |= Eflags::CF.bits();
    }
    if overflow {
        fl |= Eflags::OF.bits();
    }
    if ((a ^ b ^ (result64 as u32)) & 0x10) != 0 {
        fl |= Eflags::AF.bits();
    }
    vcpu.eflags = fl;
}

/// Applies the data operation of the rewritten instruction to the in-copy memory bytes and
/// the register file. This is the monitor-context execution of the scratch page.
fn execute_copy(
    vcpu: &mut Vcpu,
    insn: &Insn,
    mem0: &mut [u8],
    mem1: &[u8],
) -> Result<(), SimFault> {
    let size = insn.opsize as u32;
    let src_of = |vcpu: &Vcpu, op: &Operand, membytes: &[u8]| -> u32 {
        match op {
            Operand::Reg { id, size, .. } => reg_read(vcpu, *id, *size),
            Operand::Imm { val, .. } => *val as u32,
            Operand::Mem(_) => load_val(membytes, size),
            _ => 0,
        }
    };
    match insn.opc {
        Op::Mov => {
            match (&insn.op[0], &insn.op[1]) {
                (Operand::Mem(_), src) => {
                    let v = src_of(vcpu, src, mem1);
                    store_val(mem0, size, v);
                }
                (Operand::Reg { id, size: rsize, .. }, Operand::Mem(_)) => {
                    let v = load_val(mem0, *rsize as u32);
                    reg_write(vcpu, *id, *rsize, v);
                }
                _ => return Err(SimFault::Unsupported),
            }
        }
        Op::Add | Op::Or | Op::Adc | Op::Sbb | Op::And | Op::Sub | Op::Xor | Op::Cmp => {
            let dst_is_mem = matches!(insn.op[0], Operand::Mem(_));
            let a = if dst_is_mem {
                load_val(mem0, size)
            } else {
                src_of(vcpu, &insn.op[0], mem0)
            };
            let b = if dst_is_mem {
                src_of(vcpu, &insn.op[1], mem1)
            } else {
                load_val(mem0, size)
            };
            let cf = (vcpu.eflags & Eflags::CF.bits() != 0) as u64;
            let (res64, sub) = match insn.opc {
                Op::Add => (a as u64 + b as u64, false),
                Op::Adc => (a as u64 + b as u64 + cf, false),
                Op::Sub | Op::Cmp => ((a as u64).wrapping_sub(b as u64), true),
                Op::Sbb => ((a as u64).wrapping_sub(b as u64 + cf), true),
                Op::Or => ((a | b) as u64, false),
                Op::And => ((a & b) as u64, false),
                _ => ((a ^ b) as u64, false),
            };
            let res = (res64 as u32) & size_mask(size);
            match insn.opc {
                Op::Or | Op::And | Op::Xor => {
                    set_zsp_flags(vcpu, res, size);
                    vcpu.eflags &= !(Eflags::CF | Eflags::OF).bits();
                }
                _ => set_addsub_flags(vcpu, a, b, res64, size, sub),
            }
            if insn.opc != Op::Cmp {
                if dst_is_mem {
                    store_val(mem0, size, res);
                } else if let Operand::Reg { id, size: rsize, .. } = insn.op[0] {
                    reg_write(vcpu, id, rsize, res);
                }
            }
        }
        Op::Inc | Op::Dec => {
            let a = load_val(mem0, size);
            let res = if insn.opc == Op::Inc {
                a.wrapping_add(1)
            } else {
                a.wrapping_sub(1)
            };
            // inc/dec preserve CF.
            let cf = vcpu.eflags & Eflags::CF.bits();
            set_addsub_flags(vcpu, a, 1, res as u64, size, insn.opc == Op::Dec);
            vcpu.eflags = (vcpu.eflags & !Eflags::CF.bits()) | cf;
            store_val(mem0, size, res);
        }
        Op::Not => {
            let a = load_val(mem0, size);
            store_val(mem0, size, !a);
        }
        Op::Neg => {
            let a = load_val(mem0, size);
            let res = 0u32.wrapping_sub(a);
            set_addsub_flags(vcpu, 0, a, res as u64, size, true);
            store_val(mem0, size, res);
        }
        Op::Test => {
            let a = load_val(mem0, size);
            let b = src_of(vcpu, &insn.op[1], mem1);
            set_zsp_flags(vcpu, a & b, size);
            vcpu.eflags &= !(Eflags::CF | Eflags::OF).bits();
        }
        Op::Stos => {
            let v = reg_read(vcpu, 0, insn.opsize);
            store_val(mem0, size, v);
        }
        Op::Movs => {
            mem0[..size as usize].copy_from_slice(&mem1[..size as usize]);
        }
        Op::Lods => {
            let v = load_val(mem0, size);
            reg_write(vcpu, 0, insn.opsize, v);
        }
        Op::Scas => {
            let a = reg_read(vcpu, 0, insn.opsize);
            let b = load_val(mem0, size);
            let res = (a as u64).wrapping_sub(b as u64);
            set_addsub_flags(vcpu, a, b, res, size, true);
        }
        Op::Cmps => {
            let a = load_val(mem1, size);
            let b = load_val(mem0, size);
            let res = (a as u64).wrapping_sub(b as u64);
            set_addsub_flags(vcpu, a, b, res, size, true);
        }
        _ => return Err(SimFault::Unsupported),
    }
    Ok(())
}

/// Advances eip past the simulated instruction, stepping the string registers first. A
/// rep-prefixed string instruction stays on the prefix until its count runs out or the
/// cmps/scas termination predicate fires.
pub fn advance_eip(vcpu: &mut Vcpu, insn: &Insn) {
    let mut done = true;
    if insn.opc.is_string_op() {
        let size = insn.opsize as u32;
        let step = if vcpu.eflags & Eflags::DF.bits() != 0 {
            0u32.wrapping_sub(size)
        } else {
            size
        };
        let uses_esi = insn.is_movs_or_cmps() || insn.opc == Op::Lods;
        let uses_edi = insn.opc != Op::Lods;
        if insn.addrsize == 2 {
            if uses_esi {
                let si = (vcpu.regs[6] as u16).wrapping_add(step as u16);
                vcpu.regs[6] = (vcpu.regs[6] & !0xffff) | si as u32;
            }
            if uses_edi {
                let di = (vcpu.regs[7] as u16).wrapping_add(step as u16);
                vcpu.regs[7] = (vcpu.regs[7] & !0xffff) | di as u32;
            }
        } else {
            if uses_esi {
                vcpu.regs[6] = vcpu.regs[6].wrapping_add(step);
            }
            if uses_edi {
                vcpu.regs[7] = vcpu.regs[7].wrapping_add(step);
            }
        }
        if insn
            .prefixes
            .intersects(Prefixes::REPZ | Prefixes::REPNZ)
        {
            done = false;
            if insn.addrsize == 2 {
                let cx = (vcpu.regs[1] as u16).wrapping_sub(1);
                vcpu.regs[1] = (vcpu.regs[1] & !0xffff) | cx as u32;
                if cx == 0 {
                    done = true;
                }
            } else {
                vcpu.regs[1] = vcpu.regs[1].wrapping_sub(1);
                if vcpu.regs[1] == 0 {
                    done = true;
                }
            }
            if insn.is_cmps_or_scas() {
                let zf = vcpu.eflags & Eflags::ZF.bits() != 0;
                let repz = insn.prefixes.contains(Prefixes::REPZ);
                if (repz && !zf) || (!repz && zf) {
                    done = true;
                }
            }
        }
    }
    if done {
        vcpu.eip = vcpu.eip.wrapping_add(insn.len as u32);
    }
}

/// Builds the scratch-page image for native one-shot execution: the instruction with its
/// memory operands renamed to scratch displacements, followed by an indirect jump back to the
/// monitor. Kept byte-compatible with what the in-place execution path expects.
pub fn build_scratch_code(
    insn: &Insn,
    raw: &[u8],
    mem0_slot: u32,
    mem1_slot: u32,
    save_slot: u32,
    return_slot: u32,
) -> Result<Vec<u8>, Error> {
    let (mut code, _temp) =
        encode::rename_mem_operands_to_disps(insn, raw, mem0_slot, mem1_slot, save_slot)?;
    // jmp [return_slot]
    code.extend_from_slice(&[0xff, 0x25]);
    code.extend_from_slice(&return_slot.to_le_bytes());
    Ok(code)
}

/// Simulates one faulting guest instruction: loads copies of its memory operands, applies the
/// operation, writes back the changed bytes through the guest page tables, and advances eip.
pub fn simulate_faulting_instruction(
    ram: &mut GuestRam,
    vcpu: &mut Vcpu,
    decoder: &DecodeCtx,
    insn_bytes: &[u8],
) -> Result<SimResult, SimFault> {
    let insn = decoder
        .decode(insn_bytes, vcpu.eip, vcpu.operand_size())
        .map_err(|_| SimFault::Unsupported)?;

    // Stack-implicit forms: push and pop are the only ones that reach here, since calls and
    // returns are translated into explicit jumps.
    if insn.accesses_stack() && !matches!(insn.opc, Op::Push | Op::Pop) {
        return Err(SimFault::Unsupported);
    }
    if matches!(insn.opc, Op::Push | Op::Pop) {
        return simulate_stack_op(ram, vcpu, &insn);
    }

    let (memop0, memop1) = match insn.mem_operands() {
        (Some(m0), m1) => (*m0, m1.copied()),
        (None, _) => return Err(SimFault::Unsupported),
    };
    let size = insn.opsize as u32;
    let vaddr0 = operand_evaluate(vcpu, &memop0);
    let vaddr1 = memop1.map(|m| operand_evaluate(vcpu, &m));

    let mut mem0 = [0u8; 8];
    let mut mem1 = [0u8; 8];
    for i in 0..size {
        mem0[i as usize] = ldub_simulate(ram, vcpu, vaddr0.wrapping_add(i))?;
        if let Some(v1) = vaddr1 {
            mem1[i as usize] = ldub_simulate(ram, vcpu, v1.wrapping_add(i))?;
        }
    }
    let mem0_copy = mem0;

    execute_copy(vcpu, &insn, &mut mem0, &mem1[..])?;

    // Write back only the bytes the operation changed.
    for i in 0..size {
        if mem0[i as usize] != mem0_copy[i as usize] {
            stb_simulate(ram, vcpu, vaddr0.wrapping_add(i), mem0[i as usize])?;
        }
    }
    advance_eip(vcpu, &insn);
    trace!(
        "simulated {} at {:#x}: addr {:#x} size {}",
        insn.opc.name(),
        vcpu.eip,
        vaddr0,
        size
    );
    Ok(SimResult {
        fault_addr: vaddr0,
        access_size: size,
    })
}

fn simulate_stack_op(
    ram: &mut GuestRam,
    vcpu: &mut Vcpu,
    insn: &Insn,
) -> Result<SimResult, SimFault> {
    let size = insn.opsize as u32;
    let ss_base = vcpu.segs[R_SS].base;
    match insn.opc {
        Op::Push => {
            let val = match &insn.op[0] {
                Operand::Reg { id, size, .. } => reg_read(vcpu, *id, *size),
                Operand::Imm { val, .. } => *val as u32,
                _ => return Err(SimFault::Unsupported),
            };
            let esp = vcpu.regs[4].wrapping_sub(size);
            let vaddr = ss_base.wrapping_add(esp);
            let mut bytes = [0u8; 4];
            store_val(&mut bytes, size, val);
            for i in 0..size {
                stb_simulate(ram, vcpu, vaddr.wrapping_add(i), bytes[i as usize])?;
            }
            vcpu.regs[4] = esp;
            vcpu.eip = vcpu.eip.wrapping_add(insn.len as u32);
            Ok(SimResult {
                fault_addr: vaddr,
                access_size: size,
            })
        }
        Op::Pop => {
            let esp = vcpu.regs[4];
            let vaddr = ss_base.wrapping_add(esp);
            let mut bytes = [0u8; 4];
            for i in 0..size {
                bytes[i as usize] = ldub_simulate(ram, vcpu, vaddr.wrapping_add(i))?;
            }
            let val = load_val(&bytes, size);
            match &insn.op[0] {
                Operand::Reg { id, size, .. } => reg_write(vcpu, *id, *size, val),
                _ => return Err(SimFault::Unsupported),
            }
            vcpu.regs[4] = esp.wrapping_add(size);
            vcpu.eip = vcpu.eip.wrapping_add(insn.len as u32);
            Ok(SimResult {
                fault_addr: vaddr,
                access_size: size,
            })
        }
        _ => Err(SimFault::Unsupported),
    }
}

/// Whether a memory operand addresses monitor-private memory (a GS override that was left in
/// place by the translator redirects to the monitor block, never to guest state).
pub fn operand_is_monitor_memaddr(insn: &Insn, mem: &MemOperand) -> bool {
    mem.segtype == SegType::Sel
        && mem.seg == crate::arch::x86::R_GS as u32
        && insn.prefixes.contains(Prefixes::GS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::Segment;
    use crate::insn::decode::decode;

    fn setup() -> (GuestRam, Vcpu, DecodeCtx) {
        let mut vcpu = Vcpu::default();
        vcpu.reset();
        // Flat protected-mode-ish segments, paging off.
        for seg in vcpu.segs.iter_mut() {
            *seg = Segment {
                selector: 0x08,
                base: 0,
                limit: 0xffff_ffff,
                flags: crate::arch::x86::DESC_B_MASK,
            };
        }
        vcpu.cr[0] |= 1; // protected, paging off
        (GuestRam::new(0x10000).unwrap(), vcpu, DecodeCtx::new())
    }

    #[test]
    fn simulates_mov_store() {
        let (mut ram, mut vcpu, dec) = setup();
        vcpu.regs[3] = 0x2000; // ebx
        vcpu.eip = 0x500;
        // mov [ebx+4], eax
        vcpu.regs[0] = 0xa1b2_c3d4;
        let r = simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &[0x89, 0x43, 0x04])
            .unwrap();
        assert_eq!(r.fault_addr, 0x2004);
        assert_eq!(r.access_size, 4);
        assert_eq!(ram.ldl(0x2004).unwrap(), 0xa1b2_c3d4);
        assert_eq!(vcpu.eip, 0x503);
    }

    #[test]
    fn simulates_add_to_memory_with_flags() {
        let (mut ram, mut vcpu, dec) = setup();
        ram.stl(0x3000, 0xffff_ffff).unwrap();
        vcpu.regs[0] = 1;
        // add [0x3000], eax
        simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &[0x01, 0x05, 0x00, 0x30, 0, 0])
            .unwrap();
        assert_eq!(ram.ldl(0x3000).unwrap(), 0);
        assert_ne!(vcpu.eflags & Eflags::ZF.bits(), 0);
        assert_ne!(vcpu.eflags & Eflags::CF.bits(), 0);
    }

    #[test]
    fn rep_stos_steps_and_stays_on_prefix() {
        let (mut ram, mut vcpu, dec) = setup();
        vcpu.eip = 0x100;
        vcpu.regs[0] = 0xab; // al
        vcpu.regs[1] = 2; // ecx
        vcpu.regs[7] = 0x4000; // edi
        let bytes = [0xf3, 0xaa]; // rep stosb
        simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &bytes).unwrap();
        assert_eq!(ram.ldub(0x4000).unwrap(), 0xab);
        assert_eq!(vcpu.regs[7], 0x4001);
        assert_eq!(vcpu.regs[1], 1);
        // Count not yet exhausted: eip stays on the rep prefix.
        assert_eq!(vcpu.eip, 0x100);
        simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &bytes).unwrap();
        assert_eq!(vcpu.regs[1], 0);
        assert_eq!(vcpu.eip, 0x102);
    }

    #[test]
    fn repe_cmps_terminates_on_mismatch() {
        let (mut ram, mut vcpu, dec) = setup();
        vcpu.eip = 0x100;
        ram.stb(0x1000, 5).unwrap();
        ram.stb(0x2000, 6).unwrap();
        vcpu.regs[1] = 10;
        vcpu.regs[6] = 0x1000;
        vcpu.regs[7] = 0x2000;
        // repe cmpsb: first comparison differs, so ZF clears and the loop ends.
        simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &[0xf3, 0xa6]).unwrap();
        assert_eq!(vcpu.regs[1], 9);
        assert_eq!(vcpu.eip, 0x102);
        assert_eq!(vcpu.eflags & Eflags::ZF.bits(), 0);
    }

    #[test]
    fn direction_flag_steps_down() {
        let (mut ram, mut vcpu, dec) = setup();
        vcpu.eflags |= Eflags::DF.bits();
        vcpu.regs[0] = 0x11;
        vcpu.regs[7] = 0x4000;
        simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &[0xaa]).unwrap();
        assert_eq!(vcpu.regs[7], 0x3fff);
    }

    #[test]
    fn push_targets_stack_and_rolls_esp() {
        let (mut ram, mut vcpu, dec) = setup();
        vcpu.regs[4] = 0x8000;
        vcpu.regs[2] = 0x1234_5678;
        // push edx
        let r = simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &[0x52]).unwrap();
        assert_eq!(vcpu.regs[4], 0x7ffc);
        assert_eq!(r.fault_addr, 0x7ffc);
        assert_eq!(ram.ldl(0x7ffc).unwrap(), 0x1234_5678);
    }

    #[test]
    fn nested_fault_reports_address() {
        let (mut ram, mut vcpu, dec) = setup();
        // Store far beyond RAM: the nested access fault surfaces.
        vcpu.regs[3] = 0xfff0_0000;
        let err =
            simulate_faulting_instruction(&mut ram, &mut vcpu, &dec, &[0x89, 0x03]).unwrap_err();
        assert!(matches!(err, SimFault::Nested(0xfff0_0000)));
    }

    #[test]
    fn scratch_code_ends_with_indirect_return() {
        let insn = decode(&[0x89, 0x03], 0, 4).unwrap();
        let code = build_scratch_code(&insn, &[0x89, 0x03], 0x100, 0x108, 0x110, 0x118).unwrap();
        let n = code.len();
        assert_eq!(&code[n - 6..n - 4], &[0xff, 0x25]);
        assert_eq!(&code[n - 4..], &0x118u32.to_le_bytes());
    }
}
