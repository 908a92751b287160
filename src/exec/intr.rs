//! Interrupt and exception plumbing: reflecting vectors into the guest through its IVT or
//! IDT, and delivering pending hardware interrupts at safe points.

use log::{debug, trace};

use crate::arch::x86::{
    seg_base, seg_dpl, seg_limit, sp_mask, Eflags, Segment, DESC_B_MASK, DESC_CS_MASK,
    DESC_P_MASK, DESC_S_MASK, R_CS, R_SS,
};
use crate::error::{Error, GuestExc};
use crate::monitor::Monitor;
use crate::vcpu::CPU_INTERRUPT_HARD;

/// The software-interrupt vector reserved for forced callouts.
pub const FORCED_CALLOUT: u8 = 255;

/// Raises a guest interrupt or exception: the architectural entry into the guest handler is
/// performed immediately and the next eip is left in the vcpu.
pub fn raise_interrupt(
    mon: &mut Monitor,
    intno: u8,
    is_int_insn: bool,
    error_code: Option<u32>,
    next_eip: u32,
) -> Result<(), Error> {
    if mon.rr.recording() || mon.rr.replaying() {
        trace!(
            "intr {:#x} at n_exec {:#x}",
            intno,
            mon.vcpu.n_exec
        );
    }
    do_interrupt(mon, intno, is_int_insn, error_code, next_eip)
}

/// Reflects a guest exception produced deep in a helper.
pub fn raise_exception_err(mon: &mut Monitor, exc: GuestExc) -> Result<(), Error> {
    if let Some(cr2) = exc.cr2 {
        mon.vcpu.cr[2] = cr2;
    }
    debug!(
        "guest exception {} err {:?} cr2 {:?} at eip {:#x}",
        exc.vector, exc.error_code, exc.cr2, mon.vcpu.eip
    );
    do_interrupt(mon, exc.vector, false, exc.error_code, mon.vcpu.eip)
}

/// Performs the architectural interrupt entry.
pub fn do_interrupt(
    mon: &mut Monitor,
    intno: u8,
    is_int_insn: bool,
    error_code: Option<u32>,
    next_eip: u32,
) -> Result<(), Error> {
    if mon.vcpu.protected_mode() {
        do_interrupt_protected(mon, intno, is_int_insn, error_code, next_eip)
    } else {
        do_interrupt_real(mon, intno, next_eip)
    }
}

/// Real-mode entry: push flags/cs/ip, fetch cs:ip from the IVT, clear IF and TF.
fn do_interrupt_real(mon: &mut Monitor, intno: u8, next_eip: u32) -> Result<(), Error> {
    let ivt = mon.vcpu.idt.base;
    let off = mon.ld_phys_w(ivt + intno as u32 * 4)?;
    let sel = mon.ld_phys_w(ivt + intno as u32 * 4 + 2)?;

    let flags = mon.compose_eflags();
    mon.push16(flags as u16)?;
    mon.push16(mon.vcpu.segs[R_CS].selector as u16)?;
    mon.push16(next_eip as u16)?;

    mon.vcpu.intr_flag = 0;
    mon.vcpu.eflags &= !Eflags::TF.bits();
    mon.vcpu.segs[R_CS] = Segment::real_mode(sel);
    mon.vcpu.eip = off as u32;
    Ok(())
}

/// Protected-mode entry through an IDT gate: privilege checks, optional stack switch, frame
/// push, and transfer to the handler.
fn do_interrupt_protected(
    mon: &mut Monitor,
    intno: u8,
    is_int_insn: bool,
    error_code: Option<u32>,
    next_eip: u32,
) -> Result<(), Error> {
    let idt = mon.vcpu.idt;
    let offset = intno as u32 * 8;
    if offset + 7 > idt.limit {
        return mon.reflect_or_fail(GuestExc::gp(intno as u32 * 8 + 2));
    }
    let e1 = mon.ld_kernel_l(idt.base + offset)?;
    let e2 = mon.ld_kernel_l(idt.base + offset + 4)?;
    let gate_type = (e2 >> 8) & 0x1f;
    let (is_intr_gate, gate32) = match gate_type {
        0x6 => (true, false),  // 16-bit interrupt gate
        0x7 => (false, false), // 16-bit trap gate
        0xe => (true, true),   // 32-bit interrupt gate
        0xf => (false, true),  // 32-bit trap gate
        _ => return mon.reflect_or_fail(GuestExc::gp(intno as u32 * 8 + 2)),
    };
    let dpl = seg_dpl(e2);
    let cpl = mon.vcpu.privilege_level();
    if is_int_insn && dpl < cpl {
        return mon.reflect_or_fail(GuestExc::gp(intno as u32 * 8 + 2));
    }
    if e2 & DESC_P_MASK == 0 {
        return mon.reflect_or_fail(GuestExc::np(intno as u32 * 8 + 2));
    }
    let selector = e1 >> 16;
    let mut entry = (e1 & 0xffff) | (e2 & 0xffff_0000);
    if !gate32 {
        entry &= 0xffff;
    }

    // Read the target code descriptor.
    let (cs1, cs2) = mon.read_descriptor(selector)?;
    if cs2 & DESC_S_MASK == 0 || cs2 & DESC_CS_MASK == 0 {
        return mon.reflect_or_fail(GuestExc::gp(selector & 0xfffc));
    }
    let cs_dpl = seg_dpl(cs2);
    if cs_dpl > cpl {
        return mon.reflect_or_fail(GuestExc::gp(selector & 0xfffc));
    }

    let old_flags = mon.compose_eflags();
    let old_cs = mon.vcpu.segs[R_CS].selector;
    let old_ss = mon.vcpu.segs[R_SS].selector;
    let old_esp = mon.vcpu.regs[4];

    if cs_dpl < cpl {
        // Inter-privilege: switch to the stack from the TSS.
        let (new_ss, new_esp) = mon.tss_stack_for(cs_dpl)?;
        let (ss1, ss2) = mon.read_descriptor(new_ss)?;
        mon.vcpu.segs[R_SS] = Segment {
            selector: new_ss,
            base: seg_base(ss1, ss2),
            limit: seg_limit(ss1, ss2),
            flags: ss2,
        };
        mon.vcpu.regs[4] = new_esp;
        mon.push32(old_ss)?;
        mon.push32(old_esp)?;
    }

    mon.push32(old_flags)?;
    mon.push32(old_cs)?;
    mon.push32(next_eip)?;
    if let Some(err) = error_code {
        mon.push32(err)?;
    }

    if is_intr_gate {
        mon.vcpu.intr_flag = 0;
    }
    mon.vcpu.eflags &= !(Eflags::TF | Eflags::NT | Eflags::RF).bits();
    mon.vcpu.segs[R_CS] = Segment {
        selector,
        base: seg_base(cs1, cs2),
        limit: seg_limit(cs1, cs2),
        flags: cs2,
    };
    mon.vcpu.eip = entry;
    trace!(
        "protected interrupt {:#x}: cs {:#x} eip {:#x} (gate dpl {}, cpl {} -> {})",
        intno,
        selector,
        entry,
        dpl,
        cpl,
        cs_dpl
    );
    Ok(())
}

/// Delivers one pending hardware interrupt if IF is open and the current eip is not
/// blacklisted by micro-replay. Returns whether a vector was injected.
pub fn handle_pending_interrupts(mon: &mut Monitor) -> Result<bool, Error> {
    if mon.vcpu.intr_flag != 1 {
        return Ok(false);
    }
    if mon.vcpu.interrupt_request & CPU_INTERRUPT_HARD == 0 {
        return Ok(false);
    }
    if mon.blacklist.contains(mon.vcpu.eip) {
        return Ok(false);
    }
    let intno = mon.pic.read_irq();
    match intno {
        Some(vector) => {
            if mon.rr.recording() {
                let n_exec = mon.vcpu.n_exec;
                let eip = mon.vcpu.eip;
                mon.rr.log_interrupt(vector, 0, n_exec, eip)?;
            }
            raise_interrupt(mon, vector, false, None, 0)?;
            mon.vcpu.halted = false;
            Ok(true)
        }
        None => {
            // Spurious: drop the request.
            mon.vcpu.interrupt_request &= !CPU_INTERRUPT_HARD;
            Ok(false)
        }
    }
}

/// Computes the stack-pointer mask the current stack segment implies.
pub fn current_sp_mask(vcpu: &crate::vcpu::Vcpu) -> u32 {
    if !vcpu.protected_mode() {
        0xffff
    } else {
        sp_mask(vcpu.segs[R_SS].flags)
    }
}

/// The default-operand-size bit of the current code segment.
pub fn code_is_32bit(vcpu: &crate::vcpu::Vcpu) -> bool {
    vcpu.segs[R_CS].flags & DESC_B_MASK != 0
}
