//! The callout dispatcher: monitor-resident handlers for every privileged operation that
//! translated code cannot retire on its own. Translated snippets store a [`Callout`] id and
//! its arguments in the shared block; the driver loop invokes [`dispatch_callout`] with the
//! stated arity.

use log::trace;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::arch::x86::{
    seg_base, seg_dpl, seg_limit, Eflags, Segment, CR0_PE, DESC_CS_MASK, DESC_P_MASK,
    DESC_S_MASK, DESC_W_MASK, R_CS, R_SS,
};
use crate::error::{Error, GuestExc};
use crate::monitor::Monitor;

use super::intr::raise_interrupt;

/// Every monitor-resident handler reachable from translated code. The discriminants are part
/// of the emitted-code ABI (the snippet stores `id + 1`; zero means no callout pending).
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Callout {
    MovToCr0 = 0,
    MovToCr3 = 1,
    MovToCr = 2,
    MovFromCr = 3,
    In = 4,
    Ins = 5,
    Out = 6,
    Outs = 7,
    Int = 8,
    Into = 9,
    Hlt = 10,
    Ljmp = 11,
    LjmpMem = 12,
    Lcall = 13,
    LcallMem = 14,
    Lret = 15,
    Iret = 16,
    JmpNearMem = 17,
    CallNearMem = 18,
    Ltr = 19,
    Lldt = 20,
    Lgdt = 21,
    Lidt = 22,
    MovToSeg = 23,
    MovToSegMem = 24,
    MovFromSeg = 25,
    PushSeg = 26,
    PopSeg = 27,
    Lxs = 28,
    RealMovs = 29,
    RealStos = 30,
    RealLods = 31,
    RealScas = 32,
    RealCmps = 33,
    Pushf = 34,
    Popf = 35,
    Invd = 36,
    Nop = 37,
}

/// Resolves the packed memory-operand arguments of a memory-form callout:
/// `(seg, base + 1 | 0, index + 1 | 0, scale, disp)` evaluated against the live registers.
fn mem_arg_addr(mon: &Monitor, args: &[u32]) -> u32 {
    let seg = args[0] as usize;
    let mut addr: u32 = 0;
    if args[1] != 0 {
        addr = addr.wrapping_add(mon.vcpu.regs[(args[1] - 1) as usize]);
    }
    if args[2] != 0 {
        addr = addr.wrapping_add(mon.vcpu.regs[(args[2] - 1) as usize].wrapping_mul(args[3]));
    }
    addr = addr.wrapping_add(args[4]);
    if !mon.vcpu.protected_mode() {
        addr &= 0xffff;
    }
    mon.vcpu.segs[seg].base.wrapping_add(addr)
}

/// Invokes the handler for `callout` with its arguments. The handler leaves the next guest
/// eip in `vcpu.eip`.
pub fn dispatch_callout(mon: &mut Monitor, callout: Callout, args: &[u32]) -> Result<(), Error> {
    trace!("callout {:?}({:x?}) at eip {:#x}", callout, args, mon.vcpu.eip);
    mon.stats.callouts += 1;
    match callout {
        Callout::MovToCr0 => callout_mov_to_cr0(mon, args[0], args[1]),
        Callout::MovToCr3 => callout_mov_to_cr3(mon, args[0], args[1]),
        Callout::MovToCr => {
            mon.vcpu.cr[args[1] as usize] = args[0];
            mon.set_next_eip(args[2]);
            Ok(())
        }
        Callout::MovFromCr => {
            mon.vcpu.regs[args[1] as usize] = mon.vcpu.cr[args[0] as usize];
            Ok(())
        }
        Callout::In => callout_in(mon, args[0], args[1]),
        Callout::Ins => callout_ins(mon, args[0], args[1]),
        Callout::Out => callout_out(mon, args[0], args[1]),
        Callout::Outs => callout_outs(mon, args[0], args[1]),
        Callout::Int => {
            mon.set_next_eip(args[1]);
            raise_interrupt(mon, args[0] as u8, true, None, args[1])
        }
        Callout::Into => {
            mon.set_next_eip(args[0]);
            if mon.vcpu.eflags & Eflags::OF.bits() != 0 {
                raise_interrupt(mon, 4, true, None, args[0])?;
            }
            Ok(())
        }
        Callout::Hlt => {
            mon.set_next_eip(args[0]);
            mon.vcpu.halted = true;
            Ok(())
        }
        Callout::Ljmp => callout_ljmp(mon, args[0], args[1]),
        Callout::LjmpMem => {
            let (sel, off) = read_far_pointer(mon, args)?;
            callout_ljmp(mon, sel, off)
        }
        Callout::Lcall => callout_lcall(mon, args[0], args[1], args[2]),
        Callout::LcallMem => {
            let (sel, off) = read_far_pointer(mon, args)?;
            callout_lcall(mon, sel, off, args[6])
        }
        Callout::Lret => callout_lret(mon, args[0]),
        Callout::Iret => callout_iret(mon),
        Callout::JmpNearMem => {
            let addr = mem_arg_addr(mon, args);
            let target = mon.ld_kernel_w(addr)? as u32;
            mon.set_next_eip(target);
            Ok(())
        }
        Callout::CallNearMem => {
            let addr = mem_arg_addr(mon, args);
            let target = mon.ld_kernel_w(addr)? as u32;
            mon.push16(args[5] as u16)?;
            mon.set_next_eip(target);
            Ok(())
        }
        Callout::Ltr => callout_ltr(mon, args[0]),
        Callout::Lldt => callout_lldt(mon, args[0]),
        Callout::Lgdt => callout_load_dt(mon, args, false),
        Callout::Lidt => callout_load_dt(mon, args, true),
        Callout::MovToSeg => {
            let fallthrough = mon.vcpu.eip;
            load_seg_checked(mon, args[0] as usize, args[1])?;
            mon.set_next_eip(fallthrough);
            Ok(())
        }
        Callout::MovToSegMem => {
            let addr = mem_arg_addr(mon, &args[1..6]);
            let val = mon.ld_kernel_w(addr)? as u32;
            load_seg_checked(mon, args[0] as usize, val)?;
            mon.set_next_eip(args[6]);
            Ok(())
        }
        Callout::MovFromSeg => {
            let sel = mon.guest_selector(args[0] as usize);
            let r = &mut mon.vcpu.regs[args[1] as usize];
            *r = (*r & !0xffff) | (sel & 0xffff);
            Ok(())
        }
        Callout::PushSeg => {
            let sel = mon.guest_selector(args[0] as usize);
            if mon.operand32() {
                mon.push32(sel)?;
            } else {
                mon.push16(sel as u16)?;
            }
            Ok(())
        }
        Callout::PopSeg => {
            let val = if mon.operand32() {
                mon.pop32()?
            } else {
                mon.pop16()? as u32
            };
            let fallthrough = mon.vcpu.eip;
            load_seg_checked(mon, args[0] as usize, val)?;
            mon.set_next_eip(fallthrough);
            Ok(())
        }
        Callout::Lxs => callout_lxs(mon, args),
        Callout::RealMovs => callout_real_string(mon, StringOp::Movs, args[0], args[1]),
        Callout::RealStos => callout_real_string(mon, StringOp::Stos, args[0], args[1]),
        Callout::RealLods => callout_real_string(mon, StringOp::Lods, args[0], args[1]),
        Callout::RealScas => callout_real_string(mon, StringOp::Scas, args[0], args[1]),
        Callout::RealCmps => callout_real_string(mon, StringOp::Cmps, args[0], args[1]),
        Callout::Pushf => {
            let flags = mon.compose_eflags();
            if mon.operand32() {
                mon.push32(flags)?;
            } else {
                mon.push16(flags as u16)?;
            }
            Ok(())
        }
        Callout::Popf => callout_popf(mon),
        Callout::Invd | Callout::Nop => Ok(()),
    }
}

fn callout_mov_to_cr0(mon: &mut Monitor, val: u32, fallthrough: u32) -> Result<(), Error> {
    let was = mon.vcpu.cr[0];
    mon.vcpu.cr[0] = val;
    if (was ^ val) & (CR0_PE | crate::arch::x86::CR0_PG) != 0 {
        mon.shadow_pagedir_sync()?;
    }
    mon.set_next_eip(fallthrough);
    Ok(())
}

fn callout_mov_to_cr3(mon: &mut Monitor, paddr: u32, fallthrough: u32) -> Result<(), Error> {
    if mon.vcpu.cr[3] != paddr {
        mon.vcpu.cr[3] = paddr;
        mon.shadow_pagedir_sync()?;
        mon.jumptables_clear();
    }
    mon.set_next_eip(fallthrough);
    Ok(())
}

fn callout_in(mon: &mut Monitor, port: u32, size: u32) -> Result<(), Error> {
    let val = mon.io_in(port as u16, size)?;
    let r = &mut mon.vcpu.regs[0];
    match size {
        1 => *r = (*r & !0xff) | (val & 0xff),
        2 => *r = (*r & !0xffff) | (val & 0xffff),
        _ => *r = val,
    }
    Ok(())
}

fn callout_out(mon: &mut Monitor, port: u32, size: u32) -> Result<(), Error> {
    let mask = match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    };
    let val = mon.vcpu.regs[0] & mask;
    mon.io_out(port as u16, size, val)
}

fn callout_ins(mon: &mut Monitor, size: u32, prefix: u32) -> Result<(), Error> {
    let rep = prefix != 0;
    let mut count = if rep { mon.vcpu.regs[1] } else { 1 };
    if !mon.vcpu.protected_mode() {
        count &= 0xffff;
    }
    mon.vcpu.segcache_sync(crate::arch::x86::R_ES);
    let port = mon.vcpu.regs[2] as u16;
    let buf = mon.io_ins(port, size, count)?;
    let base = mon.vcpu.segs[crate::arch::x86::R_ES].base;
    let edi = mon.vcpu.regs[7];
    mon.st_kernel_bytes(base.wrapping_add(edi), &buf)?;
    mon.vcpu.regs[7] = edi.wrapping_add(count * size);
    if rep {
        mon.vcpu.regs[1] -= count;
    }
    Ok(())
}

fn callout_outs(mon: &mut Monitor, size: u32, prefix: u32) -> Result<(), Error> {
    let rep = prefix != 0;
    let mut count = if rep { mon.vcpu.regs[1] } else { 1 };
    if !mon.vcpu.protected_mode() {
        count &= 0xffff;
    }
    mon.vcpu.segcache_sync(crate::arch::x86::R_DS);
    let base = mon.vcpu.segs[crate::arch::x86::R_DS].base;
    let esi = mon.vcpu.regs[6];
    let buf = mon.ld_kernel_bytes(base.wrapping_add(esi), count * size)?;
    let port = mon.vcpu.regs[2] as u16;
    mon.io_outs(port, size, count, &buf)?;
    mon.vcpu.regs[6] = esi.wrapping_add(count * size);
    if rep {
        mon.vcpu.regs[1] -= count;
    }
    Ok(())
}

fn read_far_pointer(mon: &mut Monitor, args: &[u32]) -> Result<(u32, u32), Error> {
    let addr = mem_arg_addr(mon, args);
    let opsize = args[5];
    let off = if opsize == 2 {
        mon.ld_kernel_w(addr)? as u32
    } else {
        mon.ld_kernel_l(addr)?
    };
    let sel = mon.ld_kernel_w(addr + opsize)? as u32;
    Ok((sel, off))
}

/// Loads CS for a far transfer, real or protected.
fn load_cs_far(mon: &mut Monitor, sel: u32, off: u32) -> Result<(), Error> {
    if !mon.vcpu.protected_mode() {
        mon.vcpu.segs[R_CS] = Segment::real_mode(sel as u16);
        mon.vcpu.orig_segs[R_CS] = sel;
        mon.set_next_eip(off & 0xffff);
        return Ok(());
    }
    if sel & 0xfffc == 0 {
        return Err(GuestExc::gp(0).into());
    }
    let (e1, e2) = mon.read_descriptor(sel)?;
    if e2 & DESC_S_MASK == 0 || e2 & DESC_CS_MASK == 0 {
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    if e2 & DESC_P_MASK == 0 {
        return Err(GuestExc::np(sel).into());
    }
    let cpl = mon.vcpu.privilege_level();
    let dpl = seg_dpl(e2);
    let conforming = e2 & crate::arch::x86::DESC_C_MASK != 0;
    if conforming {
        if dpl > cpl {
            return Err(GuestExc::gp(sel & 0xfffc).into());
        }
    } else if dpl != cpl {
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    mon.vcpu.segs[R_CS] = Segment {
        selector: (sel & !3) | cpl,
        base: seg_base(e1, e2),
        limit: seg_limit(e1, e2),
        flags: e2,
    };
    mon.set_next_eip(off);
    Ok(())
}

fn callout_ljmp(mon: &mut Monitor, sel: u32, off: u32) -> Result<(), Error> {
    load_cs_far(mon, sel, off)
}

fn callout_lcall(mon: &mut Monitor, sel: u32, off: u32, fallthrough: u32) -> Result<(), Error> {
    let old_cs = mon.vcpu.segs[R_CS].selector;
    if mon.operand32() {
        mon.push32(old_cs)?;
        mon.push32(fallthrough)?;
    } else {
        mon.push16(old_cs as u16)?;
        mon.push16(fallthrough as u16)?;
    }
    load_cs_far(mon, sel, off)
}

fn callout_lret(mon: &mut Monitor, pop_bytes: u32) -> Result<(), Error> {
    let (off, sel) = if mon.operand32() {
        let off = mon.pop32()?;
        let sel = mon.pop32()?;
        (off, sel)
    } else {
        let off = mon.pop16()? as u32;
        let sel = mon.pop16()? as u32;
        (off, sel)
    };
    mon.vcpu.regs[4] = mon.vcpu.regs[4].wrapping_add(pop_bytes);
    load_cs_far(mon, sel, off)
}

fn callout_iret(mon: &mut Monitor) -> Result<(), Error> {
    if !mon.vcpu.protected_mode() {
        let off = mon.pop16()? as u32;
        let sel = mon.pop16()? as u32;
        let flags = mon.pop16()? as u32;
        mon.vcpu.segs[R_CS] = Segment::real_mode(sel as u16);
        mon.apply_eflags(flags, 0xffff);
        mon.set_next_eip(off);
        return Ok(());
    }
    let cpl = mon.vcpu.privilege_level();
    let (off, sel, flags) = if mon.operand32() {
        (mon.pop32()?, mon.pop32()?, mon.pop32()?)
    } else {
        (
            mon.pop16()? as u32,
            mon.pop16()? as u32,
            mon.pop16()? as u32,
        )
    };
    let rpl = sel & 3;
    if rpl > cpl {
        // Return to outer privilege: the frame continues with esp and ss.
        let new_esp = mon.pop32()?;
        let new_ss = mon.pop32()?;
        let (s1, s2) = mon.read_descriptor(new_ss)?;
        if s2 & DESC_S_MASK == 0 || s2 & DESC_CS_MASK != 0 || s2 & DESC_W_MASK == 0 {
            return Err(GuestExc::gp(new_ss & 0xfffc).into());
        }
        mon.vcpu.segs[R_SS] = Segment {
            selector: new_ss,
            base: seg_base(s1, s2),
            limit: seg_limit(s1, s2),
            flags: s2,
        };
        mon.vcpu.regs[4] = new_esp;
    }
    let (e1, e2) = mon.read_descriptor(sel)?;
    mon.vcpu.segs[R_CS] = Segment {
        selector: sel,
        base: seg_base(e1, e2),
        limit: seg_limit(e1, e2),
        flags: e2,
    };
    mon.apply_eflags(flags, 0xffff_ffff);
    mon.set_next_eip(off);
    Ok(())
}

fn callout_ltr(mon: &mut Monitor, val: u32) -> Result<(), Error> {
    let sel = val & 0xffff;
    if !mon.vcpu.protected_mode() {
        mon.vcpu.tr = Segment::real_mode(sel as u16);
        return Ok(());
    }
    if sel & 0xfffc == 0 {
        mon.vcpu.tr = Segment::default();
        return Ok(());
    }
    if sel & 0x4 != 0 {
        // The TR selector must reference the GDT.
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    let (e1, e2) = mon.read_descriptor(sel)?;
    let desc_type = (e2 >> 8) & 0xf;
    if e2 & DESC_S_MASK != 0 || (desc_type != 1 && desc_type != 9) {
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    if e2 & DESC_P_MASK == 0 {
        return Err(GuestExc::np(sel).into());
    }
    mon.vcpu.tr = Segment {
        selector: sel,
        base: seg_base(e1, e2),
        limit: seg_limit(e1, e2),
        flags: e2 | (1 << 9), // mark busy
    };
    Ok(())
}

fn callout_lldt(mon: &mut Monitor, val: u32) -> Result<(), Error> {
    let sel = val & 0xffff;
    if !mon.vcpu.protected_mode() {
        mon.vcpu.ldt = Segment::real_mode(sel as u16);
        return Ok(());
    }
    if sel & 0xfffc == 0 {
        mon.vcpu.ldt = Segment::default();
        return Ok(());
    }
    if sel & 0x4 != 0 {
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    let (e1, e2) = mon.read_descriptor(sel)?;
    if e2 & DESC_S_MASK != 0 || ((e2 >> 8) & 0xf) != 2 {
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    if e2 & DESC_P_MASK == 0 {
        return Err(GuestExc::np(sel).into());
    }
    mon.vcpu.ldt = Segment {
        selector: sel,
        base: seg_base(e1, e2),
        limit: seg_limit(e1, e2),
        flags: e2,
    };
    Ok(())
}

fn callout_load_dt(mon: &mut Monitor, args: &[u32], idt: bool) -> Result<(), Error> {
    let addr = mem_arg_addr(mon, args);
    let limit = mon.ld_kernel_w(addr)? as u32;
    let mut base = mon.ld_kernel_l(addr + 2)?;
    if !mon.operand32() {
        base &= 0x00ff_ffff;
    }
    let dt = crate::arch::x86::DescriptorTable { base, limit };
    if idt {
        mon.vcpu.idt = dt;
    } else {
        mon.vcpu.gdt = dt;
    }
    mon.set_next_eip(args[5]);
    Ok(())
}

/// Loads a data segment register with privilege checks, real or protected.
pub fn load_seg_checked(mon: &mut Monitor, segno: usize, val: u32) -> Result<(), Error> {
    let sel = val & 0xffff;
    mon.vcpu.orig_segs[segno] = sel;
    if !mon.vcpu.protected_mode() {
        mon.vcpu.segs[segno] = Segment::real_mode(sel as u16);
        mon.publish_seg_base(segno);
        return Ok(());
    }
    if sel & 0xfffc == 0 {
        // A null selector may be loaded into everything but SS.
        if segno == R_SS {
            return Err(GuestExc::gp(0).into());
        }
        mon.vcpu.segs[segno] = Segment {
            selector: sel,
            ..Segment::default()
        };
        mon.publish_seg_base(segno);
        return Ok(());
    }
    let (e1, e2) = mon.read_descriptor(sel)?;
    if e2 & DESC_S_MASK == 0 {
        return Err(GuestExc::gp(sel & 0xfffc).into());
    }
    let rpl = sel & 3;
    let cpl = mon.vcpu.privilege_level();
    let dpl = seg_dpl(e2);
    if segno == R_SS {
        if e2 & DESC_CS_MASK != 0 || e2 & DESC_W_MASK == 0 {
            return Err(GuestExc::gp(sel & 0xfffc).into());
        }
        if rpl != cpl || dpl != cpl {
            return Err(GuestExc::gp(sel & 0xfffc).into());
        }
        if e2 & DESC_P_MASK == 0 {
            return Err(GuestExc::ss(sel).into());
        }
    } else {
        let readable_code =
            e2 & DESC_CS_MASK != 0 && e2 & crate::arch::x86::DESC_R_MASK != 0;
        let data = e2 & DESC_CS_MASK == 0;
        if !data && !readable_code {
            return Err(GuestExc::gp(sel & 0xfffc).into());
        }
        let conforming = e2 & DESC_CS_MASK != 0 && e2 & crate::arch::x86::DESC_C_MASK != 0;
        if (data || !conforming) && dpl < rpl.max(cpl) {
            return Err(GuestExc::gp(sel & 0xfffc).into());
        }
        if e2 & DESC_P_MASK == 0 {
            return Err(GuestExc::np(sel).into());
        }
    }
    mon.vcpu.segs[segno] = Segment {
        selector: sel,
        base: seg_base(e1, e2),
        limit: seg_limit(e1, e2),
        flags: e2,
    };
    mon.publish_seg_base(segno);
    Ok(())
}

fn callout_lxs(mon: &mut Monitor, args: &[u32]) -> Result<(), Error> {
    let segno = args[0] as usize;
    let regno = args[1] as usize;
    let addr = mem_arg_addr(mon, &args[2..7]);
    let opsize = if mon.operand32() { 4 } else { 2 };
    let off = if opsize == 2 {
        mon.ld_kernel_w(addr)? as u32
    } else {
        mon.ld_kernel_l(addr)?
    };
    let sel = mon.ld_kernel_w(addr + opsize)? as u32;
    let fallthrough = args[7];
    load_seg_checked(mon, segno, sel)?;
    if opsize == 2 {
        let r = &mut mon.vcpu.regs[regno];
        *r = (*r & !0xffff) | (off & 0xffff);
    } else {
        mon.vcpu.regs[regno] = off;
    }
    mon.set_next_eip(fallthrough);
    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum StringOp {
    Movs,
    Stos,
    Lods,
    Scas,
    Cmps,
}

/// Real-mode string operations run to completion in the monitor, honoring the rep count and
/// the direction flag with 16-bit index arithmetic.
fn callout_real_string(
    mon: &mut Monitor,
    op: StringOp,
    size: u32,
    prefix: u32,
) -> Result<(), Error> {
    use crate::arch::x86::{R_DS, R_ES};
    let rep = prefix & (crate::insn::Prefixes::REPZ | crate::insn::Prefixes::REPNZ).bits() != 0;
    let repz = prefix & crate::insn::Prefixes::REPZ.bits() != 0;
    let mut count = if rep { mon.vcpu.regs[1] & 0xffff } else { 1 };
    let down = mon.vcpu.eflags & Eflags::DF.bits() != 0;
    let step = if down { 0u16.wrapping_sub(size as u16) } else { size as u16 };

    mon.vcpu.segcache_sync(R_ES);
    mon.vcpu.segcache_sync(R_DS);
    let es_base = mon.vcpu.segs[R_ES].base;
    let ds_base = mon.vcpu.segs[R_DS].base;

    while count > 0 {
        let si = mon.vcpu.regs[6] as u16;
        let di = mon.vcpu.regs[7] as u16;
        let src = ds_base.wrapping_add(si as u32);
        let dst = es_base.wrapping_add(di as u32);
        let mut terminate = false;
        match op {
            StringOp::Movs => {
                let v = mon.ld_kernel_sized(src, size)?;
                mon.st_kernel_sized(dst, size, v)?;
            }
            StringOp::Stos => {
                let v = mon.vcpu.regs[0] & size_mask(size);
                mon.st_kernel_sized(dst, size, v)?;
            }
            StringOp::Lods => {
                let v = mon.ld_kernel_sized(src, size)?;
                let r = &mut mon.vcpu.regs[0];
                *r = (*r & !size_mask(size)) | v;
            }
            StringOp::Scas => {
                let v = mon.ld_kernel_sized(dst, size)?;
                let a = mon.vcpu.regs[0] & size_mask(size);
                set_cmp_zf(mon, a, v);
                terminate = rep && ((repz) != (a == v));
            }
            StringOp::Cmps => {
                let a = mon.ld_kernel_sized(src, size)?;
                let b = mon.ld_kernel_sized(dst, size)?;
                set_cmp_zf(mon, a, b);
                terminate = rep && ((repz) != (a == b));
            }
        }
        if matches!(op, StringOp::Movs | StringOp::Lods | StringOp::Cmps) {
            let si2 = si.wrapping_add(step);
            mon.vcpu.regs[6] = (mon.vcpu.regs[6] & !0xffff) | si2 as u32;
        }
        if matches!(op, StringOp::Movs | StringOp::Stos | StringOp::Scas | StringOp::Cmps) {
            let di2 = di.wrapping_add(step);
            mon.vcpu.regs[7] = (mon.vcpu.regs[7] & !0xffff) | di2 as u32;
        }
        count -= 1;
        if rep {
            let cx = (mon.vcpu.regs[1] as u16).wrapping_sub(1);
            mon.vcpu.regs[1] = (mon.vcpu.regs[1] & !0xffff) | cx as u32;
        }
        if terminate {
            break;
        }
    }
    Ok(())
}

fn size_mask(size: u32) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

fn set_cmp_zf(mon: &mut Monitor, a: u32, b: u32) {
    if a == b {
        mon.vcpu.eflags |= Eflags::ZF.bits();
    } else {
        mon.vcpu.eflags &= !Eflags::ZF.bits();
    }
    if a < b {
        mon.vcpu.eflags |= Eflags::CF.bits();
    } else {
        mon.vcpu.eflags &= !Eflags::CF.bits();
    }
}

fn callout_popf(mon: &mut Monitor) -> Result<(), Error> {
    let (val, mask) = if mon.operand32() {
        (mon.pop32()?, 0xffff_ffff)
    } else {
        (mon.pop16()? as u32, 0xffff)
    };
    mon.apply_eflags(val, mask);
    Ok(())
}

/// Decodes a callout id stored in the shared block (`0` means none).
pub fn callout_from_raw(raw: u32) -> Option<Callout> {
    if raw == 0 {
        None
    } else {
        Callout::from_u32(raw - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callout_ids_roundtrip_through_shared_encoding() {
        for &c in &[
            Callout::MovToCr0,
            Callout::In,
            Callout::Iret,
            Callout::RealCmps,
            Callout::Nop,
        ] {
            assert_eq!(callout_from_raw(c as u32 + 1), Some(c));
        }
        assert_eq!(callout_from_raw(0), None);
    }
}
