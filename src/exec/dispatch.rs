//! The driver loop: acquires the translation for the current guest eip, chains edges, delivers
//! pending interrupts, enters translated code and dispatches on the [`ExitReason`] it comes
//! back with. This is the explicit state machine that replaces the original's
//! setjmp/longjmp unwind.

use log::{debug, info, trace};

use crate::error::Error;
use crate::exec::callout::dispatch_callout;
use crate::exec::intr::{handle_pending_interrupts, raise_exception_err, raise_interrupt};
use crate::exec::layout::{GS_EFLAGS, GS_ENTER_TARGET, GS_HOST_ESP, GS_REGS};
use crate::monitor::Monitor;
use crate::peep::Emitter;
use crate::rr::log::LogTag;
use crate::rr::micro::MrepAction;
use crate::rr::replay::{ReplayEvent, RunOutcome};
use crate::tb::cache::TbHandle;
use crate::vcpu::{ExitReason, EDGE_NONE};

/// How many guest instructions pass between periodic `MS` snapshot records.
pub const MS_SNAPSHOT_INTERVAL: u64 = 1 << 22;

/// Emits the entry/exit trampolines into a code buffer. The entry stub saves the host
/// context, loads the guest register file and flags from the shared block and jumps into the
/// cache; the exit stub (the `monitor_eip` target) is its exact inverse.
pub fn build_trampolines(e: &mut Emitter) -> (u32, u32) {
    let entry = e.off() as u32;
    // pusha ; pushf: host context onto the host stack.
    e.byte(0x60);
    e.byte(0x9c);
    // mov gs:[host_esp], esp
    e.gs_store_reg(GS_HOST_ESP, 4);
    // push dword gs:[eflags] ; popf: guest flags in.
    e.bytes(&[0x65, 0xff, 0x35]);
    e.imm32(GS_EFLAGS);
    e.byte(0x9d);
    // Guest registers in, esp last.
    for reg in [0u8, 1, 2, 3, 5, 6, 7, 4] {
        e.gs_load_reg(reg, GS_REGS + 4 * reg as u32);
    }
    e.gs_jmp_indirect(GS_ENTER_TARGET);

    let exit = e.off() as u32;
    // Guest registers out, esp first so the host stack comes back early.
    for reg in [4u8, 0, 1, 2, 3, 5, 6, 7] {
        e.gs_store_reg(GS_REGS + 4 * reg as u32, reg);
    }
    // mov esp, gs:[host_esp]
    e.gs_load_reg(4, GS_HOST_ESP);
    // pushf ; pop dword gs:[eflags]: guest flags out.
    e.byte(0x9c);
    e.bytes(&[0x65, 0x8f, 0x05]);
    e.imm32(GS_EFLAGS);
    // popf ; popa ; ret: host context back, returning into `enter_tb`.
    e.byte(0x9d);
    e.byte(0x61);
    e.byte(0xc3);
    (entry, exit)
}

/// Enters translated code at the given cache offset and runs until it exits back through the
/// monitor trampoline. Host faults and forced callouts arrive through the embedder's trap
/// hook (see [`deliver_host_trap`]) rather than through this call.
///
/// # Safety
///
/// The caller must have synchronized the shared block, and the GS base must cover it. Only
/// meaningful when the host ISA is the guest ISA.
#[cfg(target_arch = "x86")]
unsafe fn enter_tb(mon: &mut Monitor, tc_off: u32) -> Result<ExitReason, Error> {
    let base = mon.tc_ref().as_ptr() as usize as u32;
    mon.shared
        .write(GS_ENTER_TARGET, base.wrapping_add(tc_off));
    mon.shared.write(
        crate::exec::layout::GS_MONITOR_EIP,
        base.wrapping_add(mon.trampoline_exit),
    );
    let entry = base.wrapping_add(mon.trampoline_entry) as usize;
    let f: extern "C" fn() = std::mem::transmute(entry);
    f();
    Ok(ExitReason::Normal)
}

#[cfg(not(target_arch = "x86"))]
unsafe fn enter_tb(_mon: &mut Monitor, _tc_off: u32) -> Result<ExitReason, Error> {
    Err(Error::UnsupportedHost)
}

/// Prepares the next block: runs deferred frees, consumes due replay events, resolves (or
/// translates) the block for the current eip, publishes it in the jump tables and chains the
/// edge taken out of the previous block.
///
/// `Ok(Err(outcome))` means the run is over.
pub fn prepare_block(mon: &mut Monitor) -> Result<Result<TbHandle, RunOutcome>, Error> {
    mon.process_exit_callbacks()?;

    // Micro-replay triggers: the periodic one, and the guest panic entry point.
    if let Some(panic_eip) = mon.config.panic_eip {
        if mon.rr.recording() && mon.vcpu.eip_virt() == panic_eip {
            info!("hit panic entry at {:#x}; micro-replaying", panic_eip);
            mon.rr.log_marker(LogTag::Panic)?;
            micro_replay_switch(mon)?;
        }
    }
    let n_exec = mon.vcpu.n_exec;
    if mon.mrep.check_periodic(n_exec, mon.rr.recording()) {
        debug!("{:#x}: periodic micro-replay", n_exec);
        micro_replay_switch(mon)?;
    }

    // Periodic snapshots during record, plus one per block in lockstep mode.
    if mon.rr.recording()
        && (mon.rr.lockstep || n_exec.wrapping_sub(mon.last_ms_snapshot) >= MS_SNAPSHOT_INTERVAL)
    {
        let snap = crate::vcpu::VcpuSnapshot::capture(&mon.vcpu);
        mon.rr.log_snapshot(&snap)?;
        mon.last_ms_snapshot = n_exec;
    }

    // Replay: consume everything that has become due at this clock.
    if mon.rr.replaying() {
        loop {
            let event = match mon.rr.poll_event(mon.vcpu.n_exec) {
                Ok(ev) => ev,
                Err(Error::ReplayDivergence(why)) => {
                    info!("replay divergence: {}", why);
                    return Ok(Err(RunOutcome::InsnCountMismatch));
                }
                Err(e) => return Err(e),
            };
            match event {
                Some(ReplayEvent::Interrupt(rec)) => {
                    let after = mon.rr.tell()?;
                    mon.observe_record(LogTag::Intr, after, rec.n_exec);
                    mon.stats.interrupts_injected += 1;
                    raise_interrupt(mon, rec.vector, false, None, 0)?;
                }
                Some(ReplayEvent::Snapshot(snap)) => {
                    if snap.n_exec == mon.vcpu.n_exec {
                        trace!("snapshot checkpoint at {:#x}", snap.n_exec);
                    }
                }
                Some(ReplayEvent::Mrep) => {
                    micro_replay_switch(mon)?;
                }
                Some(ReplayEvent::Panic) => {
                    if mon.mrep.mode() == crate::rr::RollbackMode::RolledBack {
                        // Still reproducing under the blacklist: refine further.
                        micro_replay_switch(mon)?;
                    } else {
                        return Ok(Err(RunOutcome::PanicReproduced));
                    }
                }
                Some(ReplayEvent::Exit) => return Ok(Err(RunOutcome::Normal)),
                None => break,
            }
        }
    }

    mon.vcpu.eip_executing = mon.vcpu.eip;

    // Remember the identity of the previous block before anything can evict it.
    let prev = if mon.vcpu.edge != EDGE_NONE {
        mon.tb_cache.find_tc(mon.vcpu.prev_tb_tc).and_then(|h| {
            mon.tb_cache
                .get(h)
                .map(|t| (h, t.eip_phys, t.eip_virt, mon.vcpu.edge as usize))
        })
    } else {
        None
    };

    let h = match mon.resolve_tb() {
        Ok(h) => h,
        Err(Error::Guest(exc)) => {
            // The instruction fetch itself faulted; reflect and retry with the new eip.
            raise_exception_err(mon, exc)?;
            return prepare_block(mon);
        }
        Err(e) => return Err(e),
    };
    let (tc_off, eip) = {
        let tb = mon.tb_cache.get(h).expect("freshly resolved block");
        (tb.tc_off, tb.eip)
    };
    let entry_addr = mon.tc_entry_addr(tc_off);
    mon.jts.l1_add(&mut mon.shared, eip, entry_addr);

    if let Some((ph, p_phys, p_virt, edge)) = prev {
        // Chain only if the predecessor was not replaced in the meantime.
        let still_there = mon
            .tb_cache
            .get(ph)
            .map(|t| t.eip_phys == p_phys && t.eip_virt == p_virt)
            .unwrap_or(false);
        if still_there {
            mon.chain_edge(ph, edge, h);
        }
        mon.vcpu.edge = EDGE_NONE;
        mon.vcpu.prev_tb_tc = 0;
    }

    // Deliver pending interrupts at this safe point; never while replaying (the log decides).
    if !mon.rr.replaying() {
        handle_pending_interrupts(mon)?;
    }

    mon.vcpu.callout_cur = Some(tc_off);
    mon.vcpu.callout_next = Some(tc_off);
    Ok(Ok(h))
}

/// Dispatches whatever the block exit left in the shared state: a pending callout, a chained
/// completion, or an interrupt unwind.
pub fn finish_block(mon: &mut Monitor, reason: ExitReason) -> Result<Option<RunOutcome>, Error> {
    match reason {
        ExitReason::Interrupt(vector) => {
            // A host interrupt arrived mid-block; the trap hook already rolled the guest
            // state back to an instruction boundary.
            mon.vcpu.callout_next = None;
            mon.pic.set_irq(vector & 0xf, true);
            mon.vcpu.interrupt_request |= crate::vcpu::CPU_INTERRUPT_HARD;
            return Ok(None);
        }
        ExitReason::ForcedCallout => {
            mon.stats.forced_callouts += 1;
            mon.fcallout_clear();
            mon.vcpu.callout_next = None;
            return Ok(None);
        }
        ExitReason::MicroReplayTrigger => {
            micro_replay_switch(mon)?;
            return Ok(None);
        }
        ExitReason::Normal => {}
    }

    if let Some(callout) = mon.vcpu.callout.take() {
        let n_args = mon.vcpu.callout_n_args.min(8) as usize;
        let args: Vec<u32> = mon.vcpu.callout_args[..n_args].to_vec();
        match dispatch_callout(mon, callout, &args) {
            Ok(()) => {}
            Err(Error::Guest(exc)) => raise_exception_err(mon, exc)?,
            Err(e) => return Err(e),
        }
        mon.vcpu.callout_next = None;
        return Ok(None);
    }

    if !mon.vcpu.next_eip_is_set {
        // Pending interrupts bounced the entry before the first instruction ran.
        mon.vcpu.edge = EDGE_NONE;
    } else {
        mon.vcpu.callout_next = None;
    }
    Ok(None)
}

/// Runs the guest until the log ends, a divergence aborts the replay, or entering the
/// translation cache fails.
pub fn run(mon: &mut Monitor) -> Result<RunOutcome, Error> {
    loop {
        let h = match prepare_block(mon)? {
            Ok(h) => h,
            Err(outcome) => return Ok(outcome),
        };
        let tc_off = mon.tb_cache.get(h).map(|t| t.tc_off).unwrap_or(0);
        mon.sync_vcpu_to_shared();
        let reason = unsafe { enter_tb(mon, tc_off)? };
        mon.sync_shared_to_vcpu();
        if let Some(outcome) = finish_block(mon, reason)? {
            return Ok(outcome);
        }
        if mon.vcpu.halted && !mon.pic.has_pending() {
            // HLT blocks until an interrupt arrives; with no device feeding the PIC the
            // guest would sleep forever.
            return Ok(RunOutcome::Normal);
        }
    }
}

/// The embedder's trap hook: a host fault at `tc_off` while translated code was running.
///
/// Shadow-paging faults are resolved by installing the missing entry; traced-write faults
/// simulate the store and fire the watch callbacks; anything else rolls the guest back to the
/// faulting instruction boundary and reflects the exception.
pub fn deliver_host_trap(
    mon: &mut Monitor,
    tc_off: u32,
    fault_vaddr: u32,
    write: bool,
) -> Result<(), Error> {
    let user = mon.vcpu.privilege_level() == 3;
    if mon.shadow_fault(fault_vaddr, write, user)? {
        // Resolved by installing shadow state; execution resumes at the faulting host
        // instruction, so no rollback happens.
        return Ok(());
    }
    // Everything below retires or reflects the guest instruction, so the partial effects of
    // its translation must be rewound first.
    let eip_virt = rollback_to_boundary(mon, tc_off)?;
    mon.vcpu.eip = eip_virt.wrapping_sub(mon.vcpu.segs[crate::arch::x86::R_CS].base);
    if write {
        let insn_bytes = mon.fetch_code(eip_virt, 16)?;
        match mon.mtrace_write_fault(&insn_bytes) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            // A guest fault surfaced while retiring the store (a read-only page, a nested
            // not-present page): enter the guest handler rather than the embedder.
            Err(Error::Guest(exc)) => return raise_exception_err(mon, exc),
            Err(e) => return Err(e),
        }
    }
    let mut err = 0;
    if write {
        err |= crate::arch::x86::PF_ERR_W;
    }
    if user {
        err |= crate::arch::x86::PF_ERR_U;
    }
    // Present-but-protected faults carry the P bit in the guest error code.
    if mon.vcpu.using_cr3_page_table() {
        let flags = crate::mem::paging::access_flags(write, user, mon.vcpu.cr[0]);
        if let Err(e) = crate::mem::paging::pt_walk(&mut mon.ram, mon.vcpu.cr[3], fault_vaddr, flags)
        {
            if e.is_protection() {
                err |= crate::arch::x86::PF_ERR_P;
            }
        }
    }
    raise_exception_err(mon, crate::error::GuestExc::pf(err, fault_vaddr))
}

/// Locates the faulting instruction by its translation-cache offset, undoes any partial
/// architectural effects through the rollback buffer, and returns the guest linear address of
/// the instruction's start.
pub fn rollback_to_boundary(mon: &mut Monitor, tc_off: u32) -> Result<u32, Error> {
    let h = match mon.tb_cache.find_tc(tc_off) {
        Some(h) => h,
        None => return Ok(mon.vcpu.eip_virt()),
    };
    let (rel, inum, eip_virt) = {
        let tb = mon.tb_cache.get(h).expect("tb just found");
        let rel = (tc_off - tb.tc_off) as u16;
        let mut inum = 0;
        for i in 0..tb.num_insns as usize {
            if tb.tc_boundaries[i + 1] > rel {
                inum = i;
                break;
            }
        }
        (rel, inum, tb.insn_eip_virt(inum))
    };
    // Replay the rollback points whose code offsets have been passed.
    let undo: Vec<u8> = {
        let tb = mon.tb_cache.get(h).expect("tb just found");
        let rb = &tb.rollbacks[inum];
        let insn_rel = rel.saturating_sub(tb.tc_boundaries[inum]);
        // The first point at or after the fault covers it; the undo runs from there to the
        // end of the buffer.
        match rb.points.iter().find(|&&(code_off, _)| code_off >= insn_rel) {
            Some(&(_, rb_off)) => rb.buf[rb_off as usize..].to_vec(),
            None => Vec::new(),
        }
    };
    if !undo.is_empty() {
        apply_rollback_code(mon, &undo)?;
        debug!("rolled back to {:#x} (insn {})", eip_virt, inum);
    }
    Ok(eip_virt)
}

/// Interprets a rollback buffer in monitor context. Rollback snippets only adjust registers
/// (stack-pointer fixups after a partially retired push/call), so a register-level
/// interpretation matches the native one-shot execution of the original.
fn apply_rollback_code(mon: &mut Monitor, code: &[u8]) -> Result<(), Error> {
    let mut pos = 0usize;
    while pos < code.len() {
        let insn = mon
            .decoder
            .decode(&code[pos..], pos as u32, 4)
            .map_err(|_| Error::TranslationOverflow)?;
        use crate::insn::opcodes::Op;
        use crate::insn::Operand;
        match (insn.opc, &insn.op[0], &insn.op[1]) {
            (Op::Add, Operand::Reg { id, .. }, Operand::Imm { val, .. }) => {
                let r = &mut mon.vcpu.regs[*id as usize];
                if insn.opsize == 2 {
                    let lo = (*r as u16).wrapping_add(*val as u16);
                    *r = (*r & !0xffff) | lo as u32;
                } else {
                    *r = r.wrapping_add(*val as u32);
                }
            }
            (Op::Sub, Operand::Reg { id, .. }, Operand::Imm { val, .. }) => {
                let r = &mut mon.vcpu.regs[*id as usize];
                if insn.opsize == 2 {
                    let lo = (*r as u16).wrapping_sub(*val as u16);
                    *r = (*r & !0xffff) | lo as u32;
                } else {
                    *r = r.wrapping_sub(*val as u32);
                }
            }
            _ => return Err(Error::TranslationOverflow),
        }
        pos += insn.len as usize;
    }
    Ok(())
}

/// Drives one micro-replay mode switch and applies its side effects on the vcpu clock.
pub fn micro_replay_switch(mon: &mut Monitor) -> Result<(), Error> {
    let cur = mon.vcpu.n_exec;
    let (action, forced_n_exec) = mon
        .mrep
        .switch_mode(&mut mon.rr, &mut mon.blacklist, cur)?;
    if let Some(n) = forced_n_exec {
        mon.vcpu.n_exec = n;
    }
    if action == MrepAction::Restart {
        mon.vcpu.callout_next = None;
        mon.vcpu.edge = EDGE_NONE;
        mon.vcpu.prev_tb_tc = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorBuilder;

    fn monitor() -> Monitor {
        MonitorBuilder::new()
            .with_ram_size(0x10_0000)
            .with_tc_size(0x4_0000)
            .build()
            .unwrap()
    }

    #[test]
    fn trampolines_have_expected_shape() {
        let mut e = Emitter::new();
        let (entry, exit) = build_trampolines(&mut e);
        assert_eq!(e.out[entry as usize], 0x60); // pusha
        assert_eq!(e.out[entry as usize + 1], 0x9c); // pushf
        let end = e.out.len();
        assert_eq!(e.out[end - 1], 0xc3); // ret
        assert_eq!(e.out[end - 2], 0x61); // popa
        assert!(exit > entry);
    }

    #[test]
    fn prepare_block_resolves_and_chains() {
        let mut mon = monitor();
        // Two blocks: a jmp to 0x7c10, and a hlt there.
        let mut code = vec![0xe9];
        code.extend_from_slice(&(0x7c10u32 - 0x7c05).to_le_bytes());
        mon.ram.write(0x7c00, &code).unwrap();
        mon.ram.write(0x7c10, &[0xf4]).unwrap();

        let h1 = prepare_block(&mut mon).unwrap().unwrap();
        // Pretend the block ran and took edge 0 to 0x7c10.
        let tb1_tc = mon.tb_cache.get(h1).unwrap().tc_off;
        mon.vcpu.eip = 0x7c10;
        mon.vcpu.edge = 0;
        mon.vcpu.prev_tb_tc = tb1_tc;
        let h2 = prepare_block(&mut mon).unwrap().unwrap();
        assert_ne!(h1, h2);
        // The first block is now chained into the second.
        assert_eq!(mon.tb_cache.get(h1).unwrap().chained_to[0], Some(h2));
        assert_eq!(
            mon.tb_cache.get(h2).unwrap().jmp_first,
            Some(crate::tb::ChainRef::new(h1, 0))
        );
    }

    #[test]
    fn finish_block_dispatches_callout() {
        let mut mon = monitor();
        // Simulate a block exit that requested a hlt callout with fallthrough 0x7c01.
        mon.vcpu.callout = Some(crate::exec::callout::Callout::Hlt);
        mon.vcpu.callout_n_args = 1;
        mon.vcpu.callout_args[0] = 0x7c01;
        finish_block(&mut mon, ExitReason::Normal).unwrap();
        assert!(mon.vcpu.halted);
        assert_eq!(mon.vcpu.eip, 0x7c01);
    }

    #[test]
    fn forced_callout_exit_clears_patches() {
        let mut mon = monitor();
        mon.ram.write(0x7c00, &[0x90, 0x90, 0xf4]).unwrap();
        let h = prepare_block(&mut mon).unwrap().unwrap();
        let tc_off = mon.tb_cache.get(h).unwrap().tc_off;
        let orig = mon.tc_ref()[tc_off as usize];
        mon.fcallout_apply(tc_off, None);
        assert_ne!(mon.tc_ref()[tc_off as usize], orig);
        finish_block(&mut mon, ExitReason::ForcedCallout).unwrap();
        assert_eq!(mon.tc_ref()[tc_off as usize], orig);
        assert!(!mon.fcallouts.exists());
    }

    #[test]
    fn host_interrupt_exit_feeds_pic() {
        let mut mon = monitor();
        finish_block(&mut mon, ExitReason::Interrupt(0)).unwrap();
        assert_ne!(mon.vcpu.interrupt_request, 0);
    }

    #[test]
    fn replay_exit_record_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rr.log");
        let mut mon = monitor();
        mon.rr.start_record(&path).unwrap();
        mon.rr.log_marker(LogTag::Exit).unwrap();
        mon.rr.start_replay(&path).unwrap();
        match prepare_block(&mut mon).unwrap() {
            Err(RunOutcome::Normal) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn replay_reinjects_interrupt_at_recorded_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rr.log");
        let mut mon = monitor();
        // A real-mode IVT entry for vector 8 at 0x20: handler at 0000:0x9000.
        mon.ram.stw(8 * 4, 0x9000).unwrap();
        mon.ram.stw(8 * 4 + 2, 0).unwrap();
        mon.ram.write(0x9000, &[0xf4]).unwrap();
        mon.ram.write(0x7c00, &[0xf4]).unwrap();
        mon.vcpu.regs[4] = 0x7000;

        mon.rr.start_record(&path).unwrap();
        mon.rr.log_interrupt(8, 0, 0, 0x7c00).unwrap();
        mon.rr.start_replay(&path).unwrap();
        prepare_block(&mut mon).unwrap().unwrap();
        // The interrupt was due at n_exec 0 and got injected before entry.
        assert_eq!(mon.vcpu.eip, 0x9000);
        assert_eq!(mon.stats.interrupts_injected, 1);
    }

    /// Protected mode with paging on: flat segments at selector 8, guest tables at
    /// 0x20000/0x21000 identity-mapping the first 64 pages, a GDT at 0x4000 and an IDT at
    /// 0x3000 whose page-fault gate enters 0xa000.
    fn paged_monitor() -> Monitor {
        use crate::arch::x86::{Segment, CR0_PE, CR0_PG, DESC_B_MASK};
        let mut mon = monitor();
        crate::mem::paging::build_identity_table(&mut mon.ram, 0x20000, 0x21000, 64, true)
            .unwrap();
        mon.vcpu.cr[0] |= CR0_PE | CR0_PG;
        mon.vcpu.cr[3] = 0x20000;
        for seg in mon.vcpu.segs.iter_mut() {
            *seg = Segment {
                selector: 0x08,
                base: 0,
                limit: 0xffff_ffff,
                flags: DESC_B_MASK,
            };
        }
        // Flat ring-0 code descriptor at GDT slot 1.
        mon.vcpu.gdt = crate::arch::x86::DescriptorTable {
            base: 0x4000,
            limit: 0xff,
        };
        mon.ram.stl(0x4008, 0x0000_ffff).unwrap();
        mon.ram.stl(0x400c, 0x00cf_9b00).unwrap();
        // IDT vector 14: 32-bit interrupt gate to 8:0xa000.
        mon.vcpu.idt = crate::arch::x86::DescriptorTable {
            base: 0x3000,
            limit: 0x7ff,
        };
        mon.ram.stl(0x3000 + 14 * 8, 0x0008_a000).unwrap();
        mon.ram.stl(0x3000 + 14 * 8 + 4, 0x0000_8e00).unwrap();
        mon.vcpu.regs[4] = 0x8000;
        mon.shadow_pagedir_sync().unwrap();
        mon
    }

    #[test]
    fn read_only_write_reflects_guest_page_fault() {
        use crate::arch::x86::{PteFlags, CR0_WP, PF_ERR_P, PF_ERR_W};
        let mut mon = paged_monitor();
        // With CR0.WP the supervisor write honors the read-only leaf for page 0x9000.
        mon.vcpu.cr[0] |= CR0_WP;
        let pte = mon.ram.ldl(0x21000 + 9 * 4).unwrap();
        mon.ram.stl(0x21000 + 9 * 4, pte & !PteFlags::W.bits()).unwrap();
        // The faulting store: mov [0x9000], ecx.
        mon.ram
            .write(0x1000, &[0x89, 0x0d, 0x00, 0x90, 0x00, 0x00])
            .unwrap();
        mon.vcpu.eip = 0x1000;
        mon.vcpu.regs[1] = 0xdead_beef;

        deliver_host_trap(&mut mon, 0, 0x9000, true).unwrap();

        // The guest's #PF handler was entered with CR2 and a protection error code; the
        // store never reached memory.
        assert_eq!(mon.vcpu.eip, 0xa000);
        assert_eq!(mon.vcpu.cr[2], 0x9000);
        assert_eq!(mon.vcpu.regs[4], 0x8000 - 16);
        assert_eq!(mon.ld_kernel_l(0x7ff0).unwrap(), PF_ERR_P | PF_ERR_W);
        assert_eq!(mon.ld_kernel_l(0x7ff4).unwrap(), 0x1000);
        assert_eq!(mon.ram.ldl(0x9000).unwrap(), 0);
    }

    #[test]
    fn traced_write_fault_simulates_store_and_keeps_protection() {
        use crate::arch::x86::PteFlags;
        use crate::mem::mtrace::MtraceClient;
        let mut mon = paged_monitor();
        // mov [0x9000], ecx ; hlt
        mon.ram
            .write(0x1000, &[0x89, 0x0d, 0x00, 0x90, 0x00, 0x00, 0xf4])
            .unwrap();
        mon.vcpu.eip = 0x1000;
        mon.vcpu.regs[1] = 0x5566_7788;
        let dirs: Vec<_> = mon.vcpu.shadow_page_dir.iter().flatten().copied().collect();
        mon.mtrace
            .add(&mut mon.swap, &dirs, 0x9000, 64, MtraceClient::Probe(7));
        let h = mon.resolve_tb().unwrap();
        let tc_off = mon.tb_cache.get(h).unwrap().tc_off;

        // A read fault installs the (write-withheld) shadow entry; a write fault against
        // the traced frame must then report no progress rather than reinstalling it.
        assert!(mon.shadow_fault(0x9000, false, false).unwrap());
        assert!(!mon.shadow_fault(0x9000, true, false).unwrap());

        deliver_host_trap(&mut mon, tc_off, 0x9000, true).unwrap();

        // The store retired through the simulator, eip advanced past it, the guest D bit is
        // set, and the shadow entry stays write-protected for the next traced store.
        assert_eq!(mon.ram.ldl(0x9000).unwrap(), 0x5566_7788);
        assert_eq!(mon.vcpu.eip, 0x1006);
        assert_ne!(
            mon.ram.ldl(0x21000 + 9 * 4).unwrap() & PteFlags::D.bits(),
            0
        );
        let pd = mon.vcpu.shadow_page_dir[0].unwrap();
        let pt = mon.swap.child_of(pd, 0).expect("shadow PT installed");
        let entry = mon.swap.entry(pt, 9);
        assert_ne!(entry & PteFlags::P.bits(), 0);
        assert_eq!(entry & PteFlags::W.bits(), 0);
        assert_eq!(mon.stats.mtrace_faults, 1);
    }

    #[test]
    fn rollback_applies_esp_fixup() {
        let mut mon = monitor();
        mon.vcpu.cr[0] |= 1; // protected flat
        for seg in mon.vcpu.segs.iter_mut() {
            seg.base = 0;
            seg.limit = 0xffff_ffff;
            seg.flags = crate::arch::x86::DESC_B_MASK;
        }
        // call rel32 at 0x1000.
        mon.ram.write(0x1000, &[0xe8, 0x10, 0x00, 0x00, 0x00]).unwrap();
        mon.vcpu.eip = 0x1000;
        let h = mon.resolve_tb().unwrap();
        let tb = mon.tb_cache.get(h).unwrap();
        let tc_off = tb.tc_off;
        // The push retired (esp moved), then the fault hit inside the edge code.
        let fault_off = tc_off + tb.tc_boundaries[0] as u32 + tb.rollbacks[0].points[0].0 as u32;
        mon.vcpu.regs[4] = 0x8000 - 4;
        let eip_virt = rollback_to_boundary(&mut mon, fault_off).unwrap();
        assert_eq!(eip_virt, 0x1000);
        assert_eq!(mon.vcpu.regs[4], 0x8000, "esp fixup must undo the push");
    }
}
