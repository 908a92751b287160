//! This module provides the [`Monitor`] struct: the single owner of all virtualization state.
//! Every subsystem hangs off it, and all mutation flows through `&mut Monitor` methods driven
//! by the dispatcher loop.

use log::{debug, info, trace, warn};
use mmap_rs::{MmapMut, MmapOptions, UnsafeMmapFlags};

use crate::arch::x86::{
    page_of, Eflags, DESC_B_MASK, DESC_P_MASK, PAGE_SIZE, PTE_ADDR_MASK, R_CS, R_SS,
};
use crate::config::MonitorConfig;
use crate::error::{Error, GuestExc};
use crate::exec::forced::FcalloutPatches;
use crate::exec::layout::{TcShared, GS_SEG_BASES};
use crate::insn::decode::DecodeCtx;
use crate::mem::mtrace::{MtraceClient, MtraceEngine};
use crate::mem::paging::{access_flags, pt_walk, WalkError};
use crate::mem::phys::GuestRam;
use crate::mem::shadow::{shadow_pte_flags, SwapPageType, SwapPool};
use crate::mem::simulate::{simulate_faulting_instruction, SimFault};
use crate::peep::{CpuConstraints, TranslationOut, Translator};
use crate::pic::Pic;
use crate::rr::log::{IoRecord, LogTag, StringIoRecord};
use crate::rr::{Blacklist, MicroReplay, RrState};
use crate::tb::cache::{Tb, TbCache, TbHandle};
use crate::tb::Jumptables;
use crate::vcpu::Vcpu;

/// An external port-I/O collaborator (block device, serial, keyboard controller). Reads on
/// unclaimed ports float high.
pub trait PortDevice {
    fn read(&mut self, port: u16, size: u32) -> u32;
    fn write(&mut self, port: u16, size: u32, value: u32);
}

/// Counters surfaced by the stats dump.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonStats {
    pub callouts: u64,
    pub forced_callouts: u64,
    pub translations: u64,
    pub shadow_faults: u64,
    pub mtrace_faults: u64,
    pub interrupts_injected: u64,
}

/// Deferred work to run at the next safe point between blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TbExitCallback {
    FreeTb(TbHandle),
}

/// The monitor: the single mutable root of the whole-system VMM.
pub struct Monitor {
    pub config: MonitorConfig,
    pub vcpu: Vcpu,
    pub ram: GuestRam,
    pub shared: TcShared,
    tc_map: MmapMut,
    pub tb_cache: TbCache,
    pub jts: Jumptables,
    pub translator: Translator,
    pub decoder: DecodeCtx,
    pub swap: SwapPool,
    pub mtrace: MtraceEngine,
    pub pic: Pic,
    pub rr: RrState,
    pub mrep: MicroReplay,
    pub blacklist: Blacklist,
    pub fcallouts: FcalloutPatches,
    pub device: Option<Box<dyn PortDevice>>,
    pub exit_callbacks: Vec<TbExitCallback>,
    pub stats: MonStats,
    /// Offsets of the entry/exit trampolines at the base of the code arena.
    pub trampoline_entry: u32,
    pub trampoline_exit: u32,
    /// The clock at which the last periodic `MS` snapshot was recorded.
    pub last_ms_snapshot: u64,
}

impl Monitor {
    /// Builds a monitor with the default configuration.
    pub fn new() -> Result<Self, Error> {
        Self::with_config(MonitorConfig::default())
    }

    pub fn with_config(config: MonitorConfig) -> Result<Self, Error> {
        let mut ram = GuestRam::new(config.ram_size)?;
        ram.set_a20(config.a20_unmasked);
        // The translation cache must be both writable (the translator and the chain patcher
        // write it) and executable (the guest runs out of it).
        let tc_map = unsafe {
            MmapOptions::new(config.tc_size as usize)?
                .with_unsafe_flags(UnsafeMmapFlags::JIT)
                .map_exec_mut()?
        };
        let mut swap = SwapPool::new(config.swap_page_limit);
        if let Some(path) = &config.swap_file {
            swap.attach_swap_file(path)?;
        }
        let mut translator = Translator::new();
        translator.set_max_tu_size(config.max_tu_size);
        let mut vcpu = Vcpu::default();
        vcpu.reset();
        let mut mon = Self {
            tb_cache: TbCache::new(config.tc_size, config.replacement),
            mrep: MicroReplay::new(config.mrep),
            blacklist: Blacklist::new(crate::rr::blacklist::BLACKLIST_WINDOW),
            config,
            vcpu,
            ram,
            shared: TcShared::new(),
            tc_map,
            jts: Jumptables::new(),
            translator,
            decoder: DecodeCtx::new(),
            swap,
            mtrace: MtraceEngine::new(),
            pic: Pic::new(),
            rr: RrState::new(),
            fcallouts: FcalloutPatches::new(),
            device: None,
            exit_callbacks: Vec::new(),
            stats: MonStats::default(),
            trampoline_entry: 0,
            trampoline_exit: 0,
            last_ms_snapshot: 0,
        };
        // The entry/exit trampolines live at the base of the code arena.
        let mut e = crate::peep::Emitter::new();
        let (entry, exit) = crate::exec::dispatch::build_trampolines(&mut e);
        let off = mon.tb_cache.tc_alloc(e.out.len() as u32)?;
        mon.tc_map.as_mut_slice()[off as usize..off as usize + e.out.len()]
            .copy_from_slice(&e.out);
        mon.trampoline_entry = off + entry;
        mon.trampoline_exit = off + exit;
        mon.shadow_pagedir_sync()?;
        for i in 0..crate::arch::x86::NUM_SEGS {
            mon.publish_seg_base(i);
        }
        info!(
            "monitor up: {} kB RAM, {} kB translation cache",
            mon.config.ram_size / 1024,
            mon.config.tc_size / 1024
        );
        Ok(mon)
    }

    /// Attaches the external port-I/O device model.
    pub fn attach_device(&mut self, device: Box<dyn PortDevice>) {
        self.device = Some(device);
    }

    /// Dumps the accumulated counters the way the original printed its MON-STATS lines.
    pub fn log_stats(&self) {
        info!(
            "stats: {} translations, {} callouts ({} forced), {} shadow faults, {} mtrace faults, {} interrupts",
            self.stats.translations,
            self.stats.callouts,
            self.stats.forced_callouts,
            self.stats.shadow_faults,
            self.stats.mtrace_faults,
            self.stats.interrupts_injected,
        );
        info!(
            "stats: tb cache {} blocks, {} replacements; swap {} pages, {} replacements; blacklist {} intervals (~{} bytes); {} micro-replays",
            self.tb_cache.len(),
            self.tb_cache.stats.replacements,
            self.swap.len(),
            self.swap.stats.replacements,
            self.blacklist.num_intervals(),
            self.blacklist.covered_bytes(),
            self.mrep.num_micro_replays,
        );
    }

    /// The translation-cache bytes.
    pub fn tc(&mut self) -> &mut [u8] {
        self.tc_map.as_mut_slice()
    }

    pub fn tc_ref(&self) -> &[u8] {
        self.tc_map.as_slice()
    }

    /// The absolute host address of a translation-cache offset. Meaningful only where host
    /// pointers fit the guest word size, i.e. on the 32-bit hosts the monitor targets.
    pub fn tc_entry_addr(&self, tc_off: u32) -> u32 {
        (self.tc_map.as_ptr() as usize as u32).wrapping_add(tc_off)
    }

    /// Chains an edge of a predecessor block into a successor.
    pub fn chain_edge(&mut self, pred: TbHandle, edge: usize, succ: TbHandle) {
        let tc = self.tc_map.as_mut_slice();
        self.tb_cache.add_jump(tc, pred, edge, succ);
        if let Some(t) = self.tb_cache.get_mut(succ) {
            t.accessed_bit = true;
        }
    }

    /// Applies a forced-callout patch over translated code.
    pub fn fcallout_apply(&mut self, off1: u32, off2: Option<u32>) {
        let tc = self.tc_map.as_mut_slice();
        self.fcallouts.apply(tc, off1, off2);
    }

    /// Removes the active forced-callout patch, restoring the original bytes.
    pub fn fcallout_clear(&mut self) {
        let tc = self.tc_map.as_mut_slice();
        self.fcallouts.clear(tc);
    }

    // ---- Guest memory access ----------------------------------------------------------

    /// Resolves a guest virtual address for a supervisor ("kernel") access, with
    /// architectural A/D side effects and write-permission checks.
    pub fn guest_virt_to_phys(&mut self, vaddr: u32, write: bool) -> Result<u32, Error> {
        if !self.vcpu.using_cr3_page_table() {
            return Ok(vaddr);
        }
        let flags = access_flags(write, false, self.vcpu.cr[0]);
        match pt_walk(&mut self.ram, self.vcpu.cr[3], vaddr, flags) {
            Ok(r) => Ok(r.paddr),
            Err(e) => {
                let mut err = 0;
                if e.is_protection() {
                    err |= crate::arch::x86::PF_ERR_P;
                }
                if write {
                    err |= crate::arch::x86::PF_ERR_W;
                }
                Err(GuestExc::pf(err, vaddr).into())
            }
        }
    }

    pub fn ld_phys_w(&mut self, paddr: u32) -> Result<u16, Error> {
        Ok(self.ram.lduw(paddr)?)
    }

    pub fn ld_kernel_b(&mut self, vaddr: u32) -> Result<u8, Error> {
        let paddr = self.guest_virt_to_phys(vaddr, false)?;
        Ok(self.ram.ldub(paddr)?)
    }

    pub fn ld_kernel_w(&mut self, vaddr: u32) -> Result<u16, Error> {
        let paddr = self.guest_virt_to_phys(vaddr, false)?;
        Ok(self.ram.lduw(paddr)?)
    }

    pub fn ld_kernel_l(&mut self, vaddr: u32) -> Result<u32, Error> {
        let paddr = self.guest_virt_to_phys(vaddr, false)?;
        Ok(self.ram.ldl(paddr)?)
    }

    pub fn st_kernel_b(&mut self, vaddr: u32, val: u8) -> Result<(), Error> {
        let paddr = self.guest_virt_to_phys(vaddr, true)?;
        Ok(self.ram.stb(paddr, val)?)
    }

    pub fn st_kernel_w(&mut self, vaddr: u32, val: u16) -> Result<(), Error> {
        let paddr = self.guest_virt_to_phys(vaddr, true)?;
        Ok(self.ram.stw(paddr, val)?)
    }

    pub fn st_kernel_l(&mut self, vaddr: u32, val: u32) -> Result<(), Error> {
        let paddr = self.guest_virt_to_phys(vaddr, true)?;
        Ok(self.ram.stl(paddr, val)?)
    }

    pub fn ld_kernel_sized(&mut self, vaddr: u32, size: u32) -> Result<u32, Error> {
        match size {
            1 => Ok(self.ld_kernel_b(vaddr)? as u32),
            2 => Ok(self.ld_kernel_w(vaddr)? as u32),
            _ => self.ld_kernel_l(vaddr),
        }
    }

    pub fn st_kernel_sized(&mut self, vaddr: u32, size: u32, val: u32) -> Result<(), Error> {
        match size {
            1 => self.st_kernel_b(vaddr, val as u8),
            2 => self.st_kernel_w(vaddr, val as u16),
            _ => self.st_kernel_l(vaddr, val),
        }
    }

    pub fn ld_kernel_bytes(&mut self, vaddr: u32, len: u32) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len as usize);
        for i in 0..len {
            out.push(self.ld_kernel_b(vaddr.wrapping_add(i))?);
        }
        Ok(out)
    }

    pub fn st_kernel_bytes(&mut self, vaddr: u32, buf: &[u8]) -> Result<(), Error> {
        for (i, &b) in buf.iter().enumerate() {
            self.st_kernel_b(vaddr.wrapping_add(i as u32), b)?;
        }
        Ok(())
    }

    /// Fetches up to `len` guest code bytes starting at a linear address, stopping at the
    /// first untranslatable page. At least one byte must be fetchable.
    pub fn fetch_code(&mut self, eip_virt: u32, len: u32) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len as usize);
        for i in 0..len {
            match self.ld_kernel_b(eip_virt.wrapping_add(i)) {
                Ok(b) => out.push(b),
                Err(e) => {
                    if out.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(out)
    }

    // ---- Guest stack ------------------------------------------------------------------

    fn sp_mask(&self) -> u32 {
        crate::exec::intr::current_sp_mask(&self.vcpu)
    }

    pub fn push32(&mut self, val: u32) -> Result<(), Error> {
        let mask = self.sp_mask();
        let sp = self.vcpu.regs[4].wrapping_sub(4) & mask;
        let addr = self.vcpu.segs[R_SS].base.wrapping_add(sp);
        self.st_kernel_l(addr, val)?;
        self.vcpu.regs[4] = (self.vcpu.regs[4] & !mask) | sp;
        Ok(())
    }

    pub fn push16(&mut self, val: u16) -> Result<(), Error> {
        let mask = self.sp_mask();
        let sp = self.vcpu.regs[4].wrapping_sub(2) & mask;
        let addr = self.vcpu.segs[R_SS].base.wrapping_add(sp);
        self.st_kernel_w(addr, val)?;
        self.vcpu.regs[4] = (self.vcpu.regs[4] & !mask) | sp;
        Ok(())
    }

    pub fn pop32(&mut self) -> Result<u32, Error> {
        let mask = self.sp_mask();
        let sp = self.vcpu.regs[4] & mask;
        let addr = self.vcpu.segs[R_SS].base.wrapping_add(sp);
        let val = self.ld_kernel_l(addr)?;
        self.vcpu.regs[4] = (self.vcpu.regs[4] & !mask) | (sp.wrapping_add(4) & mask);
        Ok(val)
    }

    pub fn pop16(&mut self) -> Result<u16, Error> {
        let mask = self.sp_mask();
        let sp = self.vcpu.regs[4] & mask;
        let addr = self.vcpu.segs[R_SS].base.wrapping_add(sp);
        let val = self.ld_kernel_w(addr)?;
        self.vcpu.regs[4] = (self.vcpu.regs[4] & !mask) | (sp.wrapping_add(2) & mask);
        Ok(val)
    }

    // ---- EFLAGS virtualization --------------------------------------------------------

    /// The guest-visible EFLAGS image, composing the virtualized IF and IOPL back in.
    pub fn compose_eflags(&self) -> u32 {
        let mut flags = self.vcpu.eflags & !(Eflags::IF | Eflags::IOPL).bits();
        if self.vcpu.intr_flag != 0 {
            flags |= Eflags::IF.bits();
        }
        flags | ((self.vcpu.iopl as u32 & 3) << 12) | Eflags::MBS.bits()
    }

    /// Applies a guest EFLAGS write: IF and IOPL only change when privilege allows.
    pub fn apply_eflags(&mut self, val: u32, mask: u32) {
        let cpl = self.vcpu.privilege_level();
        let keep = !(mask & !(Eflags::IF | Eflags::IOPL).bits());
        self.vcpu.eflags = (self.vcpu.eflags & keep) | (val & mask & !(Eflags::IF | Eflags::IOPL).bits());
        if cpl == 0 {
            self.vcpu.iopl = ((val >> 12) & 3) as u16;
        }
        if cpl <= self.vcpu.iopl as u32 || !self.vcpu.protected_mode() {
            self.vcpu.intr_flag = if val & Eflags::IF.bits() != 0 { 1 } else { 0 };
        }
    }

    // ---- Descriptors ------------------------------------------------------------------

    /// Reads a descriptor pair from the GDT or LDT, checking the table limit.
    pub fn read_descriptor(&mut self, selector: u32) -> Result<(u32, u32), Error> {
        let (base, limit) = if selector & 0x4 != 0 {
            (self.vcpu.ldt.base, self.vcpu.ldt.limit)
        } else {
            (self.vcpu.gdt.base, self.vcpu.gdt.limit)
        };
        let index = selector & !0x7;
        if index + 7 > limit {
            return Err(GuestExc::gp(selector & 0xfffc).into());
        }
        let e1 = self.ld_kernel_l(base + index)?;
        let e2 = self.ld_kernel_l(base + index + 4)?;
        Ok((e1, e2))
    }

    /// Reads the ring-`dpl` stack pointer pair from the current 32-bit TSS.
    pub fn tss_stack_for(&mut self, dpl: u32) -> Result<(u32, u32), Error> {
        let tss = self.vcpu.tr;
        if tss.flags & DESC_P_MASK == 0 {
            return Err(GuestExc::gp(tss.selector & 0xfffc).into());
        }
        let off = 4 + dpl * 8;
        if off + 7 > tss.limit {
            return Err(GuestExc::gp(tss.selector & 0xfffc).into());
        }
        let esp = self.ld_kernel_l(tss.base + off)?;
        let ss = self.ld_kernel_l(tss.base + off + 4)? & 0xffff;
        Ok((ss, esp))
    }

    pub fn reflect_or_fail(&mut self, exc: GuestExc) -> Result<(), Error> {
        Err(exc.into())
    }

    /// The guest-architectural selector of a segment register.
    pub fn guest_selector(&self, segno: usize) -> u32 {
        self.vcpu.segs[segno].selector
    }

    /// Whether the current code segment defaults to 32-bit operands.
    pub fn operand32(&self) -> bool {
        self.vcpu.segs[R_CS].flags & DESC_B_MASK != 0
    }

    /// Publishes a segment-cache base into the shared block for lowered real-mode address
    /// computations.
    pub fn publish_seg_base(&mut self, segno: usize) {
        let base = self.vcpu.segs[segno].base;
        self.shared.write(GS_SEG_BASES + 4 * segno as u32, base);
    }

    pub fn set_next_eip(&mut self, eip: u32) {
        self.vcpu.eip = eip;
        self.vcpu.next_eip_is_set = true;
    }

    pub fn jumptables_clear(&mut self) {
        self.jts.clear_all(&mut self.shared);
    }

    // ---- Port I/O with record/replay --------------------------------------------------

    fn device_read(&mut self, port: u16, size: u32) -> u32 {
        if Pic::owns_port(port) {
            return self.pic.io_read(port) as u32;
        }
        match self.device.as_mut() {
            Some(d) => d.read(port, size),
            None => match size {
                1 => 0xff,
                2 => 0xffff,
                _ => 0xffff_ffff,
            },
        }
    }

    fn device_write(&mut self, port: u16, size: u32, val: u32) {
        if Pic::owns_port(port) {
            self.pic.io_write(port, val as u8);
            return;
        }
        if let Some(d) = self.device.as_mut() {
            d.write(port, size, val);
        }
    }

    pub fn io_in(&mut self, port: u16, size: u32) -> Result<u32, Error> {
        let n_exec = self.vcpu.n_exec;
        if self.rr.replaying() {
            let (rec, _offset) = self.rr.consume_io(LogTag::In, n_exec)?;
            let after = self.rr.tell()?;
            if rec.port != port {
                return Err(Error::ReplayDivergence("in from wrong port"));
            }
            self.observe_record(LogTag::In, after, n_exec);
            return Ok(rec.value);
        }
        let value = self.device_read(port, size);
        if self.rr.recording() {
            let rec = IoRecord {
                port,
                size: size as u8,
                value,
                n_exec,
            };
            self.rr.log_io(LogTag::In, &rec)?;
        }
        Ok(value)
    }

    pub fn io_out(&mut self, port: u16, size: u32, value: u32) -> Result<(), Error> {
        let n_exec = self.vcpu.n_exec;
        if self.rr.replaying() {
            let (rec, _offset) = self.rr.consume_io(LogTag::Out, n_exec)?;
            let after = self.rr.tell()?;
            if rec.port != port || rec.value != value {
                return Err(Error::ReplayDivergence("out mismatch"));
            }
            self.observe_record(LogTag::Out, after, n_exec);
            return Ok(());
        }
        self.device_write(port, size, value);
        if self.rr.recording() {
            let rec = IoRecord {
                port,
                size: size as u8,
                value,
                n_exec,
            };
            self.rr.log_io(LogTag::Out, &rec)?;
        }
        Ok(())
    }

    pub fn io_ins(&mut self, port: u16, size: u32, count: u32) -> Result<Vec<u8>, Error> {
        let n_exec = self.vcpu.n_exec;
        if self.rr.replaying() {
            let (rec, _offset) = self.rr.consume_string_io(LogTag::Ins, n_exec)?;
            let after = self.rr.tell()?;
            if rec.port != port || rec.count != count {
                return Err(Error::ReplayDivergence("ins mismatch"));
            }
            self.observe_record(LogTag::Ins, after, n_exec);
            return Ok(rec.buffer);
        }
        let mut buf = Vec::with_capacity((count * size) as usize);
        for _ in 0..count {
            let v = self.device_read(port, size);
            buf.extend_from_slice(&v.to_le_bytes()[..size as usize]);
        }
        if self.rr.recording() {
            let rec = StringIoRecord {
                port,
                size: size as u8,
                count,
                n_exec,
                buffer: buf.clone(),
            };
            self.rr.log_string_io(LogTag::Ins, &rec)?;
        }
        Ok(buf)
    }

    pub fn io_outs(&mut self, port: u16, size: u32, count: u32, buf: &[u8]) -> Result<(), Error> {
        let n_exec = self.vcpu.n_exec;
        if self.rr.replaying() {
            let (rec, _offset) = self.rr.consume_string_io(LogTag::Outs, n_exec)?;
            let after = self.rr.tell()?;
            if rec.port != port || rec.count != count {
                return Err(Error::ReplayDivergence("outs mismatch"));
            }
            self.observe_record(LogTag::Outs, after, n_exec);
            return Ok(());
        }
        for chunk in buf.chunks(size as usize) {
            let mut v = 0u32;
            for (i, &b) in chunk.iter().enumerate() {
                v |= (b as u32) << (8 * i);
            }
            self.device_write(port, size, v);
        }
        if self.rr.recording() {
            let rec = StringIoRecord {
                port,
                size: size as u8,
                count,
                n_exec,
                buffer: buf.to_vec(),
            };
            self.rr.log_string_io(LogTag::Outs, &rec)?;
        }
        Ok(())
    }

    /// Forwards a consumed replay record to the micro-replay controller.
    pub fn observe_record(&mut self, tag: LogTag, offset_after: u64, n_exec: u64) {
        let eip = self.vcpu.eip_executing;
        self.mrep.on_record(tag, offset_after, n_exec, eip);
    }

    // ---- Shadow paging ----------------------------------------------------------------

    /// Reloads both shadow page directories for the current CR3/CR0 state and publishes
    /// them to the vcpu. Newly created directories get their guest-frame write-watch.
    pub fn shadow_pagedir_sync(&mut self) -> Result<(), Error> {
        if !self.vcpu.using_cr3_page_table() {
            self.vcpu.shadow_page_dir = [None, None];
            self.swap.unlock_pds();
            return Ok(());
        }
        let cr3 = self.vcpu.cr[3];
        let (dirs, created) = self.swap.load_shadow_page_dirs(&mut self.mtrace, cr3)?;
        for (i, &h) in dirs.iter().enumerate() {
            if created[i] {
                let paddr = cr3 & PTE_ADDR_MASK;
                let watch_dirs = [dirs[0], dirs[1]];
                let mh = self.mtrace.add(
                    &mut self.swap,
                    &watch_dirs,
                    paddr,
                    PAGE_SIZE,
                    MtraceClient::SwapPage(h),
                );
                if let Some(p) = self.swap.get_mut(h) {
                    p.mtrace_handle = Some(mh);
                }
            }
        }
        self.vcpu.shadow_page_dir = [Some(dirs[0]), Some(dirs[1])];
        debug!("shadow pagedirs synced for cr3 {:#x}", cr3);
        Ok(())
    }

    fn shadow_dirs(&self) -> Vec<crate::mem::shadow::SwapHandle> {
        self.vcpu.shadow_page_dir.iter().flatten().copied().collect()
    }

    /// Handles a host page fault against the shadow hierarchy: walk the guest tables, build
    /// the missing shadow PT entry, and install a leaf whose flags emulate A/D collection.
    ///
    /// Returns `true` only when installing shadow state made progress. A walk the guest's
    /// own tables deny (not present, privilege, or a write into a read-only entry), a write
    /// whose recomputed entry still withholds W because the frame is traced, and a
    /// reinstall identical to the live entry all report `false`, so the caller simulates
    /// the store or reflects a guest fault instead of livelocking on the same access.
    pub fn shadow_fault(&mut self, vaddr: u32, write: bool, user: bool) -> Result<bool, Error> {
        self.stats.shadow_faults += 1;
        if !self.vcpu.using_cr3_page_table() {
            return Ok(false);
        }
        let flags = access_flags(write, user, self.vcpu.cr[0]);
        let walk = match pt_walk(&mut self.ram, self.vcpu.cr[3], vaddr, flags) {
            Ok(w) => w,
            // Not-present and privilege failures alike belong to the guest.
            Err(WalkError::PdeNotPresent)
            | Err(WalkError::PteNotPresent)
            | Err(WalkError::PdePrivilege)
            | Err(WalkError::PtePrivilege) => return Ok(false),
        };

        let view = if user { 1 } else { 0 };
        let pd = match self.vcpu.shadow_page_dir[view] {
            Some(pd) => pd,
            None => return Ok(false),
        };
        let pd_idx = (vaddr >> 22) as u16;
        let pt_paddr = if walk.large {
            // Shadow 4 MiB mappings with a per-directory synthetic page table keyed by the
            // covering guest frame.
            page_of(walk.pde)
        } else {
            walk.pde & PTE_ADDR_MASK
        };
        let ptype = if user {
            SwapPageType::PtUser
        } else {
            SwapPageType::PtSupervisor
        };
        let (pt, created) = self.swap.get_page(&mut self.mtrace, pt_paddr, ptype)?;
        if created && !walk.large {
            let dirs = self.shadow_dirs();
            let mh = self.mtrace.add(
                &mut self.swap,
                &dirs,
                pt_paddr,
                PAGE_SIZE,
                MtraceClient::SwapPage(pt),
            );
            if let Some(p) = self.swap.get_mut(pt) {
                p.mtrace_handle = Some(mh);
            }
        }
        let pde_flags = (walk.pde & 0xfff) | crate::arch::x86::PteFlags::U.bits()
            | crate::arch::x86::PteFlags::P.bits()
            | crate::arch::x86::PteFlags::W.bits();
        let expected_pde = (pt.0 << 12) | (pde_flags & 0xfff);
        let pde_changed = self.swap.child_of(pd, pd_idx) != Some(pt)
            || self.swap.entry(pd, pd_idx) != expected_pde;
        if pde_changed {
            self.swap.set_table_entry(pd, pd_idx, pt, pde_flags);
        }

        let pt_idx = ((vaddr >> 12) & 0x3ff) as u16;
        let leaf_flags = match walk.pte {
            Some(pte) => pte & 0xfff,
            None => walk.pde & 0xfff,
        };
        let shadow_flags = shadow_pte_flags(leaf_flags);
        if shadow_flags == 0 {
            // Not yet accessed from the guest's point of view; nothing to install.
            return Ok(false);
        }
        let frame = page_of(walk.paddr);
        let preview = self.mtrace.preview_pte(frame | shadow_flags, frame);
        if write && preview & crate::arch::x86::PteFlags::W.bits() == 0 {
            // The guest grants the write (the walk passed) but the entry withholds W for a
            // traced frame, so installing it can never retire the store. Let the caller run
            // the write-watch path instead.
            trace!("shadow fault {:#x}: frame {:#x} is traced, not resolved", vaddr, frame);
            return Ok(false);
        }
        if !pde_changed && self.swap.entry(pt, pt_idx) == preview {
            // Reinstalling an identical entry makes no progress; reflect instead of
            // livelocking on the same fault.
            trace!(
                "shadow fault {:#x}: entry {:#x} unchanged, not resolved",
                vaddr,
                preview
            );
            return Ok(false);
        }
        self.mtrace.forget_pte(pt, pt_idx);
        let filtered = self
            .mtrace
            .filter_new_pte(pt, pt_idx, frame | shadow_flags, frame);
        self.swap.set_leaf_entry(pt, pt_idx, frame, filtered);
        trace!(
            "shadow fault {:#x} -> frame {:#x} flags {:#x}",
            vaddr,
            frame,
            filtered & 0xfff
        );
        Ok(true)
    }

    /// Handles a write fault on a traced page: simulate the store, then notify every client.
    pub fn mtrace_write_fault(&mut self, insn_bytes: &[u8]) -> Result<bool, Error> {
        self.stats.mtrace_faults += 1;
        let mut vcpu = self.vcpu.clone();
        let result = simulate_faulting_instruction(&mut self.ram, &mut vcpu, &self.decoder, insn_bytes);
        let sim = match result {
            Ok(sim) => sim,
            Err(SimFault::Nested(vaddr)) => {
                let mut err = crate::arch::x86::PF_ERR_W;
                if self.vcpu.privilege_level() == 3 {
                    err |= crate::arch::x86::PF_ERR_U;
                }
                if self.vcpu.using_cr3_page_table() {
                    let flags = access_flags(
                        true,
                        self.vcpu.privilege_level() == 3,
                        self.vcpu.cr[0],
                    );
                    if let Err(e) = pt_walk(&mut self.ram, self.vcpu.cr[3], vaddr, flags) {
                        if e.is_protection() {
                            err |= crate::arch::x86::PF_ERR_P;
                        }
                    }
                }
                return Err(GuestExc::pf(err, vaddr).into());
            }
            Err(SimFault::Unsupported) => return Ok(false),
        };
        self.vcpu = vcpu;
        let paddr = self.guest_virt_to_phys(sim.fault_addr, true)?;
        self.notify_mtrace_write(paddr, sim.access_size)?;
        Ok(true)
    }

    /// Notifies every watch overlapping the written physical address.
    pub fn notify_mtrace_write(&mut self, paddr: u32, access_size: u32) -> Result<(), Error> {
        let clients = self.mtrace.clients_for_write(paddr);
        for (_h, client) in clients {
            match client {
                MtraceClient::Tb(tb) => self.tb_invalidate_on_write(tb)?,
                MtraceClient::SwapPage(h) => {
                    let in_current = {
                        let dirs = self.vcpu.shadow_page_dir;
                        dirs.contains(&Some(h))
                            || self
                                .swap
                                .get(h)
                                .map(|p| !p.references.is_empty())
                                .unwrap_or(false)
                    };
                    self.swap.on_guest_write(
                        &mut self.mtrace,
                        h,
                        paddr,
                        access_size,
                        in_current,
                    )?;
                }
                MtraceClient::Probe(id) => {
                    debug!("mtrace probe {} fired at {:#x} (+{})", id, paddr, access_size);
                }
            }
        }
        Ok(())
    }

    // ---- Translation blocks -----------------------------------------------------------

    /// A write landed in this block's source bytes: invalidate it. If the block is the one
    /// currently executing, the free is deferred to the next safe point.
    pub fn tb_invalidate_on_write(&mut self, tb: TbHandle) -> Result<(), Error> {
        let executing = self
            .vcpu
            .callout_next
            .and_then(|off| self.tb_cache.find_tc(off))
            == Some(tb);
        if executing {
            let eip = self.tb_cache.get(tb).map(|t| t.eip).unwrap_or(0);
            let (eip_virt, eip_key) = match self.tb_cache.get(tb) {
                Some(t) => (t.eip_virt, t.eip),
                None => return Ok(()),
            };
            let tc = self.tc_map.as_mut_slice();
            self.tb_cache.unchain(tc, tb);
            self.jts.l2_remove(eip_virt, eip_key);
            self.jts.l1_remove(&mut self.shared, eip);
            if !self.exit_callbacks.contains(&TbExitCallback::FreeTb(tb)) {
                self.exit_callbacks.push(TbExitCallback::FreeTb(tb));
            }
        } else {
            self.tb_free(tb)?;
        }
        Ok(())
    }

    /// Frees one block completely: unchain, drop from indexes and jump tables, deregister
    /// its write-watches.
    pub fn tb_free(&mut self, tb: TbHandle) -> Result<(), Error> {
        let tc = self.tc_map.as_mut_slice();
        let dead = self.tb_cache.remove(tc, tb);
        self.jts.l2_remove(dead.eip_virt, dead.eip);
        self.jts.l1_remove(&mut self.shared, dead.eip);
        let dirs = self.shadow_dirs();
        for mh in dead.mtrace_handles {
            self.mtrace.remove(&mut self.swap, &dirs, mh);
        }
        Ok(())
    }

    /// Runs the deferred tb-exit callbacks.
    pub fn process_exit_callbacks(&mut self) -> Result<(), Error> {
        let cbs = std::mem::take(&mut self.exit_callbacks);
        for cb in cbs {
            match cb {
                TbExitCallback::FreeTb(tb) => {
                    if self.tb_cache.get(tb).is_some() {
                        self.tb_free(tb)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Allocates code space, evicting blocks until the allocation fits.
    pub fn tb_pool_alloc(&mut self, len: u32) -> Result<u32, Error> {
        loop {
            match self.tb_cache.tc_alloc(len) {
                Ok(off) => return Ok(off),
                Err(_) => {
                    let active = self
                        .vcpu
                        .callout_next
                        .and_then(|off| self.tb_cache.find_tc(off));
                    let victim = self
                        .tb_cache
                        .find_replacement(active)
                        .filter(|&h| !self.fcallouts.tb_active(&self.tb_cache, h));
                    match victim {
                        Some(h) => {
                            self.tb_free(h)?;
                        }
                        None => {
                            warn!("translation cache exhausted with every block locked");
                            return Err(Error::OutOfTranslationCache);
                        }
                    }
                }
            }
        }
    }

    /// Installs a finished translation into the cache and indexes, registering the
    /// self-modifying-code write-watch on its source range.
    pub fn tb_install(
        &mut self,
        out: TranslationOut,
        eip: u32,
        eip_virt: u32,
        eip_phys: u32,
        eip_phys_end_page: u32,
    ) -> Result<TbHandle, Error> {
        self.stats.translations += 1;
        let tc_off = self.tb_pool_alloc(out.code.len() as u32)?;
        let tc = self.tc_map.as_mut_slice();
        tc[tc_off as usize..tc_off as usize + out.code.len()].copy_from_slice(&out.code);
        // Exit stubs report the block's identity; the offset only exists now.
        for &site in &out.prev_tb_sites {
            let at = tc_off as usize + site as usize;
            tc[at..at + 4].copy_from_slice(&tc_off.to_le_bytes());
        }
        let tb = Tb {
            eip,
            eip_virt,
            eip_phys,
            eip_phys_end_page,
            tb_len: out.tb_len as u32,
            num_insns: out.num_insns as u32,
            tc_off,
            tc_len: out.code.len() as u32,
            eip_boundaries: out.eip_boundaries,
            tc_boundaries: out.tc_boundaries,
            rollbacks: out.rollbacks,
            jmp_offset: out.jmp_offsets,
            edge_offset: out.edge_offsets,
            jmp_first: None,
            jmp_next: [None, None],
            chained_to: [None, None],
            accessed_bit: true,
            mtrace_handles: Vec::new(),
        };
        let tb_len = tb.tb_len;
        let h = self.tb_cache.insert(tb);
        self.jts.l2_add(eip_virt, eip, h);

        // Watch the source bytes for self-modifying code; a block spanning two pages
        // watches both ranges.
        let dirs = self.shadow_dirs();
        let mut handles = Vec::new();
        let first_page_end = page_of(eip_phys) + PAGE_SIZE;
        if eip_phys + tb_len <= first_page_end {
            handles.push(self.mtrace.add(
                &mut self.swap,
                &dirs,
                eip_phys,
                tb_len,
                MtraceClient::Tb(h),
            ));
        } else {
            let first_len = first_page_end - eip_phys;
            handles.push(self.mtrace.add(
                &mut self.swap,
                &dirs,
                eip_phys,
                first_len,
                MtraceClient::Tb(h),
            ));
            handles.push(self.mtrace.add(
                &mut self.swap,
                &dirs,
                eip_phys_end_page,
                tb_len - first_len,
                MtraceClient::Tb(h),
            ));
        }
        if let Some(t) = self.tb_cache.get_mut(h) {
            t.mtrace_handles = handles;
        }
        Ok(h)
    }

    /// Resolves the translation block for the current guest eip: L2 hit, physical-hash hit,
    /// or a fresh translation.
    pub fn resolve_tb(&mut self) -> Result<TbHandle, Error> {
        let eip = self.vcpu.eip;
        let eip_virt = self.vcpu.eip_virt();
        if let Some(h) = self.jts.l2_find(eip_virt, eip) {
            return Ok(h);
        }

        let eip_phys = self.guest_virt_to_phys(eip_virt, false)?;
        if let Some(h) =
            self.tb_cache
                .find_pc(eip_phys, page_of(eip_phys), eip_virt, eip)
        {
            self.jts.l2_add(eip_virt, eip, h);
            return Ok(h);
        }

        let constraints = if self.vcpu.protected_mode() {
            CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP
        } else {
            CpuConstraints::REAL | CpuConstraints::NO_EXCP
        };
        let window = (self.config.max_tu_size * 15) as u32;
        let code = self.fetch_code(eip_virt, window)?;
        let sizehint = self.vcpu.operand_size();
        let with_rr = self.rr.active();
        let if_shadow = self.vcpu.intr_flag == 2;
        let out = self.translator.translate(
            &code,
            eip_virt,
            sizehint,
            constraints,
            with_rr,
            if_shadow,
        )?;
        let end_page = {
            let last = eip_virt.wrapping_add(out.tb_len as u32).wrapping_sub(1);
            page_of(self.guest_virt_to_phys(last, false)?)
        };
        self.tb_install(out, eip, eip_virt, eip_phys, end_page)
    }

    /// Synchronizes the vcpu scalar state into the shared block before entering translated
    /// code.
    pub fn sync_vcpu_to_shared(&mut self) {
        use crate::exec::layout::*;
        for i in 0..8 {
            self.shared.write(GS_REGS + 4 * i as u32, self.vcpu.regs[i]);
        }
        self.shared.write(GS_EFLAGS, self.vcpu.eflags);
        self.shared.write(GS_IF, self.vcpu.intr_flag as u32);
        self.shared.write_u64(GS_N_EXEC, self.vcpu.n_exec);
        self.shared.write(GS_CALLOUT, 0);
        self.shared.write(GS_NEXT_EIP_IS_SET, 0);
        self.shared.write(GS_EXIT_EDGE, crate::vcpu::EDGE_NONE);
        let pending = (self.vcpu.interrupt_request != 0 && self.vcpu.intr_flag == 1) as u32;
        self.shared.write(GS_PENDING_IRQ, pending);
        for i in 0..crate::arch::x86::NUM_SEGS {
            self.publish_seg_base(i);
        }
    }

    /// Reads back the shared block after translated code exits.
    pub fn sync_shared_to_vcpu(&mut self) {
        use crate::exec::layout::*;
        for i in 0..8 {
            self.vcpu.regs[i] = self.shared.read(GS_REGS + 4 * i as u32);
        }
        self.vcpu.eflags = self.shared.read(GS_EFLAGS);
        self.vcpu.intr_flag = self.shared.read(GS_IF) as u16;
        self.vcpu.n_exec = self.shared.read_u64(GS_N_EXEC);
        self.vcpu.jtarget = self.shared.read(GS_JTARGET);
        match self.shared.read(GS_NEXT_EIP_IS_SET) {
            1 => {
                self.vcpu.eip = self.shared.read(GS_EIP);
                self.vcpu.next_eip_is_set = true;
            }
            2 => {
                self.vcpu.eip = self.vcpu.jtarget;
                self.vcpu.next_eip_is_set = true;
            }
            _ => self.vcpu.next_eip_is_set = false,
        }
        self.vcpu.edge = self.shared.read(GS_EXIT_EDGE);
        self.vcpu.prev_tb_tc = self.shared.read(GS_PREV_TB);
        for i in 0..8 {
            self.vcpu.callout_args[i] = self.shared.read(GS_CALLOUT_ARGS + 4 * i as u32);
        }
        self.vcpu.callout =
            crate::exec::callout::callout_from_raw(self.shared.read(GS_CALLOUT));
        self.vcpu.callout_n_args = self.shared.read(GS_CALLOUT_N_ARGS);
    }
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
    fn boots_into_real_mode_state() {
        let mon = monitor();
        assert_eq!(mon.vcpu.eip, 0x7c00);
        assert!(!mon.vcpu.protected_mode());
        assert_eq!(mon.vcpu.shadow_page_dir, [None, None]);
    }

    #[test]
    fn resolve_tb_translates_and_caches() {
        let mut mon = monitor();
        // mov ax, 0x1234 ; hlt at the boot address.
        mon.ram
            .write(0x7c00, &[0xb8, 0x34, 0x12, 0xf4])
            .unwrap();
        let h1 = mon.resolve_tb().unwrap();
        let h2 = mon.resolve_tb().unwrap();
        assert_eq!(h1, h2);
        assert_eq!(mon.stats.translations, 1);
        let tb = mon.tb_cache.get(h1).unwrap();
        assert_eq!(tb.num_insns, 2);
        assert_eq!(tb.eip_phys, 0x7c00);
    }

    #[test]
    fn smc_write_invalidates_tb() {
        let mut mon = monitor();
        mon.ram
            .write(0x7c00, &[0xb8, 0x34, 0x12, 0xf4])
            .unwrap();
        let h = mon.resolve_tb().unwrap();
        assert!(mon.tb_cache.get(h).is_some());
        // A write into the block's source range fires the TB's write-watch.
        mon.ram.stb(0x7c01, 0x90).unwrap();
        mon.notify_mtrace_write(0x7c01, 1).unwrap();
        assert!(mon.tb_cache.get(h).is_none());
        // Retranslation sees the new byte.
        let h2 = mon.resolve_tb().unwrap();
        assert!(mon.tb_cache.get(h2).is_some());
    }

    #[test]
    fn smc_write_to_executing_tb_defers_free() {
        let mut mon = monitor();
        mon.ram
            .write(0x7c00, &[0xb8, 0x34, 0x12, 0xf4])
            .unwrap();
        let h = mon.resolve_tb().unwrap();
        let tc_off = mon.tb_cache.get(h).unwrap().tc_off;
        mon.vcpu.callout_next = Some(tc_off);
        mon.notify_mtrace_write(0x7c01, 1).unwrap();
        // Still alive, but scheduled for the next safe point.
        assert!(mon.tb_cache.get(h).is_some());
        assert_eq!(mon.exit_callbacks, vec![TbExitCallback::FreeTb(h)]);
        mon.vcpu.callout_next = None;
        mon.process_exit_callbacks().unwrap();
        assert!(mon.tb_cache.get(h).is_none());
    }

    #[test]
    fn eflags_composition_virtualizes_if() {
        let mut mon = monitor();
        mon.vcpu.eflags = 0x2;
        mon.vcpu.intr_flag = 1;
        mon.vcpu.iopl = 3;
        let fl = mon.compose_eflags();
        assert_ne!(fl & Eflags::IF.bits(), 0);
        assert_eq!(fl & Eflags::IOPL.bits(), 0x3000);
        mon.vcpu.intr_flag = 0;
        assert_eq!(mon.compose_eflags() & Eflags::IF.bits(), 0);
    }

    #[test]
    fn stack_push_pop_roundtrip_real_mode() {
        let mut mon = monitor();
        mon.vcpu.regs[4] = 0x7000;
        mon.push16(0xabcd).unwrap();
        assert_eq!(mon.vcpu.regs[4], 0x6ffe);
        assert_eq!(mon.pop16().unwrap(), 0xabcd);
        assert_eq!(mon.vcpu.regs[4], 0x7000);
    }

    #[test]
    fn io_float_high_without_device() {
        let mut mon = monitor();
        assert_eq!(mon.io_in(0x300, 1).unwrap(), 0xff);
        assert_eq!(mon.io_in(0x300, 4).unwrap(), 0xffff_ffff);
    }

    #[test]
    fn cr3_switch_reloads_shadow_and_purges_jumptables() {
        let mut mon = monitor();
        // Guest page tables at 0x1000/0x2000, protected mode with paging on.
        crate::mem::paging::build_identity_table(&mut mon.ram, 0x1000, 0x2000, 64, false)
            .unwrap();
        mon.vcpu.cr[0] |= crate::arch::x86::CR0_PE | crate::arch::x86::CR0_PG;
        mon.jts.l2_add(0x1234, 0x1234, crate::tb::cache::TbHandle(0));
        crate::exec::callout::dispatch_callout(
            &mut mon,
            crate::exec::callout::Callout::MovToCr3,
            &[0x1000, 0x500],
        )
        .unwrap();
        assert_eq!(mon.vcpu.cr[3], 0x1000);
        assert_eq!(mon.vcpu.eip, 0x500);
        // Both shadow views exist and the jump tables are empty.
        assert!(mon.vcpu.shadow_page_dir[0].is_some());
        assert!(mon.vcpu.shadow_page_dir[1].is_some());
        assert_eq!(mon.jts.l2_find(0x1234, 0x1234), None);
        // Writing the same CR3 again is a no-op for the pool.
        let before = mon.swap.len();
        crate::exec::callout::dispatch_callout(
            &mut mon,
            crate::exec::callout::Callout::MovToCr3,
            &[0x1000, 0x505],
        )
        .unwrap();
        assert_eq!(mon.swap.len(), before);
    }

    #[test]
    fn shadow_fault_installs_lazy_entry_with_d_bit_emulation() {
        let mut mon = monitor();
        crate::mem::paging::build_identity_table(&mut mon.ram, 0x1000, 0x2000, 64, false)
            .unwrap();
        mon.vcpu.cr[0] |= crate::arch::x86::CR0_PE | crate::arch::x86::CR0_PG;
        mon.vcpu.cr[3] = 0x1000;
        mon.shadow_pagedir_sync().unwrap();
        // A read fault on a clean, writable page installs a read-only shadow entry so the
        // first write still traps for D-bit collection.
        assert!(mon.shadow_fault(0x5004, false, false).unwrap());
        let pd = mon.vcpu.shadow_page_dir[0].unwrap();
        let pt = mon.swap.child_of(pd, 0).expect("shadow PT installed");
        let pte = mon.swap.entry(pt, 5);
        assert_ne!(pte & crate::arch::x86::PteFlags::P.bits(), 0);
        assert_eq!(pte & crate::arch::x86::PteFlags::W.bits(), 0);
        // After a write fault the guest D bit is set and the shadow entry becomes writable.
        assert!(mon.shadow_fault(0x5004, true, false).unwrap());
        let pte = mon.swap.entry(pt, 5);
        assert_ne!(pte & crate::arch::x86::PteFlags::W.bits(), 0);
        let guest_pte = mon.ram.ldl(0x2000 + 5 * 4).unwrap();
        assert_ne!(guest_pte & crate::arch::x86::PteFlags::D.bits(), 0);
    }

    #[test]
    fn port_io_roundtrips_through_record_and_replay() {
        struct OneShot(u32);
        impl PortDevice for OneShot {
            fn read(&mut self, _port: u16, _size: u32) -> u32 {
                let v = self.0;
                self.0 = 0;
                v
            }
            fn write(&mut self, _port: u16, _size: u32, _value: u32) {}
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rr.log");
        let mut mon = monitor();
        mon.attach_device(Box::new(OneShot(0x1c)));
        mon.vcpu.n_exec = 7;
        mon.rr.start_record(&path).unwrap();
        assert_eq!(mon.io_in(0x60, 1).unwrap(), 0x1c);
        // Replay the log with no device attached: the same value comes back from the log.
        mon.device = None;
        mon.rr.start_replay(&path).unwrap();
        assert_eq!(mon.io_in(0x60, 1).unwrap(), 0x1c);
    }

    #[test]
    fn shared_block_roundtrip() {
        let mut mon = monitor();
        mon.vcpu.regs[0] = 0x11;
        mon.vcpu.n_exec = 42;
        mon.sync_vcpu_to_shared();
        mon.shared.write(crate::exec::layout::GS_EIP, 0x9999);
        mon.shared.write(crate::exec::layout::GS_NEXT_EIP_IS_SET, 1);
        mon.shared
            .write(crate::exec::layout::GS_REGS, 0x22);
        mon.sync_shared_to_vcpu();
        assert_eq!(mon.vcpu.regs[0], 0x22);
        assert_eq!(mon.vcpu.eip, 0x9999);
        assert!(mon.vcpu.next_eip_is_set);
        assert_eq!(mon.vcpu.n_exec, 42);
    }
}
