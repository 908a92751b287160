//! Forced callouts: 2-byte `int FORCED_CALLOUT` patches written over translated code so the
//! monitor regains control at an arbitrary translated address, typically to deliver an
//! interrupt that arrived while the guest was running.

use log::trace;

use crate::exec::layout::GS_MONITOR_EIP;
use crate::insn::decode::DecodeCtx;
use crate::insn::opcodes::Op;
use crate::insn::{Operand, Prefixes};
use crate::tb::cache::{TbCache, TbHandle};

use super::intr::FORCED_CALLOUT;

/// The two bytes of the patch: `int FORCED_CALLOUT`.
pub const PATCH: [u8; 2] = [0xcd, FORCED_CALLOUT];

#[derive(Clone, Copy, Debug)]
struct Patch {
    off1: u32,
    off2: Option<u32>,
    saved: [u8; 4],
}

/// The active forced-callout patch set. At most one logical patch (two sites, because a
/// conditional branch has two successors) exists at a time.
pub struct FcalloutPatches {
    patch: Option<Patch>,
}

impl FcalloutPatches {
    pub fn new() -> Self {
        Self { patch: None }
    }

    pub fn exists(&self) -> bool {
        self.patch.is_some()
    }

    /// Whether the given tc offset is currently patched.
    pub fn already_patched(&self, tc_off: u32) -> bool {
        match &self.patch {
            Some(p) => p.off1 == tc_off || p.off2 == Some(tc_off),
            None => false,
        }
    }

    /// Writes the patch over up to two sites, saving the original bytes.
    pub fn apply(&mut self, tc: &mut [u8], off1: u32, off2: Option<u32>) {
        debug_assert!(self.patch.is_none());
        let mut saved = [0u8; 4];
        saved[0] = tc[off1 as usize];
        saved[1] = tc[off1 as usize + 1];
        tc[off1 as usize] = PATCH[0];
        tc[off1 as usize + 1] = PATCH[1];
        if let Some(off2) = off2 {
            saved[2] = tc[off2 as usize];
            saved[3] = tc[off2 as usize + 1];
            tc[off2 as usize] = PATCH[0];
            tc[off2 as usize + 1] = PATCH[1];
        }
        trace!("fcallout patch at {:#x} / {:?}", off1, off2);
        self.patch = Some(Patch { off1, off2, saved });
    }

    /// Restores the original bytes at every patched site.
    pub fn clear(&mut self, tc: &mut [u8]) {
        if let Some(p) = self.patch.take() {
            tc[p.off1 as usize] = p.saved[0];
            tc[p.off1 as usize + 1] = p.saved[1];
            if let Some(off2) = p.off2 {
                tc[off2 as usize] = p.saved[2];
                tc[off2 as usize + 1] = p.saved[3];
            }
        }
    }

    /// Records a write to patched translation-cache bytes so clearing the patch later does
    /// not resurrect stale code (chaining may rewrite a displacement under a patch).
    pub fn tc_write(&mut self, tc_off: u32, val: u8) {
        if let Some(p) = self.patch.as_mut() {
            if tc_off == p.off1 {
                p.saved[0] = val;
            } else if tc_off == p.off1 + 1 {
                p.saved[1] = val;
            } else if Some(tc_off) == p.off2 {
                p.saved[2] = val;
            } else if p.off2.map(|o| o + 1) == Some(tc_off) {
                p.saved[3] = val;
            }
        }
    }

    /// Whether any patched site lies inside the given block (such blocks may not be evicted).
    pub fn tb_active(&self, cache: &TbCache, tb: TbHandle) -> bool {
        match &self.patch {
            Some(p) => {
                cache.find_tc(p.off1) == Some(tb)
                    || p.off2.map(|o| cache.find_tc(o) == Some(tb)).unwrap_or(false)
            }
            None => false,
        }
    }
}

impl Default for FcalloutPatches {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans forward from `tc_off` to find where to place the next forced-callout patch:
///
/// - an existing forced callout or a callout exit means no patch is needed;
/// - a direct jump patches its target (and, for a conditional, the fall-through);
/// - any other indirect jump patches the jump itself so the target can be resolved later;
/// - otherwise the next instruction boundary is patched.
pub fn scan_next_insn(
    cache: &TbCache,
    tc: &[u8],
    decoder: &DecodeCtx,
    tc_off: u32,
) -> (Option<u32>, Option<u32>) {
    let tb = match cache.find_tc(tc_off) {
        Some(h) => h,
        None => return (None, None),
    };
    let tc_next = match cache.tc_next_boundary(tc_off) {
        Some(n) => n,
        None => return (None, None),
    };
    let tb_end = {
        let t = cache.get(tb).unwrap();
        t.tc_off + t.tc_len
    };
    let mut off = tc_off;
    while off < tc_next {
        let insn = match decoder.decode(&tc[off as usize..tb_end as usize], off, 4) {
            Ok(i) => i,
            Err(_) => return (None, None),
        };
        if insn.opc == Op::Int {
            if let Operand::Imm { val, .. } = insn.op[0] {
                if val as u8 == FORCED_CALLOUT {
                    // A forced callout is already coming up.
                    return (None, None);
                }
            }
        }
        if insn.opc == Op::Jmp {
            match insn.op[0] {
                Operand::Mem(m) => {
                    let is_callout_exit = insn.prefixes.contains(Prefixes::GS)
                        && m.base.is_none()
                        && m.index.is_none()
                        && m.disp == GS_MONITOR_EIP;
                    if is_callout_exit {
                        return (None, None);
                    }
                    // Another indirect jump: patch it in place so the target can be
                    // determined once it resolves.
                    return (Some(off), None);
                }
                Operand::Imm { val, .. } => {
                    // Direct jump inside the cache: follow to its target.
                    return (Some(val as u32), None);
                }
                _ => return (Some(off), None),
            }
        }
        if let Some(_cond) = insn.opc.jcc_cond() {
            if let Operand::Imm { val, .. } = insn.op[0] {
                return (Some(val as u32), Some(off + insn.len as u32));
            }
        }
        off += insn.len as u32;
    }
    if tc_next < tb_end {
        (Some(tc_next), None)
    } else {
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tb::cache::{Replacement, Tb, TbCache};

    fn cache_with_code(code: &[u8]) -> (TbCache, Vec<u8>, TbHandle) {
        let mut c = TbCache::new(4096, Replacement::Random);
        let off = c.tc_alloc(code.len() as u32).unwrap();
        assert_eq!(off, 0);
        let mut tc = vec![0u8; 4096];
        tc[..code.len()].copy_from_slice(code);
        let tb = Tb {
            eip: 0x100,
            eip_virt: 0x100,
            eip_phys: 0x100,
            eip_phys_end_page: 0,
            tb_len: 4,
            num_insns: 1,
            tc_off: 0,
            tc_len: code.len() as u32,
            eip_boundaries: vec![4],
            tc_boundaries: vec![0, code.len() as u16],
            rollbacks: vec![Default::default()],
            jmp_offset: [None, None],
            edge_offset: [None, None],
            jmp_first: None,
            jmp_next: [None, None],
            chained_to: [None, None],
            accessed_bit: false,
            mtrace_handles: Vec::new(),
        };
        let h = c.insert(tb);
        (c, tc, h)
    }

    #[test]
    fn apply_and_clear_restore_bytes() {
        let code = [0xb8, 1, 0, 0, 0, 0xb9, 2, 0, 0, 0];
        let (_c, mut tc, _h) = cache_with_code(&code);
        let orig = tc.clone();
        let mut fc = FcalloutPatches::new();
        fc.apply(&mut tc, 5, None);
        assert_eq!(&tc[5..7], &PATCH);
        assert!(fc.exists());
        assert!(fc.already_patched(5));
        fc.clear(&mut tc);
        assert_eq!(tc, orig);
        assert!(!fc.exists());
    }

    #[test]
    fn tc_write_updates_saved_bytes() {
        let code = [0xb8, 1, 0, 0, 0, 0xb9, 2, 0, 0, 0];
        let (_c, mut tc, _h) = cache_with_code(&code);
        let mut fc = FcalloutPatches::new();
        fc.apply(&mut tc, 5, None);
        // A chain-patch would have written 0x77 at offset 5 under the patch.
        fc.tc_write(5, 0x77);
        fc.clear(&mut tc);
        assert_eq!(tc[5], 0x77);
    }

    #[test]
    fn scan_stops_at_existing_forced_callout() {
        // mov eax,1 ; int 0xff ...
        let code = [0xb8, 1, 0, 0, 0, 0xcd, 0xff, 0x90, 0x90, 0x90];
        let (c, tc, _h) = cache_with_code(&code);
        let dec = DecodeCtx::new();
        // Resuming right at the patch site sees the pending forced callout.
        assert_eq!(scan_next_insn(&c, &tc, &dec, 5), (None, None));
    }

    #[test]
    fn scan_follows_direct_jump_targets() {
        // mov eax,1 ; jmp rel32 (to offset 20)
        let mut code = vec![0xb8, 1, 0, 0, 0, 0xe9];
        code.extend_from_slice(&(20u32.wrapping_sub(10)).to_le_bytes());
        let (c, tc, _h) = cache_with_code(&code);
        let dec = DecodeCtx::new();
        // The interrupt hit between the mov and the branch of the same guest instruction.
        let (p1, p2) = scan_next_insn(&c, &tc, &dec, 5);
        assert_eq!(p1, Some(20));
        assert_eq!(p2, None);
    }

    #[test]
    fn scan_patches_next_boundary_for_plain_code() {
        // nop ; mov eax,1 | mov ecx,2, where guest insn 0 covers the first two host insns.
        let code = [0x90, 0xb8, 1, 0, 0, 0, 0xb9, 2, 0, 0, 0];
        let mut c = TbCache::new(4096, Replacement::Random);
        c.tc_alloc(code.len() as u32).unwrap();
        let mut tc = vec![0u8; 4096];
        tc[..code.len()].copy_from_slice(&code);
        c.insert(Tb {
            eip: 0x100,
            eip_virt: 0x100,
            eip_phys: 0x100,
            eip_phys_end_page: 0,
            tb_len: 4,
            num_insns: 2,
            tc_off: 0,
            tc_len: code.len() as u32,
            eip_boundaries: vec![2, 4],
            tc_boundaries: vec![0, 6, code.len() as u16],
            rollbacks: vec![Default::default(), Default::default()],
            jmp_offset: [None, None],
            edge_offset: [None, None],
            jmp_first: None,
            jmp_next: [None, None],
            chained_to: [None, None],
            accessed_bit: false,
            mtrace_handles: Vec::new(),
        });
        let dec = DecodeCtx::new();
        // Resuming mid-way through guest insn 0, the next boundary is offset 6.
        let (p1, p2) = scan_next_insn(&c, &tc, &dec, 1);
        assert_eq!(p1, Some(6));
        assert_eq!(p2, None);
    }

    #[test]
    fn scan_ignores_callout_exits() {
        // nop ; jmp *gs:[monitor_eip]
        let mut code = vec![0x90, 0x65, 0xff, 0x25];
        code.extend_from_slice(&GS_MONITOR_EIP.to_le_bytes());
        code.extend_from_slice(&[0x90, 0x90, 0x90]);
        let (c, tc, _h) = cache_with_code(&code);
        let dec = DecodeCtx::new();
        assert_eq!(scan_next_insn(&c, &tc, &dec, 1), (None, None));
    }
}
