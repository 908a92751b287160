//! The memory-trace engine: write-watches on guest physical ranges, delivered by clearing the
//! W bits of the shadow PTEs that map the traced frames and observing the resulting host
//! write faults.

use std::collections::HashMap;

use log::{debug, trace};

use crate::arch::x86::{page_of, PteFlags, PAGE_SIZE};
use crate::tb::cache::TbHandle;

use super::shadow::{SwapHandle, SwapPool};

/// An arena handle to a registered write-watch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MtraceHandle(pub u32);

/// Who to notify when a traced range is written. The original stored a raw callback and
/// opaque pointer; an enum of clients keeps the dispatch in one place.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MtraceClient {
    /// A translation block watching its own source bytes for self-modifying code.
    Tb(TbHandle),
    /// A shadow PD/PT page watching the guest frame it was built from.
    SwapPage(SwapHandle),
    /// A user-registered probe (record/replay watchpoints).
    Probe(u32),
}

struct Mtrace {
    start: u32,
    len: u32,
    client: MtraceClient,
}

impl Mtrace {
    fn begin_page(&self) -> u32 {
        page_of(self.start)
    }

    fn end_page(&self) -> u32 {
        page_of(self.start + self.len - 1)
    }

    fn overlaps_page(&self, page: u32) -> bool {
        self.start + self.len > page && page + PAGE_SIZE > self.start
    }
}

/// The write-watch engine.
pub struct MtraceEngine {
    arena: Vec<Option<Mtrace>>,
    free_slots: Vec<u32>,
    /// Watches indexed by the first page of their range.
    begin_pages: HashMap<u32, Vec<MtraceHandle>>,
    /// Watches whose range ends on a different page, indexed by that page.
    end_pages: HashMap<u32, Vec<MtraceHandle>>,
    /// Shadow PTE slots whose W bit was stolen for tracing: `(holder, index) -> saved value`.
    pte_saved: HashMap<(u32, u16), u32>,
    version: u64,
}

impl MtraceEngine {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            free_slots: Vec::new(),
            begin_pages: HashMap::new(),
            end_pages: HashMap::new(),
            pte_saved: HashMap::new(),
            version: 1,
        }
    }

    /// The current trace generation; bumped whenever the set of traced pages changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn get(&self, h: MtraceHandle) -> Option<&Mtrace> {
        self.arena.get(h.0 as usize).and_then(|m| m.as_ref())
    }

    /// Whether any watch covers the given page.
    pub fn page_is_mtraced(&self, page: u32) -> bool {
        debug_assert_eq!(page & (PAGE_SIZE - 1), 0);
        self.begin_pages.contains_key(&page) || self.end_pages.contains_key(&page)
    }

    /// Registers a write-watch on `[start, start+len)`. Shadow PTEs mapping the traced frames
    /// in the given page directories lose their W bit so the next write traps.
    pub fn add(
        &mut self,
        pool: &mut SwapPool,
        dirs: &[SwapHandle],
        start: u32,
        len: u32,
        client: MtraceClient,
    ) -> MtraceHandle {
        debug!(
            "mtrace add: {:#x}-{:#x} for {:?}",
            start,
            start + len,
            client
        );
        let m = Mtrace { start, len, client };
        let begin = m.begin_page();
        let end = m.end_page();
        let newly_traced =
            !self.page_is_mtraced(begin) || (begin != end && !self.page_is_mtraced(end));

        let h = match self.free_slots.pop() {
            Some(i) => {
                self.arena[i as usize] = Some(m);
                MtraceHandle(i)
            }
            None => {
                self.arena.push(Some(m));
                MtraceHandle(self.arena.len() as u32 - 1)
            }
        };
        self.begin_pages.entry(begin).or_default().push(h);
        if begin != end {
            self.end_pages.entry(end).or_default().push(h);
        }

        if newly_traced {
            for &pd in dirs {
                self.protect_dir(pool, pd);
            }
            self.version += 1;
        }
        h
    }

    /// Removes a write-watch, restoring the W bits it stole once no other watch covers the
    /// frames.
    pub fn remove(&mut self, pool: &mut SwapPool, dirs: &[SwapHandle], h: MtraceHandle) {
        let (begin, end) = match self.get(h) {
            Some(m) => (m.begin_page(), m.end_page()),
            None => return,
        };
        self.detach(h);
        if !self.page_is_mtraced(begin) || (begin != end && !self.page_is_mtraced(end)) {
            for &pd in dirs {
                self.unprotect_dir(pool, pd);
            }
            self.version += 1;
        }
    }

    /// Drops the registration without touching shadow state; used while the swap pool itself
    /// is tearing the page down.
    pub fn remove_without_pool(&mut self, h: MtraceHandle) {
        self.detach(h);
        self.version += 1;
    }

    fn detach(&mut self, h: MtraceHandle) {
        let m = match self.arena.get_mut(h.0 as usize).and_then(|m| m.take()) {
            Some(m) => m,
            None => return,
        };
        self.free_slots.push(h.0);
        let begin = m.begin_page();
        let end = m.end_page();
        if let Some(v) = self.begin_pages.get_mut(&begin) {
            v.retain(|&x| x != h);
            if v.is_empty() {
                self.begin_pages.remove(&begin);
            }
        }
        if let Some(v) = self.end_pages.get_mut(&end) {
            v.retain(|&x| x != h);
            if v.is_empty() {
                self.end_pages.remove(&end);
            }
        }
        trace!("mtrace removed: {:#x}-{:#x}", m.start, m.start + m.len);
    }

    /// Clears the W bit of every present, writable shadow PTE in `pd` whose frame page is
    /// traced, remembering the original value.
    fn protect_dir(&mut self, pool: &mut SwapPool, pd: SwapHandle) {
        let mut updates = Vec::new();
        let saved = &self.pte_saved;
        let begin_pages = &self.begin_pages;
        let end_pages = &self.end_pages;
        pool.scan(pd, |_pool, holder, idx, pte, paddr| {
            if pte & PteFlags::W.bits() == 0 {
                return;
            }
            let page = page_of(paddr);
            if !begin_pages.contains_key(&page) && !end_pages.contains_key(&page) {
                return;
            }
            if saved.contains_key(&(holder.0, idx)) {
                return;
            }
            updates.push((holder, idx, pte));
        });
        for (holder, idx, pte) in updates {
            self.pte_saved.insert((holder.0, idx), pte);
            pool.write_raw_entry(holder, idx, pte & !PteFlags::W.bits());
        }
    }

    /// Restores the W bits of shadow PTEs whose frame pages are no longer traced.
    fn unprotect_dir(&mut self, pool: &mut SwapPool, pd: SwapHandle) {
        let mut updates = Vec::new();
        let saved = &self.pte_saved;
        let begin_pages = &self.begin_pages;
        let end_pages = &self.end_pages;
        pool.scan(pd, |_pool, holder, idx, pte, paddr| {
            let page = page_of(paddr);
            if begin_pages.contains_key(&page) || end_pages.contains_key(&page) {
                return;
            }
            if let Some(&orig) = saved.get(&(holder.0, idx)) {
                updates.push((holder, idx, pte, orig));
            }
        });
        for (holder, idx, pte, orig) in updates {
            self.pte_saved.remove(&(holder.0, idx));
            // Only flag bits may differ from the saved image.
            debug_assert_eq!(
                pte & !(PteFlags::W | PteFlags::A | PteFlags::D).bits(),
                orig & !(PteFlags::W | PteFlags::A | PteFlags::D).bits()
            );
            pool.write_raw_entry(holder, idx, orig);
        }
    }

    /// The value [`MtraceEngine::filter_new_pte`] would install, without recording anything.
    /// The shadow engine uses this to detect reinstalls that would make no progress.
    pub fn preview_pte(&self, pte: u32, paddr: u32) -> u32 {
        if pte & PteFlags::W.bits() != 0 && self.page_is_mtraced(page_of(paddr)) {
            pte & !PteFlags::W.bits()
        } else {
            pte
        }
    }

    /// Called when the shadow engine installs a leaf PTE: if the frame is traced, the W bit
    /// is withheld immediately.
    pub fn filter_new_pte(&mut self, holder: SwapHandle, idx: u16, pte: u32, paddr: u32) -> u32 {
        if pte & PteFlags::W.bits() == 0 {
            return pte;
        }
        if !self.page_is_mtraced(page_of(paddr)) {
            return pte;
        }
        self.pte_saved.insert((holder.0, idx), pte);
        pte & !PteFlags::W.bits()
    }

    /// Forgets the saved W bit for an invalidated slot.
    pub fn forget_pte(&mut self, holder: SwapHandle, idx: u16) {
        self.pte_saved.remove(&(holder.0, idx));
    }

    /// The saved (pre-trace) value of a protected slot.
    pub fn saved_pte(&self, holder: SwapHandle, idx: u16) -> Option<u32> {
        self.pte_saved.get(&(holder.0, idx)).copied()
    }

    /// Whether the write fault on `(holder, idx)` belongs to this engine.
    pub fn owns_fault(&self, holder: SwapHandle, idx: u16) -> bool {
        self.pte_saved.contains_key(&(holder.0, idx))
    }

    /// Resynchronizes a reused page directory: drop stale protections, then re-apply current
    /// ones.
    pub fn pte_resync_dir(&mut self, pool: &mut SwapPool, pd: SwapHandle) {
        self.unprotect_dir(pool, pd);
        self.protect_dir(pool, pd);
    }

    /// Collects the clients watching the page a faulting write hit. The caller simulates the
    /// store first, then notifies each client once with the access size.
    pub fn clients_for_write(&self, paddr: u32) -> Vec<(MtraceHandle, MtraceClient)> {
        let page = page_of(paddr);
        let mut out = Vec::new();
        for map in [&self.begin_pages, &self.end_pages] {
            if let Some(v) = map.get(&page) {
                for &h in v {
                    if let Some(m) = self.get(h) {
                        if m.overlaps_page(page) && !out.iter().any(|&(oh, _)| oh == h) {
                            out.push((h, m.client));
                        }
                    }
                }
            }
        }
        out
    }

    /// The range a watch covers, for clients resolving overlap precisely.
    pub fn range_of(&self, h: MtraceHandle) -> Option<(u32, u32)> {
        self.get(h).map(|m| (m.start, m.len))
    }
}

impl Default for MtraceEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::shadow::{SwapPageType, SwapPool};

    fn setup() -> (MtraceEngine, SwapPool, SwapHandle, SwapHandle) {
        let mut e = MtraceEngine::new();
        let mut p = SwapPool::new(16);
        let (pd, _) = p.get_page(&mut e, 0x1000, SwapPageType::PdSupervisor).unwrap();
        let (pt, _) = p.get_page(&mut e, 0x2000, SwapPageType::PtSupervisor).unwrap();
        p.set_table_entry(pd, 0, pt, (PteFlags::P | PteFlags::U).bits());
        (e, p, pd, pt)
    }

    fn wflags() -> u32 {
        (PteFlags::P | PteFlags::W | PteFlags::A | PteFlags::U).bits()
    }

    #[test]
    fn add_clears_w_and_remove_restores() {
        let (mut e, mut p, pd, pt) = setup();
        p.set_leaf_entry(pt, 5, 0x9000, wflags());
        let before = p.entry(pt, 5);
        let h = e.add(&mut p, &[pd], 0x9000, 64, MtraceClient::Probe(1));
        assert_eq!(p.entry(pt, 5), before & !PteFlags::W.bits());
        e.remove(&mut p, &[pd], h);
        assert_eq!(p.entry(pt, 5), before, "W-bit restoration must be exact");
    }

    #[test]
    fn untraced_frames_keep_w() {
        let (mut e, mut p, pd, pt) = setup();
        p.set_leaf_entry(pt, 5, 0x9000, wflags());
        p.set_leaf_entry(pt, 6, 0xa000, wflags());
        e.add(&mut p, &[pd], 0x9000, 8, MtraceClient::Probe(1));
        assert_ne!(p.entry(pt, 6) & PteFlags::W.bits(), 0);
    }

    #[test]
    fn overlapping_watches_keep_protection_until_last_removed() {
        let (mut e, mut p, pd, pt) = setup();
        p.set_leaf_entry(pt, 5, 0x9000, wflags());
        let h1 = e.add(&mut p, &[pd], 0x9000, 8, MtraceClient::Probe(1));
        let h2 = e.add(&mut p, &[pd], 0x9100, 8, MtraceClient::Probe(2));
        e.remove(&mut p, &[pd], h1);
        assert_eq!(p.entry(pt, 5) & PteFlags::W.bits(), 0);
        e.remove(&mut p, &[pd], h2);
        assert_ne!(p.entry(pt, 5) & PteFlags::W.bits(), 0);
    }

    #[test]
    fn two_page_range_lands_in_both_hashes() {
        let (mut e, mut p, pd, _pt) = setup();
        let h = e.add(&mut p, &[pd], 0x9ffc, 8, MtraceClient::Probe(7));
        assert!(e.page_is_mtraced(0x9000));
        assert!(e.page_is_mtraced(0xa000));
        let on_first = e.clients_for_write(0x9ffc);
        let on_second = e.clients_for_write(0xa001);
        assert_eq!(on_first.len(), 1);
        assert_eq!(on_second.len(), 1);
        assert_eq!(on_first[0].0, h);
        assert_eq!(on_second[0].0, h);
    }

    #[test]
    fn filter_new_pte_respects_traces() {
        let (mut e, mut p, pd, pt) = setup();
        e.add(&mut p, &[pd], 0x9000, 16, MtraceClient::Probe(1));
        let filtered = e.filter_new_pte(pt, 8, wflags() | 0x9000, 0x9000);
        assert_eq!(filtered & PteFlags::W.bits(), 0);
        assert_eq!(e.saved_pte(pt, 8), Some(wflags() | 0x9000));
        let untouched = e.filter_new_pte(pt, 9, wflags() | 0xb000, 0xb000);
        assert_ne!(untouched & PteFlags::W.bits(), 0);
    }

    #[test]
    fn version_bumps_on_page_set_changes() {
        let (mut e, mut p, pd, _pt) = setup();
        let v0 = e.version();
        let h1 = e.add(&mut p, &[pd], 0x9000, 8, MtraceClient::Probe(1));
        assert!(e.version() > v0);
        let v1 = e.version();
        // A second watch on an already-traced page does not change the traced-page set.
        let h2 = e.add(&mut p, &[pd], 0x9010, 8, MtraceClient::Probe(2));
        assert_eq!(e.version(), v1);
        e.remove(&mut p, &[pd], h2);
        assert_eq!(e.version(), v1);
        e.remove(&mut p, &[pd], h1);
        assert!(e.version() > v1);
    }
}
