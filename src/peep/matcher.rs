//! Template matching for the peephole table: wildcard binding with coherence checking, and
//! temporary-register allocation against the bound assignment.

use crate::insn::{Insn, MemOperand, Operand, Tag};
use crate::arch::x86::NUM_REGS;

/// A value bound to a template slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Bound {
    Reg(u8),
    Seg(u8),
    Imm(u64),
}

impl Bound {
    pub fn value(self) -> i64 {
        match self {
            Bound::Reg(r) => r as i64,
            Bound::Seg(s) => s as i64,
            Bound::Imm(v) => v as i64,
        }
    }
}

/// The slot-indexed assignment produced by a successful match.
#[derive(Clone, Debug, Default)]
pub struct Assignments {
    slots: [Option<Bound>; 8],
}

impl Assignments {
    pub fn clear(&mut self) {
        self.slots = [None; 8];
    }

    pub fn get(&self, slot: u8) -> Option<Bound> {
        self.slots[slot as usize]
    }

    /// Binds `slot` to `value`; a second binding must agree with the first.
    fn bind(&mut self, tag: Tag, value: Bound) -> bool {
        let slot = match tag.slot() {
            Some(s) => s,
            None => return false,
        };
        if let Bound::Reg(r) = value {
            if !tag.admits_reg(r as u32) {
                return false;
            }
        }
        match self.slots[slot as usize] {
            None => {
                self.slots[slot as usize] = Some(value);
                true
            }
            Some(prev) => prev == value,
        }
    }

    /// The registers bound anywhere in the assignment.
    pub fn bound_regs(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Some(Bound::Reg(r)) => Some(*r),
            _ => None,
        })
    }

    /// Flattens the assignment into emitter parameters, indexed by slot.
    pub fn values(&self) -> [i64; 8] {
        let mut vals = [0i64; 8];
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(b) = slot {
                vals[i] = b.value();
            }
        }
        vals
    }
}

fn match_tagged_reg(tag: Tag, templ_val: u8, op_val: u8, a: &mut Assignments) -> bool {
    match tag {
        Tag::Const => templ_val == op_val,
        _ => a.bind(tag, Bound::Reg(op_val)),
    }
}

fn match_tagged_imm(tag: Tag, templ_val: u64, op_val: u64, a: &mut Assignments) -> bool {
    match tag {
        Tag::Const => templ_val == op_val,
        _ => a.bind(tag, Bound::Imm(op_val)),
    }
}

fn mem_operands_match(op: &MemOperand, templ: &MemOperand, a: &mut Assignments) -> bool {
    if op.addrsize != templ.addrsize || op.segtype != templ.segtype {
        return false;
    }
    if op.scale != templ.scale {
        return false;
    }
    // Segment field.
    match templ.seg_tag {
        Tag::Const => {
            if op.seg != templ.seg {
                return false;
            }
        }
        tag => {
            if !a.bind(tag, Bound::Seg(op.seg as u8)) {
                return false;
            }
        }
    }
    // Base and index: a variable register field cannot bind "no register".
    match (templ.base_tag, templ.base, op.base) {
        (Tag::Const, tb, ob) => {
            if tb != ob {
                return false;
            }
        }
        (tag, _, Some(ob)) => {
            if !a.bind(tag, Bound::Reg(ob)) {
                return false;
            }
        }
        (_, _, None) => return false,
    }
    match (templ.index_tag, templ.index, op.index) {
        (Tag::Const, ti, oi) => {
            if ti != oi {
                return false;
            }
        }
        (tag, _, Some(oi)) => {
            if !a.bind(tag, Bound::Reg(oi)) {
                return false;
            }
        }
        (_, _, None) => return false,
    }
    match_tagged_imm(templ.disp_tag, templ.disp as u64, op.disp as u64, a)
}

fn operands_match(op: &Operand, templ: &Operand, a: &mut Assignments) -> bool {
    match (op, templ) {
        (Operand::None, Operand::None) => true,
        (
            Operand::Reg { id, size, .. },
            Operand::Reg {
                id: tid,
                size: tsize,
                tag,
            },
        ) => *size == *tsize && match_tagged_reg(*tag, *tid, *id, a),
        (Operand::Seg { id, .. }, Operand::Seg { id: tid, tag }) => match *tag {
            Tag::Const => id == tid,
            tag => a.bind(tag, Bound::Seg(*id)),
        },
        (Operand::Imm { val, size, .. }, Operand::Imm { val: tval, size: tsize, tag }) => {
            if *tsize == 0 || size == tsize {
                // A zero-sized template immediate matches any width.
                match_tagged_imm(*tag, *tval, *val, a)
            } else if *size == 0 {
                // A size-agnostic constant matches a sized immediate template if it fits.
                if *val < (1u64 << (*tsize as u32 * 8)) {
                    match_tagged_imm(*tag, *tval, *val, a)
                } else {
                    false
                }
            } else {
                false
            }
        }
        (Operand::Mem(m), Operand::Mem(tm)) => mem_operands_match(m, tm, a),
        (Operand::Cr { id }, Operand::Cr { id: tid }) => id == tid,
        (Operand::Db { id }, Operand::Db { id: tid }) => id == tid,
        (Operand::Prefix { bits, .. }, Operand::Prefix { bits: tbits, tag }) => match *tag {
            Tag::Const => bits == tbits,
            tag => a.bind(tag, Bound::Imm(*bits as u64)),
        },
        _ => false,
    }
}

/// Matches an instruction sequence against a template sequence, producing the binding in `a`.
pub fn templ_matches_insns(insns: &[Insn], templ: &[Insn], a: &mut Assignments) -> bool {
    a.clear();
    if insns.len() != templ.len() {
        return false;
    }
    for (insn, t) in insns.iter().zip(templ.iter()) {
        if insn.opc != t.opc {
            return false;
        }
        for (op, top) in insn.op.iter().zip(t.op.iter()) {
            if !operands_match(op, top, a) {
                return false;
            }
        }
    }
    true
}

/// A forbidden co-assignment between a temporary and another binding.
#[derive(Clone, Copy, Debug)]
pub enum NomatchPair {
    /// Temporary `temp` must not be the literal register.
    TempReg(u8, u8),
    /// Temporary `temp` must not alias the register bound to `slot`.
    TempVar(u8, u8),
}

/// Allocates `n` temporary host registers not used by the match, honoring per-temporary tag
/// constraints and the rule's nomatch pairs. Returns `None` if the register file is exhausted.
pub fn find_temporary_regs(
    n: usize,
    tags: &[Tag],
    a: &Assignments,
    nomatch: &[NomatchPair],
) -> Option<Vec<u8>> {
    let mut taken = [false; NUM_REGS];
    for r in a.bound_regs() {
        taken[r as usize] = true;
    }
    let mut temps = Vec::with_capacity(n);
    for t in 0..n {
        let tag = tags.get(t).copied().unwrap_or(Tag::Var(0));
        let mut chosen = None;
        for r in (0..NUM_REGS as u8).rev() {
            if taken[r as usize] || !tag.admits_reg(r as u32) {
                continue;
            }
            let violates = nomatch.iter().any(|nm| match *nm {
                NomatchPair::TempReg(temp, reg) => temp as usize == t && reg == r,
                NomatchPair::TempVar(temp, slot) => {
                    temp as usize == t
                        && matches!(a.get(slot), Some(Bound::Reg(b)) if b == r)
                }
            });
            if violates {
                continue;
            }
            chosen = Some(r);
            break;
        }
        let r = chosen?;
        taken[r as usize] = true;
        temps.push(r);
    }
    Some(temps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::decode::decode;
    use crate::insn::opcodes::Op;
    use crate::insn::SegType;

    fn reg_t(slot: u8, size: u8) -> Operand {
        Operand::Reg {
            id: 0,
            size,
            tag: Tag::Var(slot),
        }
    }

    fn imm_t(slot: u8, size: u8) -> Operand {
        Operand::Imm {
            val: 0,
            size,
            tag: Tag::Var(slot),
        }
    }

    #[test]
    fn binds_wildcard_register_and_imm() {
        let insn = decode(&[0xb9, 0x44, 0x33, 0x22, 0x11], 0, 4).unwrap(); // mov ecx, imm
        let mut templ = Insn::new(Op::Mov);
        templ.op[0] = reg_t(0, 4);
        templ.op[1] = imm_t(1, 4);
        let mut a = Assignments::default();
        assert!(templ_matches_insns(&[insn], &[templ], &mut a));
        assert_eq!(a.get(0), Some(Bound::Reg(1)));
        assert_eq!(a.get(1), Some(Bound::Imm(0x1122_3344)));
    }

    #[test]
    fn rebinding_must_agree() {
        // xor eax, eax matches "xor v0, v0"; xor eax, ecx must not.
        let mut templ = Insn::new(Op::Xor);
        templ.op[0] = reg_t(0, 4);
        templ.op[1] = reg_t(0, 4);
        let same = decode(&[0x31, 0xc0], 0, 4).unwrap();
        let diff = decode(&[0x31, 0xc8], 0, 4).unwrap();
        let mut a = Assignments::default();
        assert!(templ_matches_insns(&[same], &[templ], &mut a));
        assert!(!templ_matches_insns(&[diff], &[templ], &mut a));
    }

    #[test]
    fn eax_tag_constrains() {
        let mut templ = Insn::new(Op::Mov);
        templ.op[0] = Operand::Reg {
            id: 0,
            size: 4,
            tag: Tag::Eax(0),
        };
        templ.op[1] = imm_t(1, 4);
        let eax = decode(&[0xb8, 0, 0, 0, 0], 0, 4).unwrap();
        let ecx = decode(&[0xb9, 0, 0, 0, 0], 0, 4).unwrap();
        let mut a = Assignments::default();
        assert!(templ_matches_insns(&[eax], &[templ], &mut a));
        assert!(!templ_matches_insns(&[ecx], &[templ], &mut a));
    }

    #[test]
    fn mem_fields_match_structurally() {
        // template: mov v0, [v1 + disp v2] in ds
        let insn = decode(&[0x8b, 0x43, 0x08], 0, 4).unwrap(); // mov eax, [ebx+8]
        let mut templ = Insn::new(Op::Mov);
        templ.op[0] = reg_t(0, 4);
        templ.op[1] = Operand::Mem(MemOperand {
            addrsize: 4,
            segtype: SegType::Sel,
            seg: crate::arch::x86::R_DS as u32,
            seg_tag: Tag::Const,
            base: None,
            base_tag: Tag::Var(1),
            index: None,
            index_tag: Tag::Const,
            scale: 1,
            disp: 0,
            disp_tag: Tag::Var(2),
        });
        let mut a = Assignments::default();
        assert!(templ_matches_insns(&[insn], &[templ], &mut a));
        assert_eq!(a.get(1), Some(Bound::Reg(3)));
        assert_eq!(a.get(2), Some(Bound::Imm(8)));
    }

    #[test]
    fn temporaries_avoid_bound_regs_and_nomatch() {
        let mut a = Assignments::default();
        let mut templ = Insn::new(Op::Mov);
        templ.op[0] = reg_t(0, 4);
        templ.op[1] = imm_t(1, 4);
        let insn = decode(&[0xbf, 0, 0, 0, 0], 0, 4).unwrap(); // mov edi, imm
        assert!(templ_matches_insns(&[insn], &[templ], &mut a));
        let temps = find_temporary_regs(
            2,
            &[Tag::Var(0), Tag::NoEsp(0)],
            &a,
            &[NomatchPair::TempReg(0, 6)],
        )
        .unwrap();
        assert_eq!(temps.len(), 2);
        assert!(!temps.contains(&7)); // bound to the match
        assert_ne!(temps[0], 6); // nomatch pair
        assert_ne!(temps[1], 4); // NoEsp
        assert_ne!(temps[0], temps[1]);
    }
}
