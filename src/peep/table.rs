//! The peephole table: rows mapping guest instruction templates to emitter snippets, with CPU
//! constraints, temporary-register requirements and nomatch pairs.

use std::collections::HashMap;

use super::emit::{CalloutArg, Emitter, LoopKind};
use super::matcher::{self, Assignments, NomatchPair};
use crate::arch::x86::{R_DS, R_ES};
use crate::exec::callout::Callout;
use crate::exec::layout::{GS_IF, GS_JTARGET};
use crate::insn::opcodes::Op;
use crate::insn::{Insn, MemOperand, Operand, SegType, Tag};

bitflags::bitflags! {
    /// The execution contexts a peephole row may be used in. A row is applicable when the
    /// currently active constraints are a subset of the row's.
    pub struct CpuConstraints: u32 {
        const PROTECTED      = 1 << 0;
        const REAL           = 1 << 1;
        const NO_EXCP        = 1 << 2;
        const SIMULATE       = 1 << 3;
        const FORCED_CALLOUT = 1 << 4;
    }
}

impl CpuConstraints {
    /// Rows valid in every ordinary translation context.
    pub fn any_mode() -> Self {
        CpuConstraints::PROTECTED | CpuConstraints::REAL | CpuConstraints::NO_EXCP
    }
}

/// Template slot conventions for memory-form rows: the segment, base register and displacement
/// of a matched memory operand land in fixed high slots so emit functions can find them.
pub const SLOT_SEG: u8 = 5;
pub const SLOT_BASE: u8 = 6;
pub const SLOT_DISP: u8 = 7;

/// `aux` bit marking a memory-form row whose operand has a base register.
pub const AUX_HAS_BASE: u32 = 1 << 8;

/// Everything an emit function needs about a successful match.
pub struct EmitCtx {
    /// Assignment values, indexed by template slot.
    pub vals: [i64; 8],
    /// The allocated temporary host registers.
    pub temps: Vec<u8>,
    /// The matched opcode (rows registered for several opcodes dispatch on it).
    pub opc: Op,
    /// The effective operand size of the matched instruction.
    pub opsize: u8,
    /// Row-specific auxiliary data (operand size, register number, form bits).
    pub aux: u32,
    /// The guest address of the matched instruction.
    pub cur_addr: u32,
    /// The guest address of the next instruction.
    pub fallthrough_addr: u32,
}

impl EmitCtx {
    fn v(&self, slot: u8) -> u32 {
        self.vals[slot as usize] as u32
    }

    /// The packed memory-operand callout arguments of a memory-form row:
    /// `(seg, base + 1 | 0, index + 1 | 0, scale, disp)`.
    fn mem_args(&self) -> [CalloutArg; 5] {
        let base = if self.aux & AUX_HAS_BASE != 0 {
            self.v(SLOT_BASE) + 1
        } else {
            0
        };
        [
            CalloutArg::Imm(self.v(SLOT_SEG)),
            CalloutArg::Imm(base),
            CalloutArg::Imm(0),
            CalloutArg::Imm(1),
            CalloutArg::Imm(self.v(SLOT_DISP)),
        ]
    }
}

/// One row of the peephole table.
pub struct PeepEntry {
    pub name: &'static str,
    pub tmpl: Vec<Insn>,
    pub constraints: CpuConstraints,
    pub n_temporaries: usize,
    pub temporary_tags: &'static [Tag],
    pub nomatch_pairs: &'static [NomatchPair],
    pub aux: u32,
    pub emit: fn(&mut Emitter, &EmitCtx),
}

/// A successful table lookup: the row and its bound parameters, ready to emit.
pub struct Matched<'a> {
    pub entry: &'a PeepEntry,
    pub ctx: EmitCtx,
}

/// The peephole table, hashed by a coarse signature of the instruction sequence.
pub struct PeepTable {
    buckets: HashMap<u64, Vec<PeepEntry>>,
}

fn hash_insns(insns: &[Insn]) -> u64 {
    let mut h = insns.len() as u64 * 313;
    for insn in insns {
        h = h.wrapping_add(insn.opc as u64 * 1601);
        for op in insn.op.iter() {
            h = h.wrapping_add(operand_kind_id(op) * 487);
        }
    }
    h
}

fn operand_kind_id(op: &Operand) -> u64 {
    match op {
        Operand::None => 0,
        Operand::Reg { .. } => 1,
        Operand::Seg { .. } => 2,
        Operand::Mem(_) => 3,
        Operand::Imm { .. } => 4,
        Operand::Cr { .. } => 5,
        Operand::Db { .. } => 6,
        Operand::Tr { .. } => 7,
        Operand::Mmx { .. } => 8,
        Operand::Xmm { .. } => 9,
        Operand::Prefix { .. } => 10,
    }
}

impl PeepTable {
    pub fn new() -> Self {
        let mut t = Self {
            buckets: HashMap::new(),
        };
        t.populate();
        t
    }

    fn add(&mut self, entry: PeepEntry) {
        let h = hash_insns(&entry.tmpl);
        self.buckets.entry(h).or_default().push(entry);
    }

    /// Matches the instruction sequence under the given constraints, returning the first
    /// applicable row with a coherent assignment and allocated temporaries.
    pub fn lookup(&self, insns: &[Insn], active: CpuConstraints) -> Option<Matched<'_>> {
        let bucket = self.buckets.get(&hash_insns(insns))?;
        let mut a = Assignments::default();
        for entry in bucket {
            if !entry.constraints.contains(active) {
                continue;
            }
            if !matcher::templ_matches_insns(insns, &entry.tmpl, &mut a) {
                continue;
            }
            let temps = match matcher::find_temporary_regs(
                entry.n_temporaries,
                entry.temporary_tags,
                &a,
                entry.nomatch_pairs,
            ) {
                Some(t) => t,
                None => continue,
            };
            return Some(Matched {
                entry,
                ctx: EmitCtx {
                    vals: a.values(),
                    temps,
                    opc: insns[0].opc,
                    opsize: insns[0].opsize,
                    aux: entry.aux,
                    cur_addr: 0,
                    fallthrough_addr: 0,
                },
            });
        }
        None
    }

    fn populate(&mut self) {
        self.populate_control_flow();
        self.populate_io();
        self.populate_privileged();
        self.populate_segments();
        self.populate_flags();
        self.populate_real_strings();
    }

    fn populate_control_flow(&mut self) {
        self.add(row("jmp_imm", vec![t1(Op::Jmp, imm_v(0, 4))], any(), 0, emit_jmp_imm));
        for cond in 0..16u8 {
            self.add(row(
                "jcc_imm",
                vec![t1(Op::jcc_from_cond(cond), imm_v(0, 4))],
                any(),
                0,
                emit_jcc_imm,
            ));
        }
        self.add(PeepEntry {
            name: "call_imm",
            tmpl: vec![t1(Op::Call, imm_v(0, 4))],
            constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
            n_temporaries: 0,
            temporary_tags: &[],
            nomatch_pairs: &[],
            aux: 0,
            emit: emit_call_imm_prot,
        });
        self.add(PeepEntry {
            name: "call_imm_real",
            tmpl: vec![t1(Op::Call, imm_v(0, 4))],
            constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
            n_temporaries: 0,
            temporary_tags: &[],
            nomatch_pairs: &[],
            aux: 0,
            emit: emit_call_imm_real,
        });
        self.add(PeepEntry {
            name: "ret",
            tmpl: vec![t0(Op::Ret)],
            constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
            n_temporaries: 2,
            temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
            nomatch_pairs: &[],
            aux: 0,
            emit: emit_ret_prot,
        });
        self.add(PeepEntry {
            name: "ret_imm",
            tmpl: vec![t1(Op::Ret, imm_v(0, 2))],
            constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
            n_temporaries: 2,
            temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
            nomatch_pairs: &[],
            aux: 0,
            emit: emit_ret_imm_prot,
        });
        self.add(PeepEntry {
            name: "ret_real",
            tmpl: vec![t0(Op::Ret)],
            constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
            n_temporaries: 2,
            temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
            nomatch_pairs: &[],
            aux: 0,
            emit: emit_ret_real,
        });
        self.add(PeepEntry {
            name: "jmp_ind_reg",
            tmpl: vec![t1(Op::Jmp, reg_v(0, 4))],
            constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
            n_temporaries: 1,
            temporary_tags: &[Tag::NoEsp(0)],
            nomatch_pairs: &[NomatchPair::TempVar(0, 0)],
            aux: 0,
            emit: emit_jmp_ind_reg,
        });
        for &(name, has_base) in &[("jmp_ind_mem_bd", true), ("jmp_ind_mem_d", false)] {
            self.add(PeepEntry {
                name,
                tmpl: vec![t1(Op::Jmp, mem_form(4, has_base))],
                constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
                n_temporaries: 2,
                temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
                nomatch_pairs: &[NomatchPair::TempVar(0, SLOT_BASE)],
                aux: if has_base { AUX_HAS_BASE } else { 0 },
                emit: emit_jmp_ind_mem,
            });
        }
        self.add(PeepEntry {
            name: "call_ind_reg",
            tmpl: vec![t1(Op::Call, reg_v(0, 4))],
            constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
            n_temporaries: 1,
            temporary_tags: &[Tag::NoEsp(0)],
            nomatch_pairs: &[NomatchPair::TempVar(0, 0)],
            aux: 0,
            emit: emit_call_ind_reg,
        });
        for &(name, has_base) in &[("call_ind_mem_bd", true), ("call_ind_mem_d", false)] {
            self.add(PeepEntry {
                name,
                tmpl: vec![t1(Op::Call, mem_form(4, has_base))],
                constraints: CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP,
                n_temporaries: 2,
                temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
                nomatch_pairs: &[NomatchPair::TempVar(0, SLOT_BASE)],
                aux: if has_base { AUX_HAS_BASE } else { 0 },
                emit: emit_call_ind_mem,
            });
        }
        self.add(row(
            "int_imm",
            vec![t1(Op::Int, imm_v(0, 1))],
            any(),
            0,
            emit_int_imm,
        ));
        self.add(row("hlt", vec![t0(Op::Hlt)], any(), 0, emit_hlt));
        self.add(row(
            "ljmp_direct",
            vec![t2(Op::Ljmp, imm_v(0, 2), imm_v(1, 0))],
            any(),
            0,
            emit_ljmp,
        ));
        self.add(row(
            "lcall_direct",
            vec![t2(Op::Lcall, imm_v(0, 2), imm_v(1, 0))],
            any(),
            0,
            emit_lcall,
        ));
        self.add(row("lret", vec![t0(Op::Lret)], any(), 0, emit_lret));
        self.add(row(
            "lret_imm",
            vec![t1(Op::Lret, imm_v(0, 2))],
            any(),
            0,
            emit_lret,
        ));
        self.add(row("iret", vec![t0(Op::Iret)], any(), 0, emit_iret));
        self.add(row(
            "int3",
            vec![t0(Op::Int3)],
            any(),
            0,
            emit_int3,
        ));
        self.add(row("into", vec![t0(Op::Into)], any(), 0, emit_into));
        for &op in &[Op::Loop, Op::Loopz, Op::Loopnz, Op::Jcxz] {
            self.add(row(
                "loop",
                vec![t1(op, imm_v(0, 4))],
                any(),
                0,
                emit_loop,
            ));
        }
        for &has_base in &[true, false] {
            for &addrsize in &[2u8, 4] {
                self.add(row_aux(
                    "ljmp_mem",
                    vec![t1(Op::Ljmp, mem_form(addrsize, has_base))],
                    any(),
                    if has_base { AUX_HAS_BASE } else { 0 },
                    emit_lfar_mem,
                ));
                self.add(row_aux(
                    "lcall_mem",
                    vec![t1(Op::Lcall, mem_form(addrsize, has_base))],
                    any(),
                    if has_base { AUX_HAS_BASE } else { 0 },
                    emit_lfar_mem,
                ));
            }
            // Real-mode near indirect branches resolve their 16-bit operand in the monitor.
            self.add(PeepEntry {
                name: "jmp_near_mem16",
                tmpl: vec![t1(Op::Jmp, mem_form(2, has_base))],
                constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
                n_temporaries: 0,
                temporary_tags: &[],
                nomatch_pairs: &[],
                aux: if has_base { AUX_HAS_BASE } else { 0 },
                emit: emit_near_mem16,
            });
            self.add(PeepEntry {
                name: "call_near_mem16",
                tmpl: vec![t1(Op::Call, mem_form(2, has_base))],
                constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
                n_temporaries: 0,
                temporary_tags: &[],
                nomatch_pairs: &[],
                aux: if has_base { AUX_HAS_BASE } else { 0 },
                emit: emit_near_mem16,
            });
        }
        // Real-mode register-indirect branches: the 16-bit target is widened before the probe.
        self.add(PeepEntry {
            name: "jmp_ind_reg16",
            tmpl: vec![t1(Op::Jmp, reg_v(0, 2))],
            constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
            n_temporaries: 2,
            temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
            nomatch_pairs: &[NomatchPair::TempVar(0, 0), NomatchPair::TempVar(1, 0)],
            aux: 0,
            emit: emit_jmp_ind_reg16,
        });
        self.add(PeepEntry {
            name: "call_ind_reg16",
            tmpl: vec![t1(Op::Call, reg_v(0, 2))],
            constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
            n_temporaries: 2,
            temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0)],
            nomatch_pairs: &[NomatchPair::TempVar(0, 0), NomatchPair::TempVar(1, 0)],
            aux: 0,
            emit: emit_call_ind_reg16,
        });
    }

    fn populate_io(&mut self) {
        for &size in &[1u32, 2, 4] {
            let regsz = size as u8;
            self.add(row_aux(
                "in_imm",
                vec![t2(Op::In, reg_eax(regsz), imm_v(0, 1))],
                any(),
                size,
                emit_in_imm,
            ));
            self.add(row_aux(
                "in_dx",
                vec![t2(Op::In, reg_eax(regsz), reg_c(2, 2))],
                any(),
                size,
                emit_in_dx,
            ));
            self.add(row_aux(
                "out_imm",
                vec![t2(Op::Out, imm_v(0, 1), reg_eax(regsz))],
                any(),
                size,
                emit_out_imm,
            ));
            self.add(row_aux(
                "out_dx",
                vec![t2(Op::Out, reg_c(2, 2), reg_eax(regsz))],
                any(),
                size,
                emit_out_dx,
            ));
        }
        for &addrsize in &[2u8, 4] {
            self.add(row(
                "ins",
                vec![t3(
                    Op::Ins,
                    string_mem_t(R_ES, 7, addrsize),
                    reg_c(2, 2),
                    prefix_v(1),
                )],
                any(),
                0,
                emit_ins,
            ));
            self.add(row(
                "outs",
                vec![t3(
                    Op::Outs,
                    reg_c(2, 2),
                    string_mem_t(R_DS, 6, addrsize),
                    prefix_v(1),
                )],
                any(),
                0,
                emit_outs,
            ));
        }
    }

    fn populate_privileged(&mut self) {
        for crno in 0..5u32 {
            if crno == 1 {
                continue;
            }
            self.add(row_aux(
                "mov_to_cr",
                vec![t2(Op::MovCr, cr_t(crno as u8), reg_v(0, 4))],
                any(),
                crno,
                emit_mov_to_cr,
            ));
            self.add(row_aux(
                "mov_from_cr",
                vec![t2(Op::MovCr, reg_v(0, 4), cr_t(crno as u8))],
                any(),
                crno,
                emit_mov_from_cr,
            ));
        }
        for &(op, which) in &[(Op::Lgdt, 0u32), (Op::Lidt, 1)] {
            for &has_base in &[true, false] {
                self.add(row_aux(
                    "load_dt",
                    vec![t1(op, mem_form(4, has_base))],
                    any(),
                    which | if has_base { AUX_HAS_BASE } else { 0 },
                    emit_load_dt,
                ));
                self.add(row_aux(
                    "load_dt16",
                    vec![t1(op, mem_form(2, has_base))],
                    any(),
                    which | if has_base { AUX_HAS_BASE } else { 0 },
                    emit_load_dt,
                ));
            }
        }
        for &(op, which) in &[(Op::Ltr, 0u32), (Op::Lldt, 1)] {
            self.add(row_aux(
                "ltr_reg",
                vec![t1(op, reg_v(0, 2))],
                any(),
                which,
                emit_ltr_reg,
            ));
        }
        self.add(row("invd", vec![t0(Op::Invd)], any(), 0, emit_invd));
        self.add(row("wbinvd", vec![t0(Op::Wbinvd)], any(), 0, emit_invd));
    }

    fn populate_segments(&mut self) {
        self.add(row(
            "mov_seg_reg",
            vec![t2(Op::MovSeg, seg_v(0), reg_v(1, 2))],
            any(),
            0,
            emit_mov_to_seg_reg,
        ));
        for &has_base in &[true, false] {
            for &addrsize in &[2u8, 4] {
                self.add(row_aux(
                    "mov_seg_mem",
                    vec![t2(Op::MovSeg, seg_v(0), mem_form(addrsize, has_base))],
                    any(),
                    if has_base { AUX_HAS_BASE } else { 0 },
                    emit_mov_to_seg_mem,
                ));
            }
        }
        self.add(row(
            "mov_reg_seg",
            vec![t2(Op::MovSeg, reg_v(0, 2), seg_v(1))],
            any(),
            0,
            emit_mov_from_seg,
        ));
        self.add(row(
            "push_seg",
            vec![t1(Op::PushSeg, seg_v(0))],
            any(),
            0,
            emit_push_seg,
        ));
        self.add(row(
            "pop_seg",
            vec![t1(Op::PopSeg, seg_v(0))],
            any(),
            0,
            emit_pop_seg,
        ));
        for &op in &[Op::Les, Op::Lds, Op::Lss, Op::Lfs, Op::Lgs] {
            for &has_base in &[true, false] {
                for &addrsize in &[2u8, 4] {
                    self.add(row_aux(
                        "lxs",
                        vec![t2(op, reg_v(0, 4), mem_form(addrsize, has_base))],
                        any(),
                        if has_base { AUX_HAS_BASE } else { 0 },
                        emit_lxs,
                    ));
                    self.add(row_aux(
                        "lxs16",
                        vec![t2(op, reg_v(0, 2), mem_form(addrsize, has_base))],
                        any(),
                        if has_base { AUX_HAS_BASE } else { 0 },
                        emit_lxs,
                    ));
                }
            }
        }
    }

    fn populate_flags(&mut self) {
        self.add(row("sti", vec![t0(Op::Sti)], any(), 0, emit_sti));
        self.add(row("cli", vec![t0(Op::Cli)], any(), 0, emit_cli));
        self.add(row("pushf", vec![t0(Op::Pushf)], any(), 0, emit_pushf));
        self.add(row("popf", vec![t0(Op::Popf)], any(), 0, emit_popf));
    }

    fn populate_real_strings(&mut self) {
        let rows: &[(Op, Callout)] = &[
            (Op::Movs, Callout::RealMovs),
            (Op::Stos, Callout::RealStos),
            (Op::Lods, Callout::RealLods),
            (Op::Scas, Callout::RealScas),
            (Op::Cmps, Callout::RealCmps),
        ];
        for &(op, callout) in rows {
            let mut tmpl = Insn::new(op);
            match op {
                Op::Movs | Op::Cmps => {
                    tmpl.op[0] = string_mem_t(R_ES, 7, 2);
                    tmpl.op[1] = string_mem_t(R_DS, 6, 2);
                }
                Op::Lods => tmpl.op[0] = string_mem_t(R_DS, 6, 2),
                _ => tmpl.op[0] = string_mem_t(R_ES, 7, 2),
            }
            tmpl.op[2] = prefix_v(0);
            self.add(PeepEntry {
                name: "real_string",
                tmpl: vec![tmpl],
                constraints: CpuConstraints::REAL | CpuConstraints::NO_EXCP,
                n_temporaries: 0,
                temporary_tags: &[],
                nomatch_pairs: &[],
                aux: callout as u32,
                emit: emit_real_string,
            });
        }
    }
}

impl Default for PeepTable {
    fn default() -> Self {
        Self::new()
    }
}

// Template constructors.

fn any() -> CpuConstraints {
    CpuConstraints::any_mode()
}

fn t0(opc: Op) -> Insn {
    Insn::new(opc)
}

fn t1(opc: Op, op0: Operand) -> Insn {
    let mut i = Insn::new(opc);
    i.op[0] = op0;
    i
}

fn t2(opc: Op, op0: Operand, op1: Operand) -> Insn {
    let mut i = t1(opc, op0);
    i.op[1] = op1;
    i
}

fn t3(opc: Op, op0: Operand, op1: Operand, op2: Operand) -> Insn {
    let mut i = t2(opc, op0, op1);
    i.op[2] = op2;
    i
}

fn reg_v(slot: u8, size: u8) -> Operand {
    Operand::Reg {
        id: 0,
        size,
        tag: Tag::Var(slot),
    }
}

fn reg_eax(size: u8) -> Operand {
    Operand::Reg {
        id: 0,
        size,
        tag: Tag::Const,
    }
}

fn reg_c(id: u8, size: u8) -> Operand {
    Operand::Reg {
        id,
        size,
        tag: Tag::Const,
    }
}

fn imm_v(slot: u8, size: u8) -> Operand {
    Operand::Imm {
        val: 0,
        size,
        tag: Tag::Var(slot),
    }
}

fn seg_v(slot: u8) -> Operand {
    Operand::Seg {
        id: 0,
        tag: Tag::Var(slot),
    }
}

fn cr_t(id: u8) -> Operand {
    Operand::Cr { id }
}

fn prefix_v(slot: u8) -> Operand {
    Operand::Prefix {
        bits: 0,
        tag: Tag::Var(slot),
    }
}

/// A `[base + disp]` or `[disp]` memory template in any segment, binding the fixed high slots.
fn mem_form(addrsize: u8, has_base: bool) -> Operand {
    Operand::Mem(MemOperand {
        addrsize,
        segtype: SegType::Sel,
        seg: 0,
        seg_tag: Tag::Var(SLOT_SEG),
        base: None,
        base_tag: if has_base {
            Tag::Var(SLOT_BASE)
        } else {
            Tag::Const
        },
        index: None,
        index_tag: Tag::Const,
        scale: 1,
        disp: 0,
        disp_tag: Tag::Var(SLOT_DISP),
    })
}

/// The implicit memory operand of a string instruction.
fn string_mem_t(seg: usize, base: u8, addrsize: u8) -> Operand {
    Operand::Mem(MemOperand {
        addrsize,
        segtype: SegType::Sel,
        seg: seg as u32,
        seg_tag: Tag::Const,
        base: Some(base),
        base_tag: Tag::Const,
        index: None,
        index_tag: Tag::Const,
        scale: 1,
        disp: 0,
        disp_tag: Tag::Const,
    })
}

fn row(
    name: &'static str,
    tmpl: Vec<Insn>,
    constraints: CpuConstraints,
    n_temporaries: usize,
    emit: fn(&mut Emitter, &EmitCtx),
) -> PeepEntry {
    PeepEntry {
        name,
        tmpl,
        constraints,
        n_temporaries,
        temporary_tags: &[Tag::NoEsp(0), Tag::NoEsp(0), Tag::NoEsp(0)],
        nomatch_pairs: &[],
        aux: 0,
        emit,
    }
}

fn row_aux(
    name: &'static str,
    tmpl: Vec<Insn>,
    constraints: CpuConstraints,
    aux: u32,
    emit: fn(&mut Emitter, &EmitCtx),
) -> PeepEntry {
    PeepEntry {
        aux,
        ..row(name, tmpl, constraints, 0, emit)
    }
}

// Emit functions.

fn emit_jmp_imm(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_edge(ctx.v(0));
}

fn emit_jcc_imm(e: &mut Emitter, ctx: &EmitCtx) {
    let cond = ctx.opc.jcc_cond().unwrap_or(0);
    e.emit_cond_edges(cond, ctx.v(0), ctx.fallthrough_addr);
}

/// Pushes the return address as an explicit decrement-then-store pair so that a fault on the
/// store can be rewound through the rollback buffer.
fn emit_push_return(e: &mut Emitter, fallthrough: u32, real: bool) {
    if real {
        e.bytes(&[0x66, 0x83, 0xec, 0x02]); // sub sp, 2
        e.add_rollback_point(&[0x66, 0x83, 0xc4, 0x02]); // add sp, 2
        e.bytes(&[0x66, 0xc7, 0x04, 0x24]); // mov word [esp], imm16
        e.bytes(&(fallthrough as u16).to_le_bytes());
    } else {
        e.bytes(&[0x83, 0xec, 0x04]); // sub esp, 4
        e.add_rollback_point(&[0x83, 0xc4, 0x04]); // add esp, 4
        e.bytes(&[0xc7, 0x04, 0x24]); // mov dword [esp], imm32
        e.imm32(fallthrough);
    }
}

fn emit_call_imm_prot(e: &mut Emitter, ctx: &EmitCtx) {
    emit_push_return(e, ctx.fallthrough_addr, false);
    e.emit_edge(ctx.v(0));
}

fn emit_call_imm_real(e: &mut Emitter, ctx: &EmitCtx) {
    emit_push_return(e, ctx.fallthrough_addr, true);
    e.emit_edge(ctx.v(0));
}

fn emit_ret_common(e: &mut Emitter, ctx: &EmitCtx, pop_extra: u32, real: bool) {
    let t0 = ctx.temps[0];
    let t1 = ctx.temps[1];
    e.save_temp(0, t0);
    if real {
        // movzx t0, word [esp]
        e.bytes(&[0x0f, 0xb7, 0x04 | (t0 << 3), 0x24]);
        // add sp, 2 + extra (16-bit)
        e.bytes(&[0x66, 0x83, 0xc4, (2 + pop_extra) as u8]);
    } else {
        // mov t0, [esp]
        e.bytes(&[0x8b, 0x04 | (t0 << 3), 0x24]);
        // add esp, 4 + extra
        e.bytes(&[0x83, 0xc4, (4 + pop_extra) as u8]);
    }
    e.gs_store_reg(GS_JTARGET, t0);
    e.save_temp(1, t1);
    e.emit_indirect_exit_restoring(t0, t1, Some(0), Some(1));
}

fn emit_ret_prot(e: &mut Emitter, ctx: &EmitCtx) {
    emit_ret_common(e, ctx, 0, false);
}

fn emit_ret_imm_prot(e: &mut Emitter, ctx: &EmitCtx) {
    emit_ret_common(e, ctx, ctx.v(0), false);
}

fn emit_ret_real(e: &mut Emitter, ctx: &EmitCtx) {
    emit_ret_common(e, ctx, 0, true);
}

fn emit_jmp_ind_reg(e: &mut Emitter, ctx: &EmitCtx) {
    let reg = ctx.v(0) as u8;
    e.emit_indirect_exit(reg, ctx.temps[0]);
}

fn emit_jmp_ind_mem(e: &mut Emitter, ctx: &EmitCtx) {
    let t0 = ctx.temps[0];
    let t1 = ctx.temps[1];
    e.save_temp(0, t0);
    // mov t0, [base + disp] / [disp]
    if ctx.aux & AUX_HAS_BASE != 0 {
        let base = ctx.v(SLOT_BASE) as u8;
        e.bytes(&[0x8b, 0x80 | (t0 << 3) | base]);
        if base == 4 {
            e.byte(0x24);
        }
        e.imm32(ctx.v(SLOT_DISP));
    } else {
        e.bytes(&[0x8b, 0x05 | (t0 << 3)]);
        e.imm32(ctx.v(SLOT_DISP));
    }
    e.gs_store_reg(GS_JTARGET, t0);
    e.save_temp(1, t1);
    e.emit_indirect_exit_restoring(t0, t1, Some(0), Some(1));
}

fn emit_call_ind_mem(e: &mut Emitter, ctx: &EmitCtx) {
    // The return address is pushed only after the target loads, so a faulting operand read
    // leaves no partial state to roll back.
    let t0 = ctx.temps[0];
    let t1 = ctx.temps[1];
    e.save_temp(0, t0);
    if ctx.aux & AUX_HAS_BASE != 0 {
        let base = ctx.v(SLOT_BASE) as u8;
        e.bytes(&[0x8b, 0x80 | (t0 << 3) | base]);
        if base == 4 {
            e.byte(0x24);
        }
        e.imm32(ctx.v(SLOT_DISP));
    } else {
        e.bytes(&[0x8b, 0x05 | (t0 << 3)]);
        e.imm32(ctx.v(SLOT_DISP));
    }
    emit_push_return(e, ctx.fallthrough_addr, false);
    e.gs_store_reg(GS_JTARGET, t0);
    e.save_temp(1, t1);
    e.emit_indirect_exit_restoring(t0, t1, Some(0), Some(1));
}

fn emit_call_ind_reg(e: &mut Emitter, ctx: &EmitCtx) {
    emit_push_return(e, ctx.fallthrough_addr, false);
    let reg = ctx.v(0) as u8;
    e.emit_indirect_exit(reg, ctx.temps[0]);
}

fn emit_int_imm(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Int as u32,
        &[
            CalloutArg::Imm(ctx.v(0)),
            CalloutArg::Imm(ctx.fallthrough_addr),
        ],
        None,
    );
}

fn emit_hlt(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Hlt as u32,
        &[CalloutArg::Imm(ctx.fallthrough_addr)],
        None,
    );
}

fn emit_in_imm(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::In as u32,
        &[CalloutArg::Imm(ctx.v(0)), CalloutArg::Imm(ctx.aux)],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_in_dx(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::In as u32,
        &[CalloutArg::Reg(2), CalloutArg::Imm(ctx.aux)],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_out_imm(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Out as u32,
        &[CalloutArg::Imm(ctx.v(0)), CalloutArg::Imm(ctx.aux)],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_out_dx(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Out as u32,
        &[CalloutArg::Reg(2), CalloutArg::Imm(ctx.aux)],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_ins(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Ins as u32,
        &[CalloutArg::Imm(ctx.opsize as u32), CalloutArg::Imm(ctx.v(1))],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_outs(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Outs as u32,
        &[CalloutArg::Imm(ctx.opsize as u32), CalloutArg::Imm(ctx.v(1))],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_mov_to_cr(e: &mut Emitter, ctx: &EmitCtx) {
    let callout = match ctx.aux {
        0 => Callout::MovToCr0,
        3 => Callout::MovToCr3,
        _ => Callout::MovToCr,
    };
    let mut args = vec![CalloutArg::Reg(ctx.v(0) as u8)];
    if callout == Callout::MovToCr {
        args.push(CalloutArg::Imm(ctx.aux));
    }
    args.push(CalloutArg::Imm(ctx.fallthrough_addr));
    e.emit_callout(callout as u32, &args, None);
}

fn emit_mov_from_cr(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::MovFromCr as u32,
        &[CalloutArg::Imm(ctx.aux), CalloutArg::Imm(ctx.v(0))],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_load_dt(e: &mut Emitter, ctx: &EmitCtx) {
    let which = ctx.aux & 0xff;
    let callout = if which == 0 {
        Callout::Lgdt
    } else {
        Callout::Lidt
    };
    let mut args = ctx.mem_args().to_vec();
    args.push(CalloutArg::Imm(ctx.fallthrough_addr));
    e.emit_callout(callout as u32, &args, None);
}

fn emit_ltr_reg(e: &mut Emitter, ctx: &EmitCtx) {
    let callout = if ctx.aux == 0 {
        Callout::Ltr
    } else {
        Callout::Lldt
    };
    e.emit_callout(
        callout as u32,
        &[CalloutArg::Reg(ctx.v(0) as u8)],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_invd(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(Callout::Invd as u32, &[], Some(ctx.fallthrough_addr));
}

fn emit_mov_to_seg_reg(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::MovToSeg as u32,
        &[
            CalloutArg::Imm(ctx.v(0)),
            CalloutArg::Reg(ctx.v(1) as u8),
        ],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_mov_to_seg_mem(e: &mut Emitter, ctx: &EmitCtx) {
    let mut args = vec![CalloutArg::Imm(ctx.v(0))];
    args.extend_from_slice(&ctx.mem_args());
    args.push(CalloutArg::Imm(ctx.fallthrough_addr));
    e.emit_callout(Callout::MovToSegMem as u32, &args, None);
}

fn emit_mov_from_seg(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::MovFromSeg as u32,
        &[CalloutArg::Imm(ctx.v(1)), CalloutArg::Imm(ctx.v(0))],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_push_seg(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::PushSeg as u32,
        &[CalloutArg::Imm(ctx.v(0))],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_pop_seg(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::PopSeg as u32,
        &[CalloutArg::Imm(ctx.v(0))],
        Some(ctx.fallthrough_addr),
    );
}

fn emit_lxs(e: &mut Emitter, ctx: &EmitCtx) {
    let segno = match ctx.opc {
        Op::Les => R_ES,
        Op::Lds => R_DS,
        Op::Lss => crate::arch::x86::R_SS,
        Op::Lfs => crate::arch::x86::R_FS,
        _ => crate::arch::x86::R_GS,
    };
    let mut args = vec![
        CalloutArg::Imm(segno as u32),
        CalloutArg::Imm(ctx.v(0)),
    ];
    args.extend_from_slice(&ctx.mem_args());
    args.push(CalloutArg::Imm(ctx.fallthrough_addr));
    e.emit_callout(Callout::Lxs as u32, &args, None);
}

fn emit_ljmp(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Ljmp as u32,
        &[CalloutArg::Imm(ctx.v(0)), CalloutArg::Imm(ctx.v(1))],
        None,
    );
}

fn emit_lcall(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Lcall as u32,
        &[
            CalloutArg::Imm(ctx.v(0)),
            CalloutArg::Imm(ctx.v(1)),
            CalloutArg::Imm(ctx.fallthrough_addr),
        ],
        None,
    );
}

fn emit_lret(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Lret as u32,
        &[CalloutArg::Imm(ctx.v(0))],
        None,
    );
}

fn emit_iret(e: &mut Emitter, _ctx: &EmitCtx) {
    e.emit_callout(Callout::Iret as u32, &[], None);
}

fn emit_int3(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Int as u32,
        &[CalloutArg::Imm(3), CalloutArg::Imm(ctx.fallthrough_addr)],
        None,
    );
}

fn emit_into(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        Callout::Into as u32,
        &[CalloutArg::Imm(ctx.fallthrough_addr)],
        None,
    );
}

fn emit_loop(e: &mut Emitter, ctx: &EmitCtx) {
    let kind = match ctx.opc {
        Op::Loopz => LoopKind::Loopz,
        Op::Loopnz => LoopKind::Loopnz,
        Op::Jcxz => LoopKind::Jcxz,
        _ => LoopKind::Loop,
    };
    e.emit_loop_edges(kind, ctx.opsize == 2, ctx.v(0), ctx.fallthrough_addr);
}

fn emit_lfar_mem(e: &mut Emitter, ctx: &EmitCtx) {
    let callout = if ctx.opc == Op::Ljmp {
        Callout::LjmpMem
    } else {
        Callout::LcallMem
    };
    let mut args = ctx.mem_args().to_vec();
    args.push(CalloutArg::Imm(ctx.opsize as u32));
    args.push(CalloutArg::Imm(ctx.fallthrough_addr));
    e.emit_callout(callout as u32, &args, None);
}

fn emit_near_mem16(e: &mut Emitter, ctx: &EmitCtx) {
    let callout = if ctx.opc == Op::Jmp {
        Callout::JmpNearMem
    } else {
        Callout::CallNearMem
    };
    let mut args = ctx.mem_args().to_vec();
    args.push(CalloutArg::Imm(ctx.fallthrough_addr));
    e.emit_callout(callout as u32, &args, None);
}

fn emit_jmp_ind_reg16(e: &mut Emitter, ctx: &EmitCtx) {
    let reg = ctx.v(0) as u8;
    let t0 = ctx.temps[0];
    e.save_temp(0, t0);
    // movzx t0, reg16
    e.bytes(&[0x0f, 0xb7, 0xc0 | (t0 << 3) | reg]);
    e.gs_store_reg(crate::exec::layout::GS_JTARGET, t0);
    e.save_temp(1, ctx.temps[1]);
    e.emit_indirect_exit_restoring(t0, ctx.temps[1], Some(0), Some(1));
}

fn emit_call_ind_reg16(e: &mut Emitter, ctx: &EmitCtx) {
    emit_push_return(e, ctx.fallthrough_addr, true);
    emit_jmp_ind_reg16(e, ctx);
}

fn emit_sti(e: &mut Emitter, _ctx: &EmitCtx) {
    // IF = 2: enabled after the next instruction (the sti shadow).
    e.gs_store_imm16(GS_IF, 2);
}

fn emit_cli(e: &mut Emitter, _ctx: &EmitCtx) {
    e.gs_store_imm16(GS_IF, 0);
}

fn emit_pushf(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(Callout::Pushf as u32, &[], Some(ctx.fallthrough_addr));
}

fn emit_popf(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(Callout::Popf as u32, &[], Some(ctx.fallthrough_addr));
}

fn emit_real_string(e: &mut Emitter, ctx: &EmitCtx) {
    e.emit_callout(
        ctx.aux,
        &[
            CalloutArg::Imm(ctx.opsize as u32),
            CalloutArg::Imm(ctx.v(0)),
        ],
        Some(ctx.fallthrough_addr),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::decode::decode;

    fn active_prot() -> CpuConstraints {
        CpuConstraints::PROTECTED | CpuConstraints::NO_EXCP
    }

    fn active_real() -> CpuConstraints {
        CpuConstraints::REAL | CpuConstraints::NO_EXCP
    }

    #[test]
    fn jmp_imm_matches() {
        let t = PeepTable::new();
        let insn = decode(&[0xe9, 0x10, 0x00, 0x00, 0x00], 0x1000, 4).unwrap();
        let m = t.lookup(&[insn], active_prot()).unwrap();
        assert_eq!(m.entry.name, "jmp_imm");
        assert_eq!(m.ctx.vals[0] as u32, 0x1015);
    }

    #[test]
    fn int_matches_everywhere() {
        let t = PeepTable::new();
        let insn = decode(&[0xcd, 0x13], 0x7c00, 2).unwrap();
        assert!(t.lookup(&[insn], active_real()).is_some());
        assert!(t.lookup(&[insn], active_prot()).is_some());
    }

    #[test]
    fn mode_specific_rows() {
        let t = PeepTable::new();
        let ret = decode(&[0xc3], 0, 4).unwrap();
        let prot = t.lookup(&[ret], active_prot()).unwrap();
        assert_eq!(prot.entry.name, "ret");
        let real = t.lookup(&[ret], active_real()).unwrap();
        assert_eq!(real.entry.name, "ret_real");
    }

    #[test]
    fn in_al_imm_matches_only_accumulator() {
        let t = PeepTable::new();
        let in_al = decode(&[0xe4, 0x60], 0, 4).unwrap();
        assert!(t.lookup(&[in_al], active_prot()).is_some());
    }

    #[test]
    fn plain_mov_has_no_row() {
        let t = PeepTable::new();
        let insn = decode(&[0x89, 0xd8], 0, 4).unwrap();
        assert!(t.lookup(&[insn], active_prot()).is_none());
    }

    #[test]
    fn mov_to_cr3_matches_special_row() {
        let t = PeepTable::new();
        let insn = decode(&[0x0f, 0x22, 0xd8], 0, 4).unwrap(); // mov cr3, eax
        let m = t.lookup(&[insn], active_prot()).unwrap();
        assert_eq!(m.ctx.aux, 3);
    }

    #[test]
    fn indirect_jump_temp_avoids_target_reg() {
        let t = PeepTable::new();
        let insn = decode(&[0xff, 0xe3], 0, 4).unwrap(); // jmp ebx
        let m = t.lookup(&[insn], active_prot()).unwrap();
        assert_ne!(m.ctx.temps[0], 3);
        assert_ne!(m.ctx.temps[0], 4);
    }

    #[test]
    fn real_string_rows_match_rep_movsw() {
        let t = PeepTable::new();
        let insn = decode(&[0xf3, 0xa5], 0, 2).unwrap(); // rep movsw
        let m = t.lookup(&[insn], active_real()).unwrap();
        assert_eq!(m.entry.name, "real_string");
    }
}
