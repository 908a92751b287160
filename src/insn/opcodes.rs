//! The opcode name space and the dispatch table mapping decoder rows to opcode ids.

use std::collections::HashMap;

/// An interned opcode identifier. The decoder never hands out strings; every mnemonic the
/// monitor can observe is a variant here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    Invalid,
    Mov,
    MovSeg,
    MovCr,
    MovDb,
    Movzx,
    Movsx,
    Lea,
    Xchg,
    Push,
    PushSeg,
    Pusha,
    Pushf,
    Pop,
    PopSeg,
    Popa,
    Popf,
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    Imul,
    Div,
    Idiv,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shld,
    Shrd,
    Bt,
    Bts,
    Btr,
    Btc,
    Bsf,
    Bsr,
    Setcc,
    Cmov,
    Cbw,
    Cwd,
    Jmp,
    Ljmp,
    Jo,
    Jno,
    Jb,
    Jae,
    Je,
    Jne,
    Jbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jnp,
    Jl,
    Jge,
    Jle,
    Jg,
    Call,
    Lcall,
    Ret,
    Lret,
    Iret,
    Enter,
    Leave,
    Int,
    Int3,
    Into,
    Loop,
    Loopz,
    Loopnz,
    Jcxz,
    In,
    Ins,
    Out,
    Outs,
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Xlat,
    Lds,
    Les,
    Lfs,
    Lgs,
    Lss,
    Sahf,
    Lahf,
    Cmc,
    Clc,
    Stc,
    Cli,
    Sti,
    Cld,
    Std,
    Clts,
    Hlt,
    Nop,
    Wait,
    Cpuid,
    Rdtsc,
    Rdmsr,
    Wrmsr,
    Invd,
    Wbinvd,
    Invlpg,
    Lgdt,
    Sgdt,
    Lidt,
    Sidt,
    Lldt,
    Sldt,
    Ltr,
    Str,
    Lmsw,
    Smsw,
    Verr,
    Verw,
    Arpl,
    Bound,
    Bswap,
    Cmpxchg,
    Xadd,
    Aaa,
    Aas,
    Aam,
    Aad,
    Daa,
    Das,
    Fpu,
}

impl Op {
    /// The mnemonic, as printed in disassembly dumps.
    pub fn name(self) -> &'static str {
        match self {
            Op::Invalid => "(bad)",
            Op::Mov | Op::MovSeg | Op::MovCr | Op::MovDb => "mov",
            Op::Movzx => "movzx",
            Op::Movsx => "movsx",
            Op::Lea => "lea",
            Op::Xchg => "xchg",
            Op::Push | Op::PushSeg => "push",
            Op::Pusha => "pusha",
            Op::Pushf => "pushf",
            Op::Pop | Op::PopSeg => "pop",
            Op::Popa => "popa",
            Op::Popf => "popf",
            Op::Add => "add",
            Op::Or => "or",
            Op::Adc => "adc",
            Op::Sbb => "sbb",
            Op::And => "and",
            Op::Sub => "sub",
            Op::Xor => "xor",
            Op::Cmp => "cmp",
            Op::Test => "test",
            Op::Inc => "inc",
            Op::Dec => "dec",
            Op::Neg => "neg",
            Op::Not => "not",
            Op::Mul => "mul",
            Op::Imul => "imul",
            Op::Div => "div",
            Op::Idiv => "idiv",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Sar => "sar",
            Op::Rol => "rol",
            Op::Ror => "ror",
            Op::Rcl => "rcl",
            Op::Rcr => "rcr",
            Op::Shld => "shld",
            Op::Shrd => "shrd",
            Op::Bt => "bt",
            Op::Bts => "bts",
            Op::Btr => "btr",
            Op::Btc => "btc",
            Op::Bsf => "bsf",
            Op::Bsr => "bsr",
            Op::Setcc => "set",
            Op::Cmov => "cmov",
            Op::Cbw => "cbw",
            Op::Cwd => "cwd",
            Op::Jmp => "jmp",
            Op::Ljmp => "ljmp",
            Op::Jo => "jo",
            Op::Jno => "jno",
            Op::Jb => "jb",
            Op::Jae => "jae",
            Op::Je => "je",
            Op::Jne => "jne",
            Op::Jbe => "jbe",
            Op::Ja => "ja",
            Op::Js => "js",
            Op::Jns => "jns",
            Op::Jp => "jp",
            Op::Jnp => "jnp",
            Op::Jl => "jl",
            Op::Jge => "jge",
            Op::Jle => "jle",
            Op::Jg => "jg",
            Op::Call => "call",
            Op::Lcall => "lcall",
            Op::Ret => "ret",
            Op::Lret => "lret",
            Op::Iret => "iret",
            Op::Enter => "enter",
            Op::Leave => "leave",
            Op::Int => "int",
            Op::Int3 => "int3",
            Op::Into => "into",
            Op::Loop => "loop",
            Op::Loopz => "loopz",
            Op::Loopnz => "loopnz",
            Op::Jcxz => "jcxz",
            Op::In => "in",
            Op::Ins => "ins",
            Op::Out => "out",
            Op::Outs => "outs",
            Op::Movs => "movs",
            Op::Cmps => "cmps",
            Op::Stos => "stos",
            Op::Lods => "lods",
            Op::Scas => "scas",
            Op::Xlat => "xlat",
            Op::Lds => "lds",
            Op::Les => "les",
            Op::Lfs => "lfs",
            Op::Lgs => "lgs",
            Op::Lss => "lss",
            Op::Sahf => "sahf",
            Op::Lahf => "lahf",
            Op::Cmc => "cmc",
            Op::Clc => "clc",
            Op::Stc => "stc",
            Op::Cli => "cli",
            Op::Sti => "sti",
            Op::Cld => "cld",
            Op::Std => "std",
            Op::Clts => "clts",
            Op::Hlt => "hlt",
            Op::Nop => "nop",
            Op::Wait => "wait",
            Op::Cpuid => "cpuid",
            Op::Rdtsc => "rdtsc",
            Op::Rdmsr => "rdmsr",
            Op::Wrmsr => "wrmsr",
            Op::Invd => "invd",
            Op::Wbinvd => "wbinvd",
            Op::Invlpg => "invlpg",
            Op::Lgdt => "lgdt",
            Op::Sgdt => "sgdt",
            Op::Lidt => "lidt",
            Op::Sidt => "sidt",
            Op::Lldt => "lldt",
            Op::Sldt => "sldt",
            Op::Ltr => "ltr",
            Op::Str => "str",
            Op::Lmsw => "lmsw",
            Op::Smsw => "smsw",
            Op::Verr => "verr",
            Op::Verw => "verw",
            Op::Arpl => "arpl",
            Op::Bound => "bound",
            Op::Bswap => "bswap",
            Op::Cmpxchg => "cmpxchg",
            Op::Xadd => "xadd",
            Op::Aaa => "aaa",
            Op::Aas => "aas",
            Op::Aam => "aam",
            Op::Aad => "aad",
            Op::Daa => "daa",
            Op::Das => "das",
            Op::Fpu => "(fpu)",
        }
    }

    /// Whether an instruction with this opcode ends a translation block. Branches, returns,
    /// software interrupts, halts and moves into cr0/cr3 all hand control back to the monitor.
    pub fn is_terminating(self) -> bool {
        matches!(
            self,
            Op::Jmp
                | Op::Ljmp
                | Op::Call
                | Op::Lcall
                | Op::Ret
                | Op::Lret
                | Op::Iret
                | Op::Int
                | Op::Int3
                | Op::Into
                | Op::Hlt
                | Op::Loop
                | Op::Loopz
                | Op::Loopnz
                | Op::Jcxz
                | Op::MovCr
        ) || self.jcc_cond().is_some()
    }

    /// The condition code of a conditional near jump, if this is one.
    pub fn jcc_cond(self) -> Option<u8> {
        let cond = match self {
            Op::Jo => 0,
            Op::Jno => 1,
            Op::Jb => 2,
            Op::Jae => 3,
            Op::Je => 4,
            Op::Jne => 5,
            Op::Jbe => 6,
            Op::Ja => 7,
            Op::Js => 8,
            Op::Jns => 9,
            Op::Jp => 10,
            Op::Jnp => 11,
            Op::Jl => 12,
            Op::Jge => 13,
            Op::Jle => 14,
            Op::Jg => 15,
            _ => return None,
        };
        Some(cond)
    }

    /// The conditional jump opcode for a condition code.
    pub fn jcc_from_cond(cond: u8) -> Op {
        match cond & 0xf {
            0 => Op::Jo,
            1 => Op::Jno,
            2 => Op::Jb,
            3 => Op::Jae,
            4 => Op::Je,
            5 => Op::Jne,
            6 => Op::Jbe,
            7 => Op::Ja,
            8 => Op::Js,
            9 => Op::Jns,
            10 => Op::Jp,
            11 => Op::Jnp,
            12 => Op::Jl,
            13 => Op::Jge,
            14 => Op::Jle,
            _ => Op::Jg,
        }
    }

    /// Whether this is one of the string operations.
    pub fn is_string_op(self) -> bool {
        matches!(
            self,
            Op::Movs | Op::Cmps | Op::Stos | Op::Lods | Op::Scas | Op::Ins | Op::Outs
        )
    }

    pub fn is_push(self) -> bool {
        matches!(self, Op::Push | Op::PushSeg | Op::Pusha | Op::Pushf)
    }

    pub fn is_pop(self) -> bool {
        matches!(self, Op::Pop | Op::PopSeg | Op::Popa | Op::Popf)
    }
}

/// The dispatch table: `(dispatch number, size flag)` uniquely identifies an opcode row the way
/// the disassembler tables do. Dispatch numbers are the primary opcode byte, `0x100 |` the
/// second byte for two-byte opcodes, and `0x200 + group * 8 + reg` for modrm-group rows.
pub struct OpcTable {
    rows: HashMap<(u16, u8), Op>,
}

/// Base dispatch number of modrm-group rows.
pub const DP_GROUP_BASE: u16 = 0x200;

/// Builds the dispatch number of a group row.
#[inline]
pub fn group_dp(group: u8, reg: u8) -> u16 {
    DP_GROUP_BASE + (group as u16) * 8 + reg as u16
}

impl OpcTable {
    pub fn new() -> Self {
        let mut t = Self {
            rows: HashMap::new(),
        };
        t.populate();
        t
    }

    /// Registers an opcode row for both size flags.
    fn insert(&mut self, dp_num: u16, op: Op) {
        self.insert_sized(dp_num, 2, op);
        self.insert_sized(dp_num, 4, op);
    }

    /// Registers an opcode row for one size flag.
    fn insert_sized(&mut self, dp_num: u16, sizeflag: u8, op: Op) {
        self.rows.insert((dp_num, sizeflag), op);
    }

    /// Looks up an opcode row; [`Op::Invalid`] when the row is empty.
    pub fn find(&self, dp_num: u16, sizeflag: u8) -> Op {
        self.rows
            .get(&(dp_num, sizeflag))
            .copied()
            .unwrap_or(Op::Invalid)
    }

    fn populate(&mut self) {
        // The 0x00..0x3f ALU block repeats every eight bytes.
        let alu = [
            Op::Add,
            Op::Or,
            Op::Adc,
            Op::Sbb,
            Op::And,
            Op::Sub,
            Op::Xor,
            Op::Cmp,
        ];
        for (i, &op) in alu.iter().enumerate() {
            let base = (i * 8) as u16;
            for form in 0..6 {
                self.insert(base + form, op);
            }
        }
        self.insert(0x06, Op::PushSeg);
        self.insert(0x07, Op::PopSeg);
        self.insert(0x0e, Op::PushSeg);
        self.insert(0x16, Op::PushSeg);
        self.insert(0x17, Op::PopSeg);
        self.insert(0x1e, Op::PushSeg);
        self.insert(0x1f, Op::PopSeg);
        self.insert(0x27, Op::Daa);
        self.insert(0x2f, Op::Das);
        self.insert(0x37, Op::Aaa);
        self.insert(0x3f, Op::Aas);
        for b in 0x40..0x48 {
            self.insert(b, Op::Inc);
        }
        for b in 0x48..0x50 {
            self.insert(b, Op::Dec);
        }
        for b in 0x50..0x58 {
            self.insert(b, Op::Push);
        }
        for b in 0x58..0x60 {
            self.insert(b, Op::Pop);
        }
        self.insert(0x60, Op::Pusha);
        self.insert(0x61, Op::Popa);
        self.insert(0x62, Op::Bound);
        self.insert(0x63, Op::Arpl);
        self.insert(0x68, Op::Push);
        self.insert(0x69, Op::Imul);
        self.insert(0x6a, Op::Push);
        self.insert(0x6b, Op::Imul);
        self.insert(0x6c, Op::Ins);
        self.insert(0x6d, Op::Ins);
        self.insert(0x6e, Op::Outs);
        self.insert(0x6f, Op::Outs);
        for b in 0x70..0x80u16 {
            self.insert(b, Op::jcc_from_cond((b - 0x70) as u8));
        }
        self.insert(0x84, Op::Test);
        self.insert(0x85, Op::Test);
        self.insert(0x86, Op::Xchg);
        self.insert(0x87, Op::Xchg);
        for b in 0x88..0x8c {
            self.insert(b, Op::Mov);
        }
        self.insert(0x8c, Op::MovSeg);
        self.insert(0x8d, Op::Lea);
        self.insert(0x8e, Op::MovSeg);
        self.insert(0x8f, Op::Pop);
        for b in 0x90..0x98 {
            self.insert(b, Op::Xchg);
        }
        self.insert(0x90, Op::Nop);
        self.insert(0x98, Op::Cbw);
        self.insert(0x99, Op::Cwd);
        self.insert(0x9a, Op::Lcall);
        self.insert(0x9b, Op::Wait);
        self.insert(0x9c, Op::Pushf);
        self.insert(0x9d, Op::Popf);
        self.insert(0x9e, Op::Sahf);
        self.insert(0x9f, Op::Lahf);
        for b in 0xa0..0xa4 {
            self.insert(b, Op::Mov);
        }
        self.insert(0xa4, Op::Movs);
        self.insert(0xa5, Op::Movs);
        self.insert(0xa6, Op::Cmps);
        self.insert(0xa7, Op::Cmps);
        self.insert(0xa8, Op::Test);
        self.insert(0xa9, Op::Test);
        self.insert(0xaa, Op::Stos);
        self.insert(0xab, Op::Stos);
        self.insert(0xac, Op::Lods);
        self.insert(0xad, Op::Lods);
        self.insert(0xae, Op::Scas);
        self.insert(0xaf, Op::Scas);
        for b in 0xb0..0xc0 {
            self.insert(b, Op::Mov);
        }
        self.insert(0xc2, Op::Ret);
        self.insert(0xc3, Op::Ret);
        self.insert(0xc4, Op::Les);
        self.insert(0xc5, Op::Lds);
        self.insert(0xc6, Op::Mov);
        self.insert(0xc7, Op::Mov);
        self.insert(0xc8, Op::Enter);
        self.insert(0xc9, Op::Leave);
        self.insert(0xca, Op::Lret);
        self.insert(0xcb, Op::Lret);
        self.insert(0xcc, Op::Int3);
        self.insert(0xcd, Op::Int);
        self.insert(0xce, Op::Into);
        self.insert(0xcf, Op::Iret);
        self.insert(0xd4, Op::Aam);
        self.insert(0xd5, Op::Aad);
        self.insert(0xd7, Op::Xlat);
        for b in 0xd8..0xe0 {
            self.insert(b, Op::Fpu);
        }
        self.insert(0xe0, Op::Loopnz);
        self.insert(0xe1, Op::Loopz);
        self.insert(0xe2, Op::Loop);
        self.insert(0xe3, Op::Jcxz);
        self.insert(0xe4, Op::In);
        self.insert(0xe5, Op::In);
        self.insert(0xe6, Op::Out);
        self.insert(0xe7, Op::Out);
        self.insert(0xe8, Op::Call);
        self.insert(0xe9, Op::Jmp);
        self.insert(0xea, Op::Ljmp);
        self.insert(0xeb, Op::Jmp);
        self.insert(0xec, Op::In);
        self.insert(0xed, Op::In);
        self.insert(0xee, Op::Out);
        self.insert(0xef, Op::Out);
        self.insert(0xf4, Op::Hlt);
        self.insert(0xf5, Op::Cmc);
        self.insert(0xf8, Op::Clc);
        self.insert(0xf9, Op::Stc);
        self.insert(0xfa, Op::Cli);
        self.insert(0xfb, Op::Sti);
        self.insert(0xfc, Op::Cld);
        self.insert(0xfd, Op::Std);

        // Two-byte opcodes.
        self.insert(0x106, Op::Clts);
        self.insert(0x108, Op::Invd);
        self.insert(0x109, Op::Wbinvd);
        self.insert(0x120, Op::MovCr);
        self.insert(0x121, Op::MovDb);
        self.insert(0x122, Op::MovCr);
        self.insert(0x123, Op::MovDb);
        self.insert(0x130, Op::Wrmsr);
        self.insert(0x131, Op::Rdtsc);
        self.insert(0x132, Op::Rdmsr);
        for b in 0x140..0x150 {
            self.insert(b, Op::Cmov);
        }
        for b in 0x180..0x190u16 {
            self.insert(b, Op::jcc_from_cond((b - 0x180) as u8));
        }
        for b in 0x190..0x1a0 {
            self.insert(b, Op::Setcc);
        }
        self.insert(0x1a0, Op::PushSeg);
        self.insert(0x1a1, Op::PopSeg);
        self.insert(0x1a2, Op::Cpuid);
        self.insert(0x1a3, Op::Bt);
        self.insert(0x1a4, Op::Shld);
        self.insert(0x1a5, Op::Shld);
        self.insert(0x1a8, Op::PushSeg);
        self.insert(0x1a9, Op::PopSeg);
        self.insert(0x1ab, Op::Bts);
        self.insert(0x1ac, Op::Shrd);
        self.insert(0x1ad, Op::Shrd);
        self.insert(0x1af, Op::Imul);
        self.insert(0x1b0, Op::Cmpxchg);
        self.insert(0x1b1, Op::Cmpxchg);
        self.insert(0x1b2, Op::Lss);
        self.insert(0x1b3, Op::Btr);
        self.insert(0x1b4, Op::Lfs);
        self.insert(0x1b5, Op::Lgs);
        self.insert(0x1b6, Op::Movzx);
        self.insert(0x1b7, Op::Movzx);
        self.insert(0x1bb, Op::Btc);
        self.insert(0x1bc, Op::Bsf);
        self.insert(0x1bd, Op::Bsr);
        self.insert(0x1be, Op::Movsx);
        self.insert(0x1bf, Op::Movsx);
        self.insert(0x1c0, Op::Xadd);
        self.insert(0x1c1, Op::Xadd);
        for b in 0x1c8..0x1d0 {
            self.insert(b, Op::Bswap);
        }

        // Group 1: 0x80..0x83 immediates.
        for (reg, &op) in alu.iter().enumerate() {
            self.insert(group_dp(1, reg as u8), op);
        }
        // Group 2: shifts and rotates.
        let shifts = [
            Op::Rol,
            Op::Ror,
            Op::Rcl,
            Op::Rcr,
            Op::Shl,
            Op::Shr,
            Op::Shl,
            Op::Sar,
        ];
        for (reg, &op) in shifts.iter().enumerate() {
            self.insert(group_dp(2, reg as u8), op);
        }
        // Group 3: 0xf6/0xf7.
        let grp3 = [
            Op::Test,
            Op::Test,
            Op::Not,
            Op::Neg,
            Op::Mul,
            Op::Imul,
            Op::Div,
            Op::Idiv,
        ];
        for (reg, &op) in grp3.iter().enumerate() {
            self.insert(group_dp(3, reg as u8), op);
        }
        // Group 4: 0xfe.
        self.insert(group_dp(4, 0), Op::Inc);
        self.insert(group_dp(4, 1), Op::Dec);
        // Group 5: 0xff.
        let grp5 = [
            Op::Inc,
            Op::Dec,
            Op::Call,
            Op::Lcall,
            Op::Jmp,
            Op::Ljmp,
            Op::Push,
        ];
        for (reg, &op) in grp5.iter().enumerate() {
            self.insert(group_dp(5, reg as u8), op);
        }
        // Group 6: 0x0f 0x00.
        let grp6 = [Op::Sldt, Op::Str, Op::Lldt, Op::Ltr, Op::Verr, Op::Verw];
        for (reg, &op) in grp6.iter().enumerate() {
            self.insert(group_dp(6, reg as u8), op);
        }
        // Group 7: 0x0f 0x01.
        let grp7 = [
            Op::Sgdt,
            Op::Sidt,
            Op::Lgdt,
            Op::Lidt,
            Op::Smsw,
            Op::Invalid,
            Op::Lmsw,
            Op::Invlpg,
        ];
        for (reg, &op) in grp7.iter().enumerate() {
            self.insert(group_dp(7, reg as u8), op);
        }
    }
}

impl Default for OpcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_rows_resolve() {
        let t = OpcTable::new();
        assert_eq!(t.find(0x88, 4), Op::Mov);
        assert_eq!(t.find(0xcd, 2), Op::Int);
        assert_eq!(t.find(0x1b6, 4), Op::Movzx);
        assert_eq!(t.find(group_dp(5, 4), 4), Op::Jmp);
        assert_eq!(t.find(group_dp(7, 2), 4), Op::Lgdt);
        assert_eq!(t.find(0x0f, 4), Op::Invalid);
    }

    #[test]
    fn terminating_classification() {
        assert!(Op::Jmp.is_terminating());
        assert!(Op::Hlt.is_terminating());
        assert!(Op::MovCr.is_terminating());
        assert!(Op::Jne.is_terminating());
        assert!(!Op::Mov.is_terminating());
        assert!(!Op::Sti.is_terminating());
    }

    #[test]
    fn jcc_cond_roundtrip() {
        for cond in 0..16u8 {
            assert_eq!(Op::jcc_from_cond(cond).jcc_cond(), Some(cond));
        }
    }
}
