//! Length-disassembly opcode classification.
//!
//! Given an opcode byte (or a two-/three-byte opcode map escape), classify
//! the instruction's static
//! shape — does it carry a ModR/M byte, what immediate width does it use,
//! and is it one of the relative-branch forms the graph needs to track.
//! Encoded as `match` over opcode ranges rather than a literal 256-entry
//! array; both compile to the same jump table, and the ranges read closer
//! to the Intel manual's own grouping of the one-byte opcode map.

use super::flags::InstructionFlags;

/// Immediate/displacement-adjacent operand that trails the ModR/M+SIB+disp
/// bytes (or stands alone for opcodes with no ModR/M).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmClass {
    /// No immediate operand.
    None,
    /// Always one byte (e.g. `push imm8`, shift-by-imm8, most `rel8` branches).
    Imm8,
    /// Always two bytes (e.g. `ret imm16`, `enter`'s first operand).
    Imm16,
    /// 16 bits under the operand-size override prefix (0x66), 32 bits
    /// otherwise — the `Iz`/`Jz` class in the Intel manual.
    ImmFull,
    /// `enter imm16, imm8`: two bytes then one.
    EnterImm,
    /// `ptr16:32` absolute far pointer (`call`/`jmp far`): 4-byte offset
    /// plus 2-byte segment selector, unaffected by the operand-size prefix.
    FarPtr,
    /// Decided by the ModR/M `reg` field at decode time (opcode groups
    /// F6/F7 — `test r/m, imm` takes an immediate, the rest of the group
    /// does not).
    GroupF6F7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    None,
    /// `EB` — short unconditional jump, rel8.
    JmpRel8,
    /// `E9` — near unconditional jump, rel32.
    JmpRel32,
    /// `70-7F` — short conditional jump, rel8.
    JccRel8,
    /// `0F 80-8F` — near conditional jump, rel32.
    JccRel32,
    /// `E8` — near call, rel32.
    CallRel32,
    /// `E0/E1/E2/E3` — LOOPNE/LOOPE/LOOP/JECXZ, rel8.
    LoopRel8,
    /// A widened `LoopRel8`: the 9-byte short/relay/`jmp rel32` sandwich
    /// built by [`crate::graph::CodeGraph::widen_all_branches`] (there is no
    /// direct LOOP/JECXZ rel32 encoding).
    LoopRelayRel32,
}

impl BranchKind {
    pub fn to_flags(self) -> InstructionFlags {
        match self {
            BranchKind::None => InstructionFlags::empty(),
            BranchKind::JmpRel8 => {
                InstructionFlags::IS_JMP | InstructionFlags::IS_BRANCH_REL8 | InstructionFlags::IS_SHORT
            }
            BranchKind::JmpRel32 => InstructionFlags::IS_JMP | InstructionFlags::IS_BRANCH_REL32,
            BranchKind::JccRel8 => {
                InstructionFlags::IS_JCC | InstructionFlags::IS_BRANCH_REL8 | InstructionFlags::IS_SHORT
            }
            BranchKind::JccRel32 => InstructionFlags::IS_JCC | InstructionFlags::IS_BRANCH_REL32,
            BranchKind::CallRel32 => InstructionFlags::IS_CALL | InstructionFlags::IS_BRANCH_REL32,
            BranchKind::LoopRel8 => {
                InstructionFlags::IS_JCC | InstructionFlags::IS_BRANCH_REL8 | InstructionFlags::IS_SHORT
            }
            BranchKind::LoopRelayRel32 => InstructionFlags::IS_JCC | InstructionFlags::IS_BRANCH_REL32,
        }
    }

    /// Displacement width in bytes for the branch's current (non-widened) form.
    pub fn disp_size(self) -> u8 {
        match self {
            BranchKind::None => 0,
            BranchKind::JmpRel8 | BranchKind::JccRel8 | BranchKind::LoopRel8 => 1,
            BranchKind::JmpRel32 | BranchKind::JccRel32 | BranchKind::CallRel32 => 4,
            BranchKind::LoopRelayRel32 => 4,
        }
    }

    /// Byte offset of the 4-byte (or 1-byte, pre-widening) relative
    /// displacement field within the instruction's encoded bytes, and its
    /// width. `None` for non-branches.
    pub fn disp_field(self) -> Option<(usize, usize)> {
        match self {
            BranchKind::None => None,
            BranchKind::JmpRel8 | BranchKind::JccRel8 | BranchKind::LoopRel8 => Some((1, 1)),
            BranchKind::JmpRel32 | BranchKind::CallRel32 => Some((1, 4)),
            BranchKind::JccRel32 => Some((2, 4)),
            BranchKind::LoopRelayRel32 => Some((5, 4)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub has_modrm: bool,
    pub imm: ImmClass,
    pub branch: BranchKind,
    pub is_ret: bool,
    /// Opcode is not recognized by this table; the decoder aborts rather
    /// than best-effort skipping it.
    pub undefined: bool,
}

impl OpInfo {
    const fn plain(has_modrm: bool, imm: ImmClass) -> Self {
        OpInfo {
            has_modrm,
            imm,
            branch: BranchKind::None,
            is_ret: false,
            undefined: false,
        }
    }

    const fn branch(kind: BranchKind) -> Self {
        OpInfo {
            has_modrm: false,
            imm: ImmClass::None,
            branch: kind,
            is_ret: false,
            undefined: false,
        }
    }

    const fn ret(imm: ImmClass) -> Self {
        OpInfo {
            has_modrm: false,
            imm,
            branch: BranchKind::None,
            is_ret: true,
            undefined: false,
        }
    }

    const fn bad() -> Self {
        OpInfo {
            has_modrm: false,
            imm: ImmClass::None,
            branch: BranchKind::None,
            is_ret: false,
            undefined: true,
        }
    }
}

/// Classify a one-byte (legacy map) opcode.
pub fn one_byte_info(op: u8) -> OpInfo {
    match op {
        // ALU group (add/or/adc/sbb/and/sub/xor/cmp): 8 families * 8 forms
        // each. Forms 0/1 = Eb,Gb / Ev,Gv (modrm, no imm); 2/3 = Gb,Eb /
        // Gv,Ev (modrm, no imm); 4 = AL,Ib (imm8); 5 = eAX,Iz (immFull).
        0x00..=0x3D if is_alu_family_byte(op) => alu_form(op),
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => OpInfo::plain(false, ImmClass::None), // PUSH/POP segment register
        0x27 | 0x2F | 0x37 | 0x3F => OpInfo::plain(false, ImmClass::None), // DAA/DAS/AAA/AAS

        0x40..=0x4F => OpInfo::plain(false, ImmClass::None), // INC/DEC r32 (no REX in 32-bit mode)
        0x50..=0x57 => OpInfo::plain(false, ImmClass::None), // PUSH r32
        0x58..=0x5F => OpInfo::plain(false, ImmClass::None), // POP r32

        0x60 => OpInfo::plain(false, ImmClass::None), // PUSHAD
        0x61 => OpInfo::plain(false, ImmClass::None), // POPAD
        0x62 => OpInfo::plain(true, ImmClass::None),  // BOUND
        0x63 => OpInfo::plain(true, ImmClass::None),  // ARPL
        0x64..=0x67 => OpInfo::bad(), // segment/operand/address prefixes consumed earlier
        0x68 => OpInfo::plain(false, ImmClass::ImmFull), // PUSH imm32
        0x69 => OpInfo::plain(true, ImmClass::ImmFull),  // IMUL Gv,Ev,Iz
        0x6A => OpInfo::plain(false, ImmClass::Imm8),    // PUSH imm8
        0x6B => OpInfo::plain(true, ImmClass::Imm8),     // IMUL Gv,Ev,Ib
        0x6C..=0x6F => OpInfo::plain(false, ImmClass::None), // INS/OUTS

        0x70..=0x7F => OpInfo::branch(BranchKind::JccRel8),

        0x80 => OpInfo::plain(true, ImmClass::Imm8),  // grp1 Eb,Ib
        0x81 => OpInfo::plain(true, ImmClass::ImmFull), // grp1 Ev,Iz
        0x82 => OpInfo::plain(true, ImmClass::Imm8),  // grp1 Eb,Ib (alias of 0x80)
        0x83 => OpInfo::plain(true, ImmClass::Imm8),  // grp1 Ev,Ib (sign-extended)
        0x84 | 0x85 => OpInfo::plain(true, ImmClass::None), // TEST
        0x86 | 0x87 => OpInfo::plain(true, ImmClass::None), // XCHG
        0x88..=0x8B => OpInfo::plain(true, ImmClass::None), // MOV r/m,r and r,r/m
        0x8C => OpInfo::plain(true, ImmClass::None),  // MOV r/m,Sreg
        0x8D => OpInfo::plain(true, ImmClass::None),  // LEA
        0x8E => OpInfo::plain(true, ImmClass::None),  // MOV Sreg,r/m
        0x8F => OpInfo::plain(true, ImmClass::None),  // POP r/m (grp1a)

        0x90..=0x97 => OpInfo::plain(false, ImmClass::None), // NOP / XCHG eAX,r
        0x98 | 0x99 => OpInfo::plain(false, ImmClass::None), // CWDE/CDQ
        0x9A => OpInfo::plain(false, ImmClass::FarPtr),      // CALLF ptr16:32
        0x9B => OpInfo::plain(false, ImmClass::None),        // FWAIT
        0x9C | 0x9D => OpInfo::plain(false, ImmClass::None), // PUSHFD/POPFD
        0x9E | 0x9F => OpInfo::plain(false, ImmClass::None), // SAHF/LAHF

        0xA0..=0xA3 => OpInfo::plain(false, ImmClass::ImmFull), // MOV AL/eAX, moffs (disp-sized imm, treated as ImmFull worst case)
        0xA4..=0xA7 => OpInfo::plain(false, ImmClass::None),    // MOVS/CMPS
        0xA8 => OpInfo::plain(false, ImmClass::Imm8),           // TEST AL,Ib
        0xA9 => OpInfo::plain(false, ImmClass::ImmFull),        // TEST eAX,Iz
        0xAA..=0xAF => OpInfo::plain(false, ImmClass::None),    // STOS/LODS/SCAS

        0xB0..=0xB7 => OpInfo::plain(false, ImmClass::Imm8), // MOV r8,imm8
        0xB8..=0xBF => OpInfo::plain(false, ImmClass::ImmFull), // MOV r32,imm32

        0xC0 | 0xC1 => OpInfo::plain(true, ImmClass::Imm8), // shift grp2 r/m,imm8
        0xC2 => OpInfo::ret(ImmClass::Imm16),               // RET imm16
        0xC3 => OpInfo::ret(ImmClass::None),                // RET
        0xC4 | 0xC5 => OpInfo::plain(true, ImmClass::None), // LES/LDS
        0xC6 => OpInfo::plain(true, ImmClass::Imm8),        // MOV r/m8,imm8 (grp11)
        0xC7 => OpInfo::plain(true, ImmClass::ImmFull),     // MOV r/m32,imm32 (grp11)
        0xC8 => OpInfo::plain(false, ImmClass::EnterImm),   // ENTER imm16,imm8
        0xC9 => OpInfo::plain(false, ImmClass::None),       // LEAVE
        0xCA => OpInfo::ret(ImmClass::Imm16),               // RETF imm16
        0xCB => OpInfo::ret(ImmClass::None),                // RETF
        0xCC => OpInfo::plain(false, ImmClass::None),       // INT3
        0xCD => OpInfo::plain(false, ImmClass::Imm8),       // INT imm8
        0xCE => OpInfo::plain(false, ImmClass::None),       // INTO
        0xCF => OpInfo::plain(false, ImmClass::None),       // IRET

        0xD0..=0xD3 => OpInfo::plain(true, ImmClass::None), // shift grp2 by 1/CL
        0xD4 | 0xD5 => OpInfo::plain(false, ImmClass::Imm8), // AAM/AAD
        0xD6 => OpInfo::bad(),
        0xD7 => OpInfo::plain(false, ImmClass::None), // XLAT
        0xD8..=0xDF => OpInfo::plain(true, ImmClass::None), // x87 ESC (modrm always present)

        0xE0..=0xE3 => OpInfo::branch(BranchKind::LoopRel8),
        0xE4 | 0xE5 => OpInfo::plain(false, ImmClass::Imm8), // IN eAX/AL,imm8
        0xE6 | 0xE7 => OpInfo::plain(false, ImmClass::Imm8), // OUT imm8,eAX/AL
        0xE8 => OpInfo::branch(BranchKind::CallRel32),
        0xE9 => OpInfo::branch(BranchKind::JmpRel32),
        0xEA => OpInfo::plain(false, ImmClass::FarPtr), // JMPF ptr16:32
        0xEB => OpInfo::branch(BranchKind::JmpRel8),
        0xEC..=0xEF => OpInfo::plain(false, ImmClass::None), // IN/OUT DX

        0xF0 | 0xF2 | 0xF3 => OpInfo::bad(), // prefixes, consumed earlier
        0xF1 => OpInfo::plain(false, ImmClass::None), // ICEBP
        0xF4 => OpInfo::plain(false, ImmClass::None), // HLT
        0xF5 => OpInfo::plain(false, ImmClass::None), // CMC
        0xF6 => OpInfo::plain(true, ImmClass::GroupF6F7), // grp3 Eb
        0xF7 => OpInfo::plain(true, ImmClass::GroupF6F7), // grp3 Ev
        0xF8..=0xFD => OpInfo::plain(false, ImmClass::None), // CLC/STC/CLI/STI/CLD/STD
        0xFE => OpInfo::plain(true, ImmClass::None),        // INC/DEC r/m8 (grp4)
        0xFF => OpInfo::plain(true, ImmClass::None),        // INC/DEC/CALL/JMP/PUSH (grp5)

        _ => OpInfo::bad(),
    }
}

fn is_alu_family_byte(op: u8) -> bool {
    // Eight ALU families (ADD OR ADC SBB AND SUB XOR CMP) occupy 0x00..=0x3D
    // in blocks of 8, each block's low 3 bits selecting the operand form;
    // forms 6/7 of each block (0x0F/segment override and similar) don't
    // belong to this family and are excluded by the caller's match arm order.
    let block = op / 8;
    let form = op % 8;
    block <= 7 && form <= 5
}

fn alu_form(op: u8) -> OpInfo {
    match op % 8 {
        0 | 1 | 2 | 3 => OpInfo::plain(true, ImmClass::None),
        4 => OpInfo::plain(false, ImmClass::Imm8),
        5 => OpInfo::plain(false, ImmClass::ImmFull),
        _ => OpInfo::bad(),
    }
}

/// Classify a two-byte (`0F xx`) opcode. `0F 38`/`0F 3A` are pre-filtered by
/// the caller into [`three_byte_info`].
pub fn two_byte_info(op2: u8) -> OpInfo {
    match op2 {
        0x00 | 0x01 => OpInfo::plain(true, ImmClass::None), // SLDT/LGDT/etc group
        0x02 | 0x03 => OpInfo::plain(true, ImmClass::None), // LAR/LSL
        0x05 => OpInfo::plain(false, ImmClass::None),       // SYSCALL
        0x06 => OpInfo::plain(false, ImmClass::None),       // CLTS
        0x07 => OpInfo::plain(false, ImmClass::None),       // SYSRET
        0x08 => OpInfo::plain(false, ImmClass::None),       // INVD
        0x09 => OpInfo::plain(false, ImmClass::None),       // WBINVD
        0x0B => OpInfo::plain(false, ImmClass::None),       // UD2
        0x0D => OpInfo::plain(true, ImmClass::None),        // PREFETCHW
        0x10..=0x17 => OpInfo::plain(true, ImmClass::None), // MOVUPS/MOVLPS family
        0x18..=0x1F => OpInfo::plain(true, ImmClass::None), // HINT_NOP / PREFETCH*
        0x20..=0x23 => OpInfo::plain(true, ImmClass::None), // MOV to/from CRn/DRn
        0x28..=0x2F => OpInfo::plain(true, ImmClass::None), // MOVAPS/COMISS family
        0x30 => OpInfo::plain(false, ImmClass::None),       // WRMSR
        0x31 => OpInfo::plain(false, ImmClass::None),       // RDTSC
        0x32 => OpInfo::plain(false, ImmClass::None),       // RDMSR
        0x33 => OpInfo::plain(false, ImmClass::None),       // RDPMC
        0x34 | 0x35 => OpInfo::plain(false, ImmClass::None), // SYSENTER/SYSEXIT
        0x40..=0x4F => OpInfo::plain(true, ImmClass::None), // CMOVcc
        0x50..=0x6F => OpInfo::plain(true, ImmClass::None), // MMX/SSE ALU family
        0x70 => OpInfo::plain(true, ImmClass::Imm8),        // PSHUFW/PSHUFD
        0x71..=0x73 => OpInfo::plain(true, ImmClass::Imm8), // PSRLW/PSRAW/PSLLW groups
        0x74..=0x76 => OpInfo::plain(true, ImmClass::None), // PCMPEQ family
        0x77 => OpInfo::plain(false, ImmClass::None),       // EMMS
        0x7C..=0x7F => OpInfo::plain(true, ImmClass::None), // HADDPS/MOVD/MOVQ family
        0x80..=0x8F => OpInfo::branch(BranchKind::JccRel32),
        0x90..=0x9F => OpInfo::plain(true, ImmClass::None), // SETcc
        0xA0 | 0xA8 => OpInfo::plain(false, ImmClass::None), // PUSH FS/GS
        0xA1 | 0xA9 => OpInfo::plain(false, ImmClass::None), // POP FS/GS
        0xA2 => OpInfo::plain(false, ImmClass::None),       // CPUID
        0xA3 => OpInfo::plain(true, ImmClass::None),        // BT
        0xA4 => OpInfo::plain(true, ImmClass::Imm8),        // SHLD Ib
        0xA5 => OpInfo::plain(true, ImmClass::None),        // SHLD CL
        0xAB => OpInfo::plain(true, ImmClass::None),        // BTS
        0xAC => OpInfo::plain(true, ImmClass::Imm8),        // SHRD Ib
        0xAD => OpInfo::plain(true, ImmClass::None),        // SHRD CL
        0xAE => OpInfo::plain(true, ImmClass::None),        // FXSAVE/LDMXCSR group
        0xAF => OpInfo::plain(true, ImmClass::None),        // IMUL Gv,Ev
        0xB0 | 0xB1 => OpInfo::plain(true, ImmClass::None), // CMPXCHG
        0xB2 => OpInfo::plain(true, ImmClass::None),        // LSS
        0xB3 => OpInfo::plain(true, ImmClass::None),        // BTR
        0xB4 => OpInfo::plain(true, ImmClass::None),        // LFS
        0xB5 => OpInfo::plain(true, ImmClass::None),        // LGS
        0xB6 | 0xB7 => OpInfo::plain(true, ImmClass::None), // MOVZX
        0xB8 => OpInfo::plain(true, ImmClass::None),        // JMPE/POPCNT
        0xBA => OpInfo::plain(true, ImmClass::Imm8),        // grp8 BT/BTS/BTR/BTC r/m,imm8
        0xBB => OpInfo::plain(true, ImmClass::None),        // BTC
        0xBC | 0xBD => OpInfo::plain(true, ImmClass::None), // BSF/BSR
        0xBE | 0xBF => OpInfo::plain(true, ImmClass::None), // MOVSX
        0xC0 | 0xC1 => OpInfo::plain(true, ImmClass::None), // XADD
        0xC2 => OpInfo::plain(true, ImmClass::Imm8),        // CMPPS
        0xC3 => OpInfo::plain(true, ImmClass::None),        // MOVNTI
        0xC4 => OpInfo::plain(true, ImmClass::Imm8),        // PINSRW
        0xC5 => OpInfo::plain(true, ImmClass::Imm8),        // PEXTRW
        0xC6 => OpInfo::plain(true, ImmClass::Imm8),        // SHUFPS
        0xC7 => OpInfo::plain(true, ImmClass::None),        // CMPXCHG8B group
        0xC8..=0xCF => OpInfo::plain(false, ImmClass::None), // BSWAP r32
        0xD0..=0xFE => OpInfo::plain(true, ImmClass::None), // remaining SSE/MMX ALU family
        0xFF => OpInfo::bad(),
        _ => OpInfo::bad(),
    }
}

/// `0F 38 xx` and `0F 3A xx` three-byte opcode maps, classified to the
/// precision typical user-mode SSSE3/SSE4 code needs: always ModR/M,
/// `0F 3A` additionally always carries a trailing imm8 selector.
pub fn three_byte_info(escape: u8) -> OpInfo {
    match escape {
        0x38 => OpInfo::plain(true, ImmClass::None),
        0x3A => OpInfo::plain(true, ImmClass::Imm8),
        _ => OpInfo::bad(),
    }
}
