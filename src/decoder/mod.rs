//! Length disassembler: classify one x86 (32-bit) instruction starting at a
//! buffer offset and return a fully decoded, non-synthetic
//! [`InstructionRecord`].
//!
//! Unknown opcode paths are a hard failure — this decoder never guesses or
//! skips a byte to resynchronize, because a skipped byte would silently
//! corrupt every RVA after it. The input region is assumed to be pure code;
//! embedded data will not decode cleanly and is not recovered.

pub mod flags;
pub mod tables;

use self::flags::InstructionFlags;
use self::tables::{BranchKind, ImmClass, OpInfo};
use crate::error::ZergError;
use crate::graph::InstructionRecord;

const MAX_PREFIXES: usize = 4;

struct Prefixes {
    operand_size_override: bool,
    consumed: usize,
}

fn scan_prefixes(buf: &[u8]) -> Result<Prefixes, ZergError> {
    let mut operand_size_override = false;
    let mut consumed = 0;
    while consumed < buf.len() {
        match buf[consumed] {
            0x66 => operand_size_override = true,
            0x67 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {}
            _ => break,
        }
        consumed += 1;
        if consumed > MAX_PREFIXES {
            return Err(ZergError::Decode {
                rva: 0,
                reason: "prefix chain exceeds architectural maximum".into(),
            });
        }
    }
    Ok(Prefixes {
        operand_size_override,
        consumed,
    })
}

struct ModRm {
    byte: u8,
    reg: u8,
    sib: Option<u8>,
    disp_size: u8,
}

fn decode_modrm(buf: &[u8], pos: usize) -> Result<(ModRm, usize), ZergError> {
    let byte = *buf.get(pos).ok_or_else(|| overflow())?;
    let md = byte >> 6;
    let reg = (byte >> 3) & 0x7;
    let rm = byte & 0x7;
    let mut consumed = 1;

    let mut sib = None;
    if md != 0b11 && rm == 0b100 {
        sib = Some(*buf.get(pos + consumed).ok_or_else(|| overflow())?);
        consumed += 1;
    }

    let sib_base_is_5 = sib.map(|s| s & 0x7 == 0b101).unwrap_or(false);
    let disp_size: u8 = match md {
        0b00 => {
            if rm == 0b101 || (rm == 0b100 && sib_base_is_5) {
                4
            } else {
                0
            }
        }
        0b01 => 1,
        0b10 => 4,
        0b11 => 0,
        _ => unreachable!(),
    };

    Ok((
        ModRm {
            byte,
            reg,
            sib,
            disp_size,
        },
        consumed,
    ))
}

fn overflow() -> ZergError {
    ZergError::Decode {
        rva: 0,
        reason: "instruction decode ran past the end of the buffer".into(),
    }
}

fn with_rva(mut err: ZergError, rva: u32) -> ZergError {
    if let ZergError::Decode { rva: r, .. } = &mut err {
        *r = rva;
    }
    err
}

/// Decode one instruction starting at `buf[0]`. `old_rva` is the instruction's
/// offset within the code region being mutated (stamped into the returned
/// record and used for the branch-target and decode-error reporting).
pub fn decode_one(buf: &[u8], old_rva: u32) -> Result<InstructionRecord, ZergError> {
    decode_inner(buf, old_rva).map_err(|e| with_rva(e, old_rva))
}

fn decode_inner(buf: &[u8], old_rva: u32) -> Result<InstructionRecord, ZergError> {
    let prefixes = scan_prefixes(buf)?;
    let mut pos = prefixes.consumed;

    let opcode_start = pos;
    let first = *buf.get(pos).ok_or_else(overflow)?;
    pos += 1;

    let info: OpInfo = if first == 0x0F {
        let second = *buf.get(pos).ok_or_else(overflow)?;
        pos += 1;
        if second == 0x38 || second == 0x3A {
            let _third = *buf.get(pos).ok_or_else(overflow)?;
            pos += 1;
            tables::three_byte_info(second)
        } else {
            tables::two_byte_info(second)
        }
    } else {
        tables::one_byte_info(first)
    };

    if info.undefined {
        return Err(ZergError::Decode {
            rva: old_rva,
            reason: format!("undefined opcode at offset {}", opcode_start),
        });
    }

    let mut modrm_byte = None;
    let mut sib_byte = None;
    let mut disp_size = 0u8;
    let mut reg_field = 0u8;

    if info.has_modrm {
        let (m, consumed) = decode_modrm(buf, pos)?;
        pos += consumed;
        pos += m.disp_size as usize;
        modrm_byte = Some(m.byte);
        sib_byte = m.sib;
        disp_size = m.disp_size;
        reg_field = m.reg;
    }

    let imm_size = match info.imm {
        ImmClass::None => 0u8,
        ImmClass::Imm8 => 1,
        ImmClass::Imm16 => 2,
        ImmClass::ImmFull => {
            if prefixes.operand_size_override {
                2
            } else {
                4
            }
        }
        ImmClass::EnterImm => 3,
        ImmClass::FarPtr => 6,
        ImmClass::GroupF6F7 => {
            // reg field 0/1 = TEST r/m, imm; the rest of the group (NOT,
            // NEG, MUL, IMUL, DIV, IDIV) takes no immediate. The width of
            // that immediate depends on which opcode selected the group:
            // 0xF6 is the Eb form (`TEST r/m8, imm8`, always 1 byte); 0xF7
            // is the Ev form (`TEST r/m32, Iz`, 16 or 32 bits per the
            // operand-size override, same as `ImmClass::ImmFull`).
            if reg_field == 0 || reg_field == 1 {
                if first == 0xF6 {
                    1
                } else if prefixes.operand_size_override {
                    2
                } else {
                    4
                }
            } else {
                0
            }
        }
    };
    pos += imm_size as usize;

    let branch_disp_size = info.branch.disp_size() as usize;
    let mut branch_target_rva = None;
    if branch_disp_size > 0 {
        let disp_start = pos;
        pos += branch_disp_size;
        if pos > buf.len() {
            return Err(overflow());
        }
        let disp = read_signed(&buf[disp_start..pos]);
        let length = pos as i64;
        let target = old_rva as i64 + length + disp;
        branch_target_rva = Some(target as u32);
    }

    if pos > buf.len() {
        return Err(overflow());
    }

    let mut flags = info.branch.to_flags();
    if info.has_modrm {
        flags.insert(InstructionFlags::HAS_MODRM);
    }
    if sib_byte.is_some() {
        flags.insert(InstructionFlags::HAS_SIB);
    }
    if imm_size > 0 {
        flags.insert(InstructionFlags::HAS_IMM);
    }
    if disp_size > 0 {
        flags.insert(InstructionFlags::HAS_DISP);
    }
    if info.is_ret {
        flags.insert(InstructionFlags::IS_RET);
    }

    let mut rec = InstructionRecord::new(old_rva, buf[..pos].to_vec(), flags);
    rec.opcode = first;
    rec.modrm = modrm_byte;
    rec.sib = sib_byte;
    rec.imm_size = imm_size;
    rec.disp_size = disp_size;
    rec.branch_kind = info.branch;
    rec.branch_target_rva = branch_target_rva;
    Ok(rec)
}

fn read_signed(bytes: &[u8]) -> i64 {
    match bytes.len() {
        1 => bytes[0] as i8 as i64,
        4 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        _ => unreachable!("branch displacement is always 1 or 4 bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_byte_ret() {
        let rec = decode_one(&[0xC3], 0).unwrap();
        assert_eq!(rec.length, 1);
        assert!(rec.flags.contains(InstructionFlags::IS_RET));
    }

    #[test]
    fn decodes_modrm_alu() {
        // add eax, ebx -> 01 D8
        let rec = decode_one(&[0x01, 0xD8], 0).unwrap();
        assert_eq!(rec.length, 2);
        assert!(rec.flags.contains(InstructionFlags::HAS_MODRM));
        assert_eq!(rec.disp_size, 0);
    }

    #[test]
    fn decodes_disp32_no_sib() {
        // mov eax, [0x11223344] -> A1 + moffs32 is simpler, use mov eax,[disp32] form: 8B 05 xx xx xx xx
        let rec = decode_one(&[0x8B, 0x05, 0x44, 0x33, 0x22, 0x11], 0).unwrap();
        assert_eq!(rec.length, 6);
        assert_eq!(rec.disp_size, 4);
    }

    #[test]
    fn decodes_sib_with_disp32_no_base() {
        // mov eax, [ecx*4 + 0x100] -> 8B 04 8D 00 01 00 00
        let rec = decode_one(&[0x8B, 0x04, 0x8D, 0x00, 0x01, 0x00, 0x00], 0).unwrap();
        assert_eq!(rec.length, 7);
        assert!(rec.sib.is_some());
        assert_eq!(rec.disp_size, 4);
    }

    #[test]
    fn decodes_short_jmp_and_target() {
        // eb 00 -> jmp +0 (target is the byte right after this instruction)
        let rec = decode_one(&[0xEB, 0x00], 0).unwrap();
        assert_eq!(rec.length, 2);
        assert_eq!(rec.branch_target_rva, Some(2));
        assert!(rec.flags.contains(InstructionFlags::IS_SHORT));
    }

    #[test]
    fn decodes_near_jcc_rel32() {
        let mut bytes = vec![0x0F, 0x84];
        bytes.extend_from_slice(&10i32.to_le_bytes());
        let rec = decode_one(&bytes, 100).unwrap();
        assert_eq!(rec.length, 6);
        assert_eq!(rec.branch_target_rva, Some(100 + 6 + 10));
    }

    #[test]
    fn decodes_operand_size_override_immediate() {
        // 66 B8 imm16 -> mov ax, imm16
        let rec = decode_one(&[0x66, 0xB8, 0x01, 0x02], 0).unwrap();
        assert_eq!(rec.length, 4);
        assert_eq!(rec.imm_size, 2);
    }

    #[test]
    fn decodes_group_f7_test_has_immediate() {
        // F7 C0 imm32 -> test eax, imm32 (reg field = 0)
        let mut bytes = vec![0xF7, 0xC0];
        bytes.extend_from_slice(&1i32.to_le_bytes());
        let rec = decode_one(&bytes, 0).unwrap();
        assert_eq!(rec.length, 6);
    }

    #[test]
    fn decodes_group_f7_not_has_no_immediate() {
        // F7 D0 -> not eax (reg field = 2)
        let rec = decode_one(&[0xF7, 0xD0], 0).unwrap();
        assert_eq!(rec.length, 2);
    }

    #[test]
    fn decodes_group_f6_test_has_one_byte_immediate() {
        // F6 C0 05 -> test al, 5 (reg field = 0, Eb form: imm8 not Iz)
        let rec = decode_one(&[0xF6, 0xC0, 0x05], 0).unwrap();
        assert_eq!(rec.length, 3);
        assert_eq!(rec.imm_size, 1);
    }

    #[test]
    fn decodes_group_f6_not_has_no_immediate() {
        // F6 D0 -> not al (reg field = 2)
        let rec = decode_one(&[0xF6, 0xD0], 0).unwrap();
        assert_eq!(rec.length, 2);
    }

    #[test]
    fn rejects_undefined_opcode() {
        assert!(decode_one(&[0x0F, 0xFF], 0).is_err());
    }

    #[test]
    fn rejects_truncated_instruction() {
        // 0x81 needs modrm + imm32 but the buffer is cut short.
        assert!(decode_one(&[0x81, 0xC0, 0x01], 0).is_err());
    }

    #[test]
    fn three_byte_opcode_map_carries_imm8() {
        // 0F 3A 0F (PALIGNR) reg,reg,imm8 -> C0 modrm, imm8
        let rec = decode_one(&[0x0F, 0x3A, 0x0F, 0xC1, 0x04], 0).unwrap();
        assert_eq!(rec.length, 5);
        assert_eq!(rec.imm_size, 1);
    }
}
