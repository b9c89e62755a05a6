//! Baseline concrete Mutation Rule Set catalog.
//!
//! Every transform here is provably flag-neutral without looking at the next
//! instruction: a rule that can't prove the next instruction ignores a flag
//! must preserve that flag, and this catalog simply never emits a rewrite
//! whose flag effect differs from the original, so there is nothing to
//! prove. Branches and `ret` always degrade to identity (same kind, same
//! target/size class); the engine alone owns jump resolution and widening.

use rand::Rng;

use crate::decoder::flags::InstructionFlags;
use crate::error::ZergError;
use crate::graph::InstructionRecord;
use crate::mutate::MutationImpl;

#[derive(Clone)]
pub struct MutationConfig {
    /// Probability (0.0-1.0) of re-encoding an eligible instruction into an
    /// alternate but equivalent byte form.
    pub reencode_probability: f64,
    /// Insert a semantically inert NOP immediately before instructions this
    /// rule set otherwise leaves untouched, to grow the code stream.
    pub insert_junk_nops: bool,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            reencode_probability: 0.5,
            insert_junk_nops: false,
        }
    }
}

pub struct PolymorphicMutation {
    pub config: MutationConfig,
}

impl PolymorphicMutation {
    pub fn new(config: MutationConfig) -> Self {
        Self { config }
    }
}

/// One of the four commutative ALU families whose `Ev,Gv` (opcode N) and
/// `Gv,Ev` (opcode N+2) forms compute the identical result and flags when
/// both operands are registers (ModR/M `mod == 11`): swapping which
/// register sits in the `reg` field and which sits in `rm` is a genuine
/// equivalent re-encoding, not a different instruction.
const COMMUTATIVE_EV_GV: [u8; 4] = [0x01, 0x09, 0x21, 0x31]; // ADD OR AND XOR, Ev,Gv
const COMMUTATIVE_GV_EV: [u8; 4] = [0x03, 0x0B, 0x23, 0x33]; // ADD OR AND XOR, Gv,Ev

/// Alternate fixed-length NOPs (single-instruction, modrm-based multi-byte
/// forms used by real assemblers for alignment padding). All are
/// architecturally inert.
const NOP_VARIANTS: &[&[u8]] = &[
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
];

impl MutationImpl for PolymorphicMutation {
    fn mutate(&self, record: &InstructionRecord, sink: &mut Vec<InstructionRecord>) -> Result<(), ZergError> {
        // Branches and returns: the engine owns their control-flow shape.
        // Rewriting them here would risk violating "exactly one branch in,
        // one branch out" or "ret stays ret" — pass through unchanged.
        if record.flags.is_branch() || record.flags.contains(InstructionFlags::IS_RET) {
            sink.push(record.clone());
            return Ok(());
        }

        let mut rng = rand::thread_rng();

        if self.config.insert_junk_nops {
            let variant = NOP_VARIANTS[rng.gen_range(0..NOP_VARIANTS.len())];
            sink.push(InstructionRecord::new(0, variant.to_vec(), InstructionFlags::IS_SYNTHETIC));
        }

        if rng.gen_bool(self.config.reencode_probability) {
            if let Some(bytes) = try_reencode(record) {
                let mut rewritten = record.clone();
                rewritten.set_bytes(&bytes);
                sink.push(rewritten);
                return Ok(());
            }
            if record.opcode == 0x90 {
                let variant = NOP_VARIANTS[rng.gen_range(0..NOP_VARIANTS.len())];
                let mut rewritten = record.clone();
                rewritten.set_bytes(variant);
                sink.push(rewritten);
                return Ok(());
            }
        }

        sink.push(record.clone());
        Ok(())
    }
}

/// Try to produce an equivalent alternate encoding for `record`. Returns
/// `None` when no rule in the catalog applies, in which case the caller
/// keeps the original bytes.
fn try_reencode(record: &InstructionRecord) -> Option<Vec<u8>> {
    let bytes = record.bytes();
    let modrm = record.modrm?;
    if modrm >> 6 != 0b11 {
        // Only register-register forms: memory operands carry SIB/disp
        // bytes whose positions this simple swap doesn't account for.
        return None;
    }

    if let Some(pos) = COMMUTATIVE_EV_GV.iter().position(|&op| op == record.opcode) {
        let swapped_opcode = COMMUTATIVE_GV_EV[pos];
        let reg = (modrm >> 3) & 0x7;
        let rm = modrm & 0x7;
        let swapped_modrm = 0b1100_0000 | (rm << 3) | reg;
        let mut out = bytes.to_vec();
        out[0] = swapped_opcode;
        out[1] = swapped_modrm;
        return Some(out);
    }
    if let Some(pos) = COMMUTATIVE_GV_EV.iter().position(|&op| op == record.opcode) {
        let swapped_opcode = COMMUTATIVE_EV_GV[pos];
        let reg = (modrm >> 3) & 0x7;
        let rm = modrm & 0x7;
        let swapped_modrm = 0b1100_0000 | (rm << 3) | reg;
        let mut out = bytes.to_vec();
        out[0] = swapped_opcode;
        out[1] = swapped_modrm;
        return Some(out);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_one;

    #[test]
    fn swaps_commutative_alu_register_form() {
        // add eax, ebx -> 01 D8 (Ev,Gv: rm=eax(0), reg=ebx(3))
        let rec = decode_one(&[0x01, 0xD8], 0).unwrap();
        let bytes = try_reencode(&rec).expect("commutative swap should apply");
        // Gv,Ev form: opcode 0x03, modrm reg=eax(0) rm=ebx(3) -> 0xC3
        assert_eq!(bytes, vec![0x03, 0xC3]);
    }

    #[test]
    fn leaves_memory_operand_untouched() {
        // add [eax], ebx -> 01 18 (mod=00, not eligible for the register swap)
        let rec = decode_one(&[0x01, 0x18], 0).unwrap();
        assert!(try_reencode(&rec).is_none());
    }

    #[test]
    fn branches_always_pass_through_identity() {
        let rec = decode_one(&[0xE9, 0x00, 0x00, 0x00, 0x00], 0).unwrap();
        let mut sink = Vec::new();
        let rule = PolymorphicMutation::new(MutationConfig::default());
        rule.mutate(&rec, &mut sink).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].branch_kind, rec.branch_kind);
    }
}
