//! The instruction graph: an arena of [`InstructionRecord`]s plus the
//! control-flow edges and old/new RVA indices.
//!
//! Records never move once appended — control-flow edges (`target`,
//! `referrers`) and sequence links (`prev`, `next`) are arena indices, not
//! references, so the graph can hold cycles (loops) without any unsafe code
//! or reference counting. The whole arena is dropped at the end of one
//! [`crate::engine::Engine::mutate`] call; nothing survives across calls.

use std::collections::HashMap;

use crate::decoder::flags::InstructionFlags;
use crate::decoder::tables::BranchKind;
use crate::error::ZergError;

/// Worst-case x86 instruction length (15 bytes per the Intel manual) plus
/// one byte of slack, stored inline to avoid a heap allocation per record.
pub const MAX_INSN_BYTES: usize = 16;

#[derive(Debug, Clone)]
pub struct InstructionRecord {
    pub old_rva: u32,
    pub new_rva: u32,
    pub length: u8,
    bytes: [u8; MAX_INSN_BYTES],
    byte_len: u8,
    pub flags: InstructionFlags,
    pub opcode: u8,
    pub modrm: Option<u8>,
    pub sib: Option<u8>,
    pub imm_size: u8,
    pub disp_size: u8,
    pub branch_kind: BranchKind,
    pub branch_target_rva: Option<u32>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub target: Option<usize>,
    pub referrers: Vec<usize>,
}

impl InstructionRecord {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.byte_len as usize]
    }

    pub fn set_bytes(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= MAX_INSN_BYTES,
            "instruction grew past the {}-byte inline buffer",
            MAX_INSN_BYTES
        );
        self.bytes[..bytes.len()].copy_from_slice(bytes);
        self.byte_len = bytes.len() as u8;
        self.length = bytes.len() as u8;
    }

    pub fn is_synthetic(&self) -> bool {
        self.flags.contains(InstructionFlags::IS_SYNTHETIC)
    }

    /// A fresh, empty record with the given bytes — used both by the
    /// decoder (non-synthetic, `old_rva` set) and by the rule set
    /// (synthetic, `old_rva = 0`).
    pub fn new(old_rva: u32, bytes: Vec<u8>, flags: InstructionFlags) -> Self {
        let mut rec = InstructionRecord {
            old_rva,
            new_rva: 0,
            length: 0,
            bytes: [0u8; MAX_INSN_BYTES],
            byte_len: 0,
            flags,
            opcode: 0,
            modrm: None,
            sib: None,
            imm_size: 0,
            disp_size: 0,
            branch_kind: BranchKind::None,
            branch_target_rva: None,
            prev: None,
            next: None,
            target: None,
            referrers: Vec::new(),
        };
        rec.set_bytes(&bytes);
        rec
    }
}

/// The ordered sequence of instruction records plus old/new RVA indices.
/// One graph is built per [`crate::engine::Engine::mutate`] call and fully
/// owned by it; it never outlives that call.
#[derive(Default)]
pub struct CodeGraph {
    arena: Vec<InstructionRecord>,
    old_index: HashMap<u32, usize>,
    new_index: HashMap<u32, usize>,
    tail: Option<usize>,
}

impl CodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn get(&self, idx: usize) -> &InstructionRecord {
        &self.arena[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut InstructionRecord {
        &mut self.arena[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstructionRecord> {
        self.arena.iter()
    }

    pub fn order(&self) -> impl Iterator<Item = usize> {
        0..self.arena.len()
    }

    /// Push a record at the tail, linking `prev`/`next` and, for
    /// non-synthetic records, indexing it by `old_rva`.
    pub fn append(&mut self, mut record: InstructionRecord) -> usize {
        let idx = self.arena.len();
        record.prev = self.tail;
        if !record.is_synthetic() {
            self.old_index.entry(record.old_rva).or_insert(idx);
        }
        self.arena.push(record);
        if let Some(prev) = self.tail {
            self.arena[prev].next = Some(idx);
        }
        self.tail = Some(idx);
        idx
    }

    pub fn lookup_old(&self, rva: u32) -> Option<&InstructionRecord> {
        self.old_index.get(&rva).map(|&i| &self.arena[i])
    }

    pub fn lookup_old_index(&self, rva: u32) -> Option<usize> {
        self.old_index.get(&rva).copied()
    }

    pub fn lookup_new(&self, rva: u32) -> Option<&InstructionRecord> {
        self.new_index.get(&rva).map(|&i| &self.arena[i])
    }

    /// Phase 2: link every relative branch whose absolute target falls
    /// inside this graph's `old_rva` range to that target's record, and
    /// register the link in the target's `referrers`. Branches whose
    /// target is outside `[0, region_size)` keep only `branch_target_rva`
    /// (an absolute RVA, not a local index), with `target` left `None` —
    /// that is the ordinary, expected shape of a call/jump to code outside
    /// the mutated region.
    ///
    /// A target RVA that falls *inside* `[0, region_size)` but doesn't land
    /// on any decoded instruction head (a branch into the middle of an
    /// instruction — data-in-code or deliberate obfuscation) is a distinct,
    /// reportable case: `target` is likewise left `None`, but the branch's
    /// own `old_rva` is collected into the returned list so the caller can
    /// warn about it instead of treating it as an ordinary external branch.
    pub fn resolve_targets(&mut self, region_size: u32) -> Result<Vec<u32>, ZergError> {
        let n = self.arena.len();
        let mut links = Vec::new();
        let mut unresolved_in_region = Vec::new();
        for i in 0..n {
            let rec = &self.arena[i];
            if !rec.flags.is_relative_branch() || rec.is_synthetic() {
                continue;
            }
            let target_rva = rec
                .branch_target_rva
                .ok_or_else(|| ZergError::Graph("branch record missing target RVA".into()))?;
            if let Some(&target_idx) = self.old_index.get(&target_rva) {
                links.push((i, target_idx));
            } else if target_rva < region_size {
                unresolved_in_region.push(rec.old_rva);
            }
        }
        for (from, to) in links {
            self.arena[from].target = Some(to);
            self.arena[to].referrers.push(from);
        }
        Ok(unresolved_in_region)
    }

    /// Phase 4: convert every `rel8` branch still in the graph to its
    /// `rel32` form. Runs exactly once, before layout, so widening can
    /// never invalidate an already-computed offset — eliminating the
    /// classic assembler fixpoint problem.
    pub fn widen_all_branches(&mut self) {
        for rec in self.arena.iter_mut() {
            if !rec.flags.contains(InstructionFlags::IS_SHORT) {
                continue;
            }
            widen_one(rec);
        }
    }

    /// Phase 5: assign `new_rva` in emission order and populate the
    /// new-RVA index.
    pub fn layout(&mut self) {
        let mut rva = 0u32;
        for i in 0..self.arena.len() {
            self.arena[i].new_rva = rva;
            self.new_index.insert(rva, i);
            rva += self.arena[i].length as u32;
        }
    }

    pub fn total_size(&self) -> u32 {
        self.arena.iter().map(|r| r.length as u32).sum()
    }
}

/// Rewrite a short-form (`rel8`) branch in place to its `rel32` equivalent,
/// preserving its opcode family and the 4-byte placeholder displacement
/// (patched for real in engine Phase 6, once every `new_rva` is known).
fn widen_one(rec: &mut InstructionRecord) {
    let (opcode_bytes, new_kind): (&[u8], BranchKind) = match rec.branch_kind {
        BranchKind::JmpRel8 => (&[0xE9], BranchKind::JmpRel32),
        BranchKind::JccRel8 => {
            // 7x rel8 -> 0F 8x rel32 (same condition code in the low nibble).
            let cc = rec.opcode & 0x0F;
            return widen_jcc(rec, cc);
        }
        BranchKind::LoopRel8 => {
            // LOOP/LOOPE/LOOPNE/JECXZ have no rel32 encoding; emulate with a
            // short branch around an unconditional rel32 jump so the graph
            // can still treat every branch uniformly as 5 (jmp) or 6 (jcc)
            // bytes after widening.
            return widen_loop(rec);
        }
        BranchKind::JmpRel32 | BranchKind::JccRel32 | BranchKind::CallRel32 | BranchKind::None => {
            return;
        }
    };
    let mut bytes = Vec::with_capacity(5);
    bytes.extend_from_slice(opcode_bytes);
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    rec.opcode = opcode_bytes[0];
    rec.branch_kind = new_kind;
    rec.flags.remove(InstructionFlags::IS_SHORT | InstructionFlags::IS_BRANCH_REL8);
    rec.flags.insert(InstructionFlags::IS_BRANCH_REL32);
    rec.set_bytes(&bytes);
}

fn widen_jcc(rec: &mut InstructionRecord, cc: u8) {
    let mut bytes = Vec::with_capacity(6);
    bytes.push(0x0F);
    bytes.push(0x80 | cc);
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    rec.opcode = 0x80 | cc;
    rec.branch_kind = BranchKind::JccRel32;
    rec.flags.remove(InstructionFlags::IS_SHORT | InstructionFlags::IS_BRANCH_REL8);
    rec.flags.insert(InstructionFlags::IS_BRANCH_REL32);
    rec.set_bytes(&bytes);
}

/// `E0/E1/E2/E3` (LOOPNE/LOOPE/LOOP/JECXZ) have no direct rel32 form. Widen
/// by wrapping the short form around a relay jump, 9 bytes total:
///
/// ```text
/// op   rel8=+2      ; taken -> skip the next 2 bytes, land on `jmp rel32`
/// jmp  rel8=+5      ; not taken -> skip the 5-byte `jmp rel32`, fall through
/// jmp  rel32 target ; relays the taken case to the real (possibly far) target
/// ```
///
/// One record still owns the whole control-flow edge — the relay `jmp
/// rel32` is bytes of this record, not a second graph node — so
/// `target`/`branch_target_rva` keep meaning the rest of the engine relies
/// on: one branch instruction goes in, exactly one comes out, same kind.
fn widen_loop(rec: &mut InstructionRecord) {
    let mut bytes = Vec::with_capacity(9);
    bytes.push(rec.opcode); // E0/E1/E2/E3 unchanged
    bytes.push(2);
    bytes.push(0xEB);
    bytes.push(5);
    bytes.push(0xE9);
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    rec.branch_kind = BranchKind::LoopRelayRel32;
    rec.flags.remove(InstructionFlags::IS_SHORT | InstructionFlags::IS_BRANCH_REL8);
    rec.flags.insert(InstructionFlags::IS_BRANCH_REL32);
    rec.set_bytes(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_one;

    #[test]
    fn widen_loop_produces_nine_byte_relay_sandwich() {
        // E2 FA -> loop $-4 (LOOP, opcode E2), decoded as a standalone record.
        let mut rec = decode_one(&[0xE2, 0xFA], 10).unwrap();
        assert_eq!(rec.branch_kind, BranchKind::LoopRel8);
        widen_loop(&mut rec);
        assert_eq!(rec.branch_kind, BranchKind::LoopRelayRel32);
        assert_eq!(rec.length, 9);
        assert!(rec.flags.contains(InstructionFlags::IS_BRANCH_REL32));
        assert!(!rec.flags.contains(InstructionFlags::IS_SHORT));
        let bytes = rec.bytes();
        assert_eq!(bytes[0], 0xE2); // opcode preserved
        assert_eq!(bytes[1], 2); // taken: skip 2 bytes, land on `jmp rel32`
        assert_eq!(bytes[2], 0xEB);
        assert_eq!(bytes[3], 5); // not taken: skip the 5-byte `jmp rel32`
        assert_eq!(bytes[4], 0xE9); // relay jmp rel32
    }

    #[test]
    fn widen_loop_relay_displacement_resolves_to_original_target_after_layout() {
        // jecxz +0 (E3 00) at old_rva 0, followed by one `nop` the loop
        // targets by falling through to rva 2 after widening.
        let mut graph = CodeGraph::new();
        let mut jecxz = decode_one(&[0xE3, 0x00], 0).unwrap();
        jecxz.branch_target_rva = Some(2);
        graph.append(jecxz);
        graph.append(decode_one(&[0x90], 2).unwrap());

        let unresolved = graph.resolve_targets(3).unwrap();
        assert!(unresolved.is_empty());
        assert_eq!(graph.get(0).target, Some(1));

        graph.widen_all_branches();
        assert_eq!(graph.get(0).branch_kind, BranchKind::LoopRelayRel32);
        assert_eq!(graph.get(0).length, 9);

        graph.layout();
        assert_eq!(graph.get(0).new_rva, 0);
        assert_eq!(graph.get(1).new_rva, 9);

        let (off, len) = graph.get(0).branch_kind.disp_field().unwrap();
        assert_eq!((off, len), (5, 4));
    }

    #[test]
    fn resolve_targets_flags_branch_into_middle_of_instruction_distinctly_from_external() {
        // A two-byte instruction at rva 0, then a short jmp at rva 2 whose
        // target (rva 1) lands mid-instruction rather than on a head, and a
        // second short jmp whose target (rva 100) is legitimately external.
        let mut graph = CodeGraph::new();
        graph.append(decode_one(&[0x01, 0xD8], 0).unwrap()); // add eax, ebx
        let mut mid_branch = decode_one(&[0xEB, 0x00], 2).unwrap();
        mid_branch.branch_target_rva = Some(1);
        graph.append(mid_branch);
        let mut external_branch = decode_one(&[0xEB, 0x00], 4).unwrap();
        external_branch.branch_target_rva = Some(100);
        graph.append(external_branch);

        let unresolved = graph.resolve_targets(6).unwrap();
        assert_eq!(unresolved, vec![2]);
        assert!(graph.get(1).target.is_none());
        assert!(graph.get(2).target.is_none());
    }
}
