//! The Mutation Engine — orchestrates the six phases that turn one code
//! region into a rewritten, relocatable byte stream plus the old-RVA →
//! new-RVA map the PE Fixup Layer consumes.
//!
//! `Engine::mutate` is a pure function of its inputs and the rule set: the
//! graph it builds is fully owned by the call and dropped on return. Only
//! the output buffer and [`RvaMap`] escape.

use std::collections::HashMap;

use crate::decoder::{self, flags::InstructionFlags};
use crate::error::ZergError;
use crate::graph::CodeGraph;
use crate::mutate::MutationImpl;

/// The engine's old-RVA → new-RVA function, valid only for instruction
/// heads. Both RVAs are relative to the code region's
/// own start (i.e. not yet adjusted by `ext_delta`/the image's section RVA).
#[derive(Debug, Default, Clone)]
pub struct RvaMap {
    old_to_new: HashMap<u32, u32>,
}

impl RvaMap {
    /// Returns `(old_rva, new_rva)` for the instruction head at `rva`, or
    /// `None` if `rva` is not the start of any record the engine emitted.
    pub fn get_idata_by_rva(&self, rva: u32) -> Option<(u32, u32)> {
        self.old_to_new.get(&rva).map(|&new_rva| (rva, new_rva))
    }

    pub fn lookup(&self, rva: u32) -> Option<u32> {
        self.old_to_new.get(&rva).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.old_to_new.is_empty()
    }

    pub fn len(&self) -> usize {
        self.old_to_new.len()
    }
}

pub struct MutationOutput {
    pub bytes: Vec<u8>,
    pub entry_point_rva_out: u32,
    pub rva_map: RvaMap,
    /// Old RVAs of relative branches whose computed target fell inside the
    /// code region but didn't land on a decoded instruction head (a branch
    /// into the middle of an instruction). Left unresolved like any other
    /// out-of-region branch, but reported separately since it is the
    /// data-in-code/obfuscation case rather than an ordinary call/jump out
    /// of the mutated section.
    pub unresolved_in_region_branches: Vec<u32>,
}

pub struct Engine<'a> {
    rule_set: &'a dyn MutationImpl,
}

impl<'a> Engine<'a> {
    pub fn new(rule_set: &'a dyn MutationImpl) -> Self {
        Self { rule_set }
    }

    /// `ext_delta = new_section_rva - old_section_rva`, `ext_base =
    /// image_base + old_section_rva`. `ext_base` is not needed by any of the
    /// six phases below — every branch the graph tracks is RVA-relative and
    /// the old section never moves (it is renamed, not relocated) — so it
    /// is accepted for call-site symmetry with `ext_delta` and otherwise
    /// unused; see DESIGN.md.
    pub fn mutate(
        &mut self,
        input: &[u8],
        entry_point_rva_in: u32,
        ext_delta: i64,
        _ext_base: u64,
    ) -> Result<MutationOutput, ZergError> {
        if input.is_empty() {
            return Ok(MutationOutput {
                bytes: Vec::new(),
                entry_point_rva_out: entry_point_rva_in,
                rva_map: RvaMap::default(),
                unresolved_in_region_branches: Vec::new(),
            });
        }

        // Phase 1 — Decode.
        let mut old_graph = CodeGraph::new();
        let mut offset = 0usize;
        while offset < input.len() {
            let rec = decoder::decode_one(&input[offset..], offset as u32)?;
            let len = rec.length as usize;
            old_graph.append(rec);
            offset += len;
        }
        if offset != input.len() {
            return Err(ZergError::Graph(format!(
                "decode walk ended at offset {} but the region is {} bytes",
                offset,
                input.len()
            )));
        }
        if old_graph.lookup_old(entry_point_rva_in).is_none() {
            return Err(ZergError::Graph(format!(
                "entry point RVA 0x{:X} is not at an instruction boundary",
                entry_point_rva_in
            )));
        }

        // Phase 2 — Link.
        let unresolved_in_region_branches = old_graph.resolve_targets(input.len() as u32)?;

        // Phase 3 — Mutate.
        let mut new_graph = CodeGraph::new();
        let mut old_to_new_first: HashMap<usize, usize> = HashMap::new();
        for old_idx in old_graph.order() {
            let orig = old_graph.get(old_idx);
            let mut emitted = Vec::new();
            self.rule_set.mutate(orig, &mut emitted)?;
            // A rule set may legitimately emit zero replacement instructions
            // (delete the original outright); such a record simply has no
            // new-graph image and is absent from `old_to_new_first`. A
            // branch or ret emitting zero would violate the rule set's own
            // contract (MutationImpl requires exactly one branch/ret out),
            // and surfaces below as an unresolvable re-link rather than here.
            let mut first_new_idx = None;
            for (j, mut rewritten) in emitted.into_iter().enumerate() {
                if j == 0 {
                    rewritten.old_rva = orig.old_rva;
                    rewritten.flags.remove(InstructionFlags::IS_SYNTHETIC);
                } else {
                    rewritten.old_rva = 0;
                    rewritten.flags.insert(InstructionFlags::IS_SYNTHETIC);
                }
                let new_idx = new_graph.append(rewritten);
                if j == 0 {
                    first_new_idx = Some(new_idx);
                }
            }
            if let Some(first_new_idx) = first_new_idx {
                old_to_new_first.insert(old_idx, first_new_idx);
            }
        }

        // Re-link: each branch emitted for an original branch copied the
        // original's `target` (an *old*-graph index) via `Clone`; redirect
        // it to the new graph's image of that target. Both ends must have
        // survived mutation with a new-graph image: a rule set that drops a
        // branch, or drops an instruction that is itself a branch target, has
        // violated its own contract and is reported rather than panicked on.
        for old_idx in old_graph.order() {
            let orig = old_graph.get(old_idx);
            if !orig.flags.is_relative_branch() {
                continue;
            }
            let Some(old_target) = orig.target else { continue };
            let new_from = *old_to_new_first.get(&old_idx).ok_or_else(|| {
                ZergError::Graph(format!("rule set dropped a branch instruction at RVA 0x{:X}", orig.old_rva))
            })?;
            let new_to = *old_to_new_first.get(&old_target).ok_or_else(|| {
                ZergError::Graph(format!(
                    "rule set dropped the instruction at branch target RVA 0x{:X}",
                    old_graph.get(old_target).old_rva
                ))
            })?;
            new_graph.get_mut(new_from).target = Some(new_to);
            new_graph.get_mut(new_to).referrers.push(new_from);
        }

        // Phase 4 — Widen.
        new_graph.widen_all_branches();

        // Phase 5 — Layout.
        new_graph.layout();

        // Phase 6 — Emit.
        let total = new_graph.total_size() as usize;
        let mut output = Vec::with_capacity(total);
        for idx in new_graph.order() {
            let rec = new_graph.get(idx);
            let mut bytes = rec.bytes().to_vec();

            if let Some(target_idx) = rec.target {
                let target_new_rva = new_graph.get(target_idx).new_rva;
                let (off, len) = rec
                    .branch_kind
                    .disp_field()
                    .expect("a linked record is always a resolved branch");
                let disp = target_new_rva as i64 - (rec.new_rva as i64 + rec.length as i64);
                patch_disp(&mut bytes, off, len, disp)?;
            } else if rec.flags.is_relative_branch() {
                // Unresolved (external) branch: the absolute target is
                // unaffected by the mutation (the old section is renamed,
                // not relocated); only this instruction's own position
                // moved, by `ext_delta`, into the new section.
                let target = rec
                    .branch_target_rva
                    .expect("a relative branch always has a branch_target_rva");
                let disp = target as i64 - ext_delta - rec.new_rva as i64 - rec.length as i64;
                let (off, len) = rec
                    .branch_kind
                    .disp_field()
                    .expect("is_relative_branch implies a disp field");
                patch_disp(&mut bytes, off, len, disp)?;
            }

            output.extend_from_slice(&bytes);
        }

        let entry_old_idx = old_graph
            .lookup_old_index(entry_point_rva_in)
            .expect("entry point boundary was validated in phase 1");
        let entry_new_idx = old_to_new_first.get(&entry_old_idx).copied().ok_or_else(|| {
            ZergError::Graph(format!("rule set dropped the instruction at the entry point RVA 0x{:X}", entry_point_rva_in))
        })?;
        let entry_point_rva_out = new_graph.get(entry_new_idx).new_rva;

        let mut rva_map = RvaMap::default();
        for old_idx in old_graph.order() {
            let orig = old_graph.get(old_idx);
            // An instruction the rule set dropped has no new-graph image and
            // is simply absent from the map; downstream PE fixups treat a
            // missing entry the same as any other unresolved old RVA.
            if let Some(&new_idx) = old_to_new_first.get(&old_idx) {
                rva_map.old_to_new.insert(orig.old_rva, new_graph.get(new_idx).new_rva);
            }
        }

        Ok(MutationOutput {
            bytes: output,
            entry_point_rva_out,
            rva_map,
            unresolved_in_region_branches,
        })
    }
}

fn patch_disp(bytes: &mut [u8], offset: usize, len: usize, disp: i64) -> Result<(), ZergError> {
    if offset + len > bytes.len() {
        return Err(ZergError::Graph("branch displacement field out of bounds".into()));
    }
    match len {
        1 => {
            let v = i8::try_from(disp)
                .map_err(|_| ZergError::Graph(format!("rel8 displacement {} does not fit in 8 bits", disp)))?;
            bytes[offset] = v as u8;
        }
        4 => {
            let v = i32::try_from(disp)
                .map_err(|_| ZergError::Graph(format!("rel32 displacement {} does not fit in 32 bits", disp)))?;
            bytes[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
        _ => unreachable!("branch displacement fields are always 1 or 4 bytes"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutate::IdentityMutation;

    fn run(input: &[u8], entry: u32) -> MutationOutput {
        let rule = IdentityMutation;
        let mut engine = Engine::new(&rule);
        engine.mutate(input, entry, 0, 0).unwrap()
    }

    #[test]
    fn empty_region_round_trips() {
        let out = run(&[], 0);
        assert!(out.bytes.is_empty());
        assert_eq!(out.entry_point_rva_out, 0);
        assert!(out.rva_map.is_empty());
    }

    #[test]
    fn single_ret_is_unchanged_under_identity() {
        let out = run(&[0xC3], 0);
        assert_eq!(out.bytes, vec![0xC3]);
        assert_eq!(out.entry_point_rva_out, 0);
    }

    #[test]
    fn short_jmp_widens_to_rel32() {
        // jmp +0; ret
        let out = run(&[0xEB, 0x00, 0xC3], 0);
        assert_eq!(out.bytes, vec![0xE9, 0x00, 0x00, 0x00, 0x00, 0xC3]);
        assert_eq!(out.entry_point_rva_out, 0);
        assert_eq!(out.rva_map.lookup(0), Some(0));
        assert_eq!(out.rva_map.lookup(2), Some(5));
    }

    #[test]
    fn forward_and_backward_jcc_pair() {
        // je +2; nop; nop; ret
        let out = run(&[0x74, 0x02, 0x90, 0x90, 0xC3], 0);
        // jcc widens to 6 bytes (0F 8x + rel32); nop,nop,ret follow unchanged.
        assert_eq!(out.bytes[0], 0x0F);
        assert_eq!(out.bytes[1], 0x84);
        let disp = i32::from_le_bytes([out.bytes[2], out.bytes[3], out.bytes[4], out.bytes[5]]);
        assert_eq!(disp, 2);
        assert_eq!(&out.bytes[6..], &[0x90, 0x90, 0xC3]);
        assert_eq!(out.rva_map.lookup(2), Some(6));
        assert_eq!(out.rva_map.lookup(3), Some(7));
        assert_eq!(out.rva_map.lookup(4), Some(8));
    }

    #[test]
    fn external_branch_target_is_preserved_after_relocation() {
        // call rel32 to an absolute target 0x1000 bytes past the region end.
        let target: i32 = 0x1000 + 5;
        let mut input = vec![0xE8];
        input.extend_from_slice(&target.to_le_bytes());
        let rule = IdentityMutation;
        let mut engine = Engine::new(&rule);
        let ext_delta: i64 = 0x40; // new section sits 0x40 bytes after the old one
        let out = engine.mutate(&input, 0, ext_delta, 0).unwrap();
        let disp = i32::from_le_bytes([out.bytes[1], out.bytes[2], out.bytes[3], out.bytes[4]]);
        let reconstructed_target = ext_delta + out.bytes.len() as i64 + disp as i64;
        assert_eq!(reconstructed_target, target as i64);
    }

    #[test]
    fn entry_point_not_at_boundary_is_fatal() {
        let rule = IdentityMutation;
        let mut engine = Engine::new(&rule);
        // Two-byte instruction; entry point 1 lands mid-instruction.
        let err = engine.mutate(&[0x01, 0xD8], 1, 0, 0).unwrap_err();
        assert!(matches!(err, ZergError::Graph(_)));
    }

    #[test]
    fn branch_into_middle_of_instruction_is_reported_not_silently_dropped() {
        // add eax, ebx; jmp +0 targeting rva 1 (the modrm byte of the first
        // instruction) instead of any instruction head.
        let mut input = vec![0x01, 0xD8, 0xEB, 0xFD];
        input[3] = (1i32 - (input.len() as i32)) as u8;
        let out = run(&input, 0);
        assert_eq!(out.unresolved_in_region_branches, vec![2]);
    }

    #[test]
    fn legitimately_external_branch_is_not_reported_as_unresolved() {
        let out = run(&[0xE9, 0x00, 0x10, 0x00, 0x00], 0);
        assert!(out.unresolved_in_region_branches.is_empty());
    }
}
