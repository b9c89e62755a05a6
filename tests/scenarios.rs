//! Whole-pipeline scenarios exercised against [`zerg::Engine`] directly (the
//! PE fixup layer needs a real on-disk image to drive end-to-end, which is
//! covered by the unit tests in `src/pe/`).

use zerg::{Engine, IdentityMutation, MutationConfig, PolymorphicMutation};

fn mutate_identity(input: &[u8], entry: u32) -> zerg::MutationOutput {
    let rule = IdentityMutation;
    let mut engine = Engine::new(&rule);
    engine.mutate(input, entry, 0, 0).unwrap()
}

#[test]
fn empty_section_scenario() {
    let out = mutate_identity(&[], 0);
    assert!(out.bytes.is_empty());
    assert_eq!(out.entry_point_rva_out, 0);
    assert!(out.rva_map.is_empty());
}

#[test]
fn single_ret_scenario() {
    let out = mutate_identity(&[0xC3], 0);
    assert_eq!(out.bytes, vec![0xC3]);
    assert_eq!(out.entry_point_rva_out, 0);
}

#[test]
fn short_unconditional_jump_widens() {
    let out = mutate_identity(&[0xEB, 0x00, 0xC3], 0);
    assert_eq!(out.bytes, vec![0xE9, 0x00, 0x00, 0x00, 0x00, 0xC3]);
    assert_eq!(out.rva_map.get_idata_by_rva(0), Some((0, 0)));
    assert_eq!(out.rva_map.get_idata_by_rva(2), Some((2, 5)));
}

#[test]
fn forward_and_backward_short_jcc_pair() {
    // je +2; nop; nop; ret
    let out = mutate_identity(&[0x74, 0x02, 0x90, 0x90, 0xC3], 0);
    assert_eq!(out.rva_map.get_idata_by_rva(0), Some((0, 0)));
    assert_eq!(out.rva_map.get_idata_by_rva(2), Some((2, 6)));
    assert_eq!(out.rva_map.get_idata_by_rva(3), Some((3, 7)));
    assert_eq!(out.rva_map.get_idata_by_rva(4), Some((4, 8)));
}

#[test]
fn external_absolute_branch_keeps_its_target() {
    // call rel32 to a fixed point well outside the mutated region.
    let target: i32 = 0x2000;
    let mut input = vec![0xE8];
    input.extend_from_slice(&(target - 5).to_le_bytes());
    let rule = IdentityMutation;
    let mut engine = Engine::new(&rule);
    let ext_delta = 0x80i64;
    let out = engine.mutate(&input, 0, ext_delta, 0).unwrap();
    let disp = i32::from_le_bytes([out.bytes[1], out.bytes[2], out.bytes[3], out.bytes[4]]);
    let reconstructed = ext_delta + out.bytes.len() as i64 + disp as i64;
    assert_eq!(reconstructed, target as i64);
}

/// A small function with a loop, a forward branch, and a call — exercises
/// graph completeness, layout monotonicity, and branch closure together
/// under the concrete polymorphic rule set, not just identity.
#[test]
fn graph_invariants_hold_under_the_polymorphic_rule_set() {
    let mut input = Vec::new();
    input.extend_from_slice(&[0x31, 0xC9]); // xor ecx, ecx
    let loop_top = input.len() as u32;
    input.extend_from_slice(&[0x41]); // inc ecx
    input.extend_from_slice(&[0x83, 0xF9, 0x0A]); // cmp ecx, 10
    let rel = loop_top as i32 - (input.len() as i32 + 2);
    input.push(0x72); // jb loop_top
    input.push(rel as u8);
    input.extend_from_slice(&[0xE8, 0x00, 0x00, 0x00, 0x00]); // call +0 (external-ish, self-relative)
    input.push(0xC3); // ret

    let rule = PolymorphicMutation::new(MutationConfig::default());
    let mut engine = Engine::new(&rule);
    let out = engine.mutate(&input, 0, 0, 0).unwrap();

    assert!(out.bytes.len() >= input.len(), "widening/junk only ever grows the stream");
    assert_eq!(out.entry_point_rva_out, 0);

    // Every old instruction head still maps to a new one, and new RVAs are
    // monotone in emission order.
    let origins = [0u32, 2, 3, 6, 8, 13];
    let mut last_new = None;
    for rva in origins {
        let (_, new_rva) = out.rva_map.get_idata_by_rva(rva).expect("every instruction head survives mutation");
        if let Some(prev) = last_new {
            assert!(new_rva >= prev, "new RVAs must not regress across emission order");
        }
        last_new = Some(new_rva);
    }
}

#[test]
fn entry_point_mid_instruction_is_rejected() {
    let rule = IdentityMutation;
    let mut engine = Engine::new(&rule);
    let err = engine.mutate(&[0x01, 0xD8, 0xC3], 1, 0, 0).unwrap_err();
    assert!(matches!(err, zerg::ZergError::Graph(_)));
}

#[test]
fn undefined_opcode_aborts_the_whole_mutation() {
    let rule = IdentityMutation;
    let mut engine = Engine::new(&rule);
    let err = engine.mutate(&[0xC3, 0x0F, 0xFF], 0, 0, 0).unwrap_err();
    assert!(matches!(err, zerg::ZergError::Decode { .. }));
}
