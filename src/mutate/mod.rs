//! The Mutation Rule Set — a pluggable collaborator the engine queries but
//! does not define. This module fixes the contract and ships the one rule
//! set the engine requires for its own correctness testing; [`polymorphic`]
//! ships the concrete catalog.

pub mod polymorphic;

use crate::error::ZergError;
use crate::graph::InstructionRecord;

/// Given one decoded instruction, emit zero or more replacement
/// instructions into `sink` whose aggregate effect on architectural state
/// is identical to the original.
///
/// Implementations must uphold the following guarantees:
/// - A branch is rewritten to exactly one branch of the same kind and the
///   same `branch_target_rva`.
/// - A `ret`/`ret imm16` is rewritten to end with a `ret`/`ret imm16`.
/// - No rule spans two input instructions.
/// - Any flag the *next* instruction might read is preserved unless the
///   rule can prove otherwise (conservative default).
pub trait MutationImpl {
    fn mutate(&self, record: &InstructionRecord, sink: &mut Vec<InstructionRecord>) -> Result<(), ZergError>;
}

/// The engine's required baseline: every input instruction reappears
/// unchanged. Useful for exercising layout/fixup correctness independently
/// of any rewrite catalog.
pub struct IdentityMutation;

impl MutationImpl for IdentityMutation {
    fn mutate(&self, record: &InstructionRecord, sink: &mut Vec<InstructionRecord>) -> Result<(), ZergError> {
        sink.push(record.clone());
        Ok(())
    }
}
