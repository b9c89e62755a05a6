//! Per-instruction flag bits set by the length disassembler and consumed by
//! the graph, the rule set, and the engine's branch handling.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstructionFlags: u16 {
        const HAS_MODRM      = 1 << 0;
        const HAS_SIB        = 1 << 1;
        const HAS_IMM        = 1 << 2;
        const HAS_DISP       = 1 << 3;
        const IS_BRANCH_REL8 = 1 << 4;
        const IS_BRANCH_REL32 = 1 << 5;
        const IS_CALL        = 1 << 6;
        const IS_RET         = 1 << 7;
        const IS_JCC         = 1 << 8;
        const IS_JMP         = 1 << 9;
        const IS_SHORT       = 1 << 10;
        const IS_SYNTHETIC   = 1 << 11;
    }
}

impl InstructionFlags {
    /// Any flavor of relative branch (call rel32, jmp rel8/rel32, jcc rel8/rel32,
    /// loop/jecxz rel8).
    pub fn is_relative_branch(self) -> bool {
        self.intersects(Self::IS_BRANCH_REL8 | Self::IS_BRANCH_REL32)
    }

    pub fn is_branch(self) -> bool {
        self.intersects(Self::IS_CALL | Self::IS_JCC | Self::IS_JMP)
    }
}
