//! Export directory fixup.
//!
//! `IMAGE_EXPORT_DIRECTORY` (PE/COFF spec): only the two fields this pass
//! touches are named; the rest of the 40-byte struct is irrelevant here.
//! Offset 20 = `NumberOfFunctions`, offset 28 = `AddressOfFunctions` (an RVA
//! to an array of RVAs, one per exported ordinal).

use super::FixupCtx;
use crate::error::ZergError;

const NUMBER_OF_FUNCTIONS_OFFSET: usize = 20;
const ADDRESS_OF_FUNCTIONS_OFFSET: usize = 28;

pub(super) fn fixup(buf: &mut [u8], ctx: &FixupCtx, dir: (u32, u32)) -> Result<(), ZergError> {
    let (dir_rva, dir_size) = dir;
    if dir_rva == 0 || dir_size == 0 {
        return Ok(());
    }
    let dir_off = ctx
        .rva_to_offset(dir_rva)
        .ok_or_else(|| ZergError::Fixup("export directory RVA does not map to file content".into()))?;

    let count = u32::from_le_bytes(buf[dir_off + NUMBER_OF_FUNCTIONS_OFFSET..dir_off + NUMBER_OF_FUNCTIONS_OFFSET + 4].try_into().unwrap());
    let addr_of_functions_rva = u32::from_le_bytes(
        buf[dir_off + ADDRESS_OF_FUNCTIONS_OFFSET..dir_off + ADDRESS_OF_FUNCTIONS_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    let funcs_off = ctx
        .rva_to_offset(addr_of_functions_rva)
        .ok_or_else(|| ZergError::Fixup("export address table RVA does not map to file content".into()))?;

    for i in 0..count as usize {
        let entry_off = funcs_off + i * 4;
        let rva = u32::from_le_bytes(buf[entry_off..entry_off + 4].try_into().unwrap());
        if rva == 0 {
            continue;
        }
        // A forwarder export stores an RVA into the export directory itself
        // (the string "Other.dll.Func"), not a code pointer — left untouched.
        if rva >= dir_rva && rva < dir_rva + dir_size {
            continue;
        }
        if rva < ctx.old_base || rva >= ctx.old_base + ctx.old_size {
            continue;
        }
        let new_rva = ctx
            .remap(rva)
            .ok_or_else(|| ZergError::Fixup(format!("exported function RVA 0x{:X} is not an instruction head", rva)))?;
        buf[entry_off..entry_off + 4].copy_from_slice(&new_rva.to_le_bytes());
    }
    Ok(())
}
