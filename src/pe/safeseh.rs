//! SafeSEH handler table fixup.
//!
//! Two fields of `IMAGE_LOAD_CONFIG_DIRECTORY32` matter here: `SEHandlerTable`
//! (offset 64, a VA pointing at a sorted `DWORD` array of handler RVAs) and
//! `SEHandlerCount` (offset 68). Everything else in the load-config directory
//! is irrelevant to this pass.

use super::FixupCtx;
use crate::error::ZergError;

const SE_HANDLER_TABLE_OFFSET: usize = 64;
const SE_HANDLER_COUNT_OFFSET: usize = 68;
const MIN_SIZE_FOR_SAFESEH: u32 = SE_HANDLER_COUNT_OFFSET as u32 + 4;

pub(super) fn fixup(buf: &mut [u8], ctx: &FixupCtx, dir: (u32, u32)) -> Result<(), ZergError> {
    let (dir_rva, dir_size) = dir;
    if dir_rva == 0 || dir_size < MIN_SIZE_FOR_SAFESEH {
        return Ok(());
    }
    let dir_off = ctx
        .rva_to_offset(dir_rva)
        .ok_or_else(|| ZergError::Fixup("load-config directory RVA does not map to file content".into()))?;

    let declared_size = u32::from_le_bytes(buf[dir_off..dir_off + 4].try_into().unwrap());
    if declared_size < MIN_SIZE_FOR_SAFESEH {
        return Ok(());
    }

    let table_va = u32::from_le_bytes(
        buf[dir_off + SE_HANDLER_TABLE_OFFSET..dir_off + SE_HANDLER_TABLE_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    let count = u32::from_le_bytes(
        buf[dir_off + SE_HANDLER_COUNT_OFFSET..dir_off + SE_HANDLER_COUNT_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    if table_va == 0 || count == 0 {
        return Ok(());
    }

    let table_rva = table_va
        .checked_sub(ctx.image_base)
        .ok_or_else(|| ZergError::Fixup("SEHandlerTable VA precedes the image base".into()))?;
    let table_off = ctx
        .rva_to_offset(table_rva)
        .ok_or_else(|| ZergError::Fixup("SEHandlerTable RVA does not map to file content".into()))?;

    for i in 0..count as usize {
        let entry_off = table_off + i * 4;
        let rva = u32::from_le_bytes(buf[entry_off..entry_off + 4].try_into().unwrap());
        if rva < ctx.old_base || rva >= ctx.old_base + ctx.old_size {
            continue;
        }
        let new_rva = ctx
            .remap(rva)
            .ok_or_else(|| ZergError::Fixup(format!("SafeSEH handler RVA 0x{:X} is not an instruction head", rva)))?;
        buf[entry_off..entry_off + 4].copy_from_slice(&new_rva.to_le_bytes());
    }
    Ok(())
}
