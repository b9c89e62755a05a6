//! TLS callback fixup.
//!
//! `IMAGE_TLS_DIRECTORY32.AddressOfCallBacks` (offset 12) is itself a VA
//! pointing at a null-terminated array of absolute VAs, each the entry point
//! of one TLS callback invoked by the loader on thread attach/detach.

use super::FixupCtx;
use crate::error::ZergError;

const ADDRESS_OF_CALLBACKS_OFFSET: usize = 12;
/// Guards against a corrupt or adversarial image with a callback array that
/// never hits its null terminator.
const MAX_CALLBACKS: usize = 4096;

pub(super) fn fixup(buf: &mut [u8], ctx: &FixupCtx, dir: (u32, u32)) -> Result<(), ZergError> {
    let (dir_rva, _dir_size) = dir;
    if dir_rva == 0 {
        return Ok(());
    }
    let dir_off = ctx
        .rva_to_offset(dir_rva)
        .ok_or_else(|| ZergError::Fixup("TLS directory RVA does not map to file content".into()))?;

    let callbacks_va = u32::from_le_bytes(
        buf[dir_off + ADDRESS_OF_CALLBACKS_OFFSET..dir_off + ADDRESS_OF_CALLBACKS_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    if callbacks_va == 0 {
        return Ok(());
    }
    let callbacks_rva = callbacks_va
        .checked_sub(ctx.image_base)
        .ok_or_else(|| ZergError::Fixup("AddressOfCallBacks VA precedes the image base".into()))?;
    let callbacks_off = ctx
        .rva_to_offset(callbacks_rva)
        .ok_or_else(|| ZergError::Fixup("AddressOfCallBacks RVA does not map to file content".into()))?;

    for i in 0..MAX_CALLBACKS {
        let entry_off = callbacks_off + i * 4;
        let va = u32::from_le_bytes(buf[entry_off..entry_off + 4].try_into().unwrap());
        if va == 0 {
            break;
        }
        let rva = va
            .checked_sub(ctx.image_base)
            .ok_or_else(|| ZergError::Fixup("TLS callback VA precedes the image base".into()))?;
        if rva < ctx.old_base || rva >= ctx.old_base + ctx.old_size {
            continue;
        }
        let new_rva = ctx
            .remap(rva)
            .ok_or_else(|| ZergError::Fixup(format!("TLS callback RVA 0x{:X} is not an instruction head", rva)))?;
        let new_va = ctx.image_base + new_rva;
        buf[entry_off..entry_off + 4].copy_from_slice(&new_va.to_le_bytes());
    }
    Ok(())
}
