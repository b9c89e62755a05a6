//! Base relocation fixup.
//!
//! `IMAGE_BASE_RELOCATION` blocks: an 8-byte header (`VirtualAddress`,
//! `SizeOfBlock`) followed by `(SizeOfBlock - 8) / 2` 16-bit entries, each a
//! 4-bit type in the high nibble and a 12-bit page offset in the low 12
//! bits. Type 0 (`ABSOLUTE`) is a no-op padding entry used to 4-byte-align a
//! block with an odd entry count.

use super::FixupCtx;
use crate::error::ZergError;

const ABSOLUTE: u16 = 0;

pub(super) fn fixup(
    buf: &mut Vec<u8>,
    ctx: &FixupCtx,
    dir: (u32, u32),
    size_field_offset: usize,
) -> Result<(), ZergError> {
    let (dir_rva, dir_size) = dir;
    if dir_rva == 0 || dir_size == 0 {
        return Ok(());
    }
    let dir_off = ctx
        .rva_to_offset(dir_rva)
        .ok_or_else(|| ZergError::Fixup("relocation directory RVA does not map to file content".into()))?;

    // Walk the table one block at a time. A block with no entry inside the
    // old section is untouched by this mutation and is carried over
    // byte-for-byte, in its original position; only blocks that overlap the
    // old section are decomposed, remapped, and regrouped into fresh pages
    // appended after every untouched block — mirroring the original
    // `PEMutator.cpp`, which erases exactly the old-section-derived blocks
    // from the live relocation list and appends freshly built ones, leaving
    // every other block's bytes and grouping untouched.
    let mut untouched_bytes: Vec<u8> = Vec::new();
    let mut touched_entries: Vec<(u32, u16)> = Vec::new();
    let mut pos = 0usize;
    while pos < dir_size as usize {
        let block_off = dir_off + pos;
        let block_va = u32::from_le_bytes(buf[block_off..block_off + 4].try_into().unwrap());
        let size_of_block = u32::from_le_bytes(buf[block_off + 4..block_off + 8].try_into().unwrap());
        if size_of_block < 8 {
            break;
        }
        let count = (size_of_block as usize - 8) / 2;

        let block_overlaps_old_section = (0..count).any(|i| {
            let entry_off = block_off + 8 + i * 2;
            let entry = u16::from_le_bytes(buf[entry_off..entry_off + 2].try_into().unwrap());
            if entry >> 12 == ABSOLUTE {
                return false;
            }
            let abs_rva = block_va + (entry & 0x0FFF) as u32;
            abs_rva >= ctx.old_base && abs_rva < ctx.old_base + ctx.old_size
        });

        if !block_overlaps_old_section {
            untouched_bytes.extend_from_slice(&buf[block_off..block_off + size_of_block as usize]);
        } else {
            // This block is erased wholesale; every live (non-padding) entry
            // in it — whether it falls in the old section or not — is
            // re-collected for regrouping, since the block it used to live
            // in no longer exists.
            for i in 0..count {
                let entry_off = block_off + 8 + i * 2;
                let entry = u16::from_le_bytes(buf[entry_off..entry_off + 2].try_into().unwrap());
                let kind = entry >> 12;
                if kind == ABSOLUTE {
                    continue;
                }
                let page_offset = entry & 0x0FFF;
                let abs_rva = block_va + page_offset as u32;
                if let Some(new_rva) = ctx.remap(abs_rva) {
                    touched_entries.push((new_rva, kind));
                } else if abs_rva < ctx.old_base || abs_rva >= ctx.old_base + ctx.old_size {
                    touched_entries.push((abs_rva, kind));
                }
                // else: inside the old section but not an instruction head — dropped.
            }
        }
        pos += size_of_block as usize;
    }

    touched_entries.sort_by_key(|&(rva, _)| rva);

    let mut new_bytes = untouched_bytes;
    let mut i = 0;
    while i < touched_entries.len() {
        let page = touched_entries[i].0 & !0x0FFF;
        let start = i;
        while i < touched_entries.len() && touched_entries[i].0 & !0x0FFF == page {
            i += 1;
        }
        let mut page_entries: Vec<u16> = touched_entries[start..i]
            .iter()
            .map(|&(rva, kind)| (kind << 12) | ((rva - page) as u16 & 0x0FFF))
            .collect();
        if page_entries.len() % 2 == 1 {
            page_entries.push(ABSOLUTE << 12);
        }
        let size_of_block = 8 + page_entries.len() * 2;
        new_bytes.extend_from_slice(&page.to_le_bytes());
        new_bytes.extend_from_slice(&(size_of_block as u32).to_le_bytes());
        for e in page_entries {
            new_bytes.extend_from_slice(&e.to_le_bytes());
        }
    }

    let available = buf.len() - dir_off;
    if new_bytes.len() > available {
        return Err(ZergError::Fixup(
            "rebuilt relocation directory no longer fits in its section".into(),
        ));
    }
    let old_len = new_bytes.len();
    buf[dir_off..dir_off + old_len].copy_from_slice(&new_bytes);
    if old_len < dir_size as usize {
        for b in &mut buf[dir_off + old_len..dir_off + dir_size as usize] {
            *b = 0;
        }
    }
    buf[size_field_offset..size_field_offset + 4].copy_from_slice(&(new_bytes.len() as u32).to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::mutate::IdentityMutation;
    use crate::pe::SectionSpan;

    /// One block inside the old section (gets remapped and regrouped) and
    /// one block entirely outside it (must survive byte-for-byte, in place,
    /// ahead of the regrouped block).
    #[test]
    fn untouched_blocks_survive_byte_for_byte_and_touched_ones_are_regrouped() {
        let rule = IdentityMutation;
        let mut engine = Engine::new(&rule);
        let out = engine.mutate(&[0xC3], 0, 0, 0).unwrap();
        assert_eq!(out.rva_map.lookup(0), Some(0));

        let old_base = 0x1000u32;
        let old_size = 1u32;
        let new_base = 0x2000u32;

        let mut untouched_block = Vec::new();
        untouched_block.extend_from_slice(&0x5000u32.to_le_bytes()); // VirtualAddress
        untouched_block.extend_from_slice(&10u32.to_le_bytes()); // SizeOfBlock
        untouched_block.extend_from_slice(&((3u16 << 12) | 0x010).to_le_bytes()); // HIGHLOW @ +0x10

        let mut touched_block = Vec::new();
        touched_block.extend_from_slice(&old_base.to_le_bytes()); // VirtualAddress == old_base
        touched_block.extend_from_slice(&10u32.to_le_bytes()); // SizeOfBlock
        touched_block.extend_from_slice(&((3u16 << 12) | 0x000).to_le_bytes()); // HIGHLOW @ +0

        let dir_off = 0x3000usize;
        let dir_size = (untouched_block.len() + touched_block.len()) as u32;
        let mut buf = vec![0u8; dir_off + 0x200];
        buf[dir_off..dir_off + untouched_block.len()].copy_from_slice(&untouched_block);
        buf[dir_off + untouched_block.len()..dir_off + untouched_block.len() + touched_block.len()]
            .copy_from_slice(&touched_block);

        let ctx = FixupCtx {
            image_base: 0x0040_0000,
            old_base,
            old_size,
            new_base,
            rva_map: &out.rva_map,
            sections: vec![SectionSpan {
                virtual_address: 0x3000,
                virtual_size: 0x200,
                file_offset: 0x3000,
                file_size: 0x200,
            }],
        };

        let size_field_offset = dir_off + 0x100;
        fixup(&mut buf, &ctx, (0x3000, dir_size), size_field_offset).unwrap();

        // The untouched block is byte-for-byte identical, and comes first.
        assert_eq!(&buf[dir_off..dir_off + untouched_block.len()], &untouched_block[..]);

        // Right after it, one freshly built page for the remapped entry:
        // old_base + 0 -> new_base + 0 = 0x2000, page 0x2000, offset 0.
        let regrouped_off = dir_off + untouched_block.len();
        let page = u32::from_le_bytes(buf[regrouped_off..regrouped_off + 4].try_into().unwrap());
        assert_eq!(page, 0x2000);
        let size_of_block = u32::from_le_bytes(buf[regrouped_off + 4..regrouped_off + 8].try_into().unwrap());
        assert_eq!(size_of_block, 12); // one live entry padded to an even count
        let entry = u16::from_le_bytes(buf[regrouped_off + 8..regrouped_off + 10].try_into().unwrap());
        assert_eq!(entry >> 12, 3);
        assert_eq!(entry & 0x0FFF, 0);

        let new_size = u32::from_le_bytes(buf[size_field_offset..size_field_offset + 4].try_into().unwrap());
        assert_eq!(new_size, (untouched_block.len() + 12) as u32);
    }

    #[test]
    fn entry_inside_old_section_but_not_an_instruction_head_is_dropped() {
        let rule = IdentityMutation;
        let mut engine = Engine::new(&rule);
        let out = engine.mutate(&[0xC3], 0, 0, 0).unwrap();

        let old_base = 0x1000u32;
        let old_size = 4u32; // wider than the single decoded instruction

        let mut block = Vec::new();
        block.extend_from_slice(&old_base.to_le_bytes());
        block.extend_from_slice(&10u32.to_le_bytes());
        block.extend_from_slice(&((3u16 << 12) | 0x002).to_le_bytes()); // not an instruction head

        let dir_off = 0x3000usize;
        let mut buf = vec![0u8; dir_off + 0x200];
        buf[dir_off..dir_off + block.len()].copy_from_slice(&block);

        let ctx = FixupCtx {
            image_base: 0x0040_0000,
            old_base,
            old_size,
            new_base: 0x2000,
            rva_map: &out.rva_map,
            sections: vec![SectionSpan {
                virtual_address: 0x3000,
                virtual_size: 0x200,
                file_offset: 0x3000,
                file_size: 0x200,
            }],
        };

        let size_field_offset = dir_off + 0x100;
        fixup(&mut buf, &ctx, (0x3000, block.len() as u32), size_field_offset).unwrap();

        let new_size = u32::from_le_bytes(buf[size_field_offset..size_field_offset + 4].try_into().unwrap());
        assert_eq!(new_size, 0, "the only entry was unmappable and should be dropped, not relocated");
    }
}
