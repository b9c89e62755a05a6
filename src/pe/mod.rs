//! The PE Fixup Layer: parses the image with the `exe` crate, runs the
//! [`crate::engine::Engine`] over the code section containing the entry
//! point, appends the rewritten section, renames the old one to `.pdata`,
//! and patches every pointer class (exports, relocations, SafeSEH, TLS,
//! entry point) against the engine's RVA map.
//!
//! Directory parsing (exports, relocations, load-config/SafeSEH, TLS) is done
//! by hand against the raw byte buffer rather than through higher-level `exe`
//! helpers: the struct layouts are fixed by the PE/COFF format itself, and
//! patching function pointers and VAs in place needs no allocation-shifting
//! rebuild logic a higher-level helper would otherwise have to supply.

mod exports;
mod relocations;
mod safeseh;
mod tls;

use std::path::Path;

use exe::pe::PE;
use exe::types::{CChar, RVA};
use exe::{Buffer, SectionCharacteristics, VecPE};

use crate::engine::{Engine, RvaMap};
use crate::error::ZergError;
use crate::mutate::polymorphic::{MutationConfig, PolymorphicMutation};

const IMAGE_SECTION_HEADER_SIZE: usize = 40;
const FILE_ALIGNMENT_DEFAULT: u32 = 0x200;

pub mod data_directory {
    pub const EXPORT: usize = 0;
    pub const BASE_RELOC: usize = 5;
    pub const TLS: usize = 9;
    pub const LOAD_CONFIG: usize = 10;
}

fn align_up(value: u32, align: u32) -> u32 {
    if align == 0 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// A resolved section, stripped down to what the fixup passes need to turn
/// an RVA into a file offset.
#[derive(Clone, Copy)]
struct SectionSpan {
    virtual_address: u32,
    virtual_size: u32,
    file_offset: u32,
    file_size: u32,
}

/// Shared context the four fixup passes read from; none of them mutate it.
pub(crate) struct FixupCtx<'a> {
    image_base: u32,
    old_base: u32,
    old_size: u32,
    new_base: u32,
    rva_map: &'a RvaMap,
    sections: Vec<SectionSpan>,
}

impl<'a> FixupCtx<'a> {
    /// `record.new_rva + new_base` for a pointer that was inside the old
    /// section, or `None` if `rva` was outside it or didn't map to an
    /// instruction head — an invalid pointer.
    fn remap(&self, rva: u32) -> Option<u32> {
        if rva < self.old_base || rva >= self.old_base + self.old_size {
            return None;
        }
        let rva_in_section = rva - self.old_base;
        self.rva_map.lookup(rva_in_section).map(|new_rva| new_rva + self.new_base)
    }

    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        for s in &self.sections {
            let end = s.virtual_address + s.virtual_size.max(s.file_size);
            if rva >= s.virtual_address && rva < end {
                return Some((s.file_offset + (rva - s.virtual_address)) as usize);
            }
        }
        // Headers are identity-mapped below the first section.
        if (rva as usize) < self.sections.first().map(|s| s.file_offset as usize).unwrap_or(0) {
            return Some(rva as usize);
        }
        None
    }
}

fn section_name_bytes(name: &str) -> [CChar; 8] {
    let mut buf = [CChar(0); 8];
    for (i, b) in name.as_bytes().iter().take(8).enumerate() {
        buf[i] = CChar(*b);
    }
    buf
}

/// 40-byte on-disk `IMAGE_SECTION_HEADER` layout. Packed by hand (no
/// transmute) since the struct only exists to be written into the file
/// buffer at a fixed offset.
struct NewSectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    characteristics: u32,
}

impl NewSectionHeader {
    fn to_bytes(&self) -> [u8; IMAGE_SECTION_HEADER_SIZE] {
        let mut out = [0u8; IMAGE_SECTION_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.name);
        out[8..12].copy_from_slice(&self.virtual_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.virtual_address.to_le_bytes());
        out[16..20].copy_from_slice(&self.size_of_raw_data.to_le_bytes());
        out[20..24].copy_from_slice(&self.pointer_to_raw_data.to_le_bytes());
        // pointer_to_relocations, pointer_to_linenumbers, number_of_relocations,
        // number_of_linenumbers: always zero for a code section we generate.
        out[36..40].copy_from_slice(&self.characteristics.to_le_bytes());
        out
    }
}

/// Facts the CLI prints at its `[*]`/`[+]` checkpoints. Library code stays
/// silent; [`mutate_file`] returns this so the binary is the only thing that
/// ever writes to stdout.
pub struct MutationReport {
    pub old_section_rva: u32,
    pub old_section_size: u32,
    pub entry_point_rva: u32,
    pub new_section_rva: u32,
    pub new_section_size: u32,
    /// Old RVAs (section-relative) of branches that resolved inside the
    /// code region but not onto any decoded instruction head. Recoverable —
    /// the branch is left pointing at its original absolute target — but
    /// worth surfacing since it usually means embedded data or obfuscation
    /// inside the mutated section.
    pub unresolved_in_region_branches: Vec<u32>,
}

/// Parse `input_path`, mutate its code section, and write the rewritten
/// image to `output_path`. The output file is never created until the whole
/// image has been rebuilt in memory.
pub fn mutate_file(input_path: &Path, output_path: &Path) -> Result<MutationReport, ZergError> {
    let mut pe = VecPE::from_disk_file(input_path).map_err(|e| ZergError::Parse(format!("{:?}", e)))?;

    let arch = pe.get_arch().map_err(|e| ZergError::Parse(format!("{:?}", e)))?;
    if arch != exe::Arch::X86 {
        return Err(ZergError::Parse("zerg mutates x86 (32-bit) images only".into()));
    }

    let image_base = pe.get_image_base().map_err(|e| ZergError::Parse(format!("{:?}", e)))? as u32;
    let entry_rva = pe.get_entrypoint().map_err(|e| ZergError::Parse(format!("{:?}", e)))?.0;

    let section_table = pe
        .get_section_table()
        .map_err(|e| ZergError::Parse(format!("{:?}", e)))?
        .to_vec();

    let code_idx = section_table
        .iter()
        .position(|s| {
            let contains_entry = entry_rva >= s.virtual_address.0
                && entry_rva < s.virtual_address.0 + s.virtual_size.max(s.size_of_raw_data);
            contains_entry
                && (s.characteristics.contains(SectionCharacteristics::CNT_CODE)
                    || s.characteristics.contains(SectionCharacteristics::MEM_EXECUTE))
        })
        .ok_or_else(|| ZergError::Parse("no executable section contains the entry point".into()))?;

    let code = &section_table[code_idx];
    let old_base = code.virtual_address.0;
    let raw_offset = code.pointer_to_raw_data.0 as usize;
    let raw_available = code.size_of_raw_data as usize;

    let file_bytes = pe.as_slice();
    if raw_offset + raw_available > file_bytes.len() {
        return Err(ZergError::Parse("code section exceeds file bounds".into()));
    }
    // The region handed to the engine is the section's *virtual* size, not
    // its file-aligned raw size: size_of_raw_data is rounded up to
    // FileAlignment and routinely carries trailing zero padding past the
    // true end of code, which the length disassembler would otherwise walk
    // into and decode as fabricated `add [eax],al` instructions (or abort
    // outright if the padding length is odd bytes short of a full
    // instruction). Clamped to the raw bytes actually available on disk.
    let old_virtual_size = (code.virtual_size as usize).min(raw_available) as u32;
    let code_bytes = file_bytes[raw_offset..raw_offset + old_virtual_size as usize].to_vec();

    let entry_point_rva_in = entry_rva
        .checked_sub(old_base)
        .ok_or_else(|| ZergError::Graph("entry point precedes its own section".into()))?;

    let section_alignment = {
        let nt = pe.get_valid_nt_headers_32().map_err(|e| ZergError::Parse(format!("{:?}", e)))?;
        nt.optional_header.section_alignment
    };
    // Per spec, the new section's VA is derived from the *last* entry in the
    // section table (table order), not the section with the highest VA+size
    // — a table with a resource/debug section appended out of VA order must
    // not change where the new section lands.
    let existing_va_end = section_table
        .last()
        .map(|s| s.virtual_address.0 + s.virtual_size.max(s.size_of_raw_data))
        .unwrap_or(0);
    let new_base = align_up(existing_va_end, section_alignment.max(1));
    let ext_delta = new_base as i64 - old_base as i64;
    let ext_base = image_base as u64 + old_base as u64;

    let rule_set = PolymorphicMutation::new(MutationConfig::default());
    let mut engine = Engine::new(&rule_set);
    let output = engine.mutate(&code_bytes, entry_point_rva_in, ext_delta, ext_base)?;

    // --- Section table / header bookkeeping ---
    let file_alignment = {
        let nt = pe.get_valid_nt_headers_32().map_err(|e| ZergError::Parse(format!("{:?}", e)))?;
        if nt.optional_header.file_alignment == 0 {
            FILE_ALIGNMENT_DEFAULT
        } else {
            nt.optional_header.file_alignment
        }
    };
    let existing_file_end = section_table
        .last()
        .map(|s| s.pointer_to_raw_data.0 + s.size_of_raw_data)
        .unwrap_or(0);
    let new_raw_offset = align_up(existing_file_end, file_alignment);
    let new_raw_size = align_up(output.bytes.len() as u32, file_alignment);

    let new_entry_rva = new_base + output.entry_point_rva_out;
    let new_size_of_image = align_up(
        existing_va_end.max(new_base + output.bytes.len() as u32),
        section_alignment.max(1),
    );

    let section_table_offset = pe.get_section_table_offset().map_err(|e| ZergError::Parse(format!("{:?}", e)))?.0 as usize;

    {
        let nt = pe.get_valid_mut_nt_headers_32().map_err(|e| ZergError::Parse(format!("{:?}", e)))?;
        nt.file_header.number_of_sections += 1;
        nt.optional_header.base_of_code = new_base;
        nt.optional_header.address_of_entry_point = RVA(new_entry_rva);
        nt.optional_header.size_of_image = new_size_of_image;
        nt.optional_header.checksum = 0;
    }

    let mut final_bin = pe.as_slice().to_vec();

    // Rename the old code section in place (name is an 8-byte fixed field).
    let old_hdr_pos = section_table_offset + code_idx * IMAGE_SECTION_HEADER_SIZE;
    let pdata_name = section_name_bytes(".pdata");
    for (i, c) in pdata_name.iter().enumerate() {
        final_bin[old_hdr_pos + i] = c.0;
    }

    // Append the new section header at the next free table slot.
    let new_hdr = NewSectionHeader {
        name: {
            let n = section_name_bytes(".text");
            let mut out = [0u8; 8];
            for (i, c) in n.iter().enumerate() {
                out[i] = c.0;
            }
            out
        },
        virtual_size: output.bytes.len() as u32,
        virtual_address: new_base,
        size_of_raw_data: new_raw_size,
        pointer_to_raw_data: new_raw_offset,
        characteristics: (SectionCharacteristics::CNT_CODE
            | SectionCharacteristics::MEM_EXECUTE
            | SectionCharacteristics::MEM_READ)
            .bits(),
    };
    let new_hdr_pos = section_table_offset + section_table.len() * IMAGE_SECTION_HEADER_SIZE;
    let new_hdr_bytes = new_hdr.to_bytes();
    if new_hdr_pos + IMAGE_SECTION_HEADER_SIZE > final_bin.len() {
        final_bin.resize(new_hdr_pos + IMAGE_SECTION_HEADER_SIZE, 0);
    }
    final_bin[new_hdr_pos..new_hdr_pos + IMAGE_SECTION_HEADER_SIZE].copy_from_slice(&new_hdr_bytes);

    let required_size = new_raw_offset as usize + new_raw_size as usize;
    if final_bin.len() < required_size {
        final_bin.resize(required_size, 0);
    }
    final_bin[new_raw_offset as usize..new_raw_offset as usize + output.bytes.len()]
        .copy_from_slice(&output.bytes);

    // --- Fixups: exports, relocations, SafeSEH, TLS, in that fixed order ---
    let mut sections: Vec<SectionSpan> = section_table
        .iter()
        .map(|s| SectionSpan {
            virtual_address: s.virtual_address.0,
            virtual_size: s.virtual_size,
            file_offset: s.pointer_to_raw_data.0,
            file_size: s.size_of_raw_data,
        })
        .collect();
    sections.push(SectionSpan {
        virtual_address: new_base,
        virtual_size: output.bytes.len() as u32,
        file_offset: new_raw_offset,
        file_size: new_raw_size,
    });

    let ctx = FixupCtx {
        image_base,
        old_base,
        old_size: old_virtual_size,
        new_base,
        rva_map: &output.rva_map,
        sections,
    };

    let (directories, dirs_start) = read_data_directories(&final_bin, section_table_offset)?;
    let reloc_size_field_offset = dirs_start + data_directory::BASE_RELOC * 8 + 4;

    exports::fixup(&mut final_bin, &ctx, directories[data_directory::EXPORT])?;
    relocations::fixup(
        &mut final_bin,
        &ctx,
        directories[data_directory::BASE_RELOC],
        reloc_size_field_offset,
    )?;
    safeseh::fixup(&mut final_bin, &ctx, directories[data_directory::LOAD_CONFIG])?;
    tls::fixup(&mut final_bin, &ctx, directories[data_directory::TLS])?;

    std::fs::write(output_path, &final_bin)?;
    Ok(MutationReport {
        old_section_rva: old_base,
        old_section_size: old_virtual_size,
        entry_point_rva: entry_rva,
        new_section_rva: new_base,
        new_section_size: output.bytes.len() as u32,
        unresolved_in_region_branches: output.unresolved_in_region_branches,
    })
}

/// `(rva, size)` for each of the 16 data directory slots, read directly from
/// the optional header (offset fixed by the PE32 layout: the directory array
/// starts right after `NumberOfRvaAndSizes`, i.e. at the end of the 96-byte
/// PE32 optional header proper plus the COFF/PE signature preamble already
/// accounted for by `section_table_offset` minus the section table's own
/// preceding bytes — read via the same NT-header view `exe` already parsed,
/// to avoid hand-computing header offsets twice).
fn read_data_directories(buf: &[u8], section_table_offset: usize) -> Result<([(u32, u32); 16], usize), ZergError> {
    // The section table immediately follows the optional header, which ends
    // with the 16 (rva, size) pairs (8 bytes each) — work backwards from
    // `section_table_offset`.
    let dir_bytes_len = 16 * 8;
    let dirs_start = section_table_offset
        .checked_sub(dir_bytes_len)
        .ok_or_else(|| ZergError::Parse("optional header too short for a full data directory".into()))?;
    let mut out = [(0u32, 0u32); 16];
    for i in 0..16 {
        let off = dirs_start + i * 8;
        let rva = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let size = u32::from_le_bytes(buf[off + 4..off + 8].try_into().unwrap());
        out[i] = (rva, size);
    }
    Ok((out, dirs_start))
}
