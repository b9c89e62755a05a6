use std::path::{Path, PathBuf};
use std::process;

use zerg::pe;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        println!("Usage: zerg <input_path> [output_path]");
        process::exit(2);
    }

    let input_path = PathBuf::from(&args[1]);
    let output_path = args.get(2).map(PathBuf::from).unwrap_or_else(|| default_output_path(&input_path));

    println!("[*] Mutating {:?}", input_path);
    match pe::mutate_file(&input_path, &output_path) {
        Ok(report) => {
            println!(
                "[*] Code section: RVA 0x{:X}, {} bytes",
                report.old_section_rva, report.old_section_size
            );
            println!("[*] Entry point RVA: 0x{:X}", report.entry_point_rva);
            println!(
                "[+] New section RVA: 0x{:X}, {} bytes",
                report.new_section_rva, report.new_section_size
            );
            for rva in &report.unresolved_in_region_branches {
                println!("[!] branch at RVA 0x{:X} targets the middle of an instruction; left unresolved", rva);
            }
            println!("[+] Wrote {:?}", output_path);
            process::exit(0);
        }
        Err(e) => {
            println!("[!] {}", e);
            process::exit(1);
        }
    }
}

/// `<stem>_Mutated.<ext>` when the input has an extension, `<input>_Mutated`
/// otherwise.
fn default_output_path(input: &Path) -> PathBuf {
    match input.extension() {
        Some(ext) => {
            let stem = input.file_stem().unwrap_or_default().to_string_lossy();
            let mut out = input.to_path_buf();
            out.set_file_name(format!("{}_Mutated.{}", stem, ext.to_string_lossy()));
            out
        }
        None => {
            let mut name = input.as_os_str().to_os_string();
            name.push("_Mutated");
            PathBuf::from(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_mutated_suffix_with_extension() {
        assert_eq!(default_output_path(Path::new("target.exe")), PathBuf::from("target_Mutated.exe"));
    }

    #[test]
    fn derives_mutated_suffix_without_extension() {
        assert_eq!(default_output_path(Path::new("target")), PathBuf::from("target_Mutated"));
    }

    #[test]
    fn preserves_parent_directory() {
        assert_eq!(
            default_output_path(Path::new("/tmp/samples/target.exe")),
            PathBuf::from("/tmp/samples/target_Mutated.exe")
        );
    }
}
