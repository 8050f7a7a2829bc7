//! Human-readable rendering of Mode-B side files.
//!
//! A Mode-B run leaves one file per qualifying trigger, named by the
//! base64 of the trigger bytes, each line `<b64 reset>;<delta>`. This
//! pass disassembles both and writes one report per trigger into a fresh
//! directory.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use itertools::Itertools;

const DELIMITER: &str =
    "=======================================================================";
const DELIMITER2: &str =
    "-----------------------------------------------------------------------";

/// Disassemble an opaque byte sequence. Returns one formatted line per
/// instruction, or None when the bytes don't decode.
fn disassemble(bytes: &[u8]) -> Option<Vec<String>> {
    let mut decoder = Decoder::with_ip(64, bytes, 0x1000, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut lines = Vec::new();
    let mut instr = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            return None;
        }
        let mut line = String::new();
        formatter.format(&instr, &mut line);
        lines.push(line);
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines)
    }
}

/// Render every side file in `raw_dir` into `formatted_dir`.
///
/// Report files are named `<mnemonic>_<operands>---<unique idx>`; when
/// the trigger bytes don't disassemble the original name is kept with a
/// `disasm_err_` prefix.
pub fn format_trigger_pairs(raw_dir: &Path, formatted_dir: &Path) -> std::io::Result<()> {
    if formatted_dir.exists() {
        std::fs::remove_dir_all(formatted_dir)?;
    }
    std::fs::create_dir_all(formatted_dir)?;

    // Directory iteration order is unspecified; sort so report indices
    // are stable across runs.
    let entries = std::fs::read_dir(raw_dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .sorted_by_key(|e| e.file_name());

    let mut unique_idx = 0usize;
    for entry in entries {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let trigger_bytes = BASE64.decode(&file_name).unwrap_or_default();
        let trigger_disas = disassemble(&trigger_bytes);

        let mut report_name = match &trigger_disas {
            Some(lines) => lines[0].replace(' ', "_").replace(',', ""),
            None => {
                log::warn!("couldn't disassemble filename {}", file_name);
                format!("disasm_err_{}", file_name)
            }
        };
        report_name.push_str("---");
        report_name.push_str(&unique_idx.to_string());
        unique_idx += 1;

        let mut report = BufWriter::new(File::create(formatted_dir.join(&report_name))?);
        writeln!(report, "{}", DELIMITER)?;
        writeln!(
            report,
            "=================== trigger/measurement instruction ==================="
        )?;
        writeln!(report, "{}", DELIMITER)?;
        match &trigger_disas {
            Some(lines) => {
                for line in lines {
                    writeln!(report, "{}", line)?;
                }
            }
            None => writeln!(report, "DISASM ERR (inst: {})", file_name)?,
        }
        writeln!(report, "{}", DELIMITER)?;
        writeln!(
            report,
            "========================== reset instructions ========================="
        )?;
        writeln!(report, "{}", DELIMITER)?;

        let reader = BufReader::new(File::open(entry.path())?);
        for line in reader.lines() {
            let line = line?;
            let Some((reset_b64, timing)) = line.split_once(';') else {
                continue;
            };
            let reset_bytes = BASE64.decode(reset_b64).unwrap_or_default();
            match disassemble(&reset_bytes) {
                Some(lines) => {
                    for l in lines {
                        writeln!(report, "{}", l)?;
                    }
                }
                None => {
                    log::warn!("couldn't disassemble {}", reset_b64);
                    writeln!(report, "DISASM ERR (inst: {})", reset_b64)?;
                }
            }
            writeln!(report, "TIMING: {}", timing)?;
            writeln!(report, "{}", DELIMITER2)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disassembles_simple_sequences() {
        // nop
        let lines = disassemble(&[0x90]).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("nop"));

        // clflush [rdi]
        let lines = disassemble(&[0x0f, 0xae, 0x3f]).unwrap();
        assert!(lines[0].to_lowercase().contains("clflush"));
    }

    #[test]
    fn rejects_undecodable_bytes() {
        assert!(disassemble(&[]).is_none());
        // truncated two-byte opcode
        assert!(disassemble(&[0x0f]).is_none());
    }

    #[test]
    fn formats_a_side_dir() {
        let raw = tempfile::tempdir().unwrap();
        let formatted = tempfile::tempdir().unwrap();
        let formatted_path = formatted.path().join("out");

        // one side file for trigger `nop` with a clflush reset
        let name = BASE64.encode([0x90u8]);
        std::fs::write(
            raw.path().join(&name),
            format!("{};123\n", BASE64.encode([0x0fu8, 0xae, 0x3f])),
        )
        .unwrap();

        format_trigger_pairs(raw.path(), &formatted_path).unwrap();
        let entries: Vec<_> = std::fs::read_dir(&formatted_path).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let report_name = entries[0].as_ref().unwrap().file_name();
        let report_name = report_name.to_string_lossy();
        assert!(report_name.starts_with("nop"));
        assert!(report_name.ends_with("---0"));
        let content =
            std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("TIMING: 123"));
        assert!(content.to_lowercase().contains("clflush"));
    }
}
