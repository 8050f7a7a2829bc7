//! Instruction corpus loading and UID bookkeeping.
//!
//! The corpus is a `;`-separated text file whose rows carry one base64
//! encoded x86-64 instruction each, plus the metadata strings we pass
//! through to the output CSVs. Every row receives a UID that embeds the
//! last two bytes of the file's SHA-256, so UIDs from one corpus file are
//! rejected when resolved against another.

use std::fmt::Write as _;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Expected first line of a corpus file.
pub const CORPUS_HEADER: &str =
    "byte_representation;assembly_code;category;extension;isa_set";

/// Maximum number of rows a corpus may carry; the row index lives in the
/// low 16 bits of a UID.
pub const MAX_CORPUS_ROWS: usize = 65_535;

/// Assembly names that are only ever valid as reset sequences, and which
/// are executed exactly once regardless of the configured repetition
/// count.
const SLEEP_SENTINELS: [&str; 3] = ["busy-sleep", "short-busy-sleep", "sleep-syscall"];

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("couldn't read corpus file: {0}")]
    Io(#[from] std::io::Error),

    #[error("mismatch in header of corpus file (got {0:?})")]
    BadHeader(String),

    #[error("line {line}: expected 5 fields, got {fields}")]
    BadRow { line: usize, fields: usize },

    #[error("line {line}: invalid base64 in byte_representation")]
    BadBase64 { line: usize },

    #[error("corpus has more than {MAX_CORPUS_ROWS} rows")]
    TooManyRows,

    #[error("instruction index {0} out of range")]
    BadIndex(usize),

    #[error("UID tag {got:04x} was not produced by this corpus (expected {expected:04x})")]
    CorpusMismatch { expected: u16, got: u16 },
}

/// One corpus row: the exact machine encoding to splice into a harness,
/// plus reporting metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub uid: u64,
    pub bytes: Vec<u8>,
    pub assembly: String,
    pub category: String,
    pub extension: String,
    pub isa_set: String,
}

impl Instruction {
    /// True for the three reserved sleep names. Sleeps are permitted only
    /// as reset sequences and run once per harness.
    pub fn is_sleep(&self) -> bool {
        SLEEP_SENTINELS.iter().any(|s| self.assembly == *s)
    }

    /// The five-field CSV fragment used in the pairs output
    /// (`uid;assembly;category;extension;isa_set`, UID in lowercase hex).
    pub fn csv_fields(&self) -> String {
        let mut s = String::new();
        let _ = write!(
            s,
            "{:x};{};{};{};{}",
            self.uid, self.assembly, self.category, self.extension, self.isa_set
        );
        s
    }

    /// The corpus-schema line for this instruction (used when emitting a
    /// filtered corpus subset).
    pub fn corpus_line(&self) -> String {
        format!(
            "{};{};{};{};{}",
            BASE64.encode(&self.bytes),
            self.assembly,
            self.category,
            self.extension,
            self.isa_set
        )
    }
}

/// The loaded corpus: all instructions plus the file tag baked into their
/// UIDs.
pub struct Corpus {
    tag: u16,
    entries: Vec<Instruction>,
}

impl Corpus {
    /// Parse a corpus file. Any malformed header or row is an error; the
    /// caller is expected to abort, since every downstream result is
    /// tagged with UIDs derived from this file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CorpusError> {
        let raw = std::fs::read(path.as_ref())?;
        let tag = Self::file_tag(&raw);

        let text = String::from_utf8_lossy(&raw);
        let mut lines = text.lines();
        match lines.next() {
            Some(h) if h == CORPUS_HEADER => {}
            other => return Err(CorpusError::BadHeader(other.unwrap_or("").to_string())),
        }

        let mut entries = Vec::new();
        for (idx, line) in lines.enumerate() {
            // Line 1 is the header; rows are reported 1-based after it.
            let line_no = idx + 2;
            let fields: Vec<&str> = line.split(';').collect();
            if fields.len() != 5 {
                return Err(CorpusError::BadRow { line: line_no, fields: fields.len() });
            }
            if entries.len() >= MAX_CORPUS_ROWS {
                return Err(CorpusError::TooManyRows);
            }
            let bytes = BASE64
                .decode(fields[0])
                .map_err(|_| CorpusError::BadBase64 { line: line_no })?;
            entries.push(Instruction {
                uid: (tag as u64) << 16 | idx as u64,
                bytes,
                assembly: fields[1].to_string(),
                category: fields[2].to_string(),
                extension: fields[3].to_string(),
                isa_set: fields[4].to_string(),
            });
        }
        log::debug!("loaded {} instructions (corpus tag {:04x})", entries.len(), tag);
        Ok(Self { tag, entries })
    }

    /// Corpus tag: the last two bytes of the file's SHA-256, read as an
    /// unsigned 16-bit value.
    fn file_tag(raw: &[u8]) -> u16 {
        let digest = Sha256::digest(raw);
        u16::from_be_bytes([digest[30], digest[31]])
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.entries.iter()
    }

    pub fn by_index(&self, idx: usize) -> Result<&Instruction, CorpusError> {
        if idx >= self.entries.len() {
            return Err(CorpusError::BadIndex(idx));
        }
        Ok(&self.entries[idx])
    }

    /// Resolve a UID produced by an earlier run against this corpus. The
    /// embedded tag must match the loaded file.
    pub fn by_uid(&self, uid: u64) -> Result<&Instruction, CorpusError> {
        let got = (uid >> 16) as u16;
        if got != self.tag {
            return Err(CorpusError::CorpusMismatch { expected: self.tag, got });
        }
        self.by_index((uid & 0xffff) as usize)
    }

    pub fn random<R: Rng>(&self, rng: &mut R) -> &Instruction {
        let idx = rng.gen_range(0..self.entries.len());
        &self.entries[idx]
    }
}
