//! AFL dictionary entries: filtering, hex escaping, and the token file format.
//!
//! Entries are written as `driller_<n>="<escaped>"`, one per line. Every byte
//! outside the allow-list (ASCII letters, digits, space, period) becomes
//! `\xHH`, so a quote or backslash never appears raw inside the value.

use std::fmt;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// AFL's limit on a single dictionary entry, in raw bytes.
pub const MAX_ENTRY_LEN: usize = 128;

/// Name prefix of every written entry.
pub const ENTRY_PREFIX: &str = "driller_";

#[derive(Debug, Error)]
pub enum DictionaryError {
    #[error("Failed to write dictionary {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Illegal dictionary line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Bytes written through unchanged: 0x20, 0x2E, 0x30-0x39, 0x41-0x5A, 0x61-0x7A.
pub fn is_passthrough(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b' ' || b == b'.'
}

/// Escape every byte outside the allow-list as `\xHH` (lowercase hex).
pub fn hex_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for &b in bytes {
        if is_passthrough(b) {
            out.push(b as char);
        } else {
            // Writing into a String cannot fail.
            let _ = write!(out, "\\x{b:02x}");
        }
    }
    out
}

fn from_hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode an entry value: `\xHH` becomes one byte, `\c` becomes `c`.
///
/// Returns `None` on a truncated or non-hex escape.
pub fn unescape(value: &str) -> Option<Vec<u8>> {
    let raw = value.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        match raw.get(i + 1) {
            Some(b'x') | Some(b'X') => {
                let hi = from_hex(*raw.get(i + 2)?)?;
                let lo = from_hex(*raw.get(i + 3)?)?;
                out.push(hi << 4 | lo);
                i += 4;
            }
            Some(c) => {
                out.push(*c);
                i += 2;
            }
            None => return None,
        }
    }
    Some(out)
}

/// Whether a raw string fits in a dictionary entry.
pub fn is_usable(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.len() <= MAX_ENTRY_LEN
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub index: usize,
    pub escaped: String,
}

impl fmt::Display for DictionaryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ENTRY_PREFIX}{}=\"{}\"", self.index, self.escaped)
    }
}

/// Filtered, escaped dictionary ready to be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: Vec<DictionaryEntry>,
}

impl Dictionary {
    /// Keep usable strings in order and index them from 0.
    pub fn from_strings<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut entries = Vec::new();
        for s in strings {
            let bytes = s.as_ref();
            if !is_usable(bytes) {
                log::debug!("dropping {}-byte string", bytes.len());
                continue;
            }
            entries.push(DictionaryEntry { index: entries.len(), escaped: hex_escape(bytes) });
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[DictionaryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full file contents, one newline-terminated line per entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }

    /// Create or truncate `path` and write every entry in one pass.
    pub fn write_to(&self, path: &Path) -> Result<(), DictionaryError> {
        let wrap = |source| DictionaryError::Write { path: path.to_path_buf(), source };
        let file = File::create(path).map_err(wrap)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(self.render().as_bytes()).map_err(wrap)?;
        writer.flush().map_err(wrap)?;
        Ok(())
    }

    /// Read an AFL token file back into raw tokens.
    ///
    /// Blank lines and `#` comments are skipped; any `name=` prefix is
    /// ignored; the value must be double quoted.
    pub fn parse_tokens(text: &str) -> Result<Vec<Vec<u8>>, DictionaryError> {
        let mut tokens = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let illegal =
                |reason: &str| DictionaryError::Parse { line: line_no, reason: reason.into() };
            let open = line.find('"').ok_or_else(|| illegal("missing opening quote"))?;
            if open + 1 >= line.len() || !line.ends_with('"') {
                return Err(illegal("value must end with a quote"));
            }
            let value = &line[open + 1..line.len() - 1];
            if value.is_empty() {
                continue;
            }
            tokens.push(unescape(value).ok_or_else(|| illegal("bad escape sequence"))?);
        }
        Ok(tokens)
    }
}
