//! Block header serialization.
//!
//! Every block directory carries a small ASCII file named `header` that
//! fully describes the block's layout:
//!
//! ```text
//!   DTYPE: <f8          scalar dtype of one element
//!   NMEMB: 1            scalars per record (the flattened shape)
//!   Nfile: 2            number of physical data files
//!   64 : 1034           per-file record count and checksum, Nfile lines
//!   64 : 0
//! ```
//!
//! The per-file checksum is the mod-2^64 sum of every raw data byte ever
//! written to that file, accumulated across the lifetime of all writers.
//! Readers never verify it; writers must keep it up to date.  The header
//! is rewritten atomically (temp file + rename) so a crashed writer can
//! never leave a half-written header behind.

use std::fs;
use std::path::Path;

use crate::dtype::Dtype;
use crate::error::BigFileError;

/// Name of the header file inside a block directory.
pub const HEADER_FILE: &str = "header";

/// Parsed contents of a block's `header` file.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Scalar base dtype of one element (shape lives in `nmemb`).
    pub dtype: Dtype,
    /// Scalars per record.
    pub nmemb: u64,
    /// Record count of each physical file.
    pub counts: Vec<u64>,
    /// Byte-sum checksum of each physical file.
    pub checksums: Vec<u64>,
}

impl Header {
    /// Total logical record count.
    pub fn size(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn nfile(&self) -> usize {
        self.counts.len()
    }

    /// The element dtype as callers see it: base dtype with the record
    /// shape re-attached when a record holds more than one scalar.
    pub fn element_dtype(&self) -> Dtype {
        if self.nmemb == 1 {
            self.dtype.clone()
        } else {
            self.dtype.with_shape(&[self.nmemb as u32])
        }
    }

    /// Parse the text of a header file.  `path` only labels errors.
    pub fn parse(text: &str, path: &Path) -> Result<Header, BigFileError> {
        let bad = |message: String| BigFileError::Format {
            path: path.display().to_string(),
            message,
        };

        let mut lines = text.lines();
        let dtype_str = keyed_line(lines.next(), "DTYPE")
            .ok_or_else(|| bad("missing DTYPE line".into()))?;
        let dtype = Dtype::parse(dtype_str)?;

        let nmemb_str = keyed_line(lines.next(), "NMEMB")
            .ok_or_else(|| bad("missing NMEMB line".into()))?;
        let nmemb: u64 = nmemb_str
            .parse()
            .map_err(|_| bad(format!("invalid NMEMB '{nmemb_str}'")))?;
        if nmemb == 0 {
            return Err(bad("NMEMB must be positive".into()));
        }

        let nfile_str = keyed_line(lines.next(), "Nfile")
            .ok_or_else(|| bad("missing Nfile line".into()))?;
        let nfile: usize = nfile_str
            .parse()
            .map_err(|_| bad(format!("invalid Nfile '{nfile_str}'")))?;

        let mut counts = Vec::with_capacity(nfile);
        let mut checksums = Vec::with_capacity(nfile);
        for i in 0..nfile {
            let line = lines
                .next()
                .ok_or_else(|| bad(format!("expected {nfile} count lines, got {i}")))?;
            let (count_str, sum_str) = line
                .split_once(':')
                .ok_or_else(|| bad(format!("count line '{line}' is missing ':'")))?;
            let count: u64 = count_str
                .trim()
                .parse()
                .map_err(|_| bad(format!("invalid record count '{}'", count_str.trim())))?;
            let sum: u64 = sum_str
                .trim()
                .parse()
                .map_err(|_| bad(format!("invalid checksum '{}'", sum_str.trim())))?;
            counts.push(count);
            checksums.push(sum);
        }

        Ok(Header {
            dtype,
            nmemb,
            counts,
            checksums,
        })
    }

    /// Render the canonical header text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("DTYPE: {}\n", self.dtype));
        out.push_str(&format!("NMEMB: {}\n", self.nmemb));
        out.push_str(&format!("Nfile: {}\n", self.nfile()));
        for (count, sum) in self.counts.iter().zip(&self.checksums) {
            out.push_str(&format!("{count} : {sum}\n"));
        }
        out
    }

    /// Read and parse `<dir>/header`.
    pub fn load(dir: &Path) -> Result<Header, BigFileError> {
        let path = dir.join(HEADER_FILE);
        let text = fs::read_to_string(&path).map_err(|e| BigFileError::Io {
            context: format!("reading header {}", path.display()),
            source: e,
        })?;
        Header::parse(&text, &path)
    }

    /// Atomically rewrite `<dir>/header` via a temp file and rename.
    pub fn store(&self, dir: &Path) -> Result<(), BigFileError> {
        let path = dir.join(HEADER_FILE);
        let tmp = dir.join(".header.tmp");
        fs::write(&tmp, self.render()).map_err(|e| BigFileError::Io {
            context: format!("writing header {}", tmp.display()),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| BigFileError::Io {
            context: format!("renaming header into {}", path.display()),
            source: e,
        })
    }
}

/// Extract the value of a `KEY: value` line, or None if the key is wrong.
fn keyed_line<'a>(line: Option<&'a str>, key: &str) -> Option<&'a str> {
    let (k, v) = line?.split_once(':')?;
    if k.trim() != key {
        return None;
    }
    Some(v.trim())
}
