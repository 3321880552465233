//! Typed key/value attribute tables.
//!
//! # Background
//!
//! Every block (and the file root, through the `.` block) carries a small
//! table of named values: run parameters, units, provenance strings.  The
//! table lives next to the data as one ASCII file, `attr-v2`, with one
//! attribute per line:
//!
//! ```text
//!   <key> \t <dtypestr> \t <length> \t <hex-bytes> \n
//! ```
//!
//! The payload is hex-encoded raw bytes in the recorded byte order, so an
//! attribute round-trips exactly no matter which machine wrote it.  Byte
//! strings use the pseudo-dtype `|S1` with `length` counting bytes; they
//! are the only values outside the numeric dtype set.
//!
//! # Scope
//!
//! Attributes are small.  Every mutation rewrites the whole file through
//! a temp file + rename, so readers never observe a torn table.  Keys are
//! unique; setting an existing key replaces its value in place.

use std::fs;
use std::path::{Path, PathBuf};

use crate::array::{Array, Scalar};
use crate::dtype::{Dtype, Kind};
use crate::error::BigFileError;

/// Name of the attribute file inside a block directory.
pub const ATTRS_FILE: &str = "attr-v2";

// ── Attribute values ────────────────────────────────────────────────

/// One attribute value: a flat numeric array or a byte string.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    /// Numeric/bool/complex data with its recorded dtype.
    Value(Array),
    /// A byte string, stored verbatim (`|S1` on disk).
    Text(Vec<u8>),
}

impl Attr {
    pub fn int(v: i64) -> Attr {
        Attr::Value(Array::from_scalars(&[v]))
    }

    pub fn ints(vs: &[i64]) -> Attr {
        Attr::Value(Array::from_scalars(vs))
    }

    pub fn uint(v: u64) -> Attr {
        Attr::Value(Array::from_scalars(&[v]))
    }

    pub fn float(v: f64) -> Attr {
        Attr::Value(Array::from_scalars(&[v]))
    }

    pub fn floats(vs: &[f64]) -> Attr {
        Attr::Value(Array::from_scalars(vs))
    }

    pub fn boolean(v: bool) -> Attr {
        Attr::Value(Array::from_scalars(&[v]))
    }

    pub fn complex(re: f64, im: f64) -> Attr {
        Attr::Value(Array::from_complex_pairs(&[(re, im)]))
    }

    pub fn complexes(vs: &[(f64, f64)]) -> Attr {
        Attr::Value(Array::from_complex_pairs(vs))
    }

    pub fn string(s: &str) -> Attr {
        Attr::Text(s.as_bytes().to_vec())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Attr {
        Attr::Text(b.into())
    }

    /// Number of scalar elements (bytes, for text).
    pub fn len(&self) -> u64 {
        match self {
            Attr::Value(a) => a.len() * a.dtype().nmemb(),
            Attr::Text(b) => b.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_i64(&self) -> Result<i64, BigFileError> {
        Ok(self.as_i64_vec()?.first().copied().unwrap_or(0))
    }

    pub fn as_i64_vec(&self) -> Result<Vec<i64>, BigFileError> {
        let a = self.numeric("integer")?;
        match (a.dtype().kind, a.dtype().width) {
            (Kind::Int, 1) => widen::<i8>(a),
            (Kind::Int, 2) => widen::<i16>(a),
            (Kind::Int, 4) => widen::<i32>(a),
            (Kind::Int, 8) => a.to_vec::<i64>(),
            _ => Err(self.kind_error("integer")),
        }
    }

    pub fn as_u64(&self) -> Result<u64, BigFileError> {
        let a = self.numeric("unsigned integer")?;
        let vs: Vec<u64> = match (a.dtype().kind, a.dtype().width) {
            (Kind::Uint, 1) => uwiden::<u8>(a)?,
            (Kind::Uint, 2) => uwiden::<u16>(a)?,
            (Kind::Uint, 4) => uwiden::<u32>(a)?,
            (Kind::Uint, 8) => a.to_vec::<u64>()?,
            _ => return Err(self.kind_error("unsigned integer")),
        };
        Ok(vs.first().copied().unwrap_or(0))
    }

    pub fn as_f64(&self) -> Result<f64, BigFileError> {
        Ok(self.as_f64_vec()?.first().copied().unwrap_or(0.0))
    }

    pub fn as_f64_vec(&self) -> Result<Vec<f64>, BigFileError> {
        let a = self.numeric("float")?;
        match (a.dtype().kind, a.dtype().width) {
            (Kind::Float, 4) => Ok(a.to_vec::<f32>()?.into_iter().map(f64::from).collect()),
            (Kind::Float, 8) => a.to_vec::<f64>(),
            _ => Err(self.kind_error("float")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, BigFileError> {
        let a = self.numeric("bool")?;
        if a.dtype().kind != Kind::Bool {
            return Err(self.kind_error("bool"));
        }
        Ok(a.to_vec::<bool>()?.first().copied().unwrap_or(false))
    }

    pub fn as_complex(&self) -> Result<(f64, f64), BigFileError> {
        let a = self.numeric("complex")?;
        Ok(a.to_complex_pairs()?.first().copied().unwrap_or((0.0, 0.0)))
    }

    /// View a byte string as UTF-8, trimming a single trailing NUL.
    pub fn as_str(&self) -> Result<&str, BigFileError> {
        let Attr::Text(bytes) = self else {
            return Err(self.kind_error("string"));
        };
        let bytes = bytes.strip_suffix(&[0u8]).unwrap_or(bytes);
        std::str::from_utf8(bytes).map_err(|_| BigFileError::Dtype {
            message: "attribute bytes are not valid UTF-8".into(),
        })
    }

    pub fn as_bytes(&self) -> Result<&[u8], BigFileError> {
        match self {
            Attr::Text(b) => Ok(b),
            Attr::Value(_) => Err(self.kind_error("bytes")),
        }
    }

    fn numeric(&self, wanted: &str) -> Result<&Array, BigFileError> {
        match self {
            Attr::Value(a) => Ok(a),
            Attr::Text(_) => Err(self.kind_error(wanted)),
        }
    }

    fn kind_error(&self, wanted: &str) -> BigFileError {
        let stored = match self {
            Attr::Value(a) => a.dtype().to_string(),
            Attr::Text(_) => "|S1".into(),
        };
        BigFileError::Dtype {
            message: format!("attribute holds '{stored}', not {wanted}"),
        }
    }
}

fn widen<T: Scalar + Into<i64>>(a: &Array) -> Result<Vec<i64>, BigFileError> {
    Ok(a.to_vec::<T>()?.into_iter().map(Into::into).collect())
}

fn uwiden<T: Scalar + Into<u64>>(a: &Array) -> Result<Vec<u64>, BigFileError> {
    Ok(a.to_vec::<T>()?.into_iter().map(Into::into).collect())
}

// ── Attribute table ─────────────────────────────────────────────────

/// The attribute table of one block, backed by its `attr-v2` file.
#[derive(Debug)]
pub struct AttrSet {
    path: PathBuf,
    entries: Vec<(String, Attr)>,
}

impl AttrSet {
    /// Load `<dir>/attr-v2`.  A missing file is an empty table.
    pub fn load(dir: &Path) -> Result<AttrSet, BigFileError> {
        let path = dir.join(ATTRS_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(BigFileError::Io {
                    context: format!("reading attributes {}", path.display()),
                    source: e,
                });
            }
        };

        let mut entries = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            entries.push(parse_line(line, &path)?);
        }
        Ok(AttrSet { path, entries })
    }

    pub fn get(&self, key: &str) -> Result<&Attr, BigFileError> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| BigFileError::NotFound {
                name: format!("attribute '{key}'"),
            })
    }

    /// Insert or replace, then rewrite the table on disk.
    pub fn set(&mut self, key: &str, value: Attr) -> Result<(), BigFileError> {
        self.set_in_memory(key, value)?;
        self.persist()
    }

    /// Insert or replace without touching disk.  The parallel layer uses
    /// this on non-root ranks, where only rank 0 may write the file.
    pub(crate) fn set_in_memory(&mut self, key: &str, value: Attr) -> Result<(), BigFileError> {
        if key.is_empty() || key.contains(['\t', '\n']) {
            return Err(BigFileError::Format {
                path: self.path.display().to_string(),
                message: format!("invalid attribute key '{}'", key.escape_default()),
            });
        }
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
        Ok(())
    }

    /// Remove a key, then rewrite the table on disk.
    pub fn delete(&mut self, key: &str) -> Result<(), BigFileError> {
        self.delete_in_memory(key)?;
        self.persist()
    }

    pub(crate) fn delete_in_memory(&mut self, key: &str) -> Result<(), BigFileError> {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        if self.entries.len() == before {
            return Err(BigFileError::NotFound {
                name: format!("attribute '{key}'"),
            });
        }
        Ok(())
    }

    /// Keys in file order.
    pub fn list(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attr)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the whole table atomically.
    fn persist(&self) -> Result<(), BigFileError> {
        let mut out = String::new();
        for (key, attr) in &self.entries {
            render_line(&mut out, key, attr);
        }
        let tmp = self.path.with_file_name(".attr-v2.tmp");
        fs::write(&tmp, out).map_err(|e| BigFileError::Io {
            context: format!("writing attributes {}", tmp.display()),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| BigFileError::Io {
            context: format!("renaming attributes into {}", self.path.display()),
            source: e,
        })
    }
}

fn render_line(out: &mut String, key: &str, attr: &Attr) {
    match attr {
        Attr::Value(a) => {
            let dtype = a.dtype().resolved().base();
            let length = a.len() * a.dtype().nmemb();
            out.push_str(&format!(
                "{key}\t{dtype}\t{length}\t{}\n",
                hex::encode(a.as_bytes())
            ));
        }
        Attr::Text(bytes) => {
            out.push_str(&format!(
                "{key}\t|S1\t{}\t{}\n",
                bytes.len(),
                hex::encode(bytes)
            ));
        }
    }
}

fn parse_line(line: &str, path: &Path) -> Result<(String, Attr), BigFileError> {
    let bad = |message: String| BigFileError::Format {
        path: path.display().to_string(),
        message,
    };

    let fields: Vec<&str> = line.split('\t').collect();
    let &[key, dtype_str, length_str, hex_str] = fields.as_slice() else {
        return Err(bad(format!(
            "expected 4 tab-separated fields, got {}",
            fields.len()
        )));
    };

    let length: u64 = length_str
        .parse()
        .map_err(|_| bad(format!("invalid length '{length_str}' for key '{key}'")))?;
    let data = hex::decode(hex_str)
        .map_err(|_| bad(format!("invalid hex payload for key '{key}'")))?;

    // Byte strings use the pseudo-dtype S1, outside the numeric set.
    let bare = dtype_str.trim_start_matches(['<', '>', '=', '|']);
    if bare.starts_with('S') {
        if data.len() as u64 != length {
            return Err(bad(format!(
                "key '{key}' declares {length} bytes but carries {}",
                data.len()
            )));
        }
        return Ok((key.to_string(), Attr::Text(data)));
    }

    let dtype = Dtype::parse(dtype_str)?;
    if data.len() as u64 != length * dtype.width as u64 {
        return Err(bad(format!(
            "key '{key}' declares {length} '{dtype}' elements but carries {} bytes",
            data.len()
        )));
    }
    Ok((key.to_string(), Attr::Value(Array::from_bytes(dtype, data)?)))
}
