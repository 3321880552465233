//! Scalar type descriptors for block elements.
//!
//! # Background
//!
//! Every block stores a flat sequence of fixed-size records, and the only
//! thing the on-disk header knows about a record is its dtype: a scalar
//! kind, a byte width, a byte order, and an optional fixed tuple shape.
//! The descriptor round-trips through a compact string form so it can live
//! in ASCII headers and attribute tables:
//!
//! ```text
//!   <f8        little-endian 8-byte float
//!   >i4        big-endian 4-byte signed integer
//!   |b1        boolean (byte order is irrelevant for one byte)
//!   =c16       native-order complex of two 8-byte floats
//!   <f4(2,)    two little-endian floats per record
//! ```
//!
//! The first character is the byte order (`<` little, `>` big, `=` native,
//! `|` irrelevant), then a kind letter (`i`, `u`, `f`, `c`, `b`), then the
//! scalar width in bytes, then an optional `(d1,d2,...)` shape suffix.
//! A string without a leading order character defaults to native order.
//!
//! # Scope
//!
//! The kind set is closed.  There is no parametric user-defined type, no
//! string scalar, no padding: a record is exactly `width × ∏shape` bytes.
//! Complex scalars count the width of the whole pair, and byte-swapping a
//! complex value swaps each half independently.

use std::fmt;

use crate::error::BigFileError;

// ── Byte order ──────────────────────────────────────────────────────

/// Byte order of a scalar on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first (`<`).
    Little,
    /// Most significant byte first (`>`).
    Big,
    /// Whatever the running machine uses (`=`).  Resolved to `Little` or
    /// `Big` before anything is written to disk.
    Native,
    /// Single-byte scalars have no byte order (`|`).
    Irrelevant,
}

impl Endian {
    /// The machine's own byte order.
    pub fn native() -> Endian {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    fn symbol(self) -> char {
        match self {
            Endian::Little => '<',
            Endian::Big => '>',
            Endian::Native => '=',
            Endian::Irrelevant => '|',
        }
    }
}

// ── Scalar kind ─────────────────────────────────────────────────────

/// Scalar kind letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Int,
    Uint,
    Float,
    Complex,
    Bool,
}

impl Kind {
    fn letter(self) -> char {
        match self {
            Kind::Int => 'i',
            Kind::Uint => 'u',
            Kind::Float => 'f',
            Kind::Complex => 'c',
            Kind::Bool => 'b',
        }
    }

    /// Widths that are valid for this kind, in bytes.
    fn valid_widths(self) -> &'static [u32] {
        match self {
            Kind::Int | Kind::Uint => &[1, 2, 4, 8],
            Kind::Float => &[4, 8],
            Kind::Complex => &[8, 16],
            Kind::Bool => &[1],
        }
    }
}

// ── Dtype ───────────────────────────────────────────────────────────

/// A full element descriptor: byte order, kind, scalar width, and a
/// possibly-empty fixed shape per record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dtype {
    pub endian: Endian,
    pub kind: Kind,
    pub width: u32,
    pub shape: Vec<u32>,
}

impl Dtype {
    pub fn new(endian: Endian, kind: Kind, width: u32) -> Dtype {
        Dtype {
            endian,
            kind,
            width,
            shape: Vec::new(),
        }
    }

    /// Parse a dtype string like `<f8`, `>i4`, `|b1` or `<f4(2,)`.
    pub fn parse(s: &str) -> Result<Dtype, BigFileError> {
        let bad = |message: String| BigFileError::Dtype { message };

        let mut chars = s.chars();
        let Some(first) = chars.next() else {
            return Err(bad("empty dtype string".into()));
        };

        let (endian, rest) = match first {
            '<' => (Endian::Little, chars.as_str()),
            '>' => (Endian::Big, chars.as_str()),
            '=' => (Endian::Native, chars.as_str()),
            '|' => (Endian::Irrelevant, chars.as_str()),
            _ => (Endian::Native, s),
        };

        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('i') => Kind::Int,
            Some('u') => Kind::Uint,
            Some('f') => Kind::Float,
            Some('c') => Kind::Complex,
            Some('b') | Some('?') => Kind::Bool,
            Some(c) => return Err(bad(format!("unknown dtype kind '{c}' in '{s}'"))),
            None => return Err(bad(format!("dtype '{s}' is missing a kind letter"))),
        };
        let rest = chars.as_str();

        let (width_str, shape_str) = match rest.find('(') {
            Some(i) => (&rest[..i], Some(&rest[i..])),
            None => (rest, None),
        };

        let width: u32 = width_str
            .parse()
            .map_err(|_| bad(format!("invalid width '{width_str}' in dtype '{s}'")))?;
        if width == 0 {
            return Err(bad(format!("zero width in dtype '{s}'")));
        }
        if !kind.valid_widths().contains(&width) {
            return Err(bad(format!(
                "width {width} is not valid for kind '{}' in dtype '{s}'",
                kind.letter()
            )));
        }
        if endian == Endian::Irrelevant && width != 1 {
            return Err(bad(format!(
                "'|' byte order is only valid for 1-byte scalars, got '{s}'"
            )));
        }

        let shape = match shape_str {
            None => Vec::new(),
            Some(t) => parse_shape(t).ok_or_else(|| bad(format!("invalid shape in dtype '{s}'")))?,
        };

        Ok(Dtype {
            endian,
            kind,
            width,
            shape,
        })
    }

    /// Records per element: the product of the shape dims, 1 when empty.
    pub fn nmemb(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    /// Size of one full record in bytes.
    pub fn itemsize(&self) -> u64 {
        self.width as u64 * self.nmemb()
    }

    /// The scalar base descriptor, shape stripped.
    pub fn base(&self) -> Dtype {
        Dtype::new(self.endian, self.kind, self.width)
    }

    /// Same descriptor carrying the given shape.
    pub fn with_shape(&self, shape: &[u32]) -> Dtype {
        Dtype {
            shape: shape.to_vec(),
            ..self.base()
        }
    }

    /// Resolve `Native` to the machine's order, and single-byte scalars to
    /// `Irrelevant`.  This is the form written to disk.
    pub fn resolved(&self) -> Dtype {
        let endian = if self.width == 1 {
            Endian::Irrelevant
        } else if self.endian == Endian::Native {
            Endian::native()
        } else {
            self.endian
        };
        Dtype {
            endian,
            ..self.clone()
        }
    }

    /// Two dtypes hold interchangeable values iff kind, width and element
    /// count agree; byte order may differ.  The on-disk form only records
    /// the flattened element count, so `(4,)` and `(2,2)` compare equal.
    pub fn value_compatible(&self, other: &Dtype) -> bool {
        self.kind == other.kind && self.width == other.width && self.nmemb() == other.nmemb()
    }

    /// Whether bytes in this dtype need swapping to be read natively.
    pub fn needs_swap(&self) -> bool {
        self.swap_unit() > 1 && self.resolved().endian != Endian::native()
    }

    /// The width of one swap unit.  Complex values swap each component of
    /// the pair separately; everything else swaps the whole scalar.
    pub fn swap_unit(&self) -> usize {
        match self.kind {
            Kind::Complex => self.width as usize / 2,
            _ => self.width as usize,
        }
    }

    /// Reverse the bytes of every swap unit in `buf` in place.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is not a whole number of swap units.
    pub fn byte_swap(&self, buf: &mut [u8]) {
        let unit = self.swap_unit();
        if unit <= 1 {
            return;
        }
        assert!(buf.len() % unit == 0, "buffer is not a whole number of scalars");
        for chunk in buf.chunks_exact_mut(unit) {
            chunk.reverse();
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.endian.symbol(), self.kind.letter(), self.width)?;
        if !self.shape.is_empty() {
            write!(f, "(")?;
            for d in &self.shape {
                write!(f, "{d},")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Parse a `(d1,d2,...)` shape suffix.  A trailing comma is allowed, the
/// dims must all be positive.
fn parse_shape(s: &str) -> Option<Vec<u32>> {
    let inner = s.strip_prefix('(')?.strip_suffix(')')?;
    let mut shape = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let dim: u32 = part.parse().ok()?;
        if dim == 0 {
            return None;
        }
        shape.push(dim);
    }
    Some(shape)
}
