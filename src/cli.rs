//! The `bigfile` inspection CLI.
//!
//! A thin read-only surface over the library: list blocks, dump headers
//! and attribute tables, print records as text.  Nothing here mutates a
//! file.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::array::Array;
use crate::attrs::Attr;
use crate::dtype::Kind;
use crate::error::BigFileError;
use crate::file::File;

#[derive(Parser, Debug)]
#[command(name = "bigfile", about = "Inspect bigfile columnar containers")]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the blocks of a file
    Ls {
        /// File directory
        path: PathBuf,
    },

    /// Print a block's layout: dtype, size, striping, checksums
    Header {
        path: PathBuf,
        block: String,
    },

    /// Print a block's attribute table
    Attrs {
        path: PathBuf,
        block: String,
    },

    /// Print records as text
    Cat {
        path: PathBuf,
        block: String,

        /// First record to print
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Number of records to print (defaults to the rest of the block)
        #[arg(long)]
        count: Option<u64>,
    },
}

pub fn ls(path: &Path) -> Result<(), BigFileError> {
    let file = File::open(path)?;
    for name in file.list_blocks()? {
        let block = file.open_block(&name)?;
        println!("{name}\t{}\t{}\t{}", block.dtype(), block.size(), block.nfile());
    }
    Ok(())
}

pub fn header(path: &Path, block: &str) -> Result<(), BigFileError> {
    let file = File::open(path)?;
    let block = file.open_block(block)?;
    println!("dtype: {}", block.dtype());
    println!("size:  {}", block.size());
    println!("nfile: {}", block.nfile());
    for (count, sum) in block.counts().iter().zip(block.checksums()) {
        println!("  {count} : {sum}");
    }
    Ok(())
}

pub fn attrs(path: &Path, block: &str) -> Result<(), BigFileError> {
    let file = File::open(path)?;
    let block = file.open_block(block)?;
    for (key, attr) in block.attrs().iter() {
        println!("{key} = {}", format_attr(attr)?);
    }
    Ok(())
}

pub fn cat(
    path: &Path,
    block: &str,
    start: u64,
    count: Option<u64>,
) -> Result<(), BigFileError> {
    let file = File::open(path)?;
    let mut block = file.open_block(block)?;
    let count = count.unwrap_or_else(|| block.size().saturating_sub(start));
    let data = block.read(start, count)?;
    for record in format_records(&data)? {
        println!("{record}");
    }
    Ok(())
}

fn format_attr(attr: &Attr) -> Result<String, BigFileError> {
    match attr {
        Attr::Text(_) => Ok(format!("{:?}", attr.as_str().unwrap_or("<binary>"))),
        Attr::Value(a) => Ok(format_records(a)?.join(", ")),
    }
}

/// Render each record on its own line, scalars space-separated.
fn format_records(a: &Array) -> Result<Vec<String>, BigFileError> {
    let dtype = a.dtype();
    let scalars: Vec<String> = match (dtype.kind, dtype.width) {
        (Kind::Int, 1) => a.to_vec::<i8>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Int, 2) => a.to_vec::<i16>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Int, 4) => a.to_vec::<i32>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Int, 8) => a.to_vec::<i64>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Uint, 1) => a.to_vec::<u8>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Uint, 2) => a.to_vec::<u16>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Uint, 4) => a.to_vec::<u32>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Uint, 8) => a.to_vec::<u64>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Float, 4) => a.to_vec::<f32>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Float, 8) => a.to_vec::<f64>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Bool, _) => a.to_vec::<bool>()?.iter().map(|v| v.to_string()).collect(),
        (Kind::Complex, _) => a
            .to_complex_pairs()?
            .iter()
            .map(|(re, im)| format!("{re}{im:+}j"))
            .collect(),
        (kind, width) => {
            return Err(BigFileError::Dtype {
                message: format!("cannot format kind {kind:?} width {width}"),
            });
        }
    };

    let nmemb = dtype.nmemb() as usize;
    if nmemb <= 1 {
        return Ok(scalars);
    }
    Ok(scalars
        .chunks(nmemb)
        .map(|record| record.join(" "))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_format_one_per_line() {
        let a = Array::from_scalars(&[1.5f64, -2.0]);
        assert_eq!(format_records(&a).unwrap(), vec!["1.5", "-2"]);
    }

    #[test]
    fn shaped_records_join_scalars() {
        let a = Array::from_scalars_shaped(&[1i32, 2, 3, 4], &[2]).unwrap();
        assert_eq!(format_records(&a).unwrap(), vec!["1 2", "3 4"]);
    }

    #[test]
    fn complex_records_format_as_pairs() {
        let a = Array::from_complex_pairs(&[(128.0, 128.0), (1.0, -2.0)]);
        assert_eq!(format_records(&a).unwrap(), vec!["128+128j", "1-2j"]);
    }

    #[test]
    fn text_attrs_format_quoted() {
        assert_eq!(format_attr(&Attr::string("abc")).unwrap(), "\"abc\"");
        assert_eq!(format_attr(&Attr::int(30)).unwrap(), "30");
    }
}
