//! Read-only multi-column views.
//!
//! `BigData` composes a set of equally-sized blocks into one logical
//! table: slice a record range across every column at once, pull a
//! single column, or narrow the view to a subset of columns.  The view
//! never copies until a slice is read.

use crate::array::Array;
use crate::block::Block;
use crate::dtype::Dtype;
use crate::error::BigFileError;
use crate::file::File;

/// A read-only table over equally-sized blocks of one file.
#[derive(Debug)]
pub struct BigData<'f> {
    file: &'f File,
    names: Vec<String>,
    blocks: Vec<Block>,
    size: u64,
}

impl<'f> BigData<'f> {
    /// View the given columns, or every block of the file when `names`
    /// is `None`.  All selected blocks must have the same record count.
    pub fn new(file: &'f File, names: Option<&[&str]>) -> Result<BigData<'f>, BigFileError> {
        let names: Vec<String> = match names {
            Some(ns) => ns.iter().map(|s| s.to_string()).collect(),
            None => file.blocks()?,
        };

        let mut blocks = Vec::with_capacity(names.len());
        let mut size: Option<u64> = None;
        for name in &names {
            let block = file.open_block(name)?;
            match size {
                None => size = Some(block.size()),
                Some(s) if s != block.size() => {
                    return Err(BigFileError::Format {
                        path: name.clone(),
                        message: format!(
                            "column length {} is inconsistent with {s}",
                            block.size()
                        ),
                    });
                }
                Some(_) => {}
            }
            blocks.push(block);
        }

        Ok(BigData {
            file,
            names,
            blocks,
            size: size.unwrap_or(0),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Records per column.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The dtype of one column.
    pub fn dtype(&self, name: &str) -> Result<Dtype, BigFileError> {
        Ok(self.col(name)?.dtype())
    }

    /// Narrow the view to a subset of columns.
    pub fn select(&self, names: &[&str]) -> Result<BigData<'f>, BigFileError> {
        for name in names {
            if !self.names.iter().any(|n| n == name) {
                return Err(BigFileError::NotFound {
                    name: name.to_string(),
                });
            }
        }
        BigData::new(self.file, Some(names))
    }

    /// Borrow one column's block.
    pub fn col(&self, name: &str) -> Result<&Block, BigFileError> {
        self.position(name).map(|i| &self.blocks[i])
    }

    /// Read the records `[start, end)` of one column.
    pub fn col_slice(&mut self, name: &str, start: u64, end: u64) -> Result<Array, BigFileError> {
        let i = self.position(name)?;
        read_range(&mut self.blocks[i], start, end)
    }

    /// Read the records `[start, end)` of every column, field-aligned.
    pub fn slice(&mut self, start: u64, end: u64) -> Result<Table, BigFileError> {
        let mut fields = Vec::with_capacity(self.blocks.len());
        for (name, block) in self.names.iter().zip(&mut self.blocks) {
            fields.push((name.clone(), read_range(block, start, end)?));
        }
        Ok(Table {
            fields,
            len: end.saturating_sub(start),
        })
    }

    /// Read one record of every column.
    pub fn row(&mut self, index: u64) -> Result<Table, BigFileError> {
        self.slice(index, index + 1)
    }

    fn position(&self, name: &str) -> Result<usize, BigFileError> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| BigFileError::NotFound {
                name: name.to_string(),
            })
    }
}

fn read_range(block: &mut Block, start: u64, end: u64) -> Result<Array, BigFileError> {
    if end < start {
        return Err(BigFileError::Bounds {
            message: format!("slice [{start}, {end}) is reversed"),
        });
    }
    block.read(start, end - start)
}

// ── Table ───────────────────────────────────────────────────────────

/// The result of slicing a `BigData`: one equally-long array per column.
#[derive(Debug)]
pub struct Table {
    fields: Vec<(String, Array)>,
    len: u64,
}

impl Table {
    /// Rows in the table.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&Array> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array)> {
        self.fields.iter().map(|(n, a)| (n.as_str(), a))
    }
}
