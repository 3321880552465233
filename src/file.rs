//! File handles: a directory of blocks.
//!
//! A "file" is nothing more than a directory tree.  Any subdirectory
//! carrying a `header` file is a block; blocks nest, and their names are
//! the `/`-joined path components relative to the root.  The root
//! directory itself may be a block — the conventional zero-record block
//! `.` that carries file-level attributes.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

use crate::block::{Block, stripe_file_name};
use crate::dtype::Dtype;
use crate::error::BigFileError;
use crate::header::{HEADER_FILE, Header};
use crate::stripe::Striping;

/// Handle on one file (a directory of blocks).
#[derive(Debug)]
pub struct File {
    root: PathBuf,
    closed: Cell<bool>,
    // cached block list, refreshed on demand
    blocks: RefCell<Option<Vec<String>>>,
}

impl File {
    /// Create the directory (and parents) and return a handle on it.
    pub fn create(path: impl AsRef<Path>) -> Result<File, BigFileError> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| BigFileError::Io {
            context: format!("creating file directory {}", root.display()),
            source: e,
        })?;
        tracing::info!(path = %root.display(), "created file");
        Ok(File::handle(root))
    }

    /// Open an existing file directory.
    pub fn open(path: impl AsRef<Path>) -> Result<File, BigFileError> {
        let root = path.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(BigFileError::NotFound {
                name: root.display().to_string(),
            });
        }
        Ok(File::handle(root))
    }

    fn handle(root: PathBuf) -> File {
        File {
            root,
            closed: Cell::new(false),
            blocks: RefCell::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn check_open(&self) -> Result<(), BigFileError> {
        if self.closed.get() {
            return Err(BigFileError::Closed);
        }
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> Result<(), BigFileError> {
        self.check_open()
    }

    /// Walk the tree and return every block name, sorted, the root block
    /// `.` first when present.  Refreshes the cached list.
    pub fn list_blocks(&self) -> Result<Vec<String>, BigFileError> {
        self.check_open()?;
        let mut found = Vec::new();
        walk(&self.root, "", &mut found)?;
        found.sort();
        let mut out = Vec::with_capacity(found.len() + 1);
        if self.root.join(HEADER_FILE).is_file() {
            out.push(".".to_string());
        }
        out.extend(found);
        tracing::debug!(path = %self.root.display(), blocks = out.len(), "listed blocks");
        *self.blocks.borrow_mut() = Some(out.clone());
        Ok(out)
    }

    /// The cached block list, computed on first use.
    pub fn blocks(&self) -> Result<Vec<String>, BigFileError> {
        self.check_open()?;
        if let Some(cached) = self.blocks.borrow().as_ref() {
            return Ok(cached.clone());
        }
        self.list_blocks()
    }

    /// Create a block striped over `nfile` physical files, records spread
    /// as evenly as possible.
    pub fn create_block(
        &self,
        name: &str,
        dtype: &Dtype,
        size: u64,
        nfile: usize,
    ) -> Result<Block, BigFileError> {
        let counts = Striping::plan(size, nfile)?;
        self.create_block_with_counts(name, dtype, &counts)
    }

    /// Create a block with an explicit per-file record count vector.
    pub fn create_block_with_counts(
        &self,
        name: &str,
        dtype: &Dtype,
        counts: &[u64],
    ) -> Result<Block, BigFileError> {
        self.check_open()?;
        validate_block_name(name)?;

        let dtype = dtype.resolved();
        let header = Header {
            dtype: dtype.base(),
            nmemb: dtype.nmemb(),
            counts: counts.to_vec(),
            checksums: vec![0; counts.len()],
        };

        let dir = self.block_dir(name);
        if dir.join(HEADER_FILE).is_file() {
            let existing = Header::load(&dir)?;
            let conflicting = existing.dtype != header.dtype
                || existing.nmemb != header.nmemb
                || existing.counts != header.counts;
            if conflicting {
                return Err(BigFileError::Exists {
                    name: name.to_string(),
                });
            }
        }

        fs::create_dir_all(&dir).map_err(|e| BigFileError::Io {
            context: format!("creating block directory {}", dir.display()),
            source: e,
        })?;
        header.store(&dir)?;

        let itemsize = header.dtype.width as u64 * header.nmemb;
        for (i, &count) in counts.iter().enumerate() {
            let path = dir.join(stripe_file_name(i));
            let f = fs::File::create(&path).map_err(|e| BigFileError::Io {
                context: format!("creating data file {}", path.display()),
                source: e,
            })?;
            // sparse allocation; readers of untouched ranges see zeros
            f.set_len(count * itemsize).map_err(|e| BigFileError::Io {
                context: format!("sizing data file {}", path.display()),
                source: e,
            })?;
        }

        tracing::info!(
            block = name,
            dtype = %dtype,
            size = header.size(),
            nfile = counts.len(),
            "created block"
        );
        *self.blocks.borrow_mut() = None;
        Block::from_parts(dir, name.to_string(), header, true)
    }

    /// Create a zero-record block that only carries attributes, like the
    /// conventional root block `.`.
    pub fn create_attr_block(&self, name: &str) -> Result<Block, BigFileError> {
        self.create_block(name, &Dtype::parse("|u1")?, 0, 0)
    }

    /// Open an existing block.
    pub fn open_block(&self, name: &str) -> Result<Block, BigFileError> {
        self.check_open()?;
        validate_block_name(name)?;
        let dir = self.block_dir(name);
        if !dir.join(HEADER_FILE).is_file() {
            return Err(BigFileError::NotFound {
                name: name.to_string(),
            });
        }
        let header = Header::load(&dir)?;
        tracing::debug!(block = name, size = header.size(), "opened block");
        Block::from_parts(dir, name.to_string(), header, false)
    }

    /// A handle on the file rooted at `<path>/<prefix>`.
    pub fn subfile(&self, prefix: &str) -> Result<File, BigFileError> {
        self.check_open()?;
        let prefix = prefix.trim_end_matches('/');
        validate_block_name(prefix)?;
        File::open(self.root.join(prefix))
    }

    /// Close the handle.  Further directory operations fail with
    /// `Closed`; blocks already open are unaffected.
    pub fn close(&self) {
        self.closed.set(true);
        *self.blocks.borrow_mut() = None;
    }

    fn block_dir(&self, name: &str) -> PathBuf {
        if name == "." {
            self.root.clone()
        } else {
            name.split('/').fold(self.root.clone(), |p, c| p.join(c))
        }
    }
}

/// Recursively collect block names under `dir`.  Dot-prefixed entries are
/// skipped, so temp files and hidden directories never count as blocks.
fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), BigFileError> {
    let entries = fs::read_dir(dir).map_err(|e| BigFileError::Io {
        context: format!("listing {}", dir.display()),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| BigFileError::Io {
            context: format!("listing {}", dir.display()),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let child = if rel.is_empty() {
            name
        } else {
            format!("{rel}/{name}")
        };
        if path.join(HEADER_FILE).is_file() {
            out.push(child.clone());
        }
        walk(&path, &child, out)?;
    }
    Ok(())
}

/// Block names are relative `/`-joined paths.  The sole dot name is the
/// root block; no other component may start with a dot or escape the
/// tree.
fn validate_block_name(name: &str) -> Result<(), BigFileError> {
    if name == "." {
        return Ok(());
    }
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name
            .split('/')
            .all(|c| !c.is_empty() && !c.starts_with('.'));
    if !valid {
        return Err(BigFileError::Format {
            path: name.to_string(),
            message: "invalid block name".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Array;

    #[test]
    fn fresh_file_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        assert!(f.list_blocks().unwrap().is_empty());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            File::open(dir.path().join("nope")),
            Err(BigFileError::NotFound { .. })
        ));
    }

    #[test]
    fn created_blocks_are_listed_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let d = Dtype::parse("<f8").unwrap();
        f.create_block("b", &d, 4, 1).unwrap();
        f.create_block("a", &d, 4, 1).unwrap();
        f.create_block("sub/c", &d, 4, 1).unwrap();
        f.create_attr_block(".").unwrap();
        assert_eq!(f.list_blocks().unwrap(), vec![".", "a", "b", "sub/c"]);
    }

    #[test]
    fn hidden_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let hidden = dir.path().join("data/.snapshot");
        fs::create_dir_all(&hidden).unwrap();
        fs::write(hidden.join(HEADER_FILE), "DTYPE: <f8\nNMEMB: 1\nNfile: 0\n").unwrap();
        assert!(f.list_blocks().unwrap().is_empty());
    }

    #[test]
    fn attr_block_has_header_but_no_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let b = f.create_attr_block(".").unwrap();
        assert_eq!(b.size(), 0);
        assert_eq!(b.nfile(), 0);
        assert!(dir.path().join("data").join(HEADER_FILE).exists());
        assert!(!dir.path().join("data/000000").exists());
    }

    #[test]
    fn create_sizes_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let d = Dtype::parse("<i4").unwrap();
        f.create_block("x", &d, 10, 3).unwrap();
        let lens: Vec<u64> = (0..3)
            .map(|i| {
                fs::metadata(dir.path().join("data/x").join(stripe_file_name(i)))
                    .unwrap()
                    .len()
            })
            .collect();
        assert_eq!(lens, vec![3 * 4, 3 * 4, 4 * 4]);
    }

    #[test]
    fn conflicting_create_fails_matching_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let d = Dtype::parse("<f8").unwrap();
        f.create_block("x", &d, 8, 1).unwrap().close().unwrap();

        assert!(matches!(
            f.create_block("x", &d, 16, 1),
            Err(BigFileError::Exists { .. })
        ));
        assert!(matches!(
            f.create_block("x", &Dtype::parse("<i8").unwrap(), 8, 1),
            Err(BigFileError::Exists { .. })
        ));
        // same layout is accepted and resets the block
        f.create_block("x", &d, 8, 1).unwrap();
    }

    #[test]
    fn open_block_round_trips_layout() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let d = Dtype::parse("<f8").unwrap();
        let mut b = f.create_block("x", &d, 8, 2).unwrap();
        b.write(0, &Array::from_scalars(&[0.0f64, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]))
            .unwrap();
        b.close().unwrap();

        let mut b = f.open_block("x").unwrap();
        assert_eq!(b.size(), 8);
        assert_eq!(b.nfile(), 2);
        assert_eq!(b.dtype().to_string(), "<f8");
        let got = b.read(0, 8).unwrap();
        assert_eq!(got.to_vec::<f64>().unwrap(), (0..8).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn open_missing_block_fails() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        assert!(matches!(
            f.open_block("ghost"),
            Err(BigFileError::NotFound { .. })
        ));
    }

    #[test]
    fn bad_block_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let d = Dtype::parse("<f8").unwrap();
        for name in ["", "/abs", "trail/", "a//b", "..", "a/../b", ".hidden"] {
            assert!(f.create_block(name, &d, 1, 1).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn closed_file_rejects_everything() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        f.create_attr_block(".").unwrap();
        f.close();
        assert!(matches!(f.open_block("."), Err(BigFileError::Closed)));
        assert!(matches!(f.list_blocks(), Err(BigFileError::Closed)));
        assert!(matches!(f.blocks(), Err(BigFileError::Closed)));
        assert!(matches!(
            f.create_block("y", &Dtype::parse("<f8").unwrap(), 1, 1),
            Err(BigFileError::Closed)
        ));
    }

    #[test]
    fn subfile_roots_into_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let f = File::create(dir.path().join("data")).unwrap();
        let d = Dtype::parse("<f8").unwrap();
        f.create_block("sub/c", &d, 4, 1).unwrap();
        let sub = f.subfile("sub/").unwrap();
        assert_eq!(sub.list_blocks().unwrap(), vec!["c"]);
        assert!(matches!(
            f.subfile("missing"),
            Err(BigFileError::NotFound { .. })
        ));
    }
}
