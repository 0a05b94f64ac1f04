//! Filesystem block store: one file per block.
//!
//! ```text
//! <root>/
//! +-- raw_<hex digest>
//! +-- dag-node_<hex digest>
//! +-- recovery-reedsolomon_<hex digest>
//! ```
//!
//! File names are the CID text form with `:` replaced by `_`. Writes go to
//! a temp file in the same directory and are renamed into place, so a
//! reader never sees a half-written block.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::cid::Cid;
use crate::error::{RecoveryError, Result};
use crate::node::Block;
use crate::store::BlockStore;

#[derive(Debug)]
pub struct FsBlockStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsBlockStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.to_string().replace(':', "_"))
    }

    /// Every block id in the store. Files that don't parse as ids are skipped.
    pub fn list(&self) -> Result<Vec<Cid>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            if let Ok(cid) = name.replacen('_', ":", 1).parse::<Cid>() {
                ids.push(cid);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl BlockStore for FsBlockStore {
    fn get(&self, cid: &Cid) -> Result<Block> {
        match fs::read(self.block_path(cid)) {
            Ok(data) => Ok(Block::with_cid(*cid, data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RecoveryError::NotFound(*cid)),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block.cid());
        if path.exists() {
            return Ok(());
        }

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{}.{}.tmp", std::process::id(), n));
        fs::write(&tmp, block.data())?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(cid = %block.cid(), bytes = block.len(), "Stored block");
        Ok(())
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.block_path(cid).exists())
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        match fs::remove_file(self.block_path(cid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
