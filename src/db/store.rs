//! Persistence seam below the tree: metadata record plus one image per leaf.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::types::{image_crc32, FtError, LeafId, Msn, Result};

/// Magic prefix of the tree metadata record.
pub const META_MAGIC: [u8; 4] = *b"FTMT";
/// Current metadata format.
pub const META_FORMAT_VERSION: u16 = 1;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_FORMAT: Range<usize> = 4..6;
const META_RESERVED: Range<usize> = 6..8;
const META_MAX_MSN: Range<usize> = 8..16;
const META_ROOT: Range<usize> = 16..24;
const META_NEXT_LEAF: Range<usize> = 24..32;
const META_CRC: Range<usize> = 32..36;
/// Encoded size of [`TreeMeta`].
pub const META_LEN: usize = 36;

const META_FILE: &str = "tree.meta";

/// Tree-wide metadata persisted at every checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeMeta {
    /// Highest sequence number ever issued; issuance resumes above it.
    pub max_msn_in_tree: Msn,
    /// Leaf that receives messages when no buffering layer routes them.
    pub root: LeafId,
    /// Next leaf id to hand out.
    pub next_leaf_id: u64,
}

impl TreeMeta {
    /// Metadata of a freshly created tree with a single empty root leaf.
    pub fn fresh() -> Self {
        Self {
            max_msn_in_tree: Msn::ZERO,
            root: LeafId(1),
            next_leaf_id: 2,
        }
    }

    /// Serializes the record with its checksum.
    pub fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
        buf[META_FORMAT].copy_from_slice(&META_FORMAT_VERSION.to_be_bytes());
        buf[META_RESERVED].fill(0);
        buf[META_MAX_MSN].copy_from_slice(&self.max_msn_in_tree.get().to_be_bytes());
        buf[META_ROOT].copy_from_slice(&self.root.0.to_be_bytes());
        buf[META_NEXT_LEAF].copy_from_slice(&self.next_leaf_id.to_be_bytes());
        let crc = image_crc32(&META_MAGIC, &buf[META_FORMAT.start..META_CRC.start]);
        buf[META_CRC].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses and verifies a record produced by [`TreeMeta::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != META_LEN {
            return Err(FtError::Corruption("tree meta has wrong length"));
        }
        if buf[META_MAGIC_RANGE] != META_MAGIC {
            return Err(FtError::Corruption("invalid tree meta magic"));
        }
        let expected = image_crc32(&META_MAGIC, &buf[META_FORMAT.start..META_CRC.start]);
        if read_u32(&buf[META_CRC]) != expected {
            return Err(FtError::Corruption("tree meta checksum mismatch"));
        }
        if read_u16(&buf[META_FORMAT]) != META_FORMAT_VERSION {
            return Err(FtError::Corruption("unsupported tree meta format"));
        }
        let meta = Self {
            max_msn_in_tree: Msn(read_u64(&buf[META_MAX_MSN])),
            root: LeafId(read_u64(&buf[META_ROOT])),
            next_leaf_id: read_u64(&buf[META_NEXT_LEAF]),
        };
        if meta.root.0 == 0 || meta.root.0 >= meta.next_leaf_id {
            return Err(FtError::Corruption("tree meta leaf ids inconsistent"));
        }
        Ok(meta)
    }
}

fn read_u16(bytes: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(bytes);
    u16::from_be_bytes(raw)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_be_bytes(raw)
}

/// Durable home of a tree's metadata and leaf images.
pub trait TreeStore: Send + Sync {
    /// Reads the metadata record, or `None` for a tree never checkpointed.
    fn load_meta(&self) -> Result<Option<TreeMeta>>;
    /// Replaces the metadata record.
    fn store_meta(&self, meta: &TreeMeta) -> Result<()>;
    /// Reads a leaf image, or `None` if the leaf was never written.
    fn read_leaf(&self, id: LeafId) -> Result<Option<Vec<u8>>>;
    /// Replaces a leaf image.
    fn write_leaf(&self, id: LeafId, image: &[u8]) -> Result<()>;
}

/// Heap-backed store. Clones share contents, so a tree can be reopened over
/// the same store.
#[derive(Clone, Default)]
pub struct MemTreeStore {
    inner: Arc<Mutex<MemInner>>,
}

#[derive(Default)]
struct MemInner {
    meta: Option<[u8; META_LEN]>,
    leaves: HashMap<LeafId, Vec<u8>>,
}

impl MemTreeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every leaf image held, ascending.
    pub fn leaf_ids(&self) -> Vec<LeafId> {
        let mut ids: Vec<LeafId> = self.inner.lock().leaves.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl TreeStore for MemTreeStore {
    fn load_meta(&self) -> Result<Option<TreeMeta>> {
        self.inner
            .lock()
            .meta
            .as_ref()
            .map(|raw| TreeMeta::decode(raw))
            .transpose()
    }

    fn store_meta(&self, meta: &TreeMeta) -> Result<()> {
        self.inner.lock().meta = Some(meta.encode());
        Ok(())
    }

    fn read_leaf(&self, id: LeafId) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().leaves.get(&id).cloned())
    }

    fn write_leaf(&self, id: LeafId, image: &[u8]) -> Result<()> {
        self.inner.lock().leaves.insert(id, image.to_vec());
        Ok(())
    }
}

/// Directory-backed store: `tree.meta` plus one `leaf-<id>.ftl` file per leaf.
///
/// Every write goes to a temporary file that is synced and renamed over the
/// target, then the directory is synced, so a crash leaves either the old or
/// the new image.
#[derive(Debug, Clone)]
pub struct FileTreeStore {
    dir: PathBuf,
}

impl FileTreeStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the store's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn leaf_path(&self, id: LeafId) -> PathBuf {
        self.dir.join(format!("leaf-{:016x}.ftl", id.0))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        sync_dir(&self.dir);
        trace!(target: "fractree::tree", path = %path.display(), len = bytes.len(), "wrote image");
        Ok(())
    }
}

/// Syncs `dir` so a completed rename survives a crash. Best effort: not every
/// platform can open a directory, so failures are logged, not returned.
fn sync_dir(dir: &Path) -> bool {
    match File::open(dir).and_then(|handle| handle.sync_all()) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                target: "fractree::tree",
                dir = %dir.display(),
                error = %err,
                "directory sync failed"
            );
            false
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FtError::Io(err)),
    }
}

impl TreeStore for FileTreeStore {
    fn load_meta(&self) -> Result<Option<TreeMeta>> {
        read_optional(&self.dir.join(META_FILE))?
            .map(|raw| TreeMeta::decode(&raw))
            .transpose()
    }

    fn store_meta(&self, meta: &TreeMeta) -> Result<()> {
        self.write_atomic(&self.dir.join(META_FILE), &meta.encode())
    }

    fn read_leaf(&self, id: LeafId) -> Result<Option<Vec<u8>>> {
        read_optional(&self.leaf_path(id))
    }

    fn write_leaf(&self, id: LeafId, image: &[u8]) -> Result<()> {
        self.write_atomic(&self.leaf_path(id), image)
    }
}
