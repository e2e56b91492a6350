//! Leaf image format.
//!
//! ```text
//! magic "FTLF" | format u16 | max_msn_applied u64 | entry count (varint)
//!   entry: key (len-prefixed) | version count (varint) | versions, newest first
//!   version: flags u8 | xid count (varint) | xids (varint each) | value (len-prefixed, absent for tombstones)
//! crc32 u32 over everything after the magic
//! ```
//! Integers are big-endian unless noted.

use bytes::Bytes;

use super::arena::{Chain, Payload, Version, VersionArena, VersionIdx};
use super::{LeafEntry, LeafStore};
use crate::primitives::bytes::buf::{put_len_prefixed, Cursor};
use crate::primitives::bytes::var;
use crate::storage::mvcc::{flags, VersionTag, Xids};
use crate::types::{image_crc32, FtError, Msn, Result, TxnId};

/// Magic prefix of every leaf image.
pub const LEAF_MAGIC: [u8; 4] = *b"FTLF";
/// Current leaf image format.
pub const LEAF_FORMAT_VERSION: u16 = 1;

const CRC_LEN: usize = 4;
const KNOWN_FLAGS: u8 = flags::TOMBSTONE | flags::PROVISIONAL;

impl LeafStore {
    /// Serializes the leaf, watermark included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.entries.len() * 32);
        out.extend_from_slice(&LEAF_MAGIC);
        out.extend_from_slice(&LEAF_FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&self.max_msn_applied.get().to_be_bytes());
        var::encode_u64(self.entries.len() as u64, &mut out);
        for entry in &self.entries {
            put_len_prefixed(&mut out, &entry.key);
            let chain: Vec<&Version> = Chain {
                arena: &self.arena,
                next: Some(entry.head),
            }
            .collect();
            var::encode_u64(chain.len() as u64, &mut out);
            for version in chain {
                encode_version(version, &mut out);
            }
        }
        let crc = image_crc32(&LEAF_MAGIC, &out[LEAF_MAGIC.len()..]);
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    /// Rebuilds a leaf from an image produced by [`LeafStore::encode`].
    ///
    /// The decoded leaf is clean.
    pub fn decode(image: &[u8]) -> Result<Self> {
        if image.len() < LEAF_MAGIC.len() + CRC_LEN {
            return Err(FtError::Corruption("leaf image truncated"));
        }
        let (body, trailer) = image.split_at(image.len() - CRC_LEN);
        if body[..LEAF_MAGIC.len()] != LEAF_MAGIC {
            return Err(FtError::Corruption("invalid leaf magic"));
        }
        let mut crc = [0u8; CRC_LEN];
        crc.copy_from_slice(trailer);
        if u32::from_be_bytes(crc) != image_crc32(&LEAF_MAGIC, &body[LEAF_MAGIC.len()..]) {
            return Err(FtError::Corruption("leaf image checksum mismatch"));
        }

        let mut cursor = Cursor::new(&body[LEAF_MAGIC.len()..]);
        if cursor.u16_be()? != LEAF_FORMAT_VERSION {
            return Err(FtError::Corruption("unsupported leaf format version"));
        }
        let max_msn_applied = Msn(cursor.u64_be()?);
        let entry_count = cursor.varint()?;

        let mut leaf = LeafStore {
            max_msn_applied,
            ..LeafStore::default()
        };
        for _ in 0..entry_count {
            let key = Bytes::copy_from_slice(cursor.len_prefixed()?);
            let version_count = cursor.varint()?;
            let mut chain = Vec::new();
            for _ in 0..version_count {
                chain.push(decode_version(&mut cursor)?);
            }
            let head = link_chain(&mut leaf.arena, chain)?;
            leaf.entries.push(LeafEntry { key, head });
        }
        if cursor.remaining() != 0 {
            return Err(FtError::Corruption("trailing bytes after leaf entries"));
        }
        Ok(leaf)
    }
}

fn encode_version(version: &Version, out: &mut Vec<u8>) {
    let mut bits = 0u8;
    if version.payload.is_tombstone() {
        bits |= flags::TOMBSTONE;
    }
    if version.tag.provisional {
        bits |= flags::PROVISIONAL;
    }
    out.push(bits);
    let ids = version.tag.xids.as_slice();
    var::encode_u64(ids.len() as u64, out);
    for id in ids {
        var::encode_u64(id.0, out);
    }
    if let Payload::Value(value) = &version.payload {
        put_len_prefixed(out, value);
    }
}

fn decode_version(cursor: &mut Cursor<'_>) -> Result<(Payload, VersionTag)> {
    let bits = cursor.u8()?;
    if bits & !KNOWN_FLAGS != 0 {
        return Err(FtError::Corruption("unknown version flags"));
    }
    let id_count = cursor.varint()?;
    let mut ids = Vec::new();
    for _ in 0..id_count {
        let id = cursor.varint()?;
        if id == 0 {
            return Err(FtError::Corruption("root id inside xid stack"));
        }
        ids.push(TxnId(id));
    }
    let provisional = bits & flags::PROVISIONAL != 0;
    if provisional && ids.is_empty() {
        return Err(FtError::Corruption("provisional version without owner"));
    }
    let payload = if bits & flags::TOMBSTONE != 0 {
        Payload::Tombstone
    } else {
        Payload::Value(Bytes::copy_from_slice(cursor.len_prefixed()?))
    };
    let tag = VersionTag {
        xids: Xids::from_ids(ids),
        provisional,
    };
    Ok((payload, tag))
}

/// Allocates a newest-first chain oldest-first so each version can link to its predecessor.
fn link_chain(arena: &mut VersionArena, chain: Vec<(Payload, VersionTag)>) -> Result<VersionIdx> {
    let mut prev = None;
    for (payload, tag) in chain.into_iter().rev() {
        prev = Some(arena.alloc(Version { payload, tag, prev }));
    }
    prev.ok_or(FtError::Corruption("leaf entry without versions"))
}
