//! Slab allocator and snapshot file model.
//!
//! The allocator owns the single database file (or memory buffer) and hands
//! out [`Ref`]s: byte offsets of node headers. It keeps the whole slab image
//! in memory; `translate` is a bounds-checked slice into the image, and a
//! commit flushes the blocks touched by the transaction, syncs, then flips
//! the header's selector byte as the single atomic step that publishes the
//! new snapshot.
//!
//! Free space is tracked per version: a freed ref carries the version that
//! freed it and becomes reusable only once no pinned snapshot at or below
//! that version remains.

pub mod cipher;
pub mod header;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use tarn_error::{Result, TarnError};
use tarn_types::{Ref, VersionId};

use crate::cipher::{CIPHER_BLOCK, PageCipher, PlainCipher};
use crate::header::{
    CURRENT_FILE_FORMAT, FileHeader, HEADER_SIZE, MIN_UPGRADABLE_FILE_FORMAT,
};

/// How hard a commit pushes bytes to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Sync data before flipping the selector, then sync the header.
    #[default]
    Full,
    /// Skip syncs entirely. For tests and throwaway databases.
    None,
}

/// A free-space entry: a run of bytes and the version that freed it.
///
/// `version == 0` marks space that was never part of any published
/// snapshot (safe to reuse immediately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub pos: u64,
    pub size: usize,
    pub version: u64,
}

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocOptions {
    /// File growth granularity in bytes; growth requests round up to a
    /// multiple of this.
    pub growth: usize,
    /// Commit durability.
    pub durability: Durability,
    /// Optional 32-byte encryption key. When set, every block passes
    /// through the configured cipher.
    pub encryption_key: Option<[u8; 32]>,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            growth: 4096,
            durability: Durability::Full,
            encryption_key: None,
        }
    }
}

fn round_up(n: u64, to: u64) -> u64 {
    n.div_ceil(to) * to
}

fn map_extend_err(err: io::Error, requested: usize) -> TarnError {
    // ENOSPC becomes the dedicated error kind; everything else is plain I/O.
    if err.raw_os_error() == Some(28) {
        TarnError::OutOfDiskSpace { requested }
    } else {
        TarnError::FileAccess(err)
    }
}

/// The slab allocator.
///
/// Single-writer: all mutating calls happen inside the one write
/// transaction the database serializes. Readers translate refs against an
/// immutable prefix of the image.
pub struct SlabAlloc {
    /// The full logical file image. Grows at the end; committed bytes are
    /// never rewritten (copy-on-write happens above this layer).
    image: Vec<u8>,
    file: Option<File>,
    path: Option<PathBuf>,
    read_only: bool,
    hdr: FileHeader,
    top_ref: Ref,
    file_format: u8,
    /// Image size at the last successful commit (or attach).
    committed_size: u64,
    /// Start of the region allocated by the open transaction. Everything at
    /// or beyond this offset, plus refs in `txn_reused`, is writable.
    writable_base: u64,
    /// Refs handed out this transaction from reused (pre-`writable_base`)
    /// space, with their sizes.
    txn_reused: BTreeMap<u64, usize>,
    /// Byte ranges to flush at commit (reused-space writes; fresh space is
    /// flushed wholesale from `committed_size`).
    dirty: BTreeMap<u64, usize>,
    /// Freed space still pinned by its freeing version.
    free_list: Vec<FreeEntry>,
    /// Free space safe to hand out.
    reusable: Vec<FreeEntry>,
    /// Snapshots for rollback.
    saved_reusable: Vec<FreeEntry>,
    saved_free_len: usize,
    /// Version the open write transaction will commit as; stamped onto
    /// freed refs.
    current_version: VersionId,
    growth: u64,
    durability: Durability,
    cipher: Box<dyn PageCipher>,
}

impl std::fmt::Debug for SlabAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabAlloc")
            .field("size", &self.image.len())
            .field("committed_size", &self.committed_size)
            .field("top_ref", &self.top_ref)
            .field("free_entries", &self.free_list.len())
            .field("reusable_entries", &self.reusable.len())
            .finish_non_exhaustive()
    }
}

impl SlabAlloc {
    fn from_parts(
        image: Vec<u8>,
        file: Option<File>,
        path: Option<PathBuf>,
        read_only: bool,
        hdr: FileHeader,
        top_ref: Ref,
        file_format: u8,
        options: &AllocOptions,
    ) -> Self {
        let committed = image.len() as u64;
        Self {
            image,
            file,
            path,
            read_only,
            hdr,
            top_ref,
            file_format,
            committed_size: committed,
            writable_base: committed,
            txn_reused: BTreeMap::new(),
            dirty: BTreeMap::new(),
            free_list: Vec::new(),
            reusable: Vec::new(),
            saved_reusable: Vec::new(),
            saved_free_len: 0,
            current_version: VersionId::ZERO,
            growth: options.growth.max(CIPHER_BLOCK) as u64,
            durability: options.durability,
            cipher: Box::new(PlainCipher),
        }
    }

    /// A fresh in-memory database.
    #[must_use]
    pub fn new_scratch() -> Self {
        let hdr = FileHeader::new_file();
        let mut image = vec![0_u8; HEADER_SIZE];
        image.copy_from_slice(&hdr.encode());
        let mut alloc = Self::from_parts(
            image,
            None,
            None,
            false,
            hdr,
            Ref::NONE,
            CURRENT_FILE_FORMAT,
            &AllocOptions {
                durability: Durability::None,
                ..AllocOptions::default()
            },
        );
        // Scratch databases have no committed snapshot: everything after
        // the header is writable from the start.
        alloc.writable_base = HEADER_SIZE as u64;
        alloc
    }

    /// Open or create the database file at `path`.
    pub fn attach_file(path: &Path, options: &AllocOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|_| TarnError::CannotOpen {
                path: path.to_owned(),
            })?;
        let len = file.metadata()?.len();

        if len == 0 {
            // Fresh file: write the header eagerly so a crash right after
            // creation leaves a valid empty database behind.
            let hdr = FileHeader::new_file();
            file.write_all_at(&hdr.encode(), 0)?;
            if options.durability == Durability::Full {
                file.sync_data()?;
            }
            info!(path = %path.display(), "created new database file");
            let image = hdr.encode().to_vec();
            return Ok(Self::from_parts(
                image,
                Some(file),
                Some(path.to_owned()),
                false,
                hdr,
                Ref::NONE,
                CURRENT_FILE_FORMAT,
                options,
            ));
        }

        if len < HEADER_SIZE as u64 {
            return Err(TarnError::invalid_database(format!(
                "file is {len} bytes, smaller than the header"
            )));
        }

        let mut image = vec![0_u8; usize::try_from(len).map_err(|_| {
            TarnError::invalid_database("file too large to map")
        })?];
        file.read_exact_at(&mut image, 0)?;

        let cipher = PlainCipher;
        let mut block_index = 0_u64;
        for block in image.chunks_mut(CIPHER_BLOCK) {
            cipher.decrypt_block(block_index, block)?;
            block_index += 1;
        }

        let hdr = FileHeader::decode(&image)?;
        let (slot, top_ref, file_format) = hdr.pick_slot(len)?;
        if file_format > CURRENT_FILE_FORMAT {
            return Err(TarnError::invalid_database(format!(
                "file-format version {file_format} is newer than supported {CURRENT_FILE_FORMAT}"
            )));
        }
        if file_format < MIN_UPGRADABLE_FILE_FORMAT {
            return Err(TarnError::invalid_database(format!(
                "file-format version {file_format} is too old to upgrade"
            )));
        }
        debug!(
            path = %path.display(),
            size = len,
            slot,
            top_ref = %top_ref,
            file_format,
            "attached database file"
        );
        Ok(Self::from_parts(
            image,
            Some(file),
            Some(path.to_owned()),
            false,
            hdr,
            top_ref,
            file_format,
            options,
        ))
    }

    /// Attach a read-only memory buffer holding a database image.
    pub fn attach_buffer(buf: Vec<u8>) -> Result<Self> {
        let hdr = FileHeader::decode(&buf)?;
        let (_, top_ref, file_format) = hdr.pick_slot(buf.len() as u64)?;
        Ok(Self::from_parts(
            buf,
            None,
            None,
            true,
            hdr,
            top_ref,
            file_format,
            &AllocOptions::default(),
        ))
    }

    /// The current top ref.
    #[inline]
    #[must_use]
    pub fn top_ref(&self) -> Ref {
        self.top_ref
    }

    /// The logical file size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.image.len() as u64
    }

    /// The file-format version the file was opened with.
    #[inline]
    #[must_use]
    pub fn file_format(&self) -> u8 {
        self.file_format
    }

    /// Whether the file needs an in-place format upgrade.
    #[inline]
    #[must_use]
    pub fn needs_upgrade(&self) -> bool {
        self.file_format < CURRENT_FILE_FORMAT
    }

    /// Whether the allocator rejects mutation.
    #[inline]
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether `ref_` was allocated by the open transaction (and may be
    /// mutated in place).
    #[inline]
    #[must_use]
    pub fn is_writable(&self, ref_: Ref) -> bool {
        ref_.get() >= self.writable_base || self.txn_reused.contains_key(&ref_.get())
    }

    /// Translate a ref into the bytes starting at it.
    ///
    /// The returned slice runs to the end of the image; the node layer
    /// knows how much it owns from the node header.
    pub fn translate(&self, ref_: Ref) -> Result<&[u8]> {
        let pos = ref_.get();
        if ref_.is_none() || pos >= self.size() {
            return Err(TarnError::InvalidRef {
                ref_value: pos,
                mapped_size: self.size(),
            });
        }
        Ok(&self.image[usize::try_from(pos).expect("checked against size")..])
    }

    /// Translate a ref into writable bytes.
    ///
    /// Only refs allocated by the open transaction are writable; handing
    /// out mutable access to a committed node would corrupt published
    /// snapshots.
    pub fn translate_mut(&mut self, ref_: Ref) -> Result<&mut [u8]> {
        let pos = ref_.get();
        if ref_.is_none() || pos >= self.size() {
            return Err(TarnError::InvalidRef {
                ref_value: pos,
                mapped_size: self.size(),
            });
        }
        if !self.is_writable(ref_) {
            return Err(TarnError::logic(format!(
                "attempt to mutate committed node at {ref_}"
            )));
        }
        Ok(&mut self.image[usize::try_from(pos).expect("checked against size")..])
    }

    /// Allocate `size` bytes and return the ref of the zeroed region.
    ///
    /// Reuses version-cleared free space when a large-enough run exists,
    /// otherwise grows the image by a slab.
    pub fn alloc(&mut self, size: usize) -> Result<Ref> {
        if self.read_only {
            return Err(TarnError::wrong_state("allocation on a read-only database"));
        }
        let size = usize::try_from(round_up(size as u64, 8)).expect("rounded size fits");

        // First fit from the reusable list.
        if let Some(i) = self.reusable.iter().position(|e| e.size >= size) {
            let entry = self.reusable[i];
            if entry.size == size {
                self.reusable.remove(i);
            } else {
                self.reusable[i] = FreeEntry {
                    pos: entry.pos + size as u64,
                    size: entry.size - size,
                    version: entry.version,
                };
            }
            let ref_ = Ref::new(entry.pos).expect("free entries are aligned");
            if entry.pos < self.writable_base {
                self.txn_reused.insert(entry.pos, size);
                self.dirty.insert(entry.pos, size);
            }
            let start = usize::try_from(entry.pos).expect("in image");
            self.image[start..start + size].fill(0);
            return Ok(ref_);
        }

        // Grow by at least one slab.
        let pos = self.size();
        let new_size = round_up(pos + size as u64, self.growth);
        let new_len = usize::try_from(new_size)
            .map_err(|_| TarnError::OutOfDiskSpace { requested: size })?;
        self.image.resize(new_len, 0);
        if new_size - pos > size as u64 {
            // The slab tail beyond this allocation is immediately reusable.
            self.reusable.push(FreeEntry {
                pos: pos + size as u64,
                size: usize::try_from(new_size - pos - size as u64).expect("slab tail fits"),
                version: 0,
            });
        }
        debug!(size, pos, new_size, "grew slab");
        Ok(Ref::new(pos).expect("image size stays 8-aligned"))
    }

    /// Record `ref_` as freed by the open transaction.
    ///
    /// Space allocated by the open transaction returns to the reusable list
    /// immediately (it was never visible to any snapshot); committed space
    /// is stamped with the current version and waits until no snapshot at
    /// or below it remains pinned.
    pub fn free(&mut self, ref_: Ref, size: usize) {
        let size = usize::try_from(round_up(size as u64, 8)).expect("rounded size fits");
        if self.is_writable(ref_) {
            self.txn_reused.remove(&ref_.get());
            self.dirty.remove(&ref_.get());
            self.reusable.push(FreeEntry {
                pos: ref_.get(),
                size,
                version: 0,
            });
        } else {
            self.free_list.push(FreeEntry {
                pos: ref_.get(),
                size,
                version: self.current_version.0,
            });
        }
    }

    /// Begin tracking a write transaction that will commit as `version`.
    pub fn begin_write(&mut self, version: VersionId) -> Result<()> {
        if self.read_only {
            return Err(TarnError::wrong_state("write on a read-only database"));
        }
        self.current_version = version;
        self.writable_base = self.size();
        self.saved_reusable = self.reusable.clone();
        self.saved_free_len = self.free_list.len();
        self.txn_reused.clear();
        self.dirty.clear();
        Ok(())
    }

    /// Discard everything the open transaction allocated or freed.
    pub fn rollback(&mut self) {
        self.image
            .truncate(usize::try_from(self.writable_base).expect("fits"));
        self.reusable = std::mem::take(&mut self.saved_reusable);
        self.free_list.truncate(self.saved_free_len);
        self.txn_reused.clear();
        self.dirty.clear();
    }

    /// Clear per-transaction tracking without touching free lists.
    ///
    /// Called after a successful commit, and before binding a fresh write
    /// transaction.
    pub fn reset_free_space_tracking(&mut self) {
        self.txn_reused.clear();
        self.dirty.clear();
        self.saved_reusable.clear();
        self.saved_free_len = self.free_list.len();
        self.writable_base = self.size();
    }

    /// Move free-list entries whose freeing version is below `oldest_live`
    /// to the reusable list, merging adjacent runs.
    pub fn consolidate_free_space(&mut self, oldest_live: VersionId) {
        let mut i = 0;
        while i < self.free_list.len() {
            if self.free_list[i].version < oldest_live.0 {
                let mut entry = self.free_list.swap_remove(i);
                entry.version = 0;
                self.reusable.push(entry);
            } else {
                i += 1;
            }
        }
        self.reusable.sort_by_key(|e| e.pos);
        let mut merged: Vec<FreeEntry> = Vec::with_capacity(self.reusable.len());
        for entry in self.reusable.drain(..) {
            match merged.last_mut() {
                Some(last) if last.pos + last.size as u64 == entry.pos => {
                    last.size += entry.size;
                }
                _ => merged.push(entry),
            }
        }
        self.reusable = merged;
    }

    /// Snapshot of all free space for publication in the top array:
    /// reusable runs (version 0) followed by still-pinned runs with their
    /// freeing versions.
    #[must_use]
    pub fn free_space_snapshot(&self) -> Vec<FreeEntry> {
        let mut out = self.reusable.clone();
        out.extend_from_slice(&self.free_list);
        out.sort_by_key(|e| e.pos);
        out
    }

    /// Number of free-space runs currently tracked (reusable plus
    /// version-pinned). Used to reserve capacity for the published list.
    #[must_use]
    pub fn free_entry_count(&self) -> usize {
        self.reusable.len() + self.free_list.len()
    }

    /// Load a published free list after attach. With no pinned readers at
    /// attach time, every entry is immediately reusable.
    pub fn load_free_space(&mut self, entries: Vec<FreeEntry>) {
        self.reusable = entries
            .into_iter()
            .map(|mut e| {
                e.version = 0;
                e
            })
            .collect();
        self.free_list.clear();
    }

    /// Flush the transaction's writes and atomically publish `new_top`.
    ///
    /// Steps: flush dirty blocks and fresh space, sync, write the inactive
    /// header slot, flip the selector, sync again. The selector flip is the
    /// single step visible to a concurrent open.
    pub fn commit(&mut self, new_top: Ref) -> Result<()> {
        if self.read_only {
            return Err(TarnError::wrong_state("commit on a read-only database"));
        }
        if new_top.get() >= self.size().max(1) && new_top.is_some() {
            return Err(TarnError::logic(format!(
                "top ref {new_top} outside file of {} bytes",
                self.size()
            )));
        }

        if let Some(file) = &self.file {
            let file_len = round_up(self.size(), CIPHER_BLOCK as u64);
            file.set_len(file_len)
                .map_err(|e| map_extend_err(e, self.image.len()))?;

            // Blocks covering reused-space writes, plus all fresh space.
            let mut blocks: Vec<u64> = Vec::new();
            for (&pos, &len) in &self.dirty {
                let first = pos / CIPHER_BLOCK as u64;
                let last = (pos + len as u64 - 1) / CIPHER_BLOCK as u64;
                blocks.extend(first..=last);
            }
            let fresh_first = self.committed_size / CIPHER_BLOCK as u64;
            let fresh_last = (self.size().max(1) - 1) / CIPHER_BLOCK as u64;
            if self.size() > self.committed_size {
                blocks.extend(fresh_first..=fresh_last);
            }
            blocks.sort_unstable();
            blocks.dedup();

            let mut buf = vec![0_u8; CIPHER_BLOCK];
            for block in blocks {
                let start = usize::try_from(block * CIPHER_BLOCK as u64).expect("fits");
                let end = (start + CIPHER_BLOCK).min(self.image.len());
                buf[..end - start].copy_from_slice(&self.image[start..end]);
                buf[end - start..].fill(0);
                self.cipher.encrypt_block(block, &mut buf);
                file.write_all_at(&buf, start as u64)
                    .map_err(|e| map_extend_err(e, CIPHER_BLOCK))?;
            }
            if self.durability == Durability::Full {
                file.sync_data()?;
            }
        }

        // Publish: write the inactive slot, then flip the selector.
        let inactive = 1 - self.hdr.selected();
        self.hdr.top_refs[inactive] = new_top.get();
        self.hdr.format_versions[inactive] = CURRENT_FILE_FORMAT;
        self.hdr.selector = inactive as u8;
        let encoded = self.hdr.encode();
        self.image[..HEADER_SIZE].copy_from_slice(&encoded);
        if let Some(file) = &self.file {
            file.write_all_at(&encoded, 0)?;
            if self.durability == Durability::Full {
                file.sync_data()?;
            }
        }

        self.top_ref = new_top;
        self.file_format = CURRENT_FILE_FORMAT;
        self.committed_size = self.size();
        self.reset_free_space_tracking();
        debug!(top_ref = %new_top, size = self.committed_size, "committed slab image");
        Ok(())
    }

    /// The path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_alloc_is_aligned_and_zeroed() {
        let mut alloc = SlabAlloc::new_scratch();
        let r1 = alloc.alloc(20).unwrap();
        let r2 = alloc.alloc(8).unwrap();
        assert_eq!(r1.get() % 8, 0);
        assert_eq!(r2.get() % 8, 0);
        assert_ne!(r1, r2);
        assert!(alloc.translate(r1).unwrap()[..24].iter().all(|&b| b == 0));
    }

    #[test]
    fn translate_out_of_bounds_is_invalid_ref() {
        let alloc = SlabAlloc::new_scratch();
        let err = alloc.translate(Ref::new(1 << 20).unwrap()).unwrap_err();
        assert!(matches!(err, TarnError::InvalidRef { .. }));
    }

    #[test]
    fn freed_txn_space_is_reused_immediately() {
        let mut alloc = SlabAlloc::new_scratch();
        let r1 = alloc.alloc(64).unwrap();
        alloc.free(r1, 64);
        let r2 = alloc.alloc(64).unwrap();
        assert_eq!(r1, r2, "same-transaction space comes straight back");
    }

    #[test]
    fn committed_space_waits_for_version_clearance() {
        let mut alloc = SlabAlloc::new_scratch();
        let r1 = alloc.alloc(64).unwrap();
        alloc.commit(Ref::NONE).unwrap();
        alloc.begin_write(VersionId(5)).unwrap();

        // Freed at version 5; a reader pinned at 5 forbids reuse.
        alloc.free(r1, 64);
        alloc.consolidate_free_space(VersionId(5));
        let r2 = alloc.alloc(64).unwrap();
        assert_ne!(r1, r2, "pinned space must not be reused");

        // Once the oldest live reader moves past 5, the space comes back.
        alloc.consolidate_free_space(VersionId(6));
        let r3 = alloc.alloc(64).unwrap();
        assert_eq!(r1, r3);
    }

    #[test]
    fn rollback_discards_growth_and_restores_free_lists() {
        let mut alloc = SlabAlloc::new_scratch();
        let r_old = alloc.alloc(32).unwrap();
        alloc.commit(Ref::NONE).unwrap();
        let size_before = alloc.size();

        alloc.begin_write(VersionId(1)).unwrap();
        let _r_new = alloc.alloc(10_000).unwrap();
        alloc.free(r_old, 32);
        assert!(alloc.size() > size_before);
        alloc.rollback();
        assert_eq!(alloc.size(), size_before);
        // The old ref was not freed after all.
        assert!(alloc.free_space_snapshot().iter().all(|e| e.pos != r_old.get()));
    }

    #[test]
    fn commit_alternates_header_slots() {
        let mut alloc = SlabAlloc::new_scratch();
        let r1 = alloc.alloc(16).unwrap();
        alloc.commit(r1).unwrap();
        let first_slot = alloc.hdr.selected();
        alloc.begin_write(VersionId(1)).unwrap();
        let r2 = alloc.alloc(16).unwrap();
        alloc.commit(r2).unwrap();
        assert_ne!(alloc.hdr.selected(), first_slot);
        assert_eq!(alloc.top_ref(), r2);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc.tarn");
        let options = AllocOptions {
            durability: Durability::None,
            ..AllocOptions::default()
        };

        let top = {
            let mut alloc = SlabAlloc::attach_file(&path, &options).unwrap();
            alloc.begin_write(VersionId(1)).unwrap();
            let r = alloc.alloc(24).unwrap();
            alloc.translate_mut(r).unwrap()[..4].copy_from_slice(b"data");
            alloc.commit(r).unwrap();
            r
        };

        let alloc = SlabAlloc::attach_file(&path, &options).unwrap();
        assert_eq!(alloc.top_ref(), top);
        assert_eq!(&alloc.translate(top).unwrap()[..4], b"data");
    }

    #[test]
    fn attach_buffer_is_read_only() {
        let mut src = SlabAlloc::new_scratch();
        let r = src.alloc(16).unwrap();
        src.commit(r).unwrap();
        let mut alloc = SlabAlloc::attach_buffer(src.image.clone()).unwrap();
        assert_eq!(alloc.top_ref(), r);
        assert!(alloc.is_read_only());
        assert!(alloc.alloc(8).is_err());
    }

    #[test]
    fn attach_rejects_garbage() {
        let err = SlabAlloc::attach_buffer(vec![0xAB; 64]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn mutating_committed_node_is_rejected() {
        let mut alloc = SlabAlloc::new_scratch();
        let r = alloc.alloc(16).unwrap();
        alloc.commit(r).unwrap();
        alloc.begin_write(VersionId(1)).unwrap();
        assert!(alloc.translate_mut(r).is_err());
    }
}
