//! # Numeric index
//!
//! A static, multi-level page tree mapping sparse ids to record offsets.
//! It is written once (see [`NumericIndexBuilder`]) and only read afterwards.
//!
//! ## File layout
//!
//! ```text
//! levels      : varint   (0 for an empty index)
//! page_size   : varint   (max entries per page)
//! entry_count : u64
//! root_offset : u64      (file offset of the root page)
//! pages...
//! ```
//!
//! Each page is an entry count (varint) followed by `(id, offset)` pairs.
//! The first pair of a page is stored as-is; the following ones are deltas against their predecessor
//! (ids as unsigned varints, offsets as zig-zag varints).
//! Leaf pages map ids to record offsets; interior pages map the first id of each child page
//! to the file offset of that page.
//! Levels are written leaf first, so the root page is always the last page in the file.

use crate::codec::{AccessMode, CodecError, FileScanner, FileWriter};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error};

/// Page size used when the caller has no better idea.
pub const DEFAULT_PAGE_SIZE: u32 = 64;

#[derive(Debug, Error)]
pub enum NumericIndexError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Ids must be strictly increasing, but {id} follows {previous}")]
    UnsortedIds { previous: u64, id: u64 },
    #[error("Page size must be at least 2 (got {0})")]
    InvalidPageSize(u32),
    #[error("Corrupt index file '{filename}': {reason}")]
    Corrupt { filename: String, reason: String },
    #[error("Index '{0}' is not open")]
    NotOpen(String),
    #[error("Lock is poisoned: {0}")]
    PoisonedLock(String),
}

/// One `(id, offset)` pair of a page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: u64,
    pub offset: u64,
}

type Page = Arc<[IndexEntry]>;

/// Cache occupancy of one non-root level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelStatistics {
    /// Distance from the root (1 is the level directly below the root).
    pub level: u32,
    pub cached_pages: usize,
    pub capacity: usize,
}

/// A read-only numeric index.
///
/// Lookups may be performed concurrently from multiple threads.
/// The file handle is shared, so the seek+read sequence for each page is serialized,
/// while already cached pages are served without touching the file.
pub struct NumericIndex {
    filename: String,
    scanner: Mutex<FileScanner>,
    levels: u32,
    page_size: u32,
    entry_count: u64,
    root: Page,
    /// One cache per non-root level, ordered from the root down to the leaves.
    page_caches: Vec<Mutex<LruCache<u64, Page>>>,
}

impl NumericIndex {
    /// Opens an index file and loads its root page.
    ///
    /// `cache_size` is the number of pages kept in memory for each non-root level.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be read or its header is inconsistent.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: AccessMode,
        cache_size: NonZeroUsize,
    ) -> Result<Self, NumericIndexError> {
        let mut scanner = FileScanner::open(path, mode)?;
        let filename = scanner.filename().to_string();

        let levels = scanner.read_varint_u32()?;
        let page_size = scanner.read_varint_u32()?;
        let entry_count = scanner.read_u64()?;
        let root_offset = scanner.read_file_offset()?;

        if page_size < 2 {
            return Err(corrupt(&filename, format!("invalid page size {page_size}")));
        }
        if (levels == 0) != (entry_count == 0) {
            return Err(corrupt(
                &filename,
                format!("{levels} levels for {entry_count} entries"),
            ));
        }

        let root: Page = if levels == 0 {
            Arc::new([])
        } else {
            read_page(&mut scanner, root_offset, page_size)?
        };

        let page_caches = (1..levels)
            .map(|_| Mutex::new(LruCache::new(cache_size)))
            .collect();

        debug!(filename, levels, page_size, entry_count, "Opened numeric index");

        Ok(Self {
            filename,
            scanner: Mutex::new(scanner),
            levels,
            page_size,
            entry_count,
            root,
            page_caches,
        })
    }

    /// Closes the underlying file. Lookups fail afterwards.
    ///
    /// # Errors
    ///
    /// Fails if the file lock is poisoned.
    pub fn close(&self) -> Result<(), NumericIndexError> {
        let mut scanner = self.lock_scanner()?;
        scanner.close();
        for cache in &self.page_caches {
            cache
                .lock()
                .map_err(|e| NumericIndexError::PoisonedLock(e.to_string()))?
                .clear();
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.scanner.lock().is_ok_and(|scanner| scanner.is_open())
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Finds the record offset for `id`.
    ///
    /// A missing id is not an error; it yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Fails if the index is closed or a page can't be read.
    pub fn lookup(&self, id: u64) -> Result<Option<u64>, NumericIndexError> {
        if !self.is_open() {
            return Err(NumericIndexError::NotOpen(self.filename.clone()));
        }

        let mut page = self.root.clone();
        for cache in &self.page_caches {
            // The last page starting at or before the id
            let index = page.partition_point(|entry| entry.id <= id);
            let Some(child) = index.checked_sub(1).and_then(|i| page.get(i)) else {
                return Ok(None);
            };
            page = self.load_page(cache, *child)?;
        }

        Ok(page
            .binary_search_by_key(&id, |entry| entry.id)
            .ok()
            .and_then(|i| page.get(i))
            .map(|entry| entry.offset))
    }

    /// Looks up several ids at once, skipping the ones that are missing.
    ///
    /// Ids are sorted and deduplicated first, which keeps page access local.
    ///
    /// # Errors
    ///
    /// Fails if any page can't be read.
    pub fn lookup_many(&self, ids: &[u64]) -> Result<Vec<(u64, u64)>, NumericIndexError> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(offset) = self.lookup(id)? {
                result.push((id, offset));
            }
        }
        Ok(result)
    }

    /// Reports how many pages each non-root level currently holds in memory.
    pub fn statistics(&self) -> Vec<LevelStatistics> {
        (1u32..)
            .zip(&self.page_caches)
            .map(|(level, cache)| {
                let (cached_pages, capacity) = cache
                    .lock()
                    .map(|cache| (cache.len(), cache.cap().get()))
                    .unwrap_or_default();
                LevelStatistics {
                    level,
                    cached_pages,
                    capacity,
                }
            })
            .collect()
    }

    fn load_page(
        &self,
        cache: &Mutex<LruCache<u64, Page>>,
        entry: IndexEntry,
    ) -> Result<Page, NumericIndexError> {
        {
            let mut cache = cache
                .lock()
                .map_err(|e| NumericIndexError::PoisonedLock(e.to_string()))?;
            if let Some(page) = cache.get(&entry.id) {
                return Ok(page.clone());
            }
        }

        let page = {
            let mut scanner = self.lock_scanner()?;
            read_page(&mut scanner, entry.offset, self.page_size)?
        };

        if page.first().map(|first| first.id) != Some(entry.id) {
            return Err(corrupt(
                &self.filename,
                format!("page at {} does not start with id {}", entry.offset, entry.id),
            ));
        }

        cache
            .lock()
            .map_err(|e| NumericIndexError::PoisonedLock(e.to_string()))?
            .put(entry.id, page.clone());

        Ok(page)
    }

    fn lock_scanner(&self) -> Result<std::sync::MutexGuard<'_, FileScanner>, NumericIndexError> {
        self.scanner
            .lock()
            .map_err(|e| NumericIndexError::PoisonedLock(e.to_string()))
    }
}

impl std::fmt::Debug for NumericIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumericIndex")
            .field("filename", &self.filename)
            .field("levels", &self.levels)
            .field("page_size", &self.page_size)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

fn corrupt(filename: &str, reason: String) -> NumericIndexError {
    error!(filename, "Corrupt numeric index: {reason}");
    NumericIndexError::Corrupt {
        filename: filename.to_string(),
        reason,
    }
}

fn read_page(
    scanner: &mut FileScanner,
    offset: u64,
    page_size: u32,
) -> Result<Page, NumericIndexError> {
    scanner.set_pos(offset)?;
    let count = scanner.read_varint_u32()?;
    if count == 0 || count > page_size {
        return Err(corrupt(
            scanner.filename(),
            format!("page at {offset} holds {count} entries (page size {page_size})"),
        ));
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut id = scanner.read_varint_u64()?;
    let mut record_offset = scanner.read_varint_u64()?;
    entries.push(IndexEntry {
        id,
        offset: record_offset,
    });

    for _ in 1..count {
        let id_delta = scanner.read_varint_u64()?;
        let offset_delta = scanner.read_varint_i64()?;
        if id_delta == 0 {
            return Err(corrupt(
                scanner.filename(),
                format!("duplicate id {id} in page at {offset}"),
            ));
        }
        id = id.wrapping_add(id_delta);
        record_offset = record_offset.wrapping_add_signed(offset_delta);
        entries.push(IndexEntry {
            id,
            offset: record_offset,
        });
    }

    Ok(entries.into())
}

fn write_page(writer: &mut FileWriter, entries: &[IndexEntry]) -> Result<u64, CodecError> {
    let page_offset = writer.pos();
    // Callers never pass more than page_size (a u32) entries
    writer.write_varint_u64(entries.len() as u64)?;

    let mut previous: Option<IndexEntry> = None;
    for entry in entries {
        match previous {
            None => {
                writer.write_varint_u64(entry.id)?;
                writer.write_varint_u64(entry.offset)?;
            }
            Some(previous) => {
                writer.write_varint_u64(entry.id - previous.id)?;
                #[expect(clippy::cast_possible_wrap)]
                let offset_delta = entry.offset.wrapping_sub(previous.offset) as i64;
                writer.write_varint_i64(offset_delta)?;
            }
        }
        previous = Some(*entry);
    }

    Ok(page_offset)
}

/// Collects `(id, offset)` pairs in id order and writes a [`NumericIndex`] file.
#[derive(Debug)]
pub struct NumericIndexBuilder {
    page_size: u32,
    entries: Vec<IndexEntry>,
}

impl NumericIndexBuilder {
    /// # Errors
    ///
    /// Fails if the page size is smaller than 2.
    pub fn new(page_size: u32) -> Result<Self, NumericIndexError> {
        if page_size < 2 {
            return Err(NumericIndexError::InvalidPageSize(page_size));
        }
        Ok(Self {
            page_size,
            entries: Vec::new(),
        })
    }

    /// Adds the next entry.
    ///
    /// # Errors
    ///
    /// Fails unless `id` is strictly larger than the previously added id.
    pub fn add(&mut self, id: u64, offset: u64) -> Result<(), NumericIndexError> {
        if let Some(previous) = self.entries.last() {
            if previous.id >= id {
                return Err(NumericIndexError::UnsortedIds {
                    previous: previous.id,
                    id,
                });
            }
        }
        self.entries.push(IndexEntry { id, offset });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of levels needed so that a single root page covers all entries.
    pub fn levels(&self) -> u32 {
        if self.entries.is_empty() {
            return 0;
        }
        let page_size = self.page_size as usize;
        let mut levels = 1;
        let mut count = self.entries.len();
        while count > page_size {
            count = count.div_ceil(page_size);
            levels += 1;
        }
        levels
    }

    /// Writes the index to `path`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), NumericIndexError> {
        let levels = self.levels();
        let mut writer = FileWriter::create(path)?;

        writer.write_varint_u32(levels)?;
        writer.write_varint_u32(self.page_size)?;
        writer.write_u64(self.entries.len() as u64)?;
        let root_offset_pos = writer.pos();
        writer.write_file_offset(0)?;

        let mut root_offset = 0;
        let mut current = self.entries.clone();
        for level in 0..levels {
            if level + 1 == levels {
                root_offset = write_page(&mut writer, &current)?;
                break;
            }

            let mut parents = Vec::with_capacity(current.len().div_ceil(self.page_size as usize));
            for chunk in current.chunks(self.page_size as usize) {
                let page_offset = write_page(&mut writer, chunk)?;
                if let Some(first) = chunk.first() {
                    parents.push(IndexEntry {
                        id: first.id,
                        offset: page_offset,
                    });
                }
            }
            current = parents;
        }

        writer.set_pos(root_offset_pos)?;
        writer.write_file_offset(root_offset)?;
        writer.close()?;

        debug!(
            filename = writer.filename(),
            levels,
            entries = self.entries.len(),
            "Wrote numeric index"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(4).unwrap();

    /// Sparse ids with random gaps and arbitrary (not monotonic) offsets.
    fn sparse_entries(seed: u64, count: usize) -> BTreeMap<u64, u64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut id = rng.random_range(0..1_000);
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            entries.insert(id, rng.random_range(0..u64::from(u32::MAX)));
            id += rng.random_range(1..10_000);
        }
        entries
    }

    fn build(dir: &TempDir, page_size: u32, entries: &BTreeMap<u64, u64>) -> std::path::PathBuf {
        let path = dir.path().join(format!("test-{page_size}-{}.idx", entries.len()));
        let mut builder = NumericIndexBuilder::new(page_size).unwrap();
        for (id, offset) in entries {
            builder.add(*id, *offset).unwrap();
        }
        builder.write(&path).unwrap();
        path
    }

    #[test]
    fn every_inserted_id_is_found_and_nothing_else() {
        let dir = TempDir::new().unwrap();
        for (seed, (page_size, count)) in [(2, 1), (2, 2), (2, 3), (3, 100), (16, 1_000), (64, 5_000)]
            .into_iter()
            .enumerate()
        {
            let entries = sparse_entries(seed as u64, count);
            let path = build(&dir, page_size, &entries);

            for mode in [AccessMode::Buffered, AccessMode::MemoryMapped] {
                let index = NumericIndex::open(&path, mode, CACHE_SIZE).unwrap();
                assert_eq!(index.entry_count(), count as u64);
                assert_eq!(index.page_size(), page_size);

                for (id, offset) in &entries {
                    assert_eq!(index.lookup(*id).unwrap(), Some(*offset), "id {id}");
                    // The gaps between ids must never resolve to anything
                    if !entries.contains_key(&(id + 1)) {
                        assert_eq!(index.lookup(id + 1).unwrap(), None, "id {}", id + 1);
                    }
                }

                let first = *entries.keys().next().unwrap();
                let last = *entries.keys().next_back().unwrap();
                if first > 0 {
                    assert_eq!(index.lookup(first - 1).unwrap(), None);
                }
                assert_eq!(index.lookup(last + 1).unwrap(), None);
                assert_eq!(index.lookup(u64::MAX).unwrap(), None);
            }
        }
    }

    #[test]
    fn level_count_is_logarithmic() {
        let dir = TempDir::new().unwrap();
        let entries: BTreeMap<u64, u64> = (0..1_000u64).map(|i| (i * 3, i * 100)).collect();
        let path = build(&dir, 10, &entries);

        let index = NumericIndex::open(&path, AccessMode::MemoryMapped, CACHE_SIZE).unwrap();
        // 1000 leaves -> 100 pages -> 10 pages -> 1 root page
        assert_eq!(index.levels(), 3);
        assert_eq!(index.statistics().len(), 2);
    }

    #[test]
    fn empty_index() {
        let dir = TempDir::new().unwrap();
        let path = build(&dir, 8, &BTreeMap::new());
        let index = NumericIndex::open(&path, AccessMode::Buffered, CACHE_SIZE).unwrap();
        assert_eq!(index.levels(), 0);
        assert_eq!(index.lookup(0).unwrap(), None);
        assert!(index.lookup_many(&[1, 2, 3]).unwrap().is_empty());
    }

    #[test]
    fn page_caches_are_bounded() {
        let dir = TempDir::new().unwrap();
        let entries: BTreeMap<u64, u64> = (0..500u64).map(|i| (i, i)).collect();
        let path = build(&dir, 4, &entries);
        let index = NumericIndex::open(&path, AccessMode::Buffered, CACHE_SIZE).unwrap();

        for id in 0..500 {
            assert_eq!(index.lookup(id).unwrap(), Some(id));
        }
        for stats in index.statistics() {
            assert!(stats.cached_pages <= CACHE_SIZE.get());
            assert_eq!(stats.capacity, CACHE_SIZE.get());
        }
    }

    #[test]
    fn lookup_many_skips_missing_ids() {
        let dir = TempDir::new().unwrap();
        let entries: BTreeMap<u64, u64> = [(10, 1), (20, 2), (30, 3)].into();
        let path = build(&dir, 2, &entries);
        let index = NumericIndex::open(&path, AccessMode::MemoryMapped, CACHE_SIZE).unwrap();

        assert_eq!(
            index.lookup_many(&[30, 15, 10, 30]).unwrap(),
            vec![(10, 1), (30, 3)]
        );
    }

    #[test]
    fn builder_rejects_unsorted_and_duplicate_ids() {
        let mut builder = NumericIndexBuilder::new(4).unwrap();
        builder.add(5, 0).unwrap();
        assert!(matches!(
            builder.add(5, 1),
            Err(NumericIndexError::UnsortedIds { previous: 5, id: 5 })
        ));
        assert!(matches!(
            builder.add(4, 1),
            Err(NumericIndexError::UnsortedIds { previous: 5, id: 4 })
        ));
        assert!(matches!(
            NumericIndexBuilder::new(1),
            Err(NumericIndexError::InvalidPageSize(1))
        ));
    }

    #[test]
    fn closed_index_fails_lookups() {
        let dir = TempDir::new().unwrap();
        let entries: BTreeMap<u64, u64> = [(1, 1)].into();
        let path = build(&dir, 2, &entries);
        let index = NumericIndex::open(&path, AccessMode::Buffered, CACHE_SIZE).unwrap();
        assert!(index.is_open());
        index.close().unwrap();
        index.close().unwrap();
        assert!(!index.is_open());
        assert!(matches!(index.lookup(1), Err(NumericIndexError::NotOpen(_))));
    }

    #[test]
    fn truncated_file_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let entries: BTreeMap<u64, u64> = (0..100u64).map(|i| (i, i)).collect();
        let path = build(&dir, 4, &entries);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        // The root page lives at the end, so it can no longer be read
        assert!(NumericIndex::open(&path, AccessMode::Buffered, CACHE_SIZE).is_err());
    }

    #[test]
    fn concurrent_lookups() {
        let dir = TempDir::new().unwrap();
        let entries = sparse_entries(7, 2_000);
        let path = build(&dir, 8, &entries);
        let index = NumericIndex::open(&path, AccessMode::Buffered, CACHE_SIZE).unwrap();

        std::thread::scope(|s| {
            for t in 0..4 {
                let index = &index;
                let entries = &entries;
                s.spawn(move || {
                    for (id, offset) in entries.iter().skip(t).step_by(4) {
                        assert_eq!(index.lookup(*id).unwrap(), Some(*offset));
                    }
                });
            }
        });
    }
}
