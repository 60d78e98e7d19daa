//! # Spatial bounding box index
//!
//! Answers "which records of these types may intersect this box" with a set of record offsets.
//! This is a broad-phase filter only; callers do exact geometry checks themselves.
//!
//! Each type is stored in one of several representations, chosen at build time by density:
//!
//! * **Flat list**: one list of `(box, offset)` entries sorted by the southern edge of the box.
//!   Good for sparse types.
//! * **Tiled lists**: entries are partitioned into the tiles of a fixed grid level.
//!   Each tile has its own small list. If every entry lies completely inside its tile,
//!   the boxes are left out and the tile itself acts as the filter.
//! * **Bitmap tiles**: for dense tiles, a grid of fixed width cell pointers
//!   at a finer level, each pointing at a list of offsets.
//!   An empty cell costs only its pointer, and finding a cell needs no scan.
//!
//! A complex (non-flat) type may mix list and bitmap tiles.
//!
//! ## File layout
//!
//! ```text
//! grid_level          : u32
//! type_count          : u16
//! per type            : type id (varint), is_complex (bool), min coord, max coord
//!                       if !is_complex: list offset (u64), entry count (u32)
//! list_tile_count     : u32
//! per list tile       : type id (varint), x (u32), y (u32), offset (u64), count (u32), store_box (bool)
//! bitmap_tile_count   : u32
//! per bitmap tile     : type id (varint), x (u32), y (u32), offset (u64), cell_bytes (u8), cell_level (u8)
//! data...
//! ```
//!
//! List entries are an optional box (min coord, max coord) followed by the record offset
//! as a zig-zag varint delta against the previous entry.
//! A bitmap is `cells * cells` pointers of `cell_bytes` each (row-major, south to north).
//! A zero pointer is an empty cell; otherwise it is 1 + the offset of the cell data
//! relative to the end of the bitmap. Cell data is a count (varint) followed by delta-coded offsets,
//! stored in the same order as the cells.

use crate::codec::{AccessMode, CodecError, FileScanner, FileWriter, Snap, bytes_needed_for_offset};
use crate::tile_key::{MAX_TILE_LEVEL, TileKey, TileKeyRange};
use crate::{GeoBox, TypeId};
use integer_encoding::VarInt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Queries slower than this are logged.
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(100);

/// The maximum difference between a bitmap's cell level and the grid level (256x256 cells).
pub const MAX_BITMAP_DEPTH: u8 = 8;

#[derive(Debug, Error)]
pub enum SpatialIndexError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Corrupt spatial index '{filename}': {reason}")]
    Corrupt { filename: String, reason: String },
    #[error("Cannot index an invalid bounding box (type {type_id}, offset {offset})")]
    InvalidBox { type_id: TypeId, offset: u64 },
    #[error("Invalid grid level {0}")]
    InvalidGridLevel(u8),
    #[error("Invalid bitmap cell level {cell_level} for grid level {grid_level}")]
    InvalidCellLevel { grid_level: u8, cell_level: u8 },
    #[error("Too many {0} for the file format")]
    TooMany(&'static str),
    #[error("Lock is poisoned: {0}")]
    PoisonedLock(String),
}

/// How the entries of one type are laid out on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Representation {
    /// A single list for the whole type.
    Flat,
    /// One list per grid tile.
    Tiled,
    /// One bitmap per grid tile with cells at `cell_level`.
    Bitmap { cell_level: u8 },
    /// Decided by density (see [`SpatialIndexBuilder`]).
    #[default]
    Auto,
}

/// The result of [`SpatialIndex::get_offsets`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpatialQueryResult {
    /// Sorted, deduplicated record offsets.
    pub offsets: Vec<u64>,
    /// The requested types which the index holds (and thus answered for), sorted.
    pub loaded_types: Vec<TypeId>,
}

/// What the index stores for a type; mostly useful for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TypeLayout {
    /// Number of entries in the flat list, if the type has one.
    pub flat_entries: Option<u32>,
    pub list_tiles: usize,
    pub bitmap_tiles: usize,
}

#[derive(Clone, Copy, Debug)]
struct ListRef {
    offset: u64,
    count: u32,
    store_box: bool,
}

#[derive(Clone, Copy, Debug)]
enum TileRef {
    List(ListRef),
    Bitmap {
        offset: u64,
        cell_bytes: u8,
        cell_level: u8,
    },
}

#[derive(Debug)]
struct TypeData {
    bbox: GeoBox,
    flat: Option<ListRef>,
    tiles: HashMap<(u32, u32), TileRef>,
}

/// A read-only spatial index.
///
/// All reads share one file handle, so each list read (and each bitmap row) happens
/// under a single lock acquisition.
pub struct SpatialIndex {
    filename: String,
    grid_level: u8,
    types: BTreeMap<TypeId, TypeData>,
    scanner: Mutex<FileScanner>,
}

impl SpatialIndex {
    /// Opens an index file and reads its (in-memory) header.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be read or the header is inconsistent.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<Self, SpatialIndexError> {
        let mut scanner = FileScanner::open(path, mode)?;
        let filename = scanner.filename().to_string();

        let grid_level = scanner.read_u32()?;
        let grid_level = u8::try_from(grid_level)
            .ok()
            .filter(|level| *level <= MAX_TILE_LEVEL)
            .ok_or_else(|| corrupt(&filename, format!("invalid grid level {grid_level}")))?;

        let type_count = scanner.read_u16()?;
        let mut types = BTreeMap::new();
        for _ in 0..type_count {
            let type_id = scanner.read_varint_u16()?;
            let is_complex = scanner.read_bool()?;
            let min = scanner.read_coord()?;
            let max = scanner.read_coord()?;
            let flat = if is_complex {
                None
            } else {
                let offset = scanner.read_file_offset()?;
                let count = scanner.read_u32()?;
                Some(ListRef {
                    offset,
                    count,
                    store_box: true,
                })
            };
            let bbox = if flat.is_some_and(|list| list.count == 0) {
                GeoBox::invalid()
            } else {
                GeoBox::new(min, max)
            };
            types.insert(
                type_id,
                TypeData {
                    bbox,
                    flat,
                    tiles: HashMap::new(),
                },
            );
        }

        let list_tile_count = scanner.read_u32()?;
        for _ in 0..list_tile_count {
            let type_id = scanner.read_varint_u16()?;
            let x = scanner.read_u32()?;
            let y = scanner.read_u32()?;
            let offset = scanner.read_file_offset()?;
            let count = scanner.read_u32()?;
            let store_box = scanner.read_bool()?;
            let tile = TileRef::List(ListRef {
                offset,
                count,
                store_box,
            });
            insert_tile(&filename, &mut types, grid_level, type_id, (x, y), tile)?;
        }

        let bitmap_tile_count = scanner.read_u32()?;
        for _ in 0..bitmap_tile_count {
            let type_id = scanner.read_varint_u16()?;
            let x = scanner.read_u32()?;
            let y = scanner.read_u32()?;
            let offset = scanner.read_file_offset()?;
            let cell_bytes = scanner.read_u8()?;
            let cell_level = scanner.read_u8()?;
            if !matches!(cell_bytes, 1 | 2 | 4 | 8) {
                return Err(corrupt(&filename, format!("invalid cell width {cell_bytes}")));
            }
            if cell_level <= grid_level || cell_level - grid_level > MAX_BITMAP_DEPTH {
                return Err(corrupt(&filename, format!("invalid cell level {cell_level}")));
            }
            let tile = TileRef::Bitmap {
                offset,
                cell_bytes,
                cell_level,
            };
            insert_tile(&filename, &mut types, grid_level, type_id, (x, y), tile)?;
        }

        debug!(
            filename,
            grid_level,
            types = types.len(),
            list_tile_count,
            bitmap_tile_count,
            "Opened spatial index"
        );

        Ok(Self {
            filename,
            grid_level,
            types,
            scanner: Mutex::new(scanner),
        })
    }

    /// Closes the underlying file. Queries fail afterwards.
    pub fn close(&self) {
        if let Ok(mut scanner) = self.scanner.lock() {
            scanner.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.scanner.lock().is_ok_and(|scanner| scanner.is_open())
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn grid_level(&self) -> u8 {
        self.grid_level
    }

    /// All indexed types, sorted.
    pub fn types(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.types.keys().copied()
    }

    /// The bounding box of all entries of a type (invalid if it has none).
    pub fn type_bounding_box(&self, type_id: TypeId) -> Option<GeoBox> {
        self.types.get(&type_id).map(|data| data.bbox)
    }

    pub fn layout(&self, type_id: TypeId) -> Option<TypeLayout> {
        self.types.get(&type_id).map(|data| {
            let bitmap_tiles = data
                .tiles
                .values()
                .filter(|tile| matches!(tile, TileRef::Bitmap { .. }))
                .count();
            TypeLayout {
                flat_entries: data.flat.map(|list| list.count),
                list_tiles: data.tiles.len() - bitmap_tiles,
                bitmap_tiles,
            }
        })
    }

    /// Collects the offsets of all records of the given types which may intersect `bbox`.
    ///
    /// # Errors
    ///
    /// Any read failure aborts the whole query.
    /// The in-memory header is unaffected, but the shared file handle
    /// stays in its error state (see [`FileScanner`]).
    pub fn get_offsets(
        &self,
        bbox: &GeoBox,
        types: &[TypeId],
    ) -> Result<SpatialQueryResult, SpatialIndexError> {
        let start = Instant::now();
        let requested: BTreeSet<TypeId> = types.iter().copied().collect();

        let mut result = SpatialQueryResult::default();
        for type_id in requested {
            let Some(data) = self.types.get(&type_id) else {
                continue;
            };
            result.loaded_types.push(type_id);

            let query = data.bbox.intersection(bbox);
            if !query.is_valid() {
                continue;
            }

            if let Some(list) = data.flat {
                self.read_flat_list(list, &query, &mut result.offsets)?;
            } else {
                self.read_tiles(data, &query, &mut result.offsets)?;
            }
        }

        result.offsets.sort_unstable();
        result.offsets.dedup();

        let elapsed = start.elapsed();
        if elapsed > SLOW_QUERY_THRESHOLD {
            warn!(
                filename = self.filename,
                offsets = result.offsets.len(),
                ?elapsed,
                "Slow spatial index query for {bbox:?}"
            );
        }

        Ok(result)
    }

    fn read_flat_list(
        &self,
        list: ListRef,
        bbox: &GeoBox,
        offsets: &mut Vec<u64>,
    ) -> Result<(), SpatialIndexError> {
        let mut scanner = self.lock_scanner()?;
        scanner.set_pos(list.offset)?;

        let mut previous = 0u64;
        for _ in 0..list.count {
            let entry_box = GeoBox::new(scanner.read_coord()?, scanner.read_coord()?);
            previous = previous.wrapping_add_signed(scanner.read_varint_i64()?);
            if entry_box.min_lat() > bbox.max_lat() {
                // Sorted by southern edge, so nothing further can intersect
                break;
            }
            if entry_box.intersects(bbox) {
                offsets.push(previous);
            }
        }
        Ok(())
    }

    fn read_tiles(
        &self,
        data: &TypeData,
        bbox: &GeoBox,
        offsets: &mut Vec<u64>,
    ) -> Result<(), SpatialIndexError> {
        let Some(range) = TileKeyRange::covering(self.grid_level, bbox) else {
            return Ok(());
        };

        // Visit whichever is smaller: the query range or the stored tiles
        let mut tiles: Vec<((u32, u32), TileRef)> = if range.len() <= data.tiles.len() {
            range
                .iter()
                .filter_map(|key| {
                    let xy = (key.x(), key.y());
                    data.tiles.get(&xy).map(|tile| (xy, *tile))
                })
                .collect()
        } else {
            data.tiles
                .iter()
                .filter(|((x, y), _)| range.contains(*x, *y))
                .map(|(xy, tile)| (*xy, *tile))
                .collect()
        };
        // Keep file access roughly sequential and the output deterministic
        tiles.sort_unstable_by_key(|((x, y), _)| (*y, *x));

        for ((x, y), tile) in tiles {
            match tile {
                TileRef::List(list) => self.read_tile_list(list, bbox, offsets)?,
                TileRef::Bitmap {
                    offset,
                    cell_bytes,
                    cell_level,
                } => {
                    let bitmap = BitmapGeometry::new(self.grid_level, cell_level, x, y);
                    self.read_bitmap(&bitmap, offset, cell_bytes, bbox, offsets)?;
                }
            }
        }
        Ok(())
    }

    fn read_tile_list(
        &self,
        list: ListRef,
        bbox: &GeoBox,
        offsets: &mut Vec<u64>,
    ) -> Result<(), SpatialIndexError> {
        let mut scanner = self.lock_scanner()?;
        scanner.set_pos(list.offset)?;

        let mut previous = 0u64;
        for _ in 0..list.count {
            let entry_box = if list.store_box {
                Some(GeoBox::new(scanner.read_coord()?, scanner.read_coord()?))
            } else {
                None
            };
            previous = previous.wrapping_add_signed(scanner.read_varint_i64()?);
            if entry_box.is_none_or(|entry_box| entry_box.intersects(bbox)) {
                offsets.push(previous);
            }
        }
        Ok(())
    }

    fn read_bitmap(
        &self,
        bitmap: &BitmapGeometry,
        offset: u64,
        cell_bytes: u8,
        bbox: &GeoBox,
        offsets: &mut Vec<u64>,
    ) -> Result<(), SpatialIndexError> {
        let (min_x, max_x, min_y, max_y) = bitmap.cell_range(bbox);
        let width = u64::from(cell_bytes);
        let cells = u64::from(bitmap.cells);
        let data_start = offset
            .checked_add(cells * cells * width)
            .ok_or_else(|| corrupt(&self.filename, format!("bitmap offset {offset} out of range")))?;

        for y in min_y..=max_y {
            let mut scanner = self.lock_scanner()?;
            scanner.set_pos(offset + (u64::from(y) * cells + u64::from(min_x)) * width)?;

            let mut first_data = None;
            let mut non_empty = 0;
            for _ in min_x..=max_x {
                let pointer = scanner.read_file_offset_sized(cell_bytes)?;
                if pointer != 0 {
                    if first_data.is_none() {
                        let start = data_start.checked_add(pointer - 1).ok_or_else(|| {
                            corrupt(&self.filename, format!("cell pointer {pointer} out of range"))
                        })?;
                        first_data = Some(start);
                    }
                    non_empty += 1;
                }
            }

            // Data of consecutive non-empty cells is stored back to back
            let Some(first_data) = first_data else {
                continue;
            };
            scanner.set_pos(first_data)?;
            for _ in 0..non_empty {
                let count = scanner.read_varint_u32()?;
                let mut previous = 0u64;
                for _ in 0..count {
                    previous = previous.wrapping_add_signed(scanner.read_varint_i64()?);
                    offsets.push(previous);
                }
            }
        }
        Ok(())
    }

    fn lock_scanner(&self) -> Result<MutexGuard<'_, FileScanner>, SpatialIndexError> {
        self.scanner
            .lock()
            .map_err(|e| SpatialIndexError::PoisonedLock(e.to_string()))
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("filename", &self.filename)
            .field("grid_level", &self.grid_level)
            .field("types", &self.types.len())
            .finish_non_exhaustive()
    }
}

fn corrupt(filename: &str, reason: String) -> SpatialIndexError {
    tracing::error!(filename, "Corrupt spatial index: {reason}");
    SpatialIndexError::Corrupt {
        filename: filename.to_string(),
        reason,
    }
}

fn insert_tile(
    filename: &str,
    types: &mut BTreeMap<TypeId, TypeData>,
    grid_level: u8,
    type_id: TypeId,
    xy: (u32, u32),
    tile: TileRef,
) -> Result<(), SpatialIndexError> {
    if TileKey::try_new(grid_level, xy.0, xy.1).is_err() {
        return Err(corrupt(filename, format!("tile {xy:?} outside of grid level {grid_level}")));
    }
    match types.get_mut(&type_id) {
        Some(data) if data.flat.is_none() => {
            data.tiles.insert(xy, tile);
            Ok(())
        }
        _ => Err(corrupt(
            filename,
            format!("tile {xy:?} for unknown or flat type {type_id}"),
        )),
    }
}

/// Maps boxes to the cells of one bitmap tile.
struct BitmapGeometry {
    cell_level: u8,
    /// Cells per side.
    cells: u32,
    /// Global index of the tile's first column/row at the cell level.
    base_x: u32,
    base_y: u32,
}

impl BitmapGeometry {
    fn new(grid_level: u8, cell_level: u8, tile_x: u32, tile_y: u32) -> Self {
        let depth = cell_level - grid_level;
        Self {
            cell_level,
            cells: 1 << depth,
            base_x: tile_x << depth,
            base_y: tile_y << depth,
        }
    }

    /// The inclusive local `(min_x, max_x, min_y, max_y)` cell range covering `bbox`,
    /// clamped to this tile.
    fn cell_range(&self, bbox: &GeoBox) -> (u32, u32, u32, u32) {
        let min = TileKey::for_coord(self.cell_level, bbox.min());
        let max = TileKey::for_coord(self.cell_level, bbox.max());
        let last = self.cells - 1;
        (
            min.x().saturating_sub(self.base_x).min(last),
            max.x().saturating_sub(self.base_x).min(last),
            min.y().saturating_sub(self.base_y).min(last),
            max.y().saturating_sub(self.base_y).min(last),
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct BuildEntry {
    bbox: GeoBox,
    offset: u64,
}

#[derive(Debug, Default)]
struct BuildType {
    representation: Representation,
    entries: Vec<BuildEntry>,
}

/// Collects `(type, box, offset)` triples and writes a [`SpatialIndex`] file.
///
/// With [`Representation::Auto`], types with fewer than `flat_list_limit` entries
/// become a flat list. Otherwise the type is tiled, and each tile holding more than
/// `bitmap_tile_limit` entries is written as a bitmap with cells
/// [`AUTO_BITMAP_DEPTH`](Self::AUTO_BITMAP_DEPTH) levels below the grid.
#[derive(Debug)]
pub struct SpatialIndexBuilder {
    grid_level: u8,
    flat_list_limit: usize,
    bitmap_tile_limit: usize,
    types: BTreeMap<TypeId, BuildType>,
}

impl SpatialIndexBuilder {
    pub const DEFAULT_GRID_LEVEL: u8 = 14;
    pub const DEFAULT_FLAT_LIST_LIMIT: usize = 64;
    pub const DEFAULT_BITMAP_TILE_LIMIT: usize = 256;
    pub const AUTO_BITMAP_DEPTH: u8 = 3;

    /// # Errors
    ///
    /// Fails if `grid_level` is deeper than [`MAX_TILE_LEVEL`].
    pub fn new(grid_level: u8) -> Result<Self, SpatialIndexError> {
        if grid_level > MAX_TILE_LEVEL {
            return Err(SpatialIndexError::InvalidGridLevel(grid_level));
        }
        Ok(Self {
            grid_level,
            flat_list_limit: Self::DEFAULT_FLAT_LIST_LIMIT,
            bitmap_tile_limit: Self::DEFAULT_BITMAP_TILE_LIMIT,
            types: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn with_flat_list_limit(mut self, limit: usize) -> Self {
        self.flat_list_limit = limit;
        self
    }

    #[must_use]
    pub fn with_bitmap_tile_limit(mut self, limit: usize) -> Self {
        self.bitmap_tile_limit = limit;
        self
    }

    /// Forces a representation for one type.
    ///
    /// # Errors
    ///
    /// Fails for bitmap cell levels that are not below the grid level,
    /// or more than [`MAX_BITMAP_DEPTH`] levels below it.
    pub fn set_representation(
        &mut self,
        type_id: TypeId,
        representation: Representation,
    ) -> Result<(), SpatialIndexError> {
        if let Representation::Bitmap { cell_level } = representation {
            self.check_cell_level(cell_level)?;
        }
        self.types.entry(type_id).or_default().representation = representation;
        Ok(())
    }

    /// Adds a record.
    ///
    /// # Errors
    ///
    /// Fails if `bbox` is invalid.
    pub fn add(&mut self, type_id: TypeId, bbox: GeoBox, offset: u64) -> Result<(), SpatialIndexError> {
        if !bbox.is_valid() {
            return Err(SpatialIndexError::InvalidBox { type_id, offset });
        }
        self.types
            .entry(type_id)
            .or_default()
            .entries
            .push(BuildEntry { bbox, offset });
        Ok(())
    }

    fn check_cell_level(&self, cell_level: u8) -> Result<(), SpatialIndexError> {
        if cell_level <= self.grid_level
            || cell_level > MAX_TILE_LEVEL
            || cell_level - self.grid_level > MAX_BITMAP_DEPTH
        {
            Err(SpatialIndexError::InvalidCellLevel {
                grid_level: self.grid_level,
                cell_level,
            })
        } else {
            Ok(())
        }
    }

    /// Writes the index to `path`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or if the data exceeds the limits of the format.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), SpatialIndexError> {
        let plans = self.plan()?;
        let mut writer = FileWriter::create(path)?;

        writer.write_u32(u32::from(self.grid_level))?;
        let type_count =
            u16::try_from(plans.len()).map_err(|_| SpatialIndexError::TooMany("types"))?;
        writer.write_u16(type_count)?;

        // Offsets are unknown until the data is written; remember where to patch them
        let mut patches: Vec<(u64, u64)> = Vec::new();
        let mut flat_slots = Vec::new();
        for plan in &plans {
            writer.write_varint_u16(plan.type_id)?;
            writer.write_bool(plan.flat.is_none())?;
            let (min, max) = if plan.bbox.is_valid() {
                (plan.bbox.min(), plan.bbox.max())
            } else {
                (geo::coord! { x: 0.0, y: 0.0 }, geo::coord! { x: 0.0, y: 0.0 })
            };
            writer.write_coord_snapped(min, Snap::Down)?;
            writer.write_coord_snapped(max, Snap::Up)?;
            if let Some(entries) = &plan.flat {
                flat_slots.push((writer.pos(), entries));
                writer.write_file_offset(0)?;
                writer.write_u32(count_u32(entries.len())?)?;
            }
        }

        let list_tiles: Vec<_> = plans
            .iter()
            .flat_map(|plan| plan.list_tiles.iter().map(move |tile| (plan.type_id, tile)))
            .collect();
        writer.write_u32(count_u32(list_tiles.len())?)?;
        let mut list_slots = Vec::new();
        for (type_id, tile) in &list_tiles {
            writer.write_varint_u16(*type_id)?;
            writer.write_u32(tile.x)?;
            writer.write_u32(tile.y)?;
            list_slots.push((writer.pos(), *tile));
            writer.write_file_offset(0)?;
            writer.write_u32(count_u32(tile.entries.len())?)?;
            writer.write_bool(tile.store_box)?;
        }

        let bitmap_tiles: Vec<_> = plans
            .iter()
            .flat_map(|plan| plan.bitmap_tiles.iter().map(move |tile| (plan.type_id, tile)))
            .collect();
        writer.write_u32(count_u32(bitmap_tiles.len())?)?;
        let mut bitmap_slots = Vec::new();
        for (type_id, tile) in &bitmap_tiles {
            writer.write_varint_u16(*type_id)?;
            writer.write_u32(tile.x)?;
            writer.write_u32(tile.y)?;
            bitmap_slots.push((writer.pos(), *tile));
            writer.write_file_offset(0)?;
            writer.write_u8(tile.cell_bytes)?;
            writer.write_u8(tile.cell_level)?;
        }

        for (slot, entries) in flat_slots {
            patches.push((slot, writer.pos()));
            write_list(&mut writer, entries, true)?;
        }
        for (slot, tile) in list_slots {
            patches.push((slot, writer.pos()));
            write_list(&mut writer, &tile.entries, tile.store_box)?;
        }
        for (slot, tile) in bitmap_slots {
            patches.push((slot, writer.pos()));
            for pointer in &tile.pointers {
                writer.write_file_offset_sized(*pointer, tile.cell_bytes)?;
            }
            writer.write_bytes(&tile.data)?;
        }

        for (slot, offset) in patches {
            writer.set_pos(slot)?;
            writer.write_file_offset(offset)?;
        }
        writer.close()?;

        debug!(
            filename = writer.filename(),
            types = plans.len(),
            list_tiles = list_tiles.len(),
            bitmap_tiles = bitmap_tiles.len(),
            "Wrote spatial index"
        );
        Ok(())
    }

    /// Decides the layout of every type.
    fn plan(&self) -> Result<Vec<TypePlan>, SpatialIndexError> {
        let mut plans = Vec::with_capacity(self.types.len());
        for (type_id, build) in &self.types {
            let bbox = GeoBox::from_coords(
                build
                    .entries
                    .iter()
                    .flat_map(|entry| [entry.bbox.min(), entry.bbox.max()]),
            );
            let mut plan = TypePlan {
                type_id: *type_id,
                bbox,
                flat: None,
                list_tiles: Vec::new(),
                bitmap_tiles: Vec::new(),
            };

            let is_flat = build.entries.is_empty()
                || match build.representation {
                    Representation::Flat => true,
                    Representation::Auto => build.entries.len() < self.flat_list_limit,
                    Representation::Tiled | Representation::Bitmap { .. } => false,
                };
            if is_flat {
                let mut entries = build.entries.clone();
                entries.sort_by(|a, b| {
                    a.bbox
                        .min_lat()
                        .total_cmp(&b.bbox.min_lat())
                        .then(a.bbox.min_lon().total_cmp(&b.bbox.min_lon()))
                        .then(a.offset.cmp(&b.offset))
                });
                plan.flat = Some(entries);
                plans.push(plan);
                continue;
            }

            for (key, mut entries) in self.partition(&build.entries) {
                entries.sort_unstable_by_key(|entry| entry.offset);
                let cell_level = match build.representation {
                    Representation::Bitmap { cell_level } => Some(cell_level),
                    Representation::Auto if entries.len() > self.bitmap_tile_limit => Some(
                        (self.grid_level + Self::AUTO_BITMAP_DEPTH).min(MAX_TILE_LEVEL),
                    ),
                    _ => None,
                };

                match cell_level {
                    Some(cell_level) if cell_level > self.grid_level => {
                        plan.bitmap_tiles
                            .push(BitmapPlan::new(self.grid_level, cell_level, key, &entries)?);
                    }
                    _ => {
                        let tile_box = key.bounding_box();
                        let store_box = !entries
                            .iter()
                            .all(|entry| tile_box.contains_box(&entry.bbox));
                        plan.list_tiles.push(ListTilePlan {
                            x: key.x(),
                            y: key.y(),
                            store_box,
                            entries,
                        });
                    }
                }
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Assigns each entry to every grid tile its box touches.
    fn partition(&self, entries: &[BuildEntry]) -> BTreeMap<TileKey, Vec<BuildEntry>> {
        let mut tiles: BTreeMap<TileKey, Vec<BuildEntry>> = BTreeMap::new();
        for entry in entries {
            if let Some(range) = TileKeyRange::covering(self.grid_level, &entry.bbox) {
                for key in range.iter() {
                    tiles.entry(key).or_default().push(*entry);
                }
            }
        }
        tiles
    }
}

struct TypePlan {
    type_id: TypeId,
    bbox: GeoBox,
    flat: Option<Vec<BuildEntry>>,
    list_tiles: Vec<ListTilePlan>,
    bitmap_tiles: Vec<BitmapPlan>,
}

struct ListTilePlan {
    x: u32,
    y: u32,
    store_box: bool,
    entries: Vec<BuildEntry>,
}

struct BitmapPlan {
    x: u32,
    y: u32,
    cell_level: u8,
    cell_bytes: u8,
    pointers: Vec<u64>,
    data: Vec<u8>,
}

impl BitmapPlan {
    fn new(
        grid_level: u8,
        cell_level: u8,
        key: TileKey,
        entries: &[BuildEntry],
    ) -> Result<Self, SpatialIndexError> {
        let geometry = BitmapGeometry::new(grid_level, cell_level, key.x(), key.y());
        let cells = geometry.cells as usize;

        let mut cell_offsets: Vec<Vec<u64>> = vec![Vec::new(); cells * cells];
        for entry in entries {
            let (min_x, max_x, min_y, max_y) = geometry.cell_range(&entry.bbox);
            for y in min_y..=max_y {
                for x in min_x..=max_x {
                    if let Some(cell) = cell_offsets.get_mut(y as usize * cells + x as usize) {
                        cell.push(entry.offset);
                    }
                }
            }
        }

        let mut pointers = Vec::with_capacity(cell_offsets.len());
        let mut data = Vec::new();
        for offsets in &mut cell_offsets {
            if offsets.is_empty() {
                pointers.push(0);
                continue;
            }
            offsets.sort_unstable();
            offsets.dedup();
            pointers.push(data.len() as u64 + 1);
            data.extend(count_u32(offsets.len())?.encode_var_vec());
            let mut previous = 0u64;
            for offset in offsets.iter() {
                #[expect(clippy::cast_possible_wrap)]
                let delta = offset.wrapping_sub(previous) as i64;
                data.extend(delta.encode_var_vec());
                previous = *offset;
            }
        }

        let max_pointer = pointers.iter().copied().max().unwrap_or(0);
        let cell_bytes = bytes_needed_for_offset(max_pointer).next_power_of_two();

        Ok(Self {
            x: key.x(),
            y: key.y(),
            cell_level,
            cell_bytes,
            pointers,
            data,
        })
    }
}

fn count_u32(count: usize) -> Result<u32, SpatialIndexError> {
    u32::try_from(count).map_err(|_| SpatialIndexError::TooMany("entries"))
}

fn write_list(
    writer: &mut FileWriter,
    entries: &[BuildEntry],
    store_box: bool,
) -> Result<(), CodecError> {
    let mut previous = 0u64;
    for entry in entries {
        if store_box {
            writer.write_coord_snapped(entry.bbox.min(), Snap::Down)?;
            writer.write_coord_snapped(entry.bbox.max(), Snap::Up)?;
        }
        #[expect(clippy::cast_possible_wrap)]
        let delta = entry.offset.wrapping_sub(previous) as i64;
        writer.write_varint_i64(delta)?;
        previous = entry.offset;
    }
    Ok(())
}
