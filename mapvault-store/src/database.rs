//! # Database
//!
//! A database is a directory of data files and their indices,
//! opened together and shared by all queries through one [`Database`] value.
//!
//! | File                             | Content                              |
//! |----------------------------------|--------------------------------------|
//! | `nodes.dat` / `nodes.sidx`       | [`Node`] records and spatial index   |
//! | `ways.dat` / `ways.sidx`         | [`Way`] records and spatial index    |
//! | `areas.dat` / `areas.sidx`       | [`Area`] records and spatial index   |
//! | `ways_opt.dat` / `.sidx`         | simplified ways for low zoom levels  |
//! | `areas_opt.dat` / `.sidx`        | simplified areas for low zoom levels |
//! | `router.dat` / `.idx` / `.sidx`  | the [`RouteGraph`]                   |
//!
//! Every pair is optional; missing ones are skipped.

use crate::codec::AccessMode;
use crate::data_file::{DataFile, DataFileError, Record};
use crate::feature::{Area, MapObject, Node, Way};
use crate::route_graph::{ROUTER_DATA, RouteGraph, RouteGraphError};
use crate::spatial_index::{SpatialIndex, SpatialIndexError};
use crate::tile_cache::{Tile, TileCache, TileCacheError, TileData, TypeSelection, TypeSet};
use crate::tile_key::TileKey;
use crate::GeoBox;
use dashmap::DashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

pub const NODES_DATA: &str = "nodes.dat";
pub const NODES_INDEX: &str = "nodes.sidx";
pub const WAYS_DATA: &str = "ways.dat";
pub const WAYS_INDEX: &str = "ways.sidx";
pub const AREAS_DATA: &str = "areas.dat";
pub const AREAS_INDEX: &str = "areas.sidx";
pub const OPTIMIZED_WAYS_DATA: &str = "ways_opt.dat";
pub const OPTIMIZED_WAYS_INDEX: &str = "ways_opt.sidx";
pub const OPTIMIZED_AREAS_DATA: &str = "areas_opt.dat";
pub const OPTIMIZED_AREAS_INDEX: &str = "areas_opt.sidx";

const DEFAULT_INDEX_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1_000).unwrap();
const DEFAULT_ROUTE_NODE_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(10_000).unwrap();
const DEFAULT_TILE_CACHE_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("Database '{}' is closed", .0.display())]
    Closed(PathBuf),
    #[error(transparent)]
    DataFile(#[from] DataFileError),
    #[error(transparent)]
    SpatialIndex(#[from] SpatialIndexError),
    #[error(transparent)]
    RouteGraph(#[from] RouteGraphError),
    #[error(transparent)]
    TileCache(#[from] TileCacheError),
    #[error("Lock is poisoned: {0}")]
    PoisonedLock(String),
}

/// Tuning knobs for a [`Database`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DatabaseParameter {
    pub access_mode: AccessMode,
    /// Pages cached per level of each numeric index.
    pub index_cache_size: NonZeroUsize,
    pub route_node_cache_size: NonZeroUsize,
    /// Target number of cached tiles.
    pub tile_cache_size: usize,
}

impl Default for DatabaseParameter {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::default(),
            index_cache_size: DEFAULT_INDEX_CACHE_SIZE,
            route_node_cache_size: DEFAULT_ROUTE_NODE_CACHE_SIZE,
            tile_cache_size: DEFAULT_TILE_CACHE_SIZE,
        }
    }
}

/// Per-key mutexes that serialise concurrent loads of the same tile.
///
/// An entry only lives while a load holds or waits for it.
pub(crate) struct LoadLocks<K>(DashMap<K, Arc<Mutex<()>>>);

impl<K: std::hash::Hash + Eq + Clone> LoadLocks<K> {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    /// Runs `load` while holding the lock for `key`.
    pub fn run<T>(
        &self,
        key: &K,
        load: impl FnOnce() -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let lock = self
            .0
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = lock
            .lock()
            .map_err(|e| DatabaseError::PoisonedLock(e.to_string()))
            .and_then(|_guard| load());
        drop(lock);
        // The shard lock blocks new clones, so a count of one means nobody else uses it
        self.0.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// A data file with its spatial index.
struct FeatureFiles<T: Record> {
    data: DataFile<T>,
    index: SpatialIndex,
}

impl<T: Record + MapObject> FeatureFiles<T> {
    fn open(
        directory: &Path,
        data: &str,
        index: &str,
        mode: AccessMode,
    ) -> Result<Option<Self>, DatabaseError> {
        let data_path = directory.join(data);
        let index_path = directory.join(index);
        if !data_path.is_file() || !index_path.is_file() {
            debug!(
                directory = %directory.display(),
                data,
                index,
                "Skipping missing data file"
            );
            return Ok(None);
        }

        Ok(Some(Self {
            data: DataFile::open(data_path, mode)?,
            index: SpatialIndex::open(index_path, mode)?,
        }))
    }

    fn close(&self) {
        self.data.close();
        self.index.close();
    }

    /// Loads the objects of `types` intersecting `bbox`.
    fn objects_in_box(
        &self,
        bbox: &GeoBox,
        types: &TypeSet,
    ) -> Result<Vec<Arc<T>>, DatabaseError> {
        if types.is_empty() || !bbox.is_valid() {
            return Ok(Vec::new());
        }

        let candidates = self.index.get_offsets(bbox, &types.to_vec())?;
        let mut objects = self.data.get_by_offsets(&candidates.offsets)?;
        objects.retain(|object| object.intersects(bbox));
        Ok(objects)
    }
}

struct OpenFiles {
    nodes: Option<FeatureFiles<Node>>,
    ways: Option<FeatureFiles<Way>>,
    areas: Option<FeatureFiles<Area>>,
    optimized_ways: Option<FeatureFiles<Way>>,
    optimized_areas: Option<FeatureFiles<Area>>,
    router: Option<Arc<RouteGraph>>,
}

impl OpenFiles {
    fn open(directory: &Path, parameter: &DatabaseParameter) -> Result<Self, DatabaseError> {
        if !directory.is_dir() {
            return Err(DatabaseError::NotADirectory(directory.to_path_buf()));
        }

        let mode = parameter.access_mode;
        let router = if directory.join(ROUTER_DATA).is_file() {
            Some(Arc::new(RouteGraph::open(directory, parameter)?))
        } else {
            debug!(directory = %directory.display(), "No route graph");
            None
        };

        Ok(Self {
            nodes: FeatureFiles::open(directory, NODES_DATA, NODES_INDEX, mode)?,
            ways: FeatureFiles::open(directory, WAYS_DATA, WAYS_INDEX, mode)?,
            areas: FeatureFiles::open(directory, AREAS_DATA, AREAS_INDEX, mode)?,
            optimized_ways: FeatureFiles::open(
                directory,
                OPTIMIZED_WAYS_DATA,
                OPTIMIZED_WAYS_INDEX,
                mode,
            )?,
            optimized_areas: FeatureFiles::open(
                directory,
                OPTIMIZED_AREAS_DATA,
                OPTIMIZED_AREAS_INDEX,
                mode,
            )?,
            router,
        })
    }

    fn close(&self) -> Result<(), DatabaseError> {
        if let Some(files) = &self.nodes {
            files.close();
        }
        if let Some(files) = &self.ways {
            files.close();
        }
        if let Some(files) = &self.areas {
            files.close();
        }
        if let Some(files) = &self.optimized_ways {
            files.close();
        }
        if let Some(files) = &self.optimized_areas {
            files.close();
        }
        if let Some(router) = &self.router {
            router.close()?;
        }
        Ok(())
    }
}

/// An open database directory.
///
/// Queries share the open files through a read lock;
/// [`Database::close`] and [`Database::reopen`] take the write lock,
/// so they wait for running queries.
pub struct Database {
    directory: PathBuf,
    parameter: DatabaseParameter,
    files: RwLock<Option<OpenFiles>>,
    tile_cache: TileCache,
    tile_locks: LoadLocks<TileKey>,
}

impl Database {
    /// Opens the database in `directory`.
    ///
    /// # Errors
    ///
    /// Fails if `directory` isn't a directory, or one of the present files can't be opened.
    pub fn open<P: AsRef<Path>>(
        directory: P,
        parameter: DatabaseParameter,
    ) -> Result<Self, DatabaseError> {
        let directory = directory.as_ref().to_path_buf();
        let files = OpenFiles::open(&directory, &parameter)?;
        debug!(
            directory = %directory.display(),
            nodes = files.nodes.is_some(),
            ways = files.ways.is_some(),
            areas = files.areas.is_some(),
            optimized_ways = files.optimized_ways.is_some(),
            optimized_areas = files.optimized_areas.is_some(),
            router = files.router.is_some(),
            "Opened database"
        );

        Ok(Self {
            tile_cache: TileCache::new(parameter.tile_cache_size),
            directory,
            parameter,
            files: RwLock::new(Some(files)),
            tile_locks: LoadLocks::new(),
        })
    }

    /// Closes all files. Closing a closed database does nothing.
    ///
    /// # Errors
    ///
    /// Fails if a lock is poisoned.
    pub fn close(&self) -> Result<(), DatabaseError> {
        let mut files = self
            .files
            .write()
            .map_err(|e| DatabaseError::PoisonedLock(e.to_string()))?;
        if let Some(files) = files.take() {
            files.close()?;
            self.tile_cache.invalidate()?;
            debug!(directory = %self.directory.display(), "Closed database");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.files.read().is_ok_and(|files| files.is_some())
    }

    /// Closes and opens all files again, e.g. after they were replaced.
    /// Cached tiles are invalidated.
    ///
    /// # Errors
    ///
    /// Fails if the files can't be opened; the database is closed afterwards.
    pub fn reopen(&self) -> Result<(), DatabaseError> {
        let mut files = self
            .files
            .write()
            .map_err(|e| DatabaseError::PoisonedLock(e.to_string()))?;
        if let Some(files) = files.take() {
            files.close()?;
        }
        self.tile_cache.invalidate()?;
        *files = Some(OpenFiles::open(&self.directory, &self.parameter)?);
        debug!(directory = %self.directory.display(), "Reopened database");
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn parameter(&self) -> &DatabaseParameter {
        &self.parameter
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.tile_cache
    }

    /// The routing graph, if the database has one.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed.
    pub fn route_graph(&self) -> Result<Option<Arc<RouteGraph>>, DatabaseError> {
        self.with_files(|files| Ok(files.router.clone()))
    }

    /// Nodes of the given types inside `bbox`.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    pub fn get_nodes_by_box(
        &self,
        bbox: &GeoBox,
        types: &TypeSet,
    ) -> Result<Vec<Arc<Node>>, DatabaseError> {
        self.with_files(|files| objects_in_box(files.nodes.as_ref(), bbox, types))
    }

    /// Ways of the given types whose bounding box intersects `bbox`.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    pub fn get_ways_by_box(
        &self,
        bbox: &GeoBox,
        types: &TypeSet,
    ) -> Result<Vec<Arc<Way>>, DatabaseError> {
        self.with_files(|files| objects_in_box(files.ways.as_ref(), bbox, types))
    }

    /// Areas of the given types whose bounding box intersects `bbox`.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    pub fn get_areas_by_box(
        &self,
        bbox: &GeoBox,
        types: &TypeSet,
    ) -> Result<Vec<Arc<Area>>, DatabaseError> {
        self.with_files(|files| objects_in_box(files.areas.as_ref(), bbox, types))
    }

    /// Simplified low zoom ways of the given types whose bounding box intersects `bbox`.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    pub fn get_optimized_ways_by_box(
        &self,
        bbox: &GeoBox,
        types: &TypeSet,
    ) -> Result<Vec<Arc<Way>>, DatabaseError> {
        self.with_files(|files| objects_in_box(files.optimized_ways.as_ref(), bbox, types))
    }

    /// Simplified low zoom areas of the given types whose bounding box intersects `bbox`.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    pub fn get_optimized_areas_by_box(
        &self,
        bbox: &GeoBox,
        types: &TypeSet,
    ) -> Result<Vec<Arc<Area>>, DatabaseError> {
        self.with_files(|files| objects_in_box(files.optimized_areas.as_ref(), bbox, types))
    }

    /// The types each spatial index holds.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed.
    pub fn indexed_types(&self) -> Result<TypeSelection, DatabaseError> {
        self.with_files(|files| {
            Ok(TypeSelection {
                nodes: indexed_types(files.nodes.as_ref()),
                ways: indexed_types(files.ways.as_ref()),
                areas: indexed_types(files.areas.as_ref()),
                optimized_ways: indexed_types(files.optimized_ways.as_ref()),
                optimized_areas: indexed_types(files.optimized_areas.as_ref()),
            })
        })
    }

    /// Makes sure `tile` holds all objects of the selected types intersecting its bounding box.
    ///
    /// The tile is prefilled from its cached parent first;
    /// only types still missing afterwards are read from disk.
    /// Stale data (see [`TileCache::invalidate`]) is reloaded completely.
    /// Concurrent loads of the same tile are serialized.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    /// Data loaded for other object kinds before the failure stays in the tile.
    pub fn load_tile(&self, tile: &Tile, selection: &TypeSelection) -> Result<(), DatabaseError> {
        self.tile_locks.run(&tile.key(), || self.load_tile_locked(tile, selection))
    }

    fn load_tile_locked(&self, tile: &Tile, selection: &TypeSelection) -> Result<(), DatabaseError> {
        self.with_files(|files| {
            self.tile_cache.prefill_from_cache(tile, selection)?;

            let bbox = tile.bounding_box();
            load_tile_data(tile.nodes(), files.nodes.as_ref(), &bbox, &selection.nodes)?;
            load_tile_data(tile.ways(), files.ways.as_ref(), &bbox, &selection.ways)?;
            load_tile_data(tile.areas(), files.areas.as_ref(), &bbox, &selection.areas)?;
            load_tile_data(
                tile.optimized_ways(),
                files.optimized_ways.as_ref(),
                &bbox,
                &selection.optimized_ways,
            )?;
            load_tile_data(
                tile.optimized_areas(),
                files.optimized_areas.as_ref(),
                &bbox,
                &selection.optimized_areas,
            )
        })
    }

    /// Returns the loaded tiles of `level` covering `bbox`, row by row.
    /// Afterwards the tile cache is trimmed to its capacity.
    ///
    /// # Errors
    ///
    /// Fails if the database is closed or the files can't be read.
    pub fn load_tiles_for_box(
        &self,
        level: u8,
        bbox: &GeoBox,
        selection: &TypeSelection,
    ) -> Result<Vec<Arc<Tile>>, DatabaseError> {
        let tiles = self.tile_cache.tiles_for_box(level, bbox)?;
        for tile in &tiles {
            self.load_tile(tile, selection)?;
        }
        self.tile_cache.cleanup()?;
        Ok(tiles)
    }

    /// Marks all cached tiles stale, e.g. after the type selection logic changed.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn invalidate_cache(&self) -> Result<(), DatabaseError> {
        Ok(self.tile_cache.invalidate()?)
    }

    /// Runs `process` with the open files, holding the read lock.
    fn with_files<F, R>(&self, process: F) -> Result<R, DatabaseError>
    where
        F: FnOnce(&OpenFiles) -> Result<R, DatabaseError>,
    {
        let files = self
            .files
            .read()
            .map_err(|e| DatabaseError::PoisonedLock(e.to_string()))?;
        match files.as_ref() {
            Some(files) => process(files),
            None => Err(DatabaseError::Closed(self.directory.clone())),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("directory", &self.directory)
            .field("parameter", &self.parameter)
            .field("open", &self.is_open())
            .field("tile_cache", &self.tile_cache)
            .finish_non_exhaustive()
    }
}

fn objects_in_box<T: Record + MapObject>(
    files: Option<&FeatureFiles<T>>,
    bbox: &GeoBox,
    types: &TypeSet,
) -> Result<Vec<Arc<T>>, DatabaseError> {
    match files {
        Some(files) => files.objects_in_box(bbox, types),
        None => Ok(Vec::new()),
    }
}

fn indexed_types<T: Record>(files: Option<&FeatureFiles<T>>) -> TypeSet {
    files.map_or_else(TypeSet::new, |files| files.index.types().collect())
}

fn load_tile_data<T: Record + MapObject>(
    data: &TileData<T>,
    files: Option<&FeatureFiles<T>>,
    bbox: &GeoBox,
    requested: &TypeSet,
) -> Result<(), DatabaseError> {
    if data.is_stale() {
        let objects = objects_in_box(files, bbox, requested)?;
        data.set_data(requested.clone(), objects);
        return Ok(());
    }

    let cached = data.types();
    if data.is_complete() && requested.is_subset(&cached) {
        return Ok(());
    }

    let missing = requested.difference(&cached);
    if missing.is_empty() {
        data.set_complete();
        return Ok(());
    }

    let objects = objects_in_box(files, bbox, &missing)?;
    if cached.is_empty() {
        data.set_data(missing, objects);
    } else {
        data.add_data(&missing, objects);
    }
    Ok(())
}
