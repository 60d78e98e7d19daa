//! # Tile data cache
//!
//! Map data is cached in quadtree tiles ([`TileKey`]).
//! Each tile holds one [`TileData`] per object kind,
//! recording which types have been loaded so far.
//! Besides nodes, ways and areas, a tile holds the optimized ways and areas
//! used for low zoom levels; they are loaded and invalidated separately.
//!
//! Tiles are handed out as `Arc`s.
//! A tile that is still referenced outside the cache is never evicted,
//! so the cache may temporarily grow beyond its capacity.

use crate::feature::{Area, MapObject, Node, Way};
use crate::tile_key::{TileKey, TileKeyRange};
use crate::{GeoBox, TypeId};
use lru::LruCache;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TileCacheError {
    #[error("Cache lock is poisoned: {0}")]
    PoisonedLock(String),
}

/// A sorted set of type ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeSet(BTreeSet<TypeId>);

impl TypeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, type_id: TypeId) -> bool {
        self.0.insert(type_id)
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.0.contains(&type_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.0.iter().copied()
    }

    /// Adds all types of `other`.
    pub fn extend_from(&mut self, other: &TypeSet) {
        self.0.extend(other.iter());
    }

    /// Types in `self` but not in `other`.
    pub fn difference(&self, other: &TypeSet) -> TypeSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    pub fn intersection(&self, other: &TypeSet) -> TypeSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn intersects(&self, other: &TypeSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    pub fn is_subset(&self, other: &TypeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn to_vec(&self) -> Vec<TypeId> {
        self.iter().collect()
    }
}

impl FromIterator<TypeId> for TypeSet {
    fn from_iter<I: IntoIterator<Item = TypeId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[TypeId; N]> for TypeSet {
    fn from(types: [TypeId; N]) -> Self {
        types.into_iter().collect()
    }
}

/// The types requested per object kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeSelection {
    pub nodes: TypeSet,
    pub ways: TypeSet,
    pub areas: TypeSet,
    /// Types read from the low zoom way data instead of the full way data.
    pub optimized_ways: TypeSet,
    /// Types read from the low zoom area data instead of the full area data.
    pub optimized_areas: TypeSet,
}

impl TypeSelection {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.ways.is_empty()
            && self.areas.is_empty()
            && self.optimized_ways.is_empty()
            && self.optimized_areas.is_empty()
    }
}

#[derive(Debug)]
struct TileDataState<T> {
    types: TypeSet,
    prefill: Vec<Arc<T>>,
    data: Vec<Arc<T>>,
    complete: bool,
    stale: bool,
}

/// Objects of one kind cached for a tile.
///
/// Data derived from other tiles (prefill data) is kept apart from data
/// loaded from disk, but both are visited by [`TileData::for_each`].
#[derive(Debug)]
pub struct TileData<T> {
    state: Mutex<TileDataState<T>>,
}

impl<T> Default for TileData<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(TileDataState {
                types: TypeSet::new(),
                prefill: Vec::new(),
                data: Vec::new(),
                complete: false,
                stale: false,
            }),
        }
    }
}

impl<T> TileData<T> {
    // Every update is a plain assignment, so a poisoned guard still holds consistent state.
    fn state(&self) -> MutexGuard<'_, TileDataState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The types loaded so far. A type may be loaded without having any objects.
    pub fn types(&self) -> TypeSet {
        self.state().types.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Whether no type has been assigned yet.
    pub fn is_empty(&self) -> bool {
        self.state().types.is_empty()
    }

    /// Whether the data was invalidated and has not been replaced since.
    pub fn is_stale(&self) -> bool {
        self.state().stale
    }

    /// Marks the data as stale and incomplete, keeping data and types until they are replaced.
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.complete = false;
        state.stale = true;
    }

    /// Adds data derived from cached tiles. The data stays incomplete.
    pub fn add_prefill_data(&self, types: &TypeSet, data: Vec<Arc<T>>) {
        let mut state = self.state();
        state.types.extend_from(types);
        state.prefill.extend(data);
        state.complete = false;
    }

    /// Adds loaded data and marks the data complete.
    pub fn add_data(&self, types: &TypeSet, data: Vec<Arc<T>>) {
        let mut state = self.state();
        state.types.extend_from(types);
        state.data.extend(data);
        state.complete = true;
    }

    /// Replaces all data (including prefill data) and types, and marks the data complete.
    pub fn set_data(&self, types: TypeSet, data: Vec<Arc<T>>) {
        let mut state = self.state();
        state.types = types;
        state.prefill.clear();
        state.data = data;
        state.complete = true;
        state.stale = false;
    }

    /// Marks the data complete, for when the prefill data already covers every requested type.
    pub fn set_complete(&self) {
        self.state().complete = true;
    }

    pub fn data_size(&self) -> usize {
        let state = self.state();
        state.prefill.len() + state.data.len()
    }

    /// Visits prefill data, then loaded data.
    pub fn for_each<F: FnMut(&Arc<T>)>(&self, mut f: F) {
        let state = self.state();
        state.prefill.iter().chain(&state.data).for_each(&mut f);
    }

    pub fn collect(&self) -> Vec<Arc<T>> {
        let mut objects = Vec::with_capacity(self.data_size());
        self.for_each(|object| objects.push(Arc::clone(object)));
        objects
    }
}

/// The cached data of one tile.
#[derive(Debug)]
pub struct Tile {
    key: TileKey,
    bbox: GeoBox,
    nodes: TileData<Node>,
    ways: TileData<Way>,
    areas: TileData<Area>,
    optimized_ways: TileData<Way>,
    optimized_areas: TileData<Area>,
}

impl Tile {
    pub fn new(key: TileKey) -> Self {
        Self {
            key,
            bbox: key.bounding_box(),
            nodes: TileData::default(),
            ways: TileData::default(),
            areas: TileData::default(),
            optimized_ways: TileData::default(),
            optimized_areas: TileData::default(),
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn bounding_box(&self) -> GeoBox {
        self.bbox
    }

    pub fn nodes(&self) -> &TileData<Node> {
        &self.nodes
    }

    pub fn ways(&self) -> &TileData<Way> {
        &self.ways
    }

    pub fn areas(&self) -> &TileData<Area> {
        &self.areas
    }

    pub fn optimized_ways(&self) -> &TileData<Way> {
        &self.optimized_ways
    }

    pub fn optimized_areas(&self) -> &TileData<Area> {
        &self.optimized_areas
    }

    /// Whether all object kinds are complete.
    pub fn is_complete(&self) -> bool {
        self.nodes.is_complete()
            && self.ways.is_complete()
            && self.areas.is_complete()
            && self.optimized_ways.is_complete()
            && self.optimized_areas.is_complete()
    }

    fn invalidate(&self) {
        self.nodes.invalidate();
        self.ways.invalidate();
        self.areas.invalidate();
        self.optimized_ways.invalidate();
        self.optimized_areas.invalidate();
    }
}

struct CacheState {
    capacity: usize,
    tiles: LruCache<TileKey, Arc<Tile>>,
}

/// An LRU cache of [`Tile`]s.
pub struct TileCache {
    state: Mutex<CacheState>,
}

impl TileCache {
    /// Creates a cache that tries to keep at most `capacity` tiles.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                capacity,
                tiles: LruCache::unbounded(),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, CacheState>, TileCacheError> {
        self.state
            .lock()
            .map_err(|e| TileCacheError::PoisonedLock(e.to_string()))
    }

    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn capacity(&self) -> Result<usize, TileCacheError> {
        Ok(self.state()?.capacity)
    }

    /// Changes the capacity. Shrinking evicts tiles immediately.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), TileCacheError> {
        let mut state = self.state()?;
        let shrinking = capacity < state.capacity;
        state.capacity = capacity;
        if shrinking {
            evict(&mut state);
        }
        Ok(())
    }

    /// The number of cached tiles.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn len(&self) -> Result<usize, TileCacheError> {
        Ok(self.state()?.tiles.len())
    }

    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, TileCacheError> {
        Ok(self.state()?.tiles.is_empty())
    }

    /// Returns the tile for `key`, creating an empty one if it isn't cached.
    /// The tile becomes the most recently used one.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn get_tile(&self, key: TileKey) -> Result<Arc<Tile>, TileCacheError> {
        let mut state = self.state()?;
        Ok(get_or_create(&mut state, key))
    }

    /// Returns the tile for `key` if it is cached, marking it most recently used.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn get_cached_tile(&self, key: TileKey) -> Result<Option<Arc<Tile>>, TileCacheError> {
        Ok(self.state()?.tiles.get(&key).cloned())
    }

    /// Returns the tiles of `level` covering `bbox`, row by row, creating missing ones.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn tiles_for_box(
        &self,
        level: u8,
        bbox: &GeoBox,
    ) -> Result<Vec<Arc<Tile>>, TileCacheError> {
        let Some(range) = TileKeyRange::covering(level, bbox) else {
            return Ok(Vec::new());
        };
        let mut state = self.state()?;
        Ok(range
            .iter()
            .map(|key| get_or_create(&mut state, key))
            .collect())
    }

    /// Evicts least recently used tiles which aren't referenced elsewhere
    /// until the capacity is reached.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn cleanup(&self) -> Result<(), TileCacheError> {
        evict(&mut *self.state()?);
        Ok(())
    }

    /// Marks every cached tile incomplete, so its data gets reloaded on next use.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn invalidate(&self) -> Result<(), TileCacheError> {
        let state = self.state()?;
        for (_, tile) in &state.tiles {
            tile.invalidate();
        }
        debug!(tiles = state.tiles.len(), "Invalidated tile cache");
        Ok(())
    }

    /// Prefills `tile` with data of the requested types from its cached parent tile.
    ///
    /// Only types the tile doesn't have yet are copied,
    /// and only objects intersecting the tile's bounding box.
    ///
    /// # Errors
    ///
    /// Fails if the cache lock is poisoned.
    pub fn prefill_from_cache(
        &self,
        tile: &Tile,
        selection: &TypeSelection,
    ) -> Result<(), TileCacheError> {
        let Some(parent_key) = tile.key().parent() else {
            return Ok(());
        };
        let Some(parent) = self.get_cached_tile(parent_key)? else {
            return Ok(());
        };

        let bbox = tile.bounding_box();
        resolve_from_parent(&tile.nodes, &parent.nodes, &bbox, &selection.nodes);
        resolve_from_parent(&tile.ways, &parent.ways, &bbox, &selection.ways);
        resolve_from_parent(&tile.areas, &parent.areas, &bbox, &selection.areas);
        resolve_from_parent(
            &tile.optimized_ways,
            &parent.optimized_ways,
            &bbox,
            &selection.optimized_ways,
        );
        resolve_from_parent(
            &tile.optimized_areas,
            &parent.optimized_areas,
            &bbox,
            &selection.optimized_areas,
        );
        Ok(())
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("TileCache");
        if let Ok(state) = self.state.lock() {
            debug
                .field("capacity", &state.capacity)
                .field("len", &state.tiles.len());
        }
        debug.finish_non_exhaustive()
    }
}

fn get_or_create(state: &mut CacheState, key: TileKey) -> Arc<Tile> {
    if let Some(tile) = state.tiles.get(&key) {
        return Arc::clone(tile);
    }
    let tile = Arc::new(Tile::new(key));
    state.tiles.push(key, Arc::clone(&tile));
    tile
}

fn evict(state: &mut CacheState) {
    let excess = state.tiles.len().saturating_sub(state.capacity);
    if excess == 0 {
        return;
    }

    // Least recently used first
    let victims: Vec<TileKey> = state
        .tiles
        .iter()
        .rev()
        .filter(|(_, tile)| Arc::strong_count(tile) == 1)
        .map(|(key, _)| *key)
        .take(excess)
        .collect();
    for key in &victims {
        state.tiles.pop(key);
    }

    if state.tiles.len() > state.capacity {
        warn!(
            capacity = state.capacity,
            len = state.tiles.len(),
            "Tile cache exceeds its capacity; remaining tiles are in use"
        );
    }
}

fn resolve_from_parent<T: MapObject>(
    data: &TileData<T>,
    parent: &TileData<T>,
    bbox: &GeoBox,
    requested: &TypeSet,
) {
    if parent.is_stale() {
        return;
    }
    let parent_types = parent.types();
    let subset = requested
        .difference(&data.types())
        .intersection(&parent_types);
    if subset.is_empty() {
        return;
    }

    let mut objects = Vec::new();
    parent.for_each(|object| {
        if subset.contains(object.type_id()) && object.intersects(bbox) {
            objects.push(Arc::clone(object));
        }
    });
    data.add_prefill_data(&subset, objects);
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    fn key(level: u8, x: u32, y: u32) -> TileKey {
        TileKey::try_new(level, x, y).unwrap()
    }

    #[test]
    fn type_set_operations() {
        let a = TypeSet::from([1, 2, 3]);
        let b = TypeSet::from([3, 4]);
        assert_eq!(a.difference(&b).to_vec(), vec![1, 2]);
        assert_eq!(a.intersection(&b).to_vec(), vec![3]);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&TypeSet::from([7])));
        assert!(TypeSet::from([2, 3]).is_subset(&a));
    }

    #[test]
    fn get_tile_creates_and_reuses() {
        let cache = TileCache::new(10);
        let tile = cache.get_tile(key(3, 1, 2)).unwrap();
        let again = cache.get_tile(key(3, 1, 2)).unwrap();
        assert!(Arc::ptr_eq(&tile, &again));
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.get_cached_tile(key(3, 2, 2)).unwrap().is_none());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn tiles_for_box_covers_range() {
        let cache = TileCache::new(100);
        let bbox = GeoBox::new(coord! { x: -1.0, y: -1.0 }, coord! { x: 1.0, y: 1.0 });
        let tiles = cache.tiles_for_box(2, &bbox).unwrap();
        let keys: Vec<_> = tiles.iter().map(|tile| tile.key().to_string()).collect();
        assert_eq!(keys, vec!["2/1/1", "2/2/1", "2/1/2", "2/2/2"]);
        assert!(cache.tiles_for_box(2, &GeoBox::invalid()).unwrap().is_empty());
    }

    #[test]
    fn eviction_is_lru_and_skips_tiles_in_use() {
        let cache = TileCache::new(2);
        let held = cache.get_tile(key(4, 0, 0)).unwrap();
        for x in 1..4 {
            cache.get_tile(key(4, x, 0)).unwrap();
        }
        assert_eq!(cache.len().unwrap(), 4);

        cache.cleanup().unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        // The oldest tile is still referenced, so the next oldest ones went
        assert!(cache.get_cached_tile(key(4, 0, 0)).unwrap().is_some());
        assert!(cache.get_cached_tile(key(4, 1, 0)).unwrap().is_none());
        assert!(cache.get_cached_tile(key(4, 2, 0)).unwrap().is_none());
        assert!(cache.get_cached_tile(key(4, 3, 0)).unwrap().is_some());

        cache.set_capacity(0).unwrap();
        assert_eq!(cache.len().unwrap(), 1);
        drop(held);
        cache.cleanup().unwrap();
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn touching_protects_from_eviction() {
        let cache = TileCache::new(2);
        cache.get_tile(key(4, 0, 0)).unwrap();
        cache.get_tile(key(4, 1, 0)).unwrap();
        cache.get_cached_tile(key(4, 0, 0)).unwrap();
        cache.get_tile(key(4, 2, 0)).unwrap();
        cache.cleanup().unwrap();
        assert!(cache.get_cached_tile(key(4, 0, 0)).unwrap().is_some());
        assert!(cache.get_cached_tile(key(4, 1, 0)).unwrap().is_none());
    }

    #[test]
    fn tile_data_completion() {
        let data: TileData<Node> = TileData::default();
        assert!(data.is_empty());
        assert!(!data.is_complete());

        let node = Arc::new(Node::new(1, coord! { x: 7.0, y: 43.0 }));
        data.add_prefill_data(&TypeSet::from([1]), vec![Arc::clone(&node)]);
        assert!(!data.is_empty());
        assert!(!data.is_complete());

        data.add_data(&TypeSet::from([2]), vec![]);
        assert!(data.is_complete());
        assert_eq!(data.types().to_vec(), vec![1, 2]);
        assert_eq!(data.data_size(), 1);

        data.invalidate();
        assert!(!data.is_complete());
        assert!(data.is_stale());
        assert_eq!(data.data_size(), 1);

        data.set_data(TypeSet::from([3]), vec![Arc::clone(&node), node]);
        assert!(data.is_complete());
        assert!(!data.is_stale());
        assert_eq!(data.types().to_vec(), vec![3]);
        assert_eq!(data.collect().len(), 2);
    }

    #[test]
    fn invalidate_marks_all_tiles_incomplete() {
        let cache = TileCache::new(4);
        let tile = cache.get_tile(key(1, 0, 0)).unwrap();
        tile.nodes().set_complete();
        tile.ways().set_complete();
        tile.areas().set_complete();
        assert!(!tile.is_complete());
        tile.optimized_ways().set_complete();
        tile.optimized_areas().set_complete();
        assert!(tile.is_complete());

        cache.invalidate().unwrap();
        assert!(!tile.is_complete());
        assert!(tile.nodes().is_stale());
        assert!(tile.optimized_ways().is_stale());
        assert!(tile.optimized_areas().is_stale());
        assert!(!tile.optimized_areas().is_complete());

        // Stale parents don't prefill their children
        tile.nodes()
            .add_data(&TypeSet::from([1]), vec![Arc::new(Node::new(1, coord! { x: -90.0, y: -45.0 }))]);
        let child = cache.get_tile(key(2, 0, 0)).unwrap();
        let selection = TypeSelection {
            nodes: TypeSet::from([1]),
            ..TypeSelection::default()
        };
        cache.prefill_from_cache(&child, &selection).unwrap();
        assert!(child.nodes().is_empty());
    }

    #[test]
    fn prefill_copies_intersecting_objects_of_missing_types() {
        let cache = TileCache::new(10);
        let parent = cache.get_tile(key(1, 1, 1)).unwrap();
        // Parent covers lon 0..180, lat 0..90; the child 2/2/2 covers lon 0..90, lat 0..45
        let inside = Arc::new(Node::new(1, coord! { x: 10.0, y: 10.0 }));
        let outside = Arc::new(Node::new(1, coord! { x: 100.0, y: 10.0 }));
        let other_type = Arc::new(Node::new(2, coord! { x: 20.0, y: 20.0 }));
        parent.nodes().set_data(
            TypeSet::from([1, 2]),
            vec![inside, outside, other_type],
        );
        let crossing = Arc::new(Way::new(
            5,
            vec![coord! { x: 80.0, y: 40.0 }, coord! { x: 100.0, y: 50.0 }],
        ));
        parent.ways().set_data(TypeSet::from([5]), vec![Arc::clone(&crossing)]);
        parent
            .optimized_ways()
            .set_data(TypeSet::from([5, 6]), vec![crossing]);
        let far = Arc::new(Area::new(
            8,
            vec![
                coord! { x: 120.0, y: 60.0 },
                coord! { x: 130.0, y: 60.0 },
                coord! { x: 125.0, y: 70.0 },
            ],
        ));
        let near = Arc::new(Area::new(
            8,
            vec![
                coord! { x: 30.0, y: 30.0 },
                coord! { x: 40.0, y: 30.0 },
                coord! { x: 35.0, y: 40.0 },
            ],
        ));
        parent
            .optimized_areas()
            .set_data(TypeSet::from([8]), vec![far, near]);

        let child = cache.get_tile(key(2, 2, 2)).unwrap();
        child.nodes().add_data(&TypeSet::from([2]), vec![]);

        let selection = TypeSelection {
            nodes: TypeSet::from([1, 2, 3]),
            ways: TypeSet::from([5]),
            areas: TypeSet::from([9]),
            optimized_ways: TypeSet::from([5]),
            optimized_areas: TypeSet::from([8]),
        };
        cache.prefill_from_cache(&child, &selection).unwrap();

        // Type 2 was already present; type 3 isn't known to the parent
        assert_eq!(child.nodes().types().to_vec(), vec![1, 2]);
        let nodes = child.nodes().collect();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].coord(), coord! { x: 10.0, y: 10.0 });
        assert!(!child.nodes().is_complete());

        assert_eq!(child.ways().data_size(), 1);
        assert!(child.areas().is_empty());

        // Optimized data is resolved from the parent's optimized data only
        assert_eq!(child.optimized_ways().types().to_vec(), vec![5]);
        assert_eq!(child.optimized_ways().data_size(), 1);
        assert!(!child.optimized_ways().is_complete());
        assert_eq!(child.optimized_areas().types().to_vec(), vec![8]);
        let areas = child.optimized_areas().collect();
        assert_eq!(areas.len(), 1);
        assert!(areas[0].bounding_box().includes(coord! { x: 35.0, y: 35.0 }));
    }

    #[test]
    fn prefill_without_cached_parent_is_a_no_op() {
        let cache = TileCache::new(10);
        let root = cache.get_tile(key(0, 0, 0)).unwrap();
        let selection = TypeSelection {
            nodes: TypeSet::from([1]),
            ..TypeSelection::default()
        };
        cache.prefill_from_cache(&root, &selection).unwrap();
        let orphan = cache.get_tile(key(5, 3, 3)).unwrap();
        cache.prefill_from_cache(&orphan, &selection).unwrap();
        assert!(root.nodes().is_empty());
        assert!(orphan.nodes().is_empty());
    }
}
