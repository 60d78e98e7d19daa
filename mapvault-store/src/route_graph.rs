//! # File backed routing graph
//!
//! A routing graph consists of three files in one directory:
//!
//! * [`ROUTER_DATA`]: the [`RouteNode`] records
//! * [`ROUTER_INDEX`]: a [`NumericIndex`] from node id to record offset
//! * [`ROUTER_SPATIAL_INDEX`]: a [`SpatialIndex`] over node locations,
//!   with every node stored under [`ROUTE_NODE_TYPE`]

use crate::codec::CodecError;
use crate::data_file::{DataFile, DataFileError, DataFileWriter};
use crate::database::DatabaseParameter;
use crate::numeric_index::{NumericIndex, NumericIndexBuilder, NumericIndexError};
use crate::route_node::{RouteNode, RouteNodeProvider};
use crate::spatial::{bbox_with_center, spherical_distance_km};
use crate::spatial_index::{SpatialIndex, SpatialIndexBuilder, SpatialIndexError};
use crate::{GeoBox, TypeId};
use geo::Coord;
use lru::LruCache;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace};

pub const ROUTER_DATA: &str = "router.dat";
pub const ROUTER_INDEX: &str = "router.idx";
pub const ROUTER_SPATIAL_INDEX: &str = "router.sidx";

/// The type id route nodes are stored under in the spatial index.
pub const ROUTE_NODE_TYPE: TypeId = 0;

/// The radius of the first nearest node search box; it doubles until the maximum radius.
const INITIAL_SEARCH_RADIUS_M: f64 = 100.0;

#[derive(Debug, Error)]
pub enum RouteGraphError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    DataFile(#[from] DataFileError),
    #[error(transparent)]
    NumericIndex(#[from] NumericIndexError),
    #[error(transparent)]
    SpatialIndex(#[from] SpatialIndexError),
    #[error("Index points route node {id} to offset {offset}, which holds node {found}")]
    Inconsistent { id: u64, offset: u64, found: u64 },
    #[error("Route node {0} is added twice")]
    DuplicateNode(u64),
    #[error("Cache lock is poisoned: {0}")]
    PoisonedLock(String),
}

/// A [`RouteNodeProvider`] reading from the files of a routing graph.
///
/// Nodes loaded once are kept in an LRU cache keyed by node id.
pub struct RouteGraph {
    data: DataFile<RouteNode>,
    index: NumericIndex,
    spatial_index: SpatialIndex,
    cache: Mutex<LruCache<u64, Arc<RouteNode>>>,
}

impl RouteGraph {
    /// Opens the routing graph files in `directory`.
    ///
    /// # Errors
    ///
    /// Fails if any of the files is missing or malformed.
    pub fn open<P: AsRef<Path>>(
        directory: P,
        parameter: &DatabaseParameter,
    ) -> Result<Self, RouteGraphError> {
        let directory = directory.as_ref();
        let data = DataFile::open(directory.join(ROUTER_DATA), parameter.access_mode)?;
        let index = NumericIndex::open(
            directory.join(ROUTER_INDEX),
            parameter.access_mode,
            parameter.index_cache_size,
        )?;
        let spatial_index =
            SpatialIndex::open(directory.join(ROUTER_SPATIAL_INDEX), parameter.access_mode)?;

        debug!(
            directory = %directory.display(),
            nodes = index.entry_count(),
            "Opened route graph"
        );

        Ok(Self {
            data,
            index,
            spatial_index,
            cache: Mutex::new(LruCache::new(parameter.route_node_cache_size)),
        })
    }

    /// Closes all files and drops cached nodes.
    ///
    /// # Errors
    ///
    /// Fails if a lock is poisoned.
    pub fn close(&self) -> Result<(), RouteGraphError> {
        self.data.close();
        self.index.close()?;
        self.spatial_index.close();
        self.lock_cache()?.clear();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.data.is_open() && self.index.is_open() && self.spatial_index.is_open()
    }

    /// The number of route nodes in the graph.
    pub fn node_count(&self) -> u64 {
        self.index.entry_count()
    }

    /// The record offset of the node with the given id.
    ///
    /// # Errors
    ///
    /// Fails if the index can't be read.
    pub fn offset_of(&self, id: u64) -> Result<Option<u64>, RouteGraphError> {
        Ok(self.index.lookup(id)?)
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, LruCache<u64, Arc<RouteNode>>>, RouteGraphError> {
        self.cache
            .lock()
            .map_err(|e| RouteGraphError::PoisonedLock(e.to_string()))
    }

    fn nodes_within(&self, center: Coord, radius_m: f64) -> Result<Vec<Arc<RouteNode>>, RouteGraphError> {
        let bbox = bbox_with_center(center, radius_m);
        let result = self.spatial_index.get_offsets(&bbox, &[ROUTE_NODE_TYPE])?;
        let nodes = self.data.get_by_offsets(&result.offsets)?;

        let mut cache = self.lock_cache()?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                // Prefer an already shared instance
                match cache.get(&node.id()) {
                    Some(cached) => Arc::clone(cached),
                    None => {
                        cache.put(node.id(), Arc::clone(&node));
                        node
                    }
                }
            })
            .collect())
    }
}

impl RouteNodeProvider for RouteGraph {
    fn route_node(&self, id: u64) -> Result<Option<Arc<RouteNode>>, RouteGraphError> {
        if let Some(node) = self.lock_cache()?.get(&id) {
            return Ok(Some(Arc::clone(node)));
        }

        let Some(offset) = self.index.lookup(id)? else {
            return Ok(None);
        };
        let node = self.data.get_by_offset(offset)?;
        if node.id() != id {
            return Err(RouteGraphError::Inconsistent {
                id,
                offset,
                found: node.id(),
            });
        }

        self.lock_cache()?.put(id, Arc::clone(&node));
        Ok(Some(node))
    }

    fn nearest_route_node(
        &self,
        coord: Coord,
        max_radius_m: f64,
    ) -> Result<Option<Arc<RouteNode>>, RouteGraphError> {
        if !max_radius_m.is_finite() || max_radius_m < 0.0 {
            return Ok(None);
        }

        let mut radius = INITIAL_SEARCH_RADIUS_M.min(max_radius_m);
        loop {
            let radius_km = radius / 1000.0;
            let nearest = self
                .nodes_within(coord, radius)?
                .into_iter()
                .map(|node| (spherical_distance_km(coord, node.coord()), node))
                .filter(|(distance, _)| *distance <= radius_km)
                .min_by(|(a, node_a), (b, node_b)| {
                    a.total_cmp(b).then_with(|| node_a.id().cmp(&node_b.id()))
                });

            trace!(radius, found = nearest.is_some(), "Nearest route node search");
            if let Some((_, node)) = nearest {
                return Ok(Some(node));
            }
            if radius >= max_radius_m {
                return Ok(None);
            }
            radius = (radius * 2.0).min(max_radius_m);
        }
    }
}

impl std::fmt::Debug for RouteGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteGraph")
            .field("data", &self.data)
            .field("index", &self.index.filename())
            .field("spatial_index", &self.spatial_index.filename())
            .finish_non_exhaustive()
    }
}

/// Writes the files of a routing graph.
#[derive(Debug, Default)]
pub struct RouteGraphBuilder {
    nodes: Vec<RouteNode>,
    grid_level: Option<u8>,
}

impl RouteGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the grid level of the spatial index.
    pub fn with_grid_level(mut self, grid_level: u8) -> Self {
        self.grid_level = Some(grid_level);
        self
    }

    pub fn add(&mut self, node: RouteNode) {
        self.nodes.push(node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Writes [`ROUTER_DATA`], [`ROUTER_INDEX`] and [`ROUTER_SPATIAL_INDEX`] into `directory`.
    /// Nodes are stored in id order.
    ///
    /// # Errors
    ///
    /// Fails on duplicate node ids or I/O errors.
    pub fn write<P: AsRef<Path>>(mut self, directory: P) -> Result<(), RouteGraphError> {
        let directory = directory.as_ref();
        self.nodes.sort_by_key(RouteNode::id);
        if let Some(pair) = self.nodes.windows(2).find(|pair| pair[0].id() == pair[1].id()) {
            return Err(RouteGraphError::DuplicateNode(pair[0].id()));
        }

        let mut index = NumericIndexBuilder::new(crate::numeric_index::DEFAULT_PAGE_SIZE)?;
        let mut spatial_index = SpatialIndexBuilder::new(
            self.grid_level
                .unwrap_or(SpatialIndexBuilder::DEFAULT_GRID_LEVEL),
        )?;

        let mut writer = DataFileWriter::create(directory.join(ROUTER_DATA))?;
        for node in &self.nodes {
            let offset = writer.write(node)?;
            index.add(node.id(), offset)?;
            spatial_index.add(
                ROUTE_NODE_TYPE,
                GeoBox::from_coords([node.coord()]),
                offset,
            )?;
        }
        writer.close()?;

        index.write(directory.join(ROUTER_INDEX))?;
        spatial_index.write(directory.join(ROUTER_SPATIAL_INDEX))?;

        debug!(
            directory = %directory.display(),
            nodes = self.nodes.len(),
            "Wrote route graph"
        );
        Ok(())
    }
}
