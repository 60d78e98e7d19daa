//! # Offline map storage
//!
//! Read access to map databases: a directory of binary data files
//! with numeric and spatial indices, a cache of tiles built from them,
//! and the graph used for routing.

#[macro_use]
mod internal_macros;

pub mod codec;
pub mod data_file;
pub mod database;
pub mod feature;
mod geo_box;
pub mod numeric_index;
pub mod route_graph;
pub mod route_node;
pub mod spatial;
pub mod spatial_index;
pub mod tile_cache;
pub mod tile_key;

// Flatten the most used types for better ergonomics.
pub use codec::AccessMode;
pub use database::{Database, DatabaseError, DatabaseParameter};
pub use feature::{Area, MapObject, Node, Way};
pub use geo_box::GeoBox;
pub use route_graph::RouteGraph;
pub use route_node::{RouteNode, RouteNodeProvider, Vehicle};
pub use tile_cache::{TypeSelection, TypeSet};
pub use tile_key::TileKey;

/// Identifies the type of a map object, e.g. "motorway" or "building".
pub type TypeId = u16;
