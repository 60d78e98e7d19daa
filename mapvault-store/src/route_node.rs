//! # Route nodes
//!
//! Route nodes are the vertices of the routing graph.
//! Each node lists the objects (ways and areas) passing through it,
//! and the paths leading from it to neighboring route nodes.
//!
//! Record format:
//!
//! * id (varint), coord
//! * object count (varint), then per object:
//!   reference kind (u8), offset (varint), type (varint), max speed (u8)
//! * path count (varint), then per path:
//!   target id (varint), object index (varint), distance in centimeters (varint),
//!   usable vehicles (u8), restricted vehicles (u8)
//! * exclude count (varint), then per exclude:
//!   source reference kind (u8), source offset (varint), target path index (varint)

use crate::codec::{CodecError, FileScanner, FileWriter};
use crate::data_file::Record;
use crate::route_graph::RouteGraphError;
use crate::TypeId;
use enumset::{EnumSet, EnumSetType};
use geo::Coord;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;

const MAX_PREALLOCATED_ENTRIES: usize = 256;

/// Vehicle classes the routing graph distinguishes.
#[derive(EnumSetType, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Vehicle {
    Foot,
    Bicycle,
    Car,
}

/// The kind of file an [`ObjectFileRef`] points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum RefType {
    Node = 1,
    Way = 2,
    Area = 3,
}

/// A reference to a record in one of the feature data files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ObjectFileRef {
    pub kind: RefType,
    pub offset: u64,
}

impl ObjectFileRef {
    pub const fn new(kind: RefType, offset: u64) -> Self {
        Self { kind, offset }
    }
}

/// An object passing through a route node, with the attributes routing cares about.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectVariant {
    pub object: ObjectFileRef,
    pub type_id: TypeId,
    /// Signposted speed limit in km/h, or 0 if unknown.
    pub max_speed: u8,
}

/// An edge to a neighboring route node along one object.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoutePath {
    pub target_id: u64,
    /// Index into the node's objects.
    pub object_index: u32,
    pub distance_m: f64,
    pub usable: EnumSet<Vehicle>,
    /// Vehicles which may only use this path to reach or leave
    /// the start or target of a route (e.g. access=destination).
    pub restricted: EnumSet<Vehicle>,
}

impl RoutePath {
    pub fn is_usable_by(&self, vehicle: Vehicle) -> bool {
        self.usable.contains(vehicle)
    }

    pub fn is_restricted_for(&self, vehicle: Vehicle) -> bool {
        self.restricted.contains(vehicle)
    }
}

/// A forbidden turn: arriving along `source`, the object of the path
/// `target_index` must not be entered at this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exclude {
    pub source: ObjectFileRef,
    /// Index into the node's paths.
    pub target_index: u32,
}

/// A vertex of the routing graph.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteNode {
    offset: u64,
    id: u64,
    coord: Coord,
    objects: Vec<ObjectVariant>,
    paths: Vec<RoutePath>,
    excludes: Vec<Exclude>,
}

impl RouteNode {
    /// Creates a node without objects or paths.
    pub fn new(id: u64, coord: Coord) -> Self {
        Self {
            offset: 0,
            id,
            coord,
            objects: Vec::new(),
            paths: Vec::new(),
            excludes: Vec::new(),
        }
    }

    /// Adds an object (if not already present) and returns its index.
    pub fn add_object(&mut self, object: ObjectVariant) -> u32 {
        let index = self
            .objects
            .iter()
            .position(|existing| existing.object == object.object)
            .unwrap_or_else(|| {
                self.objects.push(object);
                self.objects.len() - 1
            });
        u32::try_from(index).unwrap_or(u32::MAX)
    }

    /// Adds a path. Its object index must refer to an object added before.
    pub fn add_path(&mut self, path: RoutePath) {
        self.paths.push(path);
    }

    /// Adds a turn restriction. Its target index must refer to a path added before.
    pub fn add_exclude(&mut self, exclude: Exclude) {
        self.excludes.push(exclude);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn coord(&self) -> Coord {
        self.coord
    }

    pub fn objects(&self) -> &[ObjectVariant] {
        &self.objects
    }

    pub fn paths(&self) -> &[RoutePath] {
        &self.paths
    }

    pub fn excludes(&self) -> &[Exclude] {
        &self.excludes
    }

    /// Whether turning from `incoming` into the object of the path `path_index` is forbidden.
    pub fn is_turn_excluded(&self, incoming: &ObjectFileRef, path_index: usize) -> bool {
        let Some(target) = self.object_for_path(path_index) else {
            return false;
        };
        self.excludes.iter().any(|exclude| {
            exclude.source == *incoming
                && self
                    .object_for_path(exclude.target_index as usize)
                    .is_some_and(|excluded| excluded.object == target.object)
        })
    }

    /// The object the path with the given index runs along.
    pub fn object_for_path(&self, path_index: usize) -> Option<&ObjectVariant> {
        let path = self.paths.get(path_index)?;
        self.objects.get(path.object_index as usize)
    }
}

impl Record for RouteNode {
    fn read(scanner: &mut FileScanner) -> Result<Self, CodecError> {
        let offset = scanner.pos();
        let id = scanner.read_varint_u64()?;
        let coord = scanner.read_coord()?;

        let object_count = scanner.read_varint_u32()? as usize;
        let mut objects = Vec::with_capacity(object_count.min(MAX_PREALLOCATED_ENTRIES));
        for _ in 0..object_count {
            let pos = scanner.pos();
            let kind = scanner.read_u8()?;
            let kind = RefType::try_from(kind)
                .map_err(|_| out_of_range(scanner, pos, kind, "object reference kind"))?;
            objects.push(ObjectVariant {
                object: ObjectFileRef::new(kind, scanner.read_varint_u64()?),
                type_id: scanner.read_varint_u16()?,
                max_speed: scanner.read_u8()?,
            });
        }

        let path_count = scanner.read_varint_u32()? as usize;
        let mut paths = Vec::with_capacity(path_count.min(MAX_PREALLOCATED_ENTRIES));
        for _ in 0..path_count {
            let target_id = scanner.read_varint_u64()?;
            let pos = scanner.pos();
            let object_index = scanner.read_varint_u32()?;
            if object_index as usize >= objects.len() {
                return Err(out_of_range(scanner, pos, object_index, "object index"));
            }
            let distance_cm = scanner.read_varint_u64()?;
            let usable = read_vehicles(scanner)?;
            let restricted = read_vehicles(scanner)?;
            #[expect(clippy::cast_precision_loss)]
            let distance_m = distance_cm as f64 / 100.0;
            paths.push(RoutePath {
                target_id,
                object_index,
                distance_m,
                usable,
                restricted,
            });
        }

        let exclude_count = scanner.read_varint_u32()? as usize;
        let mut excludes = Vec::with_capacity(exclude_count.min(MAX_PREALLOCATED_ENTRIES));
        for _ in 0..exclude_count {
            let pos = scanner.pos();
            let kind = scanner.read_u8()?;
            let kind = RefType::try_from(kind)
                .map_err(|_| out_of_range(scanner, pos, kind, "object reference kind"))?;
            let source = ObjectFileRef::new(kind, scanner.read_varint_u64()?);
            let pos = scanner.pos();
            let target_index = scanner.read_varint_u32()?;
            if target_index as usize >= paths.len() {
                return Err(out_of_range(scanner, pos, target_index, "exclude target index"));
            }
            excludes.push(Exclude {
                source,
                target_index,
            });
        }

        Ok(Self {
            offset,
            id,
            coord,
            objects,
            paths,
            excludes,
        })
    }

    fn write(&self, writer: &mut FileWriter) -> Result<(), CodecError> {
        writer.write_varint_u64(self.id)?;
        writer.write_coord(self.coord)?;

        writer.write_varint_u32(count(writer, self.objects.len(), "object count")?)?;
        for object in &self.objects {
            writer.write_u8(object.object.kind.into())?;
            writer.write_varint_u64(object.object.offset)?;
            writer.write_varint_u16(object.type_id)?;
            writer.write_u8(object.max_speed)?;
        }

        writer.write_varint_u32(count(writer, self.paths.len(), "path count")?)?;
        for path in &self.paths {
            if path.object_index as usize >= self.objects.len() {
                return Err(writer_out_of_range(writer, path.object_index, "object index"));
            }
            if !(path.distance_m.is_finite() && path.distance_m >= 0.0) {
                return Err(writer_out_of_range(writer, path.distance_m, "path distance"));
            }
            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let distance_cm = (path.distance_m * 100.0).round() as u64;

            writer.write_varint_u64(path.target_id)?;
            writer.write_varint_u32(path.object_index)?;
            writer.write_varint_u64(distance_cm)?;
            writer.write_u8(path.usable.as_u8())?;
            writer.write_u8(path.restricted.as_u8())?;
        }

        writer.write_varint_u32(count(writer, self.excludes.len(), "exclude count")?)?;
        for exclude in &self.excludes {
            if exclude.target_index as usize >= self.paths.len() {
                return Err(writer_out_of_range(
                    writer,
                    exclude.target_index,
                    "exclude target index",
                ));
            }
            writer.write_u8(exclude.source.kind.into())?;
            writer.write_varint_u64(exclude.source.offset)?;
            writer.write_varint_u32(exclude.target_index)?;
        }
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}

fn read_vehicles(scanner: &mut FileScanner) -> Result<EnumSet<Vehicle>, CodecError> {
    let pos = scanner.pos();
    let bits = scanner.read_u8()?;
    EnumSet::try_from_u8(bits).ok_or_else(|| out_of_range(scanner, pos, bits, "vehicle set"))
}

fn out_of_range<T: ToString>(
    scanner: &FileScanner,
    pos: u64,
    value: T,
    target: &'static str,
) -> CodecError {
    CodecError::OutOfRange {
        filename: scanner.filename().to_string(),
        pos,
        value: value.to_string(),
        target,
    }
}

fn writer_out_of_range<T: ToString>(writer: &FileWriter, value: T, target: &'static str) -> CodecError {
    CodecError::OutOfRange {
        filename: writer.filename().to_string(),
        pos: writer.pos(),
        value: value.to_string(),
        target,
    }
}

fn count(writer: &FileWriter, len: usize, target: &'static str) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| writer_out_of_range(writer, len, target))
}

/// Access to route nodes, by id or by location.
pub trait RouteNodeProvider {
    /// Returns the route node with the given id, or `None` if there is none.
    ///
    /// # Errors
    ///
    /// Fails if the node data can't be read.
    fn route_node(&self, id: u64) -> Result<Option<Arc<RouteNode>>, RouteGraphError>;

    /// Returns the route node closest to `coord` within `max_radius_m` meters.
    ///
    /// # Errors
    ///
    /// Fails if the node data can't be read.
    fn nearest_route_node(
        &self,
        coord: Coord,
        max_radius_m: f64,
    ) -> Result<Option<Arc<RouteNode>>, RouteGraphError>;
}
