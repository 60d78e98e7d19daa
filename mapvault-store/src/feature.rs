//! # Map features
//!
//! The three kinds of map objects stored in a database.
//! The record formats are:
//!
//! * node: type (varint), coord
//! * way: type (varint), coord count (varint), coords
//! * area: type (varint), coord count (varint), coords of the outer ring

use crate::codec::{CodecError, FileScanner, FileWriter};
use crate::data_file::Record;
use crate::{GeoBox, TypeId};
use geo::Coord;

/// Upper bound for preallocation when reading coordinate lists of untrusted length.
const MAX_PREALLOCATED_COORDS: usize = 4096;

/// Common behavior of everything that can be cached in tiles and found via a spatial index.
pub trait MapObject {
    fn type_id(&self) -> TypeId;

    fn bounding_box(&self) -> GeoBox;

    /// Whether the object may intersect `bbox` (bounding box test only).
    fn intersects(&self, bbox: &GeoBox) -> bool {
        self.bounding_box().intersects(bbox)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    offset: u64,
    type_id: TypeId,
    coord: Coord,
}

impl Node {
    /// Creates a node which is not (yet) stored in a file.
    pub fn new(type_id: TypeId, coord: Coord) -> Self {
        Self {
            offset: 0,
            type_id,
            coord,
        }
    }

    pub fn coord(&self) -> Coord {
        self.coord
    }
}

impl MapObject for Node {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn bounding_box(&self) -> GeoBox {
        GeoBox::from_coords([self.coord])
    }
}

impl Record for Node {
    fn read(scanner: &mut FileScanner) -> Result<Self, CodecError> {
        let offset = scanner.pos();
        Ok(Self {
            offset,
            type_id: scanner.read_varint_u16()?,
            coord: scanner.read_coord()?,
        })
    }

    fn write(&self, writer: &mut FileWriter) -> Result<(), CodecError> {
        writer.write_varint_u16(self.type_id)?;
        writer.write_coord(self.coord)
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}

/// A polyline, such as a road or river.
#[derive(Clone, Debug, PartialEq)]
pub struct Way {
    offset: u64,
    type_id: TypeId,
    coords: Vec<Coord>,
    bbox: GeoBox,
}

impl Way {
    pub fn new(type_id: TypeId, coords: Vec<Coord>) -> Self {
        Self {
            offset: 0,
            type_id,
            bbox: GeoBox::from_coords(coords.iter().copied()),
            coords,
        }
    }

    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }
}

impl MapObject for Way {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn bounding_box(&self) -> GeoBox {
        self.bbox
    }
}

impl Record for Way {
    fn read(scanner: &mut FileScanner) -> Result<Self, CodecError> {
        let offset = scanner.pos();
        let type_id = scanner.read_varint_u16()?;
        let coords = read_coords(scanner)?;
        Ok(Self {
            offset,
            type_id,
            bbox: GeoBox::from_coords(coords.iter().copied()),
            coords,
        })
    }

    fn write(&self, writer: &mut FileWriter) -> Result<(), CodecError> {
        writer.write_varint_u16(self.type_id)?;
        write_coords(writer, &self.coords)
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}

/// A closed polygon (outer ring only).
#[derive(Clone, Debug, PartialEq)]
pub struct Area {
    offset: u64,
    type_id: TypeId,
    ring: Vec<Coord>,
    bbox: GeoBox,
}

impl Area {
    pub fn new(type_id: TypeId, ring: Vec<Coord>) -> Self {
        Self {
            offset: 0,
            type_id,
            bbox: GeoBox::from_coords(ring.iter().copied()),
            ring,
        }
    }

    pub fn ring(&self) -> &[Coord] {
        &self.ring
    }
}

impl MapObject for Area {
    fn type_id(&self) -> TypeId {
        self.type_id
    }

    fn bounding_box(&self) -> GeoBox {
        self.bbox
    }
}

impl Record for Area {
    fn read(scanner: &mut FileScanner) -> Result<Self, CodecError> {
        let offset = scanner.pos();
        let type_id = scanner.read_varint_u16()?;
        let ring = read_coords(scanner)?;
        Ok(Self {
            offset,
            type_id,
            bbox: GeoBox::from_coords(ring.iter().copied()),
            ring,
        })
    }

    fn write(&self, writer: &mut FileWriter) -> Result<(), CodecError> {
        writer.write_varint_u16(self.type_id)?;
        write_coords(writer, &self.ring)
    }

    fn offset(&self) -> u64 {
        self.offset
    }
}

fn read_coords(scanner: &mut FileScanner) -> Result<Vec<Coord>, CodecError> {
    let count = scanner.read_varint_u32()? as usize;
    let mut coords = Vec::with_capacity(count.min(MAX_PREALLOCATED_COORDS));
    for _ in 0..count {
        coords.push(scanner.read_coord()?);
    }
    Ok(coords)
}

fn write_coords(writer: &mut FileWriter, coords: &[Coord]) -> Result<(), CodecError> {
    let count = u32::try_from(coords.len()).map_err(|_| CodecError::OutOfRange {
        filename: writer.filename().to_string(),
        pos: writer.pos(),
        value: coords.len().to_string(),
        target: "coordinate count",
    })?;
    writer.write_varint_u32(count)?;
    for coord in coords {
        writer.write_coord(*coord)?;
    }
    Ok(())
}
