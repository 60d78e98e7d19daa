//! # Quadtree tile keys
//!
//! The world is divided into `2^level` columns (360° of longitude)
//! and `2^level` rows (180° of latitude) at each level.
//! Columns count eastwards from -180°, rows count northwards from -90°.
//! So cells are twice as wide as they are tall (in degrees),
//! and every tile has exactly four children on the next level.

use crate::GeoBox;
use geo::{Coord, coord};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// The deepest supported level (`2^30` tiles in each direction; roughly 3cm at the equator).
pub const MAX_TILE_LEVEL: u8 = 30;

#[derive(Debug, Error, PartialEq)]
pub enum InvalidTileKeyError {
    #[error("Level {0} is larger than the maximum allowed value.")]
    Level(u8),
    #[error("Tile coordinate ({x}, {y}) is outside the {dim}x{dim} grid of its level.")]
    Coordinate { x: u32, y: u32, dim: u64 },
}

/// Width of a cell at the given level in degrees of longitude.
#[inline]
pub fn cell_width(level: u8) -> f64 {
    360.0 / f64::from(1u32 << level.min(MAX_TILE_LEVEL))
}

/// Height of a cell at the given level in degrees of latitude.
#[inline]
pub fn cell_height(level: u8) -> f64 {
    180.0 / f64::from(1u32 << level.min(MAX_TILE_LEVEL))
}

/// Maps a (possibly out of range) cell coordinate to a valid column or row index.
#[inline]
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn cell_index(value: f64, level: u8) -> u32 {
    let max = (1u32 << level.min(MAX_TILE_LEVEL)) - 1;
    // Values beyond the grid clamp to its edges
    value.floor().clamp(0.0, f64::from(max)) as u32
}

/// The address of one quadtree cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TileKey {
    level: u8,
    x: u32,
    y: u32,
}

impl TileKey {
    /// Tries to construct a key from the given components.
    ///
    /// # Errors
    ///
    /// Fails if the level exceeds [`MAX_TILE_LEVEL`]
    /// or if `x`/`y` are outside the grid of that level.
    pub const fn try_new(level: u8, x: u32, y: u32) -> Result<Self, InvalidTileKeyError> {
        if level > MAX_TILE_LEVEL {
            return Err(InvalidTileKeyError::Level(level));
        }
        let dim = 1u64 << level;
        if x as u64 >= dim || y as u64 >= dim {
            Err(InvalidTileKeyError::Coordinate { x, y, dim })
        } else {
            Ok(Self { level, x, y })
        }
    }

    /// The key of the tile containing `coord` at the given level.
    /// Coordinates on the east/north border of the world map to the last column/row.
    pub fn for_coord(level: u8, coord: Coord) -> Self {
        let level = level.min(MAX_TILE_LEVEL);
        Self {
            level,
            x: cell_index((coord.x + 180.0) / cell_width(level), level),
            y: cell_index((coord.y + 90.0) / cell_height(level), level),
        }
    }

    pub const fn level(&self) -> u8 {
        self.level
    }

    pub const fn x(&self) -> u32 {
        self.x
    }

    pub const fn y(&self) -> u32 {
        self.y
    }

    /// The tile one level up which contains this one, if any.
    pub const fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            None
        } else {
            Some(Self {
                level: self.level - 1,
                x: self.x / 2,
                y: self.y / 2,
            })
        }
    }

    /// The four tiles one level down (empty at [`MAX_TILE_LEVEL`]).
    pub fn children(&self) -> Vec<Self> {
        if self.level >= MAX_TILE_LEVEL {
            return Vec::new();
        }
        let level = self.level + 1;
        let (x, y) = (self.x * 2, self.y * 2);
        vec![
            Self { level, x, y },
            Self { level, x: x + 1, y },
            Self { level, x, y: y + 1 },
            Self {
                level,
                x: x + 1,
                y: y + 1,
            },
        ]
    }

    /// The geographic extent of the tile.
    pub fn bounding_box(&self) -> GeoBox {
        let width = cell_width(self.level);
        let height = cell_height(self.level);
        GeoBox::new(
            coord! {
                x: f64::from(self.x) * width - 180.0,
                y: f64::from(self.y) * height - 90.0,
            },
            coord! {
                x: f64::from(self.x + 1) * width - 180.0,
                y: f64::from(self.y + 1) * height - 90.0,
            },
        )
    }
}

impl Display for TileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.x, self.y)
    }
}

/// An inclusive, rectangular range of tiles on one level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileKeyRange {
    level: u8,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl TileKeyRange {
    /// The tiles covering `bbox` at the given level, or `None` for an invalid box.
    pub fn covering(level: u8, bbox: &GeoBox) -> Option<Self> {
        if !bbox.is_valid() {
            return None;
        }
        let min = TileKey::for_coord(level, bbox.min());
        let max = TileKey::for_coord(level, bbox.max());
        Some(Self {
            level: min.level,
            min_x: min.x,
            min_y: min.y,
            max_x: max.x,
            max_y: max.y,
        })
    }

    pub const fn level(&self) -> u8 {
        self.level
    }

    pub const fn min_x(&self) -> u32 {
        self.min_x
    }

    pub const fn min_y(&self) -> u32 {
        self.min_y
    }

    pub const fn max_x(&self) -> u32 {
        self.max_x
    }

    pub const fn max_y(&self) -> u32 {
        self.max_y
    }

    /// Whether the (level-local) tile coordinate lies within the range.
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn len(&self) -> usize {
        let width = u64::from(self.max_x - self.min_x) + 1;
        let height = u64::from(self.max_y - self.min_y) + 1;
        usize::try_from(width * height).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates over all keys, row by row (south to north, west to east).
    pub fn iter(&self) -> impl Iterator<Item = TileKey> + use<> {
        let Self {
            level,
            min_x,
            min_y,
            max_x,
            max_y,
        } = *self;
        (min_y..=max_y).flat_map(move |y| (min_x..=max_x).map(move |x| TileKey { level, x, y }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn try_new_bounds() {
        assert!(TileKey::try_new(0, 0, 0).is_ok());
        assert_eq!(
            TileKey::try_new(1, 2, 0),
            Err(InvalidTileKeyError::Coordinate { x: 2, y: 0, dim: 2 })
        );
        assert_eq!(
            TileKey::try_new(31, 0, 0),
            Err(InvalidTileKeyError::Level(31))
        );
        assert!(TileKey::try_new(MAX_TILE_LEVEL, (1 << 30) - 1, 0).is_ok());
    }

    #[test]
    fn level_zero_covers_the_world() {
        let root = TileKey::try_new(0, 0, 0).unwrap();
        let bbox = root.bounding_box();
        assert_eq!(bbox.min(), coord! { x: -180.0, y: -90.0 });
        assert_eq!(bbox.max(), coord! { x: 180.0, y: 90.0 });
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn for_coord_clamps_world_border() {
        let key = TileKey::for_coord(3, coord! { x: 180.0, y: 90.0 });
        assert_eq!((key.x(), key.y()), (7, 7));
        let key = TileKey::for_coord(3, coord! { x: -180.0, y: -90.0 });
        assert_eq!((key.x(), key.y()), (0, 0));
    }

    #[test]
    fn covering_range() {
        let bbox = GeoBox::new(coord! { x: -1.0, y: -1.0 }, coord! { x: 1.0, y: 1.0 });
        let range = TileKeyRange::covering(2, &bbox).unwrap();
        // 90° x 45° cells; the box straddles the center of the world
        assert_eq!((range.min_x(), range.max_x()), (1, 2));
        assert_eq!((range.min_y(), range.max_y()), (1, 2));
        assert_eq!(range.len(), 4);
        assert_eq!(range.iter().count(), 4);
        assert!(TileKeyRange::covering(2, &GeoBox::invalid()).is_none());
    }

    proptest! {
        #[test]
        fn parent_contains_child(level in 1u8..=20, lon in -180.0f64..180.0, lat in -90.0f64..90.0) {
            let c = coord! { x: lon, y: lat };
            let key = TileKey::for_coord(level, c);
            prop_assert!(key.bounding_box().includes(c));

            let parent = key.parent().unwrap();
            prop_assert_eq!(parent, TileKey::for_coord(level - 1, c));
            prop_assert!(parent.bounding_box().contains_box(&key.bounding_box()));
            prop_assert!(parent.children().contains(&key));
        }
    }
}
