//! # Geographic bounding boxes

use geo::{Coord, Rect, coord};
use std::fmt;

/// An axis-aligned box in degrees (x = longitude, y = latitude).
///
/// Unlike [`Rect`], a `GeoBox` has an explicit invalid (empty) state,
/// which is the neutral element when accumulating boxes with [`GeoBox::include_coord`].
/// A box with `min == max` is valid; it covers exactly one point.
#[derive(Clone, Copy, PartialEq)]
pub struct GeoBox {
    min: Coord,
    max: Coord,
    valid: bool,
}

impl GeoBox {
    /// The empty box. It intersects nothing and includes nothing.
    pub const fn invalid() -> Self {
        Self {
            min: coord! { x: 0.0, y: 0.0 },
            max: coord! { x: 0.0, y: 0.0 },
            valid: false,
        }
    }

    /// Creates a box from two arbitrary corners.
    pub fn new(a: Coord, b: Coord) -> Self {
        Self {
            min: coord! { x: a.x.min(b.x), y: a.y.min(b.y) },
            max: coord! { x: a.x.max(b.x), y: a.y.max(b.y) },
            valid: true,
        }
    }

    /// Creates the smallest box containing all coordinates (invalid when there are none).
    pub fn from_coords<I: IntoIterator<Item = Coord>>(coords: I) -> Self {
        coords.into_iter().fold(Self::invalid(), |mut bbox, c| {
            bbox.include_coord(c);
            bbox
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn min(&self) -> Coord {
        self.min
    }

    pub fn max(&self) -> Coord {
        self.max
    }

    pub fn min_lat(&self) -> f64 {
        self.min.y
    }

    pub fn min_lon(&self) -> f64 {
        self.min.x
    }

    pub fn max_lat(&self) -> f64 {
        self.max.y
    }

    pub fn max_lon(&self) -> f64 {
        self.max.x
    }

    /// Height in degrees of latitude.
    pub fn height(&self) -> f64 {
        if self.valid { self.max.y - self.min.y } else { 0.0 }
    }

    /// Width in degrees of longitude.
    pub fn width(&self) -> f64 {
        if self.valid { self.max.x - self.min.x } else { 0.0 }
    }

    pub fn center(&self) -> Option<Coord> {
        self.valid.then(|| coord! {
            x: (self.min.x + self.max.x) / 2.0,
            y: (self.min.y + self.max.y) / 2.0,
        })
    }

    /// Grows the box to contain `c`.
    pub fn include_coord(&mut self, c: Coord) {
        if self.valid {
            self.min = coord! { x: self.min.x.min(c.x), y: self.min.y.min(c.y) };
            self.max = coord! { x: self.max.x.max(c.x), y: self.max.y.max(c.y) };
        } else {
            self.min = c;
            self.max = c;
            self.valid = true;
        }
    }

    /// Grows the box to contain `other`. Including an invalid box does nothing.
    pub fn include_box(&mut self, other: &GeoBox) {
        if other.valid {
            self.include_coord(other.min);
            self.include_coord(other.max);
        }
    }

    /// Whether `c` lies inside the box (borders included).
    pub fn includes(&self, c: Coord) -> bool {
        self.valid
            && c.x >= self.min.x
            && c.x <= self.max.x
            && c.y >= self.min.y
            && c.y <= self.max.y
    }

    /// Whether `other` lies completely inside this box.
    pub fn contains_box(&self, other: &GeoBox) -> bool {
        other.valid && self.includes(other.min) && self.includes(other.max)
    }

    /// Whether the boxes share at least one point (touching borders count).
    pub fn intersects(&self, other: &GeoBox) -> bool {
        self.valid
            && other.valid
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// The overlapping part of two boxes, or the invalid box if they don't intersect.
    pub fn intersection(&self, other: &GeoBox) -> GeoBox {
        if self.intersects(other) {
            GeoBox {
                min: coord! { x: self.min.x.max(other.min.x), y: self.min.y.max(other.min.y) },
                max: coord! { x: self.max.x.min(other.max.x), y: self.max.y.min(other.max.y) },
                valid: true,
            }
        } else {
            GeoBox::invalid()
        }
    }
}

impl Default for GeoBox {
    fn default() -> Self {
        Self::invalid()
    }
}

impl From<Rect> for GeoBox {
    fn from(value: Rect) -> Self {
        Self::new(value.min(), value.max())
    }
}

impl TryFrom<GeoBox> for Rect {
    type Error = ();

    fn try_from(value: GeoBox) -> Result<Self, Self::Error> {
        if value.valid {
            Ok(Rect::new(value.min, value.max))
        } else {
            Err(())
        }
    }
}

impl fmt::Debug for GeoBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(
                f,
                "GeoBox[{:.7},{:.7} - {:.7},{:.7}]",
                self.min.y, self.min.x, self.max.y, self.max.x
            )
        } else {
            write!(f, "GeoBox[invalid]")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> GeoBox {
        GeoBox::new(
            coord! { x: min_lon, y: min_lat },
            coord! { x: max_lon, y: max_lat },
        )
    }

    #[test]
    fn invalid_box_is_empty() {
        let invalid = GeoBox::invalid();
        let everything = bbox(-90.0, -180.0, 90.0, 180.0);
        assert!(!invalid.is_valid());
        assert!(!invalid.intersects(&everything));
        assert!(!everything.intersects(&invalid));
        assert!(!invalid.includes(coord! { x: 0.0, y: 0.0 }));
        assert!(!everything.intersection(&invalid).is_valid());
        assert_eq!(invalid.center(), None);
    }

    #[test]
    fn degenerate_box_is_valid() {
        let point = GeoBox::from_coords([coord! { x: 7.0, y: 43.0 }]);
        assert!(point.is_valid());
        assert_eq!(point.width(), 0.0);
        assert!(point.includes(coord! { x: 7.0, y: 43.0 }));
        assert!(point.intersects(&bbox(42.0, 6.0, 43.0, 7.0)));
    }

    #[test]
    fn new_normalizes_corners() {
        let b = GeoBox::new(coord! { x: 10.0, y: 5.0 }, coord! { x: -10.0, y: -5.0 });
        assert_eq!(b, bbox(-5.0, -10.0, 5.0, 10.0));
    }

    #[test]
    fn include_and_intersection() {
        let mut b = GeoBox::invalid();
        b.include_box(&GeoBox::invalid());
        assert!(!b.is_valid());

        b.include_box(&bbox(0.0, 0.0, 1.0, 1.0));
        b.include_coord(coord! { x: 3.0, y: -1.0 });
        assert_eq!(b, bbox(-1.0, 0.0, 1.0, 3.0));

        let other = bbox(0.5, 2.0, 4.0, 4.0);
        assert_eq!(b.intersection(&other), bbox(0.5, 2.0, 1.0, 3.0));
        assert!(b.contains_box(&bbox(0.0, 1.0, 0.5, 2.0)));
        assert!(!b.contains_box(&other));

        // Touching borders intersect
        assert!(b.intersects(&bbox(1.0, 3.0, 2.0, 4.0)));
        assert!(!b.intersects(&bbox(1.1, 3.0, 2.0, 4.0)));
    }
}
