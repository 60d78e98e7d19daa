//! # Spatial utilities for nearest-node search and routing heuristics

use crate::GeoBox;
use geo::{Coord, Destination, Distance, Haversine, Point, coord};

/// Returns a bounding box centered upon `center` containing a circle with radius `radius` meters.
///
/// Boxes crossing the antimeridian are clamped at ±180° rather than wrapped,
/// so a search near the date line may miss candidates on the far side.
pub fn bbox_with_center(center: Coord, radius: f64) -> GeoBox {
    let center = Point::from(center);
    // Per https://github.com/georust/geo/pull/1091/,
    // the longitude values are normalized to [-180, 180].
    let north = Haversine.destination(center, 0.0, radius).y();
    let east = Haversine.destination(center, 90.0, radius).x();
    let south = Haversine.destination(center, 180.0, radius).y();
    let west = Haversine.destination(center, 270.0, radius).x();

    let (west, east) = if west > east {
        // Wrapped; keep the half containing the center
        if center.x() >= 0.0 {
            (west, 180.0)
        } else {
            (-180.0, east)
        }
    } else {
        (west, east)
    };

    GeoBox::new(coord! { x: west, y: south }, coord! { x: east, y: north })
}

/// Great circle distance in kilometers.
#[inline]
pub fn spherical_distance_km(a: Coord, b: Coord) -> f64 {
    Haversine.distance(Point::from(a), Point::from(b)) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert, proptest};

    #[test]
    fn bbox_contains_circle() {
        let center = coord! { x: 7.4246, y: 43.7384 };
        let bbox = bbox_with_center(center, 1_000.0);
        assert!(bbox.includes(center));

        for bearing in [0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0] {
            let edge = Haversine.destination(Point::from(center), bearing, 999.0);
            assert!(bbox.includes(edge.into()), "{bearing}: {edge:?} not in {bbox:?}");
        }
    }

    #[test]
    fn bbox_near_antimeridian_is_clamped() {
        let bbox = bbox_with_center(coord! { x: 179.99, y: 0.0 }, 5_000.0);
        assert!(bbox.is_valid());
        assert_eq!(bbox.max_lon(), 180.0);
        assert!(bbox.min_lon() < 179.99);
    }

    #[test]
    fn spherical_distance_of_one_degree() {
        let d = spherical_distance_km(coord! { x: 0.0, y: 0.0 }, coord! { x: 0.0, y: 1.0 });
        assert!((d - 111.2).abs() < 0.1, "{d}");
    }

    proptest! {
        #[test]
        fn bbox_reaches_radius_along_meridian(lat in -80.0..80.0, lon in -170.0f64..170.0,
            radius in 1.0..20_000.0) {
            let center = coord! {x: lon, y: lat};
            let bbox = bbox_with_center(center, radius);
            prop_assert!(bbox.is_valid());
            prop_assert!(bbox.includes(center));

            let north = coord! {x: lon, y: bbox.max_lat()};
            let delta = spherical_distance_km(center, north) * 1000.0 - radius;
            prop_assert!(delta.abs() < 1e-3, "Expected a delta of less than 1mm; was {delta}");
        }
    }
}
