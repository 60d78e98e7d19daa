//! # Routing profiles
//!
//! A profile decides which paths a vehicle may use and what using them costs.
//! [`FastestPathProfile`] measures cost in hours, [`ShortestPathProfile`] in kilometers.
//! Both are parametrized by a [`ProfileConfig`].

use mapvault_store::TypeId;
use mapvault_store::route_node::{ObjectVariant, RouteNode, Vehicle};
use std::collections::BTreeMap;
use thiserror::Error;

/// A [`ProfileConfig`] value that would make costs meaningless.
#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("The vehicle max speed must be positive and finite; was {0}")]
    VehicleMaxSpeed(f64),
    #[error("Speed for {target} must be non-negative and finite; was {value}")]
    Speed { target: String, value: f64 },
    #[error("{target} must be non-negative and finite; was {value}")]
    Parameter { target: &'static str, value: f64 },
}

/// Cost model and usage rules for one vehicle.
pub trait RoutingProfile {
    fn vehicle(&self) -> Vehicle;

    /// Whether the path with the given index may be used at all.
    fn can_use(&self, node: &RouteNode, path_index: usize) -> bool;

    /// The cost of traversing the path with the given index.
    fn edge_cost(&self, node: &RouteNode, path_index: usize) -> f64;

    /// Extra cost for continuing on the path with the given index
    /// after reaching `node` along `incoming`.
    fn transition_cost(
        &self,
        _node: &RouteNode,
        _incoming: Option<&ObjectVariant>,
        _path_index: usize,
    ) -> f64 {
        0.0
    }

    /// The minimal cost of travelling `distance_km`.
    /// Never more than what any path of that length costs,
    /// which makes it usable as the search heuristic.
    fn cost_for_distance(&self, distance_km: f64) -> f64;

    /// The upper cost bound of a search whose endpoints are `direct_km` apart.
    fn cost_limit(&self, direct_km: f64) -> f64;

    /// Travel time in hours along the path with the given index.
    fn time_for(&self, node: &RouteNode, path_index: usize) -> Option<f64>;
}

/// Parameters shared by all profiles.
///
/// Speeds are in km/h. Types without an entry in `speeds` use `default_speed`;
/// a speed of 0 makes a type unusable.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ProfileConfig {
    pub vehicle: Vehicle,
    pub vehicle_max_speed: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub speeds: BTreeMap<TypeId, f64>,
    pub default_speed: f64,
    pub cost_limit_distance_km: f64,
    pub cost_limit_factor: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub junction_penalty: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub penalty_same_type_m: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub penalty_different_type_m: f64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_penalty_s: f64,
}

impl ProfileConfig {
    pub fn foot() -> Self {
        Self {
            vehicle: Vehicle::Foot,
            vehicle_max_speed: 5.0,
            speeds: BTreeMap::new(),
            default_speed: 5.0,
            cost_limit_distance_km: 10.0,
            cost_limit_factor: 5.0,
            junction_penalty: false,
            penalty_same_type_m: 0.0,
            penalty_different_type_m: 0.0,
            max_penalty_s: 0.0,
        }
    }

    pub fn bicycle() -> Self {
        Self {
            vehicle: Vehicle::Bicycle,
            vehicle_max_speed: 20.0,
            speeds: BTreeMap::new(),
            default_speed: 20.0,
            cost_limit_distance_km: 20.0,
            cost_limit_factor: 7.5,
            junction_penalty: true,
            penalty_same_type_m: 40.0,
            penalty_different_type_m: 250.0,
            max_penalty_s: 10.0,
        }
    }

    pub fn car() -> Self {
        Self {
            vehicle: Vehicle::Car,
            vehicle_max_speed: 160.0,
            speeds: BTreeMap::new(),
            default_speed: 50.0,
            cost_limit_distance_km: 20.0,
            cost_limit_factor: 7.5,
            junction_penalty: true,
            penalty_same_type_m: 40.0,
            penalty_different_type_m: 250.0,
            max_penalty_s: 10.0,
        }
    }

    /// The preset for `vehicle`.
    pub fn for_vehicle(vehicle: Vehicle) -> Self {
        match vehicle {
            Vehicle::Foot => Self::foot(),
            Vehicle::Bicycle => Self::bicycle(),
            Vehicle::Car => Self::car(),
        }
    }

    #[must_use]
    pub fn with_speed(mut self, type_id: TypeId, speed: f64) -> Self {
        self.speeds.insert(type_id, speed);
        self
    }

    /// Checks that all speeds and limits are usable for cost calculations.
    ///
    /// # Errors
    ///
    /// Fails on a non-positive vehicle max speed, or on negative or non-finite values.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if !(self.vehicle_max_speed.is_finite() && self.vehicle_max_speed > 0.0) {
            return Err(ProfileError::VehicleMaxSpeed(self.vehicle_max_speed));
        }
        let speeds = self
            .speeds
            .iter()
            .map(|(type_id, speed)| (format!("type {type_id}"), *speed))
            .chain([("the default".to_string(), self.default_speed)]);
        for (target, value) in speeds {
            if !is_non_negative(value) {
                return Err(ProfileError::Speed { target, value });
            }
        }
        for (target, value) in [
            ("cost_limit_distance_km", self.cost_limit_distance_km),
            ("cost_limit_factor", self.cost_limit_factor),
            ("penalty_same_type_m", self.penalty_same_type_m),
            ("penalty_different_type_m", self.penalty_different_type_m),
            ("max_penalty_s", self.max_penalty_s),
        ] {
            if !is_non_negative(value) {
                return Err(ProfileError::Parameter { target, value });
            }
        }
        Ok(())
    }

    /// The configured speed for `type_id`, ignoring the vehicle limit.
    pub fn type_speed(&self, type_id: TypeId) -> f64 {
        self.speeds
            .get(&type_id)
            .copied()
            .unwrap_or(self.default_speed)
    }

    /// The effective speed along `object`: its speed limit if known,
    /// else the speed for its type, capped by the vehicle.
    pub fn speed_for(&self, object: &ObjectVariant) -> f64 {
        let speed = if object.max_speed > 0 {
            f64::from(object.max_speed)
        } else {
            self.type_speed(object.type_id)
        };
        speed.min(self.vehicle_max_speed)
    }

    fn can_use(&self, node: &RouteNode, path_index: usize) -> bool {
        let Some(path) = node.paths().get(path_index) else {
            return false;
        };
        path.is_usable_by(self.vehicle)
            && node
                .object_for_path(path_index)
                .is_some_and(|object| self.type_speed(object.type_id) > 0.0)
    }

    fn time_for(&self, node: &RouteNode, path_index: usize) -> Option<f64> {
        let path = node.paths().get(path_index)?;
        let speed = self.speed_for(node.object_for_path(path_index)?);
        (speed > 0.0).then(|| path.distance_m / 1000.0 / speed)
    }
}

fn is_non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Minimizes travel time. Costs are hours.
#[derive(Clone, Debug)]
pub struct FastestPathProfile {
    config: ProfileConfig,
}

impl FastestPathProfile {
    /// # Errors
    ///
    /// Fails if `config` doesn't pass [`ProfileConfig::validate`].
    pub fn new(config: ProfileConfig) -> Result<Self, ProfileError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }
}

impl RoutingProfile for FastestPathProfile {
    fn vehicle(&self) -> Vehicle {
        self.config.vehicle
    }

    fn can_use(&self, node: &RouteNode, path_index: usize) -> bool {
        self.config.can_use(node, path_index)
    }

    fn edge_cost(&self, node: &RouteNode, path_index: usize) -> f64 {
        self.config
            .time_for(node, path_index)
            .unwrap_or(f64::INFINITY)
    }

    fn transition_cost(
        &self,
        node: &RouteNode,
        incoming: Option<&ObjectVariant>,
        path_index: usize,
    ) -> f64 {
        if !self.config.junction_penalty {
            return 0.0;
        }
        let (Some(incoming), Some(outgoing)) = (incoming, node.object_for_path(path_index)) else {
            return 0.0;
        };
        if incoming.object == outgoing.object {
            return 0.0;
        }

        let penalty_m = if incoming.type_id == outgoing.type_id {
            self.config.penalty_same_type_m
        } else {
            self.config.penalty_different_type_m
        };
        let speed = self.config.speed_for(outgoing);
        if speed <= 0.0 {
            return 0.0;
        }
        (penalty_m / 1000.0 / speed).min(self.config.max_penalty_s / 3600.0)
    }

    fn cost_for_distance(&self, distance_km: f64) -> f64 {
        distance_km / self.config.vehicle_max_speed
    }

    fn cost_limit(&self, direct_km: f64) -> f64 {
        self.cost_for_distance(self.config.cost_limit_distance_km)
            + self.cost_for_distance(direct_km) * self.config.cost_limit_factor
    }

    fn time_for(&self, node: &RouteNode, path_index: usize) -> Option<f64> {
        self.config.time_for(node, path_index)
    }
}

/// Minimizes travelled distance. Costs are kilometers.
#[derive(Clone, Debug)]
pub struct ShortestPathProfile {
    config: ProfileConfig,
}

impl ShortestPathProfile {
    /// # Errors
    ///
    /// Fails if `config` doesn't pass [`ProfileConfig::validate`].
    pub fn new(config: ProfileConfig) -> Result<Self, ProfileError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ProfileConfig {
        &self.config
    }
}

impl RoutingProfile for ShortestPathProfile {
    fn vehicle(&self) -> Vehicle {
        self.config.vehicle
    }

    fn can_use(&self, node: &RouteNode, path_index: usize) -> bool {
        self.config.can_use(node, path_index)
    }

    fn edge_cost(&self, node: &RouteNode, path_index: usize) -> f64 {
        node.paths()
            .get(path_index)
            .map_or(f64::INFINITY, |path| path.distance_m / 1000.0)
    }

    fn cost_for_distance(&self, distance_km: f64) -> f64 {
        distance_km
    }

    fn cost_limit(&self, direct_km: f64) -> f64 {
        self.config.cost_limit_distance_km + direct_km * self.config.cost_limit_factor
    }

    fn time_for(&self, node: &RouteNode, path_index: usize) -> Option<f64> {
        self.config.time_for(node, path_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enumset::EnumSet;
    use geo::coord;
    use mapvault_store::route_node::{ObjectFileRef, RefType, RoutePath};

    const RESIDENTIAL: TypeId = 3;
    const FOOTWAY: TypeId = 4;

    fn variant(offset: u64, type_id: TypeId, max_speed: u8) -> ObjectVariant {
        ObjectVariant {
            object: ObjectFileRef::new(RefType::Way, offset),
            type_id,
            max_speed,
        }
    }

    /// A node with one path per object, each 1.5 km long and usable by cars.
    fn junction(objects: &[ObjectVariant]) -> RouteNode {
        let mut node = RouteNode::new(1, coord! { x: 7.0, y: 43.0 });
        for (target_id, object) in (2..).zip(objects) {
            let object_index = node.add_object(*object);
            node.add_path(RoutePath {
                target_id,
                object_index,
                distance_m: 1500.0,
                usable: Vehicle::Car | Vehicle::Foot,
                restricted: EnumSet::empty(),
            });
        }
        node
    }

    #[test]
    fn speeds_prefer_limits_and_respect_the_vehicle() {
        let config = ProfileConfig::car().with_speed(RESIDENTIAL, 30.0);
        assert_eq!(config.speed_for(&variant(1, RESIDENTIAL, 0)), 30.0);
        assert_eq!(config.speed_for(&variant(1, RESIDENTIAL, 70)), 70.0);
        assert_eq!(config.speed_for(&variant(1, 99, 0)), 50.0);
        assert_eq!(config.speed_for(&variant(1, RESIDENTIAL, 250)), 160.0);
    }

    #[test]
    fn usage_depends_on_vehicle_and_type() {
        let node = junction(&[variant(10, RESIDENTIAL, 0), variant(20, FOOTWAY, 0)]);
        let car =
            ShortestPathProfile::new(ProfileConfig::car().with_speed(FOOTWAY, 0.0)).unwrap();
        assert!(car.can_use(&node, 0));
        assert!(!car.can_use(&node, 1));
        assert!(!car.can_use(&node, 2));

        let bicycle = ShortestPathProfile::new(ProfileConfig::bicycle()).unwrap();
        assert!(!bicycle.can_use(&node, 0));

        let foot = ShortestPathProfile::new(ProfileConfig::foot()).unwrap();
        assert!(foot.can_use(&node, 1));
    }

    #[test]
    fn fastest_costs_are_hours() {
        let node = junction(&[variant(10, RESIDENTIAL, 0), variant(20, RESIDENTIAL, 90)]);
        let profile =
            FastestPathProfile::new(ProfileConfig::car().with_speed(RESIDENTIAL, 30.0)).unwrap();
        assert!((profile.edge_cost(&node, 0) - 0.05).abs() < 1e-12);
        assert!((profile.edge_cost(&node, 1) - 1.5 / 90.0).abs() < 1e-12);
        assert!(profile.edge_cost(&node, 7).is_infinite());
        assert_eq!(profile.time_for(&node, 0), Some(profile.edge_cost(&node, 0)));

        // 20 km at 160 km/h plus 7.5 times 16 km at 160 km/h
        assert!((profile.cost_limit(16.0) - 0.875).abs() < 1e-12);
    }

    #[test]
    fn shortest_costs_are_kilometers() {
        let node = junction(&[variant(10, RESIDENTIAL, 0)]);
        let profile = ShortestPathProfile::new(ProfileConfig::foot()).unwrap();
        assert_eq!(profile.edge_cost(&node, 0), 1.5);
        assert_eq!(profile.cost_for_distance(3.0), 3.0);
        assert_eq!(profile.cost_limit(2.0), 20.0);
        assert_eq!(profile.transition_cost(&node, Some(&variant(99, FOOTWAY, 0)), 0), 0.0);
        assert!((profile.time_for(&node, 0).unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn junction_penalties() {
        let residential = variant(10, RESIDENTIAL, 0);
        let node = junction(&[residential, variant(20, RESIDENTIAL, 0), variant(30, FOOTWAY, 0)]);
        let config = ProfileConfig::car()
            .with_speed(RESIDENTIAL, 36.0)
            .with_speed(FOOTWAY, 36.0);
        let profile = FastestPathProfile::new(config.clone()).unwrap();

        // Staying on the same object, or starting, is free
        assert_eq!(profile.transition_cost(&node, Some(&residential), 0), 0.0);
        assert_eq!(profile.transition_cost(&node, None, 1), 0.0);

        // 40 m at 36 km/h is 4 s
        let same = profile.transition_cost(&node, Some(&residential), 1);
        assert!((same * 3600.0 - 4.0).abs() < 1e-9);
        // 250 m at 36 km/h is 25 s, capped at 10 s
        let different = profile.transition_cost(&node, Some(&residential), 2);
        assert!((different * 3600.0 - 10.0).abs() < 1e-9);

        let without = FastestPathProfile::new(ProfileConfig {
            junction_penalty: false,
            ..config
        })
        .unwrap();
        assert_eq!(without.transition_cost(&node, Some(&residential), 2), 0.0);
    }

    #[test]
    fn unusable_configurations_are_rejected() {
        for vehicle in [Vehicle::Foot, Vehicle::Bicycle, Vehicle::Car] {
            assert_eq!(ProfileConfig::for_vehicle(vehicle).validate(), Ok(()));
        }

        for speed in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let config = ProfileConfig {
                vehicle_max_speed: speed,
                ..ProfileConfig::car()
            };
            assert!(matches!(
                FastestPathProfile::new(config.clone()),
                Err(ProfileError::VehicleMaxSpeed(_))
            ));
            assert!(ShortestPathProfile::new(config).is_err());
        }

        assert_eq!(
            ProfileConfig::car().with_speed(RESIDENTIAL, -1.0).validate(),
            Err(ProfileError::Speed {
                target: "type 3".to_string(),
                value: -1.0
            })
        );
        let config = ProfileConfig {
            cost_limit_factor: f64::NAN,
            ..ProfileConfig::foot()
        };
        assert!(matches!(
            config.validate(),
            Err(ProfileError::Parameter {
                target: "cost_limit_factor",
                ..
            })
        ));
        // A type speed of zero only closes the type
        assert_eq!(
            ProfileConfig::car().with_speed(FOOTWAY, 0.0).validate(),
            Ok(())
        );
    }
}
