//! # Routes and their descriptions
//!
//! A [`RouteData`] is the raw result of a search: the route nodes passed and the paths taken.
//! [`RouteDescription::from_route`] annotates it with distances and travel times,
//! and merges consecutive steps along the same object into segments.

use crate::profile::RoutingProfile;
use crate::service::RoutingError;
use geo::Coord;
use mapvault_store::TypeId;
use mapvault_store::route_node::{ObjectFileRef, RefType, RouteNode, RouteNodeProvider};
use std::fmt;

/// A path taken from one route node to the next.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RoutePathRef {
    /// Index into the paths of the node the path starts at.
    pub path_index: usize,
    pub target_id: u64,
    pub object: ObjectFileRef,
    pub type_id: TypeId,
    pub distance_m: f64,
}

impl RoutePathRef {
    /// Describes the path of `node` with the given index.
    pub fn new(node: &RouteNode, path_index: usize) -> Option<Self> {
        let path = node.paths().get(path_index)?;
        let object = node.object_for_path(path_index)?;
        Some(Self {
            path_index,
            target_id: path.target_id,
            object: object.object,
            type_id: object.type_id,
            distance_m: path.distance_m,
        })
    }
}

/// A route node on a route, with the path taken to the next entry (none for the last one).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RouteEntry {
    pub node_id: u64,
    pub coord: Coord,
    pub path: Option<RoutePathRef>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RouteData {
    pub entries: Vec<RouteEntry>,
    /// In the unit of the profile the route was calculated with.
    pub total_cost: f64,
}

impl RouteData {
    pub fn node_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.node_id).collect()
    }

    pub fn distance_km(&self) -> f64 {
        self.entries
            .iter()
            .filter_map(|entry| entry.path)
            .map(|path| path.distance_m / 1000.0)
            .sum()
    }
}

/// A route node on a described route, with the distance and time to get there.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct NodeDescription {
    pub node_id: u64,
    pub coord: Coord,
    pub distance_km: f64,
    pub time_h: f64,
}

/// Consecutive steps along one object.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RouteSegment {
    pub object: ObjectFileRef,
    pub type_id: TypeId,
    pub from_node: u64,
    pub to_node: u64,
    /// Distance and time at the start of the segment.
    pub start_distance_km: f64,
    pub start_time_h: f64,
    pub distance_km: f64,
    pub time_h: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RouteDescription {
    pub nodes: Vec<NodeDescription>,
    pub segments: Vec<RouteSegment>,
}

impl RouteDescription {
    /// Describes `route`, timing every path with `profile`.
    ///
    /// # Errors
    ///
    /// Fails if a route node can't be loaded from `provider`.
    pub fn from_route<P, R>(
        route: &RouteData,
        provider: &P,
        profile: &R,
    ) -> Result<Self, RoutingError>
    where
        P: RouteNodeProvider + ?Sized,
        R: RoutingProfile + ?Sized,
    {
        let mut description = Self::default();
        let mut distance_km = 0.0;
        let mut time_h = 0.0;

        for entry in &route.entries {
            description.nodes.push(NodeDescription {
                node_id: entry.node_id,
                coord: entry.coord,
                distance_km,
                time_h,
            });
            let Some(path) = entry.path else {
                continue;
            };

            let node = provider
                .route_node(entry.node_id)?
                .ok_or(RoutingError::UnknownNode(entry.node_id))?;
            let step_km = path.distance_m / 1000.0;
            let step_h = profile.time_for(&node, path.path_index).unwrap_or(0.0);

            match description.segments.last_mut() {
                Some(segment) if segment.object == path.object => {
                    segment.to_node = path.target_id;
                    segment.distance_km += step_km;
                    segment.time_h += step_h;
                }
                _ => description.segments.push(RouteSegment {
                    object: path.object,
                    type_id: path.type_id,
                    from_node: entry.node_id,
                    to_node: path.target_id,
                    start_distance_km: distance_km,
                    start_time_h: time_h,
                    distance_km: step_km,
                    time_h: step_h,
                }),
            }
            distance_km += step_km;
            time_h += step_h;
        }
        Ok(description)
    }

    pub fn distance_km(&self) -> f64 {
        self.nodes.last().map_or(0.0, |node| node.distance_km)
    }

    pub fn time_h(&self) -> f64 {
        self.nodes.last().map_or(0.0, |node| node.time_h)
    }
}

impl fmt::Display for RouteDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            writeln!(
                f,
                "{:.3} km | {} | {} {} (type {}) | {} -> {} | {:.3} km",
                segment.start_distance_km,
                format_hours(segment.start_time_h),
                kind_name(segment.object.kind),
                segment.object.offset,
                segment.type_id,
                segment.from_node,
                segment.to_node,
                segment.distance_km,
            )?;
        }
        if let Some(last) = self.nodes.last() {
            write!(
                f,
                "{:.3} km | {} | arrived at {}",
                last.distance_km,
                format_hours(last.time_h),
                last.node_id
            )?;
        }
        Ok(())
    }
}

fn kind_name(kind: RefType) -> &'static str {
    match kind {
        RefType::Node => "node",
        RefType::Way => "way",
        RefType::Area => "area",
    }
}

/// Formats as `h:mm:ss`.
#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn format_hours(hours: f64) -> String {
    let seconds = (hours * 3600.0).round().max(0.0) as u64;
    format!("{}:{:02}:{:02}", seconds / 3600, seconds / 60 % 60, seconds % 60)
}
