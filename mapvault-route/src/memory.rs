//! An in-memory routing graph, for graphs built at runtime and for testing.

use geo::Coord;
use mapvault_store::route_graph::RouteGraphError;
use mapvault_store::route_node::{Exclude, ObjectVariant, RouteNode, RouteNodeProvider, RoutePath};
use mapvault_store::spatial::spherical_distance_km;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct MemoryGraph {
    nodes: BTreeMap<u64, Arc<RouteNode>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, replacing any node with the same id.
    pub fn insert(&mut self, node: RouteNode) {
        self.nodes.insert(node.id(), Arc::new(node));
    }

    /// Adds `path` along `object` to the node `from`.
    /// The object index of `path` is set to the index of `object`.
    ///
    /// Returns false if there is no node `from`.
    pub fn add_path(&mut self, from: u64, object: ObjectVariant, mut path: RoutePath) -> bool {
        let Some(node) = self.nodes.get_mut(&from) else {
            return false;
        };
        let node = Arc::make_mut(node);
        path.object_index = node.add_object(object);
        node.add_path(path);
        true
    }

    /// Forbids a turn at the node `at`.
    ///
    /// Returns false if there is no node `at`.
    pub fn add_exclude(&mut self, at: u64, exclude: Exclude) -> bool {
        let Some(node) = self.nodes.get_mut(&at) else {
            return false;
        };
        Arc::make_mut(node).add_exclude(exclude);
        true
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<RouteNode>> {
        self.nodes.values()
    }
}

impl FromIterator<RouteNode> for MemoryGraph {
    fn from_iter<I: IntoIterator<Item = RouteNode>>(iter: I) -> Self {
        let mut graph = Self::new();
        for node in iter {
            graph.insert(node);
        }
        graph
    }
}

impl RouteNodeProvider for MemoryGraph {
    fn route_node(&self, id: u64) -> Result<Option<Arc<RouteNode>>, RouteGraphError> {
        Ok(self.nodes.get(&id).cloned())
    }

    fn nearest_route_node(
        &self,
        coord: Coord,
        max_radius_m: f64,
    ) -> Result<Option<Arc<RouteNode>>, RouteGraphError> {
        let max_radius_km = max_radius_m / 1000.0;
        Ok(self
            .nodes
            .values()
            .map(|node| (spherical_distance_km(coord, node.coord()), node))
            .filter(|(distance, _)| *distance <= max_radius_km)
            .min_by(|(a, node_a), (b, node_b)| {
                a.total_cmp(b).then_with(|| node_a.id().cmp(&node_b.id()))
            })
            .map(|(_, node)| Arc::clone(node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enumset::EnumSet;
    use geo::coord;
    use mapvault_store::route_node::{ObjectFileRef, RefType, Vehicle};

    #[test]
    fn nearest_node_prefers_smaller_ids_on_ties() {
        let graph: MemoryGraph = [
            RouteNode::new(7, coord! { x: 7.500_976_562_5, y: 43.0 }),
            RouteNode::new(3, coord! { x: 7.499_023_437_5, y: 43.0 }),
            RouteNode::new(9, coord! { x: 7.6, y: 43.0 }),
        ]
        .into_iter()
        .collect();

        let center = coord! { x: 7.5, y: 43.0 };
        let nearest = graph.nearest_route_node(center, 500.0).unwrap().unwrap();
        assert_eq!(nearest.id(), 3);
        assert!(graph.nearest_route_node(center, 50.0).unwrap().is_none());
    }

    #[test]
    fn paths_reference_their_object() {
        let mut graph = MemoryGraph::new();
        graph.insert(RouteNode::new(1, coord! { x: 7.0, y: 43.0 }));
        let object = ObjectVariant {
            object: ObjectFileRef::new(RefType::Way, 42),
            type_id: 5,
            max_speed: 0,
        };
        let path = RoutePath {
            target_id: 2,
            object_index: 99,
            distance_m: 10.0,
            usable: EnumSet::only(Vehicle::Foot),
            restricted: EnumSet::empty(),
        };
        assert!(graph.add_path(1, object, path));
        assert!(!graph.add_path(5, object, path));

        let node = graph.route_node(1).unwrap().unwrap();
        assert_eq!(node.paths()[0].object_index, 0);
        assert_eq!(node.object_for_path(0), Some(&object));
    }
}
