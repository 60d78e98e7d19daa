//! # Route calculation
//!
//! A* search over a [`RouteNodeProvider`].
//!
//! Search states are keyed by node id plus whether the node was reached along a restricted path
//! (see [`RoutePath::restricted`](mapvault_store::route_node::RoutePath::restricted)).
//! A node reached along a restricted path may only continue along restricted paths,
//! unless the restricted area contains the start of the route.
//! This keeps routes from cutting through private or destination-only roads.
//!
//! Turn restrictions ([`Exclude`](mapvault_store::route_node::Exclude)) are checked
//! against the object the current node was reached along.
//! States don't distinguish the incoming object, so a node closed after a restricted
//! approach is not expanded again from another one.

use crate::profile::RoutingProfile;
use crate::route::{RouteData, RouteEntry, RoutePathRef};
use geo::Coord;
use mapvault_store::route_graph::RouteGraphError;
use mapvault_store::route_node::{ObjectVariant, RouteNode, RouteNodeProvider};
use mapvault_store::spatial::spherical_distance_km;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use thiserror::Error;
use tracing::{debug, trace};

const DEFAULT_ABORT_CHECK_INTERVAL: usize = 1_000;
const DEFAULT_NEAREST_NODE_RADIUS_M: f64 = 1_000.0;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    RouteGraph(#[from] RouteGraphError),
    #[error("Route node {0} does not exist")]
    UnknownNode(u64),
    #[error("No route node within {radius_m} m of ({lat}, {lon})")]
    NoNodeNearby { lat: f64, lon: f64, radius_m: f64 },
    #[error("Route node {from} has a path to route node {to}, which does not exist")]
    DanglingPath { from: u64, to: u64 },
}

/// Where a route starts or ends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RoutePosition {
    /// A route node, by id.
    Node(u64),
    /// Snaps to the nearest route node.
    Coord(Coord),
}

/// A shared flag for cancelling a running search from another thread.
#[derive(Clone, Debug, Default)]
pub struct Breaker(Arc<AtomicBool>);

impl Breaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, AtomicOrdering::Relaxed);
    }
}

/// Receives `(current_max_km, overall_km)`: how far the search got towards the target,
/// and the direct distance between start and target.
pub type ProgressCallback = Box<dyn Fn(f64, f64) + Send + Sync>;

pub struct RoutingParameter {
    pub breaker: Option<Breaker>,
    pub progress: Option<ProgressCallback>,
    /// The breaker is checked every this many expanded nodes.
    pub abort_check_interval: usize,
    /// How far to look for a route node when a [`RoutePosition::Coord`] is given.
    pub nearest_node_radius_m: f64,
}

impl Default for RoutingParameter {
    fn default() -> Self {
        Self {
            breaker: None,
            progress: None,
            abort_check_interval: DEFAULT_ABORT_CHECK_INTERVAL,
            nearest_node_radius_m: DEFAULT_NEAREST_NODE_RADIUS_M,
        }
    }
}

impl std::fmt::Debug for RoutingParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingParameter")
            .field("breaker", &self.breaker)
            .field("progress", &self.progress.is_some())
            .field("abort_check_interval", &self.abort_check_interval)
            .field("nearest_node_radius_m", &self.nearest_node_radius_m)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoutingOutcome {
    Found(RouteData),
    /// Every reachable node was expanded without reaching the target.
    NoRoute,
    /// Like [`RoutingOutcome::NoRoute`], but nodes beyond the cost limit were skipped.
    CostLimitExceeded,
    Aborted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RoutingStatistics {
    pub nodes_loaded: usize,
    pub nodes_expanded: usize,
    pub paths_skipped: usize,
    pub max_open_size: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoutingResult {
    pub outcome: RoutingOutcome,
    pub statistics: RoutingStatistics,
}

impl RoutingResult {
    pub fn route(&self) -> Option<&RouteData> {
        match &self.outcome {
            RoutingOutcome::Found(route) => Some(route),
            _ => None,
        }
    }
}

/// Identifies a search state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct StateKey {
    id: u64,
    restricted: bool,
}

/// An entry of the open list.
///
/// Entries are never updated in place; a cheaper path pushes a new entry
/// and the outdated one is skipped when popped.
#[derive(Clone, Copy, Debug)]
struct OpenEntry {
    overall_cost: f64,
    current_cost: f64,
    key: StateKey,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    /// Reversed, so the max-heap pops the cheapest entry; ties go to the smaller id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .overall_cost
            .total_cmp(&self.overall_cost)
            .then_with(|| other.key.id.cmp(&self.key.id))
            .then_with(|| other.key.restricted.cmp(&self.key.restricted))
            .then_with(|| other.current_cost.total_cmp(&self.current_cost))
    }
}

/// The best known way to reach a search state.
#[derive(Debug)]
struct Label {
    node: Arc<RouteNode>,
    current_cost: f64,
    /// The previous state and the index of the path taken there.
    previous: Option<(StateKey, usize)>,
    /// The object the node was reached along.
    incoming: Option<ObjectVariant>,
    leave_restricted: bool,
}

/// Calculates routes over the graph of a [`RouteNodeProvider`].
#[derive(Debug)]
pub struct RoutingService<P> {
    provider: Arc<P>,
}

impl<P: RouteNodeProvider> RoutingService<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Resolves a position to its route node.
    ///
    /// # Errors
    ///
    /// Fails if there is no such node, or the graph can't be read.
    pub fn resolve(
        &self,
        position: RoutePosition,
        nearest_node_radius_m: f64,
    ) -> Result<Arc<RouteNode>, RoutingError> {
        match position {
            RoutePosition::Node(id) => self
                .provider
                .route_node(id)?
                .ok_or(RoutingError::UnknownNode(id)),
            RoutePosition::Coord(coord) => self
                .provider
                .nearest_route_node(coord, nearest_node_radius_m)?
                .ok_or(RoutingError::NoNodeNearby {
                    lat: coord.y,
                    lon: coord.x,
                    radius_m: nearest_node_radius_m,
                }),
        }
    }

    /// Searches the cheapest route from `start` to `target`.
    ///
    /// Not finding a route is a regular outcome, see [`RoutingOutcome`].
    ///
    /// # Errors
    ///
    /// Fails if an endpoint can't be resolved, or the graph can't be read or is inconsistent.
    pub fn calculate_route<R: RoutingProfile + ?Sized>(
        &self,
        start: RoutePosition,
        target: RoutePosition,
        profile: &R,
        parameter: &RoutingParameter,
    ) -> Result<RoutingResult, RoutingError> {
        let start = self.resolve(start, parameter.nearest_node_radius_m)?;
        let target = self.resolve(target, parameter.nearest_node_radius_m)?;
        Search::new(&*self.provider, profile, parameter, &start, &target).run()
    }
}

/// The state of one search.
struct Search<'a, P, R: ?Sized> {
    provider: &'a P,
    profile: &'a R,
    parameter: &'a RoutingParameter,
    target_id: u64,
    target_coord: Coord,
    overall_distance_km: f64,
    current_max_distance_km: f64,
    cost_limit: f64,
    cost_limit_hit: bool,
    open: BinaryHeap<OpenEntry>,
    labels: HashMap<StateKey, Label>,
    closed: HashSet<StateKey>,
    statistics: RoutingStatistics,
    start: StateKey,
}

impl<'a, P: RouteNodeProvider, R: RoutingProfile + ?Sized> Search<'a, P, R> {
    fn new(
        provider: &'a P,
        profile: &'a R,
        parameter: &'a RoutingParameter,
        start: &Arc<RouteNode>,
        target: &Arc<RouteNode>,
    ) -> Self {
        let overall_distance_km = spherical_distance_km(start.coord(), target.coord());
        let start_key = StateKey {
            id: start.id(),
            restricted: false,
        };

        let mut search = Self {
            provider,
            profile,
            parameter,
            target_id: target.id(),
            target_coord: target.coord(),
            overall_distance_km,
            current_max_distance_km: 0.0,
            cost_limit: profile.cost_limit(overall_distance_km),
            cost_limit_hit: false,
            open: BinaryHeap::new(),
            labels: HashMap::new(),
            closed: HashSet::new(),
            statistics: RoutingStatistics::default(),
            start: start_key,
        };

        search.open.push(OpenEntry {
            overall_cost: profile.cost_for_distance(overall_distance_km),
            current_cost: 0.0,
            key: start_key,
        });
        search.labels.insert(
            start_key,
            Label {
                node: Arc::clone(start),
                current_cost: 0.0,
                previous: None,
                incoming: None,
                // The start may lie inside a restricted area
                leave_restricted: true,
            },
        );
        search
    }

    fn run(mut self) -> Result<RoutingResult, RoutingError> {
        debug!(
            start = self.start.id,
            target = self.target_id,
            distance_km = self.overall_distance_km,
            cost_limit = self.cost_limit,
            "Calculating route"
        );

        let outcome = loop {
            let Some(entry) = self.open.pop() else {
                break if self.cost_limit_hit {
                    RoutingOutcome::CostLimitExceeded
                } else {
                    RoutingOutcome::NoRoute
                };
            };
            if self.closed.contains(&entry.key) || self.is_outdated(&entry) {
                continue;
            }

            if self.statistics.nodes_expanded % self.parameter.abort_check_interval.max(1) == 0
                && self.parameter.breaker.as_ref().is_some_and(Breaker::is_aborted)
            {
                break RoutingOutcome::Aborted;
            }

            self.closed.insert(entry.key);
            self.statistics.nodes_expanded += 1;

            if entry.key.id == self.target_id {
                break RoutingOutcome::Found(self.route_to(entry.key));
            }

            self.expand(entry.key)?;
            self.statistics.max_open_size = self.statistics.max_open_size.max(self.open.len());
        };

        debug!(
            outcome = outcome_name(&outcome),
            expanded = self.statistics.nodes_expanded,
            loaded = self.statistics.nodes_loaded,
            "Route calculation finished"
        );
        Ok(RoutingResult {
            outcome,
            statistics: self.statistics,
        })
    }

    fn is_outdated(&self, entry: &OpenEntry) -> bool {
        self.labels
            .get(&entry.key)
            .is_none_or(|label| label.current_cost < entry.current_cost)
    }

    fn expand(&mut self, key: StateKey) -> Result<(), RoutingError> {
        let Some(label) = self.labels.get(&key) else {
            return Ok(());
        };
        let node = Arc::clone(&label.node);
        let current_cost = label.current_cost;
        let incoming = label.incoming;
        let leave_restricted = label.leave_restricted;
        let previous_id = label.previous.map(|(previous, _)| previous.id);
        let vehicle = self.profile.vehicle();

        trace!(id = key.id, restricted = key.restricted, current_cost, "Expanding route node");

        for (index, path) in node.paths().iter().enumerate() {
            let path_restricted = path.is_restricted_for(vehicle);
            if Some(path.target_id) == previous_id
                || (key.restricted && !path_restricted && !leave_restricted)
                || incoming.is_some_and(|incoming| node.is_turn_excluded(&incoming.object, index))
                || !self.profile.can_use(&node, index)
            {
                self.statistics.paths_skipped += 1;
                continue;
            }

            let next_key = StateKey {
                id: path.target_id,
                restricted: path_restricted,
            };
            if self.closed.contains(&next_key) {
                continue;
            }

            let cost = current_cost
                + self.profile.edge_cost(&node, index)
                + self
                    .profile
                    .transition_cost(&node, incoming.as_ref(), index);
            if self
                .labels
                .get(&next_key)
                .is_some_and(|existing| existing.current_cost <= cost)
            {
                continue;
            }

            let next_node = match self.labels.get(&next_key) {
                Some(existing) => Arc::clone(&existing.node),
                None => self.load(node.id(), path.target_id)?,
            };

            let distance_to_target_km = spherical_distance_km(next_node.coord(), self.target_coord);
            self.current_max_distance_km = self
                .current_max_distance_km
                .max(self.overall_distance_km - distance_to_target_km);
            let overall_cost = cost + self.profile.cost_for_distance(distance_to_target_km);
            if overall_cost > self.cost_limit {
                self.cost_limit_hit = true;
                self.statistics.paths_skipped += 1;
                continue;
            }

            if let Some(progress) = &self.parameter.progress {
                progress(self.current_max_distance_km, self.overall_distance_km);
            }

            let label = Label {
                node: next_node,
                current_cost: cost,
                previous: Some((key, index)),
                incoming: node.object_for_path(index).copied(),
                leave_restricted: path_restricted && leave_restricted,
            };
            self.labels.insert(next_key, label);
            self.open.push(OpenEntry {
                overall_cost,
                current_cost: cost,
                key: next_key,
            });
        }
        Ok(())
    }

    fn load(&mut self, from: u64, id: u64) -> Result<Arc<RouteNode>, RoutingError> {
        self.statistics.nodes_loaded += 1;
        self.provider
            .route_node(id)?
            .ok_or(RoutingError::DanglingPath { from, to: id })
    }

    /// Follows the labels back from `key` to the start.
    fn route_to(&self, key: StateKey) -> RouteData {
        let total_cost = self.labels.get(&key).map_or(0.0, |label| label.current_cost);
        let mut entries = Vec::new();
        let mut next: Option<RoutePathRef> = None;
        let mut current = Some(key);

        while let Some(label) = current.and_then(|key| self.labels.get(&key)) {
            entries.push(RouteEntry {
                node_id: label.node.id(),
                coord: label.node.coord(),
                path: next.take(),
            });
            current = match label.previous {
                Some((previous, index)) => {
                    next = self
                        .labels
                        .get(&previous)
                        .and_then(|previous| RoutePathRef::new(&previous.node, index));
                    Some(previous)
                }
                None => None,
            };
        }

        entries.reverse();
        RouteData {
            entries,
            total_cost,
        }
    }
}

fn outcome_name(outcome: &RoutingOutcome) -> &'static str {
    match outcome {
        RoutingOutcome::Found(_) => "found",
        RoutingOutcome::NoRoute => "no route",
        RoutingOutcome::CostLimitExceeded => "cost limit exceeded",
        RoutingOutcome::Aborted => "aborted",
    }
}
