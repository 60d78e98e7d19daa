//! # Routing over mapvault route graphs
//!
//! [`RoutingService`] runs an A* search over any [`RouteNodeProvider`],
//! such as a file-backed [`RouteGraph`](mapvault_store::RouteGraph) or a [`MemoryGraph`].
//! What a route costs is decided by a [`RoutingProfile`].

mod memory;
mod profile;
mod route;
mod service;

pub use mapvault_store::route_node::RouteNodeProvider;
pub use memory::MemoryGraph;
pub use profile::{
    FastestPathProfile, ProfileConfig, ProfileError, RoutingProfile, ShortestPathProfile,
};
pub use route::{NodeDescription, RouteData, RouteDescription, RouteEntry, RoutePathRef, RouteSegment};
pub use service::{
    Breaker, ProgressCallback, RoutePosition, RoutingError, RoutingOutcome, RoutingParameter,
    RoutingResult, RoutingService, RoutingStatistics,
};
