//! Routing over a route graph written to and read from disk.

use enumset::EnumSet;
use geo::coord;
use mapvault_route::{
    FastestPathProfile, ProfileConfig, RouteDescription, RoutePosition, RoutingOutcome,
    RoutingParameter, RoutingService, ShortestPathProfile,
};
use mapvault_store::route_graph::RouteGraphBuilder;
use mapvault_store::route_node::{ObjectFileRef, ObjectVariant, RefType, RouteNode, RoutePath};
use mapvault_store::{Database, DatabaseParameter, TypeId, Vehicle};
use tempfile::TempDir;

const PRIMARY: TypeId = 2;
const RESIDENTIAL: TypeId = 3;

fn way(offset: u64, type_id: TypeId) -> ObjectVariant {
    ObjectVariant {
        object: ObjectFileRef::new(RefType::Way, offset),
        type_id,
        max_speed: 0,
    }
}

/// Five nodes about 1.1 km apart, a residential street from 1 to 3
/// continued by a primary road from 3 to 5.
fn write_town() -> TempDir {
    let objects = [
        (1, 2, way(100, RESIDENTIAL)),
        (2, 3, way(100, RESIDENTIAL)),
        (3, 4, way(200, PRIMARY)),
        (4, 5, way(200, PRIMARY)),
    ];
    let mut nodes: Vec<RouteNode> = (1..=5_u32)
        .map(|id| RouteNode::new(u64::from(id), coord! { x: 7.0 + f64::from(id) * 0.01, y: 43.0 }))
        .collect();

    for (a, b, object) in objects {
        for (from, to) in [(a, b), (b, a)] {
            let node = &mut nodes[from - 1];
            let object_index = node.add_object(object);
            node.add_path(RoutePath {
                target_id: u64::try_from(to).unwrap(),
                object_index,
                distance_m: 1_500.0,
                usable: Vehicle::Car | Vehicle::Bicycle,
                restricted: EnumSet::empty(),
            });
        }
    }

    let directory = TempDir::new().unwrap();
    let mut builder = RouteGraphBuilder::new();
    for node in nodes {
        builder.add(node);
    }
    builder.write(directory.path()).unwrap();
    directory
}

fn car() -> ProfileConfig {
    ProfileConfig::car()
        .with_speed(RESIDENTIAL, 30.0)
        .with_speed(PRIMARY, 60.0)
}

#[test]
fn route_through_database() {
    let directory = write_town();
    let database = Database::open(directory.path(), DatabaseParameter::default()).unwrap();
    let graph = database.route_graph().unwrap().unwrap();
    let service = RoutingService::new(graph);
    let profile = FastestPathProfile::new(car()).unwrap();

    let result = service
        .calculate_route(
            RoutePosition::Coord(coord! { x: 7.0101, y: 43.0001 }),
            RoutePosition::Node(5),
            &profile,
            &RoutingParameter::default(),
        )
        .unwrap();
    let route = result.route().unwrap();
    assert_eq!(route.node_ids(), vec![1, 2, 3, 4, 5]);

    // Six minutes on the residential street, three on the primary road,
    // plus ten seconds for turning from one into the other
    let expected_h = 0.15 + 10.0 / 3600.0;
    assert!((route.total_cost - expected_h).abs() < 1e-9);

    let description = RouteDescription::from_route(route, service.provider().as_ref(), &profile)
        .unwrap();
    assert_eq!(description.segments.len(), 2);
    assert!((description.distance_km() - 6.0).abs() < 1e-9);
    insta::assert_snapshot!(description.to_string(), @r"
    0.000 km | 0:00:00 | way 100 (type 3) | 1 -> 3 | 3.000 km
    3.000 km | 0:06:00 | way 200 (type 2) | 3 -> 5 | 3.000 km
    6.000 km | 0:09:00 | arrived at 5
    ");
}

#[test]
fn vehicles_without_access_find_no_route() {
    let directory = write_town();
    let database = Database::open(directory.path(), DatabaseParameter::default()).unwrap();
    let service = RoutingService::new(database.route_graph().unwrap().unwrap());

    let result = service
        .calculate_route(
            RoutePosition::Node(1),
            RoutePosition::Node(5),
            &ShortestPathProfile::new(ProfileConfig::foot()).unwrap(),
            &RoutingParameter::default(),
        )
        .unwrap();
    assert_eq!(result.outcome, RoutingOutcome::NoRoute);

    let result = service
        .calculate_route(
            RoutePosition::Node(5),
            RoutePosition::Node(1),
            &ShortestPathProfile::new(ProfileConfig::bicycle()).unwrap(),
            &RoutingParameter::default(),
        )
        .unwrap();
    let route = result.route().unwrap();
    assert_eq!(route.node_ids(), vec![5, 4, 3, 2, 1]);
    assert!((route.total_cost - 6.0).abs() < 1e-9);
}
