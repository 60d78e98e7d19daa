use std::{fs, path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use geo::{Coord, coord};
use mapvault_route::{
    FastestPathProfile, ProfileConfig, RouteDescription, RoutePosition, RoutingOutcome,
    RoutingParameter, RoutingProfile, RoutingService, ShortestPathProfile,
};
use mapvault_store::data_file::Record;
use mapvault_store::route_node::RouteNode;
use mapvault_store::{
    Database, DatabaseParameter, GeoBox, MapObject, RouteNodeProvider, TypeId, TypeSet, Vehicle,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "mapvault-cli", author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON config naming the database directory
    #[arg(env)]
    mapvault_config: PathBuf,

    /// Subcommand/tool to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pretty-print a route node and its file offset
    Lookup {
        /// Route node ID
        id: u64,
    },
    /// List the objects of one kind intersecting a bounding box
    QueryBox {
        #[arg(value_enum)]
        index: IndexKind,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
        /// Type IDs to include (default: all types in the index)
        #[arg(long, value_delimiter = ',')]
        types: Vec<TypeId>,
    },
    /// Calculate a route between two coordinates
    Route {
        /// Start as lat,lon
        #[arg(long, value_parser = parse_lat_lon)]
        from: Coord,
        /// Target as lat,lon
        #[arg(long, value_parser = parse_lat_lon)]
        to: Coord,
        #[arg(long, value_enum, default_value_t = VehicleArg::Car)]
        vehicle: VehicleArg,
        /// Minimize distance instead of travel time
        #[arg(long)]
        shortest: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum IndexKind {
    Nodes,
    Ways,
    Areas,
    OptimizedWays,
    OptimizedAreas,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VehicleArg {
    Foot,
    Bicycle,
    Car,
}

impl From<VehicleArg> for Vehicle {
    fn from(value: VehicleArg) -> Self {
        match value {
            VehicleArg::Foot => Vehicle::Foot,
            VehicleArg::Bicycle => Vehicle::Bicycle,
            VehicleArg::Car => Vehicle::Car,
        }
    }
}

/// The config file.
#[derive(Debug, Deserialize)]
struct Config {
    database: PathBuf,
    #[serde(default)]
    parameter: DatabaseParameter,
    /// Replace the built-in presets for their vehicle
    #[serde(default)]
    profiles: Vec<ProfileConfig>,
}

impl Config {
    fn profile(&self, vehicle: Vehicle) -> ProfileConfig {
        self.profiles
            .iter()
            .find(|profile| profile.vehicle == vehicle)
            .cloned()
            .unwrap_or_else(|| ProfileConfig::for_vehicle(vehicle))
    }
}

fn parse_lat_lon(input: &str) -> anyhow::Result<Coord> {
    let (lat, lon) = input
        .split_once(',')
        .ok_or_else(|| anyhow!("Expected lat,lon"))?;
    let lat = f64::from_str(lat.trim()).context("invalid latitude")?;
    let lon = f64::from_str(lon.trim()).context("invalid longitude")?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(anyhow!("Coordinate out of range: {lat},{lon}"));
    }
    Ok(coord! { x: lon, y: lat })
}

fn read_config(path: &PathBuf) -> anyhow::Result<Config> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read config at {}", path.display()))?;
    let config: Config =
        serde_json::from_slice(&bytes).context("Invalid JSON in mapvault config")?;
    for profile in &config.profiles {
        profile
            .validate()
            .with_context(|| format!("Invalid {:?} profile in mapvault config", profile.vehicle))?;
    }
    Ok(config)
}

fn route_node_json(node: &RouteNode, offset: Option<u64>) -> JsonValue {
    serde_json::json!({
        "id": node.id(),
        "offset": offset,
        "lat": node.coord().y,
        "lon": node.coord().x,
        "objects": node.objects().iter().map(|object| serde_json::json!({
            "object": object.object,
            "type": object.type_id,
            "max_speed": object.max_speed,
        })).collect::<Vec<_>>(),
        "paths": node.paths().iter().map(|path| serde_json::json!({
            "target_id": path.target_id,
            "object_index": path.object_index,
            "distance_m": path.distance_m,
            "usable": path.usable.iter().collect::<Vec<_>>(),
            "restricted": path.restricted.iter().collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
        "excludes": node.excludes().iter().map(|exclude| serde_json::json!({
            "source": exclude.source,
            "target_index": exclude.target_index,
        })).collect::<Vec<_>>(),
    })
}

fn objects_json<T: MapObject + Record>(objects: &[Arc<T>]) -> JsonValue {
    let objects: Vec<_> = objects
        .iter()
        .map(|object| {
            let bbox = object.bounding_box();
            serde_json::json!({
                "offset": object.offset(),
                "type": object.type_id(),
                "bbox": [bbox.min_lat(), bbox.min_lon(), bbox.max_lat(), bbox.max_lon()],
            })
        })
        .collect();
    serde_json::json!({
        "count": objects.len(),
        "objects": objects,
    })
}

fn lookup(database: &Database, id: u64) -> anyhow::Result<JsonValue> {
    let graph = database
        .route_graph()?
        .ok_or_else(|| anyhow!("The database has no route graph"))?;
    let offset = graph.offset_of(id)?;
    let node = graph
        .route_node(id)?
        .ok_or_else(|| anyhow!("Route node {id} not found"))?;
    Ok(route_node_json(&node, offset))
}

fn query_box(
    database: &Database,
    index: IndexKind,
    bbox: &GeoBox,
    types: Vec<TypeId>,
) -> anyhow::Result<JsonValue> {
    let types = if types.is_empty() {
        let indexed = database.indexed_types()?;
        match index {
            IndexKind::Nodes => indexed.nodes,
            IndexKind::Ways => indexed.ways,
            IndexKind::Areas => indexed.areas,
            IndexKind::OptimizedWays => indexed.optimized_ways,
            IndexKind::OptimizedAreas => indexed.optimized_areas,
        }
    } else {
        types.into_iter().collect::<TypeSet>()
    };
    debug!(?index, types = types.len(), ?bbox, "Querying box");

    Ok(match index {
        IndexKind::Nodes => objects_json(&database.get_nodes_by_box(bbox, &types)?),
        IndexKind::Ways => objects_json(&database.get_ways_by_box(bbox, &types)?),
        IndexKind::Areas => objects_json(&database.get_areas_by_box(bbox, &types)?),
        IndexKind::OptimizedWays => {
            objects_json(&database.get_optimized_ways_by_box(bbox, &types)?)
        }
        IndexKind::OptimizedAreas => {
            objects_json(&database.get_optimized_areas_by_box(bbox, &types)?)
        }
    })
}

fn route(
    database: &Database,
    config: &Config,
    from: Coord,
    to: Coord,
    vehicle: Vehicle,
    shortest: bool,
) -> anyhow::Result<JsonValue> {
    let graph = database
        .route_graph()?
        .ok_or_else(|| anyhow!("The database has no route graph"))?;
    let service = RoutingService::new(graph);
    let config = config.profile(vehicle);
    let profile: Box<dyn RoutingProfile> = if shortest {
        Box::new(ShortestPathProfile::new(config)?)
    } else {
        Box::new(FastestPathProfile::new(config)?)
    };

    let result = service.calculate_route(
        RoutePosition::Coord(from),
        RoutePosition::Coord(to),
        profile.as_ref(),
        &RoutingParameter::default(),
    )?;
    info!(statistics = ?result.statistics, "Route calculation done");

    let outcome = match &result.outcome {
        RoutingOutcome::Found(route) => {
            let description =
                RouteDescription::from_route(route, service.provider().as_ref(), profile.as_ref())?;
            serde_json::json!({
                "outcome": "found",
                "route": route,
                "description": description,
            })
        }
        RoutingOutcome::NoRoute => serde_json::json!({ "outcome": "no_route" }),
        RoutingOutcome::CostLimitExceeded => {
            serde_json::json!({ "outcome": "cost_limit_exceeded" })
        }
        RoutingOutcome::Aborted => serde_json::json!({ "outcome": "aborted" }),
    };
    Ok(serde_json::json!({
        "result": outcome,
        "statistics": result.statistics,
    }))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        // Standard logger, configured via the RUST_LOG env variable
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .init();

    let cli = Cli::parse();
    let config = read_config(&cli.mapvault_config)?;
    info!(path = %config.database.display(), "Opening database");
    let database = Database::open(&config.database, config.parameter.clone())
        .with_context(|| format!("Failed to open database at {}", config.database.display()))?;

    let output = match cli.command {
        Commands::Lookup { id } => lookup(&database, id)?,
        Commands::QueryBox {
            index,
            min_lat,
            min_lon,
            max_lat,
            max_lon,
            types,
        } => {
            let bbox = GeoBox::new(
                coord! { x: min_lon, y: min_lat },
                coord! { x: max_lon, y: max_lat },
            );
            query_box(&database, index, &bbox, types)?
        }
        Commands::Route {
            from,
            to,
            vehicle,
            shortest,
        } => route(&database, &config, from, to, vehicle.into(), shortest)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    database.close()?;
    Ok(())
}
