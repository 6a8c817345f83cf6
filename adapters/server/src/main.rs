#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Authoritative Blockfall server.
//!
//! Runs the single-threaded tick loop: drain the transport, execute due
//! actions, advance the registry, broadcast. Pacing polls the transport in
//! a tight loop until wall-clock time reaches `tick_index / 60` seconds
//! from run start, bounding drift without ever blocking input handling.

mod net;
mod storage;

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use blockfall_core::{DEFAULT_BROADCAST_INTERVAL, TICK_RATE};
use blockfall_system_simulation::{Config, Simulation};
use clap::Parser;
use rand::RngCore as _;

use net::Network;
use storage::Storage;

const PROFILE_WINDOW: u64 = 300;

/// Authoritative game server for Blockfall.
#[derive(Debug, Parser)]
#[command(name = "blockfall-server")]
struct Args {
    /// Level to load from storage, or to create when absent.
    #[arg(long, default_value = "world")]
    level: String,
    /// World width in cells, used when creating a fresh level.
    #[arg(long, default_value_t = 48)]
    width: u32,
    /// World height in cells, used when creating a fresh level.
    #[arg(long, default_value_t = 32)]
    height: u32,
    /// TCP port to listen on.
    #[arg(long, default_value_t = 35_565)]
    port: u16,
    /// Directory holding persisted levels and accounts.
    #[arg(long, default_value = "levels")]
    storage: PathBuf,
    /// Maximum number of simultaneous clients.
    #[arg(long, default_value_t = 16)]
    max_clients: usize,
    /// Verify registry consistency after every tick and abort on
    /// violation. Duplicates O(registry) work per tick; diagnostics only.
    #[arg(long)]
    self_check: bool,
    /// Log tick timing statistics.
    #[arg(long)]
    profile: bool,
    /// Full-dump broadcast cadence in ticks; zero disables it.
    #[arg(long, default_value_t = DEFAULT_BROADCAST_INTERVAL)]
    broadcast_interval: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let storage = Storage::open(&args.storage).context("opening storage directory")?;
    let mut simulation = match storage.load_level(&args.level)? {
        Some(record) => {
            log::info!(
                "loaded level '{}' with {} entities",
                record.name,
                record.entities.len()
            );
            Simulation::from_level(&record, args.broadcast_interval, args.self_check)
                .context("restoring level")?
        }
        None => {
            log::info!(
                "creating level '{}' at {}x{} cells",
                args.level,
                args.width,
                args.height
            );
            let mut config =
                Config::new(args.level.clone(), level_id(&args.level), args.width, args.height);
            config.broadcast_interval = args.broadcast_interval;
            config.self_check = args.self_check;
            Simulation::new(config)
        }
    };

    let mut network =
        Network::bind(args.port, args.max_clients, session_key()).context("binding listener")?;

    let start = Instant::now();
    let mut window_elapsed = Duration::ZERO;
    loop {
        let due = start
            + Duration::from_micros(
                simulation
                    .tick()
                    .get()
                    .saturating_mul(1_000_000)
                    / u64::from(TICK_RATE),
            );
        network.poll_until(due, &mut simulation, &storage);
        network.drop_stale(&mut simulation);

        let tick_started = Instant::now();
        let mut outbound = Vec::new();
        simulation
            .run_tick(&mut outbound)
            .context("registry consistency violation")?;
        network.broadcast(&outbound);

        if args.profile {
            window_elapsed += tick_started.elapsed();
            if simulation.tick().get() % PROFILE_WINDOW == 0 {
                log::info!(
                    "tick {}: {:?} average over the last {PROFILE_WINDOW} ticks",
                    simulation.tick().get(),
                    window_elapsed / PROFILE_WINDOW as u32
                );
                window_elapsed = Duration::ZERO;
            }
        }
    }
}

/// Stable level identifier derived from the level name.
fn level_id(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Key material handed to clients during the handshake. The handshake's
/// cryptography lives in the transport layer; the simulation only needs
/// the exchange to produce a comparable credential.
fn session_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}
