use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use blockfall_core::{
    Action, ActionKind, Angle, EntityId, EntityState, PayloadState, Position, Tick,
    Velocity, CELL_WIDTH,
};
use blockfall_system_prediction::{Advance, Predictor};
use blockfall_system_simulation::{Config, Simulation};
use blockfall_world::query;

const WORLD_CELLS: u32 = 48;
const TICKS: u64 = 24;

const FLOOR_A: u32 = 10;
const FLOOR_B: u32 = 11;
const VICTIM: u32 = 12;
const SHOOTER: u32 = 13;
const FLOOR_C: u32 = 14;
const SHOT: u32 = 20;

#[test]
fn replay_reaches_identical_registries_on_both_sides() {
    let (server, client) = replay();
    assert_eq!(server, client, "server and predictor diverged");
}

#[test]
fn replay_is_deterministic_across_runs() {
    let first = replay();
    let second = replay();
    assert_eq!(fingerprint(&first), fingerprint(&second));
}

#[test]
fn destruction_awards_the_shooter_a_score_delta_on_both_sides() {
    let (server, _) = replay();
    let shooter = server
        .iter()
        .find(|state| state.id == EntityId::new(SHOOTER))
        .expect("shooter survives");
    match &shooter.payload {
        PayloadState::Player { score, .. } => assert_eq!(*score, 1),
        _ => panic!("shooter is not a player"),
    }
    assert!(!server.iter().any(|state| state.id == EntityId::new(VICTIM)));
    assert!(!server.iter().any(|state| state.id == EntityId::new(SHOT)));
}

/// Runs the scripted scenario on the authoritative simulation while a
/// predictor mirrors it over the message stream, asserting lockstep
/// equality after every tick. Returns both final dumps.
fn replay() -> (Vec<EntityState>, Vec<EntityState>) {
    let mut config = Config::new("replay", 3, WORLD_CELLS, WORLD_CELLS);
    config.broadcast_interval = 5;
    config.self_check = true;
    let mut simulation = Simulation::new(config);

    // Baseline: one executed tick, mirrored into the predictor as a dump.
    let mut wire = Vec::new();
    simulation.run_tick(&mut wire).expect("tick 0");
    let mut predictor = Predictor::new(WORLD_CELLS, WORLD_CELLS);
    predictor.ingest(&simulation.registry_message());
    assert_eq!(predictor.advance(), Advance::Shown(Tick::new(0)));

    for action in script() {
        let _ = simulation.schedule(action.clone());
        // Creations reach the predictor through the server's add broadcasts;
        // everything else is echoed the way the adapter relays deltas.
        if !matches!(action.kind, ActionKind::AddEntity { .. }) {
            predictor.add_delta(action);
        }
    }

    for tick in 1..=TICKS {
        let mut wire = Vec::new();
        simulation.run_tick(&mut wire).expect("tick");
        for message in &wire {
            predictor.ingest(message);
        }
        assert_eq!(predictor.advance(), Advance::Shown(Tick::new(tick)));

        let server_dump = query::dump(simulation.registry());
        let client_dump = query::dump(predictor.registry().expect("registry"));
        assert_eq!(server_dump, client_dump, "divergence at tick {tick}");
    }

    (
        query::dump(simulation.registry()),
        query::dump(predictor.registry().expect("registry")),
    )
}

fn script() -> Vec<Action> {
    vec![
        creation(1, obstacle(FLOOR_A, 8, 16)),
        creation(1, obstacle(FLOOR_B, 9, 16)),
        creation(1, obstacle(FLOOR_C, 13, 16)),
        creation(1, player(VICTIM, 8, 15)),
        creation(1, player(SHOOTER, 13, 15)),
        Action {
            at_tick: Tick::new(4),
            kind: ActionKind::Move {
                entity: EntityId::new(SHOOTER),
                velocity: Velocity::ZERO,
                angle: Angle::from_degrees(270),
            },
        },
        creation(5, shot(SHOT, SHOOTER, 12, 15)),
        // Pull a floor piece away late so gravity re-engages on both sides.
        Action {
            at_tick: Tick::new(12),
            kind: ActionKind::DeleteEntities {
                ids: vec![EntityId::new(FLOOR_C)],
            },
        },
    ]
}

fn creation(at_tick: u64, state: EntityState) -> Action {
    Action {
        at_tick: Tick::new(at_tick),
        kind: ActionKind::AddEntity { state },
    }
}

fn obstacle(id: u32, column: i32, row: i32) -> EntityState {
    EntityState {
        id: EntityId::new(id),
        position: Position::new(column * CELL_WIDTH, row * CELL_WIDTH),
        velocity: Velocity::ZERO,
        angle: Angle::from_degrees(0),
        moving: false,
        owner: None,
        payload: PayloadState::Obstacle,
    }
}

fn player(id: u32, column: i32, row: i32) -> EntityState {
    EntityState {
        id: EntityId::new(id),
        position: Position::new(column * CELL_WIDTH, row * CELL_WIDTH),
        velocity: Velocity::ZERO,
        angle: Angle::from_degrees(0),
        moving: true,
        owner: None,
        payload: PayloadState::Player {
            name: format!("p{id}"),
            health: 100,
            score: 0,
        },
    }
}

fn shot(id: u32, owner: u32, column: i32, row: i32) -> EntityState {
    EntityState {
        id: EntityId::new(id),
        position: Position::new(column * CELL_WIDTH, row * CELL_WIDTH),
        velocity: Velocity::clamped(-CELL_WIDTH, 0),
        angle: Angle::from_degrees(270),
        moving: true,
        owner: Some(EntityId::new(owner)),
        payload: PayloadState::Projectile { damage: 100 },
    }
}

fn fingerprint(dumps: &(Vec<EntityState>, Vec<EntityState>)) -> u64 {
    let mut hasher = DefaultHasher::new();
    dumps.hash(&mut hasher);
    hasher.finish()
}
