#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Single-threaded authoritative tick loop for Blockfall.
//!
//! The [`Simulation`] ingests player actions scheduled for future ticks,
//! advances the registry one tick at a time, and periodically emits a full
//! registry dump. It owns no I/O: the server adapter drains the transport,
//! feeds actions in, and ships the produced [`Message`]s out.

use std::collections::BTreeMap;

use blockfall_core::{
    Action, ActionKind, ActionPhase, Angle, CellCoord, EntityId, EntityKind, EntityState,
    LevelRecord, Message, PayloadState, Position, SpawnError, Tick, Velocity, CELL_WIDTH,
    DEFAULT_BROADCAST_INTERVAL,
};
use blockfall_world::{query, Event, FaultPolicy, Registry};

const SPAWN_SHUFFLE_SEED: u64 = 0x8f1b_7a42_5c09_d36e;
const SPAWN_HEALTH: i32 = 100;

/// Configuration for a fresh authoritative simulation.
#[derive(Clone, Debug)]
pub struct Config {
    /// Level name reported to joining clients.
    pub name: String,
    /// Level identifier reported to joining clients.
    pub level_id: u64,
    /// World width in cells.
    pub width: u32,
    /// World height in cells.
    pub height: u32,
    /// Full-dump broadcast cadence in ticks; zero disables the broadcast.
    pub broadcast_interval: u64,
    /// Whether to verify registry consistency after every tick.
    pub self_check: bool,
}

impl Config {
    /// Creates a configuration with the default broadcast cadence and the
    /// self-check disabled.
    #[must_use]
    pub fn new(name: impl Into<String>, level_id: u64, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            level_id,
            width,
            height,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            self_check: false,
        }
    }
}

/// The authoritative server simulation.
#[derive(Debug)]
pub struct Simulation {
    registry: Registry,
    name: String,
    level_id: u64,
    pending: BTreeMap<Tick, Vec<ActionKind>>,
    tick: Tick,
    broadcast_interval: u64,
    self_check: bool,
}

impl Simulation {
    /// Creates a simulation over an empty world.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            registry: Registry::new(config.width, config.height, FaultPolicy::Fatal),
            name: config.name,
            level_id: config.level_id,
            pending: BTreeMap::new(),
            tick: Tick::ZERO,
            broadcast_interval: config.broadcast_interval,
            self_check: config.self_check,
        }
    }

    /// Restores a simulation from a persisted level record.
    pub fn from_level(
        record: &LevelRecord,
        broadcast_interval: u64,
        self_check: bool,
    ) -> Result<Self, SpawnError> {
        let mut registry = Registry::new(record.width, record.height, FaultPolicy::Fatal);
        for state in &record.entities {
            registry.add(state)?;
        }
        registry.observe_highest_id(record.highest_id);
        Ok(Self {
            registry,
            name: record.name.clone(),
            level_id: record.id,
            pending: BTreeMap::new(),
            tick: Tick::ZERO,
            broadcast_interval,
            self_check,
        })
    }

    /// Next tick the simulation will execute.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Read-only access to the authoritative registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Level name reported to clients.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Level identifier reported to clients.
    #[must_use]
    pub const fn level_id(&self) -> u64 {
        self.level_id
    }

    /// Schedules an action, clamping a target tick that is already past
    /// forward to the next tick to execute. Returns the effective tick so
    /// callers can rebroadcast the delta with the tick it will really run at.
    pub fn schedule(&mut self, action: Action) -> Tick {
        let target = if action.at_tick < self.tick {
            log::debug!(
                "action targeting past tick {} clamped to {}",
                action.at_tick.get(),
                self.tick.get()
            );
            self.tick
        } else {
            action.at_tick
        };
        self.pending.entry(target).or_default().push(action.kind);
        target
    }

    /// Schedules an action received from a client.
    ///
    /// Creation requests get a server-allocated identifier and are owned by
    /// the requesting player; clients never pick ids.
    pub fn schedule_from_client(&mut self, player: EntityId, mut action: Action) -> Tick {
        if let ActionKind::AddEntity { state } = &mut action.kind {
            state.id = self.allocate_id();
            state.owner = Some(player);
        }
        self.schedule(action)
    }

    /// Executes one tick: pre-pass actions, the physics pass, post-pass
    /// creations, score awards, then the periodic broadcast. With the
    /// self-check enabled, a consistency violation is returned for the
    /// caller to abort on.
    pub fn run_tick(
        &mut self,
        out: &mut Vec<Message>,
    ) -> Result<(), query::ConsistencyError> {
        let current = self.tick;
        let due = self.pending.remove(&current).unwrap_or_default();
        let (pre, post): (Vec<ActionKind>, Vec<ActionKind>) = due
            .into_iter()
            .partition(|kind| kind.phase() == ActionPhase::PrePass);

        for kind in pre {
            blockfall_world::apply_pre_pass(&mut self.registry, &kind);
        }

        let mut events = Vec::new();
        self.registry.update(&mut events);

        for kind in post {
            self.apply_creation(kind, current, out);
        }
        self.award_scores(&events, current, out);

        self.tick = current.next();

        if self.broadcast_interval > 0 && current.get() % self.broadcast_interval == 0 {
            out.push(self.registry_message());
        }
        if self.self_check {
            query::check_consistency(&self.registry)?;
        }
        Ok(())
    }

    /// Spawns a player entity at a free cell and broadcasts the join.
    ///
    /// The spawn cell is picked from a deterministically shuffled scan of
    /// the world; a fully obstructed world yields [`SpawnError::Occupied`]
    /// and the requester is simply not admitted.
    pub fn connect_player(
        &mut self,
        name: &str,
        out: &mut Vec<Message>,
    ) -> Result<EntityState, SpawnError> {
        let id = self.allocate_id();
        let seed = SPAWN_SHUFFLE_SEED ^ u64::from(id.get()).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        for cell in spawn_candidates(self.registry.width(), self.registry.height(), seed) {
            let state = player_spawn_state(id, name, cell);
            match self.registry.add(&state) {
                Ok(()) => {
                    out.push(Message::AddPlayers {
                        states: vec![state.clone()],
                        at_tick: self.last_completed_tick(),
                    });
                    return Ok(state);
                }
                Err(SpawnError::Occupied) => continue,
                Err(error) => return Err(error),
            }
        }
        Err(SpawnError::Occupied)
    }

    /// Removes a disconnected player's entity and broadcasts the removal.
    pub fn disconnect_player(&mut self, id: EntityId, out: &mut Vec<Message>) {
        if !self.registry.contains(id) {
            log::debug!("disconnect for unknown player entity {}", id.get());
            return;
        }
        self.registry.doom(id);
        self.registry.purge_doomed();
        out.push(Message::DeleteEntities {
            ids: vec![id],
            at_tick: self.tick,
        });
    }

    /// The world-description message sent to a joining client.
    #[must_use]
    pub fn world_message(&self) -> Message {
        Message::World {
            name: self.name.clone(),
            id: self.level_id,
            width: self.registry.width(),
            height: self.registry.height(),
            highest_id: self.registry.highest_id(),
        }
    }

    /// The full-registry resync message describing the last completed tick.
    #[must_use]
    pub fn registry_message(&self) -> Message {
        Message::Registry {
            entities: query::dump(&self.registry),
            highest_id: self.registry.highest_id(),
            at_tick: self.last_completed_tick(),
        }
    }

    /// Persisted form of the current level. Players are excluded.
    #[must_use]
    pub fn level_record(&self) -> LevelRecord {
        LevelRecord {
            name: self.name.clone(),
            id: self.level_id,
            width: self.registry.width(),
            height: self.registry.height(),
            highest_id: self.registry.highest_id(),
            entities: query::dump(&self.registry)
                .into_iter()
                .filter(|state| !state.is_player())
                .collect(),
        }
    }

    fn last_completed_tick(&self) -> Tick {
        Tick::new(self.tick.get().saturating_sub(1))
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = self.registry.highest_id().successor();
        self.registry.observe_highest_id(id);
        id
    }

    fn apply_creation(&mut self, kind: ActionKind, tick: Tick, out: &mut Vec<Message>) {
        let ActionKind::AddEntity { state } = kind else {
            unreachable!("post-pass actions are creations");
        };
        match blockfall_world::apply_creation(&mut self.registry, &state) {
            Ok(()) => {
                let message = if state.is_player() {
                    Message::AddPlayers {
                        states: vec![state],
                        at_tick: tick,
                    }
                } else {
                    Message::AddNpcs {
                        states: vec![state],
                        at_tick: tick,
                    }
                };
                out.push(message);
            }
            Err(error) => {
                log::info!(
                    "creation of entity {} rejected: {error}",
                    state.id.get()
                );
            }
        }
    }

    fn award_scores(&mut self, events: &[Event], current: Tick, out: &mut Vec<Message>) {
        let mut awards: BTreeMap<EntityId, i32> = BTreeMap::new();
        for event in events {
            if let Event::Destroyed {
                entity,
                kind: EntityKind::Player,
                source: Some(credit),
            } = event
            {
                if credit != entity {
                    *awards.entry(*credit).or_insert(0) += 1;
                }
            }
        }

        for (credit, bump) in awards {
            let Some(state) = query::entity_state(&self.registry, credit) else {
                continue;
            };
            let PayloadState::Player { score, .. } = state.payload else {
                continue;
            };
            let target = current.next();
            let updated = score + bump;
            let _ = self.schedule(Action {
                at_tick: target,
                kind: ActionKind::UpdateScore {
                    entity: credit,
                    score: updated,
                },
            });
            out.push(Message::UpdateScore {
                entity: credit,
                score: updated,
                at_tick: target,
            });
        }
    }
}

fn player_spawn_state(id: EntityId, name: &str, cell: CellCoord) -> EntityState {
    EntityState {
        id,
        position: Position::new(cell.column() * CELL_WIDTH, cell.row() * CELL_WIDTH),
        velocity: Velocity::ZERO,
        angle: Angle::from_degrees(0),
        moving: true,
        owner: None,
        payload: PayloadState::Player {
            name: name.to_owned(),
            health: SPAWN_HEALTH,
            score: 0,
        },
    }
}

fn spawn_candidates(width: u32, height: u32, seed: u64) -> Vec<CellCoord> {
    let mut cells = Vec::with_capacity((width as usize).saturating_mul(height as usize));
    for row in 0..height {
        for column in 0..width {
            cells.push(CellCoord::new(column as i32, row as i32));
        }
    }

    let mut rng_state = seed;
    for index in (1..cells.len()).rev() {
        rng_state = next_random(rng_state);
        let swap_index = (rng_state % (index as u64 + 1)) as usize;
        cells.swap(index, swap_index);
    }
    cells
}

fn next_random(state: u64) -> u64 {
    state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulation() -> Simulation {
        Simulation::new(Config::new("test-level", 7, 32, 32))
    }

    #[test]
    fn stale_actions_are_clamped_to_the_next_tick() {
        let mut simulation = simulation();
        let mut out = Vec::new();
        for _ in 0..5 {
            simulation.run_tick(&mut out).expect("tick");
        }

        let effective = simulation.schedule(Action {
            at_tick: Tick::new(2),
            kind: ActionKind::DeleteEntities { ids: Vec::new() },
        });
        assert_eq!(effective, Tick::new(5));
    }

    #[test]
    fn client_creations_get_server_allocated_ids() {
        let mut simulation = simulation();
        let mut out = Vec::new();
        let player = simulation.connect_player("alice", &mut out).expect("join");

        let _ = simulation.schedule_from_client(
            player.id,
            Action {
                at_tick: Tick::new(0),
                kind: ActionKind::AddEntity {
                    state: EntityState {
                        id: EntityId::new(9999),
                        position: Position::new(0, 0),
                        velocity: Velocity::clamped(8, 0),
                        angle: Angle::from_degrees(0),
                        moving: true,
                        owner: None,
                        payload: PayloadState::Projectile { damage: 25 },
                    },
                },
            },
        );

        let scheduled = simulation
            .pending
            .values()
            .flatten()
            .find_map(|kind| match kind {
                ActionKind::AddEntity { state } => Some(state.clone()),
                _ => None,
            })
            .expect("creation scheduled");
        assert_ne!(scheduled.id, EntityId::new(9999));
        assert_eq!(scheduled.owner, Some(player.id));
    }

    #[test]
    fn broadcast_follows_the_configured_cadence() {
        let mut config = Config::new("test-level", 7, 32, 32);
        config.broadcast_interval = 15;
        let mut simulation = Simulation::new(config);

        let mut dumps = Vec::new();
        for _ in 0..31 {
            let mut out = Vec::new();
            simulation.run_tick(&mut out).expect("tick");
            dumps.extend(out.into_iter().filter_map(|message| match message {
                Message::Registry { at_tick, .. } => Some(at_tick.get()),
                _ => None,
            }));
        }
        assert_eq!(dumps, vec![0, 15, 30]);
    }

    #[test]
    fn zero_interval_disables_the_broadcast() {
        let mut config = Config::new("test-level", 7, 32, 32);
        config.broadcast_interval = 0;
        let mut simulation = Simulation::new(config);

        let mut out = Vec::new();
        for _ in 0..30 {
            simulation.run_tick(&mut out).expect("tick");
        }
        assert!(!out
            .iter()
            .any(|message| matches!(message, Message::Registry { .. })));
    }

    #[test]
    fn level_record_excludes_players() {
        let mut simulation = simulation();
        let mut out = Vec::new();
        let _ = simulation.connect_player("alice", &mut out).expect("join");
        let _ = simulation.schedule(Action {
            at_tick: Tick::new(0),
            kind: ActionKind::AddEntity {
                state: EntityState {
                    id: EntityId::new(500),
                    position: Position::new(512, 512),
                    velocity: Velocity::ZERO,
                    angle: Angle::from_degrees(0),
                    moving: false,
                    owner: None,
                    payload: PayloadState::Obstacle,
                },
            },
        });
        simulation.run_tick(&mut out).expect("tick");

        let record = simulation.level_record();
        assert_eq!(record.entities.len(), 1);
        assert!(!record.entities[0].is_player());
        assert_eq!(record.highest_id, simulation.registry().highest_id());
    }

    #[test]
    fn rejected_creation_leaves_the_registry_untouched() {
        let mut simulation = simulation();
        let mut out = Vec::new();
        let _ = simulation.schedule(Action {
            at_tick: Tick::new(0),
            kind: ActionKind::AddEntity {
                state: EntityState {
                    id: EntityId::new(500),
                    position: Position::new(512, 512),
                    velocity: Velocity::ZERO,
                    angle: Angle::from_degrees(0),
                    moving: false,
                    owner: None,
                    payload: PayloadState::Obstacle,
                },
            },
        });
        // Same spot: the second creation must be rejected without a trace.
        let _ = simulation.schedule(Action {
            at_tick: Tick::new(0),
            kind: ActionKind::AddEntity {
                state: EntityState {
                    id: EntityId::new(501),
                    position: Position::new(512, 512),
                    velocity: Velocity::ZERO,
                    angle: Angle::from_degrees(0),
                    moving: false,
                    owner: None,
                    payload: PayloadState::Obstacle,
                },
            },
        });
        simulation.run_tick(&mut out).expect("tick");

        assert_eq!(simulation.registry().len(), 1);
        let creations = out
            .iter()
            .filter(|message| matches!(message, Message::AddNpcs { .. }))
            .count();
        assert_eq!(creations, 1);
    }

    #[test]
    fn self_check_passes_over_a_busy_run() {
        let mut config = Config::new("test-level", 7, 32, 32);
        config.self_check = true;
        let mut simulation = Simulation::new(config);

        let mut out = Vec::new();
        let alice = simulation.connect_player("alice", &mut out).expect("alice");
        let _ = simulation.connect_player("bob", &mut out).expect("bob");
        let _ = simulation.schedule_from_client(
            alice.id,
            Action {
                at_tick: Tick::new(3),
                kind: ActionKind::AddEntity {
                    state: EntityState {
                        id: EntityId::new(0),
                        position: alice.position,
                        velocity: Velocity::clamped(CELL_WIDTH, 0),
                        angle: Angle::from_degrees(90),
                        moving: true,
                        owner: None,
                        payload: PayloadState::Projectile { damage: 25 },
                    },
                },
            },
        );

        for _ in 0..60 {
            simulation.run_tick(&mut out).expect("consistent tick");
        }
    }

    #[test]
    fn move_executes_exactly_at_its_target_tick() {
        let mut simulation = simulation();
        let mut out = Vec::new();
        let _ = simulation.schedule(Action {
            at_tick: Tick::new(0),
            kind: ActionKind::AddEntity {
                state: EntityState {
                    id: EntityId::new(1),
                    position: Position::new(1024, 1024),
                    velocity: Velocity::ZERO,
                    angle: Angle::from_degrees(0),
                    moving: false,
                    owner: None,
                    payload: PayloadState::Block { durability: 10 },
                },
            },
        });
        simulation.run_tick(&mut out).expect("tick 0");

        let _ = simulation.schedule(Action {
            at_tick: Tick::new(4),
            kind: ActionKind::Move {
                entity: EntityId::new(1),
                velocity: Velocity::clamped(16, 0),
                angle: Angle::from_degrees(90),
            },
        });

        for expected_tick in 1..4 {
            simulation.run_tick(&mut out).expect("tick");
            let state =
                query::entity_state(simulation.registry(), EntityId::new(1)).expect("state");
            assert_eq!(
                state.velocity.x(),
                0,
                "move ran early at tick {expected_tick}"
            );
        }

        simulation.run_tick(&mut out).expect("tick 4");
        let state = query::entity_state(simulation.registry(), EntityId::new(1)).expect("state");
        assert_eq!(state.position.x(), 1024 + 16);
    }
}
