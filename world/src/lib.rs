#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Authoritative spatial state management for Blockfall.
//!
//! The [`Registry`] owns the entity table, the grid index, the ownership
//! map, and the deferred-deletion list, and advances every entity one tick
//! at a time. The server holds the authoritative registry; the client
//! predictor holds clones of it. Both advance through the same code so that
//! an identical starting snapshot plus an identical ordered delta stream
//! reaches a bit-identical registry at the same tick.

mod entity;
mod transparency;

use std::collections::{BTreeMap, HashMap};

use blockfall_core::{
    ActionKind, Axis, BoundingBox, CellCoord, EntityId, EntityKind, EntityState,
    PayloadState, Position, SpawnError, Velocity, CELL_WIDTH, GRAVITY,
};

use entity::Entity;

/// How the registry reacts to consistency faults (duplicate registration,
/// purge of an absent entity).
///
/// The server runs [`FaultPolicy::Fatal`]: such a fault indicates a
/// simulation bug and panics. The client runs [`FaultPolicy::Log`]: resync
/// races can legitimately produce both faults, so they are logged and
/// tolerated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Panic on consistency faults.
    Fatal,
    /// Log consistency faults and continue.
    Log,
}

/// Observations emitted by the update pass for the simulation layer.
///
/// Events never feed back into physics; the pass itself stays a pure
/// function of the registry state so prediction and authority agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// An entity ran into its obstruction set (or the world border, in
    /// which case the set is empty).
    Impacted {
        /// The moving entity.
        entity: EntityId,
        /// Blocking entities in the swept region, ascending by id.
        obstructions: Vec<EntityId>,
        /// Speed on the blocked axis just before the impact.
        speed: i32,
    },
    /// An entity took damage.
    Damaged {
        /// The damaged entity.
        entity: EntityId,
        /// Amount of damage applied.
        amount: i32,
        /// Entity credited with the damage, if any.
        source: Option<EntityId>,
    },
    /// Damage reduced an entity to zero and doomed it.
    Destroyed {
        /// The destroyed entity.
        entity: EntityId,
        /// Kind of the destroyed entity.
        kind: EntityKind,
        /// Entity credited with the destruction, if any.
        source: Option<EntityId>,
    },
}

/// Spatial/ownership registry holding every live entity.
#[derive(Clone, Debug)]
pub struct Registry {
    entities: BTreeMap<EntityId, Entity>,
    players: Vec<EntityId>,
    others: Vec<EntityId>,
    grid: HashMap<CellCoord, Vec<EntityId>>,
    owned: BTreeMap<EntityId, Vec<EntityId>>,
    doomed: Vec<EntityId>,
    width: u32,
    height: u32,
    highest_id: EntityId,
    faults: FaultPolicy,
}

impl Registry {
    /// Creates an empty registry for a world of the given cell dimensions.
    #[must_use]
    pub fn new(width: u32, height: u32, faults: FaultPolicy) -> Self {
        Self {
            entities: BTreeMap::new(),
            players: Vec::new(),
            others: Vec::new(),
            grid: HashMap::new(),
            owned: BTreeMap::new(),
            doomed: Vec::new(),
            width,
            height,
            highest_id: EntityId::new(0),
            faults,
        }
    }

    /// World width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// World height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Reports whether the registry holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Reports whether an entity with the identifier is live.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Highest identifier observed so far, for allocation watermarks.
    #[must_use]
    pub const fn highest_id(&self) -> EntityId {
        self.highest_id
    }

    /// Raises the identifier watermark to at least the provided value.
    pub fn observe_highest_id(&mut self, id: EntityId) {
        if id > self.highest_id {
            self.highest_id = id;
        }
    }

    /// Fault policy this registry was created with.
    #[must_use]
    pub const fn fault_policy(&self) -> FaultPolicy {
        self.faults
    }

    /// Registers a new entity.
    ///
    /// Rejects positions outside the world and target cells obstructed by a
    /// non-transparent occupant. Registering an id that is already live is a
    /// consistency fault, never a silent overwrite. On success the entity
    /// gains grid membership and bordering entities are woken.
    pub fn add(&mut self, state: &EntityState) -> Result<(), SpawnError> {
        let entity = Entity::from_state(state);
        if !self.in_bounds(entity.position) {
            return Err(SpawnError::OutOfBounds);
        }
        if self.entities.contains_key(&entity.id) {
            self.fault(&format!(
                "duplicate registration of entity {}",
                entity.id.get()
            ));
            return Err(SpawnError::DuplicateId);
        }

        let target = entity.position.bounding_box();
        for other_id in self.ids_in_cells(&target.cells()) {
            let Some(other) = self.entities.get(&other_id) else {
                continue;
            };
            if other.position.bounding_box().intersects(&target)
                && !transparency::permits(&entity, other)
            {
                return Err(SpawnError::Occupied);
            }
        }

        let id = entity.id;
        match entity.kind() {
            EntityKind::Player => self.players.push(id),
            _ => self.others.push(id),
        }
        if let Some(owner) = entity.owner {
            self.owned.entry(owner).or_default().push(id);
        }
        for cell in target.cells() {
            self.grid_insert(cell, id);
        }
        self.observe_highest_id(id);
        let _ = self.entities.insert(id, entity);
        self.wake_bordering(&[target], id);
        Ok(())
    }

    /// Marks an entity for removal at the end of the current pass.
    pub fn doom(&mut self, id: EntityId) {
        if !self.doomed.contains(&id) {
            self.doomed.push(id);
        }
    }

    /// Physically removes every doomed entity. Called between update
    /// passes so iteration never observes a half-removed entity.
    pub fn purge_doomed(&mut self) {
        let doomed = std::mem::take(&mut self.doomed);
        for id in doomed {
            self.purge(id);
        }
    }

    /// Advances every moving entity one tick, then purges the doomed.
    ///
    /// Per entity: fall test first, then both movement axes, the axis with
    /// the larger velocity magnitude first and the other always attempted
    /// afterwards so diagonal motion is never dropped. An entity with zero
    /// velocity and no fall condition goes dormant. The pass never mutates
    /// scores; score changes arrive only as explicit deltas.
    pub fn update(&mut self, events: &mut Vec<Event>) {
        let moving: Vec<EntityId> = self
            .entities
            .values()
            .filter(|entity| entity.moving)
            .map(|entity| entity.id)
            .collect();
        for id in moving {
            if self.doomed.contains(&id) {
                continue;
            }
            self.step_entity(id, events);
        }
        self.purge_doomed();
    }

    /// Resolves an intended single-axis move.
    ///
    /// With no obstruction the move commits in full. Otherwise the position
    /// snaps flush to the near edge of the nearest obstruction (the world
    /// border counts as an obstruction with an empty set), velocity on the
    /// axis is zeroed, and the mover's impact reaction runs against the
    /// obstruction set with the pre-impact speed. Returns whether any
    /// movement occurred.
    pub fn resolve_axis_move(
        &mut self,
        id: EntityId,
        axis: Axis,
        delta: i32,
        events: &mut Vec<Event>,
    ) -> bool {
        if delta == 0 {
            return false;
        }
        let Some(mover) = self.entities.get(&id).cloned() else {
            log::debug!("axis move for unknown entity {}", id.get());
            return false;
        };

        let start = mover.position.along(axis);
        let bound = self.axis_bound(axis);
        let intended = start.saturating_add(delta);
        let bounded = intended.clamp(0, bound);
        let border_hit = bounded != intended;

        let target_box = with_axis(mover.position, axis, bounded).bounding_box();
        let swept = SweptRect::covering(&mover.position.bounding_box(), &target_box);

        let mut obstructions = Vec::new();
        for other_id in self.ids_in_cells(&swept.cells()) {
            if other_id == id {
                continue;
            }
            let Some(other) = self.entities.get(&other_id) else {
                continue;
            };
            if swept.intersects(&other.position.bounding_box())
                && !transparency::permits(&mover, other)
            {
                obstructions.push(other_id);
            }
        }

        if obstructions.is_empty() && !border_hit {
            return self.process_moving(id, mover.position.displaced(axis, delta));
        }

        let mut allowed = bounded;
        for obstruction in &obstructions {
            let Some(other) = self.entities.get(obstruction) else {
                continue;
            };
            let edge = if delta > 0 {
                other.position.along(axis) - CELL_WIDTH
            } else {
                other.position.along(axis) + CELL_WIDTH
            };
            allowed = if delta > 0 {
                allowed.min(edge)
            } else {
                allowed.max(edge)
            };
        }
        let allowed = allowed.clamp(start.min(bounded), start.max(bounded));

        let moved = self.process_moving(id, with_axis(mover.position, axis, allowed));
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.velocity = entity.velocity.with_component(axis, 0);
        }
        self.apply_impact(id, obstructions, delta.abs(), events);
        moved
    }

    /// Commits a position change: diffs the before/after occupied-cell
    /// sets, updates the grid, wakes all entities bordering either the old
    /// or the new box, and reports whether a move actually occurred.
    pub fn process_moving(&mut self, id: EntityId, new_position: Position) -> bool {
        let Some(entity) = self.entities.get(&id) else {
            log::debug!("position change for unknown entity {}", id.get());
            return false;
        };
        let old_position = entity.position;
        if old_position == new_position {
            return false;
        }

        let old_box = old_position.bounding_box();
        let new_box = new_position.bounding_box();
        let old_cells = old_box.cells();
        let new_cells = new_box.cells();
        for cell in &old_cells {
            if !new_cells.contains(cell) {
                self.grid_remove(*cell, id);
            }
        }
        for cell in &new_cells {
            if !old_cells.contains(cell) {
                self.grid_insert(*cell, id);
            }
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.position = new_position;
        }
        self.wake_bordering(&[old_box, new_box], id);
        true
    }

    /// All entities whose box covers the sub-pixel point, ascending by id.
    #[must_use]
    pub fn overlapping(&self, x: i32, y: i32) -> Vec<EntityId> {
        let cell = CellCoord::containing(x, y);
        let mut hits: Vec<EntityId> = self
            .grid
            .get(&cell)
            .into_iter()
            .flatten()
            .copied()
            .filter(|id| {
                self.entities
                    .get(id)
                    .is_some_and(|entity| entity.position.bounding_box().contains(x, y))
            })
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Applies a move delta: sets velocity and heading and wakes the entity.
    /// A stale target (entity no longer live) is logged and dropped, as is
    /// an attempt to steer anchored terrain.
    pub fn steer(&mut self, id: EntityId, velocity: Velocity, angle: blockfall_core::Angle) {
        let Some(entity) = self.entities.get_mut(&id) else {
            log::debug!("move for unknown entity {}", id.get());
            return;
        };
        if entity.kind() == EntityKind::Obstacle {
            log::debug!("move for anchored entity {}", id.get());
            return;
        }
        entity.velocity = velocity;
        entity.angle = angle;
        entity.moving = true;
    }

    /// Overwrites an entity's full state from an authoritative record,
    /// keeping grid membership and the ownership index in step. A record
    /// for an entity that is not live is logged and dropped.
    pub fn apply_entity_state(&mut self, state: &EntityState) {
        if !self.entities.contains_key(&state.id) {
            log::debug!("state update for unknown entity {}", state.id.get());
            return;
        }
        let _ = self.process_moving(state.id, state.position);

        let old_owner = self.entities.get(&state.id).and_then(|entity| entity.owner);
        if old_owner != state.owner {
            if let Some(owner) = old_owner {
                self.detach_owned(owner, state.id);
            }
            if let Some(owner) = state.owner {
                self.owned.entry(owner).or_default().push(state.id);
            }
        }
        if let Some(entity) = self.entities.get_mut(&state.id) {
            entity.apply_state_except_position(state);
            entity.owner = state.owner;
        }
    }

    /// Applies a score delta to a player entity. Stale targets are logged
    /// and dropped; non-player targets are logged and ignored.
    pub fn set_player_score(&mut self, id: EntityId, score: i32) {
        let Some(entity) = self.entities.get_mut(&id) else {
            log::debug!("score update for unknown entity {}", id.get());
            return;
        };
        if let PayloadState::Player { score: current, .. } = &mut entity.payload {
            *current = score;
        } else {
            log::debug!("score update for non-player entity {}", id.get());
        }
    }

    fn step_entity(&mut self, id: EntityId, events: &mut Vec<Event>) {
        if self.fall_test(id) {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.velocity =
                    Velocity::clamped(entity.velocity.x(), entity.velocity.y() + GRAVITY);
            }
        }

        let Some(entity) = self.entities.get(&id) else {
            return;
        };
        let velocity = entity.velocity;
        let (first, second) = if velocity.x().abs() >= velocity.y().abs() {
            (Axis::Horizontal, Axis::Vertical)
        } else {
            (Axis::Vertical, Axis::Horizontal)
        };

        let _ = self.resolve_axis_move(id, first, velocity.along(first), events);
        if self.doomed.contains(&id) {
            return;
        }
        let Some(entity) = self.entities.get(&id) else {
            return;
        };
        let second_delta = entity.velocity.along(second);
        let _ = self.resolve_axis_move(id, second, second_delta, events);
        if self.doomed.contains(&id) {
            return;
        }

        let falling = self.fall_test(id);
        if let Some(entity) = self.entities.get_mut(&id) {
            if entity.is_idle(falling) {
                entity.moving = false;
            }
        }
    }

    fn fall_test(&self, id: EntityId) -> bool {
        let Some(entity) = self.entities.get(&id) else {
            return false;
        };
        if !entity.subject_to_gravity() {
            return false;
        }
        if entity.position.y() >= self.axis_bound(Axis::Vertical) {
            return false;
        }
        let probe = entity.position.displaced(Axis::Vertical, 1).bounding_box();
        for other_id in self.ids_in_cells(&probe.cells()) {
            if other_id == id {
                continue;
            }
            let Some(other) = self.entities.get(&other_id) else {
                continue;
            };
            if other.position.bounding_box().intersects(&probe)
                && !transparency::permits(entity, other)
            {
                return false;
            }
        }
        true
    }

    fn apply_impact(
        &mut self,
        id: EntityId,
        obstructions: Vec<EntityId>,
        speed: i32,
        events: &mut Vec<Event>,
    ) {
        let Some(mover) = self.entities.get(&id) else {
            return;
        };
        let reaction = mover.impact_reaction(speed);
        let credit = mover.owner;
        events.push(Event::Impacted {
            entity: id,
            obstructions: obstructions.clone(),
            speed,
        });

        if reaction.damage_dealt > 0 {
            for obstruction in obstructions {
                self.damage_entity(obstruction, reaction.damage_dealt, credit, events);
            }
        }
        if reaction.self_damage > 0 {
            self.damage_entity(id, reaction.self_damage, None, events);
        }
        if reaction.consumed {
            self.doom(id);
        }
    }

    fn damage_entity(
        &mut self,
        id: EntityId,
        amount: i32,
        source: Option<EntityId>,
        events: &mut Vec<Event>,
    ) {
        let Some(entity) = self.entities.get_mut(&id) else {
            return;
        };
        let kind = entity.kind();
        let destroyed = entity.apply_damage(amount);
        events.push(Event::Damaged {
            entity: id,
            amount,
            source,
        });
        if destroyed {
            events.push(Event::Destroyed {
                entity: id,
                kind,
                source,
            });
            self.doom(id);
        }
    }

    fn purge(&mut self, id: EntityId) {
        let Some(entity) = self.entities.remove(&id) else {
            self.fault(&format!("purge of unknown entity {}", id.get()));
            return;
        };
        let entity_box = entity.position.bounding_box();
        for cell in entity_box.cells() {
            self.grid_remove(cell, id);
        }
        match entity.kind() {
            EntityKind::Player => self.players.retain(|player| *player != id),
            _ => self.others.retain(|other| *other != id),
        }
        if let Some(owner) = entity.owner {
            self.detach_owned(owner, id);
        }
        if let Some(orphans) = self.owned.remove(&id) {
            for orphan in orphans {
                if let Some(entity) = self.entities.get_mut(&orphan) {
                    entity.owner = None;
                }
            }
        }
        self.wake_bordering(&[entity_box], id);
    }

    fn detach_owned(&mut self, owner: EntityId, id: EntityId) {
        if let Some(list) = self.owned.get_mut(&owner) {
            list.retain(|owned| *owned != id);
            if list.is_empty() {
                let _ = self.owned.remove(&owner);
            }
        }
    }

    fn wake_bordering(&mut self, boxes: &[BoundingBox], exclude: EntityId) {
        let mut cells = Vec::new();
        for entity_box in boxes {
            for cell in entity_box.cells() {
                for row_offset in -1..=1 {
                    for column_offset in -1..=1 {
                        cells.push(CellCoord::new(
                            cell.column() + column_offset,
                            cell.row() + row_offset,
                        ));
                    }
                }
            }
        }
        cells.sort_unstable();
        cells.dedup();

        let mut to_wake = self.ids_in_cells(&cells);
        to_wake.retain(|id| *id != exclude);
        for id in to_wake {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.moving = true;
            }
        }
    }

    fn ids_in_cells(&self, cells: &[CellCoord]) -> Vec<EntityId> {
        let mut ids = Vec::new();
        for cell in cells {
            if let Some(bucket) = self.grid.get(cell) {
                ids.extend(bucket.iter().copied());
            }
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn grid_insert(&mut self, cell: CellCoord, id: EntityId) {
        self.grid.entry(cell).or_default().push(id);
    }

    fn grid_remove(&mut self, cell: CellCoord, id: EntityId) {
        if let Some(bucket) = self.grid.get_mut(&cell) {
            bucket.retain(|occupant| *occupant != id);
            if bucket.is_empty() {
                let _ = self.grid.remove(&cell);
            }
        }
    }

    fn in_bounds(&self, position: Position) -> bool {
        position.x() >= 0
            && position.y() >= 0
            && position.x() <= self.axis_bound(Axis::Horizontal)
            && position.y() <= self.axis_bound(Axis::Vertical)
    }

    fn axis_bound(&self, axis: Axis) -> i32 {
        let cells = match axis {
            Axis::Horizontal => self.width,
            Axis::Vertical => self.height,
        };
        ((cells as i32).saturating_mul(CELL_WIDTH) - CELL_WIDTH).max(0)
    }

    fn fault(&self, description: &str) {
        match self.faults {
            FaultPolicy::Fatal => panic!("registry consistency fault: {description}"),
            FaultPolicy::Log => log::warn!("registry consistency fault: {description}"),
        }
    }
}

/// Applies one pre-pass delta (move, delete, direct update, score) to the
/// registry.
///
/// Server and client both route deltas through this function, so an
/// identical ordered delta stream drives bit-identical registries on the
/// two sides. Creation deltas are post-pass and belong to
/// [`apply_creation`]; one reaching this function is logged and dropped.
pub fn apply_pre_pass(registry: &mut Registry, kind: &ActionKind) {
    match kind {
        ActionKind::Move {
            entity,
            velocity,
            angle,
        } => registry.steer(*entity, *velocity, *angle),
        ActionKind::DeleteEntities { ids } => {
            for id in ids {
                if registry.contains(*id) {
                    registry.doom(*id);
                } else {
                    log::debug!("delete of unknown entity {}", id.get());
                }
            }
        }
        ActionKind::UpdateEntities { states } => {
            for state in states {
                registry.apply_entity_state(state);
            }
        }
        ActionKind::UpdateScore { entity, score } => {
            registry.set_player_score(*entity, *score);
        }
        ActionKind::AddEntity { .. } => {
            log::warn!("creation delta reached the pre-pass applier; dropped");
        }
    }
}

/// Applies one creation delta to the registry, after the physics pass of
/// its tick. The created entity receives its first physics update on the
/// following tick on both server and client.
pub fn apply_creation(
    registry: &mut Registry,
    state: &EntityState,
) -> Result<(), SpawnError> {
    registry.add(state)
}

fn with_axis(position: Position, axis: Axis, coordinate: i32) -> Position {
    match axis {
        Axis::Horizontal => Position::new(coordinate, position.y()),
        Axis::Vertical => Position::new(position.x(), coordinate),
    }
}

/// Rectangle swept by one axis-aligned move, spanning the start and end
/// boxes of the mover.
#[derive(Clone, Copy, Debug)]
struct SweptRect {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

impl SweptRect {
    fn covering(a: &BoundingBox, b: &BoundingBox) -> Self {
        Self {
            left: a.left().min(b.left()),
            top: a.top().min(b.top()),
            right: a.right().max(b.right()),
            bottom: a.bottom().max(b.bottom()),
        }
    }

    fn intersects(&self, other: &BoundingBox) -> bool {
        self.left < other.right()
            && other.left() < self.right
            && self.top < other.bottom()
            && other.top() < self.bottom
    }

    fn cells(&self) -> Vec<CellCoord> {
        let first_column = self.left.div_euclid(CELL_WIDTH);
        let last_column = (self.right - 1).div_euclid(CELL_WIDTH);
        let first_row = self.top.div_euclid(CELL_WIDTH);
        let last_row = (self.bottom - 1).div_euclid(CELL_WIDTH);
        let mut cells = Vec::new();
        for row in first_row..=last_row {
            for column in first_column..=last_column {
                cells.push(CellCoord::new(column, row));
            }
        }
        cells
    }
}

/// Query functions that provide read-only access to the registry.
pub mod query {
    use super::{transparency, Registry};
    use blockfall_core::{EntityId, EntityKind, EntityState};
    use thiserror::Error;

    /// Violations surfaced by [`check_consistency`].
    #[derive(Clone, Debug, PartialEq, Eq, Error)]
    pub enum ConsistencyError {
        /// The id map size disagrees with the type lists.
        #[error("registry holds {total} entities but type lists hold {players} + {others}")]
        SizeMismatch {
            /// Entities in the id map.
            total: usize,
            /// Entries in the player list.
            players: usize,
            /// Entries in the non-player list.
            others: usize,
        },
        /// An entity is missing from its type list, or listed with the
        /// wrong type.
        #[error("entity {0} is missing from its type list")]
        TypeListMismatch(u32),
        /// The grid lacks an entity in a cell its box overlaps.
        #[error("entity {entity} is absent from grid cell ({column}, {row})")]
        GridMissing {
            /// The entity whose membership is incomplete.
            entity: u32,
            /// Cell column.
            column: i32,
            /// Cell row.
            row: i32,
        },
        /// The grid lists an entity in a cell its box does not overlap.
        #[error("grid cell ({column}, {row}) holds stale entry for entity {entity}")]
        GridStale {
            /// The stale entity entry.
            entity: u32,
            /// Cell column.
            column: i32,
            /// Cell row.
            row: i32,
        },
        /// The ownership index and the owner back-references disagree.
        #[error("ownership of entity {owned} by entity {owner} is asymmetric")]
        OwnershipAsymmetric {
            /// Owner side of the broken link.
            owner: u32,
            /// Owned side of the broken link.
            owned: u32,
        },
        /// The transparency predicate answered differently for the two
        /// argument orders.
        #[error("transparency of entities {first} and {second} is asymmetric")]
        TransparencyAsymmetric {
            /// First entity of the pair.
            first: u32,
            /// Second entity of the pair.
            second: u32,
        },
    }

    /// Full-state records of every live entity, ascending by id. This is
    /// the broadcast and persistence form of the registry.
    #[must_use]
    pub fn dump(registry: &Registry) -> Vec<EntityState> {
        registry.entities.values().map(super::Entity::state).collect()
    }

    /// Full-state record of one entity, if live.
    #[must_use]
    pub fn entity_state(registry: &Registry, id: EntityId) -> Option<EntityState> {
        registry.entities.get(&id).map(super::Entity::state)
    }

    /// Identifiers of all live player entities, ascending.
    #[must_use]
    pub fn player_ids(registry: &Registry) -> Vec<EntityId> {
        let mut ids = registry.players.clone();
        ids.sort_unstable();
        ids
    }

    /// Verifies every registry invariant, for self-check mode and tests.
    ///
    /// Checks that the id map, type lists, grid index, and ownership index
    /// agree, and that the transparency predicate is symmetric over live
    /// pairs. Duplicates O(registry size) work per call, so production
    /// servers leave it disabled.
    pub fn check_consistency(registry: &Registry) -> Result<(), ConsistencyError> {
        let total = registry.entities.len();
        let players = registry.players.len();
        let others = registry.others.len();
        if total != players + others {
            return Err(ConsistencyError::SizeMismatch {
                total,
                players,
                others,
            });
        }

        for entity in registry.entities.values() {
            let listed = match entity.kind() {
                EntityKind::Player => registry.players.contains(&entity.id),
                _ => registry.others.contains(&entity.id),
            };
            if !listed {
                return Err(ConsistencyError::TypeListMismatch(entity.id.get()));
            }

            for cell in entity.position.bounding_box().cells() {
                let present = registry
                    .grid
                    .get(&cell)
                    .is_some_and(|bucket| bucket.contains(&entity.id));
                if !present {
                    return Err(ConsistencyError::GridMissing {
                        entity: entity.id.get(),
                        column: cell.column(),
                        row: cell.row(),
                    });
                }
            }

            if let Some(owner) = entity.owner {
                let linked = registry
                    .owned
                    .get(&owner)
                    .is_some_and(|list| list.contains(&entity.id));
                if !linked {
                    return Err(ConsistencyError::OwnershipAsymmetric {
                        owner: owner.get(),
                        owned: entity.id.get(),
                    });
                }
            }
        }

        for (cell, bucket) in &registry.grid {
            for id in bucket {
                let covered = registry.entities.get(id).is_some_and(|entity| {
                    entity.position.bounding_box().cells().contains(cell)
                });
                if !covered {
                    return Err(ConsistencyError::GridStale {
                        entity: id.get(),
                        column: cell.column(),
                        row: cell.row(),
                    });
                }
            }
        }

        for (owner, list) in &registry.owned {
            for owned in list {
                let backed = registry
                    .entities
                    .get(owned)
                    .is_some_and(|entity| entity.owner == Some(*owner));
                if !backed {
                    return Err(ConsistencyError::OwnershipAsymmetric {
                        owner: owner.get(),
                        owned: owned.get(),
                    });
                }
            }
        }

        for a in registry.entities.values() {
            for b in registry.entities.values() {
                if transparency::permits(a, b) != transparency::permits(b, a) {
                    return Err(ConsistencyError::TransparencyAsymmetric {
                        first: a.id.get(),
                        second: b.id.get(),
                    });
                }
            }
        }

        Ok(())
    }
}
