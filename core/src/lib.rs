#![deny(
    unsafe_code,
    missing_docs,
    dead_code,
    unused_results,
    non_snake_case,
    unreachable_pub
)]

//! Core contracts shared across the Blockfall engine.
//!
//! This crate defines the vocabulary that connects the authoritative world,
//! the server simulation, the client predictor, and the network adapters:
//! identifiers, fixed-point geometry, the closed set of entity kinds, the
//! loss-free [`EntityState`] record used on the wire and on disk, timestamped
//! [`Action`] deltas, and the [`Message`] surface exchanged between peers.

pub mod wire;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulation steps per second targeted by both server and client.
pub const TICK_RATE: u32 = 60;

/// Edge length of a grid cell, and of every entity's bounding box, measured
/// in sub-pixel units.
pub const CELL_WIDTH: i32 = 64;

/// Downward acceleration applied per tick to entities subject to gravity.
pub const GRAVITY: i32 = 1;

/// Number of ticks a locally originated action is scheduled ahead of the
/// currently shown tick, so prediction and authoritative execution target
/// the identical tick.
pub const ACTION_DELAY: u64 = 6;

/// Default cadence, in ticks, of the server's full-registry broadcast.
/// Zero disables the broadcast entirely.
pub const DEFAULT_BROADCAST_INTERVAL: u64 = 15;

/// Maximum number of ticks the predictor may outrun the last authoritative
/// snapshot before it freezes instead of speculating further.
pub const PREDICTION_HORIZON: u64 = 30;

/// Impact speed, in sub-pixels per tick, a player absorbs without damage.
pub const SAFE_IMPACT_SPEED: i32 = 12;

/// Unique identifier assigned to an entity for its whole lifetime.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityId(u32);

impl EntityId {
    /// Creates a new entity identifier with the provided numeric value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Retrieves the numeric representation of the identifier.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    /// Returns the identifier following this one in allocation order.
    #[must_use]
    pub const fn successor(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Index of a discrete simulation step.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Tick(u64);

impl Tick {
    /// First tick of a fresh simulation.
    pub const ZERO: Self = Self(0);

    /// Creates a tick index with the provided numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Retrieves the numeric representation of the tick index.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns the tick immediately after this one.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns this tick advanced by the provided number of steps.
    #[must_use]
    pub const fn advanced_by(&self, steps: u64) -> Self {
        Self(self.0.saturating_add(steps))
    }
}

/// Axis of movement inside the grid plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Movement along x.
    Horizontal,
    /// Movement along y. Positive y points downward.
    Vertical,
}

/// Entity position expressed in integer sub-pixel units.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    x: i32,
    y: i32,
}

impl Position {
    /// Creates a new sub-pixel position.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Horizontal coordinate in sub-pixels.
    #[must_use]
    pub const fn x(&self) -> i32 {
        self.x
    }

    /// Vertical coordinate in sub-pixels. Larger values are lower.
    #[must_use]
    pub const fn y(&self) -> i32 {
        self.y
    }

    /// Returns the position displaced along the provided axis.
    #[must_use]
    pub const fn displaced(&self, axis: Axis, delta: i32) -> Self {
        match axis {
            Axis::Horizontal => Self::new(self.x.saturating_add(delta), self.y),
            Axis::Vertical => Self::new(self.x, self.y.saturating_add(delta)),
        }
    }

    /// Reads the coordinate on the provided axis.
    #[must_use]
    pub const fn along(&self, axis: Axis) -> i32 {
        match axis {
            Axis::Horizontal => self.x,
            Axis::Vertical => self.y,
        }
    }

    /// Bounding box of an entity anchored at this position.
    #[must_use]
    pub const fn bounding_box(&self) -> BoundingBox {
        BoundingBox::anchored_at(*self)
    }
}

/// Entity velocity in sub-pixels per tick, clamped to one cell per axis so
/// that a single step can never tunnel through the grid.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Velocity {
    x: i32,
    y: i32,
}

impl Velocity {
    /// Velocity with both components at rest.
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Creates a velocity, clamping each component to ±[`CELL_WIDTH`].
    #[must_use]
    pub const fn clamped(x: i32, y: i32) -> Self {
        Self {
            x: clamp_component(x),
            y: clamp_component(y),
        }
    }

    /// Horizontal component in sub-pixels per tick.
    #[must_use]
    pub const fn x(&self) -> i32 {
        self.x
    }

    /// Vertical component in sub-pixels per tick.
    #[must_use]
    pub const fn y(&self) -> i32 {
        self.y
    }

    /// Reads the component on the provided axis.
    #[must_use]
    pub const fn along(&self, axis: Axis) -> i32 {
        match axis {
            Axis::Horizontal => self.x,
            Axis::Vertical => self.y,
        }
    }

    /// Returns this velocity with the component on the provided axis replaced.
    #[must_use]
    pub const fn with_component(&self, axis: Axis, value: i32) -> Self {
        match axis {
            Axis::Horizontal => Self::clamped(value, self.y),
            Axis::Vertical => Self::clamped(self.x, value),
        }
    }

    /// Reports whether both components are zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

const fn clamp_component(value: i32) -> i32 {
    if value > CELL_WIDTH {
        CELL_WIDTH
    } else if value < -CELL_WIDTH {
        -CELL_WIDTH
    } else {
        value
    }
}

/// Heading in whole degrees, normalized to `0..360`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Angle(u16);

impl Angle {
    /// Creates an angle from any degree value, normalizing modulo 360.
    #[must_use]
    pub const fn from_degrees(degrees: i32) -> Self {
        Self(degrees.rem_euclid(360) as u16)
    }

    /// Degrees in `0..360`.
    #[must_use]
    pub const fn degrees(&self) -> u16 {
        self.0
    }
}

/// Location of a single grid cell expressed as column and row indices.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CellCoord {
    column: i32,
    row: i32,
}

impl CellCoord {
    /// Creates a new grid cell coordinate.
    #[must_use]
    pub const fn new(column: i32, row: i32) -> Self {
        Self { column, row }
    }

    /// Zero-based column index of the cell.
    #[must_use]
    pub const fn column(&self) -> i32 {
        self.column
    }

    /// Zero-based row index of the cell.
    #[must_use]
    pub const fn row(&self) -> i32 {
        self.row
    }

    /// Cell containing the provided sub-pixel point.
    #[must_use]
    pub const fn containing(x: i32, y: i32) -> Self {
        Self {
            column: x.div_euclid(CELL_WIDTH),
            row: y.div_euclid(CELL_WIDTH),
        }
    }
}

/// Axis-aligned bounding box of one entity: a [`CELL_WIDTH`]-sided square
/// anchored at the entity's position. Depending on alignment it overlaps
/// one, two, or four grid cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundingBox {
    anchor: Position,
}

impl BoundingBox {
    /// Creates the box anchored at the provided position.
    #[must_use]
    pub const fn anchored_at(anchor: Position) -> Self {
        Self { anchor }
    }

    /// Left edge in sub-pixels (inclusive).
    #[must_use]
    pub const fn left(&self) -> i32 {
        self.anchor.x()
    }

    /// Top edge in sub-pixels (inclusive).
    #[must_use]
    pub const fn top(&self) -> i32 {
        self.anchor.y()
    }

    /// Right edge in sub-pixels (exclusive).
    #[must_use]
    pub const fn right(&self) -> i32 {
        self.anchor.x().saturating_add(CELL_WIDTH)
    }

    /// Bottom edge in sub-pixels (exclusive).
    #[must_use]
    pub const fn bottom(&self) -> i32 {
        self.anchor.y().saturating_add(CELL_WIDTH)
    }

    /// Reports whether the box covers the provided sub-pixel point.
    #[must_use]
    pub const fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left() && x < self.right() && y >= self.top() && y < self.bottom()
    }

    /// Reports whether this box and the other overlap.
    #[must_use]
    pub const fn intersects(&self, other: &BoundingBox) -> bool {
        self.left() < other.right()
            && other.left() < self.right()
            && self.top() < other.bottom()
            && other.top() < self.bottom()
    }

    /// Enumerates the grid cells this box overlaps, row-major.
    #[must_use]
    pub fn cells(&self) -> Vec<CellCoord> {
        let first_column = self.left().div_euclid(CELL_WIDTH);
        let last_column = (self.right() - 1).div_euclid(CELL_WIDTH);
        let first_row = self.top().div_euclid(CELL_WIDTH);
        let last_row = (self.bottom() - 1).div_euclid(CELL_WIDTH);

        let mut cells = Vec::with_capacity(4);
        for row in first_row..=last_row {
            for column in first_column..=last_column {
                cells.push(CellCoord::new(column, row));
            }
        }
        cells
    }
}

/// Discriminates the closed set of entity kinds.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EntityKind {
    /// A connected player's avatar.
    Player,
    /// A fired projectile, usually owned by its firer.
    Projectile,
    /// A destructible block subject to gravity.
    Block,
    /// Anchored, indestructible terrain.
    Obstacle,
}

/// Kind-specific gameplay payload carried by an entity.
///
/// The set of variants is closed: an unrecognized tag on the wire is a
/// parse error, never a dynamic lookup.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum PayloadState {
    /// A player's avatar with display name, health, and score.
    Player {
        /// Name presented by the client at login.
        name: String,
        /// Remaining health; the player is destroyed at zero.
        health: i32,
        /// Accumulated score. Mutated only by explicit score deltas.
        score: i32,
    },
    /// A projectile carrying the damage it deals on impact.
    Projectile {
        /// Damage applied to every obstruction when the projectile lands.
        damage: i32,
    },
    /// A destructible block.
    Block {
        /// Remaining durability; the block is destroyed at zero.
        durability: i32,
    },
    /// Anchored terrain with no mutable state.
    Obstacle,
}

impl PayloadState {
    /// Kind tag for this payload.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Player { .. } => EntityKind::Player,
            Self::Projectile { .. } => EntityKind::Projectile,
            Self::Block { .. } => EntityKind::Block,
            Self::Obstacle => EntityKind::Obstacle,
        }
    }
}

/// Complete, loss-free description of one entity.
///
/// The same record serves as wire state, persisted state, and the ordered
/// comparison tuple: equality and ordering of entities are defined by this
/// record, so they stay in lock-step with serialization by construction.
/// Re-applying the record to an entity twice yields identical state.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityState {
    /// Identifier of the described entity.
    pub id: EntityId,
    /// Position in sub-pixels.
    pub position: Position,
    /// Velocity in sub-pixels per tick.
    pub velocity: Velocity,
    /// Heading in degrees.
    pub angle: Angle,
    /// Whether the update pass considers the entity.
    pub moving: bool,
    /// Weak reference to the owning entity, if any.
    pub owner: Option<EntityId>,
    /// Kind payload.
    pub payload: PayloadState,
}

impl EntityState {
    /// Reports whether the record describes a player entity.
    #[must_use]
    pub const fn is_player(&self) -> bool {
        matches!(self.payload, PayloadState::Player { .. })
    }
}

/// Execution phase of an action kind relative to the physics pass.
///
/// Creations run after the pass on both server and client, so an entity
/// created at tick T receives its first physics update at T+1. This
/// asymmetry is a cross-implementation contract; client/server parity
/// depends on matching it exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionPhase {
    /// Applied before the physics pass of the target tick.
    PrePass,
    /// Applied after the physics pass of the target tick.
    PostPass,
}

/// State-changing operation applied at a specific tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Sets an entity's velocity and heading, waking it.
    Move {
        /// Entity to steer.
        entity: EntityId,
        /// New velocity, clamped on application.
        velocity: Velocity,
        /// New heading.
        angle: Angle,
    },
    /// Creates one entity from its full state record.
    AddEntity {
        /// State of the entity to create.
        state: EntityState,
    },
    /// Dooms the listed entities for removal.
    DeleteEntities {
        /// Identifiers to remove.
        ids: Vec<EntityId>,
    },
    /// Overwrites the full state of the listed entities.
    UpdateEntities {
        /// Replacement state records.
        states: Vec<EntityState>,
    },
    /// Overwrites a player's score.
    UpdateScore {
        /// Player whose score changes.
        entity: EntityId,
        /// New absolute score.
        score: i32,
    },
}

impl ActionKind {
    /// Phase in which this kind executes relative to the physics pass.
    #[must_use]
    pub const fn phase(&self) -> ActionPhase {
        match self {
            Self::AddEntity { .. } => ActionPhase::PostPass,
            Self::Move { .. }
            | Self::DeleteEntities { .. }
            | Self::UpdateEntities { .. }
            | Self::UpdateScore { .. } => ActionPhase::PrePass,
        }
    }
}

/// A tagged, timestamped delta record.
///
/// Actions originating from a client carry a future target tick; broadcasts
/// from the server carry the tick they describe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Tick at which the delta takes effect.
    pub at_tick: Tick,
    /// Operation to apply.
    pub kind: ActionKind,
}

/// Messages exchanged between server and client.
///
/// Key material, password hashes, and initialization vectors travel as
/// base64 strings; their interpretation belongs to the transport layer's
/// handshake, which is outside this crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Client opener: desired player name plus key material.
    Handshake {
        /// Display name requested by the player.
        player_name: String,
        /// Client key material, base64.
        key_material: String,
    },
    /// Server's public key material, base64.
    ServerPublicKey {
        /// Key material, base64.
        key: String,
    },
    /// Symmetrically encrypted credential presented by the client.
    Credential {
        /// Password hash, base64.
        password_hash: String,
        /// Initialization vector, base64.
        iv: String,
    },
    /// Tells a freshly authenticated client which entity it controls.
    YouAre {
        /// Identifier of the client's player entity.
        id: EntityId,
    },
    /// Describes the world a client has joined.
    World {
        /// Level name.
        name: String,
        /// Level identifier.
        id: u64,
        /// World width in cells.
        width: u32,
        /// World height in cells.
        height: u32,
        /// Highest entity identifier assigned so far.
        highest_id: EntityId,
    },
    /// Full registry dump superseding all local prediction.
    Registry {
        /// Every live entity's state, ordered by id.
        entities: Vec<EntityState>,
        /// Highest entity identifier assigned so far.
        highest_id: EntityId,
        /// Tick the dump describes.
        at_tick: Tick,
    },
    /// Player entities that joined.
    AddPlayers {
        /// States of the new players.
        states: Vec<EntityState>,
        /// Tick of the creation.
        at_tick: Tick,
    },
    /// Non-player entities that were created.
    AddNpcs {
        /// States of the new entities.
        states: Vec<EntityState>,
        /// Tick of the creation.
        at_tick: Tick,
    },
    /// Entities that were removed.
    DeleteEntities {
        /// Identifiers of the removed entities.
        ids: Vec<EntityId>,
        /// Tick of the removal.
        at_tick: Tick,
    },
    /// Entities whose full state was overwritten.
    UpdateEntities {
        /// Replacement state records.
        states: Vec<EntityState>,
        /// Tick of the update.
        at_tick: Tick,
    },
    /// A player's score changed.
    UpdateScore {
        /// Player whose score changed.
        entity: EntityId,
        /// New absolute score.
        score: i32,
        /// Tick of the change.
        at_tick: Tick,
    },
    /// Requests a velocity/heading change for an entity.
    Move {
        /// Entity to steer.
        entity: EntityId,
        /// Requested velocity.
        velocity: Velocity,
        /// Requested heading.
        angle: Angle,
        /// Target tick of the move.
        at_tick: Tick,
    },
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
    /// Asks the server to persist the level.
    Save,
}

/// Persisted description of a level.
///
/// Players are never persisted; only the non-player entity population is
/// recorded alongside the world dimensions and the id watermark.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelRecord {
    /// Level name.
    pub name: String,
    /// Level identifier.
    pub id: u64,
    /// World width in cells.
    pub width: u32,
    /// World height in cells.
    pub height: u32,
    /// Highest entity identifier assigned so far.
    pub highest_id: EntityId,
    /// Every non-player entity's state, ordered by id.
    pub entities: Vec<EntityState>,
}

/// Reasons entity creation may be rejected by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum SpawnError {
    /// The target cells hold a non-transparent occupant.
    #[error("target cells are obstructed")]
    Occupied,
    /// The entity's box extends beyond the world bounds.
    #[error("position lies outside the world bounds")]
    OutOfBounds,
    /// An entity with the same identifier is already registered.
    #[error("entity id is already registered")]
    DuplicateId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::de::DeserializeOwned;

    fn assert_round_trip<T>(value: &T)
    where
        T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug,
    {
        let bytes = bincode::serialize(value).expect("serialize");
        let restored: T = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(&restored, value);

        let json = serde_json::to_vec(value).expect("serialize json");
        let restored: T = serde_json::from_slice(&json).expect("deserialize json");
        assert_eq!(&restored, value);
    }

    fn sample_state() -> EntityState {
        EntityState {
            id: EntityId::new(9),
            position: Position::new(400, 800),
            velocity: Velocity::clamped(-3, 7),
            angle: Angle::from_degrees(270),
            moving: true,
            owner: Some(EntityId::new(2)),
            payload: PayloadState::Projectile { damage: 25 },
        }
    }

    #[test]
    fn entity_state_round_trips() {
        assert_round_trip(&sample_state());
    }

    #[test]
    fn action_round_trips() {
        assert_round_trip(&Action {
            at_tick: Tick::new(42),
            kind: ActionKind::AddEntity {
                state: sample_state(),
            },
        });
    }

    #[test]
    fn registry_message_round_trips() {
        assert_round_trip(&Message::Registry {
            entities: vec![sample_state()],
            highest_id: EntityId::new(9),
            at_tick: Tick::new(100),
        });
    }

    #[test]
    fn unknown_payload_tag_is_a_parse_error() {
        let result: Result<PayloadState, _> =
            serde_json::from_str(r#"{"Wizard":{"mana":3}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn velocity_clamps_each_axis_to_one_cell() {
        let velocity = Velocity::clamped(CELL_WIDTH * 3, -CELL_WIDTH - 1);
        assert_eq!(velocity.x(), CELL_WIDTH);
        assert_eq!(velocity.y(), -CELL_WIDTH);
    }

    #[test]
    fn angle_normalizes_modulo_360() {
        assert_eq!(Angle::from_degrees(360).degrees(), 0);
        assert_eq!(Angle::from_degrees(-90).degrees(), 270);
        assert_eq!(Angle::from_degrees(725).degrees(), 5);
    }

    #[test]
    fn aligned_box_overlaps_one_cell() {
        let cells = Position::new(CELL_WIDTH * 2, CELL_WIDTH * 3)
            .bounding_box()
            .cells();
        assert_eq!(cells, vec![CellCoord::new(2, 3)]);
    }

    #[test]
    fn axis_misaligned_box_overlaps_two_cells() {
        let cells = Position::new(CELL_WIDTH * 2 + 1, CELL_WIDTH * 3)
            .bounding_box()
            .cells();
        assert_eq!(cells, vec![CellCoord::new(2, 3), CellCoord::new(3, 3)]);
    }

    #[test]
    fn fully_misaligned_box_overlaps_four_cells() {
        let cells = Position::new(CELL_WIDTH + 5, CELL_WIDTH + 5)
            .bounding_box()
            .cells();
        assert_eq!(cells.len(), 4);
    }

    #[test]
    fn creation_is_the_only_post_pass_kind() {
        let create = ActionKind::AddEntity {
            state: sample_state(),
        };
        assert_eq!(create.phase(), ActionPhase::PostPass);

        let mv = ActionKind::Move {
            entity: EntityId::new(1),
            velocity: Velocity::ZERO,
            angle: Angle::from_degrees(0),
        };
        assert_eq!(mv.phase(), ActionPhase::PrePass);
    }

    #[test]
    fn entity_ordering_follows_identifier_first() {
        let mut low = sample_state();
        low.id = EntityId::new(1);
        let mut high = sample_state();
        high.id = EntityId::new(2);
        assert!(low < high);
    }
}
